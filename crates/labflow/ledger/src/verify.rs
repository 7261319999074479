//! Offline chain verification

use crate::{AuditEvent, StreamId};
use labflow_types::Digest;
use serde::{Deserialize, Serialize};

/// Why a chain failed verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum ChainFault {
    /// Stored hash does not match the recomputed one
    HashMismatch,
    /// `prev_hash` does not match the preceding event
    BrokenLink,
    /// Sequence numbers are not 1, 2, 3, ...
    SequenceGap { expected: u64, found: u64 },
    /// The event belongs to a different stream
    ForeignStream { found: StreamId },
}

impl std::fmt::Display for ChainFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainFault::HashMismatch => write!(f, "hash mismatch"),
            ChainFault::BrokenLink => write!(f, "broken link to previous event"),
            ChainFault::SequenceGap { expected, found } => {
                write!(f, "expected sequence {}, found {}", expected, found)
            }
            ChainFault::ForeignStream { found } => write!(f, "event from stream {}", found),
        }
    }
}

/// Outcome of verifying one stream's events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub total_events: usize,
    /// Events verified before the first fault
    pub verified_events: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_invalid_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<ChainFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<Digest>,
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.fault.is_none()
    }
}

/// Recompute the chain over `events`, which must be one complete stream in
/// stored order. An empty list is a valid (empty) chain.
pub fn verify_chain(events: &[AuditEvent]) -> ChainReport {
    let mut report = ChainReport {
        total_events: events.len(),
        verified_events: 0,
        first_invalid_seq: None,
        fault: None,
        head: None,
    };

    let stream = match events.first() {
        Some(first) => &first.stream,
        None => return report,
    };

    let mut prev = Digest::ZERO;
    for (index, event) in events.iter().enumerate() {
        let expected_seq = index as u64 + 1;
        let fault = if &event.stream != stream {
            Some(ChainFault::ForeignStream {
                found: event.stream.clone(),
            })
        } else if event.seq != expected_seq {
            Some(ChainFault::SequenceGap {
                expected: expected_seq,
                found: event.seq,
            })
        } else if event.prev_hash != prev {
            Some(ChainFault::BrokenLink)
        } else if !event.verify_integrity() {
            Some(ChainFault::HashMismatch)
        } else {
            None
        };

        if let Some(fault) = fault {
            report.first_invalid_seq = Some(event.seq);
            report.fault = Some(fault);
            return report;
        }

        prev = event.hash;
        report.verified_events = index + 1;
    }

    report.head = Some(prev);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn chain(len: usize) -> Vec<AuditEvent> {
        let stream = StreamId::new("run:r1");
        let mut prev = Digest::ZERO;
        (1..=len as u64)
            .map(|seq| {
                let event =
                    AuditEvent::chained(seq, stream.clone(), "step", json!({ "seq": seq }), prev);
                prev = event.hash;
                event
            })
            .collect()
    }

    #[test]
    fn intact_chain_verifies() {
        let events = chain(5);
        let report = verify_chain(&events);
        assert!(report.is_valid());
        assert_eq!(report.verified_events, 5);
        assert_eq!(report.head, Some(events[4].hash));
    }

    #[test]
    fn empty_chain_is_valid() {
        assert!(verify_chain(&[]).is_valid());
    }

    #[test]
    fn deletion_is_a_gap() {
        let mut events = chain(4);
        events.remove(1);
        let report = verify_chain(&events);
        assert_eq!(
            report.fault,
            Some(ChainFault::SequenceGap {
                expected: 2,
                found: 3
            })
        );
        assert_eq!(report.first_invalid_seq, Some(3));
    }

    #[test]
    fn rehashed_edit_breaks_the_next_link() {
        let mut events = chain(3);
        events[1].payload = json!({ "seq": 99 });
        events[1].hash = events[1].compute_hash();
        let report = verify_chain(&events);
        assert_eq!(report.fault, Some(ChainFault::BrokenLink));
        assert_eq!(report.first_invalid_seq, Some(3));
    }

    #[test]
    fn foreign_event_is_rejected() {
        let mut events = chain(2);
        events[1].stream = StreamId::new("run:other");
        let report = verify_chain(&events);
        assert!(matches!(report.fault, Some(ChainFault::ForeignStream { .. })));
    }

    proptest! {
        #[test]
        fn any_payload_edit_is_detected(len in 1usize..12, pick in any::<prop::sample::Index>(), value in any::<i64>()) {
            let mut events = chain(len);
            let target = pick.index(len);
            prop_assume!(events[target].payload != json!({ "seq": value }));
            events[target].payload = json!({ "seq": value });
            let report = verify_chain(&events);
            prop_assert!(!report.is_valid());
            prop_assert_eq!(report.first_invalid_seq, Some(target as u64 + 1));
        }

        #[test]
        fn any_reorder_is_detected(len in 2usize..12, a in any::<prop::sample::Index>(), b in any::<prop::sample::Index>()) {
            let mut events = chain(len);
            let (i, j) = (a.index(len), b.index(len));
            prop_assume!(i != j);
            events.swap(i, j);
            prop_assert!(!verify_chain(&events).is_valid());
        }
    }
}

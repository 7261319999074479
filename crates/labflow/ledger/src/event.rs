//! Audit events and stream identifiers

use chrono::{DateTime, SecondsFormat, Utc};
use labflow_types::{CapaId, Digest, RunId};
use serde::{Deserialize, Serialize};

const HASH_DOMAIN: &[u8] = b"labflow-audit-v1";

/// Identifies one hash chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn run(run_id: &RunId) -> Self {
        Self(format!("run:{}", run_id))
    }

    pub fn capa(capa_id: &CapaId) -> Self {
        Self(format!("capa:{}", capa_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One immutable entry in an audit stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// 1-based, gapless within the stream
    pub seq: u64,
    pub stream: StreamId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
    pub prev_hash: Digest,
    pub hash: Digest,
}

impl AuditEvent {
    /// Build an event chained onto `prev_hash`.
    pub fn chained(
        seq: u64,
        stream: StreamId,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        prev_hash: Digest,
    ) -> Self {
        let mut event = Self {
            seq,
            stream,
            event_type: event_type.into(),
            payload,
            recorded_at: Utc::now(),
            prev_hash,
            hash: Digest::ZERO,
        };
        event.hash = event.compute_hash();
        event
    }

    /// Recompute this event's hash from its contents.
    ///
    /// Variable-length fields are length-prefixed so that no two distinct
    /// events share an encoding. `serde_json::Value` objects are key-ordered,
    /// which makes the payload encoding canonical.
    pub fn compute_hash(&self) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(HASH_DOMAIN);
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(&self.seq.to_be_bytes());
        update_framed(&mut hasher, self.stream.as_str().as_bytes());
        update_framed(&mut hasher, self.event_type.as_bytes());
        update_framed(&mut hasher, self.payload.to_string().as_bytes());
        update_framed(
            &mut hasher,
            self.recorded_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        Digest(*hasher.finalize().as_bytes())
    }

    /// Whether the stored hash matches the contents.
    pub fn verify_integrity(&self) -> bool {
        self.compute_hash() == self.hash
    }

    /// Decode the payload into a typed record.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

fn update_framed(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_ids_are_prefixed() {
        assert_eq!(StreamId::run(&RunId::new("r1")).as_str(), "run:r1");
        assert_eq!(StreamId::capa(&CapaId::new("c1")).as_str(), "capa:c1");
    }

    #[test]
    fn hash_covers_every_field() {
        let event = AuditEvent::chained(
            1,
            StreamId::new("run:r1"),
            "run_created",
            json!({"sop": "assay@v1"}),
            Digest::ZERO,
        );
        assert!(event.verify_integrity());

        let mut payload = event.clone();
        payload.payload = json!({"sop": "assay@v2"});
        assert!(!payload.verify_integrity());

        let mut seq = event.clone();
        seq.seq = 2;
        assert!(!seq.verify_integrity());

        let mut kind = event.clone();
        kind.event_type = "run_started".into();
        assert!(!kind.verify_integrity());

        let mut time = event.clone();
        time.recorded_at += chrono::Duration::milliseconds(1);
        assert!(!time.verify_integrity());

        let mut prev = event;
        prev.prev_hash = Digest::of(b"other");
        assert!(!prev.verify_integrity());
    }

    #[test]
    fn survives_json_roundtrip() {
        let event = AuditEvent::chained(
            3,
            StreamId::new("capa:c9"),
            "capa_closed",
            json!({"notes": "recalibrated", "by": "qa"}),
            Digest::of(b"prev"),
        );
        let line = serde_json::to_string(&event).unwrap();
        let back: AuditEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back, event);
        assert!(back.verify_integrity());
    }
}

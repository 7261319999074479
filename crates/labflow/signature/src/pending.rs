//! Pending approvals and transition intents

use chrono::{DateTime, Utc};
use labflow_types::{
    Digest, PendingApprovalId, RunId, Signature, SignatureMeaning, SignatureTarget,
    TransitionAction,
};
use serde::{Deserialize, Serialize};

/// A suspension point waiting for one signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: PendingApprovalId,
    pub target: SignatureTarget,
    pub meaning: SignatureMeaning,
    /// Content the signature will bind to
    pub content_hash: Digest,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingApproval {
    /// The bytes a signer signs to answer this request.
    pub fn challenge(&self) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"labflow-approval-v1");
        frame(&mut hasher, self.id.as_str().as_bytes());
        frame(&mut hasher, target_key(&self.target).as_bytes());
        frame(&mut hasher, self.meaning.as_str().as_bytes());
        hasher.update(self.content_hash.as_bytes());
        Digest(*hasher.finalize().as_bytes())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A run transition that must be authorized by a signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionIntent {
    pub run_id: RunId,
    pub action: TransitionAction,
    /// Hash of the run state the signer is looking at
    pub content_hash: Digest,
}

impl TransitionIntent {
    pub fn new(run_id: RunId, action: TransitionAction, content_hash: Digest) -> Self {
        Self {
            run_id,
            action,
            content_hash,
        }
    }

    pub fn target(&self) -> SignatureTarget {
        SignatureTarget::Transition {
            run_id: self.run_id.clone(),
            action: self.action,
        }
    }

    pub fn challenge(&self) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"labflow-transition-v1");
        frame(&mut hasher, target_key(&self.target()).as_bytes());
        frame(&mut hasher, self.action.required_meaning().as_str().as_bytes());
        hasher.update(self.content_hash.as_bytes());
        Digest(*hasher.finalize().as_bytes())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Signed { signature: Signature },
    Expired,
    Withdrawn,
}

impl ApprovalStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

fn target_key(target: &SignatureTarget) -> String {
    match target {
        SignatureTarget::Step { run_id, step_id } => format!("step:{}:{}", run_id, step_id),
        SignatureTarget::Transition { run_id, action } => {
            format!("transition:{}:{:?}", run_id, action)
        }
    }
}

fn frame(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use labflow_types::StepId;

    fn pending(meaning: SignatureMeaning) -> PendingApproval {
        let now = Utc::now();
        PendingApproval {
            id: PendingApprovalId::new("p1"),
            target: SignatureTarget::Step {
                run_id: RunId::new("r1"),
                step_id: StepId::new("s2"),
            },
            meaning,
            content_hash: Digest::of(b"record"),
            requested_at: now,
            expires_at: now + chrono::Duration::minutes(5),
        }
    }

    #[test]
    fn challenge_binds_meaning_and_content() {
        let base = pending(SignatureMeaning::Approved);
        let other_meaning = pending(SignatureMeaning::Reviewed);
        let mut other_content = base.clone();
        other_content.content_hash = Digest::of(b"changed");

        assert_eq!(base.challenge(), base.clone().challenge());
        assert_ne!(base.challenge(), other_meaning.challenge());
        assert_ne!(base.challenge(), other_content.challenge());
    }

    #[test]
    fn transition_challenges_differ_by_action() {
        let abort = TransitionIntent::new(RunId::new("r"), TransitionAction::Abort, Digest::ZERO);
        let reject = TransitionIntent::new(RunId::new("r"), TransitionAction::Reject, Digest::ZERO);
        assert_ne!(abort.challenge(), reject.challenge());
    }

    #[test]
    fn expiry_is_inclusive() {
        let approval = pending(SignatureMeaning::Approved);
        assert!(!approval.is_expired_at(approval.requested_at));
        assert!(approval.is_expired_at(approval.expires_at));
    }
}

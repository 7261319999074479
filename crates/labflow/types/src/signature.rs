//! Electronic signatures and their declared meaning

use crate::{Digest, OperatorId, RunId, SignatureId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared purpose of a signature, distinct from authentication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMeaning {
    Performed,
    Reviewed,
    Approved,
    Verified,
    Aborted,
    Rejected,
    Override,
}

impl SignatureMeaning {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureMeaning::Performed => "performed",
            SignatureMeaning::Reviewed => "reviewed",
            SignatureMeaning::Approved => "approved",
            SignatureMeaning::Verified => "verified",
            SignatureMeaning::Aborted => "aborted",
            SignatureMeaning::Rejected => "rejected",
            SignatureMeaning::Override => "override",
        }
    }
}

impl std::fmt::Display for SignatureMeaning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run transitions that need a signature of their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionAction {
    Abort,
    Reject,
    Override,
}

impl TransitionAction {
    /// The meaning a signature must declare to authorize this transition.
    pub fn required_meaning(&self) -> SignatureMeaning {
        match self {
            TransitionAction::Abort => SignatureMeaning::Aborted,
            TransitionAction::Reject => SignatureMeaning::Rejected,
            TransitionAction::Override => SignatureMeaning::Override,
        }
    }
}

/// What a signature authorizes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignatureTarget {
    Step { run_id: RunId, step_id: StepId },
    Transition { run_id: RunId, action: TransitionAction },
}

impl SignatureTarget {
    pub fn run_id(&self) -> &RunId {
        match self {
            SignatureTarget::Step { run_id, .. } => run_id,
            SignatureTarget::Transition { run_id, .. } => run_id,
        }
    }

    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            SignatureTarget::Step { step_id, .. } => Some(step_id),
            SignatureTarget::Transition { .. } => None,
        }
    }
}

/// An immutable electronic signature.
///
/// Bound to exactly one target through `content_hash`; the signature is
/// only valid while the target's current content hashes to that value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub id: SignatureId,
    pub signer: OperatorId,
    pub meaning: SignatureMeaning,
    pub signed_at: DateTime<Utc>,
    pub content_hash: Digest,
    pub target: SignatureTarget,
}

impl Signature {
    /// Whether this signature still binds the given content.
    pub fn binds(&self, content_hash: &Digest) -> bool {
        &self.content_hash == content_hash
    }
}

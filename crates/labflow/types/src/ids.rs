//! Identifier newtypes
//!
//! All identifiers are opaque strings on the wire. Ids minted by the
//! engine (runs, records, approvals, CAPAs) are UUID v4; ids supplied by
//! callers (steps, operators, instruments, control levels) are kept verbatim.

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

macro_rules! generated_id {
    ($name:ident) => {
        impl $name {
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn short(&self) -> &str {
                &self.0[..8.min(self.0.len())]
            }
        }
    };
}

string_id!(
    /// Unique identifier for a run instance
    RunId
);
string_id!(
    /// Step identifier, unique within one SOP definition
    StepId
);
string_id!(
    /// Identifier of a recorded step execution
    StepRecordId
);
string_id!(
    /// Operator / signer identity as issued by the identity provider
    OperatorId
);
string_id!(
    /// Instrument identifier carried in provenance tags
    InstrumentId
);
string_id!(
    /// Control material level (e.g. "low", "high")
    ControlLevelId
);
string_id!(
    /// Pending approval (signature request) token
    PendingApprovalId
);
string_id!(
    /// Recorded signature identifier
    SignatureId
);
string_id!(
    /// CAPA / deviation record identifier
    CapaId
);
string_id!(
    /// Deterministic QC violation identifier (content digest)
    ViolationId
);
string_id!(
    /// Authorization role held by an actor
    Role
);

generated_id!(RunId);
generated_id!(StepRecordId);
generated_id!(PendingApprovalId);
generated_id!(SignatureId);
generated_id!(CapaId);

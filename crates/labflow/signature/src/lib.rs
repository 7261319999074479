//! Signature gate.
//!
//! A step or transition that needs an electronic signature first gets a
//! [`PendingApproval`]: a suspension point bound to the content hash of
//! what is being signed. A submission only turns into a [`Signature`] when
//! the declared meaning matches, the identity provider accepts the
//! credential, and the content is still the content that was requested.
//!
//! [`Signature`]: labflow_types::Signature

#![deny(unsafe_code)]

pub mod error;
pub mod gate;
pub mod identity;
pub mod mocks;
pub mod pending;

pub use error::{SignatureError, SignatureResult};
pub use gate::{GateConfig, SignatureGate, SignedTransition};
pub use identity::{
    IdentityError, IdentityProvider, KeyringIdentityProvider, SignerCredential, VerifiedIdentity,
};
pub use mocks::TestSigner;
pub use pending::{ApprovalStatus, PendingApproval, TransitionIntent};

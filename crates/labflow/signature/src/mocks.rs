//! Deterministic signers for tests and the demo scenario.

use crate::{KeyringIdentityProvider, PendingApproval, SignerCredential, TransitionIntent};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use labflow_types::{Digest, OperatorId, SignatureMeaning};

/// An operator with an ed25519 key derived from their name.
#[derive(Clone)]
pub struct TestSigner {
    operator: OperatorId,
    key: SigningKey,
    roles: Vec<String>,
}

impl TestSigner {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let seed = blake3::derive_key("labflow test signer", name.as_bytes());
        Self {
            operator: OperatorId::new(name),
            key: SigningKey::from_bytes(&seed),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn operator(&self) -> &OperatorId {
        &self.operator
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Add this signer to a keyring with its roles.
    pub fn register(&self, keyring: &KeyringIdentityProvider) {
        keyring.register(self.operator.clone(), self.verifying_key(), self.roles.clone());
    }

    pub fn sign_challenge(&self, meaning: SignatureMeaning, challenge: &Digest) -> SignerCredential {
        SignerCredential {
            signer: self.operator.clone(),
            meaning,
            proof: self.key.sign(challenge.as_bytes()).to_bytes().to_vec(),
        }
    }

    /// Answer a pending approval with its required meaning.
    pub fn approve(&self, pending: &PendingApproval) -> SignerCredential {
        self.sign_challenge(pending.meaning, &pending.challenge())
    }

    /// Answer a pending approval declaring `meaning`, whatever was asked for.
    pub fn approve_as(&self, pending: &PendingApproval, meaning: SignatureMeaning) -> SignerCredential {
        self.sign_challenge(meaning, &pending.challenge())
    }

    pub fn authorize(&self, intent: &TransitionIntent) -> SignerCredential {
        self.sign_challenge(intent.action.required_meaning(), &intent.challenge())
    }
}

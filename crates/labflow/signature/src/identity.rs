//! Identity provider boundary.
//!
//! Credential issuance lives outside Labflow. The gate only asks an
//! [`IdentityProvider`] whether a proof over a challenge was produced by the
//! claimed signer, and which roles that signer holds.

use async_trait::async_trait;
use ed25519_dalek::{Signature as Ed25519Signature, VerifyingKey};
use labflow_types::{Digest, OperatorId, Role, SignatureMeaning};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// What a signer hands in with a submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerCredential {
    pub signer: OperatorId,
    /// The meaning the signer declares
    pub meaning: SignatureMeaning,
    /// Detached proof over the request challenge, hex encoded on the wire
    #[serde(with = "hex_bytes")]
    pub proof: Vec<u8>,
}

/// A signer the identity provider has accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub operator: OperatorId,
    pub roles: BTreeSet<Role>,
}

impl VerifiedIdentity {
    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("unknown signer {0}")]
    UnknownSigner(OperatorId),

    #[error("signer {0} is revoked")]
    Revoked(OperatorId),

    #[error("proof rejected: {0}")]
    BadProof(String),

    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Check that `credential.proof` is the claimed signer's proof over
    /// `challenge`.
    async fn verify(
        &self,
        credential: &SignerCredential,
        challenge: &Digest,
    ) -> Result<VerifiedIdentity, IdentityError>;
}

struct KeyringEntry {
    key: VerifyingKey,
    roles: BTreeSet<Role>,
    revoked: bool,
}

/// Ed25519 keyring: one verifying key and a role set per operator.
#[derive(Default)]
pub struct KeyringIdentityProvider {
    entries: RwLock<HashMap<OperatorId, KeyringEntry>>,
}

impl KeyringIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I, R>(&self, operator: OperatorId, key: VerifyingKey, roles: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        let roles = roles.into_iter().map(|r| Role::new(r)).collect();
        self.entries.write().insert(
            operator,
            KeyringEntry {
                key,
                roles,
                revoked: false,
            },
        );
    }

    pub fn revoke(&self, operator: &OperatorId) -> bool {
        match self.entries.write().get_mut(operator) {
            Some(entry) => {
                entry.revoked = true;
                true
            }
            None => false,
        }
    }

    pub fn roles(&self, operator: &OperatorId) -> Option<BTreeSet<Role>> {
        self.entries.read().get(operator).map(|e| e.roles.clone())
    }
}

#[async_trait]
impl IdentityProvider for KeyringIdentityProvider {
    async fn verify(
        &self,
        credential: &SignerCredential,
        challenge: &Digest,
    ) -> Result<VerifiedIdentity, IdentityError> {
        let (key, roles) = {
            let entries = self.entries.read();
            let entry = entries
                .get(&credential.signer)
                .ok_or_else(|| IdentityError::UnknownSigner(credential.signer.clone()))?;
            if entry.revoked {
                return Err(IdentityError::Revoked(credential.signer.clone()));
            }
            (entry.key, entry.roles.clone())
        };

        let bytes: [u8; 64] = credential
            .proof
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::BadProof(format!("expected 64 bytes, got {}", credential.proof.len())))?;
        let signature = Ed25519Signature::from_bytes(&bytes);
        key.verify_strict(challenge.as_bytes(), &signature)
            .map_err(|e| IdentityError::BadProof(e.to_string()))?;

        Ok(VerifiedIdentity {
            operator: credential.signer.clone(),
            roles,
        })
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestSigner;

    #[tokio::test]
    async fn keyring_accepts_registered_signer() {
        let keyring = KeyringIdentityProvider::new();
        let alice = TestSigner::new("alice").with_role("analyst");
        alice.register(&keyring);

        let challenge = Digest::of(b"challenge");
        let credential = alice.sign_challenge(SignatureMeaning::Performed, &challenge);
        let identity = keyring.verify(&credential, &challenge).await.unwrap();
        assert_eq!(identity.operator, OperatorId::new("alice"));
        assert!(identity.has_role(&Role::new("analyst")));
    }

    #[tokio::test]
    async fn proof_over_other_challenge_is_rejected() {
        let keyring = KeyringIdentityProvider::new();
        let alice = TestSigner::new("alice");
        alice.register(&keyring);

        let credential = alice.sign_challenge(SignatureMeaning::Performed, &Digest::of(b"a"));
        let err = keyring.verify(&credential, &Digest::of(b"b")).await.unwrap_err();
        assert!(matches!(err, IdentityError::BadProof(_)));
    }

    #[tokio::test]
    async fn impersonation_and_revocation_fail() {
        let keyring = KeyringIdentityProvider::new();
        let alice = TestSigner::new("alice");
        let mallory = TestSigner::new("mallory");
        alice.register(&keyring);

        let challenge = Digest::of(b"c");
        let mut forged = mallory.sign_challenge(SignatureMeaning::Approved, &challenge);
        forged.signer = OperatorId::new("alice");
        assert!(keyring.verify(&forged, &challenge).await.is_err());

        let unknown = mallory.sign_challenge(SignatureMeaning::Approved, &challenge);
        assert!(matches!(
            keyring.verify(&unknown, &challenge).await,
            Err(IdentityError::UnknownSigner(_))
        ));

        keyring.revoke(&OperatorId::new("alice"));
        let credential = alice.sign_challenge(SignatureMeaning::Approved, &challenge);
        assert!(matches!(
            keyring.verify(&credential, &challenge).await,
            Err(IdentityError::Revoked(_))
        ));
    }

    #[test]
    fn credential_proof_is_hex_on_the_wire() {
        let credential = TestSigner::new("bob").sign_challenge(SignatureMeaning::Reviewed, &Digest::ZERO);
        let json = serde_json::to_value(&credential).unwrap();
        assert_eq!(json["proof"].as_str().unwrap().len(), 128);
        let back: SignerCredential = serde_json::from_value(json).unwrap();
        assert_eq!(back, credential);
    }
}

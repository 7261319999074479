//! The signature gate

use crate::identity::{IdentityProvider, SignerCredential};
use crate::pending::{ApprovalStatus, PendingApproval, TransitionIntent};
use crate::{SignatureError, SignatureResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use labflow_ledger::{AuditLedger, StreamId};
use labflow_types::{
    Digest, PendingApprovalId, Role, RunId, Signature, SignatureId, SignatureMeaning,
    SignatureTarget,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct GateConfig {
    /// How long a signature request stays open
    pub approval_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            approval_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A transition signature together with the signer's roles.
#[derive(Clone, Debug)]
pub struct SignedTransition {
    pub signature: Signature,
    pub roles: BTreeSet<Role>,
}

struct ApprovalEntry {
    pending: PendingApproval,
    status: Mutex<ApprovalStatus>,
    resolved: Notify,
}

/// Issues pending approvals and turns valid submissions into signatures.
///
/// Requests and recorded signatures are appended to the target run's audit
/// stream before they take effect. Rejected submissions are audited on a
/// best-effort basis and never retried.
pub struct SignatureGate {
    ledger: Arc<AuditLedger>,
    identity: Arc<dyn IdentityProvider>,
    config: GateConfig,
    approvals: DashMap<PendingApprovalId, Arc<ApprovalEntry>>,
}

impl SignatureGate {
    pub fn new(
        ledger: Arc<AuditLedger>,
        identity: Arc<dyn IdentityProvider>,
        config: GateConfig,
    ) -> Self {
        Self {
            ledger,
            identity,
            config,
            approvals: DashMap::new(),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    fn entry(&self, id: &PendingApprovalId) -> SignatureResult<Arc<ApprovalEntry>> {
        self.approvals
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SignatureError::PendingApprovalNotFound(id.clone()))
    }

    /// Open a suspension point for one signature over `content_hash`.
    ///
    /// Returns immediately; the wait for a human happens elsewhere.
    pub async fn request_signature(
        &self,
        target: SignatureTarget,
        meaning: SignatureMeaning,
        content_hash: Digest,
    ) -> SignatureResult<PendingApproval> {
        let requested_at = Utc::now();
        let timeout = chrono::Duration::from_std(self.config.approval_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let pending = PendingApproval {
            id: PendingApprovalId::generate(),
            target,
            meaning,
            content_hash,
            requested_at,
            expires_at: requested_at + timeout,
        };

        self.ledger
            .append(
                &StreamId::run(pending.target.run_id()),
                "signature_requested",
                serde_json::to_value(&pending)?,
            )
            .await?;

        self.approvals.insert(
            pending.id.clone(),
            Arc::new(ApprovalEntry {
                pending: pending.clone(),
                status: Mutex::new(ApprovalStatus::Pending),
                resolved: Notify::new(),
            }),
        );

        info!(
            pending = %pending.id,
            run_id = %pending.target.run_id(),
            meaning = %meaning,
            expires_at = %pending.expires_at,
            "Signature requested"
        );
        Ok(pending)
    }

    /// Validate a submission against its pending approval.
    ///
    /// `current_content_hash` is the hash of the target as it is now; if it
    /// differs from the hash captured at request time the submission fails.
    pub async fn submit(
        &self,
        pending_id: &PendingApprovalId,
        credential: &SignerCredential,
        current_content_hash: &Digest,
    ) -> SignatureResult<Signature> {
        let entry = self.entry(pending_id)?;
        let pending = &entry.pending;
        let mut status = entry.status.lock().await;

        match &*status {
            ApprovalStatus::Pending => {}
            ApprovalStatus::Signed { .. } => {
                return Err(SignatureError::AlreadySigned(pending_id.clone()))
            }
            ApprovalStatus::Withdrawn => {
                return Err(SignatureError::ApprovalWithdrawn(pending_id.clone()))
            }
            ApprovalStatus::Expired => {
                return Err(SignatureError::ApprovalTimeout {
                    pending: pending_id.clone(),
                    expired_at: pending.expires_at,
                })
            }
        }

        if pending.is_expired_at(Utc::now()) {
            *status = ApprovalStatus::Expired;
            entry.resolved.notify_waiters();
            return Err(SignatureError::ApprovalTimeout {
                pending: pending_id.clone(),
                expired_at: pending.expires_at,
            });
        }

        if let Err(err) = self
            .check_submission(pending, credential, current_content_hash)
            .await
        {
            self.audit_rejection(&pending.target, credential, &err).await;
            return Err(err);
        }

        let signature = Signature {
            id: SignatureId::generate(),
            signer: credential.signer.clone(),
            meaning: credential.meaning,
            signed_at: Utc::now(),
            content_hash: pending.content_hash,
            target: pending.target.clone(),
        };

        self.ledger
            .append(
                &StreamId::run(pending.target.run_id()),
                "signature_recorded",
                json!({ "pending": pending.id, "signature": signature }),
            )
            .await?;

        *status = ApprovalStatus::Signed {
            signature: signature.clone(),
        };
        entry.resolved.notify_waiters();

        info!(
            pending = %pending_id,
            signer = %signature.signer,
            meaning = %signature.meaning,
            content = %signature.content_hash.short(),
            "Signature recorded"
        );
        Ok(signature)
    }

    async fn check_submission(
        &self,
        pending: &PendingApproval,
        credential: &SignerCredential,
        current_content_hash: &Digest,
    ) -> SignatureResult<()> {
        if credential.meaning != pending.meaning {
            return Err(SignatureError::SignatureMeaningMismatch {
                expected: pending.meaning,
                got: credential.meaning,
            });
        }
        self.identity
            .verify(credential, &pending.challenge())
            .await
            .map_err(|e| SignatureError::InvalidCredential {
                signer: credential.signer.clone(),
                reason: e.to_string(),
            })?;
        if current_content_hash != &pending.content_hash {
            return Err(SignatureError::ContentChangedSinceRequest {
                pending: pending.id.clone(),
            });
        }
        Ok(())
    }

    /// Authorize an abort, reject or override transition.
    ///
    /// Nothing is audited here; the caller records the returned signature in
    /// the transition's own audit event.
    pub async fn sign_transition(
        &self,
        intent: &TransitionIntent,
        credential: &SignerCredential,
    ) -> SignatureResult<SignedTransition> {
        let expected = intent.action.required_meaning();
        if credential.meaning != expected {
            let err = SignatureError::SignatureMeaningMismatch {
                expected,
                got: credential.meaning,
            };
            warn!(run_id = %intent.run_id, signer = %credential.signer, error = %err, "Transition signature rejected");
            return Err(err);
        }

        let identity = match self.identity.verify(credential, &intent.challenge()).await {
            Ok(identity) => identity,
            Err(e) => {
                let err = SignatureError::InvalidCredential {
                    signer: credential.signer.clone(),
                    reason: e.to_string(),
                };
                warn!(run_id = %intent.run_id, signer = %credential.signer, error = %err, "Transition signature rejected");
                return Err(err);
            }
        };

        let signature = Signature {
            id: SignatureId::generate(),
            signer: identity.operator.clone(),
            meaning: expected,
            signed_at: Utc::now(),
            content_hash: intent.content_hash,
            target: intent.target(),
        };
        info!(
            run_id = %intent.run_id,
            signer = %signature.signer,
            meaning = %signature.meaning,
            "Transition signature accepted"
        );
        Ok(SignedTransition {
            signature,
            roles: identity.roles,
        })
    }

    async fn audit_rejection(
        &self,
        target: &SignatureTarget,
        credential: &SignerCredential,
        err: &SignatureError,
    ) {
        warn!(
            run_id = %target.run_id(),
            signer = %credential.signer,
            meaning = %credential.meaning,
            error = %err,
            "Signature rejected"
        );
        let payload = json!({
            "target": target,
            "signer": credential.signer,
            "meaning": credential.meaning,
            "reason": err.to_string(),
        });
        if let Err(audit_err) = self
            .ledger
            .append(&StreamId::run(target.run_id()), "signature_rejected", payload)
            .await
        {
            warn!(run_id = %target.run_id(), error = %audit_err, "Could not audit rejected signature");
        }
    }

    pub fn pending(&self, id: &PendingApprovalId) -> Option<PendingApproval> {
        self.approvals.get(id).map(|e| e.pending.clone())
    }

    pub async fn status(&self, id: &PendingApprovalId) -> Option<ApprovalStatus> {
        let entry = self.approvals.get(id).map(|e| e.value().clone())?;
        let status = entry.status.lock().await.clone();
        Some(status)
    }

    /// Suspend until the approval resolves or `timeout` elapses.
    ///
    /// Returns the status observed last; `Pending` means the wait timed out.
    pub async fn wait_for(
        &self,
        id: &PendingApprovalId,
        timeout: Duration,
    ) -> SignatureResult<ApprovalStatus> {
        let entry = self.entry(id)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = entry.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = entry.status.lock().await.clone();
            if status.is_resolved() {
                return Ok(status);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(entry.status.lock().await.clone());
            }
        }
    }

    /// Mark every open request past its expiry as expired.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Vec<PendingApproval> {
        let candidates: Vec<Arc<ApprovalEntry>> = self
            .approvals
            .iter()
            .filter(|e| e.pending.is_expired_at(now))
            .map(|e| e.value().clone())
            .collect();

        let mut expired = Vec::new();
        for entry in candidates {
            let mut status = entry.status.lock().await;
            if matches!(*status, ApprovalStatus::Pending) {
                *status = ApprovalStatus::Expired;
                entry.resolved.notify_waiters();
                warn!(pending = %entry.pending.id, run_id = %entry.pending.target.run_id(), "Signature request expired");
                expired.push(entry.pending.clone());
            }
        }
        expired
    }

    /// Withdraw every open request of a run, e.g. when it is aborted.
    pub async fn withdraw_run(&self, run_id: &RunId) -> usize {
        let candidates: Vec<Arc<ApprovalEntry>> = self
            .approvals
            .iter()
            .filter(|e| e.pending.target.run_id() == run_id)
            .map(|e| e.value().clone())
            .collect();

        let mut withdrawn = 0;
        for entry in candidates {
            let mut status = entry.status.lock().await;
            if matches!(*status, ApprovalStatus::Pending) {
                *status = ApprovalStatus::Withdrawn;
                entry.resolved.notify_waiters();
                withdrawn += 1;
            }
        }
        withdrawn
    }

    /// Forget every approval of a run that has ended. Open requests are
    /// withdrawn first so waiters wake. Returns how many entries were dropped.
    pub async fn release_run(&self, run_id: &RunId) -> usize {
        self.withdraw_run(run_id).await;
        let before = self.approvals.len();
        self.approvals
            .retain(|_, entry| entry.pending.target.run_id() != run_id);
        before.saturating_sub(self.approvals.len())
    }

    /// Number of approvals currently tracked, resolved ones included.
    pub fn approval_count(&self) -> usize {
        self.approvals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyringIdentityProvider, TestSigner};
    use labflow_ledger::FlakyAuditStore;
    use labflow_ledger::StoreError;
    use labflow_types::{StepId, TransitionAction};

    struct Fixture {
        gate: Arc<SignatureGate>,
        ledger: Arc<AuditLedger>,
        alice: TestSigner,
        run_id: RunId,
    }

    fn fixture_with(timeout: Duration, store: Arc<FlakyAuditStore>) -> Fixture {
        let keyring = Arc::new(KeyringIdentityProvider::new());
        let alice = TestSigner::new("alice").with_role("supervisor");
        alice.register(&keyring);
        let ledger = Arc::new(AuditLedger::new(store));
        let gate = Arc::new(SignatureGate::new(
            ledger.clone(),
            keyring,
            GateConfig {
                approval_timeout: timeout,
            },
        ));
        Fixture {
            gate,
            ledger,
            alice,
            run_id: RunId::new("run-1"),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Duration::from_secs(60), Arc::new(FlakyAuditStore::new()))
    }

    fn step_target(run_id: &RunId) -> SignatureTarget {
        SignatureTarget::Step {
            run_id: run_id.clone(),
            step_id: StepId::new("s2"),
        }
    }

    #[tokio::test]
    async fn valid_submission_binds_content() {
        let f = fixture();
        let content = Digest::of(b"record v1");
        let pending = f
            .gate
            .request_signature(step_target(&f.run_id), SignatureMeaning::Approved, content)
            .await
            .unwrap();

        let signature = f
            .gate
            .submit(&pending.id, &f.alice.approve(&pending), &content)
            .await
            .unwrap();
        assert!(signature.binds(&content));
        assert_eq!(signature.meaning, SignatureMeaning::Approved);

        let events = f.ledger.events(&StreamId::run(&f.run_id)).await.unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["signature_requested", "signature_recorded"]);
    }

    #[tokio::test]
    async fn signatures_are_single_use() {
        let f = fixture();
        let content = Digest::of(b"x");
        let pending = f
            .gate
            .request_signature(step_target(&f.run_id), SignatureMeaning::Approved, content)
            .await
            .unwrap();
        let credential = f.alice.approve(&pending);
        f.gate.submit(&pending.id, &credential, &content).await.unwrap();

        let err = f.gate.submit(&pending.id, &credential, &content).await.unwrap_err();
        assert!(matches!(err, SignatureError::AlreadySigned(_)));
    }

    #[tokio::test]
    async fn wrong_meaning_is_rejected_and_audited() {
        let f = fixture();
        let content = Digest::of(b"x");
        let pending = f
            .gate
            .request_signature(step_target(&f.run_id), SignatureMeaning::Approved, content)
            .await
            .unwrap();

        let err = f
            .gate
            .submit(
                &pending.id,
                &f.alice.approve_as(&pending, SignatureMeaning::Reviewed),
                &content,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SignatureError::SignatureMeaningMismatch { .. }));

        let events = f.ledger.events(&StreamId::run(&f.run_id)).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, "signature_rejected");
        assert_eq!(f.gate.status(&pending.id).await, Some(ApprovalStatus::Pending));
    }

    #[tokio::test]
    async fn changed_content_never_signs() {
        let f = fixture();
        let pending = f
            .gate
            .request_signature(
                step_target(&f.run_id),
                SignatureMeaning::Approved,
                Digest::of(b"before"),
            )
            .await
            .unwrap();

        let err = f
            .gate
            .submit(&pending.id, &f.alice.approve(&pending), &Digest::of(b"after"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignatureError::ContentChangedSinceRequest { .. }));
    }

    #[tokio::test]
    async fn forged_credential_is_invalid() {
        let f = fixture();
        let content = Digest::of(b"x");
        let pending = f
            .gate
            .request_signature(step_target(&f.run_id), SignatureMeaning::Approved, content)
            .await
            .unwrap();
        let mut credential = TestSigner::new("mallory").approve(&pending);
        credential.signer = f.alice.operator().clone();

        let err = f.gate.submit(&pending.id, &credential, &content).await.unwrap_err();
        assert!(matches!(err, SignatureError::InvalidCredential { .. }));
    }

    #[tokio::test]
    async fn expired_request_times_out() {
        let f = fixture_with(Duration::ZERO, Arc::new(FlakyAuditStore::new()));
        let content = Digest::of(b"x");
        let pending = f
            .gate
            .request_signature(step_target(&f.run_id), SignatureMeaning::Approved, content)
            .await
            .unwrap();

        let err = f
            .gate
            .submit(&pending.id, &f.alice.approve(&pending), &content)
            .await
            .unwrap_err();
        assert!(matches!(err, SignatureError::ApprovalTimeout { .. }));
        assert_eq!(f.gate.status(&pending.id).await, Some(ApprovalStatus::Expired));
    }

    #[tokio::test]
    async fn expire_due_sweeps_open_requests() {
        let f = fixture_with(Duration::ZERO, Arc::new(FlakyAuditStore::new()));
        let pending = f
            .gate
            .request_signature(step_target(&f.run_id), SignatureMeaning::Approved, Digest::ZERO)
            .await
            .unwrap();
        let expired = f.gate.expire_due(Utc::now()).await;
        assert_eq!(expired, vec![pending]);
        assert!(f.gate.expire_due(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn failed_audit_leaves_request_open() {
        let store = Arc::new(FlakyAuditStore::new());
        let f = fixture_with(Duration::from_secs(60), store.clone());
        let content = Digest::of(b"x");
        let pending = f
            .gate
            .request_signature(step_target(&f.run_id), SignatureMeaning::Approved, content)
            .await
            .unwrap();

        store.fail_next(5, StoreError::Permanent("disk".into()));
        let credential = f.alice.approve(&pending);
        let err = f.gate.submit(&pending.id, &credential, &content).await.unwrap_err();
        assert!(matches!(err, SignatureError::AuditWriteFailed(_)));

        store.heal();
        f.gate.submit(&pending.id, &credential, &content).await.unwrap();
    }

    #[tokio::test]
    async fn waiter_wakes_on_signature() {
        let f = fixture();
        let content = Digest::of(b"x");
        let pending = f
            .gate
            .request_signature(step_target(&f.run_id), SignatureMeaning::Approved, content)
            .await
            .unwrap();

        let gate = f.gate.clone();
        let id = pending.id.clone();
        let waiter = tokio::spawn(async move { gate.wait_for(&id, Duration::from_secs(5)).await });

        tokio::task::yield_now().await;
        f.gate
            .submit(&pending.id, &f.alice.approve(&pending), &content)
            .await
            .unwrap();

        let status = waiter.await.unwrap().unwrap();
        assert!(matches!(status, ApprovalStatus::Signed { .. }));
    }

    #[tokio::test]
    async fn wait_times_out_while_pending() {
        let f = fixture();
        let pending = f
            .gate
            .request_signature(step_target(&f.run_id), SignatureMeaning::Approved, Digest::ZERO)
            .await
            .unwrap();
        let status = f
            .gate
            .wait_for(&pending.id, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn transition_needs_matching_meaning() {
        let f = fixture();
        let intent = TransitionIntent::new(f.run_id.clone(), TransitionAction::Abort, Digest::ZERO);

        let signed = f.gate.sign_transition(&intent, &f.alice.authorize(&intent)).await.unwrap();
        assert_eq!(signed.signature.meaning, SignatureMeaning::Aborted);
        assert!(signed.roles.contains(&Role::new("supervisor")));

        let wrong = f.alice.sign_challenge(SignatureMeaning::Approved, &intent.challenge());
        assert!(matches!(
            f.gate.sign_transition(&intent, &wrong).await,
            Err(SignatureError::SignatureMeaningMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn withdrawn_requests_cannot_be_signed() {
        let f = fixture();
        let content = Digest::of(b"x");
        let pending = f
            .gate
            .request_signature(step_target(&f.run_id), SignatureMeaning::Approved, content)
            .await
            .unwrap();
        assert_eq!(f.gate.withdraw_run(&f.run_id).await, 1);
        let err = f
            .gate
            .submit(&pending.id, &f.alice.approve(&pending), &content)
            .await
            .unwrap_err();
        assert!(matches!(err, SignatureError::ApprovalWithdrawn(_)));
    }

    #[tokio::test]
    async fn released_runs_leave_nothing_behind() {
        let f = fixture();
        let other = RunId::new("run-other");
        let content = Digest::of(b"x");
        let signed = f
            .gate
            .request_signature(step_target(&f.run_id), SignatureMeaning::Approved, content)
            .await
            .unwrap();
        f.gate
            .submit(&signed.id, &f.alice.approve(&signed), &content)
            .await
            .unwrap();
        let open = f
            .gate
            .request_signature(step_target(&f.run_id), SignatureMeaning::Approved, content)
            .await
            .unwrap();
        f.gate
            .request_signature(step_target(&other), SignatureMeaning::Approved, content)
            .await
            .unwrap();
        assert_eq!(f.gate.approval_count(), 3);

        let waiter = {
            let gate = f.gate.clone();
            let id = open.id.clone();
            tokio::spawn(async move { gate.wait_for(&id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(f.gate.release_run(&f.run_id).await, 2);
        assert_eq!(f.gate.approval_count(), 1);
        assert!(f.gate.pending(&signed.id).is_none());
        assert!(matches!(
            waiter.await.unwrap().unwrap(),
            ApprovalStatus::Withdrawn
        ));
    }
}

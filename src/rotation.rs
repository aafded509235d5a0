//! Passphrase rotation.
//!
//! [`KeyRotationEngine::rotate`] rewraps a user's UEK under a KEK derived
//! from a new passphrase and moves every owned resource to the new
//! envelope version. The UEK itself never changes; only the KEK that wraps
//! it and the per-version resource keys derived from it do.
//!
//! # Ordering
//!
//! Nothing is written until every resource has been decrypted and
//! re-encrypted in memory. Resource writes are then committed one at a
//! time, and the new envelope is written last. A run that stops part way
//! leaves resources at either the old or the new version, each readable
//! with the key schedule of its own recorded version, and a later run
//! picks up the ones still lagging.
//!
//! # Memory
//!
//! Resources are read page by page, but the re-encrypted content of every
//! lagging resource is held until the persist step. Peak memory therefore
//! grows with the size of the account being rotated.
//!
//! # Resume runs
//!
//! When the old and new passphrases are equal the envelope is left alone
//! and only resources below its current version are migrated. This is how
//! failed resources from an earlier run are retried.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::audit::{AuditEvent, AuditLog};
use crate::config::EngineConfig;
use crate::content;
use crate::crypto::SealedBox;
use crate::envelope;
use crate::error::{CryptoError, StoreError, UekvaultError};
use crate::keys::Uek;
use crate::lock::RotationLocks;
use crate::model::{EncryptedResource, ResourceKind, UekEnvelope, UserId};
use crate::store::{EncryptedContentStore, KeyRecordStore, PageRequest};

/// Lifecycle of one rotation invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationState {
    Preparing,
    Unwrapping,
    RewrappingUek,
    MigratingResources,
    /// Changes were persisted.
    Committed,
    /// Dry run finished; nothing was persisted.
    DryRunReported,
    /// The run stopped on an error.
    Aborted,
}

/// Outcome of a rotation, committed or previewed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationResult {
    pub user_id: UserId,
    /// Envelope version before the run.
    pub from_version: u64,
    /// Version resources were migrated to. Equal to `from_version` on a
    /// resume run.
    pub to_version: u64,
    pub state: RotationState,
    pub documents_processed: usize,
    pub documents_failed: usize,
    /// Already at or above `to_version`.
    pub documents_skipped: usize,
    pub assets_processed: usize,
    pub assets_failed: usize,
    pub assets_skipped: usize,
    /// One entry per failed resource: `"{kind} {id}: {reason}"`.
    pub errors: Vec<String>,
    /// True iff no resource failed.
    pub success: bool,
}

/// Cooperative cancellation for a running rotation.
///
/// Checked between resource items. A KDF call in progress always runs to
/// completion. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct KindTally {
    processed: usize,
    failed: usize,
    skipped: usize,
}

#[derive(Debug, Default)]
struct Tally {
    documents: KindTally,
    assets: KindTally,
    errors: Vec<String>,
}

impl Tally {
    fn kind(&mut self, kind: ResourceKind) -> &mut KindTally {
        match kind {
            ResourceKind::Document => &mut self.documents,
            ResourceKind::Asset => &mut self.assets,
        }
    }

    fn fail(&mut self, resource: &EncryptedResource, reason: impl std::fmt::Display) {
        let reason = reason.to_string();
        tracing::warn!(
            kind = resource.kind.tag(),
            resource_id = %resource.id,
            %reason,
            "resource migration failed"
        );
        self.kind(resource.kind).failed += 1;
        self.errors
            .push(format!("{} {}: {reason}", resource.kind.tag(), resource.id));
    }

    fn processed(&self) -> usize {
        self.documents.processed + self.assets.processed
    }

    fn failed(&self) -> usize {
        self.documents.failed + self.assets.failed
    }

    fn into_result(self, plan: &Plan, state: RotationState) -> RotationResult {
        let success = self.failed() == 0;
        RotationResult {
            user_id: plan.user_id.clone(),
            from_version: plan.from_version,
            to_version: plan.to_version,
            state,
            documents_processed: self.documents.processed,
            documents_failed: self.documents.failed,
            documents_skipped: self.documents.skipped,
            assets_processed: self.assets.processed,
            assets_failed: self.assets.failed,
            assets_skipped: self.assets.skipped,
            errors: self.errors,
            success,
        }
    }
}

/// Tracks and logs state transitions.
struct Progress<'a> {
    user_id: &'a str,
    state: RotationState,
}

impl<'a> Progress<'a> {
    fn new(user_id: &'a str) -> Self {
        Self {
            user_id,
            state: RotationState::Preparing,
        }
    }

    fn advance(&mut self, next: RotationState) {
        tracing::debug!(user_id = self.user_id, from = ?self.state, to = ?next, "rotation state");
        self.state = next;
    }
}

/// What a run is moving from and to.
struct Plan {
    user_id: UserId,
    from_version: u64,
    to_version: u64,
    /// `None` on a resume run.
    new_envelope: Option<UekEnvelope>,
}

/// A resource re-encrypted in memory, waiting to be written.
struct Staged {
    resource: EncryptedResource,
    content: Option<SealedBox>,
}

enum Persisted {
    Written,
    /// Reached the target version through another writer, or was deleted.
    Skipped,
}

/// Orchestrates passphrase rotation for users of one store.
pub struct KeyRotationEngine<K, C> {
    keys: K,
    content: C,
    config: EngineConfig,
    locks: RotationLocks,
    audit: AuditLog,
}

impl<K: KeyRecordStore, C: EncryptedContentStore> KeyRotationEngine<K, C> {
    /// Build an engine. Fails with [`UekvaultError::Config`] on invalid
    /// configuration.
    pub fn new(keys: K, content: C, config: EngineConfig) -> Result<Self, UekvaultError> {
        config.validate()?;
        Ok(Self {
            keys,
            content,
            config,
            locks: RotationLocks::new(),
            audit: AuditLog::new(),
        })
    }

    /// Share a lock set with other engines over the same store.
    pub fn with_locks(mut self, locks: RotationLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Record into an existing audit log.
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Rotate `user_id` from `old_passphrase` to `new_passphrase`.
    ///
    /// With `dry_run` the full decrypt and re-encrypt path runs but nothing
    /// is written. Errors returned before any write leave storage
    /// untouched; per-resource failures are reported in the result instead.
    pub fn rotate(
        &self,
        user_id: &str,
        old_passphrase: &str,
        new_passphrase: &str,
        dry_run: bool,
    ) -> Result<RotationResult, UekvaultError> {
        self.rotate_with_cancel(
            user_id,
            old_passphrase,
            new_passphrase,
            dry_run,
            &CancellationToken::new(),
        )
    }

    /// [`rotate`](Self::rotate), stopping between resource items once
    /// `cancel` fires.
    pub fn rotate_with_cancel(
        &self,
        user_id: &str,
        old_passphrase: &str,
        new_passphrase: &str,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<RotationResult, UekvaultError> {
        let _guard = self
            .locks
            .try_acquire(user_id)
            .inspect_err(|_| tracing::warn!(user_id, "concurrent rotation rejected"))?;

        tracing::info!(user_id, dry_run, "rotation started");
        let mut progress = Progress::new(user_id);
        let result = self.run(&mut progress, old_passphrase, new_passphrase, dry_run, cancel);
        if let Err(e) = &result {
            tracing::debug!(user_id, error = %e, "rotation stopped");
            progress.advance(RotationState::Aborted);
        }
        result
    }

    fn run(
        &self,
        progress: &mut Progress<'_>,
        old_passphrase: &str,
        new_passphrase: &str,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<RotationResult, UekvaultError> {
        let user_id = progress.user_id;
        if new_passphrase.is_empty() {
            return Err(CryptoError::WeakInput.into());
        }

        let user = self
            .keys
            .load_user(user_id)?
            .ok_or_else(|| UekvaultError::UserNotFound(user_id.to_string()))?;
        let current = user
            .uek_envelope
            .ok_or_else(|| UekvaultError::NoKeyMaterial(user_id.to_string()))?;

        progress.advance(RotationState::Unwrapping);
        let uek = envelope::open_envelope(&current, old_passphrase).map_err(|e| match e {
            CryptoError::Authentication | CryptoError::WeakInput => UekvaultError::InvalidCredentials,
            other => other.into(),
        })?;

        let plan = if old_passphrase == new_passphrase {
            tracing::debug!(user_id, version = current.version, "resume run, envelope kept");
            Plan {
                user_id: user_id.to_string(),
                from_version: current.version,
                to_version: current.version,
                new_envelope: None,
            }
        } else {
            progress.advance(RotationState::RewrappingUek);
            let to_version = current.version + 1;
            let sealed = envelope::seal_envelope(&uek, new_passphrase, &self.config.kdf, to_version)?;
            Plan {
                user_id: user_id.to_string(),
                from_version: current.version,
                to_version,
                new_envelope: Some(sealed),
            }
        };

        progress.advance(RotationState::MigratingResources);
        let mut tally = Tally::default();
        let mut staged = Vec::new();
        for kind in [ResourceKind::Document, ResourceKind::Asset] {
            self.stage_kind(&uek, &plan, kind, cancel, &mut tally, &mut staged)?;
        }
        if cancel.is_cancelled() {
            tracing::warn!(user_id, "rotation cancelled before persistence");
            return Err(UekvaultError::Cancelled { resources_written: 0 });
        }

        if dry_run {
            for item in &staged {
                tally.kind(item.resource.kind).processed += 1;
            }
            progress.advance(RotationState::DryRunReported);
            tracing::info!(
                user_id,
                to_version = plan.to_version,
                processed = tally.processed(),
                failed = tally.failed(),
                "rotation dry run reported"
            );
            self.audit.record(AuditEvent::RotationPreviewed {
                user_id: user_id.to_string(),
                from_version: plan.from_version,
                to_version: plan.to_version,
                resources_processed: tally.processed(),
                resources_failed: tally.failed(),
            });
            return Ok(tally.into_result(&plan, RotationState::DryRunReported));
        }

        self.persist(&uek, &plan, staged, cancel, &mut tally)?;

        progress.advance(RotationState::Committed);
        tracing::info!(
            user_id,
            from_version = plan.from_version,
            to_version = plan.to_version,
            processed = tally.processed(),
            failed = tally.failed(),
            "rotation committed"
        );
        self.audit.record(AuditEvent::RotationCommitted {
            user_id: user_id.to_string(),
            from_version: plan.from_version,
            to_version: plan.to_version,
            resources_processed: tally.processed(),
            resources_failed: tally.failed(),
        });
        Ok(tally.into_result(&plan, RotationState::Committed))
    }

    /// Page through one kind, re-encrypting every lagging resource in
    /// memory. Failures go to `tally`; successes to `staged`.
    fn stage_kind(
        &self,
        uek: &Uek,
        plan: &Plan,
        kind: ResourceKind,
        cancel: &CancellationToken,
        tally: &mut Tally,
        staged: &mut Vec<Staged>,
    ) -> Result<(), UekvaultError> {
        let mut request = PageRequest::first(self.config.page_size);
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let page = self.content.list_resources(&plan.user_id, kind, &request)?;
            tracing::debug!(
                user_id = %plan.user_id,
                kind = kind.tag(),
                items = page.items.len(),
                "resource page loaded"
            );

            let (lagging, current): (Vec<_>, Vec<_>) = page
                .items
                .into_iter()
                .partition(|r| r.encryption_version < plan.to_version);
            for resource in &current {
                tracing::debug!(
                    kind = kind.tag(),
                    resource_id = %resource.id,
                    version = resource.encryption_version,
                    "resource already current"
                );
            }
            tally.kind(kind).skipped += current.len();

            let outcomes = self.migrate_batch(uek, plan.to_version, &lagging, cancel);
            for (resource, outcome) in lagging.into_iter().zip(outcomes) {
                match outcome {
                    Some(Ok(content)) => staged.push(Staged { resource, content }),
                    Some(Err(e)) => tally.fail(&resource, e),
                    None if cancel.is_cancelled() => return Ok(()),
                    None => tally.fail(&resource, "migration worker panicked"),
                }
            }

            match page.next {
                Some(next) => request = next,
                None => return Ok(()),
            }
        }
    }

    /// Re-encrypt a batch on up to `config.workers` threads. A slot is
    /// `None` if its item was never reached (cancellation or a panicked
    /// worker).
    fn migrate_batch(
        &self,
        uek: &Uek,
        to_version: u64,
        batch: &[EncryptedResource],
        cancel: &CancellationToken,
    ) -> Vec<Option<Result<Option<SealedBox>, CryptoError>>> {
        let mut slots: Vec<Option<Result<Option<SealedBox>, CryptoError>>> =
            (0..batch.len()).map(|_| None).collect();
        if batch.is_empty() {
            return slots;
        }

        let next = &AtomicUsize::new(0);
        let workers = self.config.workers.min(batch.len());
        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(move |_| {
                    scope.spawn(move || {
                        let mut done = Vec::new();
                        while !cancel.is_cancelled() {
                            let i = next.fetch_add(1, Ordering::Relaxed);
                            let Some(resource) = batch.get(i) else { break };
                            done.push((i, migrate_one(uek, resource, to_version)));
                        }
                        done
                    })
                })
                .collect();

            for handle in handles {
                match handle.join() {
                    Ok(done) => {
                        for (i, outcome) in done {
                            slots[i] = Some(outcome);
                        }
                    }
                    Err(_) => tracing::warn!("migration worker panicked"),
                }
            }
        });
        slots
    }

    /// Write staged resources, then the envelope.
    fn persist(
        &self,
        uek: &Uek,
        plan: &Plan,
        staged: Vec<Staged>,
        cancel: &CancellationToken,
        tally: &mut Tally,
    ) -> Result<(), UekvaultError> {
        let mut written = 0;
        for item in staged {
            if cancel.is_cancelled() {
                tracing::warn!(user_id = %plan.user_id, written, "rotation cancelled during persistence");
                return Err(UekvaultError::Cancelled {
                    resources_written: written,
                });
            }
            let resource = item.resource.clone();
            match self.persist_one(uek, plan.to_version, item) {
                Ok(Persisted::Written) => {
                    written += 1;
                    tally.kind(resource.kind).processed += 1;
                }
                Ok(Persisted::Skipped) => tally.kind(resource.kind).skipped += 1,
                Err(e) => tally.fail(&resource, e),
            }
        }

        let Some(new_envelope) = &plan.new_envelope else {
            return Ok(());
        };
        self.keys
            .compare_and_swap_envelope(&plan.user_id, Some(plan.from_version), new_envelope)
            .map_err(|e| match e {
                StoreError::Conflict(_) => {
                    tracing::warn!(user_id = %plan.user_id, "envelope changed during rotation");
                    UekvaultError::EnvelopeConflict(plan.user_id.clone())
                }
                other => other.into(),
            })
    }

    /// Compare-and-swap one resource, re-reading and re-migrating on
    /// conflict up to `config.max_cas_retries` times.
    fn persist_one(&self, uek: &Uek, to_version: u64, item: Staged) -> Result<Persisted, UekvaultError> {
        let Staged {
            mut resource,
            mut content,
        } = item;
        let mut retries = 0;
        loop {
            match self.content.compare_and_swap_resource(
                resource.kind,
                &resource.id,
                resource.stamp(),
                content,
                to_version,
            ) {
                Ok(()) => return Ok(Persisted::Written),
                Err(StoreError::Conflict(_)) if retries < self.config.max_cas_retries => {
                    retries += 1;
                    tracing::debug!(
                        kind = resource.kind.tag(),
                        resource_id = %resource.id,
                        retries,
                        "resource changed underneath rotation, re-reading"
                    );
                    let Some(fresh) = self.content.load_resource(resource.kind, &resource.id)? else {
                        return Ok(Persisted::Skipped);
                    };
                    if fresh.encryption_version >= to_version {
                        return Ok(Persisted::Skipped);
                    }
                    content = migrate_one(uek, &fresh, to_version)?;
                    resource = fresh;
                }
                Err(StoreError::NotFound(_)) => {
                    tracing::debug!(
                        kind = resource.kind.tag(),
                        resource_id = %resource.id,
                        "resource deleted during rotation"
                    );
                    return Ok(Persisted::Skipped);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Re-encrypt one resource at `to_version`. Empty resources carry no
/// content and only change version.
fn migrate_one(
    uek: &Uek,
    resource: &EncryptedResource,
    to_version: u64,
) -> Result<Option<SealedBox>, CryptoError> {
    resource
        .content
        .as_ref()
        .map(|sealed| {
            content::reseal_resource(
                uek,
                resource.kind,
                &resource.id,
                resource.encryption_version,
                to_version,
                sealed,
            )
        })
        .transpose()
}

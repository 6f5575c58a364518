//! # Sync Reconciliation
//!
//! Replays locally recorded mutations against the [`DataBackend`] once the
//! client is online again, then merges the backend's answers into the local
//! replica.
//!
//! ## Per-record protocol
//!
//! Pending records are processed in precedence order:
//!
//! 1. `PendingDelete` → remote delete; success removes the record and its
//!    children locally.
//! 2. `PendingCreate` → remote create; success swaps the temp-id record for
//!    the server record in one batch and rebinds children to the new id.
//! 3. `PendingUpdate` → remote update; success clears the flag and merges the
//!    server fields.
//! 4. `PendingActivation` / `PendingDeactivation` → optional field update,
//!    then the remote transition; success propagates exclusivity locally.
//!
//! Children are reconciled after their parent. A child whose parent still
//! carries a temp id, or whose parent is a tombstone, waits for a later pass.
//!
//! ## Concurrency
//!
//! Each top-level collection owns a pass lock shared with its children. A
//! second trigger while a pass is in flight returns a skipped report.
//! Passes over different collections run concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::backend::DataBackend;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{MutationError, RemoteError};
use crate::record::{now_millis, Fields, Record, SyncState};
use crate::replica::Replica;
use crate::repository::exclusive_siblings;
use crate::schema::{CollectionSpec, Schema};
use crate::store::WriteBatch;

/// Capacity of the sync-event channel.
const EVENT_CAPACITY: usize = 64;

/// Pass locks keyed by collection. Child collections share their parent's.
#[derive(Debug)]
pub struct CollectionLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl CollectionLocks {
    /// Build one lock per top-level collection of `schema`.
    #[must_use]
    pub fn new(schema: &Schema) -> Self {
        let mut locks: HashMap<String, Arc<Mutex<()>>> = schema
            .top_level()
            .map(|c| (c.name.clone(), Arc::new(Mutex::new(()))))
            .collect();
        for spec in &schema.collections {
            if let Some(link) = &spec.parent {
                if let Some(lock) = locks.get(&link.collection).cloned() {
                    locks.insert(spec.name.clone(), lock);
                }
            }
        }
        Self { locks }
    }

    /// Take the lock if no pass holds it.
    #[must_use]
    pub fn try_acquire(&self, collection: &str) -> Option<OwnedMutexGuard<()>> {
        self.locks
            .get(collection)
            .and_then(|lock| Arc::clone(lock).try_lock_owned().ok())
    }

    /// Wait for the lock. Unknown collections return `None` immediately.
    pub async fn acquire(&self, collection: &str) -> Option<OwnedMutexGuard<()>> {
        match self.locks.get(collection) {
            Some(lock) => Some(Arc::clone(lock).lock_owned().await),
            None => None,
        }
    }
}

/// Kind of mutation replayed for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    /// Remote create.
    Create,
    /// Remote update.
    Update,
    /// Remote delete.
    Delete,
    /// Exclusive flag set.
    Activate,
    /// Exclusive flag cleared.
    Deactivate,
}

impl SyncOperation {
    /// Operation replaying `state`, or `None` for clean records.
    #[must_use]
    pub const fn for_state(state: SyncState) -> Option<Self> {
        match state {
            SyncState::Clean => None,
            SyncState::PendingCreate => Some(Self::Create),
            SyncState::PendingUpdate => Some(Self::Update),
            SyncState::PendingDelete => Some(Self::Delete),
            SyncState::PendingActivation { .. } => Some(Self::Activate),
            SyncState::PendingDeactivation { .. } => Some(Self::Deactivate),
        }
    }

    /// Processing order within a pass. Lower runs first.
    const fn precedence(self) -> u8 {
        match self {
            Self::Delete => 0,
            Self::Create => 1,
            Self::Update => 2,
            Self::Activate | Self::Deactivate => 3,
        }
    }
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Activate => write!(f, "activate"),
            Self::Deactivate => write!(f, "deactivate"),
        }
    }
}

/// A record whose replay failed. Its pending state is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecord {
    /// Collection of the record.
    pub collection: String,
    /// Local id (a temp id for failed creates).
    pub record_id: String,
    /// Operation that failed.
    pub operation: SyncOperation,
    /// Human-readable error description.
    pub error: String,
    /// Whether a later pass may succeed without user action.
    pub retryable: bool,
}

impl FailedRecord {
    fn new(collection: &str, record_id: &str, operation: SyncOperation, error: &MutationError) -> Self {
        let retryable = match error {
            MutationError::Remote(e) => e.is_retryable(),
            MutationError::Storage(_) => true,
            MutationError::NotFound { .. } | MutationError::InvalidState(_) => false,
        };
        Self {
            collection: collection.to_string(),
            record_id: record_id.to_string(),
            operation,
            error: error.to_string(),
            retryable,
        }
    }
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    /// Every pending record was visited.
    Completed,
    /// Another pass over the collection was in flight; nothing was done.
    Skipped,
    /// Pending records could not be read; flags are untouched.
    Aborted,
}

/// Result of one reconciliation pass over a collection and its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    /// Top-level collection of the pass.
    pub collection: String,
    /// How the pass ended.
    pub outcome: PassOutcome,
    /// Whether the pass ran without failures.
    pub success: bool,
    /// Records reconciled successfully.
    pub synced_count: usize,
    /// Records whose replay failed.
    pub failed_count: usize,
    /// Children left for a later pass (parent not resolved yet).
    pub deferred_count: usize,
    /// Details of failed records.
    pub failed_records: Vec<FailedRecord>,
    /// User-facing error when the pass was aborted.
    pub error: Option<String>,
    /// Duration of the pass in milliseconds.
    pub duration_ms: u64,
    /// Completion timestamp (ms since Unix epoch).
    pub timestamp: u64,
}

impl SyncReport {
    /// Create an empty, successful report.
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            outcome: PassOutcome::Completed,
            success: true,
            synced_count: 0,
            failed_count: 0,
            deferred_count: 0,
            failed_records: Vec::new(),
            error: None,
            duration_ms: 0,
            timestamp: now_millis(),
        }
    }

    /// Report for a trigger that found a pass already running.
    #[must_use]
    pub fn skipped(collection: impl Into<String>) -> Self {
        Self {
            outcome: PassOutcome::Skipped,
            ..Self::new(collection)
        }
    }

    /// Record a reconciled record.
    pub fn record_success(&mut self) {
        self.synced_count += 1;
    }

    /// Record a failed record.
    pub fn record_failure(&mut self, failed: FailedRecord) {
        self.failed_count += 1;
        self.failed_records.push(failed);
        self.success = false;
    }

    /// Record a child left for a later pass.
    pub fn record_deferred(&mut self) {
        self.deferred_count += 1;
    }

    /// Mark the pass as aborted with a user-facing message.
    pub fn abort(&mut self, message: String) {
        self.outcome = PassOutcome::Aborted;
        self.success = false;
        self.error = Some(message);
    }

    /// Finalize the report with its duration.
    #[allow(clippy::cast_possible_truncation)]
    pub fn finalize(&mut self, start_time: Instant) {
        self.duration_ms = start_time.elapsed().as_millis() as u64;
        self.timestamp = now_millis();
    }

    /// Number of failures a later pass may fix.
    #[must_use]
    pub fn retryable_count(&self) -> usize {
        self.failed_records.iter().filter(|f| f.retryable).count()
    }
}

/// Reports of a full pass over every collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSummary {
    /// One report per top-level collection.
    pub reports: Vec<SyncReport>,
}

impl SyncSummary {
    /// Records reconciled across all collections.
    #[must_use]
    pub fn synced_count(&self) -> usize {
        self.reports.iter().map(|r| r.synced_count).sum()
    }

    /// Failed records across all collections.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.reports.iter().map(|r| r.failed_count).sum()
    }

    /// Returns true if no collection failed or aborted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.reports.iter().all(|r| r.success)
    }

    /// Returns true if a retry could make progress.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.reports
            .iter()
            .any(|r| r.outcome == PassOutcome::Aborted || r.retryable_count() > 0)
    }

    /// Message for the UI, if anything went wrong.
    #[must_use]
    pub fn user_message(&self) -> Option<String> {
        if let Some(error) = self.reports.iter().find_map(|r| r.error.clone()) {
            return Some(error);
        }
        let failed = self.failed_count();
        (failed > 0).then(|| format!("{failed} change(s) could not be synced and will be retried"))
    }
}

/// What started a full pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Connectivity came back.
    Reconnect,
    /// Retry after a failed reconnect pass.
    Retry,
    /// Explicit request.
    Manual,
    /// Host start-up with pending records.
    Startup,
}

/// Progress notifications published by the [`Reconciler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A full pass started.
    Started {
        /// Why the pass runs.
        trigger: SyncTrigger,
    },
    /// A full pass finished without failures.
    Completed {
        /// Per-collection reports.
        summary: SyncSummary,
    },
    /// A full pass finished with failures.
    Failed {
        /// User-facing description.
        message: String,
        /// Per-collection reports.
        summary: SyncSummary,
    },
}

/// Configuration for retrying failed reconnect passes with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum number of retries after the first pass.
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub backoff_multiplier: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl SyncConfig {
    /// Delay before retry `attempt` (0-indexed), capped at `max_delay_ms`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier.powi(attempt.min(64) as i32);
        let delay_ms = (base_delay * multiplier).min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }
}

/// Replays pending local mutations against the backend.
#[derive(Debug)]
pub struct Reconciler {
    replica: Arc<Replica>,
    backend: Arc<dyn DataBackend>,
    locks: Arc<CollectionLocks>,
    events: broadcast::Sender<SyncEvent>,
}

impl Reconciler {
    /// Create a reconciler. Share `locks` with anything else that rewrites
    /// whole collections.
    #[must_use]
    pub fn new(
        replica: Arc<Replica>,
        backend: Arc<dyn DataBackend>,
        locks: Arc<CollectionLocks>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            replica,
            backend,
            locks,
            events,
        }
    }

    /// Subscribe to pass notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Run a full pass and publish its progress.
    pub async fn run_full_pass(&self, trigger: SyncTrigger) -> SyncSummary {
        let _ = self.events.send(SyncEvent::Started { trigger });
        let summary = self.reconcile_all().await;
        tracing::info!(
            ?trigger,
            synced = summary.synced_count(),
            failed = summary.failed_count(),
            "Sync pass finished"
        );
        let event = match summary.user_message() {
            Some(message) => SyncEvent::Failed {
                message,
                summary: summary.clone(),
            },
            None => SyncEvent::Completed {
                summary: summary.clone(),
            },
        };
        let _ = self.events.send(event);
        summary
    }

    /// Reconcile every top-level collection (children included) concurrently.
    pub async fn reconcile_all(&self) -> SyncSummary {
        let names: Vec<String> = self
            .replica
            .schema()
            .top_level()
            .map(|c| c.name.clone())
            .collect();
        let reports = join_all(names.iter().map(|name| self.reconcile_collection(name))).await;
        SyncSummary { reports }
    }

    /// Reconcile one top-level collection, then its child collections.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_collection(&self, collection: &str) -> SyncReport {
        let start = Instant::now();
        let mut report = SyncReport::new(collection);

        let Some(spec) = self.replica.schema().collection(collection).cloned() else {
            report.abort(format!("Unknown collection {collection}"));
            return report;
        };
        let Some(_pass) = self.locks.try_acquire(collection) else {
            tracing::debug!("Pass already in flight");
            return SyncReport::skipped(collection);
        };

        let pending = match self.replica.pending(collection).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read pending records");
                report.abort(format!("Could not read offline changes for {collection}: {e}"));
                report.finalize(start);
                return report;
            }
        };
        for record in by_precedence(pending) {
            self.reconcile_record(&spec, record, &mut report).await;
        }

        let children: Vec<CollectionSpec> = self.replica.schema().children_of(collection).cloned().collect();
        for child in children {
            self.reconcile_children(&child, &mut report).await;
        }

        report.finalize(start);
        if report.synced_count > 0 || !report.success {
            tracing::info!(
                synced = report.synced_count,
                failed = report.failed_count,
                deferred = report.deferred_count,
                duration_ms = report.duration_ms,
                "Reconciled collection"
            );
        }
        report
    }

    async fn reconcile_children(&self, spec: &CollectionSpec, report: &mut SyncReport) {
        let Some(link) = spec.parent.clone() else { return };
        let pending = match self.replica.pending(&spec.name).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(collection = %spec.name, error = %e, "Could not read pending records");
                report.abort(format!("Could not read offline changes for {}: {e}", spec.name));
                return;
            }
        };

        for record in by_precedence(pending) {
            let parent_id = record.str_field(&link.field).map(str::to_string);
            let parent_unresolved = match parent_id.as_deref() {
                Some(parent_id) if crate::record::is_temp_id(parent_id) => true,
                Some(parent_id) => self
                    .replica
                    .record(&link.collection, parent_id)
                    .is_some_and(|parent| parent.sync.is_tombstone()),
                None => false,
            };
            // Deleting a child with a doomed parent is still safe to replay.
            if parent_unresolved && record.sync != SyncState::PendingDelete {
                tracing::debug!(
                    collection = %spec.name,
                    record_id = %record.id,
                    parent_id = ?parent_id,
                    "Child waits for its parent"
                );
                report.record_deferred();
                continue;
            }
            self.reconcile_record(spec, record, report).await;
        }
    }

    async fn reconcile_record(&self, spec: &CollectionSpec, record: Record, report: &mut SyncReport) {
        let Some(operation) = SyncOperation::for_state(record.sync) else {
            return;
        };
        let id = record.id.clone();
        tracing::debug!(collection = %spec.name, record_id = %id, %operation, "Replaying");

        let result = match record.sync {
            SyncState::PendingDelete => self.push_delete(spec, &record).await,
            SyncState::PendingCreate => self.push_create(spec, &record).await,
            SyncState::PendingUpdate => self.push_update(spec, &record).await,
            SyncState::PendingActivation { fields_dirty } => {
                self.push_transition(spec, &record, true, fields_dirty).await
            }
            SyncState::PendingDeactivation { fields_dirty } => {
                self.push_transition(spec, &record, false, fields_dirty).await
            }
            SyncState::Clean => Ok(()),
        };

        match result {
            Ok(()) => report.record_success(),
            Err(e) => {
                tracing::warn!(
                    collection = %spec.name,
                    record_id = %id,
                    %operation,
                    error = %e,
                    "Replay failed; keeping pending state"
                );
                report.record_failure(FailedRecord::new(&spec.name, &id, operation, &e));
            }
        }
    }

    async fn push_delete(&self, spec: &CollectionSpec, record: &Record) -> Result<(), MutationError> {
        if !record.has_temp_id() {
            match self.backend.delete(&spec.name, &record.id).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let mut batch = WriteBatch::new();
        batch.delete(spec.name.clone(), record.id.clone());
        self.remove_children(&mut batch, spec, &record.id);
        self.replica.commit(batch).await?;
        Ok(())
    }

    async fn push_create(&self, spec: &CollectionSpec, record: &Record) -> Result<(), MutationError> {
        let created = self.backend.create(&spec.name, record.payload()).await?;

        let Some(current) = self.replica.record(&spec.name, &record.id) else {
            // Removed locally while the create was in flight.
            tracing::warn!(record_id = %record.id, server_id = %created.id, "Undoing orphaned create");
            self.backend.delete(&spec.name, &created.id).await?;
            return Ok(());
        };
        // Fields edited during the call win over the echoed payload and go
        // out as an update on the next pass.
        let edited = current.fields != record.fields;
        let mut server = Record::new(created.id.clone(), current.fields);
        if edited {
            server.sync = match &spec.exclusive_field {
                Some(field) if server.flag(field) => SyncState::PendingActivation { fields_dirty: true },
                Some(field) if record.flag(field) => SyncState::PendingDeactivation { fields_dirty: true },
                _ => SyncState::PendingUpdate,
            };
            tracing::debug!(temp_id = %record.id, state = server.sync.label(), "Edited during create");
        } else {
            server.merge_fields(&created.fields);
        }

        let mut batch = WriteBatch::new();
        batch.delete(spec.name.clone(), record.id.clone());

        for child in self.replica.schema().children_of(&spec.name) {
            let Some(link) = &child.parent else { continue };
            for mut bound in self.replica.children(&child.name, &link.field, &record.id) {
                bound.set_field(link.field.clone(), Value::String(server.id.clone()));
                batch.put(child.name.clone(), bound);
            }
        }

        if let Some(field) = spec.exclusive_field.as_ref().filter(|_| !edited) {
            if server.flag(field) {
                match self.backend.set_active(&spec.name, &server.id, true).await {
                    Ok(_) => {
                        let records = self.replica.records(&spec.name);
                        for sibling in exclusive_siblings(&records, field, &[&record.id, &server.id]) {
                            batch.put(spec.name.clone(), sibling);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(server_id = %server.id, error = %e, "Activation after create failed");
                        server.sync = SyncState::PendingActivation {
                            fields_dirty: false,
                        };
                    }
                }
            }
        }

        tracing::debug!(temp_id = %record.id, server_id = %server.id, "Bound temp id");
        batch.put(spec.name.clone(), server);
        self.replica.commit(batch).await?;
        Ok(())
    }

    async fn push_update(&self, spec: &CollectionSpec, record: &Record) -> Result<(), MutationError> {
        let mut payload = record.payload();
        if let Some(field) = &spec.exclusive_field {
            payload.remove(field);
        }
        let server = self.backend.update(&spec.name, &record.id, payload).await?;

        let Some(mut current) = self.unchanged(&spec.name, record) else {
            // Edited again during the call; the next pass pushes the newer state.
            return Ok(());
        };
        current.merge_fields(&server.fields);
        current.sync = SyncState::Clean;
        let mut batch = WriteBatch::new();
        batch.put(spec.name.clone(), current);
        self.replica.commit(batch).await?;
        Ok(())
    }

    async fn push_transition(
        &self,
        spec: &CollectionSpec,
        record: &Record,
        active: bool,
        fields_dirty: bool,
    ) -> Result<(), MutationError> {
        let field = spec.exclusive_field.clone().ok_or_else(|| {
            MutationError::InvalidState(format!("{} has no exclusive field", spec.name))
        })?;

        let mut pushed = Fields::new();
        if fields_dirty {
            let mut payload = record.payload();
            payload.remove(&field);
            pushed = self.backend.update(&spec.name, &record.id, payload).await?.fields;
        }

        if let Err(e) = self.backend.set_active(&spec.name, &record.id, active).await {
            if fields_dirty {
                if let Some(mut partial) = self.unchanged(&spec.name, record) {
                    partial.merge_fields(&pushed);
                    partial.set_field(field, Value::Bool(active));
                    partial.sync = transition_only(active);
                    let mut batch = WriteBatch::new();
                    batch.put(spec.name.clone(), partial);
                    self.replica.commit(batch).await?;
                }
            }
            return Err(e.into());
        }

        let mut batch = WriteBatch::new();
        if active {
            let records = self.replica.records(&spec.name);
            for sibling in exclusive_siblings(&records, &field, &[&record.id]) {
                batch.put(spec.name.clone(), sibling);
            }
        }
        match self.unchanged(&spec.name, record) {
            Some(mut current) => {
                current.merge_fields(&pushed);
                current.set_field(field, Value::Bool(active));
                current.sync = SyncState::Clean;
                batch.put(spec.name.clone(), current);
            }
            None => {
                tracing::debug!(record_id = %record.id, "Edited during transition; staying pending");
            }
        }
        self.replica.commit(batch).await?;
        Ok(())
    }

    /// The stored record, if nothing touched it since `sent` was read.
    fn unchanged(&self, collection: &str, sent: &Record) -> Option<Record> {
        self.replica
            .record(collection, &sent.id)
            .filter(|current| current.fields == sent.fields && current.sync == sent.sync)
    }

    fn remove_children(&self, batch: &mut WriteBatch, spec: &CollectionSpec, parent_id: &str) {
        for child in self.replica.schema().children_of(&spec.name) {
            let Some(link) = &child.parent else { continue };
            for record in self.replica.children(&child.name, &link.field, parent_id) {
                batch.delete(child.name.clone(), record.id);
            }
        }
    }

    /// Run a full pass on every offline→online edge.
    ///
    /// While still online, passes with retryable failures are repeated with
    /// capped exponential backoff. Other transitions are ignored. A reconnect
    /// that happens while a pass or its backoff is running starts another
    /// pass once the current one returns.
    pub fn spawn_reconnect_sync(
        self: &Arc<Self>,
        monitor: ConnectivityMonitor,
        config: SyncConfig,
    ) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);
        let mut rx = monitor.subscribe();
        rx.mark_unchanged();
        let mut seen = monitor.reconnects();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                rx.mark_unchanged();
                let reconnects = monitor.reconnects();
                if reconnects == seen || !monitor.is_online() {
                    continue;
                }
                seen = reconnects;
                reconciler.sync_with_retry(&monitor, &config).await;
            }
        })
    }

    async fn sync_with_retry(&self, monitor: &ConnectivityMonitor, config: &SyncConfig) {
        let mut summary = self.run_full_pass(SyncTrigger::Reconnect).await;
        let mut attempt = 0;
        while summary.should_retry() && attempt < config.max_retries {
            let delay = config.delay_for_attempt(attempt);
            tracing::debug!(attempt, delay = ?delay, "Retrying sync pass");
            tokio::time::sleep(delay).await;
            if !monitor.is_online() {
                return;
            }
            summary = self.run_full_pass(SyncTrigger::Retry).await;
            attempt += 1;
        }
    }
}

/// Pending state left after the field update of a combined intent succeeded.
const fn transition_only(active: bool) -> SyncState {
    if active {
        SyncState::PendingActivation {
            fields_dirty: false,
        }
    } else {
        SyncState::PendingDeactivation {
            fields_dirty: false,
        }
    }
}

fn by_precedence(mut records: Vec<Record>) -> Vec<Record> {
    records.sort_by_key(|r| SyncOperation::for_state(r.sync).map_or(u8::MAX, SyncOperation::precedence));
    records
}

//! Durable retry queue
//!
//! Operations that failed with a transient error are persisted here and
//! replayed later through a [`Replayer`] (the ledger). The store is a JSON
//! array of operation records, rewritten wholesale on every change by writing
//! a temp file and renaming it over the original. Operations that keep
//! failing, or that fail on their merits, move to a separate dead-letter file
//! next to it.
//!
//! A drain swaps out the whole pending list under the lock, persists the
//! empty list, releases the lock and replays FIFO. Each operation is
//! attempted at most once per drain. Failures are merged back with whatever
//! was enqueued while the drain ran. Only one drain runs at a time; a
//! concurrent call returns an empty report.

use crate::{
    config::QueueConfig,
    metrics::Metrics,
    types::PendingOperation,
    Error, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Re-applies a queued operation
#[async_trait]
pub trait Replayer: Send + Sync {
    /// Apply `op`. Must be idempotent on `op.operation_id`.
    async fn replay(&self, op: &PendingOperation) -> Result<()>;
}

/// Outcome of one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Replayed successfully
    pub processed: usize,
    /// Attempted and failed (includes dead-lettered)
    pub failed: usize,
    /// Moved to the dead-letter list during this drain
    pub dead_lettered: usize,
    /// Not yet due, carried over without an attempt
    pub deferred: usize,
    /// Drain stopped early by cancellation
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Vec<PendingOperation>,
    dead_letters: Vec<PendingOperation>,
}

/// File-backed retry queue
pub struct RetryQueue {
    path: PathBuf,
    dead_letter_path: PathBuf,
    state: Mutex<QueueState>,
    draining: AtomicBool,
    config: QueueConfig,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Clears the in-progress flag when a drain ends, however it ends
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn load(path: &Path) -> Result<Vec<PendingOperation>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => Ok(Vec::new()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            Error::Serialization(format!("corrupt queue file {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn persist(path: &Path, ops: &[PendingOperation]) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(ops)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

impl RetryQueue {
    /// Open the queue stored at `path`, creating it if absent
    pub async fn open(path: impl Into<PathBuf>, config: QueueConfig) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut dead = path.as_os_str().to_owned();
        dead.push(".dead");
        let dead_letter_path = PathBuf::from(dead);

        let pending = load(&path).await?;
        let dead_letters = load(&dead_letter_path).await?;

        tracing::info!(
            path = %path.display(),
            pending = pending.len(),
            dead_letters = dead_letters.len(),
            "Retry queue opened"
        );

        Ok(Self {
            path,
            dead_letter_path,
            state: Mutex::new(QueueState {
                pending,
                dead_letters,
            }),
            draining: AtomicBool::new(false),
            config,
            metrics: None,
        })
    }

    /// Report enqueues and drain outcomes to `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        if let Ok(state) = self.state.try_lock() {
            metrics.queue_depth.set(state.pending.len() as i64);
        }
        self.metrics = Some(metrics);
        self
    }

    /// Queue file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist an operation for later replay
    pub async fn enqueue(&self, op: PendingOperation) -> Result<()> {
        let mut state = self.state.lock().await;
        let operation_id = op.operation_id;
        state.pending.push(op);

        if let Err(e) = persist(&self.path, &state.pending).await {
            state.pending.pop();
            tracing::error!(operation_id = %operation_id, error = %e, "Failed to persist queued operation");
            return Err(e);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_enqueue(state.pending.len());
        }
        tracing::info!(
            operation_id = %operation_id,
            depth = state.pending.len(),
            "Operation queued for retry"
        );
        Ok(())
    }

    /// Snapshot of pending operations, oldest first
    pub async fn list_pending(&self) -> Vec<PendingOperation> {
        self.state.lock().await.pending.clone()
    }

    /// Drop every pending operation
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        persist(&self.path, &[]).await?;
        let dropped = std::mem::take(&mut state.pending).len();
        if let Some(metrics) = &self.metrics {
            metrics.queue_depth.set(0);
        }
        tracing::warn!(dropped, "Retry queue cleared");
        Ok(())
    }

    /// Operations given up on, oldest first
    pub async fn list_dead_letters(&self) -> Vec<PendingOperation> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Move a dead letter back to pending with a fresh attempt budget.
    /// Returns `false` if no dead letter has that ID.
    pub async fn requeue_dead_letter(&self, operation_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(pos) = state
            .dead_letters
            .iter()
            .position(|op| op.operation_id == operation_id)
        else {
            return Ok(false);
        };

        let mut op = state.dead_letters.remove(pos);
        op.attempts = 0;
        op.next_attempt_at = Utc::now();
        state.pending.push(op);

        persist(&self.path, &state.pending).await?;
        persist(&self.dead_letter_path, &state.dead_letters).await?;

        tracing::info!(operation_id = %operation_id, "Dead letter requeued");
        Ok(true)
    }

    /// Replay every due operation once.
    ///
    /// Returns an empty report if another drain is already running.
    pub async fn process_pending(
        &self,
        replayer: &dyn Replayer,
        cancel: &CancellationToken,
    ) -> Result<DrainReport> {
        if self.draining.swap(true, Ordering::SeqCst) {
            tracing::debug!("Drain already in progress");
            return Ok(DrainReport::default());
        }
        let _guard = DrainGuard(&self.draining);

        let batch = {
            let mut state = self.state.lock().await;
            let batch = std::mem::take(&mut state.pending);
            if let Err(e) = persist(&self.path, &[]).await {
                state.pending = batch;
                return Err(e);
            }
            batch
        };

        if batch.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut report = DrainReport::default();
        let mut carried = Vec::new();
        let mut dead = Vec::new();
        let now = Utc::now();

        let mut ops = batch.into_iter();
        while let Some(mut op) = ops.next() {
            if cancel.is_cancelled() {
                tracing::info!("Drain cancelled, returning unattempted operations");
                report.cancelled = true;
                carried.push(op);
                carried.extend(ops.by_ref());
                break;
            }

            if op.next_attempt_at > now {
                report.deferred += 1;
                carried.push(op);
                continue;
            }

            op.attempts += 1;
            match replayer.replay(&op).await {
                Ok(()) => {
                    report.processed += 1;
                    tracing::debug!(operation_id = %op.operation_id, attempts = op.attempts, "Replayed");
                }
                Err(e) => {
                    report.failed += 1;
                    op.last_error = Some(e.to_string());

                    if !e.is_transient() || op.attempts >= self.config.max_attempts {
                        tracing::error!(
                            operation_id = %op.operation_id,
                            attempts = op.attempts,
                            error = %e,
                            "Operation moved to dead letters"
                        );
                        report.dead_lettered += 1;
                        dead.push(op);
                    } else {
                        let delay = self.config.backoff_for(op.attempts);
                        op.next_attempt_at = now
                            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                        tracing::warn!(
                            operation_id = %op.operation_id,
                            attempts = op.attempts,
                            error = %e,
                            "Replay failed, will retry"
                        );
                        carried.push(op);
                    }
                }
            }
        }

        let mut state = self.state.lock().await;
        let arrived = std::mem::take(&mut state.pending);
        carried.extend(arrived);
        state.pending = carried;
        state.dead_letters.extend(dead);

        persist(&self.path, &state.pending).await?;
        if report.dead_lettered > 0 {
            persist(&self.dead_letter_path, &state.dead_letters).await?;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_drain(
                report.processed,
                report.failed - report.dead_lettered,
                report.dead_lettered,
                state.pending.len(),
            );
        }
        tracing::info!(
            processed = report.processed,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            deferred = report.deferred,
            remaining = state.pending.len(),
            "Drain finished"
        );

        Ok(report)
    }

    /// Drain every `interval` until `cancel` fires
    pub fn spawn_drain_loop(
        self: Arc<Self>,
        replayer: Arc<dyn Replayer>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.process_pending(replayer.as_ref(), &cancel).await {
                            tracing::error!(error = %e, "Drain failed");
                        }
                    }
                }
            }
            tracing::info!("Drain loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, CommitRequest, CurrencyCode, EntryKind};
    use parking_lot::Mutex as SyncMutex;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;

    /// Records every attempt; fails for the configured account IDs
    #[derive(Default)]
    struct ScriptedReplayer {
        attempts: SyncMutex<Vec<Uuid>>,
        failing: SyncMutex<HashSet<String>>,
        reject: SyncMutex<HashSet<String>>,
    }

    impl ScriptedReplayer {
        fn fail(&self, account: &str) {
            self.failing.lock().insert(account.to_string());
        }

        fn heal(&self) {
            self.failing.lock().clear();
        }

        fn attempts(&self) -> Vec<Uuid> {
            self.attempts.lock().clone()
        }
    }

    #[async_trait]
    impl Replayer for ScriptedReplayer {
        async fn replay(&self, op: &PendingOperation) -> Result<()> {
            self.attempts.lock().push(op.operation_id);
            if self.reject.lock().contains(op.account_id.as_str()) {
                return Err(Error::AccountNotFound(op.account_id.to_string()));
            }
            if self.failing.lock().contains(op.account_id.as_str()) {
                return Err(Error::TransientPersistence("store down".into()));
            }
            Ok(())
        }
    }

    fn op(account: &str) -> PendingOperation {
        let request = CommitRequest::new(
            AccountId::new(account),
            None,
            EntryKind::Accrual,
            dec!(5),
            dec!(50),
            CurrencyCode::new("USD"),
        );
        PendingOperation::from_commit(&request, "store down")
    }

    async fn open_queue(dir: &tempfile::TempDir, config: QueueConfig) -> RetryQueue {
        RetryQueue::open(dir.path().join("pending_ops.json"), config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(&dir, QueueConfig::without_backoff()).await;
        let first = op("a");
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(op("b")).await.unwrap();
        drop(queue);

        let reopened = open_queue(&dir, QueueConfig::without_backoff()).await;
        let pending = reopened.list_pending().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0], first);

        // The file is a plain JSON array
        let raw = std::fs::read_to_string(dir.path().join("pending_ops.json")).unwrap();
        let parsed: Vec<PendingOperation> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[tokio::test]
    async fn test_each_op_attempted_once_and_only_failures_remain() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(&dir, QueueConfig::without_backoff()).await;
        let replayer = ScriptedReplayer::default();
        replayer.fail("b");

        let ops = [op("a"), op("b"), op("c")];
        for o in &ops {
            queue.enqueue(o.clone()).await.unwrap();
        }

        let report = queue
            .process_pending(&replayer, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(
            replayer.attempts(),
            ops.iter().map(|o| o.operation_id).collect::<Vec<_>>()
        );

        let pending = queue.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation_id, ops[1].operation_id);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.as_deref().unwrap().contains("store down"));

        // Second drain only touches the failing subset
        replayer.heal();
        let report = queue
            .process_pending(&replayer, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(replayer.attempts().len(), 4);
        assert!(queue.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_drain() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(&dir, QueueConfig::without_backoff()).await;
        let report = queue
            .process_pending(&ScriptedReplayer::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report, DrainReport::default());
    }

    #[tokio::test]
    async fn test_max_attempts_moves_to_dead_letters() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig {
            max_attempts: 2,
            ..QueueConfig::without_backoff()
        };
        let queue = open_queue(&dir, config.clone()).await;
        let replayer = ScriptedReplayer::default();
        replayer.fail("a");
        let stuck = op("a");
        queue.enqueue(stuck.clone()).await.unwrap();

        let token = CancellationToken::new();
        queue.process_pending(&replayer, &token).await.unwrap();
        let report = queue.process_pending(&replayer, &token).await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert!(queue.list_pending().await.is_empty());

        let dead = queue.list_dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);

        // Dead letters survive a reopen and can be requeued
        drop(queue);
        let queue = open_queue(&dir, config).await;
        assert_eq!(queue.list_dead_letters().await.len(), 1);
        assert!(queue.requeue_dead_letter(stuck.operation_id).await.unwrap());
        assert!(!queue.requeue_dead_letter(Uuid::now_v7()).await.unwrap());

        let pending = queue.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 0);
        assert!(queue.list_dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_dead_letters_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(&dir, QueueConfig::without_backoff()).await;
        let replayer = ScriptedReplayer::default();
        replayer.reject.lock().insert("ghost".to_string());
        queue.enqueue(op("ghost")).await.unwrap();

        let report = queue
            .process_pending(&replayer, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(queue.list_dead_letters().await[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_backoff_defers_next_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig {
            backoff_base_ms: 60_000,
            ..QueueConfig::default()
        };
        let queue = open_queue(&dir, config).await;
        let replayer = ScriptedReplayer::default();
        replayer.fail("a");
        queue.enqueue(op("a")).await.unwrap();

        let token = CancellationToken::new();
        queue.process_pending(&replayer, &token).await.unwrap();
        let report = queue.process_pending(&replayer, &token).await.unwrap();

        assert_eq!(report.deferred, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(replayer.attempts().len(), 1);
        assert_eq!(queue.list_pending().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_drain_returns_ops_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(&dir, QueueConfig::without_backoff()).await;
        queue.enqueue(op("a")).await.unwrap();
        queue.enqueue(op("b")).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let replayer = ScriptedReplayer::default();
        let report = queue.process_pending(&replayer, &token).await.unwrap();

        assert!(report.cancelled);
        assert!(replayer.attempts().is_empty());
        let pending = queue.list_pending().await;
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|o| o.attempts == 0));
    }

    /// Replayer that blocks until released, to hold a drain open
    struct GateReplayer {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl Replayer for GateReplayer {
        async fn replay(&self, _op: &PendingOperation) -> Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_noop_and_new_ops_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(open_queue(&dir, QueueConfig::without_backoff()).await);
        queue.enqueue(op("a")).await.unwrap();

        let gate = Arc::new(GateReplayer {
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });

        let drain = {
            let queue = queue.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                queue
                    .process_pending(gate.as_ref(), &CancellationToken::new())
                    .await
                    .unwrap()
            })
        };
        gate.entered.notified().await;

        let second = queue
            .process_pending(&ScriptedReplayer::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second, DrainReport::default());

        // Enqueued while the drain holds its batch
        let late = op("late");
        queue.enqueue(late.clone()).await.unwrap();

        gate.release.notify_one();
        let first = drain.await.unwrap();
        assert_eq!(first.processed, 1);

        let pending = queue.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation_id, late.operation_id);
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(&dir, QueueConfig::without_backoff()).await;
        queue.enqueue(op("a")).await.unwrap();
        queue.clear().await.unwrap();
        assert!(queue.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_drain_loop_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(open_queue(&dir, QueueConfig::without_backoff()).await);
        queue.enqueue(op("a")).await.unwrap();

        let replayer = Arc::new(ScriptedReplayer::default());
        let token = CancellationToken::new();
        let handle = queue
            .clone()
            .spawn_drain_loop(replayer.clone(), Duration::from_millis(10), token.clone());

        for _ in 0..100 {
            if !replayer.attempts().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        token.cancel();
        handle.await.unwrap();
        assert_eq!(replayer.attempts().len(), 1);
        assert!(queue.list_pending().await.is_empty());
    }
}

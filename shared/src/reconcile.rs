use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{RemoteEndpoint, RemoteError, ValidatedUrl};
use crate::event::StoreEvent;
use crate::model::{LocalId, OutgoingQuote};
use crate::store::{AttachOutcome, QuoteStore};
use crate::{
    ErrorKind, DEFAULT_ENDPOINT, DEFAULT_REMOTE_CATEGORY, DEFAULT_REMOTE_TIMEOUT,
    DEFAULT_SYNC_INTERVAL, MAX_PUSH_PER_CYCLE, MAX_REMOTE_TIMEOUT, MIN_SYNC_INTERVAL,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("invalid sync configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl SyncError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Config(_) => ErrorKind::Config,
            SyncError::Remote(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub endpoint: String,
    pub interval_ms: u64,
    pub remote_timeout_ms: u64,
    pub max_push_per_cycle: usize,
    /// Category for remote items that carry no `userId`.
    pub default_category: String,
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            interval_ms: duration_ms(DEFAULT_SYNC_INTERVAL),
            remote_timeout_ms: duration_ms(DEFAULT_REMOTE_TIMEOUT),
            max_push_per_cycle: MAX_PUSH_PER_CYCLE,
            default_category: DEFAULT_REMOTE_CATEGORY.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        ValidatedUrl::new(self.endpoint.as_str())?;
        if self.interval_ms < duration_ms(MIN_SYNC_INTERVAL) {
            return Err(SyncError::Config(format!(
                "interval_ms must be at least {}",
                duration_ms(MIN_SYNC_INTERVAL)
            )));
        }
        if self.remote_timeout_ms == 0 || self.remote_timeout_ms > duration_ms(MAX_REMOTE_TIMEOUT) {
            return Err(SyncError::Config(format!(
                "remote_timeout_ms must be in 1..={}",
                duration_ms(MAX_REMOTE_TIMEOUT)
            )));
        }
        if self.max_push_per_cycle == 0 {
            return Err(SyncError::Config("max_push_per_cycle must be > 0".into()));
        }
        if crate::model::validate_fields("x", &self.default_category).is_err() {
            return Err(SyncError::Config(
                "default_category must be a valid category".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReport {
    pub fetched: usize,
    /// Remote items that did not map to a valid quote.
    pub skipped: usize,
    pub added: usize,
    pub updated: usize,
    pub adopted: usize,
    /// Remote entries repeating an identity already in the same snapshot.
    pub duplicates: usize,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub attempted: usize,
    pub pushed: usize,
    /// Acknowledged by the server but already holding an id locally.
    pub already_synced: usize,
    /// Left for a later cycle by `max_push_per_cycle`.
    pub deferred: usize,
    /// Acknowledged with an id another local quote already holds. These stay
    /// local-only.
    pub id_conflicts: usize,
    pub failed: Vec<(LocalId, RemoteError)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReport {
    Completed {
        pull: Result<PullReport, RemoteError>,
        push: PushReport,
    },
    /// Another cycle held the guard; this trigger was dropped.
    Skipped,
}

impl SyncReport {
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, SyncReport::Skipped)
    }
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub cycles_run: AtomicU64,
    pub cycles_skipped: AtomicU64,
    pub pulls_failed: AtomicU64,
    pub quotes_pushed: AtomicU64,
    pub pushes_failed: AtomicU64,
    last_summary: std::sync::Mutex<Option<String>>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_summary(&self, summary: &str) {
        if let Ok(mut last) = self.last_summary.lock() {
            *last = Some(summary.to_string());
        }
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            cycles_run: self.cycles_run.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            pulls_failed: self.pulls_failed.load(Ordering::Relaxed),
            quotes_pushed: self.quotes_pushed.load(Ordering::Relaxed),
            pushes_failed: self.pushes_failed.load(Ordering::Relaxed),
            last_summary: self.last_summary.lock().ok().and_then(|s| s.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetricsSnapshot {
    pub cycles_run: u64,
    pub cycles_skipped: u64,
    pub pulls_failed: u64,
    pub quotes_pushed: u64,
    pub pushes_failed: u64,
    pub last_summary: Option<String>,
}

/// Brings the store and the remote collection into agreement.
///
/// `sync()` runs at most once at a time. A trigger that arrives while a
/// cycle is running is dropped, which is what keeps a local quote from
/// being posted twice.
pub struct ReconciliationEngine<R: RemoteEndpoint> {
    store: Arc<QuoteStore>,
    remote: Arc<R>,
    config: SyncConfig,
    guard: Mutex<()>,
    metrics: SyncMetrics,
}

impl<R: RemoteEndpoint> std::fmt::Debug for ReconciliationEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("config", &self.config)
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

impl<R: RemoteEndpoint + 'static> ReconciliationEngine<R> {
    pub fn new(
        store: Arc<QuoteStore>,
        remote: Arc<R>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self {
            store,
            remote,
            config,
            guard: Mutex::new(()),
            metrics: SyncMetrics::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<QuoteStore> {
        &self.store
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Fetches the remote snapshot and merges it. Waits for a running cycle.
    pub async fn pull(&self) -> Result<PullReport, RemoteError> {
        let _guard = self.guard.lock().await;
        self.pull_locked().await
    }

    /// Posts every local-only quote. Waits for a running cycle.
    pub async fn push(&self) -> PushReport {
        let _guard = self.guard.lock().await;
        self.push_locked().await
    }

    /// Pull then push. Returns `Skipped` without waiting if a cycle is running.
    #[instrument(skip(self))]
    pub async fn sync(&self) -> SyncReport {
        let Ok(_guard) = self.guard.try_lock() else {
            self.metrics.cycles_skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Sync already in progress, dropping trigger");
            self.store.emit(StoreEvent::SyncSkipped);
            return SyncReport::Skipped;
        };

        let pull = self.pull_locked().await;
        let push = self.push_locked().await;
        self.metrics.cycles_run.fetch_add(1, Ordering::Relaxed);

        info!(
            pull_ok = pull.is_ok(),
            pushed = push.pushed,
            push_failed = push.failed.len(),
            "Sync cycle complete"
        );
        SyncReport::Completed { pull, push }
    }

    /// Runs `sync()` every `interval` until the handle is stopped or dropped.
    /// Ticks missed while a cycle overran are skipped, not replayed.
    pub fn spawn_periodic(self: &Arc<Self>) -> SyncHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let interval = self.config.interval();

        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.sync().await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Periodic sync stopped");
        });

        SyncHandle {
            stop: stop_tx,
            task,
        }
    }

    async fn with_timeout<T, F>(&self, call: F) -> Result<T, RemoteError>
    where
        F: std::future::Future<Output = Result<T, RemoteError>>,
    {
        let limit = self.config.remote_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::timeout(limit)),
        }
    }

    async fn pull_locked(&self) -> Result<PullReport, RemoteError> {
        let items = match self.with_timeout(self.remote.fetch_snapshot()).await {
            Ok(items) => items,
            Err(e) => {
                self.metrics.pulls_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, retryable = e.is_retryable(), "Pull failed");
                return Err(e);
            }
        };

        let fetched = items.len();
        let candidates: Vec<_> = items
            .iter()
            .filter_map(|item| item.to_candidate(&self.config.default_category))
            .collect();
        let skipped = fetched - candidates.len();
        if skipped > 0 {
            debug!(skipped, "Ignoring remote items without usable text");
        }

        let outcome = self.store.apply_remote_snapshot(candidates).await;
        let summary = outcome.summary();
        self.metrics.record_summary(&summary);

        Ok(PullReport {
            fetched,
            skipped: skipped + outcome.rejected,
            added: outcome.added,
            updated: outcome.updated,
            adopted: outcome.adopted,
            duplicates: outcome.duplicates,
            summary,
        })
    }

    async fn push_locked(&self) -> PushReport {
        let pending = self.store.local_only().await;
        let mut report = PushReport {
            deferred: pending.len().saturating_sub(self.config.max_push_per_cycle),
            ..PushReport::default()
        };

        for quote in pending.into_iter().take(self.config.max_push_per_cycle) {
            report.attempted += 1;
            let outgoing = OutgoingQuote::from(&quote);

            match self.with_timeout(self.remote.push_quote(&outgoing)).await {
                Ok(server_id) => {
                    match self.store.attach_server_id(quote.id(), server_id.clone()).await {
                        AttachOutcome::Attached => {
                            report.pushed += 1;
                            self.metrics.quotes_pushed.fetch_add(1, Ordering::Relaxed);
                            self.store.emit(StoreEvent::QuotePushed {
                                id: quote.id().clone(),
                                server_id,
                            });
                        }
                        AttachOutcome::AlreadySynced | AttachOutcome::Missing => {
                            report.already_synced += 1;
                        }
                        AttachOutcome::IdInUse => report.id_conflicts += 1,
                    }
                }
                Err(e) => {
                    self.metrics.pushes_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(id = %quote.id(), error = %e, "Push failed, will retry next cycle");
                    self.store.emit(StoreEvent::PushFailed {
                        id: quote.id().clone(),
                        error: e.to_string(),
                    });
                    report.failed.push((quote.id().clone(), e));
                }
            }
        }

        if report.deferred > 0 {
            debug!(deferred = report.deferred, "Push batch limit reached");
        }
        report
    }
}

/// Owner of a periodic sync task.
#[derive(Debug)]
pub struct SyncHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Stops the loop after any cycle in progress and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryKvStore;
    use crate::model::{default_seed, Filter, Quote, RemoteQuote, ServerId};
    use crate::persistence::Persistence;
    use crate::store::StoreConfig;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tokio::sync::{Notify, Semaphore};

    /// Remote double with a fixed snapshot, sequential ids and optional
    /// gates on each call.
    struct ScriptedRemote {
        snapshot: std::sync::Mutex<Result<Vec<RemoteQuote>, RemoteError>>,
        fail_titles: std::sync::Mutex<HashSet<String>>,
        pushes: std::sync::Mutex<Vec<OutgoingQuote>>,
        next_id: AtomicU64,
        push_gate: Option<Arc<Semaphore>>,
        push_entered: Arc<Notify>,
        fetch_delay: Option<Duration>,
    }

    impl ScriptedRemote {
        fn new(snapshot: Vec<RemoteQuote>) -> Self {
            Self {
                snapshot: std::sync::Mutex::new(Ok(snapshot)),
                fail_titles: std::sync::Mutex::new(HashSet::new()),
                pushes: std::sync::Mutex::new(Vec::new()),
                next_id: AtomicU64::new(101),
                push_gate: None,
                push_entered: Arc::new(Notify::new()),
                fetch_delay: None,
            }
        }

        fn failing_fetch(error: RemoteError) -> Self {
            let remote = Self::new(Vec::new());
            *remote.snapshot.lock().unwrap() = Err(error);
            remote
        }

        fn pushes(&self) -> Vec<OutgoingQuote> {
            self.pushes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteEndpoint for ScriptedRemote {
        async fn fetch_snapshot(&self) -> Result<Vec<RemoteQuote>, RemoteError> {
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            self.snapshot.lock().unwrap().clone()
        }

        async fn push_quote(&self, quote: &OutgoingQuote) -> Result<ServerId, RemoteError> {
            self.push_entered.notify_one();
            if let Some(gate) = &self.push_gate {
                let _permit = gate.acquire().await.unwrap();
            }
            self.pushes.lock().unwrap().push(quote.clone());
            if self.fail_titles.lock().unwrap().contains(&quote.title) {
                return Err(RemoteError::Status {
                    status: 500,
                    message: "boom".into(),
                });
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(ServerId::new(id.to_string()))
        }
    }

    fn remote_item(id: u64, user_id: u64, title: &str) -> RemoteQuote {
        RemoteQuote {
            id: Some(serde_json::json!(id)),
            title: Some(title.to_string()),
            body: Some("ignored".to_string()),
            user_id: Some(user_id),
        }
    }

    async fn store_with(seed: Vec<Quote>) -> Arc<QuoteStore> {
        let persistence = Arc::new(Persistence::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(MemoryKvStore::new()),
        ));
        let store = Arc::new(QuoteStore::new(StoreConfig::default(), persistence));
        store.initialize(seed).await;
        store
    }

    fn engine(
        store: Arc<QuoteStore>,
        remote: ScriptedRemote,
    ) -> Arc<ReconciliationEngine<ScriptedRemote>> {
        Arc::new(ReconciliationEngine::new(store, Arc::new(remote), SyncConfig::default()).unwrap())
    }

    #[test]
    fn default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.interval(), DEFAULT_SYNC_INTERVAL);
        assert_eq!(config.remote_timeout(), DEFAULT_REMOTE_TIMEOUT);
    }

    #[test]
    fn config_validation() {
        let bad_interval = SyncConfig {
            interval_ms: 10,
            ..SyncConfig::default()
        };
        assert_eq!(bad_interval.validate().unwrap_err().kind(), ErrorKind::Config);

        let bad_timeout = SyncConfig {
            remote_timeout_ms: 0,
            ..SyncConfig::default()
        };
        assert!(bad_timeout.validate().is_err());

        let bad_endpoint = SyncConfig {
            endpoint: "ftp://example.com".into(),
            ..SyncConfig::default()
        };
        assert!(bad_endpoint.validate().is_err());

        let bad_category = SyncConfig {
            default_category: "  ".into(),
            ..SyncConfig::default()
        };
        assert!(bad_category.validate().is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"interval_ms": 5000}"#).unwrap();
        assert_eq!(config.interval(), Duration::from_secs(5));
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
    }

    #[tokio::test]
    async fn pull_is_idempotent() {
        let store = store_with(default_seed()).await;
        let engine = engine(
            store.clone(),
            ScriptedRemote::new(vec![remote_item(1, 1, "First"), remote_item(2, 2, "Second")]),
        );

        let first = engine.pull().await.unwrap();
        assert_eq!((first.added, first.updated), (2, 0));
        assert_eq!(store.len().await, 8);

        let second = engine.pull().await.unwrap();
        assert_eq!((second.added, second.updated), (0, 0));
        assert_eq!(store.len().await, 8);
    }

    #[tokio::test]
    async fn pull_maps_user_to_category() {
        let store = store_with(Vec::new()).await;
        let engine = engine(store.clone(), ScriptedRemote::new(vec![remote_item(5, 3, "Hi")]));
        engine.pull().await.unwrap();

        let quotes = store.list_by_category(&Filter::parse("user-3")).await;
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].server_id(), Some(&ServerId::new("5")));
    }

    #[tokio::test]
    async fn pull_skips_untitled_items() {
        let store = store_with(Vec::new()).await;
        let untitled = RemoteQuote {
            id: Some(serde_json::json!(9)),
            ..RemoteQuote::default()
        };
        let engine = engine(
            store.clone(),
            ScriptedRemote::new(vec![untitled, remote_item(1, 1, "Kept")]),
        );
        let report = engine.pull().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.added, 1);
    }

    #[tokio::test]
    async fn pull_failure_leaves_store_alone() {
        let store = store_with(default_seed()).await;
        let before = store.quotes().await;
        let engine = engine(
            store.clone(),
            ScriptedRemote::failing_fetch(RemoteError::Unavailable {
                message: "offline".into(),
            }),
        );
        let err = engine.pull().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteUnavailable);
        assert_eq!(store.quotes().await, before);
        assert_eq!(engine.metrics().pulls_failed, 1);
    }

    #[tokio::test]
    async fn push_attaches_ids_and_isolates_failures() {
        let store = store_with(vec![
            Quote::new("Good one", "a").unwrap(),
            Quote::new("Bad one", "a").unwrap(),
            Quote::new("Another", "b").unwrap(),
        ])
        .await;
        let remote = ScriptedRemote::new(Vec::new());
        remote.fail_titles.lock().unwrap().insert("Bad one".into());
        let engine = engine(store.clone(), remote);

        let report = engine.push().await;
        assert_eq!(report.attempted, 3);
        assert_eq!(report.pushed, 2);
        assert_eq!(report.failed.len(), 1);

        let local = store.local_only().await;
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].text(), "Bad one");
    }

    #[tokio::test]
    async fn push_sends_declared_shape() {
        let store = store_with(vec![Quote::new("Ship it", "Work").unwrap()]).await;
        let remote = Arc::new(ScriptedRemote::new(Vec::new()));
        let engine =
            ReconciliationEngine::new(store, remote.clone(), SyncConfig::default()).unwrap();
        engine.push().await;
        assert_eq!(
            remote.pushes(),
            vec![OutgoingQuote {
                title: "Ship it".into(),
                body: "Work".into(),
                user_id: crate::PUSH_USER_ID,
            }]
        );
    }

    /// Answers every post with the same id, like a mock API that never stores.
    struct FixedIdRemote;

    #[async_trait]
    impl RemoteEndpoint for FixedIdRemote {
        async fn fetch_snapshot(&self) -> Result<Vec<RemoteQuote>, RemoteError> {
            Ok(Vec::new())
        }

        async fn push_quote(&self, _quote: &OutgoingQuote) -> Result<ServerId, RemoteError> {
            Ok(ServerId::new("101"))
        }
    }

    #[tokio::test]
    async fn push_refuses_repeated_server_id() {
        let store = store_with(vec![
            Quote::new("First", "a").unwrap(),
            Quote::new("Second", "b").unwrap(),
            Quote::new("Third", "c").unwrap(),
        ])
        .await;
        let engine = ReconciliationEngine::new(
            store.clone(),
            Arc::new(FixedIdRemote),
            SyncConfig::default(),
        )
        .unwrap();

        let report = engine.push().await;
        assert_eq!(report.pushed, 1);
        assert_eq!(report.id_conflicts, 2);

        let holders = store
            .quotes()
            .await
            .into_iter()
            .filter(|q| q.server_id() == Some(&ServerId::new("101")))
            .count();
        assert_eq!(holders, 1);
        assert_eq!(store.local_only().await.len(), 2);
        assert_eq!(engine.metrics().quotes_pushed, 1);
    }

    #[tokio::test]
    async fn pull_with_repeated_titles_settles() {
        let store = store_with(Vec::new()).await;
        let engine = engine(
            store.clone(),
            ScriptedRemote::new(vec![remote_item(1, 1, "Same"), remote_item(2, 2, "Same")]),
        );

        let first = engine.pull().await.unwrap();
        assert_eq!((first.added, first.updated, first.duplicates), (1, 0, 1));
        let second = engine.pull().await.unwrap();
        assert_eq!((second.added, second.updated), (0, 0));
        assert_eq!(second.summary, "Already up to date with the server");

        let quotes = store.quotes().await;
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].category(), "user-2");
    }

    #[tokio::test]
    async fn push_respects_batch_limit() {
        let store = store_with(default_seed()).await;
        let config = SyncConfig {
            max_push_per_cycle: 4,
            ..SyncConfig::default()
        };
        let engine =
            ReconciliationEngine::new(store, Arc::new(ScriptedRemote::new(Vec::new())), config)
                .unwrap();
        let report = engine.push().await;
        assert_eq!(report.pushed, 4);
        assert_eq!(report.deferred, 2);

        let report = engine.push().await;
        assert_eq!(report.pushed, 2);
        assert_eq!(report.deferred, 0);
    }

    #[tokio::test]
    async fn failed_pull_still_pushes() {
        let store = store_with(vec![Quote::new("Local", "x").unwrap()]).await;
        let engine = engine(
            store.clone(),
            ScriptedRemote::failing_fetch(RemoteError::Timeout { timeout_ms: 1 }),
        );
        match engine.sync().await {
            SyncReport::Completed { pull, push } => {
                assert!(pull.is_err());
                assert_eq!(push.pushed, 1);
            }
            SyncReport::Skipped => panic!("sync should run"),
        }
        assert!(store.local_only().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_sync_is_skipped() {
        let store = store_with(default_seed()).await;
        let gate = Arc::new(Semaphore::new(0));
        let mut remote = ScriptedRemote::new(Vec::new());
        remote.push_gate = Some(gate.clone());
        let entered = remote.push_entered.clone();
        let engine = engine(store.clone(), remote);

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.sync().await })
        };
        // The first cycle is parked inside its first push, holding the guard.
        entered.notified().await;

        assert!(engine.sync().await.is_skipped());
        gate.add_permits(100);

        let report = first.await.unwrap();
        assert!(!report.is_skipped());

        let quotes = store.quotes().await;
        let ids: HashSet<_> = quotes.iter().filter_map(|q| q.server_id().cloned()).collect();
        assert_eq!(ids.len(), quotes.len());
        assert_eq!(engine.metrics().cycles_skipped, 1);
        assert_eq!(engine.metrics().quotes_pushed, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_fetch_times_out() {
        let store = store_with(default_seed()).await;
        let mut remote = ScriptedRemote::new(Vec::new());
        remote.fetch_delay = Some(Duration::from_secs(3600));
        let engine = engine(store, remote);

        let err = engine.pull().await.unwrap_err();
        assert_eq!(
            err,
            RemoteError::Timeout {
                timeout_ms: duration_ms(DEFAULT_REMOTE_TIMEOUT)
            }
        );
        // The guard is free again.
        assert!(engine.guard.try_lock().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sync_runs_on_interval() {
        let store = store_with(vec![Quote::new("Local", "x").unwrap()]).await;
        let engine = engine(store, ScriptedRemote::new(Vec::new()));

        let handle = engine.spawn_periodic();
        tokio::time::sleep(DEFAULT_SYNC_INTERVAL * 3 + Duration::from_secs(5)).await;
        handle.stop().await;

        let metrics = engine.metrics();
        assert_eq!(metrics.cycles_run, 3);
        assert_eq!(metrics.quotes_pushed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_stops_loop() {
        let store = store_with(Vec::new()).await;
        let engine = engine(store, ScriptedRemote::new(Vec::new()));

        let handle = engine.spawn_periodic();
        drop(handle);
        tokio::time::sleep(DEFAULT_SYNC_INTERVAL * 2).await;
        assert_eq!(engine.metrics().cycles_run, 0);
    }

    #[tokio::test]
    async fn sync_summary_is_recorded() {
        let store = store_with(Vec::new()).await;
        let engine = engine(store, ScriptedRemote::new(vec![remote_item(1, 1, "New")]));
        engine.sync().await;
        assert_eq!(
            engine.metrics().last_summary.as_deref(),
            Some("Synced with server: 1 new, 0 updated")
        );
    }
}

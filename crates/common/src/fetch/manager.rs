use std::cmp::Reverse;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::fetcher::{FetchError, Fetched, Fetcher};
use crate::export::events::{EventSink, LogEntry, LogLevel};

pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Caps the backoff exponent so the delay cannot overflow
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    /// Attempts allowed in flight at once for one run
    pub concurrency: usize,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl DownloadConfig {
    /// Delay before retrying after the `failed_attempt`-th (1-based) failure:
    ///  `base * 2^(failed_attempt - 1)`
    pub fn retry_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.retry_base_delay.saturating_mul(2u32.pow(exponent))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// A single id moving through the manager
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub id: String,
    pub priority: i32,
    /// Attempts started so far
    pub attempt: u32,
    pub status: TaskStatus,
    url: Url,
    ready_at: Instant,
}

/// Result for one requested id. `data` is `None` when every attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub id: String,
    pub data: Option<Bytes>,
    pub content_type: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl FetchOutcome {
    pub fn succeeded(&self) -> bool {
        self.data.is_some()
    }
}

/// Read-only snapshot of a run, published on every transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownloadStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retries: usize,
    pub peak_in_flight: usize,
}

impl DownloadStats {
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    /// One outcome per id, in completion order
    pub outcomes: Vec<FetchOutcome>,
    /// Milestones and failures logged during the run
    pub logs: Vec<LogEntry>,
    pub stats: DownloadStats,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.stats.succeeded
    }

    pub fn failed(&self) -> usize {
        self.stats.failed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,
    #[error("could not build url for {id}: {reason}")]
    InvalidUrl { id: String, reason: String },
}

/// State owned by one run. Only the run loop touches it.
struct RunState {
    queue: VecDeque<DownloadTask>,
    retries: Vec<DownloadTask>,
    outcomes: Vec<FetchOutcome>,
    logs: Vec<LogEntry>,
    stats: DownloadStats,
}

impl RunState {
    fn new(tasks: Vec<DownloadTask>) -> Self {
        let stats = DownloadStats {
            total: tasks.len(),
            queued: tasks.len(),
            ..Default::default()
        };
        Self {
            queue: tasks.into(),
            retries: Vec::new(),
            outcomes: Vec::new(),
            logs: Vec::new(),
            stats,
        }
    }

    /// Due retries go first, then fresh tasks in priority order
    fn next_ready(&mut self, now: Instant) -> Option<DownloadTask> {
        let due = self
            .retries
            .iter()
            .enumerate()
            .filter(|(_, task)| task.ready_at <= now)
            .min_by_key(|(_, task)| task.ready_at)
            .map(|(idx, _)| idx);

        match due {
            Some(idx) => Some(self.retries.swap_remove(idx)),
            None => self.queue.pop_front(),
        }
    }

    fn next_retry_at(&self) -> Option<Instant> {
        self.retries.iter().map(|task| task.ready_at).min()
    }

    fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.retries.is_empty()
    }
}

/// Bounded-concurrency fetcher with retry, backoff and cancellation.
///
/// A run's queue and counters live inside the `run` future and are only
///  mutated there; everything else observes through the event stream or
///  the [`DownloadStats`] watch channel. One manager can be reused across
///  the parts of a job.
pub struct DownloadManager {
    config: DownloadConfig,
    fetcher: Arc<dyn Fetcher>,
    events: EventSink,
    stats_tx: watch::Sender<DownloadStats>,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        let (stats_tx, _) = watch::channel(DownloadStats::default());
        Self {
            config,
            fetcher,
            events: EventSink::disabled(),
            stats_tx,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Subscribe to stats snapshots of the current (or last) run
    pub fn stats(&self) -> watch::Receiver<DownloadStats> {
        self.stats_tx.subscribe()
    }

    /// Fetch every id at equal priority
    pub async fn run<F, E>(
        &self,
        ids: Vec<String>,
        url_for: F,
        cancel: &CancellationToken,
    ) -> Result<RunReport, DownloadError>
    where
        F: Fn(&str) -> Result<Url, E>,
        E: fmt::Display,
    {
        let requests = ids.into_iter().map(|id| (id, 0)).collect();
        self.run_prioritized(requests, url_for, cancel).await
    }

    /// Fetch `(id, priority)` pairs; higher priority starts first and equal
    ///  priorities keep their order.
    ///
    /// Item failures end up in the report. Errors are reserved for
    ///  cancellation and for `url_for` refusing an id.
    pub async fn run_prioritized<F, E>(
        &self,
        requests: Vec<(String, i32)>,
        url_for: F,
        cancel: &CancellationToken,
    ) -> Result<RunReport, DownloadError>
    where
        F: Fn(&str) -> Result<Url, E>,
        E: fmt::Display,
    {
        let now = Instant::now();
        let mut tasks = Vec::with_capacity(requests.len());
        for (id, priority) in requests {
            let url = url_for(&id).map_err(|e| DownloadError::InvalidUrl {
                id: id.clone(),
                reason: e.to_string(),
            })?;
            tasks.push(DownloadTask {
                id,
                priority,
                attempt: 0,
                status: TaskStatus::Queued,
                url,
                ready_at: now,
            });
        }
        tasks.sort_by_key(|task| Reverse(task.priority));

        self.drive(RunState::new(tasks), cancel).await
    }

    async fn drive(
        &self,
        mut state: RunState,
        cancel: &CancellationToken,
    ) -> Result<RunReport, DownloadError> {
        let concurrency = self.config.concurrency.max(1);
        let mut in_flight = FuturesUnordered::new();

        self.publish(&state, "queued").await;
        let message = format!(
            "fetching {} item(s), {} at a time",
            state.stats.total, concurrency
        );
        self.note(&mut state, LogLevel::Info, message).await;

        loop {
            while in_flight.len() < concurrency && !cancel.is_cancelled() {
                let Some(mut task) = state.next_ready(Instant::now()) else {
                    break;
                };
                task.attempt += 1;
                task.status = TaskStatus::Running;
                state.stats.queued -= 1;
                state.stats.running += 1;
                state.stats.peak_in_flight = state.stats.peak_in_flight.max(state.stats.running);
                tracing::trace!(id = %task.id, attempt = task.attempt, "starting attempt");
                in_flight.push(self.attempt(task));
                self.publish(&state, "running").await;
            }

            if cancel.is_cancelled() {
                let outstanding = state.stats.total - state.stats.finished();
                // in-flight attempts may finish, their results are dropped
                while in_flight.next().await.is_some() {}
                state.stats.running = 0;
                self.publish(&state, "cancelled").await;
                let message = format!("fetch cancelled with {} item(s) outstanding", outstanding);
                self.note(&mut state, LogLevel::Warn, message).await;
                return Err(DownloadError::Cancelled);
            }

            if in_flight.is_empty() && state.is_drained() {
                break;
            }

            let next_retry = state.next_retry_at();
            let may_start = in_flight.len() < concurrency;
            tokio::select! {
                Some((task, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.complete(&mut state, task, result, cancel).await;
                }
                _ = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)),
                    if next_retry.is_some() && may_start => {}
                _ = cancel.cancelled() => {}
            }
        }

        let level = if state.stats.failed == 0 {
            LogLevel::Success
        } else {
            LogLevel::Warn
        };
        let message = format!(
            "fetched {}/{} item(s), {} failed",
            state.stats.succeeded, state.stats.total, state.stats.failed
        );
        self.note(&mut state, level, message).await;
        self.publish(&state, "done").await;

        Ok(RunReport {
            outcomes: state.outcomes,
            logs: state.logs,
            stats: state.stats,
        })
    }

    fn attempt(
        &self,
        task: DownloadTask,
    ) -> impl Future<Output = (DownloadTask, Result<Fetched, FetchError>)> + Send + 'static {
        let fetcher = self.fetcher.clone();
        let timeout = self.config.attempt_timeout;
        async move {
            let result = match tokio::time::timeout(timeout, fetcher.fetch(&task.url)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(timeout)),
            };
            (task, result)
        }
    }

    async fn complete(
        &self,
        state: &mut RunState,
        mut task: DownloadTask,
        result: Result<Fetched, FetchError>,
        cancel: &CancellationToken,
    ) {
        state.stats.running -= 1;

        match result {
            Ok(fetched) => {
                task.status = TaskStatus::Succeeded;
                state.stats.succeeded += 1;
                tracing::debug!(id = %task.id, attempts = task.attempt, bytes = fetched.bytes.len(), "fetched");
                state.outcomes.push(FetchOutcome {
                    id: task.id,
                    data: Some(fetched.bytes),
                    content_type: fetched.content_type,
                    attempts: task.attempt,
                    error: None,
                });
                self.publish(state, "succeeded").await;
            }
            Err(err) => {
                let retryable = !err.is_permanent() && task.attempt <= self.config.max_retries;
                if retryable && !cancel.is_cancelled() {
                    let delay = self.config.retry_delay(task.attempt);
                    self.note(
                        state,
                        LogLevel::Info,
                        format!(
                            "attempt {} for {} failed ({}), retrying in {:?}",
                            task.attempt, task.id, err, delay
                        ),
                    )
                    .await;
                    task.status = TaskStatus::Queued;
                    task.ready_at = Instant::now() + delay;
                    state.stats.queued += 1;
                    state.stats.retries += 1;
                    state.retries.push(task);
                    self.publish(state, "retrying").await;
                } else {
                    task.status = TaskStatus::Failed;
                    state.stats.failed += 1;
                    self.note(
                        state,
                        LogLevel::Warn,
                        format!(
                            "giving up on {} after {} attempt(s): {}",
                            task.id, task.attempt, err
                        ),
                    )
                    .await;
                    state.outcomes.push(FetchOutcome {
                        id: task.id,
                        data: None,
                        content_type: None,
                        attempts: task.attempt,
                        error: Some(err.to_string()),
                    });
                    self.publish(state, "failed").await;
                }
            }
        }
    }

    async fn note(&self, state: &mut RunState, level: LogLevel, message: String) {
        let entry = self.events.log(level, message).await;
        state.logs.push(entry);
    }

    async fn publish(&self, state: &RunState, stage: &str) {
        self.stats_tx.send_replace(state.stats);
        self.events
            .progress(state.stats.finished(), state.stats.total, stage)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::export::events::ExportEvent;

    /// Fetcher that fails each id a scripted number of times, tracking
    ///  concurrency and call times
    #[derive(Default)]
    struct ScriptedFetcher {
        failures: HashMap<String, (u32, FetchError)>,
        latency: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<(String, Instant)>>,
        cancel_on_call: Option<CancellationToken>,
    }

    impl ScriptedFetcher {
        fn calls_for(&self, id: &str) -> Vec<Instant> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(call_id, _)| call_id == id)
                .map(|(_, at)| *at)
                .collect()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, url: &Url) -> Result<Fetched, FetchError> {
            let id = url.path().trim_start_matches('/').to_string();
            let call_number = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((id.clone(), Instant::now()));
                calls.iter().filter(|(call_id, _)| *call_id == id).count() as u32
            };
            if let Some(token) = &self.cancel_on_call {
                token.cancel();
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.failures.get(&id) {
                Some((count, err)) if call_number <= *count => Err(err.clone()),
                _ => Ok(Fetched {
                    bytes: Bytes::from(id.into_bytes()),
                    content_type: Some("image/png".to_string()),
                }),
            }
        }
    }

    fn url_for(id: &str) -> Result<Url, url::ParseError> {
        Url::parse(&format!("https://pds.test/{}", id))
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("blob{i}")).collect()
    }

    fn config() -> DownloadConfig {
        DownloadConfig {
            concurrency: 3,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_is_respected() {
        let fetcher = Arc::new(ScriptedFetcher {
            latency: Duration::from_millis(20),
            ..Default::default()
        });
        let manager = DownloadManager::new(config(), fetcher.clone());

        let report = manager
            .run(ids(50), url_for, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 50);
        assert_eq!(report.succeeded(), 50);
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 3);
        assert!(report.stats.peak_in_flight <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_geometric_backoff() {
        let mut failures = HashMap::new();
        failures.insert("flaky".to_string(), (2, FetchError::Status(503)));
        let fetcher = Arc::new(ScriptedFetcher {
            failures,
            ..Default::default()
        });
        let manager = DownloadManager::new(config(), fetcher.clone());

        let report = manager
            .run(vec!["flaky".to_string()], url_for, &CancellationToken::new())
            .await
            .unwrap();

        let outcome = &report.outcomes[0];
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(report.stats.retries, 2);

        let calls = fetcher.calls_for("flaky");
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        assert!(first_gap >= Duration::from_millis(100));
        assert!(second_gap >= Duration::from_millis(200));
        assert!(second_gap > first_gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_without_error() {
        let mut failures = HashMap::new();
        failures.insert(
            "dead".to_string(),
            (u32::MAX, FetchError::Request("connection reset".into())),
        );
        let fetcher = Arc::new(ScriptedFetcher {
            failures,
            ..Default::default()
        });
        let manager = DownloadManager::new(config(), fetcher.clone());

        let report = manager
            .run(
                vec!["dead".to_string(), "alive".to_string()],
                url_for,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let dead = report.outcomes.iter().find(|o| o.id == "dead").unwrap();
        assert!(dead.data.is_none());
        assert_eq!(dead.attempts, 4);
        assert_eq!(fetcher.calls_for("dead").len(), 4);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.succeeded(), 1);
        assert!(report
            .logs
            .iter()
            .any(|entry| entry.level == LogLevel::Warn && entry.message.contains("dead")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let mut failures = HashMap::new();
        failures.insert("gone".to_string(), (u32::MAX, FetchError::Status(404)));
        let fetcher = Arc::new(ScriptedFetcher {
            failures,
            ..Default::default()
        });
        let manager = DownloadManager::new(config(), fetcher.clone());

        let report = manager
            .run(vec!["gone".to_string()], url_for, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcomes[0].attempts, 1);
        assert_eq!(report.outcomes[0].error.as_deref(), Some("http status 404"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_count_as_failed_attempts() {
        let fetcher = Arc::new(ScriptedFetcher {
            latency: Duration::from_secs(60),
            ..Default::default()
        });
        let manager = DownloadManager::new(
            DownloadConfig {
                max_retries: 1,
                attempt_timeout: Duration::from_secs(1),
                ..config()
            },
            fetcher.clone(),
        );

        let report = manager
            .run(vec!["slow".to_string()], url_for, &CancellationToken::new())
            .await
            .unwrap();
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_new_starts() {
        let cancel = CancellationToken::new();
        let fetcher = Arc::new(ScriptedFetcher {
            latency: Duration::from_millis(50),
            cancel_on_call: Some(cancel.clone()),
            ..Default::default()
        });
        let manager = DownloadManager::new(
            DownloadConfig {
                concurrency: 2,
                ..config()
            },
            fetcher.clone(),
        );

        let result = manager.run(ids(20), url_for, &cancel).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        // the two attempts already started were allowed to finish
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_skips_the_retry() {
        let mut failures = HashMap::new();
        failures.insert("busy".to_string(), (u32::MAX, FetchError::Status(503)));
        let fetcher = Arc::new(ScriptedFetcher {
            failures,
            ..Default::default()
        });
        let manager = DownloadManager::new(
            DownloadConfig {
                retry_base_delay: Duration::from_secs(60),
                ..config()
            },
            fetcher.clone(),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let (result, _) = tokio::join!(
            manager.run(vec!["busy".to_string()], url_for, &cancel),
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                trigger.cancel();
            }
        );

        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_does_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let fetcher = Arc::new(ScriptedFetcher::default());
        let manager = DownloadManager::new(config(), fetcher.clone());

        let result = manager.run(ids(5), url_for, &cancel).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_url_is_fatal() {
        let manager = DownloadManager::new(config(), Arc::new(ScriptedFetcher::default()));
        let result = manager
            .run(
                vec!["ok".to_string(), "bad".to_string()],
                |id: &str| {
                    if id == "bad" {
                        Err("no url for this id")
                    } else {
                        Ok(Url::parse("https://pds.test/ok").unwrap())
                    }
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(DownloadError::InvalidUrl { id, .. }) if id == "bad"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_orders_starts() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let manager = DownloadManager::new(
            DownloadConfig {
                concurrency: 1,
                ..config()
            },
            fetcher.clone(),
        );

        manager
            .run_prioritized(
                vec![
                    ("low".to_string(), 0),
                    ("high".to_string(), 10),
                    ("mid-a".to_string(), 5),
                    ("mid-b".to_string(), 5),
                ],
                url_for,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let order: Vec<String> = fetcher
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(order, vec!["high", "mid-a", "mid-b", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_events_and_stats_snapshot() {
        let (sink, rx) = EventSink::channel();
        let manager =
            DownloadManager::new(config(), Arc::new(ScriptedFetcher::default())).with_events(sink);
        let stats = manager.stats();

        manager
            .run(ids(4), url_for, &CancellationToken::new())
            .await
            .unwrap();

        let snapshot = *stats.borrow();
        assert_eq!(snapshot.succeeded, 4);
        assert_eq!(snapshot.running, 0);
        assert_eq!(snapshot.queued, 0);

        let progress: Vec<_> = rx
            .drain()
            .filter_map(|event| match event {
                ExportEvent::Progress(p) => Some(p),
                _ => None,
            })
            .collect();
        assert!(progress.iter().all(|p| p.total == 4 && p.current <= 4));
        assert_eq!(progress.last().map(|p| p.current), Some(4));
        assert_eq!(progress.iter().filter(|p| p.stage == "running").count(), 4);
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = config();
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(400));
        // huge attempt numbers saturate instead of overflowing
        assert!(config.retry_delay(1_000) >= config.retry_delay(3));
    }
}

//! Retrying, direction-aware fetch over a [`MessageSource`].
//!
//! Historical mode pages backward from the newest message until a lower
//! bound (or the page budget) is reached. Incremental mode reads the newest
//! page, keeps what is strictly newer than `since`, and only pages further
//! back while every item on a full page is still newer than `since`.
//!
//! Either mode can start below the newest message instead, from a cursor
//! left behind by an earlier run that ran out of page budget. Running out of
//! budget before the lower bound is reported as [`FetchOutcome::Truncated`],
//! never as complete.
//!
//! Every individual upstream call is wrapped in a timeout and retried with
//! exponential backoff on transient failures. Rate-limit signals are honoured
//! by waiting at least the mandated duration, under a separate budget.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tracing::{debug, warn};

use chatsync_core::record::max_posted_at;
use chatsync_core::{MessageId, ParseMode, Record, SchedulerConfig, Source};

use crate::error::{FetchError, SourceError};
use crate::retry::RetryPolicy;
use crate::source::{FetchDirection, MessageSource};

// ── Plan / result types ──────────────────────────────────────────────

/// What one pipeline run should read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPlan {
    /// Page back until a message at or before `floor` is seen. `None` reads
    /// as far as the page budget allows.
    Historical { floor: Option<DateTime<Utc>> },
    /// Read what is strictly newer than `since`. `None` keeps the newest
    /// page unfiltered.
    Incremental { since: Option<DateTime<Utc>> },
}

impl FetchPlan {
    pub fn mode(&self) -> ParseMode {
        match self {
            Self::Historical { .. } => ParseMode::Historical,
            Self::Incremental { .. } => ParseMode::Incremental,
        }
    }
}

/// Records gathered by one fetch, newest page first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fetched {
    pub records: Vec<Record>,
    pub max_timestamp: Option<DateTime<FixedOffset>>,
    pub pages: u32,
}

impl Fetched {
    /// Smallest message id gathered. Pages are contiguous from the starting
    /// cursor, so everything newer than this down to the start was read.
    pub fn oldest_id(&self) -> Option<MessageId> {
        oldest_id(&self.records)
    }

    fn from_records(records: Vec<Record>, pages: u32) -> Self {
        let max_timestamp = max_posted_at(&records);
        Self {
            records,
            max_timestamp,
            pages,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Complete(Fetched),
    /// The page budget ran out while every page was still above the lower
    /// bound. Paging should continue older than `resume_before`.
    Truncated { fetched: Fetched, resume_before: MessageId },
    /// A later page failed after earlier pages succeeded. The records that
    /// did arrive are still worth persisting.
    Interrupted { fetched: Fetched, error: FetchError },
}

impl FetchOutcome {
    pub fn fetched(&self) -> &Fetched {
        match self {
            Self::Complete(f) | Self::Truncated { fetched: f, .. } | Self::Interrupted { fetched: f, .. } => f,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

// ── Retry observation ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    Transient,
    Timeout,
    RateLimited,
}

impl RetryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notified once per retry, before the delay is slept.
pub trait RetryObserver: Send + Sync {
    fn on_retry(&self, reason: RetryReason, delay: Duration);
}

#[derive(Debug, Default)]
pub struct NoopRetryObserver;

impl RetryObserver for NoopRetryObserver {
    fn on_retry(&self, _reason: RetryReason, _delay: Duration) {}
}

// ── Fetcher ──────────────────────────────────────────────────────────

pub struct RetryingFetcher {
    source: Arc<dyn MessageSource>,
    policy: RetryPolicy,
    page_size: u32,
    max_historical_pages: u32,
    max_incremental_pages: u32,
    observer: Arc<dyn RetryObserver>,
}

impl RetryingFetcher {
    pub fn new(source: Arc<dyn MessageSource>, config: &SchedulerConfig) -> Self {
        Self {
            source,
            policy: RetryPolicy::from_config(config),
            page_size: config.page_size.max(1),
            max_historical_pages: config.max_historical_pages.max(1),
            max_incremental_pages: config.max_incremental_pages.max(1),
            observer: Arc::new(NoopRetryObserver),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch according to `plan`, starting from the newest message.
    ///
    /// Returns `Err` when nothing could be read at all (including a source
    /// with no usable identity, which is rejected without calling upstream).
    pub async fn fetch(&self, source: &Source, plan: FetchPlan) -> Result<FetchOutcome, FetchError> {
        self.fetch_from(source, plan, None).await
    }

    /// Like [`fetch`](Self::fetch), but the first page is older than
    /// `resume_before` when given.
    pub async fn fetch_from(
        &self,
        source: &Source,
        plan: FetchPlan,
        resume_before: Option<MessageId>,
    ) -> Result<FetchOutcome, FetchError> {
        let identity = source
            .identity()
            .ok_or_else(|| FetchError::Unresolvable(format!("source {} has no external identity", source.id)))?;
        let start = resume_before.map_or(FetchDirection::Newest, FetchDirection::OlderThan);

        match plan {
            FetchPlan::Historical { floor } => self.fetch_historical(identity, floor, start).await,
            FetchPlan::Incremental { since } => self.fetch_incremental(identity, since, start).await,
        }
    }

    async fn fetch_historical(
        &self,
        identity: &str,
        floor: Option<DateTime<Utc>>,
        start: FetchDirection,
    ) -> Result<FetchOutcome, FetchError> {
        let mut collected = Vec::new();
        let mut direction = start;
        let mut pages = 0;
        let mut resume_before = None;

        loop {
            let page = match self.call(identity, direction).await {
                Ok(page) => page,
                Err(error) => return interrupted(collected, pages, error),
            };
            pages += 1;
            if page.is_empty() {
                break;
            }

            let full = page.len() as u32 >= self.page_size;
            let oldest = oldest_id(&page);
            let reached_floor = floor.is_some_and(|f| page.iter().any(|r| !is_newer(r, f)));
            collected.extend(page.into_iter().filter(|r| floor.map_or(true, |f| is_newer(r, f))));

            if reached_floor || !full {
                break;
            }
            let Some(next) = next_cursor(direction, oldest) else {
                break;
            };
            if pages >= self.max_historical_pages {
                // Without a floor the budget is the backfill horizon.
                if floor.is_some() {
                    resume_before = cursor_of(next);
                }
                break;
            }
            direction = next;
        }

        finish(identity, "historical", collected, pages, resume_before)
    }

    async fn fetch_incremental(
        &self,
        identity: &str,
        since: Option<DateTime<Utc>>,
        start: FetchDirection,
    ) -> Result<FetchOutcome, FetchError> {
        let mut collected = Vec::new();
        let mut direction = start;
        let mut pages = 0;
        let mut resume_before = None;

        loop {
            let page = match self.call(identity, direction).await {
                Ok(page) => page,
                Err(error) => return interrupted(collected, pages, error),
            };
            pages += 1;
            if page.is_empty() {
                break;
            }

            let full = page.len() as u32 >= self.page_size;
            let oldest = oldest_id(&page);
            let total = page.len();
            let newer: Vec<Record> = page
                .into_iter()
                .filter(|r| since.map_or(true, |s| is_newer(r, s)))
                .collect();
            let all_newer = newer.len() == total;
            collected.extend(newer);

            // Without a lower bound there is nothing to page back towards.
            if since.is_none() || !all_newer || !full {
                break;
            }
            let Some(next) = next_cursor(direction, oldest) else {
                break;
            };
            if pages >= self.max_incremental_pages {
                resume_before = cursor_of(next);
                break;
            }
            direction = next;
        }

        finish(identity, "incremental", collected, pages, resume_before)
    }

    /// One logical upstream call with timeout, backoff and rate-limit waits.
    async fn call(&self, identity: &str, direction: FetchDirection) -> Result<Vec<Record>, FetchError> {
        let mut failures = 0u32;
        let mut rate_limit_waits = 0u32;

        loop {
            let result = tokio::time::timeout(
                self.policy.call_timeout,
                self.source.fetch(identity, direction, self.page_size),
            )
            .await;

            let (reason, message) = match result {
                Ok(Ok(page)) => return Ok(page),
                Ok(Err(SourceError::NotFound(msg))) => return Err(FetchError::Unresolvable(msg)),
                Ok(Err(SourceError::RateLimited { wait })) => {
                    rate_limit_waits += 1;
                    if rate_limit_waits > self.policy.max_rate_limit_waits {
                        return Err(FetchError::RateLimitExhausted {
                            waits: rate_limit_waits - 1,
                            last_wait: wait,
                        });
                    }
                    let delay = self.policy.rate_limit_delay(wait);
                    warn!(identity, %direction, requested = ?wait, ?delay, "rate limited, waiting");
                    self.observer.on_retry(RetryReason::RateLimited, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Ok(Err(SourceError::Transient(msg))) => (RetryReason::Transient, msg),
                Err(_) => (
                    RetryReason::Timeout,
                    format!("call timed out after {:?}", self.policy.call_timeout),
                ),
            };

            failures += 1;
            if failures >= self.policy.max_attempts {
                return Err(FetchError::Transient {
                    attempts: failures,
                    last: message,
                });
            }
            let delay = self.policy.backoff.delay(failures - 1);
            warn!(
                identity,
                %direction,
                attempt = failures,
                max_attempts = self.policy.max_attempts,
                ?delay,
                error = %message,
                "fetch failed, retrying"
            );
            self.observer.on_retry(reason, delay);
            tokio::time::sleep(delay).await;
        }
    }
}

fn finish(
    identity: &str,
    mode: &'static str,
    collected: Vec<Record>,
    pages: u32,
    resume_before: Option<MessageId>,
) -> Result<FetchOutcome, FetchError> {
    let fetched = Fetched::from_records(collected, pages);
    match resume_before {
        Some(resume_before) => {
            warn!(
                identity,
                mode,
                pages,
                records = fetched.records.len(),
                %resume_before,
                "page budget reached above the lower bound"
            );
            Ok(FetchOutcome::Truncated { fetched, resume_before })
        }
        None => {
            debug!(identity, mode, pages, records = fetched.records.len(), "fetch complete");
            Ok(FetchOutcome::Complete(fetched))
        }
    }
}

fn cursor_of(direction: FetchDirection) -> Option<MessageId> {
    match direction {
        FetchDirection::OlderThan(id) => Some(id),
        FetchDirection::Newest => None,
    }
}

fn interrupted(collected: Vec<Record>, pages: u32, error: FetchError) -> Result<FetchOutcome, FetchError> {
    if collected.is_empty() {
        return Err(error);
    }
    Ok(FetchOutcome::Interrupted {
        fetched: Fetched::from_records(collected, pages),
        error,
    })
}

fn is_newer(record: &Record, bound: DateTime<Utc>) -> bool {
    record.posted_at.with_timezone(&Utc) > bound
}

fn oldest_id(page: &[Record]) -> Option<MessageId> {
    page.iter().map(|r| r.external_message_id).min()
}

/// Next older-than cursor, or `None` if upstream stopped moving backward.
fn next_cursor(current: FetchDirection, oldest: Option<MessageId>) -> Option<FetchDirection> {
    let oldest = oldest?;
    match current {
        FetchDirection::OlderThan(prev) if oldest >= prev => None,
        _ => Some(FetchDirection::OlderThan(oldest)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySource;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    /// Message `id` posted `id` minutes after t0.
    fn msg(id: i64) -> Record {
        let at = (t0() + ChronoDuration::minutes(id)).fixed_offset();
        Record::new(id, at, format!("message {id}"))
    }

    fn config(page_size: u32) -> SchedulerConfig {
        SchedulerConfig {
            page_size,
            retry_max_attempts: 4,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            rate_limit_jitter: Duration::ZERO,
            max_rate_limit_waits: 3,
            ..SchedulerConfig::default()
        }
    }

    fn channel(source: &InMemorySource, ids: std::ops::RangeInclusive<i64>) {
        source.set_messages("chan", ids.map(msg).collect());
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<RetryReason>>);

    impl RetryObserver for Recorder {
        fn on_retry(&self, reason: RetryReason, _delay: Duration) {
            self.0.lock().unwrap().push(reason);
        }
    }

    fn fetcher(source: &Arc<InMemorySource>, page_size: u32) -> (RetryingFetcher, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let fetcher = RetryingFetcher::new(source.clone(), &config(page_size)).with_observer(recorder.clone());
        (fetcher, recorder)
    }

    fn src() -> Source {
        Source::new(Uuid::new_v4(), "chan")
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_then_success_count_retries() {
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=3);
        source.fail_next("chan", SourceError::Transient("reset".into()));
        source.fail_next("chan", SourceError::Transient("reset".into()));
        let (fetcher, recorder) = fetcher(&source, 10);

        let outcome = fetcher.fetch(&src(), FetchPlan::Incremental { since: None }).await.unwrap();

        assert_eq!(outcome.fetched().records.len(), 3);
        assert_eq!(*recorder.0.lock().unwrap(), vec![RetryReason::Transient; 2]);
        assert_eq!(source.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_attempts_is_a_transient_error() {
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=3);
        for _ in 0..4 {
            source.fail_next("chan", SourceError::Transient("503".into()));
        }
        let (fetcher, recorder) = fetcher(&source, 10);

        let err = fetcher.fetch(&src(), FetchPlan::Incremental { since: None }).await.unwrap_err();

        assert_eq!(err, FetchError::Transient { attempts: 4, last: "503".into() });
        assert_eq!(recorder.0.lock().unwrap().len(), 3);
        assert_eq!(source.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_at_least_the_mandated_duration() {
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=3);
        source.fail_next("chan", SourceError::RateLimited { wait: Duration::from_secs(5) });
        let (fetcher, recorder) = fetcher(&source, 10);

        let started = tokio::time::Instant::now();
        let outcome = fetcher.fetch(&src(), FetchPlan::Incremental { since: None }).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(outcome.fetched().records.len(), 3);
        assert_eq!(*recorder.0.lock().unwrap(), vec![RetryReason::RateLimited]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_budget_is_separate_and_bounded() {
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=3);
        for _ in 0..10 {
            source.fail_next("chan", SourceError::RateLimited { wait: Duration::from_secs(1) });
        }
        let (fetcher, _) = fetcher(&source, 10);

        let err = fetcher.fetch(&src(), FetchPlan::Incremental { since: None }).await.unwrap_err();

        assert!(matches!(err, FetchError::RateLimitExhausted { waits: 3, .. }));
        // 3 honoured waits plus the call that exceeded the budget
        assert_eq!(source.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_and_retry() {
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=3);
        source.delay_next("chan", Duration::from_secs(120));
        let (fetcher, recorder) = fetcher(&source, 10);

        let outcome = fetcher.fetch(&src(), FetchPlan::Incremental { since: None }).await.unwrap();

        assert_eq!(outcome.fetched().records.len(), 3);
        assert_eq!(*recorder.0.lock().unwrap(), vec![RetryReason::Timeout]);
    }

    #[tokio::test]
    async fn not_found_is_never_retried() {
        let source = Arc::new(InMemorySource::new());
        let (fetcher, recorder) = fetcher(&source, 10);

        let err = fetcher
            .fetch(&Source::new(Uuid::new_v4(), "gone"), FetchPlan::Incremental { since: None })
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Unresolvable(_)));
        assert_eq!(source.calls().len(), 1);
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_identity_never_calls_upstream() {
        let source = Arc::new(InMemorySource::new());
        let (fetcher, _) = fetcher(&source, 10);
        let mut nameless = src();
        nameless.external_identity = Some("  ".into());

        let err = fetcher.fetch(&nameless, FetchPlan::Historical { floor: None }).await.unwrap_err();

        assert!(matches!(err, FetchError::Unresolvable(_)));
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn incremental_reads_newest_and_filters_since() {
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=20);
        let (fetcher, _) = fetcher(&source, 10);
        let since = t0() + ChronoDuration::minutes(15);

        let outcome = fetcher.fetch(&src(), FetchPlan::Incremental { since: Some(since) }).await.unwrap();

        let mut ids: Vec<i64> = outcome.fetched().records.iter().map(|r| r.external_message_id.0).collect();
        ids.sort();
        assert_eq!(ids, vec![16, 17, 18, 19, 20]);
        assert_eq!(source.calls(), vec![("chan".to_string(), FetchDirection::Newest)]);
        assert_eq!(
            outcome.fetched().max_timestamp.map(|t| t.with_timezone(&Utc)),
            Some(t0() + ChronoDuration::minutes(20))
        );
    }

    #[tokio::test]
    async fn incremental_pages_back_only_while_everything_is_newer() {
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=25);
        let (fetcher, _) = fetcher(&source, 5);
        let since = t0() + ChronoDuration::minutes(12);

        let outcome = fetcher.fetch(&src(), FetchPlan::Incremental { since: Some(since) }).await.unwrap();

        assert_eq!(outcome.fetched().records.len(), 13);
        assert_eq!(
            source.calls(),
            vec![
                ("chan".to_string(), FetchDirection::Newest),
                ("chan".to_string(), FetchDirection::OlderThan(MessageId(21))),
                ("chan".to_string(), FetchDirection::OlderThan(MessageId(16))),
            ]
        );
    }

    #[tokio::test]
    async fn incremental_never_sends_newer_than_requests() {
        // The API can only page backward; asking for "after since" by cursor
        // would return older messages and stall the source forever.
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=5);
        let (fetcher, _) = fetcher(&source, 10);
        let since = t0() + ChronoDuration::minutes(3);

        let outcome = fetcher.fetch(&src(), FetchPlan::Incremental { since: Some(since) }).await.unwrap();

        assert!(outcome.fetched().records.iter().all(|r| r.posted_at.with_timezone(&Utc) > since));
        assert_eq!(outcome.fetched().records.len(), 2);
        assert!(source.calls().iter().all(|(_, d)| *d == FetchDirection::Newest));
    }

    #[tokio::test]
    async fn historical_pages_back_to_the_floor() {
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=30);
        let (fetcher, _) = fetcher(&source, 10);
        let floor = t0() + ChronoDuration::minutes(8);

        let outcome = fetcher.fetch(&src(), FetchPlan::Historical { floor: Some(floor) }).await.unwrap();

        let fetched = outcome.fetched();
        assert_eq!(fetched.records.len(), 22);
        assert_eq!(fetched.pages, 3);
        assert!(fetched.records.iter().all(|r| r.external_message_id.0 > 8));
    }

    #[tokio::test]
    async fn historical_respects_page_budget() {
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=100);
        let cfg = SchedulerConfig {
            max_historical_pages: 2,
            ..config(10)
        };
        let fetcher = RetryingFetcher::new(source.clone(), &cfg);

        let outcome = fetcher.fetch(&src(), FetchPlan::Historical { floor: None }).await.unwrap();

        assert_eq!(outcome.fetched().records.len(), 20);
        assert_eq!(source.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn later_page_failure_keeps_earlier_pages() {
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=30);
        source.fail_after("chan", 1, SourceError::NotFound("channel deleted".into()));
        let (fetcher, _) = fetcher(&source, 10);

        let outcome = fetcher.fetch(&src(), FetchPlan::Historical { floor: None }).await.unwrap();

        match outcome {
            FetchOutcome::Interrupted { fetched, error } => {
                assert_eq!(fetched.records.len(), 10);
                assert!(matches!(error, FetchError::Unresolvable(_)));
            }
            other => panic!("expected interrupted fetch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_channel_is_a_complete_empty_fetch() {
        let source = Arc::new(InMemorySource::new());
        source.set_messages("chan", Vec::new());
        let (fetcher, _) = fetcher(&source, 10);

        let outcome = fetcher.fetch(&src(), FetchPlan::Historical { floor: None }).await.unwrap();

        assert_eq!(outcome, FetchOutcome::Complete(Fetched { records: vec![], max_timestamp: None, pages: 1 }));
    }

    #[tokio::test]
    async fn incremental_budget_above_since_is_truncated() {
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=50);
        let cfg = SchedulerConfig {
            max_incremental_pages: 2,
            ..config(10)
        };
        let fetcher = RetryingFetcher::new(source.clone(), &cfg);
        let since = t0() + ChronoDuration::minutes(1);

        let outcome = fetcher.fetch(&src(), FetchPlan::Incremental { since: Some(since) }).await.unwrap();

        match outcome {
            FetchOutcome::Truncated { fetched, resume_before } => {
                assert_eq!(fetched.records.len(), 20);
                assert_eq!(resume_before, MessageId(31));
                assert_eq!(fetched.oldest_id(), Some(MessageId(31)));
            }
            other => panic!("expected truncated fetch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn gap_fill_budget_above_floor_is_truncated() {
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=100);
        let cfg = SchedulerConfig {
            max_historical_pages: 3,
            ..config(10)
        };
        let fetcher = RetryingFetcher::new(source.clone(), &cfg);
        let floor = t0() + ChronoDuration::minutes(5);

        let outcome = fetcher.fetch(&src(), FetchPlan::Historical { floor: Some(floor) }).await.unwrap();

        assert!(!outcome.is_complete());
        assert!(matches!(outcome, FetchOutcome::Truncated { resume_before: MessageId(71), .. }));
    }

    #[tokio::test]
    async fn resumed_fetch_starts_below_the_cursor_and_reaches_since() {
        let source = Arc::new(InMemorySource::new());
        channel(&source, 1..=50);
        let cfg = SchedulerConfig {
            max_incremental_pages: 2,
            ..config(10)
        };
        let fetcher = RetryingFetcher::new(source.clone(), &cfg);
        let since = t0() + ChronoDuration::minutes(15);

        let outcome = fetcher
            .fetch_from(&src(), FetchPlan::Incremental { since: Some(since) }, Some(MessageId(31)))
            .await
            .unwrap();

        assert!(outcome.is_complete());
        let mut ids: Vec<i64> = outcome.fetched().records.iter().map(|r| r.external_message_id.0).collect();
        ids.sort();
        assert_eq!(ids, (16..=30).collect::<Vec<_>>());
        assert_eq!(
            source.calls(),
            vec![
                ("chan".to_string(), FetchDirection::OlderThan(MessageId(31))),
                ("chan".to_string(), FetchDirection::OlderThan(MessageId(21))),
            ]
        );
    }
}

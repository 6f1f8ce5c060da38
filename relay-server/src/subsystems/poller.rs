//! Polling engine: fetch → format → dispatch → persist-cursor, per session.
//!
//! One cycle per timer tick. Every registered session is processed as its own
//! spawned task, at most `max_concurrency` at a time, under a per-session time
//! budget. A failure (fetch error, store error, timeout, panic) is captured as
//! a `SessionError` value for that session only and folded into the cycle's
//! `CycleReport`.
//!
//! Cursor rules:
//! - alerts at or below the stored cursor are dropped before dispatch
//! - alerts whose known source time is below the delivery floor are never
//!   sent, but the cursor still moves past them
//! - an empty fetch writes nothing
//! - `last_fetched`: every alert is attempted and the cursor moves to the
//!   highest fetched id whatever the send outcomes were
//! - `last_sent`: the batch stops at the first failed send and the cursor
//!   moves only past what came before it
//! - a batch that outlives the session budget stops before its next send;
//!   the cursor moves only past what was attempted

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::Instrument;
use uuid::Uuid;

use relay_core::config::{CursorPolicy, PollingConfig};
use relay_core::{
    Alert, AlertSource, DispatchChannel, MessageFormatter, Session, SessionStore, StoreError,
    UpstreamError,
};

// ============================================================================
// PUBLIC API
// ============================================================================

/// Per-cycle summary, logged after every cycle and returned by `POST /poll`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub sessions: usize,
    pub sessions_idle: usize,
    pub sessions_advanced: usize,
    pub sessions_failed: usize,
    pub alerts_fetched: usize,
    pub alerts_sent: usize,
    pub alerts_failed: usize,
    pub alerts_below_floor: usize,
    pub alerts_deferred: usize,
    pub elapsed_ms: u64,
}

impl CycleReport {
    fn record(&mut self, outcome: &SessionOutcome) {
        self.alerts_fetched += outcome.fetched;
        self.alerts_sent += outcome.sent;
        self.alerts_failed += outcome.failed;
        self.alerts_below_floor += outcome.below_floor;
        self.alerts_deferred += outcome.deferred;
        if outcome.cursor.is_some() {
            self.sessions_advanced += 1;
        } else if outcome.fetched == 0 {
            self.sessions_idle += 1;
        }
    }
}

/// What happened to one session in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutcome {
    pub fetched: usize,
    pub sent: usize,
    pub failed: usize,
    pub below_floor: usize,
    /// Left for the next cycle once the time budget ran out.
    pub deferred: usize,
    /// New cursor, if one was written.
    pub cursor: Option<i64>,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] UpstreamError),

    #[error("cursor write failed: {0}")]
    Store(#[from] StoreError),

    #[error("exceeded time budget of {seconds}s")]
    TimedOut { seconds: u64 },

    #[error("task aborted: {0}")]
    Aborted(String),
}

pub struct PollingEngine {
    store: Arc<dyn SessionStore>,
    source: Arc<dyn AlertSource>,
    channel: Arc<dyn DispatchChannel>,
    formatter: MessageFormatter,
    config: PollingConfig,
    started_at: DateTime<Utc>,
}

impl PollingEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        source: Arc<dyn AlertSource>,
        channel: Arc<dyn DispatchChannel>,
        formatter: MessageFormatter,
        config: PollingConfig,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            source,
            channel,
            formatter,
            config,
            started_at,
        }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Run one cycle over every session.
    ///
    /// Only a failure to list sessions is returned as an error; per-session
    /// failures are logged and counted in the report.
    pub async fn run_cycle(self: &Arc<Self>) -> Result<CycleReport, StoreError> {
        let cycle_span = tracing::info_span!("poll_cycle", cycle_id = %Uuid::new_v4());
        self.run_cycle_inner().instrument(cycle_span).await
    }

    async fn run_cycle_inner(self: &Arc<Self>) -> Result<CycleReport, StoreError> {
        let start = Instant::now();
        let sessions = self.store.find_all().await?;
        let mut report = CycleReport {
            sessions: sessions.len(),
            ..Default::default()
        };

        tracing::info!("Looking for alerts for {} sessions", sessions.len());

        let concurrency = self.config.max_concurrency.max(1);
        let mut results = stream::iter(sessions)
            .map(|session| {
                let engine = Arc::clone(self);
                let session_id = session.session_id.clone();
                let span = tracing::info_span!("session", session_id = %session_id);
                let handle = tokio::spawn(
                    async move { engine.process_session(&session).await }.instrument(span),
                );
                async move {
                    let result = match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(SessionError::Aborted(e.to_string())),
                    };
                    (session_id, result)
                }
            })
            .buffer_unordered(concurrency);

        while let Some((session_id, result)) = results.next().await {
            match result {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    report.sessions_failed += 1;
                    tracing::warn!(session_id = %session_id, error = %e, "Session processing failed");
                }
            }
        }

        report.elapsed_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            sessions = report.sessions,
            advanced = report.sessions_advanced,
            failed = report.sessions_failed,
            sent = report.alerts_sent,
            send_failures = report.alerts_failed,
            deferred = report.alerts_deferred,
            elapsed_ms = report.elapsed_ms,
            "Polling cycle complete"
        );

        Ok(report)
    }

    /// Fetch, dispatch and advance the cursor for one session within the
    /// configured time budget.
    pub async fn process_session(&self, session: &Session) -> Result<SessionOutcome, SessionError> {
        let budget = Duration::from_secs(self.config.session_timeout_seconds);
        self.process_session_until(session, tokio::time::Instant::now() + budget)
            .await
    }

    /// A fetch still running at `deadline` fails the session. Once sending
    /// has begun, no new send starts after `deadline`: the rest of the batch
    /// is deferred and the cursor is written for what was attempted.
    async fn process_session_until(
        &self,
        session: &Session,
        deadline: tokio::time::Instant,
    ) -> Result<SessionOutcome, SessionError> {
        let floor = session.delivery_floor(self.started_at);
        let fetch = self
            .source
            .fetch_since(&session.credentials, session.last_delivered_id, floor);
        let fetched = match tokio::time::timeout_at(deadline, fetch).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SessionError::TimedOut {
                    seconds: self.config.session_timeout_seconds,
                })
            }
        };

        let mut outcome = SessionOutcome {
            fetched: fetched.len(),
            ..Default::default()
        };

        let batch = Batch::prepare(fetched, session.last_delivered_id, floor);
        outcome.below_floor = batch.below_floor;
        if batch.ids.is_empty() {
            tracing::debug!("No pending alerts");
            return Ok(outcome);
        }

        tracing::info!(
            pending = batch.deliver.len(),
            cursor = session.last_delivered_id,
            "Sending pending alerts"
        );

        // First id the cursor must not pass.
        let mut stopped_at: Option<i64> = None;
        for (index, alert) in batch.deliver.iter().enumerate() {
            if tokio::time::Instant::now() >= deadline {
                outcome.deferred = batch.deliver.len() - index;
                tracing::warn!(
                    deferred = outcome.deferred,
                    next_alert_id = alert.id,
                    "Session time budget spent; deferring rest of batch"
                );
                stopped_at = Some(alert.id);
                break;
            }

            let text = self.formatter.render(alert);
            match self.channel.send(&session.session_id, &text).await {
                Ok(()) => outcome.sent += 1,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(alert_id = alert.id, error = %e, "Failed to dispatch alert");
                    if self.config.cursor_policy == CursorPolicy::LastSent {
                        stopped_at = Some(alert.id);
                        break;
                    }
                }
            }
        }

        let next_cursor = match stopped_at {
            Some(id) => batch.last_id_before(id),
            None => batch.last_id(),
        }
        .unwrap_or(session.last_delivered_id);

        if next_cursor > session.last_delivered_id {
            let mut updated = session.clone();
            updated.last_delivered_id = next_cursor;
            if let Err(e) = self.store.save(&updated).await {
                tracing::warn!(
                    sent = outcome.sent,
                    "Cursor write failed; these alerts will be sent again next cycle"
                );
                return Err(e.into());
            }
            outcome.cursor = Some(next_cursor);
        }

        Ok(outcome)
    }
}

/// Called from main.rs to run cycles on a fixed schedule until shutdown.
pub async fn run_polling_loop(engine: Arc<PollingEngine>, mut shutdown: broadcast::Receiver<()>) {
    let config = engine.config().clone();
    if !config.enabled {
        tracing::info!("Polling disabled via config");
        return;
    }

    let period = Duration::from_secs(config.interval_seconds.max(1));
    let first_tick =
        tokio::time::Instant::now() + Duration::from_secs(config.initial_delay_seconds);
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = config.interval_seconds,
        initial_delay_secs = config.initial_delay_seconds,
        max_concurrency = config.max_concurrency,
        cursor_policy = ?config.cursor_policy,
        "Polling loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.run_cycle().await {
                    tracing::error!(error = %e, "Polling cycle aborted: could not list sessions");
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Polling loop shutting down");
                break;
            }
        }
    }
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

/// A fetched batch after the cursor and floor checks.
#[derive(Debug, Default)]
struct Batch {
    /// Alerts to send, ascending by id.
    deliver: Vec<Alert>,
    /// Every id above the cursor, ascending, including below-floor ones.
    ids: Vec<i64>,
    below_floor: usize,
}

impl Batch {
    fn prepare(mut alerts: Vec<Alert>, cursor: i64, floor: DateTime<Utc>) -> Self {
        alerts.sort_by_key(|a| a.id);
        alerts.dedup_by_key(|a| a.id);

        let mut batch = Batch::default();
        for alert in alerts {
            if alert.id <= cursor {
                tracing::debug!(alert_id = alert.id, "Dropping alert at or below cursor");
                continue;
            }
            batch.ids.push(alert.id);
            match alert.created_at {
                Some(created_at) if created_at < floor => {
                    tracing::debug!(alert_id = alert.id, "Dropping alert older than delivery floor");
                    batch.below_floor += 1;
                }
                _ => batch.deliver.push(alert),
            }
        }
        batch
    }

    fn last_id(&self) -> Option<i64> {
        self.ids.last().copied()
    }

    fn last_id_before(&self, id: i64) -> Option<i64> {
        self.ids.iter().copied().take_while(|i| *i < id).last()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use relay_core::{
        Credentials, DispatchError, FailingComponent, MemorySessionStore, PingStatus,
    };
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // ------------------------------------------------------------------
    // Mock collaborators (no HTTP, no DB)
    // ------------------------------------------------------------------

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Behaviour {
        Honor,
        Raw,
        Fail,
        Hang,
        Panic,
    }

    /// Alert source keyed by client id. `Honor` filters by cursor and floor
    /// like the real API; `Raw` returns everything it holds.
    struct FakeSource {
        alerts: HashMap<i64, Vec<Alert>>,
        behaviour: HashMap<i64, Behaviour>,
        calls: Mutex<Vec<(i64, i64, DateTime<Utc>)>>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                alerts: HashMap::new(),
                behaviour: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with(mut self, client_id: i64, behaviour: Behaviour, alerts: Vec<Alert>) -> Self {
            self.alerts.insert(client_id, alerts);
            self.behaviour.insert(client_id, behaviour);
            self
        }

        fn calls(&self) -> Vec<(i64, i64, DateTime<Utc>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AlertSource for FakeSource {
        async fn fetch_since(
            &self,
            credentials: &Credentials,
            last_id: i64,
            floor: DateTime<Utc>,
        ) -> Result<Vec<Alert>, UpstreamError> {
            self.calls
                .lock()
                .unwrap()
                .push((credentials.client_id, last_id, floor));
            let all = self
                .alerts
                .get(&credentials.client_id)
                .cloned()
                .unwrap_or_default();
            match self
                .behaviour
                .get(&credentials.client_id)
                .copied()
                .unwrap_or(Behaviour::Honor)
            {
                Behaviour::Honor => Ok(all
                    .into_iter()
                    .filter(|a| a.id > last_id && a.created_at.map_or(true, |t| t >= floor))
                    .collect()),
                Behaviour::Raw => Ok(all),
                Behaviour::Fail => Err(UpstreamError::Api {
                    code: 500,
                    message: "upstream down".to_string(),
                }),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(all)
                }
                Behaviour::Panic => panic!("source exploded"),
            }
        }

        async fn ping(&self, _credentials: &Credentials) -> PingStatus {
            PingStatus {
                reachable: true,
                authenticated: true,
            }
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    /// Records every send; fails sends whose text contains a marker.
    struct RecordingChannel {
        sent: Mutex<Vec<(String, String)>>,
        fail_markers: HashSet<String>,
    }

    impl RecordingChannel {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_markers: HashSet::new(),
            }
        }

        fn failing_on(marker: &str) -> Self {
            let mut c = Self::new();
            c.fail_markers.insert(marker.to_string());
            c
        }

        fn sent_to(&self, destination: &str) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(d, _)| d == destination)
                .map(|(_, t)| t.clone())
                .collect()
        }
    }

    #[async_trait]
    impl DispatchChannel for RecordingChannel {
        async fn send(&self, destination: &str, text: &str) -> Result<(), DispatchError> {
            if self.fail_markers.iter().any(|m| text.contains(m.as_str())) {
                return Err(DispatchError::Rejected("channel_not_found".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((destination.to_string(), text.to_string()));
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    /// Takes a second per send, like a rate-limited Slack destination.
    struct SlowChannel {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DispatchChannel for SlowChannel {
        async fn send(&self, _destination: &str, text: &str) -> Result<(), DispatchError> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    /// Wraps the memory store, counting writes and optionally failing them.
    struct CountingStore {
        inner: MemorySessionStore,
        saves: AtomicUsize,
        fail_saves: bool,
        fail_list: bool,
    }

    impl CountingStore {
        fn new(sessions: Vec<Session>) -> Self {
            Self {
                inner: MemorySessionStore::with_sessions(sessions),
                saves: AtomicUsize::new(0),
                fail_saves: false,
                fail_list: false,
            }
        }

        fn saves(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }

        async fn cursor(&self, session_id: &str) -> i64 {
            self.inner
                .find_by_id(session_id)
                .await
                .unwrap()
                .map(|s| s.last_delivered_id)
                .unwrap_or(-1)
        }
    }

    #[async_trait]
    impl SessionStore for CountingStore {
        async fn find_all(&self) -> Result<Vec<Session>, StoreError> {
            if self.fail_list {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            self.inner.find_all().await
        }

        async fn find_by_id(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
            self.inner.find_by_id(session_id).await
        }

        async fn save(&self, session: &Session) -> Result<(), StoreError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail_saves {
                return Err(StoreError::Unavailable("write timeout".to_string()));
            }
            self.inner.save(session).await
        }

        async fn delete_by_id(&self, session_id: &str) -> Result<bool, StoreError> {
            self.inner.delete_by_id(session_id).await
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    // ------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------

    fn engine_start() -> DateTime<Utc> {
        Utc::now() - ChronoDuration::hours(1)
    }

    fn session(id: &str, client_id: i64, cursor: i64, registered_at: DateTime<Utc>) -> Session {
        let mut s = Session::new(
            id,
            Credentials {
                client_id,
                api_key: format!("key-{}", client_id),
            },
            registered_at,
        );
        s.last_delivered_id = cursor;
        s
    }

    fn alert(id: i64, subject: &str) -> Alert {
        Alert {
            id,
            subject: subject.to_string(),
            failing_components: vec![FailingComponent {
                component_id: id * 10,
                label: format!("rig-{}", id),
                diagnosis_lines: vec!["offline".to_string()],
            }],
            created_at: None,
            degraded: false,
        }
    }

    fn alert_at(id: i64, created_at: DateTime<Utc>) -> Alert {
        Alert {
            created_at: Some(created_at),
            ..alert(id, &format!("alert {}", id))
        }
    }

    fn config(policy: CursorPolicy) -> PollingConfig {
        PollingConfig {
            enabled: true,
            initial_delay_seconds: 0,
            interval_seconds: 60,
            max_concurrency: 4,
            session_timeout_seconds: 5,
            max_components: 10,
            cursor_policy: policy,
        }
    }

    fn engine(
        store: Arc<CountingStore>,
        source: Arc<FakeSource>,
        channel: Arc<RecordingChannel>,
        policy: CursorPolicy,
        started_at: DateTime<Utc>,
    ) -> Arc<PollingEngine> {
        Arc::new(PollingEngine::new(
            store,
            source,
            channel,
            MessageFormatter::new("https://dashboard.example.test", 10),
            config(policy),
            started_at,
        ))
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_delivers_batch_in_order_and_advances_cursor() {
        let started = engine_start();
        let store = Arc::new(CountingStore::new(vec![session("C1", 1, 5, started)]));
        let source = Arc::new(FakeSource::new().with(
            1,
            Behaviour::Honor,
            vec![alert(6, "six"), alert(7, "seven"), alert(8, "eight")],
        ));
        let channel = Arc::new(RecordingChannel::new());
        let engine = engine(store.clone(), source, channel.clone(), CursorPolicy::LastFetched, started);

        let report = engine.run_cycle().await.unwrap();

        let sent = channel.sent_to("C1");
        assert_eq!(sent.len(), 3);
        assert!(sent[0].contains("*six*"));
        assert!(sent[1].contains("*seven*"));
        assert!(sent[2].contains("*eight*"));
        assert_eq!(store.cursor("C1").await, 8);
        assert_eq!(report.alerts_sent, 3);
        assert_eq!(report.sessions_advanced, 1);
    }

    #[tokio::test]
    async fn test_empty_fetch_writes_nothing() {
        let started = engine_start();
        let original = session("C1", 1, 5, started);
        let store = Arc::new(CountingStore::new(vec![original.clone()]));
        let source = Arc::new(FakeSource::new().with(1, Behaviour::Honor, vec![]));
        let channel = Arc::new(RecordingChannel::new());
        let engine = engine(store.clone(), source, channel.clone(), CursorPolicy::LastFetched, started);

        let report = engine.run_cycle().await.unwrap();

        assert_eq!(store.saves(), 0);
        assert_eq!(store.find_by_id("C1").await.unwrap(), Some(original));
        assert!(channel.sent_to("C1").is_empty());
        assert_eq!(report.sessions_idle, 1);
    }

    #[tokio::test]
    async fn test_second_cycle_does_not_replay() {
        let started = engine_start();
        let store = Arc::new(CountingStore::new(vec![session("C1", 1, 0, started)]));
        let source = Arc::new(
            FakeSource::new().with(1, Behaviour::Honor, vec![alert(1, "one"), alert(2, "two")]),
        );
        let channel = Arc::new(RecordingChannel::new());
        let engine = engine(store.clone(), source.clone(), channel.clone(), CursorPolicy::LastFetched, started);

        engine.run_cycle().await.unwrap();
        engine.run_cycle().await.unwrap();

        assert_eq!(channel.sent_to("C1").len(), 2);
        assert_eq!(store.saves(), 1);
        let calls = source.calls();
        assert_eq!(calls[0].1, 0);
        assert_eq!(calls[1].1, 2);
    }

    #[tokio::test]
    async fn test_stale_alerts_from_source_are_not_resent() {
        let started = engine_start();
        let store = Arc::new(CountingStore::new(vec![session("C1", 1, 5, started)]));
        let source = Arc::new(FakeSource::new().with(
            1,
            Behaviour::Raw,
            vec![alert(4, "old"), alert(5, "current"), alert(6, "new")],
        ));
        let channel = Arc::new(RecordingChannel::new());
        let engine = engine(store.clone(), source, channel.clone(), CursorPolicy::LastFetched, started);

        engine.run_cycle().await.unwrap();

        let sent = channel.sent_to("C1");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("*new*"));
        assert_eq!(store.cursor("C1").await, 6);
    }

    #[tokio::test]
    async fn test_cursor_never_decreases() {
        let started = engine_start();
        let store = Arc::new(CountingStore::new(vec![session("C1", 1, 10, started)]));
        let source = Arc::new(
            FakeSource::new().with(1, Behaviour::Raw, vec![alert(3, "three"), alert(7, "seven")]),
        );
        let channel = Arc::new(RecordingChannel::new());
        let engine = engine(store.clone(), source, channel.clone(), CursorPolicy::LastFetched, started);

        engine.run_cycle().await.unwrap();

        assert_eq!(store.cursor("C1").await, 10);
        assert_eq!(store.saves(), 0);
        assert!(channel.sent_to("C1").is_empty());
    }

    #[tokio::test]
    async fn test_floor_uses_later_registration_and_filters_older_alerts() {
        let started = engine_start();
        let registered = started + ChronoDuration::minutes(30);
        let store = Arc::new(CountingStore::new(vec![session("C1", 1, 0, registered)]));
        let source = Arc::new(FakeSource::new().with(
            1,
            Behaviour::Raw,
            vec![
                alert_at(1, started + ChronoDuration::minutes(10)),
                alert_at(2, registered + ChronoDuration::minutes(1)),
            ],
        ));
        let channel = Arc::new(RecordingChannel::new());
        let engine = engine(store.clone(), source.clone(), channel.clone(), CursorPolicy::LastFetched, started);

        let report = engine.run_cycle().await.unwrap();

        assert_eq!(source.calls()[0].2, registered);
        let sent = channel.sent_to("C1");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("alert 2"));
        assert_eq!(report.alerts_below_floor, 1);
        assert_eq!(store.cursor("C1").await, 2);
    }

    #[tokio::test]
    async fn test_floor_uses_engine_start_for_old_registrations() {
        let started = engine_start();
        let registered = started - ChronoDuration::days(2);
        let store = Arc::new(CountingStore::new(vec![session("C1", 1, 0, registered)]));
        let source = Arc::new(FakeSource::new().with(
            1,
            Behaviour::Honor,
            vec![alert_at(1, started - ChronoDuration::days(1))],
        ));
        let channel = Arc::new(RecordingChannel::new());
        let engine = engine(store.clone(), source.clone(), channel.clone(), CursorPolicy::LastFetched, started);

        engine.run_cycle().await.unwrap();

        assert_eq!(source.calls()[0].2, started);
        assert!(channel.sent_to("C1").is_empty());
        assert_eq!(store.saves(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_isolated_to_its_session() {
        let started = engine_start();
        let store = Arc::new(CountingStore::new(vec![
            session("A", 1, 0, started),
            session("B", 2, 0, started),
        ]));
        let source = Arc::new(
            FakeSource::new()
                .with(1, Behaviour::Fail, vec![])
                .with(2, Behaviour::Honor, vec![alert(3, "b-three")]),
        );
        let channel = Arc::new(RecordingChannel::new());
        let engine = engine(store.clone(), source, channel.clone(), CursorPolicy::LastFetched, started);

        let report = engine.run_cycle().await.unwrap();

        assert_eq!(report.sessions_failed, 1);
        assert_eq!(store.cursor("A").await, 0);
        assert_eq!(store.cursor("B").await, 3);
        assert_eq!(channel.sent_to("B").len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_session_is_isolated() {
        let started = engine_start();
        let store = Arc::new(CountingStore::new(vec![
            session("A", 1, 0, started),
            session("B", 2, 0, started),
        ]));
        let source = Arc::new(
            FakeSource::new()
                .with(1, Behaviour::Panic, vec![])
                .with(2, Behaviour::Honor, vec![alert(1, "b-one")]),
        );
        let channel = Arc::new(RecordingChannel::new());
        let engine = engine(store.clone(), source, channel.clone(), CursorPolicy::LastFetched, started);

        let report = engine.run_cycle().await.unwrap();

        assert_eq!(report.sessions_failed, 1);
        assert_eq!(store.cursor("B").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_session_times_out_without_blocking_others() {
        let started = engine_start();
        let store = Arc::new(CountingStore::new(vec![
            session("A", 1, 0, started),
            session("B", 2, 0, started),
        ]));
        let source = Arc::new(
            FakeSource::new()
                .with(1, Behaviour::Hang, vec![alert(1, "a-one")])
                .with(2, Behaviour::Honor, vec![alert(1, "b-one")]),
        );
        let channel = Arc::new(RecordingChannel::new());
        let engine = engine(store.clone(), source, channel.clone(), CursorPolicy::LastFetched, started);

        let report = engine.run_cycle().await.unwrap();

        assert_eq!(report.sessions_failed, 1);
        assert_eq!(store.cursor("A").await, 0);
        assert_eq!(store.cursor("B").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_beyond_budget_advances_across_cycles_without_resending() {
        let started = engine_start();
        let store = Arc::new(CountingStore::new(vec![session("C1", 1, 0, started)]));
        let backlog: Vec<Alert> = (1..=40).map(|id| alert(id, &format!("alert {}", id))).collect();
        let source = Arc::new(FakeSource::new().with(1, Behaviour::Honor, backlog));
        let channel = Arc::new(SlowChannel {
            sent: Mutex::new(Vec::new()),
        });
        let engine = Arc::new(PollingEngine::new(
            store.clone(),
            source,
            channel.clone(),
            MessageFormatter::new("https://dashboard.example.test", 10),
            PollingConfig {
                session_timeout_seconds: 30,
                ..config(CursorPolicy::LastFetched)
            },
            started,
        ));

        let first = engine.run_cycle().await.unwrap();
        let after_first = store.cursor("C1").await;
        assert_eq!(first.sessions_failed, 0);
        assert!(first.alerts_sent > 0 && first.alerts_sent < 40);
        assert_eq!(first.alerts_deferred, 40 - first.alerts_sent);
        assert_eq!(after_first, first.alerts_sent as i64);

        let second = engine.run_cycle().await.unwrap();
        assert_eq!(second.sessions_failed, 0);
        assert_eq!(second.alerts_deferred, 0);
        assert_eq!(store.cursor("C1").await, 40);

        let sent = channel.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 40);
        let unique: HashSet<&String> = sent.iter().collect();
        assert_eq!(unique.len(), 40);
        assert!(sent[0].contains("*alert 1*"));
        assert!(sent[39].contains("*alert 40*"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_sent_policy_defers_unattempted_alerts() {
        let started = engine_start();
        let store = Arc::new(CountingStore::new(vec![session("C1", 1, 0, started)]));
        let backlog: Vec<Alert> = (1..=10).map(|id| alert(id, &format!("alert {}", id))).collect();
        let source = Arc::new(FakeSource::new().with(1, Behaviour::Honor, backlog));
        let channel = Arc::new(SlowChannel {
            sent: Mutex::new(Vec::new()),
        });
        let engine = Arc::new(PollingEngine::new(
            store.clone(),
            source,
            channel.clone(),
            MessageFormatter::new("https://dashboard.example.test", 10),
            PollingConfig {
                session_timeout_seconds: 3,
                ..config(CursorPolicy::LastSent)
            },
            started,
        ));

        let report = engine.run_cycle().await.unwrap();

        let sent = channel.sent.lock().unwrap().len();
        assert!(sent > 0 && sent < 10);
        assert_eq!(report.alerts_deferred, 10 - sent);
        assert_eq!(store.cursor("C1").await, sent as i64);
    }

    #[tokio::test]
    async fn test_send_failure_continues_batch_and_still_advances() {
        let started = engine_start();
        let store = Arc::new(CountingStore::new(vec![session("C1", 1, 0, started)]));
        let source = Arc::new(FakeSource::new().with(
            1,
            Behaviour::Honor,
            vec![alert(1, "one"), alert(2, "[undeliverable]"), alert(3, "three")],
        ));
        let channel = Arc::new(RecordingChannel::failing_on("[undeliverable]"));
        let engine = engine(store.clone(), source, channel.clone(), CursorPolicy::LastFetched, started);

        let report = engine.run_cycle().await.unwrap();

        assert_eq!(channel.sent_to("C1").len(), 2);
        assert_eq!(report.alerts_failed, 1);
        assert_eq!(store.cursor("C1").await, 3);
    }

    #[tokio::test]
    async fn test_last_sent_policy_stops_at_first_failure() {
        let started = engine_start();
        let store = Arc::new(CountingStore::new(vec![session("C1", 1, 0, started)]));
        let source = Arc::new(FakeSource::new().with(
            1,
            Behaviour::Honor,
            vec![alert(1, "one"), alert(2, "[undeliverable]"), alert(3, "three")],
        ));
        let channel = Arc::new(RecordingChannel::failing_on("[undeliverable]"));
        let engine = engine(store.clone(), source, channel.clone(), CursorPolicy::LastSent, started);

        engine.run_cycle().await.unwrap();

        let sent = channel.sent_to("C1");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("*one*"));
        assert_eq!(store.cursor("C1").await, 1);
    }

    #[tokio::test]
    async fn test_last_sent_policy_without_progress_writes_nothing() {
        let started = engine_start();
        let store = Arc::new(CountingStore::new(vec![session("C1", 1, 0, started)]));
        let source = Arc::new(
            FakeSource::new().with(1, Behaviour::Honor, vec![alert(1, "[undeliverable]")]),
        );
        let channel = Arc::new(RecordingChannel::failing_on("[undeliverable]"));
        let engine = engine(store.clone(), source, channel, CursorPolicy::LastSent, started);

        engine.run_cycle().await.unwrap();

        assert_eq!(store.saves(), 0);
        assert_eq!(store.cursor("C1").await, 0);
    }

    #[tokio::test]
    async fn test_store_write_failure_is_reported_per_session() {
        let started = engine_start();
        let mut counting = CountingStore::new(vec![session("C1", 1, 0, started)]);
        counting.fail_saves = true;
        let store = Arc::new(counting);
        let source = Arc::new(FakeSource::new().with(1, Behaviour::Honor, vec![alert(1, "one")]));
        let channel = Arc::new(RecordingChannel::new());
        let engine = engine(store.clone(), source, channel.clone(), CursorPolicy::LastFetched, started);

        let report = engine.run_cycle().await.unwrap();

        assert_eq!(report.sessions_failed, 1);
        assert_eq!(channel.sent_to("C1").len(), 1);
        assert_eq!(store.cursor("C1").await, 0);
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_cycle() {
        let started = engine_start();
        let mut counting = CountingStore::new(vec![]);
        counting.fail_list = true;
        let store = Arc::new(counting);
        let engine = engine(
            store,
            Arc::new(FakeSource::new()),
            Arc::new(RecordingChannel::new()),
            CursorPolicy::LastFetched,
            started,
        );

        assert!(engine.run_cycle().await.is_err());
    }

    #[test]
    fn test_batch_sorts_dedups_and_tracks_ids() {
        let floor = Utc::now();
        let batch = Batch::prepare(
            vec![alert(9, "b"), alert(7, "a"), alert(9, "b"), alert(2, "old")],
            5,
            floor,
        );
        assert_eq!(batch.ids, vec![7, 9]);
        assert_eq!(batch.deliver.len(), 2);
        assert_eq!(batch.last_id(), Some(9));
        assert_eq!(batch.last_id_before(9), Some(7));
        assert_eq!(batch.last_id_before(7), None);
    }
}

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use agency_core::{
    DedupPolicy, ExpiryScanner, ExpiryWindow, PolicyStore, ReminderEmitter, ReminderStore,
    ScanError,
};
use agency_util::{Cadence, ReminderConfig};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

const DAILY_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Background worker that turns policies nearing expiration into reminders.
///
/// Ticks never overlap: a trigger that fires while a tick is still running is
/// dropped. Every failure is contained inside the tick that produced it.
#[derive(Clone)]
pub struct ExpiryMonitor {
    scanner: ExpiryScanner,
    emitter: ReminderEmitter,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    cadence: Cadence,
    timezone: Tz,
    tick_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl ExpiryMonitor {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        reminders: Arc<dyn ReminderStore>,
        config: &ReminderConfig,
    ) -> Self {
        let dedup = config
            .dedup_horizon_days
            .map_or(DedupPolicy::EveryTick, DedupPolicy::within_days);
        Self {
            scanner: ExpiryScanner::new(policies, config.lookahead_days),
            emitter: ReminderEmitter::new(reminders, dedup),
            clock: Arc::new(Utc::now),
            cadence: config.cadence,
            timezone: config.timezone,
            tick_timeout: config.tick_timeout,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Overrides the clock used to derive "today".
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the trigger loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        info!(
            stage = "scheduler",
            cadence = %self.cadence.describe(),
            timezone = %self.timezone,
            lookahead_days = self.scanner.lookahead_days(),
            dedup = self.emitter.dedup().as_str(),
            "expiry monitor started"
        );

        match self.cadence {
            Cadence::Every(period) => {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    self.trigger();
                }
            }
            Cadence::DailyAt(_) => {
                let mut after = (self.clock)();
                loop {
                    let Some(target) = self.cadence.next_after(after, self.timezone) else {
                        sleep(DAILY_RETRY_DELAY).await;
                        after = (self.clock)();
                        continue;
                    };
                    sleep(until(target, (self.clock)())).await;
                    self.trigger();
                    // The next target is strictly after the one just fired.
                    after = target;
                }
            }
        }
    }

    /// Starts a tick in the background unless one is already running.
    ///
    /// Returns `None` when the trigger was dropped.
    pub fn trigger(&self) -> Option<tokio::task::JoinHandle<()>> {
        let Some(guard) = RunGuard::acquire(&self.running) else {
            counter!("reminder_ticks_dropped_total").increment(1);
            warn!(stage = "scheduler", "previous tick still running; trigger dropped");
            return None;
        };

        let monitor = self.clone();
        let span = info_span!("reminder_tick", tick_id = %Uuid::new_v4());
        Some(tokio::spawn(
            async move {
                let _guard = guard;
                let started = Instant::now();
                let worker = monitor.clone();
                let result = match tokio::spawn(
                    async move { worker.run_once().await }.in_current_span(),
                )
                .await
                {
                    Ok(result) => result,
                    Err(join_err) => Err(TickError::Internal(join_err.to_string())),
                };
                monitor.record(&result, started.elapsed());
            }
            .instrument(span),
        ))
    }

    /// Executes one scan-and-emit cycle bounded by the tick deadline.
    pub async fn run_once(&self) -> Result<TickReport, TickError> {
        match timeout(self.tick_timeout, self.tick()).await {
            Ok(result) => result,
            Err(_) => Err(TickError::Timeout(self.tick_timeout)),
        }
    }

    async fn tick(&self) -> Result<TickReport, TickError> {
        let now = (self.clock)();
        let today = now.with_timezone(&self.timezone).date_naive();
        let window = self.scanner.window(today);

        let scan = self.scanner.scan(today).await?;
        for dangling in &scan.dangling {
            warn!(
                stage = "scanner",
                policy_id = dangling.policy_id,
                policy_number = %dangling.policy_number,
                client_id = dangling.client_id,
                "policy references a missing client; skipped"
            );
        }
        counter!("expiry_dangling_references_total").increment(scan.dangling.len() as u64);

        let emitted = self.emitter.emit_all(&scan.candidates, now).await;
        for reminder in &emitted.inserted {
            info!(
                stage = "emitter",
                reminder_id = reminder.id,
                message = %reminder.message,
                "saved reminder"
            );
        }
        for failure in &emitted.failed {
            warn!(
                stage = "emitter",
                policy_number = %failure.policy_number,
                error = %failure.error,
                "failed to save reminder; candidate dropped"
            );
        }
        counter!("reminders_emitted_total").increment(emitted.inserted.len() as u64);
        counter!("reminders_suppressed_total").increment(emitted.suppressed.len() as u64);
        counter!("reminder_write_failures_total").increment(emitted.failed.len() as u64);

        Ok(TickReport {
            today,
            window,
            candidates: scan.candidates.len(),
            dangling: scan.dangling.len(),
            inserted: emitted.inserted.len(),
            suppressed: emitted.suppressed.len(),
            failed: emitted.failed.len(),
        })
    }

    fn record(&self, result: &Result<TickReport, TickError>, elapsed: Duration) {
        histogram!("reminder_tick_seconds").record(elapsed.as_secs_f64());
        match result {
            Ok(report) => {
                counter!("reminder_ticks_total", "result" => "ok").increment(1);
                info!(
                    stage = "scheduler",
                    today = %report.today,
                    window_end = %report.window.end,
                    candidates = report.candidates,
                    inserted = report.inserted,
                    suppressed = report.suppressed,
                    failed = report.failed,
                    dangling = report.dangling,
                    duration_secs = elapsed.as_secs_f64(),
                    "expiry tick completed"
                );
            }
            Err(err) => {
                let kind = err.kind().as_str();
                counter!("reminder_ticks_total", "result" => kind).increment(1);
                error!(stage = "scheduler", kind, error = %err, "expiry tick failed");
            }
        }
    }
}

fn until(target: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

/// Holds the running flag for the lifetime of a tick, including unwinding.
struct RunGuard(Arc<AtomicBool>);

impl RunGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Counts produced by a successful tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub today: NaiveDate,
    pub window: ExpiryWindow,
    pub candidates: usize,
    pub dangling: usize,
    pub inserted: usize,
    pub suppressed: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum TickError {
    #[error("expiry scan failed: {0}")]
    Scan(#[from] ScanError),
    #[error("tick exceeded its {0:?} deadline")]
    Timeout(Duration),
    #[error("tick aborted: {0}")]
    Internal(String),
}

impl TickError {
    pub fn kind(&self) -> TickFailureKind {
        match self {
            Self::Scan(ScanError::StoreUnavailable(_)) => TickFailureKind::StoreUnavailable,
            Self::Timeout(_) => TickFailureKind::Timeout,
            Self::Internal(_) => TickFailureKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFailureKind {
    StoreUnavailable,
    Timeout,
    Internal,
}

impl TickFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StoreUnavailable => "store_unavailable",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agency_core::memory::MemoryStore;
    use agency_core::types::ExpiringPolicy;
    use agency_core::StoreError;
    use agency_storage::{Database, NewClient, NewPolicy};
    use async_trait::async_trait;
    use chrono::NaiveTime;
    use tokio::sync::Notify;

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
    }

    fn fixed_clock(value: &str) -> Arc<dyn Fn() -> DateTime<Utc> + Send + Sync> {
        let now = DateTime::parse_from_rfc3339(value)
            .unwrap()
            .with_timezone(&Utc);
        Arc::new(move || now)
    }

    fn config() -> ReminderConfig {
        ReminderConfig {
            cadence: Cadence::Every(Duration::from_secs(20)),
            ..ReminderConfig::default()
        }
    }

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");

        let clients = db.clients();
        let alice = clients
            .insert(NewClient {
                name: "Alice",
                email: "alice@example.com",
                phone: None,
            })
            .await
            .expect("insert alice");
        let bob = clients
            .insert(NewClient {
                name: "Bob",
                email: "bob@example.com",
                phone: Some("555-0101"),
            })
            .await
            .expect("insert bob");

        let policies = db.policies();
        for (client_id, number, expiry) in [
            (alice, "P1", "2024-01-01"),
            (bob, "P2", "2024-01-31"),
            (alice, "P3", "2024-02-01"),
            (bob, "P4", "2023-12-31"),
        ] {
            policies
                .insert(NewPolicy {
                    client_id,
                    policy_number: number,
                    insurer: "Acme Mutual",
                    policy_type: Some("home"),
                    expiry_date: date(expiry),
                })
                .await
                .expect("insert policy");
        }
        db
    }

    fn sqlite_monitor(db: &Database, config: &ReminderConfig) -> ExpiryMonitor {
        let store = Arc::new(db.clone());
        ExpiryMonitor::new(store.clone(), store, config)
    }

    fn seeded_store(expiry: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.add_client(1, "Alice");
        store.add_policy(1, 1, "P1", date(expiry));
        store
    }

    fn memory_monitor(store: &Arc<MemoryStore>) -> ExpiryMonitor {
        ExpiryMonitor::new(store.clone(), store.clone(), &config())
            .with_clock(fixed_clock("2024-01-01T09:00:00Z"))
    }

    /// Policy store that parks every query until released.
    struct ParkedStore {
        release: Notify,
    }

    #[async_trait]
    impl PolicyStore for ParkedStore {
        async fn expiring_between(
            &self,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<ExpiringPolicy>, StoreError> {
            self.release.notified().await;
            Ok(Vec::new())
        }
    }

    struct PanickingStore;

    #[async_trait]
    impl PolicyStore for PanickingStore {
        async fn expiring_between(
            &self,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<ExpiringPolicy>, StoreError> {
            panic!("corrupt row");
        }
    }

    #[tokio::test]
    async fn run_once_emits_reminders_for_window_boundaries() {
        let db = setup_db().await;
        let monitor =
            sqlite_monitor(&db, &config()).with_clock(fixed_clock("2024-01-01T09:00:00Z"));

        let report = monitor.run_once().await.expect("tick succeeds");

        assert_eq!(report.today, date("2024-01-01"));
        assert_eq!(report.window.end, date("2024-01-31"));
        assert_eq!(report.inserted, 2);

        let recent = db.reminders().list_recent(5).await.expect("list recent");
        let mut messages: Vec<_> = recent.into_iter().map(|r| r.message).collect();
        messages.sort();
        assert_eq!(
            messages,
            vec![
                "Reminder: Policy #P1 for client Alice is nearing expiration.".to_string(),
                "Reminder: Policy #P2 for client Bob is nearing expiration.".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn consecutive_ticks_within_a_day_are_idempotent() {
        let db = setup_db().await;
        let first = sqlite_monitor(&db, &config()).with_clock(fixed_clock("2024-01-01T09:00:00Z"));
        let second =
            sqlite_monitor(&db, &config()).with_clock(fixed_clock("2024-01-01T21:00:00Z"));

        first.run_once().await.expect("first tick");
        let report = second.run_once().await.expect("second tick");

        assert_eq!(report.inserted, 0);
        assert_eq!(report.suppressed, 2);
        assert_eq!(
            db.reminders().list_recent(10).await.expect("list").len(),
            2
        );
    }

    #[tokio::test]
    async fn every_tick_mode_re_emits_on_each_tick() {
        let db = setup_db().await;
        let every_tick = ReminderConfig {
            dedup_horizon_days: None,
            ..config()
        };
        let monitor = sqlite_monitor(&db, &every_tick).with_clock(fixed_clock("2024-01-01T09:00:00Z"));

        monitor.run_once().await.expect("first tick");
        monitor.run_once().await.expect("second tick");

        assert_eq!(
            db.reminders().list_recent(10).await.expect("list").len(),
            4
        );
    }

    #[tokio::test]
    async fn today_follows_configured_timezone() {
        let db = setup_db().await;
        let tokyo = ReminderConfig {
            timezone: chrono_tz::Asia::Tokyo,
            ..config()
        };
        // 2024-01-01T15:30Z is already 2024-01-02 in Tokyo: P1 drops out, P3 comes in.
        let monitor = sqlite_monitor(&db, &tokyo).with_clock(fixed_clock("2024-01-01T15:30:00Z"));

        let report = monitor.run_once().await.expect("tick succeeds");

        assert_eq!(report.today, date("2024-01-02"));
        assert_eq!(report.window.end, date("2024-02-01"));
        let numbers: Vec<_> = db
            .reminders()
            .list_recent(5)
            .await
            .expect("list recent")
            .into_iter()
            .filter_map(|r| r.policy_number)
            .collect();
        assert_eq!(numbers.len(), 2);
        assert!(numbers.contains(&"P2".to_string()));
        assert!(numbers.contains(&"P3".to_string()));
    }

    #[tokio::test]
    async fn dangling_reference_skips_only_that_policy() {
        let store = Arc::new(MemoryStore::new());
        store.add_client(1, "Alice");
        store.add_policy(1, 1, "P1", date("2024-01-02"));
        store.add_policy(2, 7, "P2", date("2024-01-03"));
        store.add_policy(3, 1, "P3", date("2024-01-04"));

        let report = memory_monitor(&store).run_once().await.expect("tick");

        assert_eq!(report.candidates, 2);
        assert_eq!(report.dangling, 1);
        assert_eq!(store.reminders().len(), 2);
    }

    #[tokio::test]
    async fn write_failure_keeps_remaining_candidates() {
        let store = Arc::new(MemoryStore::new());
        store.add_client(1, "Alice");
        for (id, number) in [(1, "P1"), (2, "P2"), (3, "P3")] {
            store.add_policy(id, 1, number, date("2024-01-10"));
        }
        store.fail_inserts_for("P1");

        let report = memory_monitor(&store).run_once().await.expect("tick");

        assert_eq!(report.failed, 1);
        assert_eq!(report.inserted, 2);
        let numbers: Vec<_> = store
            .reminders()
            .into_iter()
            .filter_map(|r| r.policy_number)
            .collect();
        assert_eq!(numbers, vec!["P2".to_string(), "P3".to_string()]);
    }

    #[tokio::test]
    async fn store_outage_fails_tick_and_next_tick_recovers() {
        let store = Arc::new(MemoryStore::new());
        store.add_client(1, "Alice");
        store.add_policy(1, 1, "P1", date("2024-01-05"));
        let monitor = memory_monitor(&store);

        store.fail_queries(true);
        let err = monitor.run_once().await.expect_err("tick should fail");
        assert_eq!(err.kind(), TickFailureKind::StoreUnavailable);
        assert!(store.reminders().is_empty());

        store.clear_failures();
        let report = monitor.run_once().await.expect("tick recovers");
        assert_eq!(report.inserted, 1);
    }

    #[tokio::test]
    async fn default_horizon_covers_expiry_day() {
        let store = seeded_store("2024-01-31");
        let defaults = ReminderConfig::default();
        let day_zero = ExpiryMonitor::new(store.clone(), store.clone(), &defaults)
            .with_clock(fixed_clock("2024-01-01T09:00:00.005Z"));
        let expiry_day = ExpiryMonitor::new(store.clone(), store.clone(), &defaults)
            .with_clock(fixed_clock("2024-01-31T09:00:00.010Z"));

        let first = day_zero.run_once().await.expect("day zero tick");
        let last = expiry_day.run_once().await.expect("expiry day tick");

        assert_eq!(first.inserted, 1);
        assert_eq!(last.inserted, 0);
        assert_eq!(last.suppressed, 1);
        assert_eq!(store.reminders().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_loop_keeps_ticking_after_failed_tick() {
        let store = seeded_store("2024-01-05");
        store.fail_queries(true);
        let every_tick = ReminderConfig {
            dedup_horizon_days: None,
            ..config()
        };
        let handle = ExpiryMonitor::new(store.clone(), store.clone(), &every_tick)
            .with_clock(fixed_clock("2024-01-01T09:00:00Z"))
            .spawn();

        // First tick fires immediately and fails.
        sleep(Duration::from_secs(1)).await;
        assert!(store.reminders().is_empty());

        store.clear_failures();
        sleep(Duration::from_secs(41)).await;
        assert_eq!(store.reminders().len(), 2, "ticks at 20s and 40s");

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn daily_loop_fires_once_per_target() {
        let store = seeded_store("2024-01-05");
        let daily = ReminderConfig {
            cadence: Cadence::DailyAt(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
            dedup_horizon_days: None,
            ..config()
        };
        // Wall clock stuck one minute before the target.
        let handle = ExpiryMonitor::new(store.clone(), store.clone(), &daily)
            .with_clock(fixed_clock("2024-01-01T08:59:00Z"))
            .spawn();

        sleep(Duration::from_secs(59)).await;
        assert!(store.reminders().is_empty());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(store.reminders().len(), 1);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(store.reminders().len(), 1, "target already fired");

        sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(store.reminders().len(), 2);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tick_is_abandoned_with_timeout() {
        let policies = Arc::new(ParkedStore {
            release: Notify::new(),
        });
        let reminders = Arc::new(MemoryStore::new());
        let monitor = ExpiryMonitor::new(policies, reminders, &config());

        let err = monitor.run_once().await.expect_err("tick should time out");

        assert_eq!(err.kind(), TickFailureKind::Timeout);
        assert!(matches!(err, TickError::Timeout(d) if d == Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn trigger_while_running_is_dropped() {
        let policies = Arc::new(ParkedStore {
            release: Notify::new(),
        });
        let reminders = Arc::new(MemoryStore::new());
        let monitor = ExpiryMonitor::new(policies.clone(), reminders, &config());

        let running = monitor.trigger().expect("first trigger starts a tick");
        assert!(monitor.trigger().is_none(), "overlapping trigger is dropped");

        policies.release.notify_one();
        running.await.expect("tick task completes");

        let next = monitor.trigger().expect("monitor is idle again");
        policies.release.notify_one();
        next.await.expect("tick task completes");
    }

    #[tokio::test]
    async fn panicking_tick_is_contained() {
        let monitor = ExpiryMonitor::new(
            Arc::new(PanickingStore),
            Arc::new(MemoryStore::new()),
            &config(),
        );

        let handle = monitor.trigger().expect("trigger starts a tick");
        handle.await.expect("outer task survives the panic");

        assert!(monitor.trigger().is_some(), "guard released after panic");
    }
}

//! Periodic job runner (spec C12), grounded on `original_source/moves/engine/scheduler.py`'s
//! job registry / retry-backoff shape and `trading-agent::main`'s
//! `tokio::time::interval` + `tokio::select!` run loop. No APScheduler
//! equivalent exists in the corpus, so triggers are matched by hand against
//! a `chrono_tz` clock rather than pulling in a cron crate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use dashmap::DashMap;
use sqlx::Row;

use moves_store::Store;

pub const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF_SECS: [u64; 2] = [1, 2];

pub type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub enum Trigger {
    /// Minute/hour/weekday sets, matched in `tz`. Empty `weekdays` means any day.
    Cron { minutes: Vec<u32>, hours: Vec<u32>, weekdays: Vec<Weekday>, tz: Tz },
    Interval(StdDuration),
}

impl Trigger {
    pub fn cron(minutes: &[u32], hours: &[u32], weekdays: &[Weekday], tz: Tz) -> Self {
        Trigger::Cron { minutes: minutes.to_vec(), hours: hours.to_vec(), weekdays: weekdays.to_vec(), tz }
    }

    pub fn describe(&self) -> String {
        match self {
            Trigger::Cron { minutes, hours, weekdays, tz } => {
                let days = if weekdays.is_empty() {
                    "*".to_string()
                } else {
                    weekdays.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",")
                };
                format!(
                    "cron min={:?} hour={:?} dow={} tz={}",
                    minutes, hours, days, tz
                )
            }
            Trigger::Interval(d) => format!("interval {}s", d.as_secs()),
        }
    }

    fn cron_matches(minutes: &[u32], hours: &[u32], weekdays: &[Weekday], now: &DateTime<Tz>) -> bool {
        minutes.contains(&now.minute())
            && hours.contains(&now.hour())
            && (weekdays.is_empty() || weekdays.contains(&now.weekday()))
    }

    /// `now` is the wall-clock instant (in UTC); `last_run` is the previous
    /// firing, if any. A cron trigger only fires once per matching minute.
    fn is_due(&self, now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> bool {
        match self {
            Trigger::Cron { minutes, hours, weekdays, tz } => {
                let local = now.with_timezone(tz);
                if !Self::cron_matches(minutes, hours, weekdays, &local) {
                    return false;
                }
                match last_run {
                    None => true,
                    Some(lr) => {
                        let lr_local = lr.with_timezone(tz);
                        lr_local.date_naive() != local.date_naive()
                            || lr_local.hour() != local.hour()
                            || lr_local.minute() != local.minute()
                    }
                }
            }
            Trigger::Interval(d) => match last_run {
                None => true,
                Some(lr) => now - lr >= Duration::from_std(*d).unwrap_or(Duration::zero()),
            },
        }
    }
}

struct JobEntry {
    trigger: Trigger,
    func: JobFn,
}

pub struct ScheduledTask {
    pub name: String,
    pub trigger_expr: String,
    pub status: String,
    pub last_run: Option<String>,
    pub next_run: Option<String>,
    pub error_log: Option<String>,
}

pub struct Scheduler {
    store: Store,
    jobs: DashMap<String, JobEntry>,
    running: DashMap<String, ()>,
}

fn noop_job() -> JobFn {
    Arc::new(|| Box::pin(async { Ok(()) }))
}

impl Scheduler {
    pub fn new(store: Store) -> Self {
        Self { store, jobs: DashMap::new(), running: DashMap::new() }
    }

    pub async fn add_job(&self, name: &str, trigger: Trigger, func: JobFn) -> Result<()> {
        let schedule = trigger.describe();
        self.jobs.insert(name.to_string(), JobEntry { trigger, func });
        self.ensure_task_row(name, &schedule).await
    }

    async fn ensure_task_row(&self, name: &str, schedule: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO scheduled_tasks (name, trigger_expr, status) VALUES (?, ?, 'active')
             ON CONFLICT(name) DO UPDATE SET trigger_expr = excluded.trigger_expr",
        )
        .bind(name)
        .bind(schedule)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Registers the 10 default jobs with no-op bodies; callers (moves-core)
    /// replace them with real bodies via `add_job` before `run_due` starts
    /// firing, or rely on `run_job` directly for one-off invocation.
    pub async fn register_default_jobs(&self) -> Result<()> {
        use chrono_tz::America::New_York as ET;
        use Weekday::*;

        let weekdays = [Mon, Tue, Wed, Thu, Fri];

        self.add_job(
            "price_update",
            Trigger::cron(&(0..60).step_by(15).collect::<Vec<_>>(), &(9..=15).collect::<Vec<_>>(), &weekdays, ET),
            noop_job(),
        )
        .await?;

        self.add_job("news_scan", Trigger::cron(&[0], &[8, 14, 20], &[], ET), noop_job()).await?;

        self.add_job("pre_market_review", Trigger::cron(&[0], &[9], &weekdays, ET), noop_job()).await?;

        self.add_job("nav_snapshot", Trigger::cron(&[15], &[16], &weekdays, ET), noop_job()).await?;

        self.add_job("congress_trades", Trigger::cron(&[0], &[19], &[], ET), noop_job()).await?;

        self.add_job("stale_thesis_check", Trigger::cron(&[0], &[8], &[Mon], ET), noop_job()).await?;

        self.add_job(
            "exposure_snapshot",
            Trigger::cron(&[0], &(9..=16).collect::<Vec<_>>(), &weekdays, ET),
            noop_job(),
        )
        .await?;

        self.add_job("whatif_update", Trigger::cron(&[30], &[16], &weekdays, ET), noop_job()).await?;

        self.add_job("signal_expiry", Trigger::Interval(StdDuration::from_secs(3600)), noop_job()).await?;

        self.add_job("principle_validation", Trigger::cron(&[0], &[20], &[Sun], ET), noop_job()).await?;

        Ok(())
    }

    async fn last_run(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_run FROM scheduled_tasks WHERE name = ?")
            .bind(name)
            .fetch_optional(self.store.pool())
            .await?;
        Ok(row
            .and_then(|r| r.get::<Option<String>, _>("last_run"))
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Checks every registered job against `now` and fires whichever are due
    /// and not already mid-execution. A job whose previous run has not
    /// finished is skipped for this tick, not queued.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let names: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        let mut fired = Vec::new();

        for name in names {
            let Some(entry) = self.jobs.get(&name) else { continue };
            let last_run = self.last_run(&name).await?;
            if !entry.trigger.is_due(now, last_run) {
                continue;
            }
            let func = entry.func.clone();
            drop(entry);

            if self.running.insert(name.clone(), ()).is_some() {
                tracing::warn!("skipping {} — previous execution still running", name);
                continue;
            }

            self.execute_with_retry(&name, func).await;
            self.running.remove(&name);
            fired.push(name);
        }

        Ok(fired)
    }

    /// Runs one named job immediately, bypassing trigger matching. Used by
    /// callers that want to force a job (manual "run now" from a UI).
    pub async fn run_job(&self, name: &str) -> Result<()> {
        let Some(entry) = self.jobs.get(name) else {
            anyhow::bail!("no job registered named {name}");
        };
        let func = entry.func.clone();
        drop(entry);

        if self.running.insert(name.to_string(), ()).is_some() {
            anyhow::bail!("{name} is already running");
        }
        self.execute_with_retry(name, func).await;
        self.running.remove(name);
        Ok(())
    }

    async fn execute_with_retry(&self, name: &str, func: JobFn) {
        let start = Utc::now().to_rfc3339();
        let _ = self.update_task(name, Some(&start), Some("running"), None).await;

        let mut last_error = String::new();
        for attempt in 0..MAX_RETRIES {
            match func().await {
                Ok(()) => {
                    let _ = self.update_task(name, None, Some("active"), Some(None)).await;
                    tracing::info!("task {} completed", name);
                    return;
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!("task {} attempt {}/{} failed: {}", name, attempt + 1, MAX_RETRIES, last_error);
                    if let Some(&delay) = RETRY_BACKOFF_SECS.get(attempt as usize) {
                        tokio::time::sleep(StdDuration::from_secs(delay)).await;
                    }
                }
            }
        }

        let _ = self.update_task(name, None, Some("failed"), Some(Some(last_error))).await;
        tracing::error!("task {} failed after {} retries", name, MAX_RETRIES);
    }

    async fn update_task(
        &self,
        name: &str,
        last_run: Option<&str>,
        status: Option<&str>,
        error_log: Option<Option<String>>,
    ) -> Result<()> {
        if let Some(last_run) = last_run {
            sqlx::query("UPDATE scheduled_tasks SET last_run = ? WHERE name = ?")
                .bind(last_run)
                .bind(name)
                .execute(self.store.pool())
                .await?;
        }
        if let Some(status) = status {
            sqlx::query("UPDATE scheduled_tasks SET status = ? WHERE name = ?")
                .bind(status)
                .bind(name)
                .execute(self.store.pool())
                .await?;
        }
        if let Some(error_log) = error_log {
            sqlx::query("UPDATE scheduled_tasks SET error_log = ? WHERE name = ?")
                .bind(error_log)
                .bind(name)
                .execute(self.store.pool())
                .await?;
        }
        Ok(())
    }

    pub async fn get_jobs(&self) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            "SELECT name, trigger_expr, status, last_run, next_run, error_log
             FROM scheduled_tasks ORDER BY name",
        )
        .fetch_all(self.store.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ScheduledTask {
                name: r.get("name"),
                trigger_expr: r.get("trigger_expr"),
                status: r.get("status"),
                last_run: r.get("last_run"),
                next_run: r.get("next_run"),
                error_log: r.get("error_log"),
            })
            .collect())
    }
}

/// Helper so callers can keep a handle to the job-name -> future map outside
/// the scheduler, e.g. for tests that want to assert invocation counts.
pub fn counting_job(counter: Arc<std::sync::atomic::AtomicU32>, fail_times: u32) -> JobFn {
    Arc::new(move || {
        let counter = counter.clone();
        Box::pin(async move {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < fail_times {
                anyhow::bail!("synthetic failure {n}");
            }
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn et(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        use chrono_tz::America::New_York;
        New_York.with_ymd_and_hms(y, m, d, h, min, 0).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn cron_trigger_matches_only_configured_minute_and_hour() {
        use chrono_tz::America::New_York as ET;
        let trigger = Trigger::cron(&[0, 15, 30, 45], &(9..=15).collect::<Vec<_>>(), &[Weekday::Mon], ET);
        let during = et(2026, 6, 15, 9, 15); // Monday
        let outside_hour = et(2026, 6, 15, 16, 15);
        let outside_minute = et(2026, 6, 15, 9, 16);

        assert!(trigger.is_due(during, None));
        assert!(!trigger.is_due(outside_hour, None));
        assert!(!trigger.is_due(outside_minute, None));
    }

    #[test]
    fn cron_trigger_does_not_refire_within_same_minute() {
        use chrono_tz::America::New_York as ET;
        let trigger = Trigger::cron(&[0], &[9], &[], ET);
        let now = et(2026, 6, 15, 9, 0);
        assert!(!trigger.is_due(now, Some(now)));
    }

    #[test]
    fn interval_trigger_respects_elapsed_duration() {
        let trigger = Trigger::Interval(StdDuration::from_secs(3600));
        let last = Utc::now() - Duration::minutes(30);
        assert!(!trigger.is_due(Utc::now(), Some(last)));

        let older = Utc::now() - Duration::minutes(90);
        assert!(trigger.is_due(Utc::now(), Some(older)));
    }

    #[tokio::test]
    async fn run_due_skips_already_running_job() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let scheduler = Scheduler::new(store);
        scheduler.running.insert("signal_expiry".to_string(), ());
        scheduler
            .add_job("signal_expiry", Trigger::Interval(StdDuration::from_secs(1)), noop_job())
            .await
            .unwrap();

        let fired = scheduler.run_due(Utc::now()).await.unwrap();
        assert!(fired.is_empty());
    }

    #[tokio::test]
    async fn failing_job_retries_then_records_failed_status() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let scheduler = Scheduler::new(store);
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_job("signal_expiry", Trigger::Interval(StdDuration::from_secs(1)), counting_job(counter.clone(), 10))
            .await
            .unwrap();

        scheduler.run_job("signal_expiry").await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), MAX_RETRIES);

        let jobs = scheduler.get_jobs().await.unwrap();
        let task = jobs.iter().find(|j| j.name == "signal_expiry").unwrap();
        assert_eq!(task.status, "failed");
        assert!(task.error_log.is_some());
    }

    #[tokio::test]
    async fn job_that_eventually_succeeds_clears_error_log() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let scheduler = Scheduler::new(store);
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_job("signal_expiry", Trigger::Interval(StdDuration::from_secs(1)), counting_job(counter, 1))
            .await
            .unwrap();

        scheduler.run_job("signal_expiry").await.unwrap();

        let jobs = scheduler.get_jobs().await.unwrap();
        let task = jobs.iter().find(|j| j.name == "signal_expiry").unwrap();
        assert_eq!(task.status, "active");
    }

    #[tokio::test]
    async fn register_default_jobs_seeds_all_ten() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let scheduler = Scheduler::new(store);
        scheduler.register_default_jobs().await.unwrap();
        let jobs = scheduler.get_jobs().await.unwrap();
        assert_eq!(jobs.len(), 10);
    }
}

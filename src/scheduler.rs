//! Background job scheduler
//!
//! Cron-style jobs anchored to the deploy timezone plus fixed-period
//! interval jobs, each running as a single tokio task. One task per job
//! means a job never overlaps itself, and a slow run coalesces whatever
//! firings it slept through into the next one. Re-scheduling a name
//! replaces the previous task without touching other jobs.

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info};

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

pub struct Scheduler {
    zone: Tz,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(zone: Tz) -> Self {
        Self {
            zone,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Fixed-period job; the first run happens one period from now.
    /// Missed ticks are coalesced, never bursted.
    pub fn schedule_interval(&self, name: &str, period: Duration, job: JobFn) {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; consume the first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                job().await;
            }
        });
        self.install(name, handle);
        debug!(name, period_secs = period.as_secs(), "interval job scheduled");
    }

    /// Daily job at the given wall-clock time in the deploy zone
    pub fn schedule_daily(&self, name: &str, at: NaiveTime, job: JobFn) {
        let zone = self.zone;
        let handle = tokio::spawn(async move {
            loop {
                let next = next_daily(Utc::now(), zone, at);
                sleep(until(next)).await;
                job().await;
            }
        });
        self.install(name, handle);
        debug!(name, at = %at, "daily job scheduled");
    }

    /// Weekly job at the given weekday and wall-clock time in the deploy zone
    pub fn schedule_weekly(&self, name: &str, day: Weekday, at: NaiveTime, job: JobFn) {
        let zone = self.zone;
        let handle = tokio::spawn(async move {
            loop {
                let next = next_weekly(Utc::now(), zone, day, at);
                sleep(until(next)).await;
                job().await;
            }
        });
        self.install(name, handle);
        debug!(name, day = ?day, at = %at, "weekly job scheduled");
    }

    /// Stop the named job; true if one was running
    pub fn cancel(&self, name: &str) -> bool {
        if let Some(handle) = self.jobs.lock().unwrap().remove(name) {
            handle.abort();
            debug!(name, "job cancelled");
            true
        } else {
            false
        }
    }

    /// Stop every job
    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock().unwrap();
        for (name, handle) in jobs.drain() {
            handle.abort();
            debug!(%name, "job stopped");
        }
        info!("scheduler shut down");
    }

    fn install(&self, name: &str, handle: JoinHandle<()>) {
        if let Some(previous) = self.jobs.lock().unwrap().insert(name.to_string(), handle) {
            previous.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, handle) in self.jobs.lock().unwrap().drain() {
            handle.abort();
        }
    }
}

fn until(instant: DateTime<Utc>) -> Duration {
    (instant - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Next instant the zone's wall clock reads `at`, strictly after `now`.
/// A time skipped by a DST gap rolls forward to the next valid day.
pub fn next_daily(now: DateTime<Utc>, zone: Tz, at: NaiveTime) -> DateTime<Utc> {
    let local_now = now.with_timezone(&zone);
    let mut date = local_now.date_naive();
    for _ in 0..3 {
        if let Some(candidate) = zone
            .from_local_datetime(&date.and_time(at))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
        {
            if candidate > now {
                return candidate;
            }
        }
        date = date.succ_opt().unwrap_or(date);
    }
    now + chrono::Duration::days(1)
}

/// Next instant the zone's wall clock reads `at` on the given weekday,
/// strictly after `now`
pub fn next_weekly(now: DateTime<Utc>, zone: Tz, day: Weekday, at: NaiveTime) -> DateTime<Utc> {
    let local_now = now.with_timezone(&zone);
    let mut date = local_now.date_naive();
    for _ in 0..9 {
        if date.weekday() == day {
            if let Some(candidate) = zone
                .from_local_datetime(&date.and_time(at))
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
            {
                if candidate > now {
                    return candidate;
                }
            }
        }
        date = date.succ_opt().unwrap_or(date);
    }
    now + chrono::Duration::weeks(1)
}

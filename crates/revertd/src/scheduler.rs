//! Deadline scheduler - one timer per pending change, expiries over a channel
//!
//! Timers here are a cache: the authoritative deadline lives in the persisted
//! pending-change record, written before any timer is armed. On restart the
//! engine reloads those records and re-arms or fires them, so a lost process
//! never loses a wakeup.
//!
//! Timeout policies are either a fixed duration or a 5-field cron expression
//! (minute hour day-of-month month day-of-week) whose next occurrence after
//! "now" becomes the deadline.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};
use revertit_common::config::TimeoutPolicy;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Compute the absolute deadline a policy yields from `now`.
pub fn next_deadline(policy: &TimeoutPolicy, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match policy {
        TimeoutPolicy::Secs(secs) => Ok(now + Duration::seconds(*secs as i64)),
        TimeoutPolicy::Cron(expr) => {
            let cron = CronExpr::parse(expr)?;
            cron.next_after(now)
                .with_context(|| format!("cron expression '{}' never matches", expr))
        }
    }
}

/// Maintains one armed timer per pending change id and delivers expired ids
/// over a channel to the engine.
pub struct DeadlineScheduler {
    expiry_tx: mpsc::Sender<String>,
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl DeadlineScheduler {
    /// Create a scheduler and the receiving end of its expiry channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (expiry_tx, expiry_rx) = mpsc::channel(capacity);
        (
            Self {
                expiry_tx,
                timers: Arc::new(Mutex::new(HashMap::new())),
            },
            expiry_rx,
        )
    }

    /// Arm (or re-arm) the timer for a pending change. An existing timer for
    /// the same id is replaced, never duplicated.
    pub async fn schedule(&self, id: &str, deadline: DateTime<Utc>) {
        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();

        let timers = Arc::clone(&self.timers);
        let tx = self.expiry_tx.clone();
        let timer_id = id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            timers.lock().await.remove(&timer_id);
            if tx.send(timer_id.clone()).await.is_err() {
                warn!("Expiry channel closed, dropping expiry for {}", timer_id);
            }
        });

        let mut timers = self.timers.lock().await;
        if let Some(old) = timers.insert(id.to_string(), handle) {
            debug!("Replacing existing timer for {}", id);
            old.abort();
        }
    }

    /// Disarm the timer for a confirmed or resolved change. Returns whether
    /// a timer was actually armed.
    pub async fn cancel(&self, id: &str) -> bool {
        let mut timers = self.timers.lock().await;
        match timers.remove(id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn armed_count(&self) -> usize {
        self.timers.lock().await.len()
    }
}

/// A parsed 5-field cron expression. Fields are minute (0-59), hour (0-23),
/// day of month (1-31), month (1-12), day of week (0-6, Sunday = 0 or 7).
#[derive(Debug, Clone)]
pub struct CronExpr {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            bail!("cron expression '{}' must have 5 fields", expr);
        }

        let minutes = parse_field(fields[0], 0, 59)?;
        let hours = parse_field(fields[1], 0, 23)? as u32;
        let days_of_month = parse_field(fields[2], 1, 31)? as u32;
        let months = parse_field(fields[3], 1, 12)? as u16;
        // 7 is an alias for Sunday: fold bit 7 into bit 0.
        let mut raw_dow = parse_field(fields[4], 0, 7)? as u8;
        if raw_dow & 0x80 != 0 {
            raw_dow = (raw_dow & 0x7f) | 1;
        }

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week: raw_dow,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    fn matches(&self, t: DateTime<Utc>) -> bool {
        if self.minutes & (1 << t.minute()) == 0 {
            return false;
        }
        if self.hours & (1 << t.hour()) == 0 {
            return false;
        }
        if self.months & (1 << t.month()) == 0 {
            return false;
        }

        let dom_ok = self.days_of_month & (1 << t.day()) != 0;
        let dow_ok = self.days_of_week & (1 << t.weekday().num_days_from_sunday()) != 0;

        // Vixie cron: when both day fields are restricted, either matching
        // is sufficient.
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            _ => dom_ok && dow_ok,
        }
    }

    /// First matching instant strictly after `now`, scanning minute by
    /// minute for up to a year.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = now
            .duration_trunc(Duration::minutes(1))
            .unwrap_or(now)
            + Duration::minutes(1);

        for _ in 0..(366 * 24 * 60) {
            if self.matches(t) {
                return Some(t);
            }
            t += Duration::minutes(1);
        }
        None
    }
}

/// Parse one cron field into a bitmask over [min, max].
fn parse_field(field: &str, min: u32, max: u32) -> Result<u64> {
    let mut mask = 0u64;

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .with_context(|| format!("bad cron step in '{}'", part))?;
                if step == 0 {
                    bail!("cron step must be nonzero in '{}'", part);
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo: u32 = a
                .parse()
                .with_context(|| format!("bad cron range in '{}'", part))?;
            let hi: u32 = b
                .parse()
                .with_context(|| format!("bad cron range in '{}'", part))?;
            (lo, hi)
        } else {
            let v: u32 = range
                .parse()
                .with_context(|| format!("bad cron value in '{}'", part))?;
            (v, v)
        };

        if lo < min || hi > max || lo > hi {
            bail!("cron value out of range in '{}' (expected {}-{})", part, min, max);
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }

    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fixed_policy_deadline() {
        let now = Utc::now();
        let deadline = next_deadline(&TimeoutPolicy::Secs(300), now).unwrap();
        assert_eq!((deadline - now).num_seconds(), 300);
    }

    #[test]
    fn test_cron_every_five_minutes() {
        let cron = CronExpr::parse("*/5 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 2, 30).unwrap();
        let next = cron.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 10, 12, 5, 0).unwrap());
    }

    #[test]
    fn test_cron_daily_at_three() {
        let cron = CronExpr::parse("0 3 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 4, 0, 0).unwrap();
        let next = cron.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 11, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_cron_strictly_after_now() {
        let cron = CronExpr::parse("30 12 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 30, 0).unwrap();
        let next = cron.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 11, 12, 30, 0).unwrap());
    }

    #[test]
    fn test_cron_rejects_garbage() {
        assert!(CronExpr::parse("not a cron").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("* * * *").is_err());
    }

    #[tokio::test]
    async fn test_timer_fires_once() {
        let (scheduler, mut rx) = DeadlineScheduler::new(8);
        scheduler
            .schedule("c1", Utc::now() + Duration::milliseconds(20))
            .await;

        let fired = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired, "c1");
        assert_eq!(scheduler.armed_count().await, 0);

        // No second delivery.
        let extra =
            tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_cancel_prevents_expiry() {
        let (scheduler, mut rx) = DeadlineScheduler::new(8);
        scheduler
            .schedule("c2", Utc::now() + Duration::milliseconds(50))
            .await;
        assert!(scheduler.cancel("c2").await);

        let fired =
            tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await;
        assert!(fired.is_err());
        assert!(!scheduler.cancel("c2").await);
    }

    #[tokio::test]
    async fn test_reschedule_replaces_timer() {
        let (scheduler, mut rx) = DeadlineScheduler::new(8);
        scheduler
            .schedule("c3", Utc::now() + Duration::seconds(60))
            .await;
        scheduler
            .schedule("c3", Utc::now() + Duration::milliseconds(20))
            .await;
        assert_eq!(scheduler.armed_count().await, 1);

        let fired = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired, "c3");

        // The replaced timer never fires a duplicate.
        let extra =
            tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_past_deadline_fires_immediately() {
        let (scheduler, mut rx) = DeadlineScheduler::new(8);
        scheduler
            .schedule("c4", Utc::now() - Duration::seconds(10))
            .await;

        let fired = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired, "c4");
    }
}

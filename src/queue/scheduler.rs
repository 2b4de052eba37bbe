//! Lightweight scheduling: a nightly local-time tick and a fixed-period
//! maintenance tick.
//!
//! A general cron engine is an external collaborator; this module
//! interprets daily `M H * * *` schedules (the thought-generation default
//! `0 3 * * *`) and runs fixed intervals for the pending-vector sweeper.
//! Both loops watch the engine's shutdown signal.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Parse a daily `minute hour * * *` cron expression.
///
/// Returns `None` for anything that is not a plain daily schedule; the
/// caller falls back to 03:00 local.
#[must_use]
pub fn parse_daily_schedule(cron: &str) -> Option<(u32, u32)> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 || fields[2] != "*" || fields[3] != "*" || fields[4] != "*" {
        return None;
    }
    let minute: u32 = fields[0].parse().ok()?;
    let hour: u32 = fields[1].parse().ok()?;
    (minute < 60 && hour < 24).then_some((hour, minute))
}

/// First wall-clock occurrence of `hour:minute` strictly after `after`.
/// DST gaps roll forward to the next representable day.
#[must_use]
pub fn next_daily_occurrence(after: DateTime<Local>, hour: u32, minute: u32) -> DateTime<Local> {
    let mut date = after.date_naive();
    for _ in 0..3 {
        if let Some(naive) = date.and_hms_opt(hour, minute, 0) {
            if let Some(candidate) = Local.from_local_datetime(&naive).earliest() {
                if candidate > after {
                    return candidate;
                }
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    after + chrono::Duration::days(1)
}

/// Run `task` once per day at the schedule's local time until shutdown.
pub fn spawn_daily<F, Fut>(
    schedule: &str,
    mut shutdown: watch::Receiver<bool>,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let (hour, minute) = parse_daily_schedule(schedule).unwrap_or_else(|| {
        warn!(schedule, "unsupported cron schedule, using 03:00 local");
        (3, 0)
    });
    tokio::spawn(async move {
        loop {
            let now = Local::now();
            let next = next_daily_occurrence(now, hour, minute);
            let wait = (next - now).to_std().unwrap_or(Duration::from_secs(1));
            info!(at = %next, "nightly task scheduled");
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(wait) => {
                    task().await;
                }
            }
        }
        info!("nightly scheduler stopped");
    })
}

/// Run `task` every `period` until shutdown. The first run happens one
/// full period after spawn.
pub fn spawn_interval<F, Fut>(
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // completes immediately
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    task().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn parses_the_default_schedule() {
        assert_eq!(parse_daily_schedule("0 3 * * *"), Some((3, 0)));
        assert_eq!(parse_daily_schedule("30 14 * * *"), Some((14, 30)));
    }

    #[test]
    fn rejects_non_daily_schedules() {
        assert_eq!(parse_daily_schedule("0 3 * * 1"), None);
        assert_eq!(parse_daily_schedule("*/5 * * * *"), None);
        assert_eq!(parse_daily_schedule("0 25 * * *"), None);
        assert_eq!(parse_daily_schedule("not a cron"), None);
    }

    #[test]
    fn next_occurrence_is_strictly_in_the_future() {
        let now = Local::now();
        let next = next_daily_occurrence(now, 3, 0);
        assert!(next > now);
        assert_eq!(next.hour(), 3);
        assert_eq!(next.minute(), 0);
        // And never more than a day and change away.
        assert!(next - now <= chrono::Duration::days(2));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_task_fires_and_stops_on_shutdown() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        let fired = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);
        let counter = Arc::clone(&fired);
        let handle = spawn_interval(Duration::from_secs(60), rx, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst) >= 1);

        tx.send(true).ok();
        handle.await.ok();
    }
}

//! Cooperative polling loop: one task owns every source and the seen store.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tracing::{debug, error, info};

use crate::config::{GeneralConfig, MIN_POLL_SECONDS};
use crate::dedup::SeenStore;
use crate::sources::Source;

/// A source plus its due-time bookkeeping. Only the scheduler mutates it.
pub struct ScheduledSource {
    source: Box<dyn Source>,
    interval: Duration,
    next_due: DateTime<Utc>,
}

impl ScheduledSource {
    /// Due immediately; `interval` is floored to 30 s.
    pub fn new(source: Box<dyn Source>, interval: Duration) -> Self {
        Self {
            source,
            interval: interval.max(Duration::from_secs(MIN_POLL_SECONDS)),
            next_due: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_due(&self) -> DateTime<Utc> {
        self.next_due
    }

    pub fn due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_due
    }

    pub fn schedule_next(&mut self, now: DateTime<Utc>) {
        let step = chrono::Duration::from_std(self.interval).unwrap_or_else(|_| chrono::Duration::days(365));
        self.next_due = now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    pub async fn poll(&mut self, now: DateTime<Utc>, seen: &mut SeenStore) -> Result<usize> {
        self.source.poll(now, seen).await
    }
}

/// What one pass over the sources did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Names of sources polled this cycle, in order (failures included).
    pub polled: Vec<String>,
    pub failed: Vec<String>,
    pub items: usize,
}

impl CycleReport {
    pub fn ran(&self) -> bool {
        !self.polled.is_empty()
    }
}

pub struct Scheduler {
    sources: Vec<ScheduledSource>,
    store: SeenStore,
    sleep_min: Duration,
    sleep_max: Duration,
}

impl Scheduler {
    pub fn new(sources: Vec<ScheduledSource>, store: SeenStore, sleep_min: Duration, sleep_max: Duration) -> Self {
        Self {
            sources,
            store,
            sleep_min,
            sleep_max,
        }
    }

    pub fn from_general(general: &GeneralConfig, sources: Vec<ScheduledSource>, store: SeenStore) -> Self {
        Self::new(
            sources,
            store,
            Duration::from_secs(general.sleep_min),
            Duration::from_secs(general.sleep_max),
        )
    }

    pub fn sources(&self) -> &[ScheduledSource] {
        &self.sources
    }

    pub fn store(&self) -> &SeenStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SeenStore {
        &mut self.store
    }

    /// Poll every due source in configuration order. A failing source is
    /// logged and rescheduled like any other.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();
        for s in self.sources.iter_mut() {
            if !s.due(now) {
                continue;
            }
            let name = s.name().to_string();
            counter!("feed_polls_total", "source" => name.clone()).increment(1);
            match s.poll(now, &mut self.store).await {
                Ok(n) => {
                    debug!(source = %name, items = n, "polled");
                    report.items += n;
                }
                Err(e) => {
                    error!(source = %name, error = ?e, "error polling source");
                    counter!("feed_poll_errors_total", "source" => name.clone()).increment(1);
                    report.failed.push(name.clone());
                }
            }
            s.schedule_next(now);
            report.polled.push(name);
        }
        gauge!("scheduler_last_cycle_ts").set(now.timestamp() as f64);
        report
    }

    /// Pause after a cycle: short when something ran, long when idle.
    pub fn pause_after(&self, report: &CycleReport) -> Duration {
        if report.ran() {
            self.sleep_min
        } else {
            self.sleep_max
        }
    }

    /// Loop until `shutdown` resolves: cycle, sleep, purge.
    pub async fn run_until<F: Future<Output = ()>>(mut self, shutdown: F) -> SeenStore {
        tokio::pin!(shutdown);
        self.store.purge_old();
        info!(sources = self.sources.len(), "scheduler started");
        loop {
            let report = self.run_cycle(Utc::now()).await;
            let pause = self.pause_after(&report);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = &mut shutdown => {
                    info!("scheduler stopping");
                    break;
                }
            }
            self.store.purge_old();
        }
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::Source;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct Counter {
        name: &'static str,
    }

    #[async_trait]
    impl Source for Counter {
        fn name(&self) -> &str {
            self.name
        }
        fn bucket(&self) -> &'static str {
            "test"
        }
        async fn poll(&mut self, _now: DateTime<Utc>, _seen: &mut SeenStore) -> Result<usize> {
            Ok(1)
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn new_sources_are_due_and_floor_applies() {
        let s = ScheduledSource::new(Box::new(Counter { name: "a" }), Duration::from_secs(5));
        assert!(s.due(t(0)));
        assert_eq!(s.interval(), Duration::from_secs(30));
    }

    #[test]
    fn schedule_next_moves_due_time() {
        let mut s = ScheduledSource::new(Box::new(Counter { name: "a" }), Duration::from_secs(60));
        s.schedule_next(t(0));
        assert!(!s.due(t(59)));
        assert!(s.due(t(60)));
        assert_eq!(s.next_due(), t(60));
    }

    #[tokio::test]
    async fn idle_cycle_sleeps_long() {
        let dir = tempfile::tempdir().unwrap();
        let store = SeenStore::open(dir.path().join("seen.json"), 7);
        let mut sched = Scheduler::new(
            vec![ScheduledSource::new(Box::new(Counter { name: "a" }), Duration::from_secs(60))],
            store,
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        let first = sched.run_cycle(t(0)).await;
        assert_eq!(first.polled, ["a"]);
        assert_eq!(sched.pause_after(&first), Duration::from_secs(1));

        let idle = sched.run_cycle(t(10)).await;
        assert!(!idle.ran());
        assert_eq!(sched.pause_after(&idle), Duration::from_secs(5));
    }
}

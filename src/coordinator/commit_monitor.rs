//! Commit monitor
//!
//! Decides when recipients are consistently caught up so the coordinator
//! can enter the critical section. A single low sample is never trusted:
//! readiness needs `required` consecutive samples strictly below the
//! threshold, each separated by at least one poll interval. Any sample at
//! or above the threshold resets the count.

use crate::common::config::MigrationConfig;
use crate::Result;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Anti-flicker readiness rule
#[derive(Debug, Clone)]
pub struct CommitReadiness {
    threshold: Duration,
    required: usize,
    consecutive: usize,
    last: Option<(Duration, Instant)>,
    drain_rate: Option<f64>,
}

impl CommitReadiness {
    pub fn new(threshold: Duration, required: usize) -> Self {
        Self {
            threshold,
            required: required.max(1),
            consecutive: 0,
            last: None,
            drain_rate: None,
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(
            config.commit_lag_threshold(),
            config.commit_consecutive_samples,
        )
    }

    /// Record one sample; true once enough consecutive samples were low
    pub fn observe(&mut self, lag: Duration) -> bool {
        let now = Instant::now();
        if let Some((prev, at)) = self.last {
            let elapsed = now.duration_since(at).as_secs_f64();
            if elapsed > 0.0 && lag != Duration::MAX && prev != Duration::MAX {
                // Seconds of lag drained per second of wall clock
                let drained = prev.as_secs_f64() - lag.as_secs_f64();
                self.drain_rate = Some(drained / elapsed);
            }
        }
        self.last = Some((lag, now));

        if lag < self.threshold {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        self.is_ready()
    }

    pub fn is_ready(&self) -> bool {
        self.consecutive >= self.required
    }

    pub fn consecutive(&self) -> usize {
        self.consecutive
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Advisory time until readiness. `None` when lag is not shrinking.
    pub fn estimate_remaining(&self, interval: Duration) -> Option<Duration> {
        let (lag, _) = self.last?;
        if lag < self.threshold {
            let samples = self.required.saturating_sub(self.consecutive) as u32;
            return Some(interval * samples);
        }
        let rate = self.drain_rate.filter(|r| *r > 0.0)?;
        let excess = lag.saturating_sub(self.threshold).as_secs_f64();
        let catch_up = Duration::try_from_secs_f64(excess / rate).ok()?;
        Some(catch_up + interval * self.required as u32)
    }
}

/// Where lag samples come from. The coordinator reports the worst lag over
/// all recipients of an operation.
#[async_trait]
pub trait LagSource: Send + Sync {
    async fn sample(&self) -> Result<Duration>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    Ready,
    Cancelled,
}

/// Poll loop around a [`CommitReadiness`]
pub struct CommitMonitor<'a> {
    source: &'a dyn LagSource,
    readiness: CommitReadiness,
    interval: Duration,
}

impl<'a> CommitMonitor<'a> {
    pub fn new(source: &'a dyn LagSource, readiness: CommitReadiness, interval: Duration) -> Self {
        Self {
            source,
            readiness,
            interval,
        }
    }

    /// Poll until ready, cancelled through `cancel`, or the source fails.
    ///
    /// `progress` sees the readiness state after every sample.
    pub async fn run<F>(
        mut self,
        cancel: &mut watch::Receiver<bool>,
        mut progress: F,
    ) -> Result<MonitorOutcome>
    where
        F: FnMut(&CommitReadiness, Duration) + Send,
    {
        loop {
            if *cancel.borrow() {
                return Ok(MonitorOutcome::Cancelled);
            }

            let lag = self.source.sample().await?;
            let ready = self.readiness.observe(lag);
            progress(&self.readiness, self.interval);
            tracing::debug!(
                lag_ms = lag.as_millis() as u64,
                consecutive = self.readiness.consecutive(),
                ready,
                "commit monitor sample"
            );
            if ready {
                return Ok(MonitorOutcome::Ready);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Ok(MonitorOutcome::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    struct Scripted {
        lags: Mutex<Vec<Duration>>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(lags: &[u64]) -> Self {
            Self {
                lags: Mutex::new(lags.iter().rev().map(|v| ms(*v)).collect()),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl LagSource for Scripted {
        async fn sample(&self) -> Result<Duration> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.lags.lock().unwrap().pop().unwrap_or(Duration::MAX))
        }
    }

    #[test]
    fn test_single_dip_is_not_trusted() {
        let mut r = CommitReadiness::new(ms(50), 2);
        assert!(!r.observe(ms(200)));
        assert!(!r.observe(ms(5)));
        assert!(!r.observe(ms(200)));
        assert!(!r.observe(ms(5)));
        assert!(r.observe(ms(5)));
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut r = CommitReadiness::new(ms(50), 1);
        assert!(!r.observe(ms(50)));
        assert!(r.observe(ms(49)));
    }

    #[test]
    fn test_estimate() {
        let mut r = CommitReadiness::new(ms(50), 2);
        assert!(r.estimate_remaining(ms(10)).is_none());
        r.observe(ms(5));
        assert_eq!(r.estimate_remaining(ms(10)), Some(ms(10)));
        r.observe(Duration::MAX);
        assert!(r.estimate_remaining(ms(10)).is_none());
    }

    #[tokio::test]
    async fn test_run_fires_on_second_consecutive_low_sample() {
        let source = Scripted::new(&[5, 200, 5, 5, 5]);
        let (_tx, mut rx) = watch::channel(false);
        let monitor = CommitMonitor::new(&source, CommitReadiness::new(ms(50), 2), ms(1));
        let outcome = monitor.run(&mut rx, |_, _| {}).await.unwrap();
        assert_eq!(outcome, MonitorOutcome::Ready);
        assert_eq!(*source.calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_run_is_cancellable() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let source = Scripted::new(&[]);
            let monitor = CommitMonitor::new(&source, CommitReadiness::new(ms(50), 2), ms(1_000));
            monitor.run(&mut rx, |_, _| {}).await
        });
        tokio::time::sleep(ms(20)).await;
        tx.send(true).unwrap();
        let outcome = tokio::time::timeout(ms(500), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, MonitorOutcome::Cancelled);
    }
}

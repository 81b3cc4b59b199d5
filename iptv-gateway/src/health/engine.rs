//! Health probe engine: retries, bounded fan-out and result persistence.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::prober::{ProbeOutcome, SourceProber};
use crate::config::{LiveConfig, LiveSettings, MAX_PROBE_WORKERS};
use crate::database::models::ChannelDbModel;
use crate::database::repositories::ChannelRepository;
use crate::utils::Clock;
use crate::{Error, Result};

/// Result of probing one channel, retries included.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub channel_id: i64,
    pub channel_name: String,
    pub healthy: bool,
    /// Attempts made, at most `max_retries + 1`.
    pub attempts: u32,
    pub cause: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Totals of a batch run over all active channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Probes channels and records their health in the catalog.
pub struct HealthProbeEngine {
    channels: Arc<dyn ChannelRepository>,
    prober: Arc<dyn SourceProber>,
    live: Arc<dyn LiveConfig>,
    clock: Arc<dyn Clock>,
    batch: Mutex<()>,
}

impl HealthProbeEngine {
    pub fn new(
        channels: Arc<dyn ChannelRepository>,
        prober: Arc<dyn SourceProber>,
        live: Arc<dyn LiveConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            channels,
            prober,
            live,
            clock,
            batch: Mutex::new(()),
        }
    }

    /// Probe one channel by id with the current settings.
    pub async fn probe_by_id(&self, channel_id: i64) -> Result<ProbeReport> {
        let channel = self
            .channels
            .get_channel(channel_id)
            .await?
            .ok_or_else(|| Error::not_found("Channel", channel_id.to_string()))?;
        Ok(self.probe(&channel).await)
    }

    /// Probe one channel with the current settings and record the result.
    pub async fn probe(&self, channel: &ChannelDbModel) -> ProbeReport {
        let settings = self.live.current().await;
        self.probe_with(channel, &settings).await
    }

    /// Probe every active channel through a pool of `probe_workers` tasks.
    ///
    /// Only one batch runs at a time; a concurrent call fails with
    /// [`Error::Busy`]. A probe that panics counts as unhealthy.
    pub async fn probe_all(self: &Arc<Self>) -> Result<ProbeSummary> {
        let Ok(_batch) = self.batch.try_lock() else {
            return Err(Error::Busy("a channel probe batch is already running".to_string()));
        };

        let settings = Arc::new(self.live.current().await);
        let channels = self.channels.list_active_channels().await?;
        let mut summary = ProbeSummary {
            total: channels.len(),
            ..ProbeSummary::default()
        };

        info!(
            channels = summary.total,
            workers = settings.probe_workers,
            "Starting channel health batch"
        );

        let width = settings.probe_workers.clamp(1, MAX_PROBE_WORKERS);
        let semaphore = Arc::new(Semaphore::new(width));
        let mut tasks = JoinSet::new();
        for channel in channels {
            let engine = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let settings = Arc::clone(&settings);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                engine.probe_with(&channel, &settings).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) if report.healthy => summary.healthy += 1,
                Ok(_) => summary.unhealthy += 1,
                Err(e) => {
                    error!(error = %e, "Channel probe task failed");
                    summary.unhealthy += 1;
                }
            }
        }

        info!(
            total = summary.total,
            healthy = summary.healthy,
            unhealthy = summary.unhealthy,
            "Channel health batch finished"
        );
        Ok(summary)
    }

    async fn probe_with(&self, channel: &ChannelDbModel, settings: &LiveSettings) -> ProbeReport {
        let max_attempts = settings.probe_max_retries.saturating_add(1);
        let mut attempts = 0;

        let outcome = loop {
            attempts += 1;
            let outcome = self.attempt(channel, settings).await;
            if outcome.healthy || attempts >= max_attempts {
                break outcome;
            }
            debug!(
                channel_id = channel.id,
                attempt = attempts,
                cause = outcome.cause.as_deref().unwrap_or_default(),
                "Probe failed, retrying"
            );
        };

        let checked_at = self.clock.now();
        if let Err(e) = self
            .channels
            .update_health(channel.id, outcome.healthy, checked_at)
            .await
        {
            warn!(channel_id = channel.id, error = %e, "Failed to record channel health");
        }

        if outcome.healthy {
            debug!(channel_id = channel.id, attempts, "Channel healthy");
        } else {
            warn!(
                channel_id = channel.id,
                channel = %channel.name,
                attempts,
                cause = outcome.cause.as_deref().unwrap_or_default(),
                "Channel unhealthy"
            );
        }

        ProbeReport {
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            healthy: outcome.healthy,
            attempts,
            cause: outcome.cause,
            checked_at,
        }
    }

    /// One attempt, bounded by the probe timeout. Panics become failures.
    async fn attempt(&self, channel: &ChannelDbModel, settings: &LiveSettings) -> ProbeOutcome {
        let probe = AssertUnwindSafe(self.prober.probe_once(channel, settings)).catch_unwind();
        match tokio::time::timeout(settings.probe_timeout, probe).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                ProbeOutcome::unhealthy(format!("probe panicked: {}", panic_message(&*panic)))
            }
            Err(_) => ProbeOutcome::unhealthy(format!(
                "probe timed out after {:?}",
                settings.probe_timeout
            )),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticLiveConfig;
    use crate::database::repositories::SqlxChannelRepository;
    use crate::database::test_pool;
    use crate::utils::ManualClock;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails a fixed number of times per channel, then succeeds.
    #[derive(Default)]
    struct FlakyProber {
        failures_before_success: HashMap<i64, u32>,
        calls: parking_lot::Mutex<HashMap<i64, u32>>,
    }

    #[async_trait]
    impl SourceProber for FlakyProber {
        async fn probe_once(&self, channel: &ChannelDbModel, _: &LiveSettings) -> ProbeOutcome {
            let call = {
                let mut calls = self.calls.lock();
                let n = calls.entry(channel.id).or_default();
                *n += 1;
                *n
            };
            let failures = self
                .failures_before_success
                .get(&channel.id)
                .copied()
                .unwrap_or(u32::MAX);
            if call > failures {
                ProbeOutcome::healthy()
            } else {
                ProbeOutcome::unhealthy("connection refused")
            }
        }
    }

    /// Healthy everywhere except one channel, whose probe panics.
    struct PanickingProber {
        bad_channel: i64,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SourceProber for PanickingProber {
        async fn probe_once(&self, channel: &ChannelDbModel, _: &LiveSettings) -> ProbeOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if channel.id == self.bad_channel {
                panic!("prober exploded");
            }
            ProbeOutcome::healthy()
        }
    }

    struct HangingProber(AtomicU32);

    #[async_trait]
    impl SourceProber for HangingProber {
        async fn probe_once(&self, _: &ChannelDbModel, _: &LiveSettings) -> ProbeOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            futures::future::pending().await
        }
    }

    async fn setup(
        prober: Arc<dyn SourceProber>,
        settings: LiveSettings,
        channel_count: usize,
    ) -> (Arc<HealthProbeEngine>, Arc<SqlxChannelRepository>, Vec<i64>) {
        let repo = Arc::new(SqlxChannelRepository::new(test_pool().await));
        let mut ids = Vec::new();
        for i in 0..channel_count {
            let channel = ChannelDbModel::new(format!("ch{i}"), format!("http://upstream/{i}.ts"));
            ids.push(repo.create(&channel).await.unwrap());
        }
        let engine = Arc::new(HealthProbeEngine::new(
            repo.clone(),
            prober,
            Arc::new(StaticLiveConfig::new(settings)),
            Arc::new(ManualClock::new(Utc::now())),
        ));
        (engine, repo, ids)
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let settings = LiveSettings {
            probe_max_retries: 2,
            ..LiveSettings::default()
        };
        let prober = FlakyProber {
            failures_before_success: HashMap::from([(1, 2)]),
            ..FlakyProber::default()
        };
        let (engine, repo, ids) = setup(Arc::new(prober), settings, 1).await;
        assert_eq!(ids[0], 1);

        let report = engine.probe_by_id(1).await.unwrap();
        assert!(report.healthy);
        assert_eq!(report.attempts, 3);

        let stored = repo.get_channel(1).await.unwrap().unwrap();
        assert!(stored.is_healthy);
        assert!(stored.last_check.is_some());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let (engine, repo, ids) = setup(Arc::new(FlakyProber::default()), LiveSettings::default(), 1).await;

        let report = engine.probe_by_id(ids[0]).await.unwrap();
        assert!(!report.healthy);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.cause.as_deref(), Some("connection refused"));
        assert!(!repo.get_channel(ids[0]).await.unwrap().unwrap().is_healthy);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_not_found() {
        let (engine, _, _) = setup(Arc::new(FlakyProber::default()), LiveSettings::default(), 0).await;
        assert!(matches!(
            engine.probe_by_id(42).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_probe_all_isolates_panics_and_bounds_width() {
        let prober = Arc::new(PanickingProber {
            bad_channel: 3,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let settings = LiveSettings {
            probe_workers: 2,
            probe_max_retries: 0,
            ..LiveSettings::default()
        };
        let (engine, repo, _) = setup(prober.clone(), settings, 6).await;

        let summary = engine.probe_all().await.unwrap();
        assert_eq!(summary.total, 6);
        assert_eq!(summary.healthy + summary.unhealthy, 6);
        assert_eq!(summary.unhealthy, 1);
        assert!(prober.peak.load(Ordering::SeqCst) <= 2);
        assert!(!repo.get_channel(3).await.unwrap().unwrap().is_healthy);
    }

    #[tokio::test]
    async fn test_hanging_probe_is_bounded_by_timeout() {
        let prober = Arc::new(HangingProber(AtomicU32::new(0)));
        let settings = LiveSettings {
            probe_timeout: Duration::from_millis(50),
            probe_max_retries: 1,
            ..LiveSettings::default()
        };
        let (engine, _, ids) = setup(prober.clone(), settings, 1).await;

        let report = engine.probe_by_id(ids[0]).await.unwrap();
        assert!(!report.healthy);
        assert_eq!(report.attempts, 2);
        assert_eq!(prober.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}

//! Service container for dependency injection.
//!
//! The ServiceContainer builds every gateway component from the database
//! pool and process configuration, owns the background jobs, and drives
//! graceful shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::api::AppState;
use crate::config::{AppConfig, LiveConfig, SettingsService};
use crate::database::repositories::{
    ChannelRepository, SqlxChannelRepository, SqlxSettingsRepository, SqlxViewerRepository,
    SqlxWatchRecordRepository, ViewerRepository, WatchRecordRepository,
};
use crate::health::{HealthProbeEngine, NetworkProber};
use crate::proxy::{GatewayDeps, GatewayOptions, StreamGateway};
use crate::scheduler::{JobHandle, PeriodicJob};
use crate::session::{SessionRegistry, WatchFlusher};
use crate::utils::{Clock, SystemClock};

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Database connection pool.
    pub pool: SqlitePool,
    /// Process configuration.
    pub config: AppConfig,
    pub channels: Arc<dyn ChannelRepository>,
    pub viewers: Arc<dyn ViewerRepository>,
    pub records: Arc<dyn WatchRecordRepository>,
    /// Live settings backed by the settings table.
    pub live: Arc<dyn LiveConfig>,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<SessionRegistry>,
    pub gateway: Arc<StreamGateway>,
    pub engine: Arc<HealthProbeEngine>,
    pub flusher: Arc<WatchFlusher>,
    started_at: Instant,
    jobs: Mutex<Vec<JobHandle>>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Create a new service container with the given database pool.
    pub async fn new(pool: SqlitePool, config: AppConfig) -> Result<Self> {
        Self::with_clock(pool, config, Arc::new(SystemClock)).await
    }

    /// Create a new service container with a custom clock.
    pub async fn with_clock(
        pool: SqlitePool,
        config: AppConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        info!("Initializing service container");

        // Create repositories
        let channels: Arc<dyn ChannelRepository> =
            Arc::new(SqlxChannelRepository::new(pool.clone()));
        let viewers: Arc<dyn ViewerRepository> = Arc::new(SqlxViewerRepository::new(pool.clone()));
        let records: Arc<dyn WatchRecordRepository> =
            Arc::new(SqlxWatchRecordRepository::new(pool.clone()));
        let settings_repo = Arc::new(SqlxSettingsRepository::new(pool.clone()));

        let live: Arc<dyn LiveConfig> = Arc::new(SettingsService::new(
            settings_repo,
            config.live_defaults.clone(),
        ));
        let registry = Arc::new(SessionRegistry::new());

        let gateway = Arc::new(StreamGateway::new(
            GatewayDeps {
                viewers: Arc::clone(&viewers),
                channels: Arc::clone(&channels),
                records: Arc::clone(&records),
                registry: Arc::clone(&registry),
                live: Arc::clone(&live),
                clock: Arc::clone(&clock),
            },
            GatewayOptions::from(&config),
        )?);

        let engine = Arc::new(HealthProbeEngine::new(
            Arc::clone(&channels),
            Arc::new(NetworkProber::new()?),
            Arc::clone(&live),
            Arc::clone(&clock),
        ));

        let flusher = Arc::new(WatchFlusher::new(
            Arc::clone(&registry),
            Arc::clone(&records),
            Arc::clone(&clock),
            config.zombie_threshold,
        ));

        info!("Service container initialized");

        Ok(Self {
            pool,
            config,
            channels,
            viewers,
            records,
            live,
            clock,
            registry,
            gateway,
            engine,
            flusher,
            started_at: Instant::now(),
            jobs: Mutex::new(Vec::new()),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Start the background jobs: the watch-duration flusher always, the
    /// channel probe batch when health checking is enabled.
    pub fn start_jobs(&self) {
        let mut jobs = self.jobs.lock();
        if !jobs.is_empty() {
            warn!("Background jobs already started");
            return;
        }

        let flusher = Arc::clone(&self.flusher);
        jobs.push(
            PeriodicJob::new("watch-flush", self.config.watch_flush_interval).spawn(
                &self.cancellation_token,
                move || {
                    let flusher = Arc::clone(&flusher);
                    async move {
                        match flusher.flush_once().await {
                            Ok(report) => debug!(
                                checkpointed = report.checkpointed,
                                repaired = report.repaired,
                                zombies = report.zombies,
                                "Watch flush cycle completed"
                            ),
                            Err(e) => error!(error = %e, "Watch flush cycle failed"),
                        }
                    }
                },
            ),
        );

        if self.config.health_check_enabled {
            let engine = Arc::clone(&self.engine);
            jobs.push(
                PeriodicJob::new("channel-health", self.config.health_check_interval).spawn(
                    &self.cancellation_token,
                    move || {
                        let engine = Arc::clone(&engine);
                        async move {
                            match engine.probe_all().await {
                                Ok(summary) => info!(
                                    total = summary.total,
                                    healthy = summary.healthy,
                                    unhealthy = summary.unhealthy,
                                    "Scheduled channel probe completed"
                                ),
                                Err(e) => warn!(error = %e, "Scheduled channel probe failed"),
                            }
                        }
                    },
                ),
            );
        } else {
            info!("Scheduled channel health checks disabled");
        }

        info!(jobs = jobs.len(), "Background jobs started");
    }

    /// Shared state for the API handlers.
    pub fn app_state(&self) -> AppState {
        AppState {
            start_time: self.started_at,
            gateway: Arc::clone(&self.gateway),
            engine: Arc::clone(&self.engine),
            channels: Arc::clone(&self.channels),
            viewers: Arc::clone(&self.viewers),
            clock: Arc::clone(&self.clock),
        }
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    ///
    /// Stops the jobs, then finalizes every session still open so no watch
    /// record is left without a duration.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);

        // Signal all background tasks to stop
        self.cancellation_token.cancel();

        let jobs = std::mem::take(&mut *self.jobs.lock());
        let stopped = tokio::time::timeout(timeout, async {
            for job in jobs {
                let name = job.name();
                job.join().await;
                debug!(job = name, "Background job joined");
            }
        })
        .await;
        if stopped.is_err() {
            warn!("Shutdown timeout reached while stopping background jobs");
        }

        info!("Finalizing open sessions...");
        let finalized = self.gateway.finalize_all().await;
        info!("Finalized {} open sessions", finalized);

        // Close database pool
        info!("Closing database pool...");
        self.pool.close().await;

        info!("Services shut down");
        Ok(())
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

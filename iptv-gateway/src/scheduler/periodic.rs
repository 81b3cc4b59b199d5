//! Fixed-interval background jobs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// When the first run of a job happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstRun {
    Immediately,
    AfterPeriod,
}

/// A named job run on a fixed period.
///
/// Runs never overlap: the next tick is only awaited after the current run
/// finishes, and ticks missed meanwhile are skipped. Each run executes in its
/// own task so a panic is logged and the schedule continues.
#[derive(Debug, Clone)]
pub struct PeriodicJob {
    name: &'static str,
    period: Duration,
    first_run: FirstRun,
}

impl PeriodicJob {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period: period.max(Duration::from_millis(1)),
            first_run: FirstRun::AfterPeriod,
        }
    }

    pub fn first_run(mut self, first_run: FirstRun) -> Self {
        self.first_run = first_run;
        self
    }

    /// Start the job under a child of `parent`.
    pub fn spawn<F, Fut>(self, parent: &CancellationToken, job: F) -> JobHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let name = self.name;
        let task = tokio::spawn(self.run(token.clone(), Arc::new(job)));
        JobHandle { name, token, task }
    }

    async fn run<F, Fut>(self, token: CancellationToken, job: Arc<F>)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let start = match self.first_run {
            FirstRun::Immediately => Instant::now(),
            FirstRun::AfterPeriod => Instant::now() + self.period,
        };
        let mut ticker = interval_at(start, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(job = self.name, period_secs = self.period.as_secs_f64(), "Periodic job started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            debug!(job = self.name, "Periodic job run starting");
            let mut run = tokio::spawn((*job)());
            tokio::select! {
                _ = token.cancelled() => {
                    run.abort();
                    break;
                }
                result = &mut run => {
                    if let Err(e) = result
                        && e.is_panic()
                    {
                        error!(job = self.name, "Periodic job run panicked; continuing schedule");
                    }
                }
            }
        }

        info!(job = self.name, "Periodic job stopped");
    }
}

/// Control handle of a spawned [`PeriodicJob`].
pub struct JobHandle {
    name: &'static str,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl JobHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop this job only. Other jobs under the same parent keep running.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the job loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(job = self.name, error = %e, "Periodic job loop failed");
        }
    }
}

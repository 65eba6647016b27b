use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use spend_recon_core::SweepConfig;
use spend_recon_engine::{PassReport, ReconService};

pub struct SweepScheduler {
    config: SweepConfig,
    service: Arc<ReconService>,
}

impl SweepScheduler {
    /// Creates a new sweep scheduler.
    #[must_use]
    pub fn new(config: SweepConfig, service: Arc<ReconService>) -> Self {
        Self { config, service }
    }

    /// Registers the sweep job and starts ticking.
    ///
    /// Returns `None` when the sweep is disabled. The caller keeps the
    /// returned scheduler alive for as long as sweeps should run.
    ///
    /// # Errors
    /// Returns an error if the cron expression is invalid or the scheduler fails to start.
    pub async fn start(&self) -> Result<Option<JobScheduler>> {
        if !self.config.enabled {
            info!("Reconciliation sweep is disabled");
            return Ok(None);
        }

        info!(cron = %self.config.cron_schedule, "Starting reconciliation sweep scheduler");

        let scheduler = JobScheduler::new().await?;
        let service = self.service.clone();

        let job = Job::new_async(self.config.cron_schedule.as_str(), move |_uuid, _lock| {
            let service = service.clone();
            Box::pin(async move {
                // A failed sweep is retried at the next tick.
                if let Err(e) = run_sweep(&service).await {
                    error!(error = %e, "Reconciliation sweep failed");
                }
            })
        })
        .with_context(|| format!("invalid sweep cron schedule '{}'", self.config.cron_schedule))?;

        scheduler.add(job).await?;
        scheduler.start().await?;

        info!("Reconciliation sweep scheduler started");
        Ok(Some(scheduler))
    }

    /// Runs one sweep now.
    ///
    /// # Errors
    /// Returns an error if the open records cannot be loaded.
    pub async fn run_once(&self) -> Result<PassReport> {
        run_sweep(&self.service).await
    }
}

async fn run_sweep(service: &ReconService) -> Result<PassReport> {
    let report = service
        .sweep()
        .await
        .context("failed to load open ad-spend reports")?;
    info!(
        processed = report.processed,
        matched = report.matched,
        need_review = report.need_review,
        left_unmatched = report.left_unmatched,
        failed = report.failed,
        "Scheduled sweep finished"
    );
    Ok(report)
}

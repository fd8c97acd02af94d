//! Stateless triggers over [`SyncPipeline`]: the hourly trailing-window cycle,
//! manual ranges and the onboarding backfill.
//!
//! "Is a sync already running for this user" is answered from the SyncJob
//! store, not from in-process state. The check is best effort: two triggers
//! can still race between the check and job creation, in which case the last
//! completed upsert per day wins.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Months, Utc};
use dayledger_core::{business_today, SyncJobStatus, SyncTrigger, SyncWindow};
use dayledger_storage::{StoreError, SyncJobStore};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::pipeline::{SyncOutcome, SyncPipeline, SyncStores};
use crate::registry::{Merchant, MerchantRegistry};

/// A running job older than this is treated as abandoned.
pub const STALE_JOB_AFTER_HOURS: i64 = 2;

pub const ABANDONED_JOB: &str = "abandoned: still running after the stale threshold";

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("unknown merchant {0}")]
    UnknownMerchant(String),
    #[error("merchant {0} is inactive")]
    Inactive(String),
    #[error("a sync is already running for {user_id} (job {job_id})")]
    AlreadyRunning { user_id: String, job_id: Uuid },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pipeline(#[from] anyhow::Error),
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub synced: Vec<(String, SyncOutcome)>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct SyncService {
    pipeline: SyncPipeline,
    registry: MerchantRegistry,
    trailing_days: u32,
    onboarding_months: u32,
}

impl SyncService {
    pub fn new(pipeline: SyncPipeline, registry: MerchantRegistry, trailing_days: u32, onboarding_months: u32) -> Self {
        Self {
            pipeline,
            registry,
            trailing_days,
            onboarding_months,
        }
    }

    pub fn stores(&self) -> &SyncStores {
        self.pipeline.stores()
    }

    fn jobs(&self) -> &Arc<dyn SyncJobStore> {
        &self.pipeline.stores().jobs
    }

    /// The in-flight job for `user_id`, if any. Running jobs past the stale
    /// threshold are finalized as failed on the way.
    async fn running_job(&self, user_id: &str, now: DateTime<Utc>) -> Result<Option<Uuid>, StoreError> {
        while let Some(mut job) = self.jobs().find_running(user_id).await? {
            if job.is_in_flight(now, Duration::hours(STALE_JOB_AFTER_HOURS)) {
                return Ok(Some(job.id));
            }
            warn!(user_id, job_id = %job.id, started_at = %job.started_at, "marking abandoned sync job as failed");
            job.status = SyncJobStatus::Failed;
            job.errors.push(ABANDONED_JOB.to_string());
            job.finished_at = Some(now);
            match self.jobs().finish(&job).await {
                Ok(()) | Err(StoreError::JobNotRunning(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn merchant(&self, user_id: &str) -> Result<&Merchant, TriggerError> {
        let merchant = self
            .registry
            .get(user_id)
            .ok_or_else(|| TriggerError::UnknownMerchant(user_id.to_string()))?;
        if !merchant.active {
            return Err(TriggerError::Inactive(user_id.to_string()));
        }
        Ok(merchant)
    }

    async fn trigger(
        &self,
        user_id: &str,
        window: SyncWindow,
        trigger: SyncTrigger,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, TriggerError> {
        let merchant = self.merchant(user_id)?;
        if let Some(job_id) = self.running_job(user_id, now).await? {
            return Err(TriggerError::AlreadyRunning {
                user_id: user_id.to_string(),
                job_id,
            });
        }
        Ok(self
            .pipeline
            .run(&merchant.user_id, &merchant.credentials, window, trigger)
            .await?)
    }

    /// Sync an arbitrary inclusive range for one merchant.
    pub async fn sync_range(&self, user_id: &str, window: SyncWindow) -> Result<SyncOutcome, TriggerError> {
        self.trigger(user_id, window, SyncTrigger::Manual, Utc::now()).await
    }

    /// Backfill for a newly onboarded merchant.
    pub async fn onboard(&self, user_id: &str, now: DateTime<Utc>) -> Result<SyncOutcome, TriggerError> {
        let window = self.onboarding_window(now);
        info!(user_id, start = %window.start, end = %window.end, "onboarding backfill");
        self.trigger(user_id, window, SyncTrigger::Onboarding, now).await
    }

    pub fn onboarding_window(&self, now: DateTime<Utc>) -> SyncWindow {
        let today = business_today(now);
        let start = today
            .checked_sub_months(Months::new(self.onboarding_months))
            .unwrap_or(today);
        SyncWindow { start, end: today }
    }

    pub fn trailing_window(&self, now: DateTime<Utc>) -> SyncWindow {
        SyncWindow::trailing(business_today(now), self.trailing_days)
    }

    /// One pass of the periodic trigger: every active merchant, one at a time.
    pub async fn run_scheduled_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let window = self.trailing_window(now);
        let mut report = CycleReport::default();

        for merchant in self.registry.active() {
            let user_id = merchant.user_id.as_str();
            match self.running_job(user_id, now).await {
                Ok(Some(job_id)) => {
                    info!(user_id, %job_id, "sync already running, skipping");
                    report.skipped.push(user_id.to_string());
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(user_id, error = %err, "checking running jobs failed, skipping");
                    report.failed.push((user_id.to_string(), err.to_string()));
                    continue;
                }
            }

            match self
                .pipeline
                .run(user_id, &merchant.credentials, window, SyncTrigger::Scheduled)
                .await
            {
                Ok(outcome) => report.synced.push((user_id.to_string(), outcome)),
                Err(err) => {
                    error!(user_id, error = %err, "scheduled sync failed");
                    report.failed.push((user_id.to_string(), format!("{err:#}")));
                }
            }
        }

        info!(
            synced = report.synced.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "scheduled cycle finished"
        );
        report
    }
}

/// Registers the periodic cycle on a cron schedule. The caller starts it.
pub async fn build_scheduler(service: Arc<SyncService>, cron: &str) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = service.clone();
        Box::pin(async move {
            service.run_scheduled_cycle(Utc::now()).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

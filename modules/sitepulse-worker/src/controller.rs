//! Job lifecycle control: status transitions, pause/resume/abort, and
//! progress persistence plus live fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use sitepulse_common::{
    redact, telemetry, Job, JobStatus, LogEvent, LogLevel, LogModule, ProjectCounters, Result,
};
use sitepulse_live::{BusEvent, EventBus, StatsUpdate};
use sitepulse_queue::{JobControl, ProgressSink};
use sitepulse_store::Store;

pub struct JobController {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    control: Arc<JobControl>,
}

impl JobController {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            control: Arc::new(JobControl::new()),
        })
    }

    pub fn control(&self) -> Arc<JobControl> {
        self.control.clone()
    }

    async fn publish_update(&self, org: Uuid, job: &Job) {
        self.bus
            .publish(
                org,
                job.project_id,
                BusEvent::JobUpdate(sitepulse_common::JobUpdate::from_job(job)),
            )
            .await;
    }

    /// Emit a live LOG event and the matching tracing record.
    pub async fn log(
        &self,
        org: Uuid,
        project_id: Uuid,
        job_id: Option<Uuid>,
        level: LogLevel,
        module: LogModule,
        message: impl Into<String>,
    ) {
        let message = redact::redact_message(&message.into());
        match level {
            LogLevel::Error => error!(%project_id, ?job_id, "{message}"),
            LogLevel::Warn => warn!(%project_id, ?job_id, "{message}"),
            _ => info!(%project_id, ?job_id, "{message}"),
        }
        let mut event = LogEvent::new(level, module, message);
        event.project_id = Some(project_id);
        event.job_id = job_id;
        self.bus.publish(org, project_id, BusEvent::Log(event)).await;
    }

    pub async fn publish_stats(&self, org: Uuid, project_id: Uuid, counters: ProjectCounters) {
        self.bus
            .publish(
                org,
                project_id,
                BusEvent::Stats(StatsUpdate {
                    project_id,
                    counters,
                }),
            )
            .await;
    }

    /// PENDING -> PROCESSING. Returns the stored job either way; callers
    /// skip work when the result is already terminal (redelivery after a
    /// cancel, for instance).
    pub async fn start(&self, org: Uuid, job_id: Uuid) -> Result<Job> {
        self.control.register(job_id);
        let job = self.store.transition_job(job_id, JobStatus::Processing, None).await?;
        if job.status == JobStatus::Processing {
            metrics::counter!(telemetry::JOBS_TOTAL, "type" => job.job_type.as_str()).increment(1);
            metrics::gauge!(telemetry::ACTIVE_JOBS).increment(1.0);
            self.publish_update(org, &job).await;
        }
        Ok(job)
    }

    pub async fn complete(&self, org: Uuid, job_id: Uuid) -> Result<Job> {
        let job = self.store.transition_job(job_id, JobStatus::Completed, None).await?;
        self.finish(org, &job).await;
        Ok(job)
    }

    pub async fn fail(&self, org: Uuid, job_id: Uuid, message: impl Into<String>) -> Result<Job> {
        let message = redact::redact_message(&message.into());
        let job = self
            .store
            .transition_job(job_id, JobStatus::Failed, Some(message.clone()))
            .await?;
        self.finish(org, &job).await;
        self.log(
            org,
            job.project_id,
            Some(job_id),
            LogLevel::Error,
            LogModule::Worker,
            message,
        )
        .await;
        Ok(job)
    }

    /// Terminal cancellation after an abort signal was observed.
    pub async fn cancel(&self, org: Uuid, job_id: Uuid) -> Result<Job> {
        let job = self
            .store
            .transition_job(job_id, JobStatus::Cancelled, Some("Job Aborted".to_string()))
            .await?;
        self.finish(org, &job).await;
        Ok(job)
    }

    async fn finish(&self, org: Uuid, job: &Job) {
        if !job.status.is_terminal() {
            return;
        }
        self.control.remove(job.id);
        metrics::gauge!(telemetry::ACTIVE_JOBS).decrement(1.0);
        if let (Some(started), Some(completed)) = (job.started_at, job.completed_at) {
            let ms = (completed - started).num_milliseconds().max(0) as f64;
            metrics::histogram!(telemetry::JOB_DURATION_MS).record(ms);
        }
        self.publish_update(org, job).await;
    }

    // -- external control surface -----------------------------------------

    pub fn pause(&self, job_id: Uuid) -> bool {
        self.control.pause(job_id)
    }

    pub fn resume(&self, job_id: Uuid) -> bool {
        self.control.resume(job_id)
    }

    /// Signal cancellation. Workers observe it at their next checkpoint
    /// and transition the job to CANCELLED.
    pub async fn abort(&self, job_id: Uuid) -> bool {
        if self.control.abort(job_id) {
            return true;
        }
        // Not running anywhere: a PENDING job can be cancelled directly.
        if let Ok(Some(job)) = self.store.get_job(job_id).await {
            if job.status == JobStatus::Pending {
                if let Ok(Some(project)) = self.store.get_project(job.project_id).await {
                    return self
                        .cancel(project.organization_id, job_id)
                        .await
                        .is_ok();
                }
            }
        }
        false
    }
}

#[async_trait]
impl ProgressSink for JobController {
    async fn progress(&self, job_id: Uuid, percent: i16, items: Option<(i64, i64)>) {
        let Ok(Some(job)) = self.store.get_job(job_id).await else {
            return;
        };
        let (processed, total) = items.unwrap_or((job.processed_items, job.total_items));
        if self
            .store
            .update_job_progress(job_id, percent, processed, total)
            .await
            .is_err()
        {
            return;
        }
        let Ok(Some(job)) = self.store.get_job(job_id).await else {
            return;
        };
        if let Ok(Some(project)) = self.store.get_project(job.project_id).await {
            self.publish_update(project.organization_id, &job).await;
        }
    }
}

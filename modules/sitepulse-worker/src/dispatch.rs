//! Bridges PENDING job records (written by the external API) onto the
//! in-process queues.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use sitepulse_common::{
    GooglePayload, IndexNowPayload, Job, JobPayload, JobType, ScannerPayload, SubmitAction,
};
use sitepulse_queue::{queues, Broker};
use sitepulse_store::Store;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const POLL_BATCH: usize = 100;

/// Build the queue payload for a stored job. Submission jobs carry their
/// URL id list in `metadata.urlIds`.
pub fn payload_for_job(job: &Job) -> Option<(&'static str, JobPayload)> {
    let url_ids = || -> Vec<Uuid> {
        job.metadata
            .get("urlIds")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().and_then(|s| s.parse().ok()))
                    .collect()
            })
            .unwrap_or_default()
    };

    match job.job_type {
        JobType::FullScan | JobType::IncrementalSync => Some((
            queues::SITEMAP_SCANNER,
            JobPayload::Scanner(ScannerPayload {
                project_id: job.project_id,
                job_id: job.id,
                sitemap_url: job
                    .metadata
                    .get("sitemapUrl")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                parent_sitemap_id: None,
                depth: 0,
            }),
        )),
        JobType::GoogleSubmission | JobType::StatusCheck => {
            let action = match job.metadata.get("action").and_then(Value::as_str) {
                Some("URL_DELETED") => SubmitAction::UrlDeleted,
                _ => SubmitAction::UrlUpdated,
            };
            Some((
                queues::GOOGLE_SUBMITTER,
                JobPayload::Google(GooglePayload {
                    project_id: job.project_id,
                    job_id: job.id,
                    url_ids: url_ids(),
                    action,
                }),
            ))
        }
        JobType::IndexnowSubmission => Some((
            queues::INDEXNOW_SUBMITTER,
            JobPayload::IndexNow(IndexNowPayload {
                project_id: job.project_id,
                job_id: job.id,
                url_ids: url_ids(),
            }),
        )),
    }
}

/// Poll for PENDING jobs and enqueue each once. Runs until the process
/// stops.
pub async fn run(store: Arc<dyn Store>, broker: Broker) {
    let mut enqueued: HashSet<Uuid> = HashSet::new();
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    loop {
        tick.tick().await;
        let pending = match store.list_pending_jobs(POLL_BATCH).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Pending job poll failed");
                continue;
            }
        };
        // Terminal jobs never come back; keep the seen-set from growing.
        enqueued.retain(|id| pending.iter().any(|j| j.id == *id));

        for job in pending {
            if !enqueued.insert(job.id) {
                continue;
            }
            match payload_for_job(&job) {
                Some((queue, payload)) => {
                    debug!(job_id = %job.id, queue, "Dispatching job");
                    if let Err(e) = broker.enqueue(queue, payload) {
                        warn!(job_id = %job.id, error = %e, "Dispatch enqueue failed");
                        enqueued.remove(&job.id);
                    }
                }
                None => warn!(job_id = %job.id, "Job has no dispatchable payload"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sitepulse_common::JobStatus;

    fn job(job_type: JobType, metadata: Value) -> Job {
        Job {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            progress: 0,
            total_items: 0,
            processed_items: 0,
            metadata,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    #[test]
    fn test_scan_job_targets_scanner_queue() {
        let job = job(JobType::FullScan, serde_json::json!({}));
        let (queue, payload) = payload_for_job(&job).unwrap();
        assert_eq!(queue, queues::SITEMAP_SCANNER);
        match payload {
            JobPayload::Scanner(p) => {
                assert_eq!(p.job_id, job.id);
                assert_eq!(p.depth, 0);
                assert!(p.sitemap_url.is_none());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_google_job_carries_url_ids_and_action() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let job = job(
            JobType::GoogleSubmission,
            serde_json::json!({ "urlIds": [a.to_string(), b.to_string()], "action": "URL_DELETED" }),
        );
        let (queue, payload) = payload_for_job(&job).unwrap();
        assert_eq!(queue, queues::GOOGLE_SUBMITTER);
        match payload {
            JobPayload::Google(p) => {
                assert_eq!(p.url_ids, vec![a, b]);
                assert_eq!(p.action, SubmitAction::UrlDeleted);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_status_check_rides_google_queue() {
        let job = job(JobType::StatusCheck, serde_json::json!({ "urlIds": [] }));
        let (queue, _) = payload_for_job(&job).unwrap();
        assert_eq!(queue, queues::GOOGLE_SUBMITTER);
    }
}

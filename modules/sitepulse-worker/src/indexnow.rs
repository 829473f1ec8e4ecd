//! IndexNow submitter: one batch, fanned out to the participating
//! engines in parallel, with adaptive batch halving when an endpoint
//! rejects the full list.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use tracing::warn;

use sitepulse_common::{
    telemetry, EncryptedSecret, Engine, IndexNowPayload, JobPayload, JobStatus, LogLevel,
    LogModule, Result, SitepulseError, SubmissionStatus, SubmitAction, UrlStatus, Vault,
};
use sitepulse_queue::{JobContext, JobHandler};
use sitepulse_store::{NewSubmission, Store};

use crate::controller::JobController;

/// Participating engines, fanned out per batch.
pub const ENDPOINTS: [(&str, &str); 4] = [
    ("bing", "https://www.bing.com/indexnow"),
    ("yandex", "https://yandex.com/indexnow"),
    ("seznam", "https://search.seznam.cz/indexnow"),
    ("naver", "https://searchadvisor.naver.com/indexnow"),
];

const ENDPOINT_CONCURRENCY: usize = 4;
const ENDPOINT_DEADLINE: Duration = Duration::from_secs(30);
const ENDPOINT_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(1);
const SPLIT_THRESHOLD: usize = 10;
const SPLIT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct IndexNowBody {
    pub host: String,
    pub key: String,
    #[serde(rename = "keyLocation")]
    pub key_location: String,
    #[serde(rename = "urlList")]
    pub url_list: Vec<String>,
}

/// HTTP seam: POST one body to one endpoint, return the status code.
/// Network-level failures surface as `Transient`.
#[async_trait]
pub trait IndexNowApi: Send + Sync {
    async fn submit(&self, endpoint_url: &str, body: &IndexNowBody) -> Result<u16>;
}

pub struct HttpIndexNowApi {
    client: reqwest::Client,
}

impl HttpIndexNowApi {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(ENDPOINT_DEADLINE)
            .build()
            .expect("Failed to build IndexNow client");
        Self { client }
    }
}

impl Default for HttpIndexNowApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexNowApi for HttpIndexNowApi {
    async fn submit(&self, endpoint_url: &str, body: &IndexNowBody) -> Result<u16> {
        let started = std::time::Instant::now();
        let response = self
            .client
            .post(endpoint_url)
            .header("Content-Type", "application/json; charset=utf-8")
            .json(body)
            .send()
            .await
            .map_err(|e| SitepulseError::Transient(format!("indexnow request: {e}")))?;
        metrics::histogram!(telemetry::API_LATENCY_MS)
            .record(started.elapsed().as_millis() as f64);
        Ok(response.status().as_u16())
    }
}

pub struct IndexNowWorker {
    store: Arc<dyn Store>,
    api: Arc<dyn IndexNowApi>,
    vault: Vault,
    controller: Arc<JobController>,
}

impl IndexNowWorker {
    pub fn new(
        store: Arc<dyn Store>,
        api: Arc<dyn IndexNowApi>,
        vault: Vault,
        controller: Arc<JobController>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            api,
            vault,
            controller,
        })
    }

    async fn run(&self, payload: IndexNowPayload, ctx: JobContext) -> Result<()> {
        let project = self
            .store
            .get_project(payload.project_id)
            .await?
            .ok_or_else(|| SitepulseError::NotFound(format!("project {}", payload.project_id)))?;
        let org = project.organization_id;

        let job = self.controller.start(org, payload.job_id).await?;
        if job.status != JobStatus::Processing {
            return Ok(());
        }

        let result = self.run_batch(&payload, &project.domain, org, &ctx).await;
        match result {
            Ok(()) => Ok(()),
            Err(SitepulseError::Aborted) => {
                self.controller.cancel(org, payload.job_id).await?;
                Ok(())
            }
            Err(e) => {
                if !e.is_retryable() || ctx.attempt >= 3 {
                    self.controller.fail(org, payload.job_id, e.to_string()).await?;
                }
                Err(e)
            }
        }
    }

    async fn run_batch(
        &self,
        payload: &IndexNowPayload,
        host: &str,
        org: uuid::Uuid,
        ctx: &JobContext,
    ) -> Result<()> {
        let credential = self
            .store
            .get_credential(payload.project_id, Engine::Indexnow)
            .await?
            .ok_or_else(|| {
                SitepulseError::InvalidCredential("no IndexNow key on file".to_string())
            })?;
        let key = self
            .vault
            .decrypt(&EncryptedSecret {
                ciphertext: credential.encrypted_data.clone(),
                iv: credential.iv.clone(),
                auth_tag: credential.auth_tag.clone(),
                salt: credential.salt.clone(),
            })?
            .expose()
            .to_string();
        self.store
            .stamp_credential_used(credential.id, Utc::now())
            .await?;

        let urls = self.store.list_urls_by_ids(&payload.url_ids).await?;
        if urls.is_empty() {
            self.controller.complete(org, payload.job_id).await?;
            return Ok(());
        }
        let locs: Vec<String> = urls.iter().map(|u| u.loc.clone()).collect();
        let total = urls.len() as i64;
        ctx.report_items(0, total).await;

        let body_template = IndexNowBody {
            host: host.to_string(),
            key: key.clone(),
            key_location: format!("https://{host}/{key}.txt"),
            url_list: Vec::new(),
        };

        ctx.checkpoint().await?;

        // Fan out to all engines in parallel; each engine reports which
        // URLs it accepted after any adaptive splitting.
        let mut engine_futures: Vec<BoxFuture<'_, (&str, Vec<bool>)>> =
            Vec::with_capacity(ENDPOINTS.len());
        for (engine, endpoint) in ENDPOINTS.iter().copied() {
            engine_futures.push(
                self.submit_one_engine(ctx, engine, endpoint, &body_template, &locs)
                    .boxed(),
            );
        }
        let outcomes: Vec<(&str, Vec<bool>)> = stream::iter(engine_futures)
            .buffer_unordered(ENDPOINT_CONCURRENCY)
            .collect()
            .await;

        ctx.checkpoint().await?;

        // A URL counts as submitted when at least one engine accepted the
        // batch that contained it.
        let mut accepted_any = vec![false; urls.len()];
        for (engine, accepted) in &outcomes {
            let count = accepted.iter().filter(|a| **a).count();
            self.controller
                .log(
                    org,
                    payload.project_id,
                    Some(payload.job_id),
                    if count > 0 { LogLevel::Info } else { LogLevel::Warn },
                    LogModule::Api,
                    format!("IndexNow {engine}: accepted {count}/{} URLs", urls.len()),
                )
                .await;
            for (slot, flag) in accepted_any.iter_mut().zip(accepted.iter()) {
                *slot |= *flag;
            }
        }

        let now = Utc::now();
        let mut submissions = Vec::with_capacity(urls.len());
        let mut submitted = 0i64;
        for (url, accepted) in urls.iter().zip(accepted_any.iter()) {
            let status = if *accepted {
                submitted += 1;
                metrics::counter!(telemetry::INDEXNOW_SUBMISSIONS_TOTAL, "status" => "success")
                    .increment(1);
                self.store
                    .set_url_engine_status(url.id, Engine::Indexnow, UrlStatus::Submitted, Some(now))
                    .await?;
                SubmissionStatus::Completed
            } else {
                metrics::counter!(telemetry::INDEXNOW_SUBMISSIONS_TOTAL, "status" => "failed")
                    .increment(1);
                SubmissionStatus::Failed
            };
            submissions.push(NewSubmission {
                url_id: url.id,
                project_id: payload.project_id,
                engine: Engine::Indexnow,
                action: SubmitAction::UrlUpdated,
                status,
                attempts: 1,
                response_code: None,
                error_message: (!accepted).then(|| "no engine accepted".to_string()),
                started_at: Some(now),
                completed_at: Some(now),
                next_retry_at: None,
            });
        }
        self.store.append_submissions(&submissions).await?;

        if submitted > 0 {
            let today = now.date_naive();
            self.store
                .add_quota_used(payload.project_id, Engine::Indexnow, today, submitted, i64::MAX)
                .await?;
            self.store
                .touch_project_submission(payload.project_id, now)
                .await?;
        }

        ctx.report_items(submitted, total).await;
        self.controller.complete(org, payload.job_id).await?;
        self.controller
            .log(
                org,
                payload.project_id,
                Some(payload.job_id),
                LogLevel::Success,
                LogModule::Worker,
                format!("IndexNow batch finished: {submitted}/{total} URLs accepted"),
            )
            .await;
        Ok(())
    }

    async fn submit_one_engine<'a>(
        &'a self,
        ctx: &'a JobContext,
        engine: &'a str,
        endpoint: &'a str,
        template: &'a IndexNowBody,
        locs: &'a [String],
    ) -> (&'a str, Vec<bool>) {
        let accepted = self
            .submit_split(ctx, endpoint, template, locs)
            .await
            .unwrap_or_else(|e| {
                warn!(engine, error = %e, "IndexNow endpoint gave up");
                vec![false; locs.len()]
            });
        (engine, accepted)
    }

    /// Submit `locs` to one endpoint. On 429/422 with a splittable list,
    /// wait a beat, halve, and recurse; partial acceptance sums up.
    fn submit_split<'a>(
        &'a self,
        ctx: &'a JobContext,
        endpoint: &'a str,
        template: &'a IndexNowBody,
        locs: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<bool>>> {
        async move {
            ctx.checkpoint().await?;

            let body = IndexNowBody {
                url_list: locs.to_vec(),
                ..template.clone()
            };

            let mut status = 0u16;
            for attempt in 1..=ENDPOINT_ATTEMPTS {
                match self.api.submit(endpoint, &body).await {
                    Ok(code) => {
                        status = code;
                        // Retry server errors in place; everything else is
                        // decided below.
                        if (500..600).contains(&code) && attempt < ENDPOINT_ATTEMPTS {
                            tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt - 1)).await;
                            continue;
                        }
                        break;
                    }
                    Err(e) => {
                        if attempt < ENDPOINT_ATTEMPTS {
                            tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt - 1)).await;
                            continue;
                        }
                        return Err(e);
                    }
                }
            }

            match status {
                200 | 202 => Ok(vec![true; locs.len()]),
                429 | 422 if locs.len() > SPLIT_THRESHOLD => {
                    tokio::time::sleep(SPLIT_PAUSE).await;
                    let mid = locs.len() / 2;
                    let mut left = self
                        .submit_split(ctx, endpoint, template, &locs[..mid])
                        .await?;
                    let right = self
                        .submit_split(ctx, endpoint, template, &locs[mid..])
                        .await?;
                    left.extend(right);
                    Ok(left)
                }
                400 | 403 => {
                    // Invalid request or key: this endpoint is done.
                    warn!(endpoint, status, "IndexNow rejected the batch outright");
                    Ok(vec![false; locs.len()])
                }
                _ => Ok(vec![false; locs.len()]),
            }
        }
        .boxed()
    }
}

#[async_trait]
impl JobHandler for IndexNowWorker {
    async fn handle(&self, payload: JobPayload, ctx: JobContext) -> Result<()> {
        let JobPayload::IndexNow(payload) = payload else {
            return Err(SitepulseError::Config(
                "indexnow submitter received non-indexnow payload".to_string(),
            ));
        };
        self.run(payload, ctx).await
    }
}

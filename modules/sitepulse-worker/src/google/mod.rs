//! Google Indexing API submitter. One URL at a time under a daily
//! quota, with fatal classification for permission and quota failures.
//! Also serves STATUS_CHECK jobs through the metadata read endpoint.

pub mod auth;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use sitepulse_common::{
    telemetry, EncryptedSecret, Engine, GooglePayload, JobPayload, JobStatus, JobType, LogLevel,
    LogModule, Result, SitepulseError, SubmissionStatus, SubmitAction, UrlStatus, Vault,
};
use sitepulse_queue::{JobContext, JobHandler};
use sitepulse_store::{NewSubmission, Store, UrlRef};

use crate::controller::JobController;

pub const PUBLISH_URL: &str = "https://indexing.googleapis.com/v3/urlNotifications:publish";
pub const METADATA_URL: &str = "https://indexing.googleapis.com/v3/urlNotifications/metadata";

const PER_URL_ATTEMPTS: u32 = 3;
const REQUEST_SPACING: Duration = Duration::from_secs(1);
const RETRY_BASE: Duration = Duration::from_secs(1);

/// Rate-limit backoff for plain 429s: 2 s, 3 s, 4.5 s.
fn rate_limit_delay(retry: u32) -> Duration {
    Duration::from_millis((2000.0 * 1.5f64.powi(retry as i32)) as u64)
}

#[derive(Debug, Clone)]
pub struct GoogleResponse {
    pub status: u16,
    pub body: String,
}

impl GoogleResponse {
    /// The API's error message, when the body carries one.
    pub fn error_message(&self) -> String {
        serde_json::from_str::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| self.body.chars().take(200).collect())
    }
}

/// HTTP seam for the Indexing API. Network-level failures surface as
/// `Transient`; HTTP status handling stays with the worker.
#[async_trait]
pub trait GoogleApi: Send + Sync {
    async fn fetch_token(&self, service_account_json: &str) -> Result<String>;
    async fn publish(&self, token: &str, url: &str, action: SubmitAction)
        -> Result<GoogleResponse>;
    async fn metadata(&self, token: &str, url: &str) -> Result<GoogleResponse>;
}

pub struct HttpGoogleApi {
    client: reqwest::Client,
}

impl HttpGoogleApi {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build Google API client");
        Self { client }
    }

    async fn read(&self, response: reqwest::Response) -> Result<GoogleResponse> {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| SitepulseError::Transient(format!("response read: {e}")))?;
        Ok(GoogleResponse { status, body })
    }
}

impl Default for HttpGoogleApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GoogleApi for HttpGoogleApi {
    async fn fetch_token(&self, service_account_json: &str) -> Result<String> {
        let key = auth::parse_service_account(service_account_json)?;
        let assertion = auth::build_assertion(&key, Utc::now())?;

        let started = Instant::now();
        let response = self
            .client
            .post(auth::TOKEN_URL)
            .form(&[
                ("grant_type", auth::JWT_GRANT_TYPE),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SitepulseError::Transient(format!("token exchange: {e}")))?;
        metrics::histogram!(telemetry::API_LATENCY_MS)
            .record(started.elapsed().as_millis() as f64);

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SitepulseError::InvalidCredential(format!(
                "token endpoint returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        let token: auth::TokenResponse = response
            .json()
            .await
            .map_err(|e| SitepulseError::InvalidCredential(format!("token decode: {e}")))?;
        Ok(token.access_token)
    }

    async fn publish(
        &self,
        token: &str,
        url: &str,
        action: SubmitAction,
    ) -> Result<GoogleResponse> {
        let started = Instant::now();
        let response = self
            .client
            .post(PUBLISH_URL)
            .bearer_auth(token)
            .json(&serde_json::json!({ "url": url, "type": action.as_str() }))
            .send()
            .await
            .map_err(|e| SitepulseError::Transient(format!("publish request: {e}")))?;
        metrics::histogram!(telemetry::API_LATENCY_MS)
            .record(started.elapsed().as_millis() as f64);
        self.read(response).await
    }

    async fn metadata(&self, token: &str, url: &str) -> Result<GoogleResponse> {
        let response = self
            .client
            .get(METADATA_URL)
            .query(&[("url", url)])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SitepulseError::Transient(format!("metadata request: {e}")))?;
        self.read(response).await
    }
}

// ---------------------------------------------------------------------------
// Response classification
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Outcome {
    Success,
    /// Plain 429 with no quota semantics.
    RetryRateLimit,
    /// 5xx.
    RetryServer,
    FatalPermission(String),
    FatalQuota(String),
    /// 4xx other than the fatal cases; recorded per URL.
    UrlError(String),
}

fn classify(response: &GoogleResponse) -> Outcome {
    let message = response.error_message();
    let lowered = message.to_lowercase();
    match response.status {
        200..=299 => Outcome::Success,
        403 if lowered.contains("permission") || lowered.contains("ownership") => {
            Outcome::FatalPermission(message)
        }
        429 if lowered.contains("quota") => Outcome::FatalQuota(message),
        429 => Outcome::RetryRateLimit,
        400..=499 => Outcome::UrlError(message),
        _ => Outcome::RetryServer,
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// What ended one URL's attempt loop.
enum UrlResult {
    Success,
    Error { status: UrlStatus, code: Option<i32>, message: String },
    Fatal(SitepulseError),
}

pub struct GoogleWorker {
    store: Arc<dyn Store>,
    api: Arc<dyn GoogleApi>,
    vault: Vault,
    controller: Arc<JobController>,
    daily_quota: i64,
}

impl GoogleWorker {
    pub fn new(
        store: Arc<dyn Store>,
        api: Arc<dyn GoogleApi>,
        vault: Vault,
        controller: Arc<JobController>,
        daily_quota: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            api,
            vault,
            controller,
            daily_quota,
        })
    }

    async fn bearer_token(&self, project_id: uuid::Uuid) -> Result<(uuid::Uuid, String)> {
        let credential = self
            .store
            .get_credential(project_id, Engine::Google)
            .await?
            .ok_or_else(|| {
                SitepulseError::InvalidCredential("no Google credential on file".to_string())
            })?;
        if !credential.is_valid {
            return Err(SitepulseError::InvalidCredential(
                "Google credential marked invalid".to_string(),
            ));
        }

        let secret = EncryptedSecret {
            ciphertext: credential.encrypted_data.clone(),
            iv: credential.iv.clone(),
            auth_tag: credential.auth_tag.clone(),
            salt: credential.salt.clone(),
        };
        let plaintext = match self.vault.decrypt(&secret) {
            Ok(p) => p,
            Err(e) => {
                self.store.mark_credential_invalid(credential.id).await?;
                return Err(e);
            }
        };
        // Plaintext is dropped (and wiped) as soon as the token exists.
        let token = self.api.fetch_token(plaintext.expose()).await?;
        self.store
            .stamp_credential_used(credential.id, Utc::now())
            .await?;
        Ok((credential.id, token))
    }

    async fn run(&self, payload: GooglePayload, ctx: JobContext) -> Result<()> {
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

        let result = if job.job_type == JobType::StatusCheck {
            self.run_status_check(&payload, org, &ctx).await
        } else {
            self.run_submission(&payload, org, &ctx).await
        };

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

    async fn run_submission(
        &self,
        payload: &GooglePayload,
        org: uuid::Uuid,
        ctx: &JobContext,
    ) -> Result<()> {
        let project_id = payload.project_id;
        let (_credential_id, token) = self.bearer_token(project_id).await?;

        // Quota check before any traffic.
        let today = Utc::now().date_naive();
        let used = self
            .store
            .get_quota(project_id, Engine::Google, today)
            .await?
            .map(|q| q.used)
            .unwrap_or(0);
        let remaining = self.daily_quota - used;
        if remaining <= 0 {
            return Err(SitepulseError::QuotaExhausted {
                used,
                limit: self.daily_quota,
            });
        }

        let capped = (remaining as usize).min(payload.url_ids.len());
        let skipped = payload.url_ids.len() - capped;
        if skipped > 0 {
            self.controller
                .log(
                    org,
                    project_id,
                    Some(payload.job_id),
                    LogLevel::Warn,
                    LogModule::Worker,
                    format!(
                        "Daily quota allows {capped} of {} URLs; {skipped} deferred",
                        payload.url_ids.len()
                    ),
                )
                .await;
        }

        let urls = self.store.list_urls_by_ids(&payload.url_ids[..capped]).await?;
        let total = urls.len() as i64;
        let mut successes = 0i64;
        let mut fatal: Option<SitepulseError> = None;

        for (index, url) in urls.iter().enumerate() {
            if let Err(e) = ctx.checkpoint().await {
                // Count what already succeeded before leaving.
                self.settle(project_id, org, successes, today).await?;
                return Err(e);
            }
            if index > 0 {
                tokio::time::sleep(REQUEST_SPACING).await;
            }

            let result = self.submit_one(&token, url, payload.action).await;
            match result {
                UrlResult::Success => {
                    successes += 1;
                    self.record_submission(payload, url, SubmissionStatus::Completed, Some(200), None)
                        .await?;
                    self.store
                        .set_url_engine_status(
                            url.id,
                            Engine::Google,
                            UrlStatus::Submitted,
                            Some(Utc::now()),
                        )
                        .await?;
                    metrics::counter!(telemetry::GOOGLE_SUBMISSIONS_TOTAL, "status" => "success")
                        .increment(1);
                }
                UrlResult::Error { status, code, message } => {
                    self.record_submission(
                        payload,
                        url,
                        SubmissionStatus::Failed,
                        code,
                        Some(message.clone()),
                    )
                    .await?;
                    self.store
                        .set_url_engine_status(url.id, Engine::Google, status, None)
                        .await?;
                    metrics::counter!(telemetry::GOOGLE_SUBMISSIONS_TOTAL, "status" => "failed")
                        .increment(1);
                    self.controller
                        .log(
                            org,
                            project_id,
                            Some(payload.job_id),
                            LogLevel::Warn,
                            LogModule::Api,
                            format!("Submission failed for {}: {message}", url.loc),
                        )
                        .await;
                }
                UrlResult::Fatal(e) => {
                    let code = match &e {
                        SitepulseError::PermissionDenied(_) => Some(403),
                        SitepulseError::QuotaExceeded(_) => Some(429),
                        _ => None,
                    };
                    self.record_submission(
                        payload,
                        url,
                        SubmissionStatus::Failed,
                        code,
                        Some(e.to_string()),
                    )
                    .await?;
                    metrics::counter!(telemetry::GOOGLE_SUBMISSIONS_TOTAL, "status" => "fatal")
                        .increment(1);
                    fatal = Some(e);
                }
            }

            ctx.report_items((index + 1) as i64, total).await;

            if fatal.is_some() {
                break;
            }
        }

        self.settle(project_id, org, successes, today).await?;

        if let Some(e) = fatal {
            return Err(e);
        }

        self.controller.complete(org, payload.job_id).await?;
        self.controller
            .log(
                org,
                project_id,
                Some(payload.job_id),
                LogLevel::Success,
                LogModule::Worker,
                format!("Google submission finished: {successes}/{total} accepted"),
            )
            .await;
        Ok(())
    }

    /// Quota accounting and counter refresh after a submission pass,
    /// successful or not.
    async fn settle(
        &self,
        project_id: uuid::Uuid,
        org: uuid::Uuid,
        successes: i64,
        today: chrono::NaiveDate,
    ) -> Result<()> {
        if successes > 0 {
            self.store
                .add_quota_used(project_id, Engine::Google, today, successes, self.daily_quota)
                .await?;
            self.store
                .touch_project_submission(project_id, Utc::now())
                .await?;
        }
        let counters = self.store.update_project_counters(project_id).await?;
        self.controller.publish_stats(org, project_id, counters).await;
        Ok(())
    }

    async fn submit_one(&self, token: &str, url: &UrlRef, action: SubmitAction) -> UrlResult {
        let mut rate_limit_retries = 0u32;
        for attempt in 1..=PER_URL_ATTEMPTS {
            let response = match self.api.publish(token, &url.loc, action).await {
                Ok(r) => r,
                Err(e) => {
                    if attempt < PER_URL_ATTEMPTS {
                        tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt - 1)).await;
                        continue;
                    }
                    return UrlResult::Error {
                        status: UrlStatus::CrawlError,
                        code: None,
                        message: e.to_string(),
                    };
                }
            };

            match classify(&response) {
                Outcome::Success => return UrlResult::Success,
                Outcome::FatalPermission(msg) => {
                    return UrlResult::Fatal(SitepulseError::PermissionDenied(msg))
                }
                Outcome::FatalQuota(msg) => {
                    return UrlResult::Fatal(SitepulseError::QuotaExceeded(msg))
                }
                Outcome::UrlError(msg) => {
                    return UrlResult::Error {
                        status: UrlStatus::Error4xx,
                        code: Some(response.status as i32),
                        message: msg,
                    }
                }
                Outcome::RetryRateLimit => {
                    if attempt < PER_URL_ATTEMPTS {
                        tokio::time::sleep(rate_limit_delay(rate_limit_retries)).await;
                        rate_limit_retries += 1;
                        continue;
                    }
                    return UrlResult::Error {
                        status: UrlStatus::Error4xx,
                        code: Some(429),
                        message: "rate limited".to_string(),
                    };
                }
                Outcome::RetryServer => {
                    if attempt < PER_URL_ATTEMPTS {
                        tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt - 1)).await;
                        continue;
                    }
                    return UrlResult::Error {
                        status: UrlStatus::Error5xx,
                        code: Some(response.status as i32),
                        message: response.error_message(),
                    };
                }
            }
        }
        unreachable!("attempt loop always returns")
    }

    async fn record_submission(
        &self,
        payload: &GooglePayload,
        url: &UrlRef,
        status: SubmissionStatus,
        response_code: Option<i32>,
        error_message: Option<String>,
    ) -> Result<()> {
        let now = Utc::now();
        self.store
            .append_submissions(&[NewSubmission {
                url_id: url.id,
                project_id: payload.project_id,
                engine: Engine::Google,
                action: payload.action,
                status,
                attempts: 1,
                response_code,
                error_message,
                started_at: Some(now),
                completed_at: Some(now),
                next_retry_at: None,
            }])
            .await
    }

    /// STATUS_CHECK: read notification metadata per URL and stamp what we
    /// learn. Quota-free read path, same fatal classification.
    async fn run_status_check(
        &self,
        payload: &GooglePayload,
        org: uuid::Uuid,
        ctx: &JobContext,
    ) -> Result<()> {
        let project_id = payload.project_id;
        let (_credential_id, token) = self.bearer_token(project_id).await?;
        let urls = self.store.list_urls_by_ids(&payload.url_ids).await?;
        let total = urls.len() as i64;

        for (index, url) in urls.iter().enumerate() {
            ctx.checkpoint().await?;

            let response = match self.api.metadata(&token, &url.loc).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(url = %url.loc, error = %e, "Metadata read failed");
                    continue;
                }
            };
            match classify(&response) {
                Outcome::Success => {
                    self.store
                        .stamp_url_checked(url.id, Engine::Google, Utc::now())
                        .await?;
                    let indexed = serde_json::from_str::<serde_json::Value>(&response.body)
                        .ok()
                        .and_then(|v| {
                            v.pointer("/latestUpdate/type")
                                .and_then(|t| t.as_str())
                                .map(|t| t == "URL_UPDATED")
                        })
                        .unwrap_or(false);
                    if indexed {
                        self.store
                            .set_url_engine_status(url.id, Engine::Google, UrlStatus::Indexed, None)
                            .await?;
                    }
                }
                Outcome::FatalPermission(msg) => {
                    return Err(SitepulseError::PermissionDenied(msg))
                }
                Outcome::FatalQuota(msg) => return Err(SitepulseError::QuotaExceeded(msg)),
                // 404 means Google has no notification on file; fine.
                _ => {
                    self.store
                        .stamp_url_checked(url.id, Engine::Google, Utc::now())
                        .await?;
                }
            }
            ctx.report_items((index + 1) as i64, total).await;
        }

        let counters = self.store.update_project_counters(project_id).await?;
        self.controller.publish_stats(org, project_id, counters).await;
        self.controller.complete(org, payload.job_id).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for GoogleWorker {
    async fn handle(&self, payload: JobPayload, ctx: JobContext) -> Result<()> {
        let JobPayload::Google(payload) = payload else {
            return Err(SitepulseError::Config(
                "google submitter received non-google payload".to_string(),
            ));
        };
        self.run(payload, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> GoogleResponse {
        GoogleResponse {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_classify_success() {
        assert!(matches!(classify(&response(200, "{}")), Outcome::Success));
        assert!(matches!(classify(&response(204, "")), Outcome::Success));
    }

    #[test]
    fn test_classify_permission_fatal() {
        let r = response(403, r#"{"error":{"message":"Permission denied: ownership"}}"#);
        assert!(matches!(classify(&r), Outcome::FatalPermission(_)));
    }

    #[test]
    fn test_classify_plain_403_is_url_error() {
        let r = response(403, r#"{"error":{"message":"Forbidden"}}"#);
        assert!(matches!(classify(&r), Outcome::UrlError(_)));
    }

    #[test]
    fn test_classify_quota_429_fatal() {
        let r = response(429, r#"{"error":{"message":"Quota exceeded for quota metric"}}"#);
        assert!(matches!(classify(&r), Outcome::FatalQuota(_)));
    }

    #[test]
    fn test_classify_plain_429_retries() {
        let r = response(429, r#"{"error":{"message":"Too many requests"}}"#);
        assert!(matches!(classify(&r), Outcome::RetryRateLimit));
    }

    #[test]
    fn test_classify_5xx_retries() {
        assert!(matches!(classify(&response(503, "")), Outcome::RetryServer));
    }

    #[test]
    fn test_classify_other_4xx_per_url() {
        let r = response(400, r#"{"error":{"message":"Invalid URL"}}"#);
        assert!(matches!(classify(&r), Outcome::UrlError(_)));
    }

    #[test]
    fn test_rate_limit_backoff_curve() {
        assert_eq!(rate_limit_delay(0), Duration::from_millis(2000));
        assert_eq!(rate_limit_delay(1), Duration::from_millis(3000));
        assert_eq!(rate_limit_delay(2), Duration::from_millis(4500));
    }

    #[test]
    fn test_error_message_extraction() {
        let r = response(403, r#"{"error":{"code":403,"message":"nope"}}"#);
        assert_eq!(r.error_message(), "nope");
        let r = response(500, "plain text failure");
        assert_eq!(r.error_message(), "plain text failure");
    }
}

//! Persistence layer. `PgStore` is the production implementation; the
//! `Store` trait is the seam workers depend on, with an in-memory twin
//! behind the `test-support` feature.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use sitepulse_common::{
    Credential, DiscoveredUrl, Engine, Job, JobStatus, JobType, Project, ProjectCounters,
    QuotaUsage, Result, Sitemap, SitemapKind, SubmitAction, SubmissionStatus, UrlEntry, UrlStatus,
};

mod pg;
pub use pg::PgStore;

#[cfg(feature = "test-support")]
pub mod memory;

/// Maximum rows per upsert statement. Larger inputs are chunked.
pub const UPSERT_BATCH_SIZE: usize = 500;

/// `{id, loc}` pair handed to the submitters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRef {
    pub id: Uuid,
    pub loc: String,
}

/// Parameters for upserting a sitemap record, keyed on (project_id, url).
#[derive(Debug, Clone)]
pub struct UpsertSitemap {
    pub project_id: Uuid,
    pub url: String,
    pub kind: SitemapKind,
    pub parent_id: Option<Uuid>,
    pub url_count: i32,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub project_id: Uuid,
    pub job_type: JobType,
    pub metadata: serde_json::Value,
}

/// One submission attempt outcome, appended per URL.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub url_id: Uuid,
    pub project_id: Uuid,
    pub engine: Engine,
    pub action: SubmitAction,
    pub status: SubmissionStatus,
    pub attempts: i32,
    pub response_code: Option<i32>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewCredential {
    pub project_id: Uuid,
    pub engine: Engine,
    pub kind: String,
    pub encrypted_data: String,
    pub iv: String,
    pub auth_tag: String,
    pub salt: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- projects ----------------------------------------------------------

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>>;

    /// Recompute cached counters from url_entries.google_status in a single
    /// transaction. Eventually consistent by design.
    async fn update_project_counters(&self, project_id: Uuid) -> Result<ProjectCounters>;

    async fn touch_project_scan(&self, project_id: Uuid, at: DateTime<Utc>) -> Result<()>;
    async fn touch_project_submission(&self, project_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    // -- sitemaps ----------------------------------------------------------

    async fn get_sitemap(&self, project_id: Uuid, url: &str) -> Result<Option<Sitemap>>;
    async fn upsert_sitemap(&self, rec: UpsertSitemap) -> Result<Uuid>;

    // -- url entries -------------------------------------------------------

    /// Idempotent bulk upsert keyed by (project_id, SHA-256(loc)).
    /// `first_seen_at` and engine statuses are untouched on conflict.
    async fn upsert_urls(
        &self,
        project_id: Uuid,
        sitemap_id: Option<Uuid>,
        entries: &[DiscoveredUrl],
    ) -> Result<u64>;

    async fn list_urls_by_ids(&self, ids: &[Uuid]) -> Result<Vec<UrlRef>>;
    async fn get_url(&self, id: Uuid) -> Result<Option<UrlEntry>>;

    /// Set the per-engine status; when `submitted_at` is given the engine's
    /// submitted timestamp is stamped too.
    async fn set_url_engine_status(
        &self,
        url_id: Uuid,
        engine: Engine,
        status: UrlStatus,
        submitted_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn stamp_url_checked(&self, url_id: Uuid, engine: Engine, at: DateTime<Utc>)
        -> Result<()>;

    // -- jobs --------------------------------------------------------------

    /// Create a PENDING job. For scan-type jobs, fails with `Conflict` if
    /// the project already has a PENDING or PROCESSING scan.
    async fn create_job(&self, job: NewJob) -> Result<Job>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// Oldest PENDING jobs, for the dispatcher that feeds the queues.
    async fn list_pending_jobs(&self, limit: usize) -> Result<Vec<Job>>;

    /// Apply a state-machine transition. Illegal transitions out of a
    /// terminal state are ignored and the stored job is returned as-is.
    async fn transition_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job>;

    /// Progress only ever advances; the stored value is the max of the old
    /// and new percent.
    async fn update_job_progress(
        &self,
        id: Uuid,
        progress: i16,
        processed_items: i64,
        total_items: i64,
    ) -> Result<()>;

    // -- submissions -------------------------------------------------------

    async fn append_submissions(&self, subs: &[NewSubmission]) -> Result<()>;
    async fn list_submissions(&self, project_id: Uuid, engine: Engine)
        -> Result<Vec<sitepulse_common::Submission>>;

    // -- quota -------------------------------------------------------------

    async fn get_quota(
        &self,
        project_id: Uuid,
        engine: Engine,
        date: NaiveDate,
    ) -> Result<Option<QuotaUsage>>;

    /// Atomic `used = used + delta` upsert. Returns the new `used`.
    async fn add_quota_used(
        &self,
        project_id: Uuid,
        engine: Engine,
        date: NaiveDate,
        delta: i64,
        limit: i64,
    ) -> Result<i64>;

    // -- credentials -------------------------------------------------------

    async fn get_credential(&self, project_id: Uuid, engine: Engine) -> Result<Option<Credential>>;
    async fn upsert_credential(&self, cred: NewCredential) -> Result<Uuid>;
    async fn stamp_credential_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
    async fn mark_credential_invalid(&self, id: Uuid) -> Result<()>;
}

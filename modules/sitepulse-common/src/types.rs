//! Core domain types shared by the stores, queues, and workers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Engines and actions
// ---------------------------------------------------------------------------

/// Search engine a URL is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Engine {
    Google,
    Indexnow,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Google => "GOOGLE",
            Engine::Indexnow => "INDEXNOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GOOGLE" => Some(Engine::Google),
            "INDEXNOW" => Some(Engine::Indexnow),
            _ => None,
        }
    }
}

/// Notification type sent to the Google Indexing API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmitAction {
    UrlUpdated,
    UrlDeleted,
}

impl SubmitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitAction::UrlUpdated => "URL_UPDATED",
            SubmitAction::UrlDeleted => "URL_DELETED",
        }
    }
}

// ---------------------------------------------------------------------------
// URL status
// ---------------------------------------------------------------------------

/// Per-engine lifecycle of a discovered URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrlStatus {
    Discovered,
    Queued,
    Submitted,
    Indexed,
    #[serde(rename = "ERROR_4XX")]
    Error4xx,
    #[serde(rename = "ERROR_5XX")]
    Error5xx,
    CrawlError,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlStatus::Discovered => "DISCOVERED",
            UrlStatus::Queued => "QUEUED",
            UrlStatus::Submitted => "SUBMITTED",
            UrlStatus::Indexed => "INDEXED",
            UrlStatus::Error4xx => "ERROR_4XX",
            UrlStatus::Error5xx => "ERROR_5XX",
            UrlStatus::CrawlError => "CRAWL_ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DISCOVERED" => Some(UrlStatus::Discovered),
            "QUEUED" => Some(UrlStatus::Queued),
            "SUBMITTED" => Some(UrlStatus::Submitted),
            "INDEXED" => Some(UrlStatus::Indexed),
            "ERROR_4XX" => Some(UrlStatus::Error4xx),
            "ERROR_5XX" => Some(UrlStatus::Error5xx),
            "CRAWL_ERROR" => Some(UrlStatus::CrawlError),
            _ => None,
        }
    }

    /// Bucket used by the cached project counters.
    pub fn counter_bucket(&self) -> CounterBucket {
        match self {
            UrlStatus::Indexed => CounterBucket::Indexed,
            UrlStatus::Discovered | UrlStatus::Queued | UrlStatus::Submitted => {
                CounterBucket::Pending
            }
            UrlStatus::Error4xx | UrlStatus::Error5xx | UrlStatus::CrawlError => {
                CounterBucket::Error
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterBucket {
    Indexed,
    Pending,
    Error,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    FullScan,
    IncrementalSync,
    GoogleSubmission,
    IndexnowSubmission,
    StatusCheck,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullScan => "FULL_SCAN",
            JobType::IncrementalSync => "INCREMENTAL_SYNC",
            JobType::GoogleSubmission => "GOOGLE_SUBMISSION",
            JobType::IndexnowSubmission => "INDEXNOW_SUBMISSION",
            JobType::StatusCheck => "STATUS_CHECK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FULL_SCAN" => Some(JobType::FullScan),
            "INCREMENTAL_SYNC" => Some(JobType::IncrementalSync),
            "GOOGLE_SUBMISSION" => Some(JobType::GoogleSubmission),
            "INDEXNOW_SUBMISSION" => Some(JobType::IndexnowSubmission),
            "STATUS_CHECK" => Some(JobType::StatusCheck),
            _ => None,
        }
    }

    /// Scan-type jobs are exclusive per project: at most one may be
    /// PENDING or PROCESSING at a time.
    pub fn is_scan(&self) -> bool {
        matches!(self, JobType::FullScan | JobType::IncrementalSync)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "PROCESSING" => Some(JobStatus::Processing),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELLED" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are final; no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Legal transitions of the job state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            (JobStatus::Pending, JobStatus::Cancelled) => true,
            (JobStatus::Processing, JobStatus::Completed) => true,
            (JobStatus::Processing, JobStatus::Failed) => true,
            (JobStatus::Processing, JobStatus::Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Pending,
    Completed,
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "PENDING",
            SubmissionStatus::Completed => "COMPLETED",
            SubmissionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(SubmissionStatus::Pending),
            "COMPLETED" => Some(SubmissionStatus::Completed),
            "FAILED" => Some(SubmissionStatus::Failed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sitemaps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SitemapKind {
    Index,
    Urlset,
    Rss,
}

impl SitemapKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SitemapKind::Index => "INDEX",
            SitemapKind::Urlset => "URLSET",
            SitemapKind::Rss => "RSS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INDEX" => Some(SitemapKind::Index),
            "URLSET" => Some(SitemapKind::Urlset),
            "RSS" => Some(SitemapKind::Rss),
            _ => None,
        }
    }
}

/// A URL as extracted from a sitemap or feed, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredUrl {
    pub loc: String,
    pub lastmod: Option<DateTime<Utc>>,
    pub changefreq: Option<String>,
    pub priority: Option<f32>,
}

impl DiscoveredUrl {
    pub fn new(loc: impl Into<String>) -> Self {
        Self {
            loc: loc.into(),
            lastmod: None,
            changefreq: None,
            priority: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectCounters {
    pub total: i64,
    pub indexed: i64,
    pub pending: i64,
    pub error: i64,
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub domain: String,
    pub root_sitemap_url: String,
    pub settings: serde_json::Value,
    pub counters: ProjectCounters,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_submission_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Sitemap {
    pub id: Uuid,
    pub project_id: Uuid,
    pub url: String,
    pub kind: SitemapKind,
    pub parent_id: Option<Uuid>,
    pub url_count: i32,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub struct UrlEntry {
    pub id: Uuid,
    pub project_id: Uuid,
    pub sitemap_id: Option<Uuid>,
    pub loc: String,
    pub loc_hash: String,
    pub lastmod: Option<DateTime<Utc>>,
    pub changefreq: Option<String>,
    pub priority: Option<f32>,
    pub google_status: UrlStatus,
    pub bing_status: UrlStatus,
    pub google_submitted_at: Option<DateTime<Utc>>,
    pub bing_submitted_at: Option<DateTime<Utc>>,
    pub google_last_checked_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

/// Append-only record of one submission attempt batch for one URL.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: Uuid,
    pub url_id: Uuid,
    pub project_id: Uuid,
    pub engine: Engine,
    pub action: SubmitAction,
    pub status: SubmissionStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub response_code: Option<i32>,
    pub error_message: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub project_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: i16,
    pub total_items: i64,
    pub processed_items: i64,
    pub metadata: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Encrypted credential record. Plaintext only ever exists inside a
/// running submission job.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: Uuid,
    pub project_id: Uuid,
    pub engine: Engine,
    /// Credential kind, e.g. "service_account" or "api_key".
    pub kind: String,
    pub encrypted_data: String,
    pub iv: String,
    pub auth_tag: String,
    pub salt: String,
    pub is_valid: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct QuotaUsage {
    pub project_id: Uuid,
    pub engine: Engine,
    pub date: NaiveDate,
    pub used: i64,
    pub limit: i64,
}

pub const GOOGLE_DAILY_QUOTA: i64 = 200;

// ---------------------------------------------------------------------------
// Queue payloads
// ---------------------------------------------------------------------------

/// Job payloads differ per queue; a tagged sum type keeps them honest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "queue", rename_all = "kebab-case")]
pub enum JobPayload {
    #[serde(rename = "sitemap-scanner")]
    Scanner(ScannerPayload),
    #[serde(rename = "google-submitter")]
    Google(GooglePayload),
    #[serde(rename = "indexnow-submitter")]
    IndexNow(IndexNowPayload),
}

impl JobPayload {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobPayload::Scanner(p) => p.job_id,
            JobPayload::Google(p) => p.job_id,
            JobPayload::IndexNow(p) => p.job_id,
        }
    }

    pub fn project_id(&self) -> Uuid {
        match self {
            JobPayload::Scanner(p) => p.project_id,
            JobPayload::Google(p) => p.project_id,
            JobPayload::IndexNow(p) => p.project_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerPayload {
    pub project_id: Uuid,
    pub job_id: Uuid,
    /// None means "start from the project's root sitemap".
    pub sitemap_url: Option<String>,
    pub parent_sitemap_id: Option<Uuid>,
    #[serde(default)]
    pub depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GooglePayload {
    pub project_id: Uuid,
    pub job_id: Uuid,
    pub url_ids: Vec<Uuid>,
    pub action: SubmitAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexNowPayload {
    pub project_id: Uuid,
    pub job_id: Uuid,
    pub url_ids: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// Live events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogModule {
    Stream,
    Db,
    Worker,
    Api,
}

/// Ephemeral log record fanned out to live subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub module: LogModule,
    pub message: String,
    pub job_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
}

impl LogEvent {
    pub fn new(level: LogLevel, module: LogModule, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            module,
            message: message.into(),
            job_id: None,
            project_id: None,
        }
    }

    pub fn for_job(mut self, job_id: Uuid, project_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self.project_id = Some(project_id);
        self
    }
}

/// Progress snapshot fanned out to live subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobUpdate {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: i16,
    pub processed_items: i64,
    pub total_items: i64,
}

impl JobUpdate {
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            progress: job.progress,
            processed_items: job.processed_items,
            total_items: job.total_items,
        }
    }
}

//! Postgres implementation of the `Store` trait.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use sitepulse_common::{
    Credential, DiscoveredUrl, Engine, Job, JobStatus, JobType, Project, ProjectCounters,
    QuotaUsage, Result, Sitemap, SitemapKind, SitepulseError, Submission, SubmissionStatus,
    SubmitAction, UrlEntry, UrlStatus,
};

use crate::{NewCredential, NewJob, NewSubmission, Store, UpsertSitemap, UrlRef, UPSERT_BATCH_SIZE};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SitepulseError::Database(e.to_string()))?;
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> SitepulseError {
    SitepulseError::Database(e.to_string())
}

fn parse_enum<T>(parsed: Option<T>, what: &str, raw: &str) -> Result<T> {
    parsed.ok_or_else(|| SitepulseError::Database(format!("unknown {what} value: {raw}")))
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: Uuid,
    organization_id: Uuid,
    domain: String,
    root_sitemap_url: String,
    settings: serde_json::Value,
    total_urls: i64,
    indexed_urls: i64,
    pending_urls: i64,
    error_urls: i64,
    last_scan_at: Option<DateTime<Utc>>,
    last_submission_at: Option<DateTime<Utc>>,
}

impl ProjectRow {
    fn into_project(self) -> Project {
        Project {
            id: self.id,
            organization_id: self.organization_id,
            domain: self.domain,
            root_sitemap_url: self.root_sitemap_url,
            settings: self.settings,
            counters: ProjectCounters {
                total: self.total_urls,
                indexed: self.indexed_urls,
                pending: self.pending_urls,
                error: self.error_urls,
            },
            last_scan_at: self.last_scan_at,
            last_submission_at: self.last_submission_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SitemapRow {
    id: Uuid,
    project_id: Uuid,
    url: String,
    kind: String,
    parent_id: Option<Uuid>,
    url_count: i32,
    etag: Option<String>,
    last_modified: Option<DateTime<Utc>>,
    last_fetched_at: Option<DateTime<Utc>>,
    content_hash: String,
}

impl SitemapRow {
    fn into_sitemap(self) -> Result<Sitemap> {
        let kind = parse_enum(SitemapKind::parse(&self.kind), "sitemap kind", &self.kind)?;
        Ok(Sitemap {
            id: self.id,
            project_id: self.project_id,
            url: self.url,
            kind,
            parent_id: self.parent_id,
            url_count: self.url_count,
            etag: self.etag,
            last_modified: self.last_modified,
            last_fetched_at: self.last_fetched_at,
            content_hash: self.content_hash,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UrlRow {
    id: Uuid,
    project_id: Uuid,
    sitemap_id: Option<Uuid>,
    loc: String,
    loc_hash: String,
    lastmod: Option<DateTime<Utc>>,
    changefreq: Option<String>,
    priority: Option<f32>,
    google_status: String,
    bing_status: String,
    google_submitted_at: Option<DateTime<Utc>>,
    bing_submitted_at: Option<DateTime<Utc>>,
    google_last_checked_at: Option<DateTime<Utc>>,
    first_seen_at: DateTime<Utc>,
    removed_at: Option<DateTime<Utc>>,
}

impl UrlRow {
    fn into_entry(self) -> Result<UrlEntry> {
        let google_status = parse_enum(
            UrlStatus::parse(&self.google_status),
            "url status",
            &self.google_status,
        )?;
        let bing_status = parse_enum(
            UrlStatus::parse(&self.bing_status),
            "url status",
            &self.bing_status,
        )?;
        Ok(UrlEntry {
            id: self.id,
            project_id: self.project_id,
            sitemap_id: self.sitemap_id,
            loc: self.loc,
            loc_hash: self.loc_hash.trim().to_string(),
            lastmod: self.lastmod,
            changefreq: self.changefreq,
            priority: self.priority,
            google_status,
            bing_status,
            google_submitted_at: self.google_submitted_at,
            bing_submitted_at: self.bing_submitted_at,
            google_last_checked_at: self.google_last_checked_at,
            first_seen_at: self.first_seen_at,
            removed_at: self.removed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    project_id: Uuid,
    #[sqlx(rename = "type")]
    job_type: String,
    status: String,
    progress: i16,
    total_items: i64,
    processed_items: i64,
    metadata: serde_json::Value,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let job_type = parse_enum(JobType::parse(&self.job_type), "job type", &self.job_type)?;
        let status = parse_enum(JobStatus::parse(&self.status), "job status", &self.status)?;
        Ok(Job {
            id: self.id,
            project_id: self.project_id,
            job_type,
            status,
            progress: self.progress,
            total_items: self.total_items,
            processed_items: self.processed_items,
            metadata: self.metadata,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubmissionRow {
    id: Uuid,
    url_id: Uuid,
    project_id: Uuid,
    engine: String,
    action: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    response_code: Option<i32>,
    error_message: Option<String>,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
}

impl SubmissionRow {
    fn into_submission(self) -> Result<Submission> {
        Ok(Submission {
            id: self.id,
            url_id: self.url_id,
            project_id: self.project_id,
            engine: parse_enum(Engine::parse(&self.engine), "engine", &self.engine)?,
            action: match self.action.as_str() {
                "URL_UPDATED" => SubmitAction::UrlUpdated,
                "URL_DELETED" => SubmitAction::UrlDeleted,
                other => {
                    return Err(SitepulseError::Database(format!(
                        "unknown action value: {other}"
                    )))
                }
            },
            status: parse_enum(
                SubmissionStatus::parse(&self.status),
                "submission status",
                &self.status,
            )?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            response_code: self.response_code,
            error_message: self.error_message,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            next_retry_at: self.next_retry_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: Uuid,
    project_id: Uuid,
    engine: String,
    #[sqlx(rename = "type")]
    kind: String,
    encrypted_data: String,
    iv: String,
    auth_tag: String,
    salt: String,
    is_valid: bool,
    expires_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
}

impl CredentialRow {
    fn into_credential(self) -> Result<Credential> {
        Ok(Credential {
            id: self.id,
            project_id: self.project_id,
            engine: parse_enum(Engine::parse(&self.engine), "engine", &self.engine)?,
            kind: self.kind,
            encrypted_data: self.encrypted_data,
            iv: self.iv,
            auth_tag: self.auth_tag,
            salt: self.salt,
            is_valid: self.is_valid,
            expires_at: self.expires_at,
            last_used_at: self.last_used_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Store for PgStore {
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT id, organization_id, domain, root_sitemap_url, settings,
                   total_urls, indexed_urls, pending_urls, error_urls,
                   last_scan_at, last_submission_at
            FROM projects WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(ProjectRow::into_project))
    }

    async fn update_project_counters(&self, project_id: Uuid) -> Result<ProjectCounters> {
        let row = sqlx::query_as::<_, (i64, i64, i64, i64)>(
            r#"
            WITH agg AS (
                SELECT
                    count(*) AS total,
                    count(*) FILTER (WHERE google_status = 'INDEXED') AS indexed,
                    count(*) FILTER (WHERE google_status IN ('DISCOVERED', 'QUEUED', 'SUBMITTED')) AS pending,
                    count(*) FILTER (WHERE google_status IN ('ERROR_4XX', 'ERROR_5XX', 'CRAWL_ERROR')) AS error
                FROM url_entries
                WHERE project_id = $1
            )
            UPDATE projects p
            SET total_urls = agg.total,
                indexed_urls = agg.indexed,
                pending_urls = agg.pending,
                error_urls = agg.error
            FROM agg
            WHERE p.id = $1
            RETURNING agg.total, agg.indexed, agg.pending, agg.error
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let (total, indexed, pending, error) =
            row.ok_or_else(|| SitepulseError::NotFound(format!("project {project_id}")))?;
        Ok(ProjectCounters {
            total,
            indexed,
            pending,
            error,
        })
    }

    async fn touch_project_scan(&self, project_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE projects SET last_scan_at = $2 WHERE id = $1")
            .bind(project_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn touch_project_submission(&self, project_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE projects SET last_submission_at = $2 WHERE id = $1")
            .bind(project_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_sitemap(&self, project_id: Uuid, url: &str) -> Result<Option<Sitemap>> {
        let row = sqlx::query_as::<_, SitemapRow>(
            r#"
            SELECT id, project_id, url, kind, parent_id, url_count, etag,
                   last_modified, last_fetched_at, content_hash
            FROM sitemaps WHERE project_id = $1 AND url = $2
            "#,
        )
        .bind(project_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(SitemapRow::into_sitemap).transpose()
    }

    async fn upsert_sitemap(&self, rec: UpsertSitemap) -> Result<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO sitemaps
                (project_id, url, kind, parent_id, url_count, etag, last_modified,
                 last_fetched_at, content_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now(), $8)
            ON CONFLICT (project_id, url) DO UPDATE
            SET kind = EXCLUDED.kind,
                parent_id = EXCLUDED.parent_id,
                url_count = EXCLUDED.url_count,
                etag = EXCLUDED.etag,
                last_modified = EXCLUDED.last_modified,
                last_fetched_at = now(),
                content_hash = EXCLUDED.content_hash
            RETURNING id
            "#,
        )
        .bind(rec.project_id)
        .bind(&rec.url)
        .bind(rec.kind.as_str())
        .bind(rec.parent_id)
        .bind(rec.url_count)
        .bind(&rec.etag)
        .bind(rec.last_modified)
        .bind(&rec.content_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(id)
    }

    async fn upsert_urls(
        &self,
        project_id: Uuid,
        sitemap_id: Option<Uuid>,
        entries: &[DiscoveredUrl],
    ) -> Result<u64> {
        let mut written = 0u64;
        for chunk in entries.chunks(UPSERT_BATCH_SIZE) {
            // ON CONFLICT cannot touch the same row twice in one statement,
            // so dedupe by loc_hash within the chunk.
            let mut seen = std::collections::HashSet::new();
            let mut locs = Vec::with_capacity(chunk.len());
            let mut hashes = Vec::with_capacity(chunk.len());
            let mut lastmods: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(chunk.len());
            let mut changefreqs: Vec<Option<String>> = Vec::with_capacity(chunk.len());
            let mut priorities: Vec<Option<f32>> = Vec::with_capacity(chunk.len());
            for entry in chunk {
                let hash = sitepulse_common::loc_hash(&entry.loc);
                if !seen.insert(hash.clone()) {
                    continue;
                }
                locs.push(entry.loc.clone());
                hashes.push(hash);
                lastmods.push(entry.lastmod);
                changefreqs.push(entry.changefreq.clone());
                priorities.push(entry.priority);
            }
            if locs.is_empty() {
                continue;
            }

            let result = sqlx::query(
                r#"
                INSERT INTO url_entries
                    (project_id, sitemap_id, loc, loc_hash, lastmod, changefreq, priority)
                SELECT $1, $2, t.loc, t.loc_hash, t.lastmod, t.changefreq, t.priority
                FROM UNNEST($3::text[], $4::text[], $5::timestamptz[], $6::text[], $7::real[])
                    AS t(loc, loc_hash, lastmod, changefreq, priority)
                ON CONFLICT (project_id, loc_hash) DO UPDATE
                SET sitemap_id = EXCLUDED.sitemap_id,
                    lastmod = EXCLUDED.lastmod,
                    changefreq = EXCLUDED.changefreq,
                    priority = EXCLUDED.priority
                "#,
            )
            .bind(project_id)
            .bind(sitemap_id)
            .bind(&locs)
            .bind(&hashes)
            .bind(&lastmods)
            .bind(&changefreqs)
            .bind(&priorities)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn list_urls_by_ids(&self, ids: &[Uuid]) -> Result<Vec<UrlRef>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT id, loc FROM url_entries WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        // Preserve the caller's ordering; ANY() does not.
        let by_id: std::collections::HashMap<Uuid, String> = rows.into_iter().collect();
        Ok(ids
            .iter()
            .filter_map(|id| by_id.get(id).map(|loc| UrlRef { id: *id, loc: loc.clone() }))
            .collect())
    }

    async fn get_url(&self, id: Uuid) -> Result<Option<UrlEntry>> {
        let row = sqlx::query_as::<_, UrlRow>(
            r#"
            SELECT id, project_id, sitemap_id, loc, loc_hash, lastmod, changefreq,
                   priority, google_status, bing_status, google_submitted_at,
                   bing_submitted_at, google_last_checked_at, first_seen_at, removed_at
            FROM url_entries WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(UrlRow::into_entry).transpose()
    }

    async fn set_url_engine_status(
        &self,
        url_id: Uuid,
        engine: Engine,
        status: UrlStatus,
        submitted_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let sql = match engine {
            Engine::Google => {
                "UPDATE url_entries SET google_status = $2,
                 google_submitted_at = COALESCE($3, google_submitted_at) WHERE id = $1"
            }
            Engine::Indexnow => {
                "UPDATE url_entries SET bing_status = $2,
                 bing_submitted_at = COALESCE($3, bing_submitted_at) WHERE id = $1"
            }
        };
        sqlx::query(sql)
            .bind(url_id)
            .bind(status.as_str())
            .bind(submitted_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn stamp_url_checked(
        &self,
        url_id: Uuid,
        engine: Engine,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let sql = match engine {
            Engine::Google => {
                "UPDATE url_entries SET google_last_checked_at = $2 WHERE id = $1"
            }
            Engine::Indexnow => {
                "UPDATE url_entries SET bing_last_checked_at = $2 WHERE id = $1"
            }
        };
        sqlx::query(sql)
            .bind(url_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn create_job(&self, job: NewJob) -> Result<Job> {
        let row = if job.job_type.is_scan() {
            // At most one active scan per project; the conditional insert
            // races safely because a duplicate just returns zero rows.
            sqlx::query_as::<_, JobRow>(
                r#"
                INSERT INTO jobs (project_id, type, metadata)
                SELECT $1, $2, $3
                WHERE NOT EXISTS (
                    SELECT 1 FROM jobs
                    WHERE project_id = $1
                      AND type IN ('FULL_SCAN', 'INCREMENTAL_SYNC')
                      AND status IN ('PENDING', 'PROCESSING')
                )
                RETURNING id, project_id, type, status, progress, total_items,
                          processed_items, metadata, scheduled_at, started_at,
                          completed_at, error_message
                "#,
            )
            .bind(job.project_id)
            .bind(job.job_type.as_str())
            .bind(&job.metadata)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| {
                SitepulseError::Conflict(format!(
                    "project {} already has an active scan job",
                    job.project_id
                ))
            })?
        } else {
            sqlx::query_as::<_, JobRow>(
                r#"
                INSERT INTO jobs (project_id, type, metadata)
                VALUES ($1, $2, $3)
                RETURNING id, project_id, type, status, progress, total_items,
                          processed_items, metadata, scheduled_at, started_at,
                          completed_at, error_message
                "#,
            )
            .bind(job.project_id)
            .bind(job.job_type.as_str())
            .bind(&job.metadata)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
        };
        row.into_job()
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, project_id, type, status, progress, total_items,
                   processed_items, metadata, scheduled_at, started_at,
                   completed_at, error_message
            FROM jobs WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(JobRow::into_job).transpose()
    }

    async fn list_pending_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, project_id, type, status, progress, total_items,
                   processed_items, metadata, scheduled_at, started_at,
                   completed_at, error_message
            FROM jobs
            WHERE status = 'PENDING'
            ORDER BY scheduled_at
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn transition_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job> {
        // States the target status may legally be entered from.
        let from: &[&str] = match status {
            JobStatus::Processing => &["PENDING"],
            JobStatus::Completed | JobStatus::Failed => &["PROCESSING"],
            JobStatus::Cancelled => &["PENDING", "PROCESSING"],
            JobStatus::Pending => &[],
        };
        let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = $2,
                error_message = COALESCE($3, error_message),
                started_at = CASE WHEN $2 = 'PROCESSING' THEN now() ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('COMPLETED', 'FAILED', 'CANCELLED')
                                    THEN now() ELSE completed_at END,
                progress = CASE WHEN $2 = 'COMPLETED' THEN 100 ELSE progress END
            WHERE id = $1 AND status = ANY($4)
            RETURNING id, project_id, type, status, progress, total_items,
                      processed_items, metadata, scheduled_at, started_at,
                      completed_at, error_message
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(&error_message)
        .bind(&from)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => row.into_job(),
            // Already terminal (or otherwise ineligible): return as stored.
            None => self
                .get_job(id)
                .await?
                .ok_or_else(|| SitepulseError::NotFound(format!("job {id}"))),
        }
    }

    async fn update_job_progress(
        &self,
        id: Uuid,
        progress: i16,
        processed_items: i64,
        total_items: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET progress = LEAST(100, GREATEST(progress, $2)),
                processed_items = $3,
                total_items = $4
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(progress)
        .bind(processed_items)
        .bind(total_items)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn append_submissions(&self, subs: &[NewSubmission]) -> Result<()> {
        for sub in subs {
            sqlx::query(
                r#"
                INSERT INTO submissions
                    (url_id, project_id, engine, action, status, attempts,
                     response_code, error_message, started_at, completed_at, next_retry_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(sub.url_id)
            .bind(sub.project_id)
            .bind(sub.engine.as_str())
            .bind(sub.action.as_str())
            .bind(sub.status.as_str())
            .bind(sub.attempts)
            .bind(sub.response_code)
            .bind(&sub.error_message)
            .bind(sub.started_at)
            .bind(sub.completed_at)
            .bind(sub.next_retry_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn list_submissions(
        &self,
        project_id: Uuid,
        engine: Engine,
    ) -> Result<Vec<Submission>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(
            r#"
            SELECT id, url_id, project_id, engine, action, status, attempts,
                   max_attempts, response_code, error_message, scheduled_at,
                   started_at, completed_at, next_retry_at
            FROM submissions
            WHERE project_id = $1 AND engine = $2
            ORDER BY scheduled_at
            "#,
        )
        .bind(project_id)
        .bind(engine.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(SubmissionRow::into_submission).collect()
    }

    async fn get_quota(
        &self,
        project_id: Uuid,
        engine: Engine,
        date: NaiveDate,
    ) -> Result<Option<QuotaUsage>> {
        let row = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT used, quota_limit FROM quota_usage
            WHERE project_id = $1 AND engine = $2 AND date = $3
            "#,
        )
        .bind(project_id)
        .bind(engine.as_str())
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|(used, limit)| QuotaUsage {
            project_id,
            engine,
            date,
            used,
            limit,
        }))
    }

    async fn add_quota_used(
        &self,
        project_id: Uuid,
        engine: Engine,
        date: NaiveDate,
        delta: i64,
        limit: i64,
    ) -> Result<i64> {
        let used = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO quota_usage (project_id, engine, date, used, quota_limit)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (project_id, engine, date)
            DO UPDATE SET used = quota_usage.used + EXCLUDED.used
            RETURNING used
            "#,
        )
        .bind(project_id)
        .bind(engine.as_str())
        .bind(date)
        .bind(delta)
        .bind(limit)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(used)
    }

    async fn get_credential(
        &self,
        project_id: Uuid,
        engine: Engine,
    ) -> Result<Option<Credential>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT id, project_id, engine, type, encrypted_data, iv, auth_tag,
                   salt, is_valid, expires_at, last_used_at
            FROM credentials WHERE project_id = $1 AND engine = $2
            "#,
        )
        .bind(project_id)
        .bind(engine.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(CredentialRow::into_credential).transpose()
    }

    async fn upsert_credential(&self, cred: NewCredential) -> Result<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO credentials
                (project_id, engine, type, encrypted_data, iv, auth_tag, salt, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (project_id, engine) DO UPDATE
            SET type = EXCLUDED.type,
                encrypted_data = EXCLUDED.encrypted_data,
                iv = EXCLUDED.iv,
                auth_tag = EXCLUDED.auth_tag,
                salt = EXCLUDED.salt,
                expires_at = EXCLUDED.expires_at,
                is_valid = true
            RETURNING id
            "#,
        )
        .bind(cred.project_id)
        .bind(cred.engine.as_str())
        .bind(&cred.kind)
        .bind(&cred.encrypted_data)
        .bind(&cred.iv)
        .bind(&cred.auth_tag)
        .bind(&cred.salt)
        .bind(cred.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(id)
    }

    async fn stamp_credential_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE credentials SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_credential_invalid(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE credentials SET is_valid = false WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

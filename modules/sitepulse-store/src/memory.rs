//! In-memory `Store` used by worker and scenario tests. Mirrors the
//! Postgres semantics: idempotent upserts, the one-active-scan rule,
//! monotonic progress, and atomic quota increments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use sitepulse_common::{
    loc_hash, Credential, DiscoveredUrl, Engine, Job, JobStatus, Project, ProjectCounters,
    QuotaUsage, Result, Sitemap, SitepulseError, Submission, UrlEntry, UrlStatus,
};

use crate::{NewCredential, NewJob, NewSubmission, Store, UpsertSitemap, UrlRef};

#[derive(Default)]
struct Inner {
    projects: HashMap<Uuid, Project>,
    sitemaps: Vec<Sitemap>,
    urls: Vec<UrlEntry>,
    submissions: Vec<Submission>,
    jobs: HashMap<Uuid, Job>,
    quota: HashMap<(Uuid, Engine, NaiveDate), (i64, i64)>,
    credentials: Vec<Credential>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a project and return it.
    pub fn add_project(&self, organization_id: Uuid, domain: &str, root_sitemap_url: &str) -> Project {
        let project = Project {
            id: Uuid::new_v4(),
            organization_id,
            domain: domain.to_string(),
            root_sitemap_url: root_sitemap_url.to_string(),
            settings: serde_json::json!({}),
            counters: ProjectCounters::default(),
            last_scan_at: None,
            last_submission_at: None,
        };
        self.inner
            .lock()
            .unwrap()
            .projects
            .insert(project.id, project.clone());
        project
    }

    /// Seed a URL entry directly, bypassing discovery. Returns its id.
    pub fn add_url(&self, project_id: Uuid, loc: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().urls.push(UrlEntry {
            id,
            project_id,
            sitemap_id: None,
            loc: loc.to_string(),
            loc_hash: loc_hash(loc),
            lastmod: None,
            changefreq: None,
            priority: None,
            google_status: UrlStatus::Discovered,
            bing_status: UrlStatus::Discovered,
            google_submitted_at: None,
            bing_submitted_at: None,
            google_last_checked_at: None,
            first_seen_at: Utc::now(),
            removed_at: None,
        });
        id
    }

    pub fn url_count(&self) -> usize {
        self.inner.lock().unwrap().urls.len()
    }

    pub fn sitemap_count(&self) -> usize {
        self.inner.lock().unwrap().sitemaps.len()
    }

    pub fn urls(&self) -> Vec<UrlEntry> {
        self.inner.lock().unwrap().urls.clone()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        Ok(self.inner.lock().unwrap().projects.get(&id).cloned())
    }

    async fn update_project_counters(&self, project_id: Uuid) -> Result<ProjectCounters> {
        let mut inner = self.inner.lock().unwrap();
        let mut counters = ProjectCounters::default();
        for url in inner.urls.iter().filter(|u| u.project_id == project_id) {
            counters.total += 1;
            match url.google_status.counter_bucket() {
                sitepulse_common::CounterBucket::Indexed => counters.indexed += 1,
                sitepulse_common::CounterBucket::Pending => counters.pending += 1,
                sitepulse_common::CounterBucket::Error => counters.error += 1,
            }
        }
        let project = inner
            .projects
            .get_mut(&project_id)
            .ok_or_else(|| SitepulseError::NotFound(format!("project {project_id}")))?;
        project.counters = counters;
        Ok(counters)
    }

    async fn touch_project_scan(&self, project_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(p) = self.inner.lock().unwrap().projects.get_mut(&project_id) {
            p.last_scan_at = Some(at);
        }
        Ok(())
    }

    async fn touch_project_submission(&self, project_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(p) = self.inner.lock().unwrap().projects.get_mut(&project_id) {
            p.last_submission_at = Some(at);
        }
        Ok(())
    }

    async fn get_sitemap(&self, project_id: Uuid, url: &str) -> Result<Option<Sitemap>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sitemaps
            .iter()
            .find(|s| s.project_id == project_id && s.url == url)
            .cloned())
    }

    async fn upsert_sitemap(&self, rec: UpsertSitemap) -> Result<Uuid> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        if let Some(existing) = inner
            .sitemaps
            .iter_mut()
            .find(|s| s.project_id == rec.project_id && s.url == rec.url)
        {
            existing.kind = rec.kind;
            existing.parent_id = rec.parent_id;
            existing.url_count = rec.url_count;
            existing.etag = rec.etag;
            existing.last_modified = rec.last_modified;
            existing.last_fetched_at = Some(now);
            existing.content_hash = rec.content_hash;
            return Ok(existing.id);
        }
        let id = Uuid::new_v4();
        inner.sitemaps.push(Sitemap {
            id,
            project_id: rec.project_id,
            url: rec.url,
            kind: rec.kind,
            parent_id: rec.parent_id,
            url_count: rec.url_count,
            etag: rec.etag,
            last_modified: rec.last_modified,
            last_fetched_at: Some(now),
            content_hash: rec.content_hash,
        });
        Ok(id)
    }

    async fn upsert_urls(
        &self,
        project_id: Uuid,
        sitemap_id: Option<Uuid>,
        entries: &[DiscoveredUrl],
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut written = 0u64;
        for entry in entries {
            let hash = loc_hash(&entry.loc);
            if let Some(existing) = inner
                .urls
                .iter_mut()
                .find(|u| u.project_id == project_id && u.loc_hash == hash)
            {
                existing.sitemap_id = sitemap_id;
                existing.lastmod = entry.lastmod;
                existing.changefreq = entry.changefreq.clone();
                existing.priority = entry.priority;
            } else {
                inner.urls.push(UrlEntry {
                    id: Uuid::new_v4(),
                    project_id,
                    sitemap_id,
                    loc: entry.loc.clone(),
                    loc_hash: hash,
                    lastmod: entry.lastmod,
                    changefreq: entry.changefreq.clone(),
                    priority: entry.priority,
                    google_status: UrlStatus::Discovered,
                    bing_status: UrlStatus::Discovered,
                    google_submitted_at: None,
                    bing_submitted_at: None,
                    google_last_checked_at: None,
                    first_seen_at: Utc::now(),
                    removed_at: None,
                });
            }
            written += 1;
        }
        Ok(written)
    }

    async fn list_urls_by_ids(&self, ids: &[Uuid]) -> Result<Vec<UrlRef>> {
        let inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                inner
                    .urls
                    .iter()
                    .find(|u| u.id == *id)
                    .map(|u| UrlRef { id: u.id, loc: u.loc.clone() })
            })
            .collect())
    }

    async fn get_url(&self, id: Uuid) -> Result<Option<UrlEntry>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .urls
            .iter()
            .find(|u| u.id == id)
            .cloned())
    }

    async fn set_url_engine_status(
        &self,
        url_id: Uuid,
        engine: Engine,
        status: UrlStatus,
        submitted_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(url) = inner.urls.iter_mut().find(|u| u.id == url_id) {
            match engine {
                Engine::Google => {
                    url.google_status = status;
                    if submitted_at.is_some() {
                        url.google_submitted_at = submitted_at;
                    }
                }
                Engine::Indexnow => {
                    url.bing_status = status;
                    if submitted_at.is_some() {
                        url.bing_submitted_at = submitted_at;
                    }
                }
            }
        }
        Ok(())
    }

    async fn stamp_url_checked(
        &self,
        url_id: Uuid,
        engine: Engine,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(url) = inner.urls.iter_mut().find(|u| u.id == url_id) {
            if engine == Engine::Google {
                url.google_last_checked_at = Some(at);
            }
        }
        Ok(())
    }

    async fn create_job(&self, job: NewJob) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        if job.job_type.is_scan() {
            let active = inner.jobs.values().any(|j| {
                j.project_id == job.project_id
                    && j.job_type.is_scan()
                    && matches!(j.status, JobStatus::Pending | JobStatus::Processing)
            });
            if active {
                return Err(SitepulseError::Conflict(format!(
                    "project {} already has an active scan job",
                    job.project_id
                )));
            }
        }
        let record = Job {
            id: Uuid::new_v4(),
            project_id: job.project_id,
            job_type: job.job_type,
            status: JobStatus::Pending,
            progress: 0,
            total_items: 0,
            processed_items: 0,
            metadata: job.metadata,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        };
        inner.jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.lock().unwrap().jobs.get(&id).cloned())
    }

    async fn list_pending_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.scheduled_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn transition_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SitepulseError::NotFound(format!("job {id}")))?;
        if job.status.can_transition_to(status) {
            job.status = status;
            if error_message.is_some() {
                job.error_message = error_message;
            }
            match status {
                JobStatus::Processing => job.started_at = Some(Utc::now()),
                JobStatus::Completed => {
                    job.progress = 100;
                    job.completed_at = Some(Utc::now());
                }
                JobStatus::Failed | JobStatus::Cancelled => {
                    job.completed_at = Some(Utc::now());
                }
                JobStatus::Pending => {}
            }
        }
        Ok(job.clone())
    }

    async fn update_job_progress(
        &self,
        id: Uuid,
        progress: i16,
        processed_items: i64,
        total_items: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&id) {
            if job.status == JobStatus::Processing {
                job.progress = job.progress.max(progress.min(100));
                job.processed_items = processed_items;
                job.total_items = total_items;
            }
        }
        Ok(())
    }

    async fn append_submissions(&self, subs: &[NewSubmission]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for sub in subs {
            inner.submissions.push(Submission {
                id: Uuid::new_v4(),
                url_id: sub.url_id,
                project_id: sub.project_id,
                engine: sub.engine,
                action: sub.action,
                status: sub.status.clone(),
                attempts: sub.attempts,
                max_attempts: sitepulse_common::DEFAULT_MAX_ATTEMPTS,
                response_code: sub.response_code,
                error_message: sub.error_message.clone(),
                scheduled_at: Utc::now(),
                started_at: sub.started_at,
                completed_at: sub.completed_at,
                next_retry_at: sub.next_retry_at,
            });
        }
        Ok(())
    }

    async fn list_submissions(
        &self,
        project_id: Uuid,
        engine: Engine,
    ) -> Result<Vec<Submission>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .submissions
            .iter()
            .filter(|s| s.project_id == project_id && s.engine == engine)
            .cloned()
            .collect())
    }

    async fn get_quota(
        &self,
        project_id: Uuid,
        engine: Engine,
        date: NaiveDate,
    ) -> Result<Option<QuotaUsage>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .quota
            .get(&(project_id, engine, date))
            .map(|(used, limit)| QuotaUsage {
                project_id,
                engine,
                date,
                used: *used,
                limit: *limit,
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
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .quota
            .entry((project_id, engine, date))
            .or_insert((0, limit));
        entry.0 += delta;
        Ok(entry.0)
    }

    async fn get_credential(
        &self,
        project_id: Uuid,
        engine: Engine,
    ) -> Result<Option<Credential>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .credentials
            .iter()
            .find(|c| c.project_id == project_id && c.engine == engine)
            .cloned())
    }

    async fn upsert_credential(&self, cred: NewCredential) -> Result<Uuid> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .credentials
            .iter_mut()
            .find(|c| c.project_id == cred.project_id && c.engine == cred.engine)
        {
            existing.kind = cred.kind;
            existing.encrypted_data = cred.encrypted_data;
            existing.iv = cred.iv;
            existing.auth_tag = cred.auth_tag;
            existing.salt = cred.salt;
            existing.expires_at = cred.expires_at;
            existing.is_valid = true;
            return Ok(existing.id);
        }
        let id = Uuid::new_v4();
        inner.credentials.push(Credential {
            id,
            project_id: cred.project_id,
            engine: cred.engine,
            kind: cred.kind,
            encrypted_data: cred.encrypted_data,
            iv: cred.iv,
            auth_tag: cred.auth_tag,
            salt: cred.salt,
            is_valid: true,
            expires_at: cred.expires_at,
            last_used_at: None,
        });
        Ok(id)
    }

    async fn stamp_credential_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.credentials.iter_mut().find(|c| c.id == id) {
            c.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn mark_credential_invalid(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.credentials.iter_mut().find(|c| c.id == id) {
            c.is_valid = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitepulse_common::JobType;

    fn entry(loc: &str) -> DiscoveredUrl {
        DiscoveredUrl::new(loc)
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemStore::new();
        let project = store.add_project(Uuid::new_v4(), "t", "http://t/sm.xml");

        store
            .upsert_urls(project.id, None, &[entry("http://t/x")])
            .await
            .unwrap();
        let first_seen = store.urls()[0].first_seen_at;

        store
            .upsert_urls(project.id, None, &[entry("http://t/x")])
            .await
            .unwrap();
        assert_eq!(store.url_count(), 1);
        assert_eq!(store.urls()[0].first_seen_at, first_seen);
    }

    #[tokio::test]
    async fn test_counters_group_by_google_status() {
        let store = MemStore::new();
        let project = store.add_project(Uuid::new_v4(), "t", "http://t/sm.xml");
        let a = store.add_url(project.id, "http://t/a");
        let b = store.add_url(project.id, "http://t/b");
        store.add_url(project.id, "http://t/c");
        store
            .set_url_engine_status(a, Engine::Google, UrlStatus::Indexed, None)
            .await
            .unwrap();
        store
            .set_url_engine_status(b, Engine::Google, UrlStatus::Error4xx, None)
            .await
            .unwrap();

        let counters = store.update_project_counters(project.id).await.unwrap();
        assert_eq!(counters.total, 3);
        assert_eq!(counters.indexed, 1);
        assert_eq!(counters.error, 1);
        assert_eq!(counters.pending, 1);
    }

    #[tokio::test]
    async fn test_concurrent_scan_jobs_conflict() {
        let store = MemStore::new();
        let project = store.add_project(Uuid::new_v4(), "t", "http://t/sm.xml");
        store
            .create_job(NewJob {
                project_id: project.id,
                job_type: JobType::FullScan,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();
        let second = store
            .create_job(NewJob {
                project_id: project.id,
                job_type: JobType::FullScan,
                metadata: serde_json::json!({}),
            })
            .await;
        assert!(matches!(second, Err(SitepulseError::Conflict(_))));

        // Submission jobs are not exclusive.
        assert!(store
            .create_job(NewJob {
                project_id: project.id,
                job_type: JobType::GoogleSubmission,
                metadata: serde_json::json!({}),
            })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_quota_increments_are_atomic() {
        let store = std::sync::Arc::new(MemStore::new());
        let project = store.add_project(Uuid::new_v4(), "t", "http://t/sm.xml");
        let date = Utc::now().date_naive();

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let store = store.clone();
            let pid = project.id;
            handles.push(tokio::spawn(async move {
                store
                    .add_quota_used(pid, Engine::Google, date, (i % 3 + 1) as i64, 200)
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let expected: i64 = (0..8u32).map(|i| (i % 3 + 1) as i64).sum();
        let quota = store
            .get_quota(project.id, Engine::Google, date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(quota.used, expected);
    }

    #[tokio::test]
    async fn test_terminal_job_states_are_final() {
        let store = MemStore::new();
        let project = store.add_project(Uuid::new_v4(), "t", "http://t/sm.xml");
        let job = store
            .create_job(NewJob {
                project_id: project.id,
                job_type: JobType::FullScan,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();
        store
            .transition_job(job.id, JobStatus::Processing, None)
            .await
            .unwrap();
        store
            .transition_job(job.id, JobStatus::Cancelled, Some("Job Aborted".into()))
            .await
            .unwrap();
        let after = store
            .transition_job(job.id, JobStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(after.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let store = MemStore::new();
        let project = store.add_project(Uuid::new_v4(), "t", "http://t/sm.xml");
        let job = store
            .create_job(NewJob {
                project_id: project.id,
                job_type: JobType::FullScan,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();
        store
            .transition_job(job.id, JobStatus::Processing, None)
            .await
            .unwrap();
        store.update_job_progress(job.id, 40, 4, 10).await.unwrap();
        store.update_job_progress(job.id, 30, 5, 10).await.unwrap();
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.progress, 40);
        assert_eq!(job.processed_items, 5);
    }
}

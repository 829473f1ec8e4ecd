//! Sitemap scanner: recursively walks a project's sitemap graph, upserts
//! discovered URLs in batches, and fans child indexes out with bounded
//! concurrency. A per-run visited set plus a hard depth cap keep cyclic
//! indexes from recursing forever.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tracing::warn;

use sitepulse_common::{
    content_hash, telemetry, JobPayload, JobStatus, JobType, LogLevel, LogModule, Project, Result,
    ScannerPayload, SitemapKind, SitepulseError,
};
use sitepulse_queue::{JobContext, JobHandler};
use sitepulse_sitemap::{FetchResult, ParsedSitemap, SitemapFetcher};
use sitepulse_store::{Store, UpsertSitemap, UPSERT_BATCH_SIZE};

use crate::controller::JobController;

const MAX_DEPTH: u32 = 10;
const FANOUT_CONCURRENCY: usize = 5;

/// Shared state of one scan job run.
struct ScanRun {
    visited: Mutex<HashSet<String>>,
    processed: AtomicI64,
    total: AtomicI64,
    sub_errors: AtomicI64,
    /// Incremental syncs skip child sitemaps whose ETag still matches.
    incremental: bool,
}

impl ScanRun {
    fn visit(&self, url: &str) -> bool {
        self.visited.lock().unwrap().insert(url.to_string())
    }
}

pub struct ScannerWorker {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn SitemapFetcher>,
    controller: Arc<JobController>,
}

impl ScannerWorker {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn SitemapFetcher>,
        controller: Arc<JobController>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            fetcher,
            controller,
        })
    }

    async fn run(&self, payload: ScannerPayload, ctx: JobContext) -> Result<()> {
        let project = self
            .store
            .get_project(payload.project_id)
            .await?
            .ok_or_else(|| SitepulseError::NotFound(format!("project {}", payload.project_id)))?;
        let org = project.organization_id;

        let job = self.controller.start(org, payload.job_id).await?;
        if job.status != JobStatus::Processing {
            // Redelivered after a terminal transition; nothing to do.
            return Ok(());
        }

        let run = ScanRun {
            visited: Mutex::new(HashSet::new()),
            processed: AtomicI64::new(0),
            total: AtomicI64::new(0),
            sub_errors: AtomicI64::new(0),
            incremental: job.job_type == JobType::IncrementalSync,
        };

        let target = payload
            .sitemap_url
            .clone()
            .unwrap_or_else(|| project.root_sitemap_url.clone());

        self.controller
            .log(
                org,
                project.id,
                Some(payload.job_id),
                LogLevel::Info,
                LogModule::Worker,
                format!("Scan started at {target}"),
            )
            .await;

        let outcome = self
            .scan_target(&project, &run, &ctx, target, payload.parent_sitemap_id, payload.depth)
            .await;

        match outcome {
            Ok(()) => {
                let counters = self.store.update_project_counters(project.id).await?;
                self.store
                    .touch_project_scan(project.id, chrono::Utc::now())
                    .await?;
                self.controller.publish_stats(org, project.id, counters).await;

                ctx.report_items(
                    run.processed.load(Ordering::SeqCst),
                    run.total.load(Ordering::SeqCst).max(1),
                )
                .await;
                ctx.report_progress(100).await;
                self.controller.complete(org, payload.job_id).await?;
                let visited = run.visited.lock().unwrap().len();
                self.controller
                    .log(
                        org,
                        project.id,
                        Some(payload.job_id),
                        LogLevel::Success,
                        LogModule::Worker,
                        format!(
                            "Scan complete: {} URLs across {visited} sitemaps ({} sub-sitemap errors)",
                            run.total.load(Ordering::SeqCst),
                            run.sub_errors.load(Ordering::SeqCst),
                        ),
                    )
                    .await;
                Ok(())
            }
            Err(SitepulseError::Aborted) => {
                self.controller.cancel(org, payload.job_id).await?;
                Ok(())
            }
            Err(e) => {
                if !e.is_retryable() || ctx.attempt >= 3 {
                    self.controller
                        .fail(org, payload.job_id, format!("Scan failed: {e}"))
                        .await?;
                }
                Err(e)
            }
        }
    }

    /// Fetch, persist, and recurse into one sitemap URL. Failures in
    /// children are recorded without failing the run; only the root's own
    /// failure propagates.
    fn scan_target<'a>(
        &'a self,
        project: &'a Project,
        run: &'a ScanRun,
        ctx: &'a JobContext,
        url: String,
        parent_id: Option<uuid::Uuid>,
        depth: u32,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if !run.visit(&url) {
                return Ok(());
            }
            ctx.checkpoint().await?;

            let started = Instant::now();
            let prior = self.store.get_sitemap(project.id, &url).await?;
            let etag = if run.incremental {
                prior.as_ref().and_then(|s| s.etag.clone())
            } else {
                None
            };

            let fetched = self.fetcher.fetch(&url, etag.as_deref()).await?;
            let (body, response_etag) = match fetched {
                FetchResult::NotModified => {
                    self.controller
                        .log(
                            project.organization_id,
                            project.id,
                            Some(ctx.job_id),
                            LogLevel::Info,
                            LogModule::Stream,
                            format!("Sitemap unchanged, skipping: {url}"),
                        )
                        .await;
                    return Ok(());
                }
                FetchResult::Fetched { body, etag } => (body, etag),
            };

            let parsed = sitepulse_sitemap::parse_sitemap(&url, &body)?;
            let kind = parsed.kind.unwrap_or(SitemapKind::Urlset);
            let sitemap_id = self.persist_sitemap(project, &url, &parsed, kind, parent_id, response_etag).await?;

            metrics::histogram!(telemetry::SITEMAP_SCAN_DURATION_MS)
                .record(started.elapsed().as_millis() as f64);

            if !parsed.urls.is_empty() {
                self.upsert_entries(project, run, ctx, sitemap_id, &parsed).await?;
            }

            if kind == SitemapKind::Index && depth < MAX_DEPTH {
                self.fan_out(project, run, ctx, &parsed, sitemap_id, depth).await?;
            } else if kind == SitemapKind::Index {
                warn!(url = %url, depth, "Sitemap depth cap reached; children skipped");
            }

            Ok(())
        }
        .boxed()
    }

    async fn persist_sitemap(
        &self,
        project: &Project,
        url: &str,
        parsed: &ParsedSitemap,
        kind: SitemapKind,
        parent_id: Option<uuid::Uuid>,
        etag: Option<String>,
    ) -> Result<uuid::Uuid> {
        let children: Vec<&str> = if kind == SitemapKind::Index {
            parsed.child_sitemaps.iter().map(|s| s.as_str()).collect()
        } else {
            parsed.urls.iter().map(|u| u.loc.as_str()).collect()
        };
        self.store
            .upsert_sitemap(UpsertSitemap {
                project_id: project.id,
                url: url.to_string(),
                kind,
                parent_id,
                url_count: parsed.urls.len() as i32,
                etag,
                last_modified: None,
                content_hash: content_hash(&children),
            })
            .await
    }

    async fn upsert_entries(
        &self,
        project: &Project,
        run: &ScanRun,
        ctx: &JobContext,
        sitemap_id: uuid::Uuid,
        parsed: &ParsedSitemap,
    ) -> Result<()> {
        run.total
            .fetch_add(parsed.urls.len() as i64, Ordering::SeqCst);
        metrics::counter!(telemetry::URLS_DISCOVERED_TOTAL).increment(parsed.urls.len() as u64);

        for chunk in parsed.urls.chunks(UPSERT_BATCH_SIZE) {
            ctx.checkpoint().await?;
            self.store
                .upsert_urls(project.id, Some(sitemap_id), chunk)
                .await?;
            let processed = run
                .processed
                .fetch_add(chunk.len() as i64, Ordering::SeqCst)
                + chunk.len() as i64;
            ctx.report_items(processed, run.total.load(Ordering::SeqCst))
                .await;
        }
        Ok(())
    }

    async fn fan_out(
        &self,
        project: &Project,
        run: &ScanRun,
        ctx: &JobContext,
        parsed: &ParsedSitemap,
        sitemap_id: uuid::Uuid,
        depth: u32,
    ) -> Result<()> {
        // Dedupe within this index; the run-wide visited set catches
        // cross-index cycles.
        let mut unique = Vec::new();
        let mut seen = HashSet::new();
        for child in &parsed.child_sitemaps {
            if seen.insert(child.as_str()) {
                unique.push(child.clone());
            }
        }

        let results: Vec<Result<()>> = stream::iter(unique.into_iter().map(|child| {
            let child_url = child.clone();
            async move {
                match self
                    .scan_target(project, run, ctx, child, Some(sitemap_id), depth + 1)
                    .await
                {
                    Err(SitepulseError::Aborted) => Err(SitepulseError::Aborted),
                    Err(e) => {
                        run.sub_errors.fetch_add(1, Ordering::SeqCst);
                        metrics::counter!(telemetry::ERRORS_TOTAL, "kind" => e.kind())
                            .increment(1);
                        self.controller
                            .log(
                                project.organization_id,
                                project.id,
                                Some(ctx.job_id),
                                LogLevel::Warn,
                                LogModule::Stream,
                                format!("Sub-sitemap failed: {child_url}: {e}"),
                            )
                            .await;
                        Ok(())
                    }
                    Ok(()) => Ok(()),
                }
            }
        }))
        .buffer_unordered(FANOUT_CONCURRENCY)
        .collect()
        .await;

        for result in results {
            result?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ScannerWorker {
    async fn handle(&self, payload: JobPayload, ctx: JobContext) -> Result<()> {
        let JobPayload::Scanner(payload) = payload else {
            return Err(SitepulseError::Config(
                "scanner received non-scanner payload".to_string(),
            ));
        };
        self.run(payload, ctx).await
    }
}

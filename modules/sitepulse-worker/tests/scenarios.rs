//! End-to-end worker scenarios against the in-memory store and scripted
//! HTTP fakes: scans over sitemap graphs (including cycles), quota-bounded
//! Google submission, fatal short-circuits, IndexNow adaptive splitting,
//! and pause/abort behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use sitepulse_common::{
    Engine, GooglePayload, IndexNowPayload, JobPayload, JobStatus, JobType, Result, ScannerPayload,
    SitepulseError, SubmissionStatus, SubmitAction, UrlStatus, Vault,
};
use sitepulse_live::{EventBus, LocalBroker};
use sitepulse_queue::{queues, JobContext, JobHandler, ProgressSink};
use sitepulse_sitemap::{FetchResult, SitemapFetcher};
use sitepulse_store::{memory::MemStore, NewCredential, NewJob, Store};
use sitepulse_worker::google::{GoogleApi, GoogleResponse, GoogleWorker};
use sitepulse_worker::indexnow::{IndexNowApi, IndexNowBody, IndexNowWorker};
use sitepulse_worker::{JobController, ScannerWorker};

const MASTER_KEY: &str = "scenario-test-master-passphrase-0123456789";

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct FakeFetcher {
    pages: HashMap<String, String>,
    fetches: Mutex<HashMap<String, u32>>,
}

impl FakeFetcher {
    fn new(pages: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            pages: pages
                .iter()
                .map(|(url, body)| (url.to_string(), body.to_string()))
                .collect(),
            fetches: Mutex::new(HashMap::new()),
        })
    }

    fn fetch_count(&self, url: &str) -> u32 {
        self.fetches.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SitemapFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, _etag: Option<&str>) -> Result<FetchResult> {
        *self.fetches.lock().unwrap().entry(url.to_string()).or_insert(0) += 1;
        match self.pages.get(url) {
            Some(body) => Ok(FetchResult::Fetched {
                body: body.clone(),
                etag: None,
            }),
            None => Err(SitepulseError::InvalidSitemap(format!("{url}: not found"))),
        }
    }
}

/// Google API double: scripted responses, falling back to 200.
struct ScriptedGoogle {
    scripted: Mutex<Vec<GoogleResponse>>,
    published: Mutex<Vec<String>>,
}

impl ScriptedGoogle {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            scripted: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        })
    }

    fn with_responses(responses: Vec<GoogleResponse>) -> Arc<Self> {
        Arc::new(Self {
            scripted: Mutex::new(responses),
            published: Mutex::new(Vec::new()),
        })
    }

    fn publish_count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl GoogleApi for ScriptedGoogle {
    async fn fetch_token(&self, _service_account_json: &str) -> Result<String> {
        Ok("scenario-token".to_string())
    }

    async fn publish(
        &self,
        _token: &str,
        url: &str,
        _action: SubmitAction,
    ) -> Result<GoogleResponse> {
        self.published.lock().unwrap().push(url.to_string());
        let mut scripted = self.scripted.lock().unwrap();
        if scripted.is_empty() {
            Ok(GoogleResponse {
                status: 200,
                body: "{}".to_string(),
            })
        } else {
            Ok(scripted.remove(0))
        }
    }

    async fn metadata(&self, _token: &str, _url: &str) -> Result<GoogleResponse> {
        Ok(GoogleResponse {
            status: 404,
            body: "{}".to_string(),
        })
    }
}

/// IndexNow double: rejects batches above a threshold with 422, accepts
/// the rest.
struct SplittingIndexNow {
    reject_above: usize,
    calls: Mutex<Vec<(String, usize)>>,
}

impl SplittingIndexNow {
    fn new(reject_above: usize) -> Arc<Self> {
        Arc::new(Self {
            reject_above,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl IndexNowApi for SplittingIndexNow {
    async fn submit(&self, endpoint_url: &str, body: &IndexNowBody) -> Result<u16> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint_url.to_string(), body.url_list.len()));
        if body.url_list.len() > self.reject_above {
            Ok(422)
        } else {
            Ok(200)
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<MemStore>,
    controller: Arc<JobController>,
    vault: Vault,
    project: sitepulse_common::Project,
}

fn harness() -> Harness {
    let store = Arc::new(MemStore::new());
    let bus = EventBus::new(Arc::new(LocalBroker::new()));
    let controller = JobController::new(store.clone() as Arc<dyn Store>, bus);
    let project = store.add_project(Uuid::new_v4(), "t", "http://t/sm.xml");
    Harness {
        store,
        controller,
        vault: Vault::new(MASTER_KEY).unwrap(),
        project,
    }
}

impl Harness {
    async fn new_job(&self, job_type: JobType) -> sitepulse_common::Job {
        self.store
            .create_job(NewJob {
                project_id: self.project.id,
                job_type,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap()
    }

    fn ctx(&self, job_id: Uuid, queue: &'static str) -> JobContext {
        let handle = self.controller.control().register(job_id);
        JobContext::new(
            job_id,
            queue,
            1,
            handle,
            self.controller.clone() as Arc<dyn ProgressSink>,
        )
    }

    async fn seed_credential(&self, engine: Engine, plaintext: &str) {
        let secret = self.vault.encrypt(plaintext).unwrap();
        self.store
            .upsert_credential(NewCredential {
                project_id: self.project.id,
                engine,
                kind: match engine {
                    Engine::Google => "service_account".to_string(),
                    Engine::Indexnow => "api_key".to_string(),
                },
                encrypted_data: secret.ciphertext,
                iv: secret.iv,
                auth_tag: secret.auth_tag,
                salt: secret.salt,
                expires_at: None,
            })
            .await
            .unwrap();
    }

    async fn job(&self, id: Uuid) -> sitepulse_common::Job {
        self.store.get_job(id).await.unwrap().unwrap()
    }
}

fn urlset(locs: &[&str]) -> String {
    let urls: String = locs
        .iter()
        .map(|loc| format!("<url><loc>{loc}</loc></url>"))
        .collect();
    format!("<urlset>{urls}</urlset>")
}

fn index(children: &[&str]) -> String {
    let entries: String = children
        .iter()
        .map(|loc| format!("<sitemap><loc>{loc}</loc></sitemap>"))
        .collect();
    format!("<sitemapindex>{entries}</sitemapindex>")
}

// ---------------------------------------------------------------------------
// S1 — sitemap index with two children
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scan_index_with_two_children() {
    let h = harness();
    let fetcher = FakeFetcher::new(&[
        ("http://t/sm.xml", &index(&["http://t/a.xml", "http://t/b.xml"])),
        ("http://t/a.xml", &urlset(&["http://t/x", "http://t/y"])),
        ("http://t/b.xml", &urlset(&["http://t/y", "http://t/z"])),
    ]);
    let worker = ScannerWorker::new(
        h.store.clone() as Arc<dyn Store>,
        fetcher.clone(),
        h.controller.clone(),
    );

    let job = h.new_job(JobType::FullScan).await;
    let payload = JobPayload::Scanner(ScannerPayload {
        project_id: h.project.id,
        job_id: job.id,
        sitemap_url: None,
        parent_sitemap_id: None,
        depth: 0,
    });
    worker
        .handle(payload, h.ctx(job.id, queues::SITEMAP_SCANNER))
        .await
        .unwrap();

    assert_eq!(h.store.url_count(), 3, "x, y, z deduplicated");
    assert_eq!(h.store.sitemap_count(), 3);

    let project = h.store.get_project(h.project.id).await.unwrap().unwrap();
    assert_eq!(project.counters.total, 3);
    assert_eq!(project.counters.pending, 3);
    assert!(project.last_scan_at.is_some());

    let job = h.job(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
}

// ---------------------------------------------------------------------------
// S2 — cyclic index terminates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scan_cyclic_index_fetches_each_once() {
    let h = harness();
    let fetcher = FakeFetcher::new(&[
        ("http://t/sm.xml", &index(&["http://t/sm2.xml"])),
        ("http://t/sm2.xml", &index(&["http://t/sm.xml"])),
    ]);
    let worker = ScannerWorker::new(
        h.store.clone() as Arc<dyn Store>,
        fetcher.clone(),
        h.controller.clone(),
    );

    let job = h.new_job(JobType::FullScan).await;
    worker
        .handle(
            JobPayload::Scanner(ScannerPayload {
                project_id: h.project.id,
                job_id: job.id,
                sitemap_url: None,
                parent_sitemap_id: None,
                depth: 0,
            }),
            h.ctx(job.id, queues::SITEMAP_SCANNER),
        )
        .await
        .unwrap();

    assert_eq!(fetcher.fetch_count("http://t/sm.xml"), 1);
    assert_eq!(fetcher.fetch_count("http://t/sm2.xml"), 1);
    assert_eq!(h.store.url_count(), 0);
    assert_eq!(h.job(job.id).await.status, JobStatus::Completed);
}

// ---------------------------------------------------------------------------
// Sub-sitemap failure does not fail the parent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scan_records_child_failure_and_completes() {
    let h = harness();
    let fetcher = FakeFetcher::new(&[
        ("http://t/sm.xml", &index(&["http://t/good.xml", "http://t/missing.xml"])),
        ("http://t/good.xml", &urlset(&["http://t/x"])),
    ]);
    let worker = ScannerWorker::new(
        h.store.clone() as Arc<dyn Store>,
        fetcher,
        h.controller.clone(),
    );

    let job = h.new_job(JobType::FullScan).await;
    worker
        .handle(
            JobPayload::Scanner(ScannerPayload {
                project_id: h.project.id,
                job_id: job.id,
                sitemap_url: None,
                parent_sitemap_id: None,
                depth: 0,
            }),
            h.ctx(job.id, queues::SITEMAP_SCANNER),
        )
        .await
        .unwrap();

    assert_eq!(h.store.url_count(), 1);
    assert_eq!(h.job(job.id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn scan_unreachable_root_fails_job() {
    let h = harness();
    let fetcher = FakeFetcher::new(&[]);
    let worker = ScannerWorker::new(
        h.store.clone() as Arc<dyn Store>,
        fetcher,
        h.controller.clone(),
    );

    let job = h.new_job(JobType::FullScan).await;
    let result = worker
        .handle(
            JobPayload::Scanner(ScannerPayload {
                project_id: h.project.id,
                job_id: job.id,
                sitemap_url: None,
                parent_sitemap_id: None,
                depth: 0,
            }),
            h.ctx(job.id, queues::SITEMAP_SCANNER),
        )
        .await;

    assert!(result.is_err());
    let job = h.job(job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("Scan failed"));
}

// ---------------------------------------------------------------------------
// S3 — Google quota boundary
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn google_submission_respects_quota_boundary() {
    let h = harness();
    h.seed_credential(Engine::Google, r#"{"client_email":"svc@t","private_key":"pk"}"#)
        .await;
    let today = Utc::now().date_naive();
    h.store
        .add_quota_used(h.project.id, Engine::Google, today, 198, 200)
        .await
        .unwrap();

    let url_ids: Vec<Uuid> = (0..5)
        .map(|i| h.store.add_url(h.project.id, &format!("http://t/p{i}")))
        .collect();

    let api = ScriptedGoogle::ok();
    let worker = GoogleWorker::new(
        h.store.clone() as Arc<dyn Store>,
        api.clone(),
        h.vault.clone(),
        h.controller.clone(),
        200,
    );

    let job = h.new_job(JobType::GoogleSubmission).await;
    worker
        .handle(
            JobPayload::Google(GooglePayload {
                project_id: h.project.id,
                job_id: job.id,
                url_ids: url_ids.clone(),
                action: SubmitAction::UrlUpdated,
            }),
            h.ctx(job.id, queues::GOOGLE_SUBMITTER),
        )
        .await
        .unwrap();

    // Exactly 2 requests went out, filling the day's quota.
    assert_eq!(api.publish_count(), 2);
    let quota = h
        .store
        .get_quota(h.project.id, Engine::Google, today)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(quota.used, 200);

    let urls = h.store.urls();
    let submitted = urls
        .iter()
        .filter(|u| u.google_status == UrlStatus::Submitted)
        .count();
    let discovered = urls
        .iter()
        .filter(|u| u.google_status == UrlStatus::Discovered)
        .count();
    assert_eq!(submitted, 2);
    assert_eq!(discovered, 3, "deferred URLs stay DISCOVERED");

    let job = h.job(job.id).await;
    assert_eq!(job.status, JobStatus::Completed, "quota cap is not a failure");

    let submissions = h
        .store
        .list_submissions(h.project.id, Engine::Google)
        .await
        .unwrap();
    assert_eq!(submissions.len(), 2);
    assert!(submissions
        .iter()
        .all(|s| s.status == SubmissionStatus::Completed));
}

#[tokio::test]
async fn google_submission_exhausted_quota_fails_without_requests() {
    let h = harness();
    h.seed_credential(Engine::Google, r#"{"client_email":"svc@t","private_key":"pk"}"#)
        .await;
    let today = Utc::now().date_naive();
    h.store
        .add_quota_used(h.project.id, Engine::Google, today, 200, 200)
        .await
        .unwrap();
    let url_id = h.store.add_url(h.project.id, "http://t/p");

    let api = ScriptedGoogle::ok();
    let worker = GoogleWorker::new(
        h.store.clone() as Arc<dyn Store>,
        api.clone(),
        h.vault.clone(),
        h.controller.clone(),
        200,
    );

    let job = h.new_job(JobType::GoogleSubmission).await;
    let result = worker
        .handle(
            JobPayload::Google(GooglePayload {
                project_id: h.project.id,
                job_id: job.id,
                url_ids: vec![url_id],
                action: SubmitAction::UrlUpdated,
            }),
            h.ctx(job.id, queues::GOOGLE_SUBMITTER),
        )
        .await;

    assert!(matches!(result, Err(SitepulseError::QuotaExhausted { .. })));
    assert_eq!(api.publish_count(), 0);
    let job = h.job(job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("QuotaExhausted"));
}

// ---------------------------------------------------------------------------
// S4 — permission denial short-circuits
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn google_permission_denial_stops_the_job() {
    let h = harness();
    h.seed_credential(Engine::Google, r#"{"client_email":"svc@t","private_key":"pk"}"#)
        .await;
    let url_ids: Vec<Uuid> = (0..3)
        .map(|i| h.store.add_url(h.project.id, &format!("http://t/p{i}")))
        .collect();

    let api = ScriptedGoogle::with_responses(vec![GoogleResponse {
        status: 403,
        body: r#"{"error":{"message":"Permission denied: ownership"}}"#.to_string(),
    }]);
    let worker = GoogleWorker::new(
        h.store.clone() as Arc<dyn Store>,
        api.clone(),
        h.vault.clone(),
        h.controller.clone(),
        200,
    );

    let job = h.new_job(JobType::GoogleSubmission).await;
    let result = worker
        .handle(
            JobPayload::Google(GooglePayload {
                project_id: h.project.id,
                job_id: job.id,
                url_ids,
                action: SubmitAction::UrlUpdated,
            }),
            h.ctx(job.id, queues::GOOGLE_SUBMITTER),
        )
        .await;

    assert!(matches!(result, Err(SitepulseError::PermissionDenied(_))));
    // No request after the fatal one.
    assert_eq!(api.publish_count(), 1);

    let job = h.job(job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("PermissionDenied"));

    let submissions = h
        .store
        .list_submissions(h.project.id, Engine::Google)
        .await
        .unwrap();
    assert_eq!(submissions.len(), 1, "exactly one submission row");
    assert_eq!(submissions[0].status, SubmissionStatus::Failed);
    assert_eq!(submissions[0].response_code, Some(403));
}

// ---------------------------------------------------------------------------
// S5 — IndexNow adaptive splitting
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn indexnow_splits_rejected_batches() {
    let h = harness();
    h.seed_credential(Engine::Indexnow, "0123456789abcdef0123456789abcdef")
        .await;
    let url_ids: Vec<Uuid> = (0..40)
        .map(|i| h.store.add_url(h.project.id, &format!("http://t/p{i}")))
        .collect();

    let api = SplittingIndexNow::new(20);
    let worker = IndexNowWorker::new(
        h.store.clone() as Arc<dyn Store>,
        api.clone(),
        h.vault.clone(),
        h.controller.clone(),
    );

    let job = h.new_job(JobType::IndexnowSubmission).await;
    worker
        .handle(
            JobPayload::IndexNow(IndexNowPayload {
                project_id: h.project.id,
                job_id: job.id,
                url_ids,
            }),
            h.ctx(job.id, queues::INDEXNOW_SUBMITTER),
        )
        .await
        .unwrap();

    // Per endpoint: one 40-URL call rejected, then two accepted halves.
    let calls = api.calls.lock().unwrap().clone();
    for (_, endpoint) in sitepulse_worker::indexnow::ENDPOINTS {
        let sizes: Vec<usize> = calls
            .iter()
            .filter(|(url, _)| url == endpoint)
            .map(|(_, n)| *n)
            .collect();
        assert_eq!(sizes, vec![40, 20, 20], "endpoint {endpoint}");
    }

    let submissions = h
        .store
        .list_submissions(h.project.id, Engine::Indexnow)
        .await
        .unwrap();
    assert_eq!(submissions.len(), 40);
    assert!(
        submissions
            .iter()
            .all(|s| s.status == SubmissionStatus::Completed),
        "submitted=40, errors=0"
    );
    assert!(h
        .store
        .urls()
        .iter()
        .all(|u| u.bing_status == UrlStatus::Submitted));

    let quota = h
        .store
        .get_quota(h.project.id, Engine::Indexnow, Utc::now().date_naive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(quota.used, 40);
    assert_eq!(h.job(job.id).await.status, JobStatus::Completed);
}

// ---------------------------------------------------------------------------
// S6 — pause stalls, abort cancels, nothing runs after
// ---------------------------------------------------------------------------

/// Sink that delegates to the controller and pauses the job the first
/// time an item-count progress event comes through.
struct PauseAtFirstBatch {
    controller: Arc<JobController>,
    fired: AtomicBool,
    reached: tokio::sync::Notify,
}

#[async_trait]
impl ProgressSink for PauseAtFirstBatch {
    async fn progress(&self, job_id: Uuid, percent: i16, items: Option<(i64, i64)>) {
        self.controller.progress(job_id, percent, items).await;
        if items.is_some() && !self.fired.swap(true, Ordering::SeqCst) {
            self.controller.pause(job_id);
            self.reached.notify_one();
        }
    }
}

#[tokio::test(start_paused = true)]
async fn scan_pause_stalls_then_abort_cancels() {
    let h = harness();
    let locs: Vec<String> = (0..1000).map(|i| format!("http://t/p{i}")).collect();
    let body = urlset(&locs.iter().map(String::as_str).collect::<Vec<_>>());
    let fetcher = FakeFetcher::new(&[("http://t/sm.xml", &body)]);
    let worker = ScannerWorker::new(
        h.store.clone() as Arc<dyn Store>,
        fetcher,
        h.controller.clone(),
    );

    let job = h.new_job(JobType::FullScan).await;
    let sink = Arc::new(PauseAtFirstBatch {
        controller: h.controller.clone(),
        fired: AtomicBool::new(false),
        reached: tokio::sync::Notify::new(),
    });
    let handle = h.controller.control().register(job.id);
    let ctx = JobContext::new(
        job.id,
        queues::SITEMAP_SCANNER,
        1,
        handle,
        sink.clone() as Arc<dyn ProgressSink>,
    );

    let job_id = job.id;
    let project_id = h.project.id;
    let run = tokio::spawn(async move {
        worker
            .handle(
                JobPayload::Scanner(ScannerPayload {
                    project_id,
                    job_id,
                    sitemap_url: None,
                    parent_sitemap_id: None,
                    depth: 0,
                }),
                ctx,
            )
            .await
    });

    // First 500-URL batch lands, then the sink pauses the job.
    sink.reached.notified().await;

    // Progress stalls while paused: the second batch never starts.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let stalled = h.job(job_id).await;
    assert_eq!(stalled.status, JobStatus::Processing);
    assert_eq!(stalled.progress, 50);
    assert_eq!(stalled.processed_items, 500);
    assert_eq!(h.store.url_count(), 500);

    // Abort while paused: the job lands in CANCELLED without another batch.
    h.controller.control().abort(job_id);
    run.await.unwrap().unwrap();

    let cancelled = h.job(job_id).await;
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.error_message.as_deref(), Some("Job Aborted"));
    assert_eq!(cancelled.processed_items, 500);
    assert_eq!(h.store.url_count(), 500, "no batch written after abort");
}

#[tokio::test(start_paused = true)]
async fn scan_pause_then_resume_completes() {
    let h = harness();
    let locs: Vec<String> = (0..1000).map(|i| format!("http://t/p{i}")).collect();
    let body = urlset(&locs.iter().map(String::as_str).collect::<Vec<_>>());
    let fetcher = FakeFetcher::new(&[("http://t/sm.xml", &body)]);
    let worker = ScannerWorker::new(
        h.store.clone() as Arc<dyn Store>,
        fetcher,
        h.controller.clone(),
    );

    let job = h.new_job(JobType::FullScan).await;
    let sink = Arc::new(PauseAtFirstBatch {
        controller: h.controller.clone(),
        fired: AtomicBool::new(false),
        reached: tokio::sync::Notify::new(),
    });
    let handle = h.controller.control().register(job.id);
    let ctx = JobContext::new(
        job.id,
        queues::SITEMAP_SCANNER,
        1,
        handle,
        sink.clone() as Arc<dyn ProgressSink>,
    );

    let job_id = job.id;
    let project_id = h.project.id;
    let run = tokio::spawn(async move {
        worker
            .handle(
                JobPayload::Scanner(ScannerPayload {
                    project_id,
                    job_id,
                    sitemap_url: None,
                    parent_sitemap_id: None,
                    depth: 0,
                }),
                ctx,
            )
            .await
    });

    sink.reached.notified().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.job(job_id).await.progress, 50);

    h.controller.control().resume(job_id);
    run.await.unwrap().unwrap();

    let done = h.job(job_id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.processed_items, 1000);
    assert_eq!(h.store.url_count(), 1000);
}

//! Per-job pause/abort handles and the progress reporting context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sitepulse_common::{Result, SitepulseError};

/// Paused loops poll at this interval; well under the 500 ms bound.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Progress updates are emitted at most this often (terminal 100 always
/// goes through).
const PROGRESS_THROTTLE: Duration = Duration::from_millis(200);

/// Receives clamped, throttled progress percentages. The worker side
/// persists them and fans them out to live subscribers. `items` carries
/// `(processed, total)` when the caller tracks item counts.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn progress(&self, job_id: Uuid, percent: i16, items: Option<(i64, i64)>);
}

/// Sink that discards progress. Test plumbing.
pub struct NoopProgress;

#[async_trait]
impl ProgressSink for NoopProgress {
    async fn progress(&self, _job_id: Uuid, _percent: i16, _items: Option<(i64, i64)>) {}
}

struct ProgressState {
    last_percent: i16,
    last_emit: Option<Instant>,
}

struct HandleInner {
    paused: AtomicBool,
    cancel: CancellationToken,
    progress: Mutex<ProgressState>,
}

/// Shared pause/abort/progress state of one job. Cloning is cheap; all
/// clones observe the same flags.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<HandleInner>,
}

impl JobHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                paused: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                progress: Mutex::new(ProgressState {
                    last_percent: 0,
                    last_emit: None,
                }),
            }),
        }
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn abort(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Cooperative suspension point. Blocks while paused, fails with
    /// `Aborted` once the job is cancelled. Workers call this between
    /// units of work (sitemap, batch, or URL).
    pub async fn checkpoint(&self) -> Result<()> {
        loop {
            if self.is_aborted() {
                return Err(SitepulseError::Aborted);
            }
            if !self.is_paused() {
                return Ok(());
            }
            tokio::time::sleep(PAUSE_POLL).await;
        }
    }

    /// Clamp `percent` to `[last_reported, 100]` and decide whether the
    /// throttle lets it through. Returns the value to emit, if any.
    fn clamp_progress(&self, percent: i16) -> Option<i16> {
        let mut state = self.inner.progress.lock().unwrap();
        let clamped = percent.clamp(state.last_percent, 100);
        if clamped == state.last_percent && state.last_emit.is_some() {
            return None;
        }
        let now = Instant::now();
        if clamped < 100 {
            if let Some(last) = state.last_emit {
                if now.duration_since(last) < PROGRESS_THROTTLE {
                    return None;
                }
            }
        }
        state.last_percent = clamped;
        state.last_emit = Some(now);
        Some(clamped)
    }
}

/// Registry of live job handles, shared by the broker, the workers, and
/// the external pause/resume/abort surface.
#[derive(Default)]
pub struct JobControl {
    entries: Mutex<HashMap<Uuid, JobHandle>>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the handle for a job.
    pub fn register(&self, job_id: Uuid) -> JobHandle {
        self.entries
            .lock()
            .unwrap()
            .entry(job_id)
            .or_insert_with(JobHandle::new)
            .clone()
    }

    pub fn get(&self, job_id: Uuid) -> Option<JobHandle> {
        self.entries.lock().unwrap().get(&job_id).cloned()
    }

    pub fn pause(&self, job_id: Uuid) -> bool {
        self.get(job_id).map(|h| h.pause()).is_some()
    }

    pub fn resume(&self, job_id: Uuid) -> bool {
        self.get(job_id).map(|h| h.resume()).is_some()
    }

    /// Signal cancellation. The handle stays registered until the worker
    /// observes the signal and removes it after the terminal transition.
    pub fn abort(&self, job_id: Uuid) -> bool {
        self.get(job_id).map(|h| h.abort()).is_some()
    }

    pub fn remove(&self, job_id: Uuid) {
        self.entries.lock().unwrap().remove(&job_id);
    }
}

/// Everything a queue handler gets besides its payload.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub queue: &'static str,
    pub attempt: u32,
    pub(crate) handle: JobHandle,
    pub(crate) sink: Arc<dyn ProgressSink>,
}

impl JobContext {
    pub fn new(
        job_id: Uuid,
        queue: &'static str,
        attempt: u32,
        handle: JobHandle,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            job_id,
            queue,
            attempt,
            handle,
            sink,
        }
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.handle.cancel_token()
    }

    /// See [`JobHandle::checkpoint`].
    pub async fn checkpoint(&self) -> Result<()> {
        self.handle.checkpoint().await
    }

    /// Report progress. Values only ever advance and updates are rate
    /// limited; the sink sees the filtered stream.
    pub async fn report_progress(&self, percent: i16) {
        if let Some(value) = self.handle.clamp_progress(percent) {
            self.sink.progress(self.job_id, value, None).await;
        }
    }

    /// Report progress as `processed/total` items. The percent is derived
    /// and goes through the same clamp and throttle.
    pub async fn report_items(&self, processed: i64, total: i64) {
        let percent = if total <= 0 {
            0
        } else {
            ((processed as f64 / total as f64) * 100.0).round() as i16
        };
        if let Some(value) = self.handle.clamp_progress(percent) {
            self.sink
                .progress(self.job_id, value, Some((processed, total)))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recording(Mutex<Vec<i16>>);

    #[async_trait]
    impl ProgressSink for Recording {
        async fn progress(&self, _job_id: Uuid, percent: i16, _items: Option<(i64, i64)>) {
            self.0.lock().unwrap().push(percent);
        }
    }

    fn ctx_with_sink(sink: Arc<Recording>) -> JobContext {
        JobContext::new(
            Uuid::new_v4(),
            "sitemap-scanner",
            1,
            JobHandle::new(),
            sink,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_never_regresses() {
        let sink = Arc::new(Recording(Mutex::new(Vec::new())));
        let ctx = ctx_with_sink(sink.clone());

        ctx.report_progress(30).await;
        tokio::time::advance(Duration::from_millis(250)).await;
        ctx.report_progress(20).await; // clamped to 30, duplicate, dropped
        tokio::time::advance(Duration::from_millis(250)).await;
        ctx.report_progress(60).await;
        tokio::time::advance(Duration::from_millis(250)).await;
        ctx.report_progress(100).await;

        let emitted = sink.0.lock().unwrap().clone();
        assert_eq!(emitted, vec![30, 60, 100]);
        assert!(emitted.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_throttled_to_200ms() {
        let sink = Arc::new(Recording(Mutex::new(Vec::new())));
        let ctx = ctx_with_sink(sink.clone());

        ctx.report_progress(10).await;
        ctx.report_progress(20).await; // within 200ms window, dropped
        ctx.report_progress(30).await; // dropped
        tokio::time::advance(Duration::from_millis(201)).await;
        ctx.report_progress(40).await;

        assert_eq!(sink.0.lock().unwrap().clone(), vec![10, 40]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_100_bypasses_throttle() {
        let sink = Arc::new(Recording(Mutex::new(Vec::new())));
        let ctx = ctx_with_sink(sink.clone());

        ctx.report_progress(99).await;
        ctx.report_progress(100).await;
        assert_eq!(sink.0.lock().unwrap().clone(), vec![99, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_blocks_while_paused() {
        let control = JobControl::new();
        let job_id = Uuid::new_v4();
        let handle = control.register(job_id);

        handle.pause();
        let waiting = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.checkpoint().await })
        };
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(!waiting.is_finished());

        control.resume(job_id);
        assert!(waiting.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_fails_after_abort() {
        let control = JobControl::new();
        let job_id = Uuid::new_v4();
        let handle = control.register(job_id);

        control.abort(job_id);
        assert!(matches!(
            handle.checkpoint().await,
            Err(SitepulseError::Aborted)
        ));

        // Abort wins even while paused.
        let handle2 = control.register(Uuid::new_v4());
        handle2.pause();
        handle2.abort();
        assert!(matches!(
            handle2.checkpoint().await,
            Err(SitepulseError::Aborted)
        ));
    }
}

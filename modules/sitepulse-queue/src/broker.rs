//! Queue dispatch: at-least-once delivery with per-queue concurrency
//! caps, token-bucket rate limits, and exponential redelivery backoff.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use sitepulse_common::{telemetry, JobPayload, Result, SitepulseError};

use crate::control::{JobContext, JobControl, ProgressSink};
use crate::queues;

const RETRY_BASE: Duration = Duration::from_secs(1);

/// Delay before redelivery attempt `attempt` (1-based): 1s, 2s, 4s, ...
pub fn retry_delay(attempt: u32) -> Duration {
    RETRY_BASE * 2u32.pow(attempt.saturating_sub(1).min(6))
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub name: &'static str,
    pub concurrency: usize,
    pub rate_per_sec: u32,
    pub max_attempts: u32,
}

impl QueueConfig {
    pub fn scanner() -> Self {
        Self {
            name: queues::SITEMAP_SCANNER,
            concurrency: 10,
            rate_per_sec: 50,
            max_attempts: 3,
        }
    }

    pub fn google() -> Self {
        Self {
            name: queues::GOOGLE_SUBMITTER,
            concurrency: 5,
            rate_per_sec: 10,
            max_attempts: 3,
        }
    }

    pub fn indexnow() -> Self {
        Self {
            name: queues::INDEXNOW_SUBMITTER,
            concurrency: 3,
            rate_per_sec: 20,
            max_attempts: 3,
        }
    }
}

/// A queue consumer. One handler instance serves a whole pool; per-job
/// state travels in the payload and context.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, payload: JobPayload, ctx: JobContext) -> Result<()>;
}

#[derive(Clone)]
struct Envelope {
    payload: JobPayload,
    attempt: u32,
}

struct QueueState {
    config: QueueConfig,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    depth: AtomicI64,
}

/// In-process broker over named queues. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    queues: Arc<HashMap<&'static str, QueueState>>,
}

impl Broker {
    pub fn new(configs: &[QueueConfig]) -> Self {
        let mut queues = HashMap::new();
        for config in configs {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.insert(
                config.name,
                QueueState {
                    config: *config,
                    tx,
                    rx: Mutex::new(Some(rx)),
                    depth: AtomicI64::new(0),
                },
            );
        }
        Self {
            queues: Arc::new(queues),
        }
    }

    /// The standard three worker queues with spec rates.
    pub fn standard() -> Self {
        Self::new(&[
            QueueConfig::scanner(),
            QueueConfig::google(),
            QueueConfig::indexnow(),
        ])
    }

    fn state(&self, queue: &str) -> Result<&QueueState> {
        self.queues
            .get(queue)
            .ok_or_else(|| SitepulseError::NotFound(format!("queue {queue}")))
    }

    pub fn enqueue(&self, queue: &str, payload: JobPayload) -> Result<()> {
        self.push(queue, Envelope { payload, attempt: 1 })
    }

    /// Delayed delivery, used for retry backoff.
    pub fn enqueue_after(&self, queue: &'static str, payload: JobPayload, delay: Duration) {
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = broker.push(queue, Envelope { payload, attempt: 1 }) {
                error!(queue, error = %e, "Delayed enqueue failed");
            }
        });
    }

    fn push(&self, queue: &str, envelope: Envelope) -> Result<()> {
        let state = self.state(queue)?;
        state
            .tx
            .send(envelope)
            .map_err(|_| SitepulseError::Conflict(format!("queue {queue} is shut down")))?;
        let depth = state.depth.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!(telemetry::QUEUE_SIZE, "queue" => queue.to_string()).set(depth as f64);
        Ok(())
    }

    fn redeliver(&self, queue: &'static str, envelope: Envelope, delay: Duration) {
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = broker.push(queue, envelope) {
                error!(queue, error = %e, "Redelivery enqueue failed");
            }
        });
    }

    pub fn depth(&self, queue: &str) -> i64 {
        self.state(queue)
            .map(|s| s.depth.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Start the dispatch loop for one queue. Call once per queue; the
    /// returned task runs until the broker is dropped.
    pub fn run(
        &self,
        queue: &'static str,
        handler: Arc<dyn JobHandler>,
        control: Arc<JobControl>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<JoinHandle<()>> {
        let state = self.state(queue)?;
        let config = state.config;
        let mut rx = state
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SitepulseError::Conflict(format!("queue {queue} already running")))?;
        let broker = self.clone();

        let task = tokio::spawn(async move {
            let limiter = RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(config.rate_per_sec.max(1)).unwrap(),
            ));
            let semaphore = Arc::new(Semaphore::new(config.concurrency));

            while let Some(envelope) = rx.recv().await {
                if let Ok(state) = broker.state(queue) {
                    let depth = state.depth.fetch_sub(1, Ordering::SeqCst) - 1;
                    metrics::gauge!(telemetry::QUEUE_SIZE, "queue" => queue).set(depth as f64);
                }
                limiter.until_ready().await;
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("queue semaphore closed");

                let handler = handler.clone();
                let control = control.clone();
                let sink = sink.clone();
                let broker = broker.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    dispatch(broker, queue, config, envelope, handler, control, sink).await;
                });
            }
        });
        Ok(task)
    }
}

async fn dispatch(
    broker: Broker,
    queue: &'static str,
    config: QueueConfig,
    envelope: Envelope,
    handler: Arc<dyn JobHandler>,
    control: Arc<JobControl>,
    sink: Arc<dyn ProgressSink>,
) {
    let job_id = envelope.payload.job_id();
    let handle = control.register(job_id);
    let ctx = JobContext::new(job_id, queue, envelope.attempt, handle, sink);

    match handler.handle(envelope.payload.clone(), ctx).await {
        Ok(()) => {}
        Err(e) if e.is_retryable() && envelope.attempt < config.max_attempts => {
            let delay = retry_delay(envelope.attempt);
            warn!(
                queue,
                %job_id,
                attempt = envelope.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Job failed, scheduling redelivery"
            );
            broker.redeliver(
                queue,
                Envelope {
                    payload: envelope.payload,
                    attempt: envelope.attempt + 1,
                },
                delay,
            );
        }
        Err(e) => {
            metrics::counter!(telemetry::ERRORS_TOTAL, "kind" => e.kind()).increment(1);
            error!(queue, %job_id, attempt = envelope.attempt, error = %e, "Job failed terminally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitepulse_common::{JobPayload, ScannerPayload};
    use std::sync::atomic::AtomicU32;
    use uuid::Uuid;

    use crate::NoopProgress;

    fn scanner_payload() -> JobPayload {
        JobPayload::Scanner(ScannerPayload {
            project_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            sitemap_url: None,
            parent_sitemap_id: None,
            depth: 0,
        })
    }

    struct FlakyHandler {
        calls: AtomicU32,
        fail_first: u32,
        done: tokio::sync::Notify,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, _payload: JobPayload, _ctx: JobContext) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(SitepulseError::Transient("boom".into()));
            }
            self.done.notify_one();
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_redelivered() {
        let broker = Broker::standard();
        let handler = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            fail_first: 2,
            done: tokio::sync::Notify::new(),
        });
        broker
            .run(
                queues::SITEMAP_SCANNER,
                handler.clone(),
                Arc::new(JobControl::new()),
                Arc::new(NoopProgress),
            )
            .unwrap();

        broker
            .enqueue(queues::SITEMAP_SCANNER, scanner_payload())
            .unwrap();

        handler.done.notified().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    struct FatalHandler {
        calls: AtomicU32,
        done: tokio::sync::Notify,
    }

    #[async_trait]
    impl JobHandler for FatalHandler {
        async fn handle(&self, _payload: JobPayload, _ctx: JobContext) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.done.notify_one();
            Err(SitepulseError::PermissionDenied("ownership".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_errors_are_not_redelivered() {
        let broker = Broker::standard();
        let handler = Arc::new(FatalHandler {
            calls: AtomicU32::new(0),
            done: tokio::sync::Notify::new(),
        });
        broker
            .run(
                queues::GOOGLE_SUBMITTER,
                handler.clone(),
                Arc::new(JobControl::new()),
                Arc::new(NoopProgress),
            )
            .unwrap();

        broker
            .enqueue(
                queues::GOOGLE_SUBMITTER,
                JobPayload::Google(sitepulse_common::GooglePayload {
                    project_id: Uuid::new_v4(),
                    job_id: Uuid::new_v4(),
                    url_ids: vec![],
                    action: sitepulse_common::SubmitAction::UrlUpdated,
                }),
            )
            .unwrap();

        handler.done.notified().await;
        // Give any (incorrect) redelivery a chance to fire.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(1), Duration::from_secs(1));
        assert_eq!(retry_delay(2), Duration::from_secs(2));
        assert_eq!(retry_delay(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_unknown_queue_rejected() {
        let broker = Broker::standard();
        assert!(broker.enqueue("no-such-queue", scanner_payload()).is_err());
    }
}

//! In-process pub/sub keyed by (organization, project), mirrored through
//! the cross-instance broker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use sitepulse_common::{redact, JobUpdate, LogEvent, ProjectCounters};

use crate::broker::{channel_name, parse_channel, BrokerMessage, EventBroker};

/// Per-channel broadcast capacity. Slow subscribers lag past this and
/// apply the [`SendBuffer`] drop policy on their side.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsUpdate {
    pub project_id: Uuid,
    pub counters: ProjectCounters,
}

/// Wire-shaped event envelope: `{type, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BusEvent {
    #[serde(rename = "LOG")]
    Log(LogEvent),
    #[serde(rename = "JOB_UPDATE")]
    JobUpdate(JobUpdate),
    #[serde(rename = "STATS_UPDATE")]
    Stats(StatsUpdate),
}

impl BusEvent {
    fn is_log(&self) -> bool {
        matches!(self, BusEvent::Log(_))
    }

    fn is_terminal_update(&self) -> bool {
        matches!(self, BusEvent::JobUpdate(u) if u.status.is_terminal())
    }
}

type ChannelKey = (Uuid, Uuid);

pub struct EventBus {
    instance_id: Uuid,
    channels: Mutex<HashMap<ChannelKey, broadcast::Sender<BusEvent>>>,
    broker: Arc<dyn EventBroker>,
}

impl EventBus {
    pub fn new(broker: Arc<dyn EventBroker>) -> Arc<Self> {
        Arc::new(Self {
            instance_id: Uuid::new_v4(),
            channels: Mutex::new(HashMap::new()),
            broker,
        })
    }

    /// Begin consuming the broker feed. Messages published by this
    /// instance are skipped; everything else is delivered to local
    /// subscribers without re-publishing.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut rx = match bus.broker.subscribe().await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "Event broker subscription failed; running local-only");
                    return;
                }
            };
            while let Some(msg) = rx.recv().await {
                if msg.origin == bus.instance_id {
                    continue;
                }
                if let Some((org, project)) = parse_channel(&msg.channel) {
                    bus.deliver_local(org, project, msg.event);
                }
            }
        })
    }

    fn sender(&self, org: Uuid, project: Uuid) -> broadcast::Sender<BusEvent> {
        self.channels
            .lock()
            .unwrap()
            .entry((org, project))
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn deliver_local(&self, org: Uuid, project: Uuid, event: BusEvent) {
        // No local subscribers is not an error.
        let _ = self.sender(org, project).send(event);
    }

    /// Publish to local subscribers and mirror to other instances.
    pub async fn publish(&self, org: Uuid, project: Uuid, mut event: BusEvent) {
        if let BusEvent::Log(ref mut log) = event {
            log.message = redact::redact_message(&log.message);
        }
        self.deliver_local(org, project, event.clone());
        let msg = BrokerMessage {
            channel: channel_name(org, project),
            origin: self.instance_id,
            event,
        };
        if let Err(e) = self.broker.publish(msg).await {
            warn!(error = %e, "Cross-instance event publish failed");
        }
    }

    pub fn subscribe(&self, org: Uuid, project: Uuid) -> broadcast::Receiver<BusEvent> {
        self.sender(org, project).subscribe()
    }
}

// ---------------------------------------------------------------------------
// SendBuffer — per-subscriber back-pressure
// ---------------------------------------------------------------------------

/// Bounded send buffer for one subscriber. When full, the oldest LOG
/// event goes first, then oldest non-terminal updates. Terminal
/// JOB_UPDATE events are never dropped.
pub struct SendBuffer {
    capacity: usize,
    items: VecDeque<BusEvent>,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::new(),
        }
    }

    pub fn push(&mut self, event: BusEvent) {
        self.items.push_back(event);
        while self.items.len() > self.capacity {
            if let Some(idx) = self.items.iter().position(BusEvent::is_log) {
                self.items.remove(idx);
            } else if let Some(idx) = self
                .items
                .iter()
                .position(|e| !e.is_terminal_update())
            {
                self.items.remove(idx);
            } else {
                // Only terminal updates left; keep them all.
                break;
            }
        }
    }

    pub fn pop(&mut self) -> Option<BusEvent> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use sitepulse_common::{JobStatus, JobType, LogLevel, LogModule};

    fn log_event(message: &str) -> BusEvent {
        BusEvent::Log(LogEvent::new(LogLevel::Info, LogModule::Worker, message))
    }

    fn job_update(status: JobStatus, progress: i16) -> BusEvent {
        BusEvent::JobUpdate(JobUpdate {
            id: Uuid::new_v4(),
            job_type: JobType::FullScan,
            status,
            progress,
            processed_items: 0,
            total_items: 0,
        })
    }

    #[tokio::test]
    async fn test_events_delivered_in_publish_order() {
        let bus = EventBus::new(Arc::new(LocalBroker::new()));
        let org = Uuid::new_v4();
        let project = Uuid::new_v4();
        let mut rx = bus.subscribe(org, project);

        for i in 0..20 {
            bus.publish(org, project, log_event(&format!("message {i}"))).await;
        }

        for i in 0..20 {
            match rx.recv().await.unwrap() {
                BusEvent::Log(log) => assert_eq!(log.message, format!("message {i}")),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_own_broker_echo_not_redelivered() {
        let bus = EventBus::new(Arc::new(LocalBroker::new()));
        bus.start();
        let org = Uuid::new_v4();
        let project = Uuid::new_v4();
        let mut rx = bus.subscribe(org, project);

        bus.publish(org, project, log_event("once")).await;

        // Exactly one delivery: the local one. The broker echo is skipped.
        assert!(matches!(rx.recv().await.unwrap(), BusEvent::Log(_)));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_cross_instance_mirroring() {
        let broker = Arc::new(LocalBroker::new());
        let bus_a = EventBus::new(broker.clone());
        let bus_b = EventBus::new(broker);
        bus_a.start();
        bus_b.start();
        // Let both subscriptions attach before publishing.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let org = Uuid::new_v4();
        let project = Uuid::new_v4();
        let mut rx_b = bus_b.subscribe(org, project);

        bus_a.publish(org, project, log_event("hello across")).await;

        match tokio::time::timeout(std::time::Duration::from_secs(1), rx_b.recv())
            .await
            .expect("timed out waiting for mirrored event")
            .unwrap()
        {
            BusEvent::Log(log) => assert_eq!(log.message, "hello across"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_log_messages_redacted_on_publish() {
        let bus = EventBus::new(Arc::new(LocalBroker::new()));
        let org = Uuid::new_v4();
        let project = Uuid::new_v4();
        let mut rx = bus.subscribe(org, project);

        bus.publish(org, project, log_event("auth: Bearer ya29.secret-token failed")).await;

        match rx.recv().await.unwrap() {
            BusEvent::Log(log) => {
                assert!(!log.message.contains("ya29"));
                assert!(log.message.contains(sitepulse_common::redact::CENSOR));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_send_buffer_drops_oldest_logs_first() {
        let mut buffer = SendBuffer::new(3);
        buffer.push(log_event("a"));
        buffer.push(job_update(JobStatus::Processing, 10));
        buffer.push(log_event("b"));
        buffer.push(log_event("c")); // over capacity: "a" goes

        let drained: Vec<BusEvent> = std::iter::from_fn(|| buffer.pop()).collect();
        assert_eq!(drained.len(), 3);
        match &drained[1] {
            BusEvent::Log(l) => assert_eq!(l.message, "b"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_send_buffer_never_drops_terminal_updates() {
        let mut buffer = SendBuffer::new(2);
        buffer.push(job_update(JobStatus::Completed, 100));
        buffer.push(job_update(JobStatus::Failed, 40));
        buffer.push(job_update(JobStatus::Cancelled, 60)); // all terminal: grows

        assert_eq!(buffer.len(), 3);
        let statuses: Vec<JobStatus> = std::iter::from_fn(|| buffer.pop())
            .map(|e| match e {
                BusEvent::JobUpdate(u) => u.status,
                other => panic!("unexpected: {other:?}"),
            })
            .collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled]
        );
    }

    #[test]
    fn test_send_buffer_prefers_logs_over_progress() {
        let mut buffer = SendBuffer::new(2);
        buffer.push(job_update(JobStatus::Processing, 10));
        buffer.push(log_event("noise"));
        buffer.push(job_update(JobStatus::Completed, 100));

        // The log went; both updates stay.
        assert_eq!(buffer.len(), 2);
        assert!(matches!(buffer.pop(), Some(BusEvent::JobUpdate(_))));
        assert!(matches!(buffer.pop(), Some(BusEvent::JobUpdate(_))));
    }

    #[test]
    fn test_bus_event_wire_shape() {
        let json = serde_json::to_value(log_event("hi")).unwrap();
        assert_eq!(json["type"], "LOG");
        assert_eq!(json["payload"]["message"], "hi");

        let json = serde_json::to_value(job_update(JobStatus::Processing, 42)).unwrap();
        assert_eq!(json["type"], "JOB_UPDATE");
        assert_eq!(json["payload"]["progress"], 42);
        assert_eq!(json["payload"]["status"], "PROCESSING");
    }
}

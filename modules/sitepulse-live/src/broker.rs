//! Cross-instance event mirroring. Every local publish goes out on a
//! logical `ws:<org>:<project>` channel; instances deliver received
//! messages to their local subscribers only, so events never loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, warn};
use uuid::Uuid;

use sitepulse_common::{Result, SitepulseError};

use crate::bus::BusEvent;

/// Single Postgres NOTIFY channel; the logical channel rides in the
/// payload envelope.
const PG_CHANNEL: &str = "sitepulse_ws";

pub fn channel_name(organization_id: Uuid, project_id: Uuid) -> String {
    format!("ws:{organization_id}:{project_id}")
}

pub fn parse_channel(name: &str) -> Option<(Uuid, Uuid)> {
    let mut parts = name.splitn(3, ':');
    if parts.next()? != "ws" {
        return None;
    }
    let org = parts.next()?.parse().ok()?;
    let project = parts.next()?.parse().ok()?;
    Some((org, project))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub channel: String,
    /// Publishing instance; receivers skip their own messages.
    pub origin: Uuid,
    pub event: BusEvent,
}

#[async_trait]
pub trait EventBroker: Send + Sync {
    async fn publish(&self, msg: BrokerMessage) -> Result<()>;
    async fn subscribe(&self) -> Result<mpsc::Receiver<BrokerMessage>>;
}

// ---------------------------------------------------------------------------
// LocalBroker — single-process deployments and tests
// ---------------------------------------------------------------------------

pub struct LocalBroker {
    tx: broadcast::Sender<BrokerMessage>,
}

impl LocalBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBroker for LocalBroker {
    async fn publish(&self, msg: BrokerMessage) -> Result<()> {
        // No subscribers is fine.
        let _ = self.tx.send(msg);
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BrokerMessage>> {
        let mut rx = self.tx.subscribe();
        let (tx, out) = mpsc::channel(1024);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Broker subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// PgBroker — LISTEN/NOTIFY across instances
// ---------------------------------------------------------------------------

pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventBroker for PgBroker {
    async fn publish(&self, msg: BrokerMessage) -> Result<()> {
        let payload = serde_json::to_string(&msg)
            .map_err(|e| SitepulseError::Database(format!("broker encode: {e}")))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(PG_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| SitepulseError::Database(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BrokerMessage>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| SitepulseError::Database(e.to_string()))?;
        listener
            .listen(PG_CHANNEL)
            .await
            .map_err(|e| SitepulseError::Database(e.to_string()))?;

        let (tx, out) = mpsc::channel(1024);
        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<BrokerMessage>(notification.payload()) {
                            Ok(msg) => {
                                if tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "Undecodable broker payload"),
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Broker listener connection lost");
                        break;
                    }
                }
            }
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_round_trip() {
        let org = Uuid::new_v4();
        let project = Uuid::new_v4();
        let name = channel_name(org, project);
        assert!(name.starts_with("ws:"));
        assert_eq!(parse_channel(&name), Some((org, project)));
    }

    #[test]
    fn test_parse_channel_rejects_garbage() {
        assert_eq!(parse_channel("nope"), None);
        assert_eq!(parse_channel("ws:not-a-uuid:also-not"), None);
        assert_eq!(parse_channel("jobs:1:2"), None);
    }
}

//! Presence and heartbeats
//!
//! Registers the worker in the cluster's `available_sfus` set so the
//! orchestration service can discover it, and advertises load on a fixed
//! tick: the metrics hash `sfu:<id>:metrics` for polling consumers and an
//! `sfuHeartbeat` event on the `sfu_heartbeats` channel for subscribers.
//! Heartbeat failures are logged and counted; the loop never exits.

use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::AsyncCommands;
use relaymesh_sfu::{MetricsSnapshot, WorkerMetrics};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Set of live worker ids, maintained by each worker at startup.
pub const AVAILABLE_WORKERS_KEY: &str = "available_sfus";

/// Pub/sub channel heartbeat events are published on.
pub const HEARTBEAT_CHANNEL: &str = "sfu_heartbeats";

/// Hash the worker writes its load metrics into.
#[must_use]
pub fn metrics_key(worker_id: &str) -> String {
    format!("sfu:{worker_id}:metrics")
}

pub struct PresenceClient {
    client: ClusterClient,
    worker_id: String,
}

impl PresenceClient {
    /// Connect to the Redis cluster, retrying with a fixed delay. Failing
    /// every attempt is fatal for startup.
    pub async fn connect(
        nodes: &[String],
        worker_id: &str,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self> {
        let urls: Vec<String> = nodes.iter().map(|n| format!("redis://{n}")).collect();
        let client = ClusterClient::new(urls)?;

        for attempt in 1..=attempts {
            match Self::ping(&client).await {
                Ok(()) => {
                    info!(worker_id, attempt, "connected to Redis cluster");
                    return Ok(Self {
                        client,
                        worker_id: worker_id.to_string(),
                    });
                }
                Err(e) if attempt < attempts => {
                    warn!(error = %e, attempt, attempts, "Redis cluster not reachable yet, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(error = %e, attempts, "could not reach Redis cluster");
                    return Err(Error::RetriesExhausted("redis cluster", attempts));
                }
            }
        }
        Err(Error::RetriesExhausted("redis cluster", attempts))
    }

    async fn ping(client: &ClusterClient) -> Result<()> {
        let mut conn = client.get_async_connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn connection(&self) -> Result<ClusterConnection> {
        Ok(self.client.get_async_connection().await?)
    }

    /// Add this worker to the `available_sfus` set, bounded-retry. Without
    /// this entry the orchestration service will never route a meeting here,
    /// so exhausting the retries is fatal for startup.
    pub async fn register(&self, attempts: u32, delay: Duration) -> Result<()> {
        for attempt in 1..=attempts {
            let result: Result<()> = async {
                let mut conn = self.connection().await?;
                let _: i64 = conn.sadd(AVAILABLE_WORKERS_KEY, &self.worker_id).await?;
                Ok(())
            }
            .await;

            match result {
                Ok(()) => {
                    info!(worker_id = %self.worker_id, attempt, "registered in available workers set");
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(error = %e, attempt, attempts, "registration failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(error = %e, attempts, "could not register worker");
                    return Err(Error::RetriesExhausted("worker registration", attempts));
                }
            }
        }
        Err(Error::RetriesExhausted("worker registration", attempts))
    }

    /// Write the metrics hash and publish the heartbeat event.
    pub async fn publish_heartbeat(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let mut conn = self.connection().await?;

        let key = metrics_key(&self.worker_id);
        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    ("connected_clients", snapshot.connected_clients),
                    ("active_meetings", snapshot.active_meetings),
                    ("last_heartbeat", snapshot.last_heartbeat),
                ],
            )
            .await?;

        let event = encode_heartbeat(&self.worker_id, snapshot)?;
        let _: i64 = conn.publish(HEARTBEAT_CHANNEL, event).await?;
        Ok(())
    }

    /// Run the fixed-tick heartbeat forever.
    pub fn spawn_heartbeat_loop(
        self: Arc<Self>,
        metrics: WorkerMetrics,
        interval: Duration,
    ) -> JoinHandle<()> {
        info!(worker_id = %self.worker_id, interval_secs = interval.as_secs(), "heartbeat loop starting");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let snapshot = metrics.stamp_heartbeat();
                match self.publish_heartbeat(&snapshot).await {
                    Ok(()) => debug!(
                        connected_clients = snapshot.connected_clients,
                        active_meetings = snapshot.active_meetings,
                        "heartbeat published"
                    ),
                    Err(e) => {
                        error!(error = %e, "failed to publish heartbeat");
                        metrics.record_error();
                    }
                }
            }
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatEvent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: HeartbeatPayload<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatPayload<'a> {
    sfu_id: &'a str,
    metrics: &'a MetricsSnapshot,
}

fn encode_heartbeat(worker_id: &str, snapshot: &MetricsSnapshot) -> Result<String> {
    let event = HeartbeatEvent {
        kind: "sfuHeartbeat",
        payload: HeartbeatPayload {
            sfu_id: worker_id,
            metrics: snapshot,
        },
    };
    Ok(serde_json::to_string(&event)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_key_embeds_the_worker_id() {
        assert_eq!(metrics_key("sfu-ab12"), "sfu:sfu-ab12:metrics");
    }

    #[test]
    fn heartbeat_event_shape() {
        let snapshot = MetricsSnapshot {
            connected_clients: 3,
            active_meetings: 1,
            last_heartbeat: 1_700_000_000_000,
        };
        let json = encode_heartbeat("sfu-1", &snapshot).unwrap();
        assert!(json.contains("\"type\":\"sfuHeartbeat\""));
        assert!(json.contains("\"sfuId\":\"sfu-1\""));
        assert!(json.contains("\"connected_clients\":3"));
        assert!(json.contains("\"active_meetings\":1"));
        assert!(json.contains("\"last_heartbeat\":1700000000000"));
    }

    #[tokio::test]
    #[ignore = "Requires Redis cluster"]
    async fn registers_and_heartbeats() {
        let nodes = vec![
            "localhost:7000".to_string(),
            "localhost:7001".to_string(),
            "localhost:7002".to_string(),
        ];
        let presence = PresenceClient::connect(&nodes, "sfu-test", 3, Duration::from_secs(1))
            .await
            .unwrap();
        presence.register(3, Duration::from_secs(1)).await.unwrap();

        let snapshot = MetricsSnapshot {
            connected_clients: 0,
            active_meetings: 0,
            last_heartbeat: 0,
        };
        presence.publish_heartbeat(&snapshot).await.unwrap();
    }
}

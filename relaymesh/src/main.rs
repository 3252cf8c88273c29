//! relaymesh SFU worker
//!
//! One worker process in a horizontally scaled conferencing fleet. The
//! orchestration service routes meetings here by keying commands with this
//! worker's id; the worker terminates the WebRTC sessions, fans media out
//! between participants and answers over per-session reply topics.

mod config;
mod dispatch;
mod logging;

use anyhow::{Context, Result};
use relaymesh_cluster::{CommandConsumer, PresenceClient, SignalProducer};
use relaymesh_sfu::{SfuWorker, WorkerMetrics, WorkerSettings};
use std::sync::Arc;
use tracing::{info, warn};

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    logging::init(&config)?;

    info!(
        worker_id = %config.worker_id,
        kafka_brokers = ?config.kafka_brokers,
        redis_nodes = ?config.redis_cluster_nodes,
        stun_servers = ?config.stun_servers,
        "relaymesh SFU worker starting"
    );
    if let Some(url) = &config.signaling_url {
        warn!(%url, "legacy signaling endpoint configured; replies are routed over the broker instead");
    }

    let metrics = WorkerMetrics::new();

    // Presence first: a worker that cannot register is invisible to the
    // orchestration service and must not consume commands.
    let presence = PresenceClient::connect(
        &config.redis_cluster_nodes,
        &config.worker_id,
        config.redis_connect_attempts,
        config.redis_connect_delay,
    )
    .await
    .context("Redis cluster connection failed")?;
    presence
        .register(config.register_attempts, config.register_delay)
        .await
        .context("worker registration failed")?;

    let producer = SignalProducer::connect(&config.kafka_brokers, &config.worker_id, metrics.clone())
        .context("Kafka producer setup failed")?;
    let signals = producer.start();

    let worker = Arc::new(SfuWorker::new(
        config.worker_id.clone(),
        WorkerSettings {
            ice_servers: config.stun_servers.clone(),
            max_participants: config.max_participants,
            ..Default::default()
        },
        signals,
        metrics.clone(),
    ));

    let consumer = CommandConsumer::connect(
        &config.kafka_brokers,
        &config.worker_id,
        config.kafka_connect_attempts,
        config.kafka_connect_delay,
    )
    .await
    .context("Kafka consumer setup failed")?;
    let mut commands = consumer.start().context("failed to start partition readers")?;

    Arc::new(presence).spawn_heartbeat_loop(metrics.clone(), config.heartbeat_interval);

    info!(worker_id = %config.worker_id, "worker running, waiting for commands");

    // The dispatcher is the sole writer into the meeting registry; it runs
    // for the lifetime of the process.
    while let Some(message) = commands.recv().await {
        dispatch::dispatch(&worker, &metrics, message).await;
    }

    Err(anyhow::anyhow!("command stream ended unexpectedly"))
}

//! Signal producer
//!
//! Publishes worker-to-client signaling replies. Handlers push
//! [`OutboundSignal`] values onto a bounded channel; a single background
//! task owns the Kafka producer, builds the wire envelope and publishes to
//! the command's reply topic (or the command topic when none was supplied),
//! keyed by the target client id so signaling servers can route by session
//! affinity. Publish failures are logged and counted, never propagated back
//! into the media plane.

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use relaymesh_sfu::{IceCandidate, OutboundSignal, SignalSender, WorkerMetrics};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::commands::COMMAND_TOPIC;
use crate::error::{Error, Result};

/// Signals queued towards the broker. The channel is bounded so a broker
/// outage cannot grow the queue without limit; overflow is dropped with a
/// warning at the sending side.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 1024;

const ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SignalProducer {
    producer: FutureProducer,
    worker_id: String,
    metrics: WorkerMetrics,
}

impl SignalProducer {
    /// Build the producer. Requires full broker acknowledgement, matching
    /// the at-most-one-owner routing the fleet relies on.
    pub fn connect(brokers: &[String], worker_id: &str, metrics: WorkerMetrics) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("acks", "all")
            .set("message.send.max.retries", "5")
            .create()?;

        Ok(Self {
            producer,
            worker_id: worker_id.to_string(),
            metrics,
        })
    }

    /// Spawn the publisher task and hand back the channel the media plane
    /// writes into.
    pub fn start(self) -> SignalSender {
        let (tx, mut rx) = mpsc::channel::<OutboundSignal>(SIGNAL_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                if let Err(e) = self.publish(signal).await {
                    error!(error = %e, "failed to publish signal to client");
                    self.metrics.record_error();
                }
            }
            warn!("signal channel closed, producer task exiting");
        });

        tx
    }

    async fn publish(&self, signal: OutboundSignal) -> Result<()> {
        let topic = signal
            .reply_to
            .as_deref()
            .unwrap_or(COMMAND_TOPIC)
            .to_string();
        let payload = encode_signal(&self.worker_id, &signal)?;

        let record = FutureRecord::to(&topic)
            .key(signal.target.as_str())
            .payload(&payload);
        self.producer
            .send(record, Timeout::After(ACK_TIMEOUT))
            .await
            .map_err(|(e, _)| Error::Kafka(e))?;

        debug!(
            topic = %topic,
            target_client_id = %signal.target,
            signal_type = %signal.kind,
            "signal published"
        );
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignalEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    sender_id: &'a str,
    payload: SignalToClient<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignalToClient<'a> {
    target_client_id: &'a str,
    signal_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sdp: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate: Option<&'a IceCandidate>,
    meeting_id: &'a str,
}

/// Serialize the transport envelope for one outbound signal.
fn encode_signal(worker_id: &str, signal: &OutboundSignal) -> Result<String> {
    let envelope = SignalEnvelope {
        kind: "sfuSignalToClient",
        sender_id: worker_id,
        payload: SignalToClient {
            target_client_id: signal.target.as_str(),
            signal_type: signal.kind.as_str(),
            sdp: signal.sdp.as_deref(),
            candidate: signal.candidate.as_ref(),
            meeting_id: signal.meeting_id.as_str(),
        },
    };
    Ok(serde_json::to_string(&envelope)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaymesh_sfu::{ClientId, MeetingId, SignalKind};

    fn answer_signal() -> OutboundSignal {
        OutboundSignal {
            target: ClientId::from("a"),
            kind: SignalKind::Answer,
            sdp: Some("v=0".to_string()),
            candidate: None,
            meeting_id: MeetingId::from("m1"),
            reply_to: Some("reply.a".to_string()),
        }
    }

    #[test]
    fn envelope_carries_the_contractual_fields() {
        let json = encode_signal("sfu-1", &answer_signal()).unwrap();
        assert!(json.contains("\"type\":\"sfuSignalToClient\""));
        assert!(json.contains("\"senderId\":\"sfu-1\""));
        assert!(json.contains("\"targetClientId\":\"a\""));
        assert!(json.contains("\"signalType\":\"answer\""));
        assert!(json.contains("\"sdp\":\"v=0\""));
        assert!(json.contains("\"meetingId\":\"m1\""));
        assert!(!json.contains("candidate"));
    }

    #[test]
    fn candidate_envelope_keeps_browser_casing() {
        let signal = OutboundSignal {
            kind: SignalKind::Candidate,
            sdp: None,
            candidate: Some(IceCandidate {
                candidate: "candidate:1 1 udp 1 192.0.2.1 1 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }),
            ..answer_signal()
        };
        let json = encode_signal("sfu-1", &signal).unwrap();
        assert!(json.contains("\"signalType\":\"candidate\""));
        assert!(json.contains("\"sdpMLineIndex\":0"));
        assert!(!json.contains("\"sdp\":"));
    }

    /// A round trip through the consumer-side decoder must classify our own
    /// envelopes as echoes.
    #[test]
    fn own_envelopes_are_filtered_by_the_decoder() {
        let json = encode_signal("sfu-1", &answer_signal()).unwrap();
        let decoded = crate::commands::decode("sfu-1", Some("a"), json.as_bytes()).unwrap();
        assert!(decoded.is_none());
    }

    #[tokio::test]
    #[ignore = "Requires Kafka broker"]
    async fn publishes_to_the_reply_topic() {
        let brokers = vec!["localhost:9092".to_string()];
        let producer =
            SignalProducer::connect(&brokers, "sfu-test", WorkerMetrics::new()).unwrap();
        let tx = producer.start();
        tx.send(answer_signal()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

//! Inbound command wire format
//!
//! Commands arrive on the partitioned `sfu_commands` topic as JSON envelopes
//! keyed by worker id. They are parsed once, here, into a tagged variant;
//! downstream handlers never see a raw map.

use relaymesh_sfu::{IceCandidate, SignalKind};
use serde::Deserialize;
use tracing::debug;

use crate::error::Result;

/// The partitioned control topic this worker consumes, and the default
/// destination for replies when a command carries no `replyTo`.
pub const COMMAND_TOPIC: &str = "sfu_commands";

/// A command addressed to an SFU worker.
///
/// The `sfuSignalToClient` variant exists only because replies may share the
/// command topic: it marks the worker's own outbound echoes, which
/// [`decode`] swallows before the key filter runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SfuCommand {
    PrepareMeeting {
        payload: PrepareMeetingPayload,
    },
    ClientJoined {
        payload: ClientPayload,
        #[serde(default, rename = "replyTo")]
        reply_to: Option<String>,
    },
    ClientLeft {
        payload: ClientPayload,
    },
    WebrtcSignal {
        payload: SignalPayload,
        #[serde(default, rename = "replyTo")]
        reply_to: Option<String>,
    },
    SfuSignalToClient {
        #[serde(default)]
        payload: serde_json::Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareMeetingPayload {
    pub meeting_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPayload {
    pub meeting_id: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub meeting_id: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub sender_id: String,
    #[serde(default)]
    pub sdp: Option<String>,
    #[serde(default)]
    pub candidate: Option<IceCandidate>,
}

/// Parse one broker message and decide whether this worker handles it.
///
/// Returns `Ok(None)` for messages that are valid but not ours: the worker's
/// own `sfuSignalToClient` echoes, and anything keyed to a different worker.
/// Malformed payloads, unknown command types and missing required fields
/// surface as `Err` for the dispatcher to log and count.
pub fn decode(worker_id: &str, key: Option<&str>, payload: &[u8]) -> Result<Option<SfuCommand>> {
    let command: SfuCommand = serde_json::from_slice(payload)?;

    if matches!(command, SfuCommand::SfuSignalToClient { .. }) {
        debug!("ignoring own signal echo on command topic");
        return Ok(None);
    }

    if key != Some(worker_id) {
        debug!(
            key = key.unwrap_or("<none>"),
            worker_id, "skipping command keyed to another worker"
        );
        return Ok(None);
    }

    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKER: &str = "sfu-1";

    #[test]
    fn decodes_prepare_meeting() {
        let raw = br#"{"type":"prepareMeeting","payload":{"meetingId":"m1"}}"#;
        let command = decode(WORKER, Some(WORKER), raw).unwrap().unwrap();
        match command {
            SfuCommand::PrepareMeeting { payload } => assert_eq!(payload.meeting_id, "m1"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn decodes_client_joined_with_reply_topic() {
        let raw = br#"{"type":"clientJoined","payload":{"meetingId":"m1","clientId":"a"},"replyTo":"reply.a"}"#;
        let command = decode(WORKER, Some(WORKER), raw).unwrap().unwrap();
        match command {
            SfuCommand::ClientJoined { payload, reply_to } => {
                assert_eq!(payload.meeting_id, "m1");
                assert_eq!(payload.client_id, "a");
                assert_eq!(reply_to.as_deref(), Some("reply.a"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn decodes_offer_signal() {
        let raw = br#"{"type":"webrtcSignal","payload":{"meetingId":"m1","type":"offer","senderId":"a","sdp":"v=0"}}"#;
        let command = decode(WORKER, Some(WORKER), raw).unwrap().unwrap();
        match command {
            SfuCommand::WebrtcSignal { payload, .. } => {
                assert_eq!(payload.kind, SignalKind::Offer);
                assert_eq!(payload.sender_id, "a");
                assert_eq!(payload.sdp.as_deref(), Some("v=0"));
                assert!(payload.candidate.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn decodes_candidate_signal_with_browser_casing() {
        let raw = br#"{"type":"webrtcSignal","payload":{"meetingId":"m1","type":"candidate","senderId":"a","candidate":{"candidate":"candidate:1 1 udp 1 192.0.2.1 1 typ host","sdpMid":"0","sdpMLineIndex":0}}}"#;
        let command = decode(WORKER, Some(WORKER), raw).unwrap().unwrap();
        match command {
            SfuCommand::WebrtcSignal { payload, .. } => {
                let candidate = payload.candidate.unwrap();
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn drops_commands_keyed_to_other_workers() {
        let raw = br#"{"type":"clientJoined","payload":{"meetingId":"m1","clientId":"a"}}"#;
        assert!(decode(WORKER, Some("other-worker"), raw).unwrap().is_none());
        assert!(decode(WORKER, None, raw).unwrap().is_none());
    }

    #[test]
    fn drops_own_signal_echoes_regardless_of_key() {
        let raw = br#"{"type":"sfuSignalToClient","senderId":"sfu-1","payload":{"targetClientId":"a","signalType":"answer","sdp":"v=0","meetingId":"m1"}}"#;
        assert!(decode(WORKER, Some(WORKER), raw).unwrap().is_none());
        assert!(decode(WORKER, Some("a"), raw).unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_command_types() {
        let raw = br#"{"type":"reticulateSplines","payload":{"meetingId":"m1"}}"#;
        assert!(decode(WORKER, Some(WORKER), raw).is_err());
    }

    #[test]
    fn rejects_missing_meeting_id() {
        let raw = br#"{"type":"clientJoined","payload":{"clientId":"a"}}"#;
        assert!(decode(WORKER, Some(WORKER), raw).is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(decode(WORKER, Some(WORKER), b"not json").is_err());
    }
}

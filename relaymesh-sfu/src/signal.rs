//! Outbound signaling values
//!
//! Handlers never talk to the broker directly: they push an
//! [`OutboundSignal`] onto a bounded channel and the signal producer task
//! owns serialization and publishing. `try_send` keeps the media plane from
//! ever blocking on broker backpressure; a full channel is logged and
//! counted as an error, and the signal is dropped.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::warn;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::metrics::WorkerMetrics;
use crate::types::{ClientId, MeetingId};

/// Signal sub-type exchanged with clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICE candidate as it travels on the wire. Field casing follows the browser
/// `RTCIceCandidateInit` dictionary, including the capital `L` in
/// `sdpMLineIndex`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: None,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(c: RTCIceCandidateInit) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
        }
    }
}

/// One worker-to-client signal, addressed by client identity. `reply_to` is
/// the per-session reply topic captured at join time (or carried by the
/// triggering command); the producer falls back to the command topic when it
/// is absent.
#[derive(Debug, Clone)]
pub struct OutboundSignal {
    pub target: ClientId,
    pub kind: SignalKind,
    pub sdp: Option<String>,
    pub candidate: Option<IceCandidate>,
    pub meeting_id: MeetingId,
    pub reply_to: Option<String>,
}

/// Sender half of the worker's outbound signal channel.
pub type SignalSender = mpsc::Sender<OutboundSignal>;

/// Hand a signal to the producer without blocking the caller.
pub fn send_signal(sender: &SignalSender, signal: OutboundSignal, metrics: &WorkerMetrics) {
    if let Err(e) = sender.try_send(signal) {
        warn!(error = %e, "dropping outbound signal, channel unavailable");
        metrics.record_error();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_wire_casing() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_string(&candidate).unwrap();
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert!(json.contains("\"sdpMLineIndex\":0"));

        let parsed: IceCandidate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, candidate);
    }

    #[test]
    fn candidate_optional_fields_are_omitted() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 192.0.2.1 1 typ host".to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
        };
        let json = serde_json::to_string(&candidate).unwrap();
        assert!(!json.contains("sdpMid"));
        assert!(!json.contains("sdpMLineIndex"));
    }

    #[test]
    fn full_channel_counts_an_error() {
        let (tx, _rx) = mpsc::channel(1);
        let metrics = WorkerMetrics::new();
        let signal = OutboundSignal {
            target: ClientId::from("a"),
            kind: SignalKind::Answer,
            sdp: Some("v=0".to_string()),
            candidate: None,
            meeting_id: MeetingId::from("m"),
            reply_to: None,
        };
        send_signal(&tx, signal.clone(), &metrics);
        send_signal(&tx, signal, &metrics);
        assert_eq!(metrics.errors(), 1);
    }
}

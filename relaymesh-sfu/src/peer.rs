//! One client's WebRTC session on this worker
//!
//! Every SDP/ICE operation on the underlying connection goes through the
//! peer's async mutex, so inbound offers serialize against worker-initiated
//! renegotiation. The mutex is never held across a broker call; signals are
//! handed off through the outbound channel instead.
//!
//! ICE candidates that arrive before the remote description are buffered in
//! arrival order and drained exactly once when the offer lands.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::metrics::WorkerMetrics;
use crate::signal::IceCandidate;
use crate::types::{ClientId, MeetingId};

/// What happened to an inbound ICE candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Buffered,
}

pub struct Peer {
    pub id: ClientId,
    pub meeting_id: MeetingId,
    connection: Arc<RTCPeerConnection>,
    ops: tokio::sync::Mutex<()>,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    reply_to: Option<String>,
    metrics: WorkerMetrics,
}

impl Peer {
    pub fn new(
        id: ClientId,
        meeting_id: MeetingId,
        connection: Arc<RTCPeerConnection>,
        reply_to: Option<String>,
        metrics: WorkerMetrics,
    ) -> Self {
        Self {
            id,
            meeting_id,
            connection,
            ops: tokio::sync::Mutex::new(()),
            pending_candidates: Mutex::new(Vec::new()),
            reply_to,
            metrics,
        }
    }

    #[must_use]
    pub fn connection(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.connection)
    }

    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    #[must_use]
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().len()
    }

    /// Apply a client offer and produce the answer SDP. Buffered candidates
    /// are flushed between the remote description landing and the answer
    /// being created. Flush failures are counted only after the peer mutex
    /// drops; the peer mutex and the metrics mutex are never held together.
    pub async fn apply_offer(&self, sdp: String) -> Result<String> {
        let ops = self.ops.lock().await;

        let offer = RTCSessionDescription::offer(sdp).context("invalid offer SDP")?;
        self.connection
            .set_remote_description(offer)
            .await
            .context("failed to set remote description")?;

        let flush_failures = self.flush_pending_candidates().await;
        let result = self.create_and_set_answer().await;

        drop(ops);
        for _ in 0..flush_failures {
            self.metrics.record_error();
        }
        result
    }

    // Caller holds `ops`.
    async fn create_and_set_answer(&self) -> Result<String> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .context("failed to create answer")?;
        let answer_sdp = answer.sdp.clone();
        self.connection
            .set_local_description(answer)
            .await
            .context("failed to set local description")?;
        Ok(answer_sdp)
    }

    /// Apply a client answer to a worker-initiated renegotiation offer.
    pub async fn apply_answer(&self, sdp: String) -> Result<()> {
        let _ops = self.ops.lock().await;

        let answer = RTCSessionDescription::answer(sdp).context("invalid answer SDP")?;
        self.connection
            .set_remote_description(answer)
            .await
            .context("failed to set remote description")?;
        Ok(())
    }

    /// Apply an ICE candidate, or buffer it when the remote description has
    /// not been set yet.
    pub async fn apply_candidate(&self, candidate: IceCandidate) -> Result<CandidateOutcome> {
        let _ops = self.ops.lock().await;

        if self.connection.remote_description().await.is_none() {
            self.pending_candidates.lock().push(candidate);
            return Ok(CandidateOutcome::Buffered);
        }

        self.connection
            .add_ice_candidate(candidate.into())
            .await
            .context("failed to add ICE candidate")?;
        Ok(CandidateOutcome::Applied)
    }

    // Caller holds `ops` and records the returned failure count once the
    // lock has dropped.
    async fn flush_pending_candidates(&self) -> usize {
        let pending: Vec<IceCandidate> = std::mem::take(&mut *self.pending_candidates.lock());
        if pending.is_empty() {
            return 0;
        }
        debug!(
            client_id = %self.id,
            count = pending.len(),
            "applying buffered ICE candidates"
        );
        let mut failures = 0;
        for candidate in pending {
            if let Err(e) = self.connection.add_ice_candidate(candidate.into()).await {
                warn!(client_id = %self.id, error = %e, "failed to apply buffered ICE candidate");
                failures += 1;
            }
        }
        failures
    }

    /// Attach a re-broadcast track to this peer and produce the
    /// renegotiation offer SDP. Adding a track changes the media section
    /// count, so the client cannot receive the new stream until it answers
    /// this offer.
    pub async fn attach_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<String> {
        let _ops = self.ops.lock().await;

        self.connection
            .add_transceiver_from_kind(
                track.kind(),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .context("failed to add transceiver")?;

        self.connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("failed to add track")?;

        let offer = self
            .connection
            .create_offer(None)
            .await
            .context("failed to create renegotiation offer")?;
        let offer_sdp = offer.sdp.clone();
        self.connection
            .set_local_description(offer)
            .await
            .context("failed to set local description")?;

        Ok(offer_sdp)
    }

    pub async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            warn!(client_id = %self.id, error = %e, "error closing peer connection");
            self.metrics.record_error();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::APIBuilder;

    async fn test_peer() -> Peer {
        let pc = APIBuilder::new()
            .build()
            .new_peer_connection(Default::default())
            .await
            .unwrap();
        Peer::new(
            ClientId::from("a"),
            MeetingId::from("m"),
            Arc::new(pc),
            Some("reply.a".to_string()),
            WorkerMetrics::new(),
        )
    }

    fn host_candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:3288244477 1 udp 2130706431 127.0.0.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn candidate_is_buffered_before_remote_description() {
        let peer = test_peer().await;

        let outcome = peer.apply_candidate(host_candidate()).await.unwrap();
        assert_eq!(outcome, CandidateOutcome::Buffered);
        assert_eq!(peer.pending_candidate_count(), 1);
    }

    #[tokio::test]
    async fn offer_drains_the_candidate_buffer() {
        let peer = test_peer().await;
        peer.apply_candidate(host_candidate()).await.unwrap();

        // A second local connection stands in for the browser.
        let client = APIBuilder::new()
            .build()
            .new_peer_connection(Default::default())
            .await
            .unwrap();
        client.create_data_channel("data", None).await.unwrap();
        let offer = client.create_offer(None).await.unwrap();

        let answer = peer.apply_offer(offer.sdp).await.unwrap();
        assert!(!answer.is_empty());
        assert_eq!(peer.pending_candidate_count(), 0);
    }
}

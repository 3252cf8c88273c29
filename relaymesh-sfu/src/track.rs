//! Track fan-out
//!
//! Each remote track a publisher surfaces becomes one re-broadcast
//! [`TrackLocalStaticRTP`] shared by every other peer in the meeting. The
//! local track is the single synchronization point: the publisher's read
//! loop writes into it and the WebRTC stack delivers to every bound sender,
//! with no per-subscriber queue.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::meeting::Meeting;
use crate::metrics::WorkerMetrics;
use crate::peer::Peer;
use crate::signal::{send_signal, OutboundSignal, SignalKind, SignalSender};
use crate::types::TrackId;

/// RTP datagrams never exceed the path MTU.
const RTP_MTU: usize = 1500;

/// Allocate the re-broadcast side of a remote track, carrying codec, track
/// id and stream id over unchanged.
#[must_use]
pub fn local_track_from_remote(remote: &TrackRemote) -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        remote.codec().capability,
        remote.id(),
        remote.stream_id(),
    ))
}

/// Attach `track` to `peer` and push the renegotiation offer to its client.
/// Failures stay local to this peer: they are logged and counted, and the
/// other subscribers proceed.
pub async fn attach_and_renegotiate(
    peer: &Peer,
    track: Arc<TrackLocalStaticRTP>,
    signals: &SignalSender,
    metrics: &WorkerMetrics,
) {
    let offer_sdp = match peer.attach_track(track).await {
        Ok(sdp) => sdp,
        Err(e) => {
            error!(
                meeting_id = %peer.meeting_id,
                client_id = %peer.id,
                error = %e,
                "failed to attach track to peer"
            );
            metrics.record_error();
            return;
        }
    };

    debug!(
        meeting_id = %peer.meeting_id,
        client_id = %peer.id,
        "sending renegotiation offer"
    );
    send_signal(
        signals,
        OutboundSignal {
            target: peer.id.clone(),
            kind: SignalKind::Offer,
            sdp: Some(offer_sdp),
            candidate: None,
            meeting_id: peer.meeting_id.clone(),
            reply_to: peer.reply_to().map(str::to_string),
        },
        metrics,
    );
}

/// Drain RTP from the publisher's remote track into the shared local track
/// until the read side fails. On exit the track is removed from the meeting,
/// terminating the fan-out; the publisher may republish.
pub fn spawn_rtp_forwarder(
    meeting: Arc<Meeting>,
    track_id: TrackId,
    remote: Arc<TrackRemote>,
    local: Arc<TrackLocalStaticRTP>,
    metrics: WorkerMetrics,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RTP_MTU];
        loop {
            let packet = match remote.read(&mut buf).await {
                Ok((packet, _attributes)) => packet,
                Err(e) => {
                    info!(
                        meeting_id = %meeting.id,
                        track_id = %track_id,
                        error = %e,
                        "remote track read ended"
                    );
                    metrics.record_error();
                    break;
                }
            };

            if let Err(e) = local.write_rtp(&packet).await {
                error!(
                    meeting_id = %meeting.id,
                    track_id = %track_id,
                    error = %e,
                    "failed to write to local track"
                );
                metrics.record_error();
                break;
            }
        }

        meeting.remove_track(&track_id);
        debug!(
            meeting_id = %meeting.id,
            track_id = %track_id,
            remaining_tracks = meeting.track_count(),
            "forwarder stopped, track removed"
        );
    })
}

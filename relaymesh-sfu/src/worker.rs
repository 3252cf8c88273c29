//! The per-worker media-plane engine
//!
//! One [`SfuWorker`] per process. It owns the meeting registry and every
//! peer connection it creates, and turns typed commands from the dispatcher
//! into WebRTC state transitions. All outbound signaling flows through the
//! worker's signal channel; the worker never touches the broker itself.
//!
//! Concurrency shape: the dispatcher calls handlers one command at a time
//! (preserving partition order), peer connection setup runs on its own task,
//! and every remote track gets its own RTP forwarding task. The registry
//! mutex and each meeting's locks are never held across I/O.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

use crate::meeting::Meeting;
use crate::metrics::WorkerMetrics;
use crate::peer::Peer;
use crate::signal::{send_signal, IceCandidate, OutboundSignal, SignalKind, SignalSender};
use crate::track;
use crate::types::{ClientId, MeetingId, TrackId};

/// Tunables for the media plane.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// STUN/TURN URLs handed to every peer connection.
    pub ice_servers: Vec<String>,
    /// Participant cap applied per meeting.
    pub max_participants: usize,
    /// Peer lookup retries for signals racing the async peer setup.
    pub lookup_attempts: u32,
    pub lookup_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            max_participants: 10,
            lookup_attempts: 10,
            lookup_delay: Duration::from_millis(100),
        }
    }
}

pub struct SfuWorker {
    id: String,
    settings: WorkerSettings,
    meetings: Mutex<HashMap<MeetingId, Arc<Meeting>>>,
    signals: SignalSender,
    metrics: WorkerMetrics,
}

impl SfuWorker {
    pub fn new(
        id: String,
        settings: WorkerSettings,
        signals: SignalSender,
        metrics: WorkerMetrics,
    ) -> Self {
        Self {
            id,
            settings,
            meetings: Mutex::new(HashMap::new()),
            signals,
            metrics,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn meeting(&self, id: &MeetingId) -> Option<Arc<Meeting>> {
        self.meetings.lock().get(id).cloned()
    }

    #[must_use]
    pub fn meeting_count(&self) -> usize {
        self.meetings.lock().len()
    }

    /// Insert-if-absent under the registry mutex. A meeting exists from the
    /// first command that references it.
    pub fn get_or_create_meeting(&self, id: &MeetingId) -> Arc<Meeting> {
        let mut meetings = self.meetings.lock();
        if let Some(meeting) = meetings.get(id) {
            return Arc::clone(meeting);
        }
        let meeting = Arc::new(Meeting::new(id.clone(), self.settings.max_participants));
        meetings.insert(id.clone(), Arc::clone(&meeting));
        self.metrics.meeting_opened();
        info!(meeting_id = %id, meetings = meetings.len(), "created meeting");
        meeting
    }

    /// `prepareMeeting`: ensure the meeting exists and stamp its metadata.
    /// Re-preparing an existing meeting touches metadata only.
    pub fn prepare_meeting(&self, meeting_id: &MeetingId) {
        let meeting = self.get_or_create_meeting(meeting_id);
        meeting.mark_prepared(self.settings.max_participants);
        info!(
            meeting_id = %meeting.id,
            max_participants = meeting.max_participants(),
            "meeting prepared"
        );
    }

    /// `clientJoined`: schedule peer connection setup. The setup runs on its
    /// own task; a signal arriving before it finishes is absorbed by the
    /// lookup retry in [`Self::handle_signal`].
    pub fn client_joined(
        self: &Arc<Self>,
        meeting_id: &MeetingId,
        client_id: &ClientId,
        reply_to: Option<String>,
    ) {
        let meeting = self.get_or_create_meeting(meeting_id);
        info!(meeting_id = %meeting.id, client_id = %client_id, "client joined");
        tokio::spawn(Arc::clone(self).setup_peer(meeting, client_id.clone(), reply_to));
    }

    /// `clientLeft`: close the peer connection first, then drop the peer.
    /// Leaving twice, or leaving before ever joining, is a no-op.
    pub async fn client_left(&self, meeting_id: &MeetingId, client_id: &ClientId) {
        let meeting = self.get_or_create_meeting(meeting_id);
        match meeting.peer(client_id) {
            Some(peer) => {
                info!(meeting_id = %meeting.id, client_id = %client_id, "client left");
                peer.close().await;
                self.cleanup_peer(&meeting, &peer);
            }
            None => {
                warn!(meeting_id = %meeting.id, client_id = %client_id, "client not found in meeting");
                self.evict_if_empty(&meeting);
            }
        }
    }

    /// `webrtcSignal`: look up the sender's peer (with retry) and dispatch
    /// by sub-type. Errors stay confined to this peer.
    pub async fn handle_signal(
        &self,
        meeting_id: &MeetingId,
        sender_id: &ClientId,
        kind: SignalKind,
        sdp: Option<String>,
        candidate: Option<IceCandidate>,
        reply_to: Option<String>,
    ) {
        let meeting = self.get_or_create_meeting(meeting_id);
        let Some(peer) = self.find_peer_with_retry(&meeting, sender_id).await else {
            error!(
                meeting_id = %meeting.id,
                client_id = %sender_id,
                attempts = self.settings.lookup_attempts,
                "no peer for signal after retries"
            );
            self.metrics.record_error();
            self.evict_if_empty(&meeting);
            return;
        };

        match kind {
            SignalKind::Offer => {
                let Some(sdp) = sdp else {
                    error!(client_id = %sender_id, "offer signal without SDP");
                    self.metrics.record_error();
                    return;
                };
                match peer.apply_offer(sdp).await {
                    Ok(answer_sdp) => {
                        info!(meeting_id = %meeting.id, client_id = %sender_id, "answering offer");
                        send_signal(
                            &self.signals,
                            OutboundSignal {
                                target: sender_id.clone(),
                                kind: SignalKind::Answer,
                                sdp: Some(answer_sdp),
                                candidate: None,
                                meeting_id: meeting.id.clone(),
                                reply_to: reply_to
                                    .or_else(|| peer.reply_to().map(str::to_string)),
                            },
                            &self.metrics,
                        );
                    }
                    Err(e) => {
                        error!(
                            meeting_id = %meeting.id,
                            client_id = %sender_id,
                            error = %e,
                            "failed to handle offer"
                        );
                        self.metrics.record_error();
                    }
                }
            }
            SignalKind::Answer => {
                let Some(sdp) = sdp else {
                    error!(client_id = %sender_id, "answer signal without SDP");
                    self.metrics.record_error();
                    return;
                };
                if let Err(e) = peer.apply_answer(sdp).await {
                    error!(
                        meeting_id = %meeting.id,
                        client_id = %sender_id,
                        error = %e,
                        "failed to apply answer"
                    );
                    self.metrics.record_error();
                }
            }
            SignalKind::Candidate => {
                let Some(candidate) = candidate else {
                    error!(client_id = %sender_id, "candidate signal without candidate");
                    self.metrics.record_error();
                    return;
                };
                match peer.apply_candidate(candidate).await {
                    Ok(outcome) => {
                        debug!(client_id = %sender_id, outcome = ?outcome, "ICE candidate handled");
                    }
                    Err(e) => {
                        error!(client_id = %sender_id, error = %e, "failed to add ICE candidate");
                        self.metrics.record_error();
                    }
                }
            }
        }
    }

    async fn setup_peer(
        self: Arc<Self>,
        meeting: Arc<Meeting>,
        client_id: ClientId,
        reply_to: Option<String>,
    ) {
        if meeting.peer_count() >= meeting.max_participants() {
            warn!(
                meeting_id = %meeting.id,
                client_id = %client_id,
                max_participants = meeting.max_participants(),
                "meeting full, rejecting client"
            );
            self.metrics.record_error();
            return;
        }

        let connection = match self.build_peer_connection().await {
            Ok(pc) => pc,
            Err(e) => {
                error!(
                    meeting_id = %meeting.id,
                    client_id = %client_id,
                    error = %e,
                    "failed to create peer connection"
                );
                self.metrics.record_error();
                return;
            }
        };

        let peer = Arc::new(Peer::new(
            client_id.clone(),
            meeting.id.clone(),
            connection,
            reply_to,
            self.metrics.clone(),
        ));
        self.install_callbacks(&meeting, &peer);

        match meeting.insert_peer(Arc::clone(&peer)) {
            Some(stale) => {
                warn!(
                    meeting_id = %meeting.id,
                    client_id = %client_id,
                    "replacing peer for rejoining client"
                );
                stale.close().await;
            }
            None => self.metrics.client_connected(),
        }
        meeting.mark_active();

        // Late joiners pick up every track already published in the meeting.
        for track in meeting.tracks_snapshot() {
            track::attach_and_renegotiate(&peer, track, &self.signals, &self.metrics).await;
        }

        info!(
            meeting_id = %meeting.id,
            client_id = %client_id,
            clients = meeting.peer_count(),
            tracks = meeting.track_count(),
            "client peer ready"
        );
    }

    fn install_callbacks(self: &Arc<Self>, meeting: &Arc<Meeting>, peer: &Arc<Peer>) {
        let connection = peer.connection();

        // Trickle ICE: forward candidates to the client as they surface.
        {
            let signals = self.signals.clone();
            let metrics = self.metrics.clone();
            let meeting_id = meeting.id.clone();
            let client_id = peer.id.clone();
            let reply_to = peer.reply_to().map(str::to_string);
            connection.on_ice_candidate(Box::new(move |candidate| {
                let signals = signals.clone();
                let metrics = metrics.clone();
                let meeting_id = meeting_id.clone();
                let client_id = client_id.clone();
                let reply_to = reply_to.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        debug!(client_id = %client_id, "ICE candidate gathering complete");
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => send_signal(
                            &signals,
                            OutboundSignal {
                                target: client_id,
                                kind: SignalKind::Candidate,
                                sdp: None,
                                candidate: Some(init.into()),
                                meeting_id,
                                reply_to,
                            },
                            &metrics,
                        ),
                        Err(e) => {
                            error!(client_id = %client_id, error = %e, "failed to serialize ICE candidate");
                            metrics.record_error();
                        }
                    }
                })
            }));
        }

        // Failed or closed connections take their peer down with them. The
        // weak reference keeps the connection from retaining its own peer,
        // and upgrades to nothing once the peer is already gone.
        {
            let worker = Arc::clone(self);
            let meeting = Arc::clone(meeting);
            let weak_peer = Arc::downgrade(peer);
            connection.on_peer_connection_state_change(Box::new(move |state| {
                let worker = Arc::clone(&worker);
                let meeting = Arc::clone(&meeting);
                let weak_peer = weak_peer.clone();
                Box::pin(async move {
                    info!(meeting_id = %meeting.id, state = %state, "peer connection state changed");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        if let Some(peer) = weak_peer.upgrade() {
                            worker.cleanup_peer(&meeting, &peer);
                        }
                    }
                })
            }));
        }

        // Publisher tracks fan out to every other peer in the meeting.
        {
            let worker = Arc::clone(self);
            let meeting = Arc::clone(meeting);
            let publisher = peer.id.clone();
            connection.on_track(Box::new(move |remote, _receiver, _transceiver| {
                let worker = Arc::clone(&worker);
                let meeting = Arc::clone(&meeting);
                let publisher = publisher.clone();
                Box::pin(async move {
                    worker.publish_track(meeting, publisher, remote).await;
                })
            }));
        }
    }

    async fn publish_track(
        &self,
        meeting: Arc<Meeting>,
        publisher: ClientId,
        remote: Arc<TrackRemote>,
    ) {
        let track_id = TrackId::new(remote.id());
        info!(
            meeting_id = %meeting.id,
            client_id = %publisher,
            track_id = %track_id,
            kind = %remote.kind(),
            codec = %remote.codec().capability.mime_type,
            "remote track published"
        );

        let local = track::local_track_from_remote(&remote);
        meeting.insert_track(track_id.clone(), Arc::clone(&local));

        for subscriber in meeting.peers_except(&publisher) {
            track::attach_and_renegotiate(&subscriber, Arc::clone(&local), &self.signals, &self.metrics)
                .await;
        }

        track::spawn_rtp_forwarder(meeting, track_id, remote, local, self.metrics.clone());
    }

    /// Shared removal path for `clientLeft` and failed/closed connections.
    fn cleanup_peer(&self, meeting: &Arc<Meeting>, peer: &Arc<Peer>) {
        if meeting.remove_peer_exact(peer) {
            self.metrics.client_disconnected();
            info!(
                meeting_id = %meeting.id,
                client_id = %peer.id,
                remaining = meeting.peer_count(),
                "peer removed"
            );
        }
        self.evict_if_empty(meeting);
    }

    /// Evict a meeting once its client map empties: wipe the track table
    /// (terminating every forwarder sink), then drop the registry entry.
    fn evict_if_empty(&self, meeting: &Arc<Meeting>) {
        if !meeting.is_empty() {
            return;
        }
        meeting.clear_tracks();
        let mut meetings = self.meetings.lock();
        if meeting.is_empty() && meetings.remove(&meeting.id).is_some() {
            self.metrics.meeting_closed();
            info!(meeting_id = %meeting.id, meetings = meetings.len(), "meeting empty, evicted");
        }
    }

    /// Peer setup is asynchronous, so the first signal of a session can
    /// outrun it; bounded retry absorbs the race.
    async fn find_peer_with_retry(
        &self,
        meeting: &Arc<Meeting>,
        client_id: &ClientId,
    ) -> Option<Arc<Peer>> {
        for attempt in 1..=self.settings.lookup_attempts {
            if let Some(peer) = meeting.peer(client_id) {
                return Some(peer);
            }
            if attempt < self.settings.lookup_attempts {
                debug!(
                    meeting_id = %meeting.id,
                    client_id = %client_id,
                    attempt,
                    "peer not ready, retrying lookup"
                );
                tokio::time::sleep(self.settings.lookup_delay).await;
            }
        }
        None
    }

    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("failed to register codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .context("failed to register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.settings.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .context("failed to create peer connection")?;
        Ok(Arc::new(pc))
    }
}

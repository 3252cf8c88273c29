//! Per-meeting state
//!
//! A meeting owns two maps: `clientId -> Peer` and `trackId -> LocalTrack`.
//! Both sit behind readers-writer locks so fan-out iteration (many readers)
//! does not serialize against joins, leaves and track churn (writers). Locks
//! are held only long enough to snapshot or mutate; all I/O happens outside.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::peer::Peer;
use crate::types::{ClientId, MeetingId, TrackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingStatus {
    Prepared,
    Active,
}

#[derive(Debug, Clone)]
struct MeetingMeta {
    status: MeetingStatus,
    created_at: SystemTime,
    max_participants: usize,
}

pub struct Meeting {
    pub id: MeetingId,
    clients: RwLock<HashMap<ClientId, Arc<Peer>>>,
    tracks: RwLock<HashMap<TrackId, Arc<TrackLocalStaticRTP>>>,
    meta: Mutex<MeetingMeta>,
}

impl Meeting {
    pub fn new(id: MeetingId, max_participants: usize) -> Self {
        Self {
            id,
            clients: RwLock::new(HashMap::new()),
            tracks: RwLock::new(HashMap::new()),
            meta: Mutex::new(MeetingMeta {
                status: MeetingStatus::Prepared,
                created_at: SystemTime::now(),
                max_participants,
            }),
        }
    }

    pub fn mark_prepared(&self, max_participants: usize) {
        let mut meta = self.meta.lock();
        meta.status = MeetingStatus::Prepared;
        meta.max_participants = max_participants;
    }

    pub fn mark_active(&self) {
        self.meta.lock().status = MeetingStatus::Active;
    }

    #[must_use]
    pub fn status(&self) -> MeetingStatus {
        self.meta.lock().status
    }

    #[must_use]
    pub fn max_participants(&self) -> usize {
        self.meta.lock().max_participants
    }

    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        self.meta.lock().created_at
    }

    /// Insert a peer, returning the previous peer for the same client if one
    /// was still registered.
    pub fn insert_peer(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        self.clients.write().insert(peer.id.clone(), peer)
    }

    /// Remove a peer only if the map still holds this exact instance. A
    /// rejoining client replaces its entry, and the stale connection's late
    /// close callback must not take the replacement down with it.
    pub fn remove_peer_exact(&self, peer: &Arc<Peer>) -> bool {
        let mut clients = self.clients.write();
        if clients
            .get(&peer.id)
            .is_some_and(|current| Arc::ptr_eq(current, peer))
        {
            clients.remove(&peer.id);
            return true;
        }
        false
    }

    #[must_use]
    pub fn peer(&self, client_id: &ClientId) -> Option<Arc<Peer>> {
        self.clients.read().get(client_id).cloned()
    }

    /// Snapshot of every peer except `client_id`, taken under the read lock
    /// so attach iteration can proceed outside it.
    #[must_use]
    pub fn peers_except(&self, client_id: &ClientId) -> Vec<Arc<Peer>> {
        self.clients
            .read()
            .values()
            .filter(|p| &p.id != client_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.clients.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Register a re-broadcast track. A duplicate track id silently replaces
    /// the previous entry.
    pub fn insert_track(&self, track_id: TrackId, track: Arc<TrackLocalStaticRTP>) {
        self.tracks.write().insert(track_id, track);
    }

    pub fn remove_track(&self, track_id: &TrackId) -> Option<Arc<TrackLocalStaticRTP>> {
        self.tracks.write().remove(track_id)
    }

    #[must_use]
    pub fn tracks_snapshot(&self) -> Vec<Arc<TrackLocalStaticRTP>> {
        self.tracks.read().values().cloned().collect()
    }

    #[must_use]
    pub fn track_count(&self) -> usize {
        self.tracks.read().len()
    }

    /// Wipe the track table, terminating every forwarder's sink. Called when
    /// the last client leaves.
    pub fn clear_tracks(&self) {
        self.tracks.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    fn test_track(id: &str) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                ..Default::default()
            },
            id.to_string(),
            "stream".to_string(),
        ))
    }

    #[test]
    fn duplicate_track_id_replaces_silently() {
        let meeting = Meeting::new(MeetingId::from("m"), 10);
        let first = test_track("t1");
        let second = test_track("t1");

        meeting.insert_track(TrackId::from("t1"), Arc::clone(&first));
        meeting.insert_track(TrackId::from("t1"), Arc::clone(&second));

        assert_eq!(meeting.track_count(), 1);
        let stored = meeting.tracks_snapshot().pop().unwrap();
        assert!(Arc::ptr_eq(&stored, &second));
    }

    #[test]
    fn clear_tracks_empties_the_table() {
        let meeting = Meeting::new(MeetingId::from("m"), 10);
        meeting.insert_track(TrackId::from("t1"), test_track("t1"));
        meeting.insert_track(TrackId::from("t2"), test_track("t2"));

        meeting.clear_tracks();
        assert_eq!(meeting.track_count(), 0);
    }

    #[test]
    fn prepare_updates_metadata() {
        let meeting = Meeting::new(MeetingId::from("m"), 10);
        assert_eq!(meeting.status(), MeetingStatus::Prepared);

        meeting.mark_active();
        assert_eq!(meeting.status(), MeetingStatus::Active);

        meeting.mark_prepared(25);
        assert_eq!(meeting.status(), MeetingStatus::Prepared);
        assert_eq!(meeting.max_participants(), 25);
    }
}

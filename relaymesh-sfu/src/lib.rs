//! relaymesh media plane
//!
//! The per-worker SFU engine: it terminates WebRTC peer connections, owns
//! the meeting/peer/track state machine and re-broadcasts every publisher's
//! RTP to all other peers in the same meeting, forwarding payloads verbatim.
//!
//! ## Architecture
//!
//! - [`SfuWorker`]: one per process; meeting registry and command handlers
//! - [`Meeting`]: client map and track map behind readers-writer locks
//! - [`Peer`]: one peer connection, serialized SDP/ICE, candidate buffering
//! - [`track`]: fan-out attach, renegotiation, per-track RTP forwarding
//!
//! The crate has no broker knowledge. Outbound signals go through a bounded
//! channel ([`SignalSender`]) owned by the coordination layer, and load is
//! reported through the shared [`WorkerMetrics`] handle.

mod meeting;
mod metrics;
mod peer;
mod signal;
pub mod track;
mod types;
mod worker;

pub use meeting::{Meeting, MeetingStatus};
pub use metrics::{MetricsSnapshot, WorkerMetrics};
pub use peer::{CandidateOutcome, Peer};
pub use signal::{send_signal, IceCandidate, OutboundSignal, SignalKind, SignalSender};
pub use types::{ClientId, MeetingId, TrackId};
pub use worker::{SfuWorker, WorkerSettings};

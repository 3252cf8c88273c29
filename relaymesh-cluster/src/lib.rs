//! relaymesh coordination plane
//!
//! Everything between the media plane and the fleet: the partitioned
//! command consumer, the signal producer for worker-to-client replies, and
//! the Redis presence client that advertises this worker and its load.
//!
//! Commands come in on `sfu_commands` keyed by worker id; replies go out on
//! per-session reply topics keyed by client id; presence lives in the
//! `available_sfus` set, the `sfu:<id>:metrics` hash and the
//! `sfu_heartbeats` channel.

pub mod commands;
mod consumer;
mod error;
pub mod presence;
mod producer;

pub use commands::{decode, SfuCommand, COMMAND_TOPIC};
pub use consumer::{CommandConsumer, CommandMessage};
pub use error::{Error, Result};
pub use presence::PresenceClient;
pub use producer::SignalProducer;

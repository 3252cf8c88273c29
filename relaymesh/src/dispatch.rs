//! Command dispatch
//!
//! The single consumer of the partition fan-in channel. Each raw message is
//! filtered and parsed once, then routed to the matching worker handler.
//! Bad messages are logged, counted and dropped; consumption never stops.

use relaymesh_cluster::{commands, CommandMessage, SfuCommand};
use relaymesh_sfu::{ClientId, MeetingId, SfuWorker, WorkerMetrics};
use std::sync::Arc;
use tracing::warn;

pub async fn dispatch(
    worker: &Arc<SfuWorker>,
    metrics: &WorkerMetrics,
    message: CommandMessage,
) {
    let command = match commands::decode(worker.id(), message.key.as_deref(), &message.payload) {
        Ok(Some(command)) => command,
        Ok(None) => return,
        Err(e) => {
            warn!(
                partition = message.partition,
                error = %e,
                "dropping undecodable command"
            );
            metrics.record_error();
            return;
        }
    };

    match command {
        SfuCommand::PrepareMeeting { payload } => {
            worker.prepare_meeting(&MeetingId::new(payload.meeting_id));
        }
        SfuCommand::ClientJoined { payload, reply_to } => {
            worker.client_joined(
                &MeetingId::new(payload.meeting_id),
                &ClientId::new(payload.client_id),
                reply_to,
            );
        }
        SfuCommand::ClientLeft { payload } => {
            worker
                .client_left(
                    &MeetingId::new(payload.meeting_id),
                    &ClientId::new(payload.client_id),
                )
                .await;
        }
        SfuCommand::WebrtcSignal { payload, reply_to } => {
            worker
                .handle_signal(
                    &MeetingId::new(payload.meeting_id),
                    &ClientId::new(payload.sender_id),
                    payload.kind,
                    payload.sdp,
                    payload.candidate,
                    reply_to,
                )
                .await;
        }
        // Filtered in decode; nothing to do if one slips through.
        SfuCommand::SfuSignalToClient { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaymesh_sfu::WorkerSettings;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_worker(id: &str) -> (Arc<SfuWorker>, WorkerMetrics) {
        let (tx, _rx) = mpsc::channel(16);
        let metrics = WorkerMetrics::new();
        let settings = WorkerSettings {
            ice_servers: Vec::new(),
            lookup_attempts: 1,
            lookup_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let worker = Arc::new(SfuWorker::new(
            id.to_string(),
            settings,
            tx,
            metrics.clone(),
        ));
        (worker, metrics)
    }

    fn message(key: &str, payload: &str) -> CommandMessage {
        CommandMessage {
            key: Some(key.to_string()),
            payload: payload.as_bytes().to_vec(),
            partition: 0,
        }
    }

    #[tokio::test]
    async fn commands_keyed_to_other_workers_change_nothing() {
        let (worker, metrics) = test_worker("sfu-1");
        let raw = r#"{"type":"clientJoined","payload":{"meetingId":"m1","clientId":"a"}}"#;

        dispatch(&worker, &metrics, message("other-worker", raw)).await;

        assert_eq!(worker.meeting_count(), 0);
        assert_eq!(metrics.snapshot().connected_clients, 0);
        assert_eq!(metrics.errors(), 0);
    }

    #[tokio::test]
    async fn malformed_commands_are_counted_and_dropped() {
        let (worker, metrics) = test_worker("sfu-1");

        dispatch(&worker, &metrics, message("sfu-1", "not json")).await;

        assert_eq!(worker.meeting_count(), 0);
        assert_eq!(metrics.errors(), 1);
    }

    #[tokio::test]
    async fn prepare_meeting_reaches_the_worker() {
        let (worker, metrics) = test_worker("sfu-1");
        let raw = r#"{"type":"prepareMeeting","payload":{"meetingId":"m1"}}"#;

        dispatch(&worker, &metrics, message("sfu-1", raw)).await;

        assert_eq!(worker.meeting_count(), 1);
        assert_eq!(metrics.snapshot().active_meetings, 1);
    }
}

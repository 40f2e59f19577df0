//! Forwards committed engine events to WebSocket clients.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use screenflow_core::events::WorkflowEvent;

use crate::metrics::EVENT_BRIDGE_LAGGED_TOTAL;
use crate::presence::Broadcaster;
use crate::wire::WireEvent;

pub struct EventBridge {
    rx: broadcast::Receiver<WorkflowEvent>,
    fanout: Arc<dyn Broadcaster>,
    cancel: CancellationToken,
}

impl EventBridge {
    pub fn new(
        rx: broadcast::Receiver<WorkflowEvent>,
        fanout: Arc<dyn Broadcaster>,
        cancel: CancellationToken,
    ) -> Self {
        Self { rx, fanout, cancel }
    }

    /// Run until the engine drops its sender or `cancel` fires.
    #[tracing::instrument(skip_all, name = "event_bridge")]
    pub async fn run(mut self) {
        loop {
            let received = tokio::select! {
                r = self.rx.recv() => r,
                () = self.cancel.cancelled() => break,
            };
            match received {
                Ok(event) => self.forward(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    metrics::counter!(EVENT_BRIDGE_LAGGED_TOTAL).increment(n);
                    tracing::warn!(lagged = n, "event bridge lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("engine event channel closed");
                    break;
                }
            }
        }
    }

    fn forward(&self, event: &WorkflowEvent) {
        let wire = WireEvent::from(event);
        let session_id = event.session_id();
        let delivered = self.fanout.broadcast(session_id, &wire);
        tracing::debug!(
            event_type = event.event_type(),
            session_id = %session_id,
            delivered,
            "bridged event"
        );
        for participant_id in event.direct_recipients() {
            let _ = self.fanout.send_direct(&participant_id, &wire);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use screenflow_core::identity::{Participant, Role};
    use screenflow_core::ids::{ParticipantId, SessionId};

    #[derive(Default)]
    struct Recorder {
        room: Mutex<Vec<(SessionId, String)>>,
        direct: Mutex<Vec<(ParticipantId, String)>>,
    }

    impl Broadcaster for Recorder {
        fn broadcast(&self, session_id: &SessionId, event: &WireEvent) -> usize {
            self.room.lock().push((session_id.clone(), event.event_type.clone()));
            1
        }
        fn send_direct(&self, participant_id: &ParticipantId, event: &WireEvent) -> usize {
            self.direct
                .lock()
                .push((participant_id.clone(), event.event_type.clone()));
            1
        }
    }

    fn supervisor() -> Participant {
        Participant::new("sup-1", "Abena", Role::Supervisor)
    }

    #[tokio::test]
    async fn forwards_to_room_and_direct_recipients() {
        let (tx, rx) = broadcast::channel(16);
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(EventBridge::new(rx, recorder.clone(), cancel.clone()).run());

        let session = SessionId::from_raw("wfs_1");
        tx.send(WorkflowEvent::UserJoined {
            session_id: session.clone(),
            participant: supervisor(),
        })
        .unwrap();
        tx.send(WorkflowEvent::LockChanged {
            session_id: session.clone(),
            lock: None,
            changed_by: supervisor(),
            displaced_holder: Some(ParticipantId::from_raw("doc-1")),
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let room = recorder.room.lock();
        assert_eq!(
            *room,
            vec![
                (session.clone(), "session_user_joined".to_string()),
                (session, "session_lock_changed".to_string()),
            ]
        );
        let direct = recorder.direct.lock();
        assert_eq!(
            *direct,
            vec![(ParticipantId::from_raw("doc-1"), "session_lock_changed".to_string())]
        );
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let (_tx, rx) = broadcast::channel::<WorkflowEvent>(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            EventBridge::new(rx, Arc::new(Recorder::default()), cancel.clone()).run(),
        );
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn survives_lag() {
        let (tx, rx) = broadcast::channel(1);
        let recorder = Arc::new(Recorder::default());
        let session = SessionId::from_raw("wfs_2");
        for _ in 0..3 {
            tx.send(WorkflowEvent::UserLeft {
                session_id: session.clone(),
                participant: supervisor(),
            })
            .unwrap();
        }
        drop(tx);
        EventBridge::new(rx, recorder.clone(), CancellationToken::new())
            .run()
            .await;
        // Only the newest event survives a capacity-1 channel.
        assert_eq!(recorder.room.lock().len(), 1);
    }
}

//! Connection presence and per-session room fan-out.
//!
//! The registry is a process-local cache keyed by connection id. It is
//! never consulted for workflow decisions. Deliveries use `try_send` only:
//! a slow or gone client loses the message, the sender never waits.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use screenflow_core::identity::Participant;
use screenflow_core::ids::{ConnectionId, ParticipantId, SessionId};

use crate::metrics::{PRESENCE_EVICTIONS_TOTAL, PRESENCE_MESSAGES_DROPPED_TOTAL};
use crate::wire::WireEvent;

pub type Frame = Arc<String>;

/// Fan-out seam. A multi-instance deployment would put a shared pub/sub
/// behind this trait instead of the in-process registry.
pub trait Broadcaster: Send + Sync {
    /// Deliver to every connection in the session's room. Returns the
    /// number of connections that accepted the message.
    fn broadcast(&self, session_id: &SessionId, event: &WireEvent) -> usize;

    /// Deliver to every connection of one participant.
    fn send_direct(&self, participant_id: &ParticipantId, event: &WireEvent) -> usize;
}

struct Connection {
    participant: Participant,
    tx: mpsc::Sender<Frame>,
    joined_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    rooms: Mutex<HashSet<SessionId>>,
    dropped: AtomicU64,
}

impl Connection {
    fn deliver(&self, frame: &Frame) -> bool {
        if self.tx.try_send(frame.clone()).is_ok() {
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(PRESENCE_MESSAGES_DROPPED_TOTAL).increment(1);
            false
        }
    }
}

/// One connection as seen by other room members.
#[derive(Clone, Debug, Serialize)]
pub struct PresenceInfo {
    pub connection_id: ConnectionId,
    pub participant: Participant,
    pub joined_at: DateTime<Utc>,
    pub idle_secs: u64,
}

pub struct PresenceRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    rooms: DashMap<SessionId, HashSet<ConnectionId>>,
    send_buffer: usize,
}

impl PresenceRegistry {
    pub fn new(send_buffer: usize) -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            send_buffer: send_buffer.max(1),
        }
    }

    /// Register a live connection. The receiver feeds its socket writer.
    pub fn connect(&self, participant: Participant) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.send_buffer);
        debug!(connection_id = %id, participant_id = %participant.id, "presence connect");
        let _ = self.connections.insert(
            id.clone(),
            Arc::new(Connection {
                participant,
                tx,
                joined_at: Utc::now(),
                last_activity: Mutex::new(Instant::now()),
                rooms: Mutex::new(HashSet::new()),
                dropped: AtomicU64::new(0),
            }),
        );
        (id, rx)
    }

    /// Remove a connection, leaving all of its rooms. Returns false if it
    /// was already gone.
    pub fn disconnect(&self, id: &ConnectionId) -> bool {
        let Some((_, conn)) = self.connections.remove(id) else {
            return false;
        };
        let rooms: Vec<SessionId> = conn.rooms.lock().drain().collect();
        for session_id in rooms {
            self.remove_from_room(&session_id, id);
            self.announce_leave(&session_id, &conn.participant);
        }
        debug!(connection_id = %id, participant_id = %conn.participant.id, "presence disconnect");
        true
    }

    /// Subscribe a connection to a session room. Returns true if it was
    /// not subscribed before.
    pub fn join_room(&self, id: &ConnectionId, session_id: &SessionId) -> bool {
        let Some(conn) = self.connection(id) else {
            return false;
        };
        if !conn.rooms.lock().insert(session_id.clone()) {
            return false;
        }
        let first_for_participant = !self.participant_in_room(session_id, &conn.participant.id);
        let _ = self
            .rooms
            .entry(session_id.clone())
            .or_default()
            .insert(id.clone());
        self.touch(id);

        if first_for_participant {
            let event = WireEvent::new(
                "session_user_joined",
                Some(session_id.clone()),
                serde_json::json!({ "participant": conn.participant, "presence": true }),
            );
            let _ = self.broadcast(session_id, &event);
        }
        true
    }

    /// Returns true if the connection was subscribed.
    pub fn leave_room(&self, id: &ConnectionId, session_id: &SessionId) -> bool {
        let Some(conn) = self.connection(id) else {
            return false;
        };
        if !conn.rooms.lock().remove(session_id) {
            return false;
        }
        self.remove_from_room(session_id, id);
        self.announce_leave(session_id, &conn.participant);
        true
    }

    /// Record activity on a connection.
    pub fn touch(&self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get(id) {
            *conn.last_activity.lock() = Instant::now();
        }
    }

    /// Send one frame to one connection.
    pub fn send_to(&self, id: &ConnectionId, event: &WireEvent) -> bool {
        let Some(frame) = event.to_frame() else {
            return false;
        };
        self.connection(id).is_some_and(|conn| conn.deliver(&frame))
    }

    /// Disconnect every connection idle for at least `threshold`.
    pub fn sweep_idle(&self, threshold: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let idle: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| now.duration_since(*entry.last_activity.lock()) >= threshold)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &idle {
            if self.disconnect(id) {
                metrics::counter!(PRESENCE_EVICTIONS_TOTAL).increment(1);
                info!(connection_id = %id, "evicted idle connection");
            }
        }
        idle
    }

    pub fn room_participants(&self, session_id: &SessionId) -> Vec<PresenceInfo> {
        let now = Instant::now();
        let mut out: Vec<PresenceInfo> = self
            .room_members(session_id)
            .into_iter()
            .filter_map(|id| {
                let conn = self.connection(&id)?;
                let idle = now.duration_since(*conn.last_activity.lock());
                Some(PresenceInfo {
                    connection_id: id,
                    participant: conn.participant.clone(),
                    joined_at: conn.joined_at,
                    idle_secs: idle.as_secs(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        out
    }

    /// Live connections opened by `participant_id`.
    pub fn connections_of(&self, participant_id: &ParticipantId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| &entry.participant.id == participant_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn owner_of(&self, id: &ConnectionId) -> Option<ParticipantId> {
        self.connection(id).map(|conn| conn.participant.id.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Messages dropped for one connection so far.
    pub fn dropped_for(&self, id: &ConnectionId) -> u64 {
        self.connection(id)
            .map_or(0, |conn| conn.dropped.load(Ordering::Relaxed))
    }

    fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn room_members(&self, session_id: &SessionId) -> Vec<ConnectionId> {
        self.rooms
            .get(session_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn participant_in_room(&self, session_id: &SessionId, participant_id: &ParticipantId) -> bool {
        self.room_members(session_id).iter().any(|id| {
            self.connection(id)
                .is_some_and(|conn| &conn.participant.id == participant_id)
        })
    }

    fn remove_from_room(&self, session_id: &SessionId, id: &ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(session_id) {
            let _ = members.remove(id);
        }
        let _ = self.rooms.remove_if(session_id, |_, members| members.is_empty());
    }

    /// Tell the room a participant left, unless another of their
    /// connections is still subscribed.
    fn announce_leave(&self, session_id: &SessionId, participant: &Participant) {
        if self.participant_in_room(session_id, &participant.id) {
            return;
        }
        let event = WireEvent::new(
            "session_user_left",
            Some(session_id.clone()),
            serde_json::json!({ "participant": participant, "presence": true }),
        );
        let _ = self.broadcast(session_id, &event);
    }
}

impl Broadcaster for PresenceRegistry {
    fn broadcast(&self, session_id: &SessionId, event: &WireEvent) -> usize {
        let Some(frame) = event.to_frame() else {
            return 0;
        };
        self.room_members(session_id)
            .iter()
            .filter_map(|id| self.connection(id))
            .filter(|conn| conn.deliver(&frame))
            .count()
    }

    fn send_direct(&self, participant_id: &ParticipantId, event: &WireEvent) -> usize {
        let Some(frame) = event.to_frame() else {
            return 0;
        };
        self.connections_of(participant_id)
            .iter()
            .filter_map(|id| self.connection(id))
            .filter(|conn| conn.deliver(&frame))
            .count()
    }
}

/// Periodically evict idle connections until `cancel` fires.
pub fn spawn_sweeper(
    registry: Arc<PresenceRegistry>,
    every: Duration,
    idle_after: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = registry.sweep_idle(idle_after);
                    if !evicted.is_empty() {
                        debug!(count = evicted.len(), "presence sweep");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}

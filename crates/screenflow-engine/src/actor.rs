//! Per-session actors.
//!
//! Each session with recent traffic owns one task that drains a bounded
//! mailbox and applies commands one at a time. The task exits after an
//! idle period; the engine spawns a fresh one on the next command.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info_span, warn};

use screenflow_core::activity::{ActivityLogEntry, NewActivity, Origin};
use screenflow_core::diff;
use screenflow_core::events::WorkflowEvent;
use screenflow_core::identity::Participant;
use screenflow_core::ids::SessionId;
use screenflow_core::session::WorkflowSession;
use screenflow_core::WorkflowError;
use screenflow_store::{SessionRepo, StoreError};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::transitions::{self, Mutation, Operation};

pub(crate) type Reply = oneshot::Sender<Result<WorkflowSession, WorkflowError>>;

pub(crate) struct Command {
    pub actor: Participant,
    pub op: Operation,
    pub origin: Origin,
    pub reply: Reply,
}

/// State shared by the engine handle and every actor task.
pub(crate) struct Shared {
    pub sessions: SessionRepo,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
    pub events: broadcast::Sender<WorkflowEvent>,
    pub actors: DashMap<SessionId, mpsc::Sender<Command>>,
}

impl Shared {
    /// Send committed events in order. Having no subscribers is fine.
    pub fn publish(&self, events: impl IntoIterator<Item = WorkflowEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }
}

/// Mailbox of the session's actor, spawning the actor if none is running.
pub(crate) fn mailbox(shared: &Arc<Shared>, session_id: &SessionId) -> mpsc::Sender<Command> {
    if let Some(tx) = shared.actors.get(session_id) {
        if !tx.is_closed() {
            return tx.clone();
        }
    }
    shared
        .actors
        .entry(session_id.clone())
        .and_modify(|tx| {
            if tx.is_closed() {
                *tx = spawn(shared.clone(), session_id.clone());
            }
        })
        .or_insert_with(|| spawn(shared.clone(), session_id.clone()))
        .clone()
}

fn spawn(shared: Arc<Shared>, session_id: SessionId) -> mpsc::Sender<Command> {
    let (tx, rx) = mpsc::channel(shared.config.actor_mailbox);
    debug!(session_id = %session_id, "spawning session actor");
    drop(tokio::spawn(run(shared, session_id, rx)));
    tx
}

async fn run(shared: Arc<Shared>, session_id: SessionId, mut rx: mpsc::Receiver<Command>) {
    loop {
        match tokio::time::timeout(shared.config.actor_idle, rx.recv()).await {
            Ok(Some(cmd)) => handle(&shared, &session_id, cmd),
            Ok(None) => break,
            Err(_) => {
                // Refuse new work, then finish whatever was already queued.
                rx.close();
                while let Some(cmd) = rx.recv().await {
                    handle(&shared, &session_id, cmd);
                }
                break;
            }
        }
    }
    let _ = shared.actors.remove_if(&session_id, |_, tx| tx.is_closed());
    debug!(session_id = %session_id, "session actor stopped");
}

fn handle(shared: &Shared, session_id: &SessionId, cmd: Command) {
    let span = info_span!(
        "mutation",
        session_id = %session_id,
        participant_id = %cmd.actor.id,
        op = cmd.op.name(),
    );
    let result = span.in_scope(|| apply_and_commit(shared, session_id, &cmd.op, &cmd.actor, &cmd.origin));
    if let Err(e) = &result {
        metrics::counter!("workflow_mutation_failures_total", "kind" => e.error_kind()).increment(1);
    }
    // The caller may have given up waiting.
    let _ = cmd.reply.send(result);
}

/// Load, transition, check, commit; retried when another writer committed
/// in between.
fn apply_and_commit(
    shared: &Shared,
    session_id: &SessionId,
    op: &Operation,
    actor: &Participant,
    origin: &Origin,
) -> Result<WorkflowSession, WorkflowError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut session = shared.sessions.get(session_id)?;
        let before = session.audit_view();
        // Keep entry timestamps non-decreasing even if the wall clock steps back.
        let now = shared.clock.now().max(session.updated_at);

        let Some(mutation) = transitions::apply(&mut session, op, actor, now, &shared.config)?
        else {
            return Ok(session.effective(now));
        };

        session.version += 1;
        session.updated_at = now;
        session.check_invariants().map_err(|detail| {
            error!(%detail, "transition broke session invariants");
            WorkflowError::Internal(format!("invariant violated: {detail}"))
        })?;

        let entry = NewActivity {
            session_id: session.session_id.clone(),
            step: mutation.step,
            action: mutation.action,
            actor: actor.clone(),
            timestamp: now,
            changes: diff::diff(&before, &session.audit_view()),
            comment: mutation.comment.clone(),
            origin: origin.clone(),
        };

        match shared.sessions.commit(&session, entry) {
            Ok(logged) => {
                metrics::counter!("workflow_mutations_total", "action" => mutation.action.as_str())
                    .increment(1);
                publish_committed(shared, &session, mutation, logged);
                return Ok(session);
            }
            Err(StoreError::StaleVersion(detail)) if attempt < shared.config.max_commit_attempts => {
                warn!(attempt, %detail, "stale session version, reapplying");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn publish_committed(
    shared: &Shared,
    session: &WorkflowSession,
    mutation: Mutation,
    logged: ActivityLogEntry,
) {
    let head = WorkflowEvent::SessionUpdated {
        session: Box::new(session.clone()),
    };
    let tail = WorkflowEvent::ActivityLogged {
        entry: Box::new(logged),
    };
    shared.publish(std::iter::once(head).chain(mutation.events).chain(std::iter::once(tail)));
}

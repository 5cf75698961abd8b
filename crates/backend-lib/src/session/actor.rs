// ============================
// crates/backend-lib/src/session/actor.rs
// ============================
//! One actor task per session.
//!
//! Every mutation of a session goes through its command channel, so joins,
//! responses and activity changes on one session are applied one at a time
//! while different sessions run in parallel.
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crowdpulse_common::{Activity, ConnectionId, SessionId, SessionInfo};
use metrics::counter;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::ingest::SubmitOutcome;
use super::model::{ConnectionHandle, Session, SessionSnapshot};
use crate::{error::AppError, metrics::PERSIST_FAILED, storage::Storage};

/// Message sent *into* the actor
#[derive(Debug)]
pub enum SessionCommand {
    Join {
        connection: ConnectionHandle,
        reply: oneshot::Sender<SessionInfo>,
    },
    Leave {
        connection_id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    BindPresenter {
        connection: ConnectionHandle,
        reply: oneshot::Sender<SessionInfo>,
    },
    UnbindPresenter {
        connection_id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    StartActivity {
        activity: Value,
        reply: oneshot::Sender<Activity>,
    },
    EndActivity {
        activity_id: String,
        reply: oneshot::Sender<bool>,
    },
    SubmitResponse {
        activity_id: Option<String>,
        participant_id: ConnectionId,
        payload: Value,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    Touch {
        reply: oneshot::Sender<DateTime<Utc>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    End {
        reason: String,
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Handle that other components keep: command channel plus the
/// session's immutable attributes
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub code: String,
    pub presentation_id: String,
    pub created_at: DateTime<Utc>,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    last_active: Arc<AtomicI64>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, AppError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(build(reply))?;
        Ok(rx.await?)
    }

    /// Whether the actor has stopped
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Last activity, in unix milliseconds
    pub fn last_active_ms(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }

    /// Time since the last join, response, heartbeat or activity change
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let idle_ms = now.timestamp_millis().saturating_sub(self.last_active_ms());
        Duration::from_millis(u64::try_from(idle_ms).unwrap_or(0))
    }

    pub async fn join(&self, connection: ConnectionHandle) -> Result<SessionInfo, AppError> {
        self.request(|reply| SessionCommand::Join { connection, reply })
            .await
    }

    pub async fn leave(&self, connection_id: &str) -> Result<bool, AppError> {
        let connection_id = connection_id.to_string();
        self.request(|reply| SessionCommand::Leave {
            connection_id,
            reply,
        })
        .await
    }

    pub async fn bind_presenter(
        &self,
        connection: ConnectionHandle,
    ) -> Result<SessionInfo, AppError> {
        self.request(|reply| SessionCommand::BindPresenter { connection, reply })
            .await
    }

    pub async fn unbind_presenter(&self, connection_id: &str) -> Result<bool, AppError> {
        let connection_id = connection_id.to_string();
        self.request(|reply| SessionCommand::UnbindPresenter {
            connection_id,
            reply,
        })
        .await
    }

    pub async fn start_activity(&self, activity: Value) -> Result<Activity, AppError> {
        self.request(|reply| SessionCommand::StartActivity { activity, reply })
            .await
    }

    pub async fn end_activity(&self, activity_id: &str) -> Result<bool, AppError> {
        let activity_id = activity_id.to_string();
        self.request(|reply| SessionCommand::EndActivity { activity_id, reply })
            .await
    }

    pub async fn submit_response(
        &self,
        activity_id: Option<String>,
        participant_id: &str,
        payload: Value,
    ) -> Result<SubmitOutcome, AppError> {
        let participant_id = participant_id.to_string();
        self.request(|reply| SessionCommand::SubmitResponse {
            activity_id,
            participant_id,
            payload,
            reply,
        })
        .await
    }

    pub async fn touch(&self) -> Result<DateTime<Utc>, AppError> {
        self.request(|reply| SessionCommand::Touch { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, AppError> {
        self.request(|reply| SessionCommand::Snapshot { reply })
            .await
    }

    /// Stop the actor; every connection receives `session-ended`
    pub async fn end(&self, reason: &str) -> Result<SessionSnapshot, AppError> {
        let reason = reason.to_string();
        self.request(|reply| SessionCommand::End { reason, reply })
            .await
    }
}

/// Work for a session's storage writer, applied in the order sent
#[derive(Debug)]
enum PersistJob {
    Append {
        activity_id: String,
        participant_id: ConnectionId,
        payload: Value,
    },
    Archive,
}

/// Spawn the single writer that owns a session's durable log. Appends and
/// the final archive go through one queue, so nothing is written after the
/// archive has run.
fn spawn_persist_writer(
    session_id: SessionId,
    storage: Arc<dyn Storage>,
) -> mpsc::UnboundedSender<PersistJob> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                PersistJob::Append {
                    activity_id,
                    participant_id,
                    payload,
                } => {
                    if let Err(e) = storage
                        .append_response(&session_id, &activity_id, &payload, &participant_id)
                        .await
                    {
                        counter!(PERSIST_FAILED).increment(1);
                        warn!(%session_id, %activity_id, "failed to persist response: {}", e);
                    }
                },
                PersistJob::Archive => {
                    if let Err(e) = storage.archive_session(&session_id).await {
                        warn!(%session_id, "failed to archive session responses: {}", e);
                    }
                    break;
                },
            }
        }
        debug!(%session_id, "persist writer stopped");
    });
    tx
}

pub struct SessionActor {
    session: Session,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
}

impl SessionActor {
    pub fn new(session: Session, storage: Arc<dyn Storage>) -> Self {
        let persist_tx = spawn_persist_writer(session.id.clone(), storage);
        Self {
            session,
            persist_tx,
        }
    }

    /// Hand the accepted response to the durable store without waiting
    fn persist(&self, activity_id: String, participant_id: String, payload: Value) {
        let job = PersistJob::Append {
            activity_id,
            participant_id,
            payload,
        };
        if self.persist_tx.send(job).is_err() {
            counter!(PERSIST_FAILED).increment(1);
            warn!(session_id = %self.session.id, "persist writer gone, response not stored");
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        debug!(session_id = %self.session.id, "session actor started");

        while let Some(cmd) = rx.recv().await {
            match cmd {
                SessionCommand::Join { connection, reply } => {
                    let _ = reply.send(self.session.join(connection));
                },
                SessionCommand::Leave {
                    connection_id,
                    reply,
                } => {
                    let _ = reply.send(self.session.leave(&connection_id));
                },
                SessionCommand::BindPresenter { connection, reply } => {
                    let _ = reply.send(self.session.bind_presenter(connection));
                },
                SessionCommand::UnbindPresenter {
                    connection_id,
                    reply,
                } => {
                    let _ = reply.send(self.session.unbind_presenter_if_current(&connection_id));
                },
                SessionCommand::StartActivity { activity, reply } => {
                    let _ = reply.send(self.session.start_activity(&activity));
                },
                SessionCommand::EndActivity { activity_id, reply } => {
                    let _ = reply.send(self.session.end_activity(&activity_id));
                },
                SessionCommand::SubmitResponse {
                    activity_id,
                    participant_id,
                    payload,
                    reply,
                } => {
                    let outcome = self.session.submit_response(
                        activity_id.as_deref(),
                        &participant_id,
                        &payload,
                    );
                    if let SubmitOutcome::Accepted(record) = &outcome {
                        self.persist(record.activity_id.clone(), participant_id, payload);
                    }
                    let _ = reply.send(outcome);
                },
                SessionCommand::Touch { reply } => {
                    let _ = reply.send(self.session.touch());
                },
                SessionCommand::Snapshot { reply } => {
                    let _ = reply.send(self.session.snapshot());
                },
                SessionCommand::End { reason, reply } => {
                    // Nothing queued behind this command is applied
                    rx.close();
                    let _ = reply.send(self.session.end(&reason));
                    let _ = self.persist_tx.send(PersistJob::Archive);
                    break;
                },
            }
        }

        info!(session_id = %self.session.id, "session actor stopped");
    }
}

/// Spawn the actor for a freshly created session and return its handle
pub fn spawn_session_actor(session: Session, storage: Arc<dyn Storage>) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        id: session.id.clone(),
        code: session.code.clone(),
        presentation_id: session.presentation_id.clone(),
        created_at: session.created_at,
        cmd_tx,
        last_active: session.activity_clock(),
    };

    let actor = SessionActor::new(session, storage);
    tokio::spawn(async move {
        actor.run(cmd_rx).await;
    });

    handle
}

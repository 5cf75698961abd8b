// ============================
// crates/backend-lib/src/session/model.rs
// ============================
//! Session state owned by a session actor.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crowdpulse_common::{
    Activity, ConnectionId, ResponseRecord, Role, ServerMessage, SessionId, SessionInfo,
    SessionStatus,
};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use uuid::Uuid;

/// One live transport-level link. Identity lives exactly as long as the
/// socket; a reconnect produces a new handle with a new id.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub role: Role,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub remote_addr: Option<IpAddr>,
    tx: mpsc::Sender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn new(
        role: Role,
        display_name: String,
        remote_addr: Option<IpAddr>,
        tx: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            display_name,
            joined_at: Utc::now(),
            remote_addr,
            tx,
        }
    }

    /// Copy of this handle acting under another role/name
    pub fn with_identity(&self, role: Role, display_name: String) -> Self {
        Self {
            role,
            display_name,
            joined_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Queue a message without waiting. Returns false when the message was
    /// not queued (outbound buffer full or connection gone).
    pub fn send(&self, msg: ServerMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(connection_id = %self.id, "outbound buffer full, dropping message");
                false
            },
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Read-only copy of a session, returned by snapshot and end
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub code: String,
    pub presentation_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: SessionStatus,
    pub presenter_id: Option<ConnectionId>,
    pub participant_ids: Vec<ConnectionId>,
    pub participant_count: usize,
    pub active_activity: Option<Activity>,
    pub responses: Vec<ResponseRecord>,
    pub total_responses: u64,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Static attributes supplied at creation
#[derive(Debug, Clone, Default)]
pub struct SessionParams {
    pub presentation_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Authoritative state of one session. Only its actor touches it.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub code: String,
    pub presentation_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub presenter: Option<ConnectionHandle>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub status: SessionStatus,
    pub active_activity: Option<Activity>,
    pub responses: Vec<ResponseRecord>,
    pub participants: HashMap<ConnectionId, ConnectionHandle>,
    /// Always equal to `participants.len()`
    pub participant_count: usize,
    pub viewers: HashMap<ConnectionId, ConnectionHandle>,
    pub total_responses: u64,
    activity_clock: Arc<AtomicI64>,
}

impl Session {
    pub fn new(id: SessionId, code: String, params: SessionParams) -> Self {
        let now = Utc::now();
        Self {
            id,
            code,
            presentation_id: params.presentation_id,
            title: params.title,
            description: params.description,
            presenter: None,
            created_at: now,
            last_active: now,
            status: SessionStatus::Active,
            active_activity: None,
            responses: Vec::new(),
            participants: HashMap::new(),
            participant_count: 0,
            viewers: HashMap::new(),
            total_responses: 0,
            activity_clock: Arc::new(AtomicI64::new(now.timestamp_millis())),
        }
    }

    /// Shared last-active clock, read by the registry sweep without
    /// going through the actor
    pub fn activity_clock(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.activity_clock)
    }

    pub fn touch(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.last_active = now;
        self.activity_clock
            .store(now.timestamp_millis(), Ordering::Relaxed);
        now
    }

    pub(crate) fn sync_participant_count(&mut self) {
        self.participant_count = self.participants.len();
    }

    /// Presenter, participants and viewers
    pub fn connections(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.presenter
            .iter()
            .chain(self.participants.values())
            .chain(self.viewers.values())
    }

    pub fn is_member(&self, connection_id: &str) -> bool {
        self.presenter.as_ref().is_some_and(|p| p.id == connection_id)
            || self.participants.contains_key(connection_id)
            || self.viewers.contains_key(connection_id)
    }

    /// Best-effort fan-out to every live connection; never waits
    pub fn fan_out(&self, msg: &ServerMessage) {
        let mut undelivered = 0usize;
        for connection in self.connections() {
            if !connection.send(msg.clone()) {
                undelivered += 1;
            }
        }
        if undelivered > 0 {
            debug!(session_id = %self.id, undelivered, "broadcast not queued for some connections");
        }
    }

    /// Send to the presenter if one is bound; absence is not an error
    pub fn notify_presenter(&self, msg: ServerMessage) -> bool {
        self.presenter
            .as_ref()
            .is_some_and(|presenter| presenter.send(msg))
    }

    /// Session state as sent to one connection. Only the presenter sees
    /// individual responses of the active activity.
    pub fn info_for(&self, connection_id: &str, role: Role) -> SessionInfo {
        let mut active_activity = self.active_activity.clone();
        if role != Role::Presenter {
            if let Some(activity) = active_activity.as_mut() {
                activity.responses.clear();
            }
        }
        SessionInfo {
            session_id: self.id.clone(),
            code: self.code.clone(),
            presentation_id: self.presentation_id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            status: self.status,
            participant_count: self.participant_count,
            presenter_connected: self.presenter.is_some(),
            active_activity,
            total_responses: self.total_responses,
            connection_id: connection_id.to_string(),
            role,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut participant_ids: Vec<ConnectionId> = self.participants.keys().cloned().collect();
        participant_ids.sort();
        SessionSnapshot {
            id: self.id.clone(),
            code: self.code.clone(),
            presentation_id: self.presentation_id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            status: self.status,
            presenter_id: self.presenter.as_ref().map(|p| p.id.clone()),
            participant_ids,
            participant_count: self.participant_count,
            active_activity: self.active_activity.clone(),
            responses: self.responses.clone(),
            total_responses: self.total_responses,
            created_at: self.created_at,
            last_active: self.last_active,
        }
    }

    /// Mark ended and tell every connection. The actor stops afterwards.
    pub fn end(&mut self, reason: &str) -> SessionSnapshot {
        self.status = SessionStatus::Ended;
        self.fan_out(&ServerMessage::SessionEnded {
            session_id: self.id.clone(),
            reason: reason.to_string(),
        });
        self.snapshot()
    }
}

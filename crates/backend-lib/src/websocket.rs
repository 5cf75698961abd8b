// ==================
// crates/backend-lib/src/websocket.rs
// ==================
//! WebSocket Handler Module
//!
//! One `WebSocketHandler` is created per connection. It owns the connection's
//! identity and the session it is currently in, and turns each inbound
//! command into calls on the session registry and the session actors:
//! - rate limiting per command category
//! - validation before any state is touched
//! - role checks (presenter-only commands, participant-only responses)
//! - presence cleanup on disconnect
//!
//! Replies are returned to the caller; broadcasts reach the connection
//! through the same outbound queue the session actors write to.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use crowdpulse_common::{ClientMessage, Role, ServerMessage};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::rate_limit::RateCategory;
use crate::session::{
    merge_definition, ConnectionHandle, SessionHandle, SessionParams, SubmitOutcome,
    REASON_ENDED_BY_PRESENTER,
};
use crate::validation::{sanitize_display_name, validate_client_message};
use crate::AppState;

/// Config fields a stored activity definition may fill in
const DEFINITION_FIELDS: &[&str] = &["options", "question"];

/// WebSocket handler for processing messages
pub struct WebSocketHandler {
    state: Arc<AppState>,
    connection: ConnectionHandle,
    joined: Option<SessionHandle>,
}

fn success(command: &str) -> ServerMessage {
    ServerMessage::Success {
        command: command.to_string(),
    }
}

impl WebSocketHandler {
    pub fn new(state: Arc<AppState>, connection: ConnectionHandle) -> Self {
        Self {
            state,
            connection,
            joined: None,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection.id
    }

    pub fn role(&self) -> Role {
        self.connection.role
    }

    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.connection.remote_addr
    }

    /// Errors for presenters carry the detailed message
    pub fn error_message(&self, err: &AppError) -> ServerMessage {
        err.to_server_message(self.connection.role == Role::Presenter)
    }

    /// Command budgets, joins included, are per connection. Clients behind
    /// one NAT share only the connection-attempt budget, checked at upgrade.
    fn check_rate(&self, category: RateCategory) -> Result<(), AppError> {
        let now = Instant::now();
        let decision = self
            .state
            .rate_limiter
            .check_at(&self.connection.id, category, now);
        if decision.allowed {
            Ok(())
        } else {
            Err(AppError::RateLimited {
                category: category.as_str(),
                retry_after_ms: decision.retry_after_ms(now),
            })
        }
    }

    fn category_for(msg: &ClientMessage) -> RateCategory {
        match msg {
            ClientMessage::JoinSession { .. } | ClientMessage::RejoinSession { .. } => {
                RateCategory::Join
            },
            ClientMessage::SubmitResponse { .. } => RateCategory::Response,
            _ => RateCategory::Command,
        }
    }

    fn in_session(&self, handle: &SessionHandle) -> bool {
        self.joined.as_ref().is_some_and(|joined| joined.id == handle.id)
    }

    fn require_presenter(&self, handle: &SessionHandle) -> Result<(), AppError> {
        if self.connection.role != Role::Presenter {
            return Err(AppError::InvalidRole(self.connection.role.as_str().to_string()));
        }
        if !self.in_session(handle) {
            return Err(AppError::NotInSession);
        }
        Ok(())
    }

    fn resolve(&self, session_id: Option<&str>, code: Option<&str>) -> Result<SessionHandle, AppError> {
        self.state
            .registry
            .find(session_id, code)
            .ok_or(AppError::SessionNotFound)
    }

    /// Leave the current session before entering another one, so a
    /// connection is in at most one session at a time
    async fn leave_current(&mut self, next: Option<&SessionHandle>) {
        let Some(current) = self.joined.take() else {
            return;
        };
        if next.is_some_and(|next| next.id == current.id) {
            self.joined = Some(current);
            return;
        }
        let result = if self.connection.role == Role::Presenter {
            current.unbind_presenter(&self.connection.id).await
        } else {
            current.leave(&self.connection.id).await
        };
        if let Err(e) = result {
            debug!(connection_id = %self.connection.id, session_id = %current.id, "leave skipped: {}", e);
        }
    }

    /// Process one inbound command. `Ok(None)` means nothing is sent back,
    /// which is how dropped responses stay silent.
    pub async fn handle_message(
        &mut self,
        msg: ClientMessage,
    ) -> Result<Option<ServerMessage>, AppError> {
        self.check_rate(Self::category_for(&msg))?;
        validate_client_message(&msg)?;

        let command = msg.command_name();
        debug!(connection_id = %self.connection.id, command, "handling command");

        match msg {
            ClientMessage::CreateSession {
                presentation_id,
                title,
                description,
                presenter_name,
                code,
            } => {
                let params = SessionParams {
                    presentation_id,
                    title,
                    description,
                };
                self.create_session(params, presenter_name.as_deref(), code.as_deref())
                    .await
                    .map(Some)
            },
            ClientMessage::JoinSession { code, display_name } => self
                .join_session(&code, display_name.as_deref())
                .await
                .map(Some),
            ClientMessage::RejoinSession {
                code,
                is_presenter,
                display_name,
            } => {
                if is_presenter {
                    self.rebind_presenter(&code, display_name.as_deref())
                        .await
                        .map(Some)
                } else {
                    self.join_session(&code, display_name.as_deref())
                        .await
                        .map(Some)
                }
            },
            ClientMessage::StartActivity {
                session_id,
                code,
                activity,
            } => {
                let handle = self.resolve(session_id.as_deref(), code.as_deref())?;
                self.require_presenter(&handle)?;
                let activity = self.with_definition(&handle, activity).await;
                let started = handle.start_activity(activity).await?;
                info!(session_id = %handle.id, activity_id = %started.id, "activity broadcast");
                Ok(Some(success(command)))
            },
            ClientMessage::EndActivity {
                session_id,
                activity_id,
            } => {
                let handle = self.resolve(Some(&session_id), None)?;
                self.require_presenter(&handle)?;
                handle.end_activity(&activity_id).await?;
                Ok(Some(success(command)))
            },
            ClientMessage::SubmitResponse {
                session_id,
                code,
                activity_id,
                payload,
            } => {
                let handle = self.resolve(session_id.as_deref(), code.as_deref())?;
                if self.connection.role != Role::Participant {
                    return Err(AppError::InvalidRole(
                        self.connection.role.as_str().to_string(),
                    ));
                }
                if !self.in_session(&handle) {
                    return Err(AppError::NotInSession);
                }
                match handle
                    .submit_response(activity_id, &self.connection.id, payload)
                    .await?
                {
                    SubmitOutcome::Accepted(_) => Ok(Some(success(command))),
                    SubmitOutcome::Dropped(_) => Ok(None),
                }
            },
            ClientMessage::EndSession { session_id } => {
                let handle = self.resolve(Some(&session_id), None)?;
                self.require_presenter(&handle)?;
                self.state
                    .registry
                    .end(&handle.id, REASON_ENDED_BY_PRESENTER)
                    .await?;
                self.joined = None;
                Ok(Some(success(command)))
            },
            ClientMessage::Heartbeat { session_id, code } => {
                let handle = self.resolve(session_id.as_deref(), code.as_deref())?;
                let timestamp = handle.touch().await?;
                Ok(Some(ServerMessage::HeartbeatAck {
                    session_id: handle.id,
                    timestamp,
                }))
            },
        }
    }

    async fn create_session(
        &mut self,
        params: SessionParams,
        presenter_name: Option<&str>,
        requested_code: Option<&str>,
    ) -> Result<ServerMessage, AppError> {
        let handle = self
            .state
            .registry
            .create_session(params, requested_code)?;

        self.leave_current(Some(&handle)).await;
        let presenter = self
            .connection
            .with_identity(Role::Presenter, sanitize_display_name(presenter_name));
        handle.bind_presenter(presenter.clone()).await?;
        self.connection = presenter;
        self.joined = Some(handle.clone());

        Ok(ServerMessage::SessionCreated {
            session_id: handle.id,
            code: handle.code,
        })
    }

    async fn join_session(
        &mut self,
        code: &str,
        display_name: Option<&str>,
    ) -> Result<ServerMessage, AppError> {
        let handle = self
            .state
            .registry
            .get_by_code(code)
            .ok_or(AppError::SessionNotFound)?;

        // Viewers stay viewers; everyone else joins as a participant
        let role = match self.connection.role {
            Role::Viewer => Role::Viewer,
            _ => Role::Participant,
        };
        self.leave_current(Some(&handle)).await;
        let identity = self
            .connection
            .with_identity(role, sanitize_display_name(display_name));
        let info = handle.join(identity.clone()).await?;
        self.connection = identity;
        self.joined = Some(handle);

        Ok(ServerMessage::SessionInfo(info))
    }

    async fn rebind_presenter(
        &mut self,
        code: &str,
        display_name: Option<&str>,
    ) -> Result<ServerMessage, AppError> {
        let handle = self
            .state
            .registry
            .get_by_code(code)
            .ok_or(AppError::SessionNotFound)?;

        self.leave_current(Some(&handle)).await;
        let presenter = self
            .connection
            .with_identity(Role::Presenter, sanitize_display_name(display_name));
        let info = handle.bind_presenter(presenter.clone()).await?;
        self.connection = presenter;
        self.joined = Some(handle);

        Ok(ServerMessage::SessionInfo(info))
    }

    /// Fill missing config fields from the stored presentation definition.
    /// Lookup failures are logged and the activity goes out as sent.
    async fn with_definition(&self, handle: &SessionHandle, mut activity: Value) -> Value {
        let activity_id = match activity.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return activity,
        };
        let missing = DEFINITION_FIELDS
            .iter()
            .any(|field| activity.get(*field).is_none_or(Value::is_null));
        if !missing {
            return activity;
        }

        match self
            .state
            .storage
            .activity_definition(&handle.presentation_id, &activity_id)
            .await
        {
            Ok(Some(definition)) => merge_definition(&mut activity, &definition),
            Ok(None) => {},
            Err(e) => warn!(
                session_id = %handle.id,
                %activity_id,
                "failed to load activity definition: {}",
                e
            ),
        }
        activity
    }

    /// Join (or rebind as presenter) using the query-string code
    pub async fn auto_join(&mut self, code: &str) -> Result<ServerMessage, AppError> {
        self.check_rate(RateCategory::Join)?;
        let name = self.connection.display_name.clone();
        if self.connection.role == Role::Presenter {
            self.rebind_presenter(code, Some(&name)).await
        } else {
            self.join_session(code, Some(&name)).await
        }
    }

    /// Transport closed: drop presence, or start the presenter grace period
    pub async fn disconnect(&mut self) {
        let Some(handle) = self.joined.take() else {
            return;
        };
        let result = if self.connection.role == Role::Presenter {
            handle.unbind_presenter(&self.connection.id).await
        } else {
            handle.leave(&self.connection.id).await
        };
        match result {
            Ok(_) => debug!(
                connection_id = %self.connection.id,
                session_id = %handle.id,
                "connection left session"
            ),
            Err(e) => debug!(connection_id = %self.connection.id, "disconnect cleanup skipped: {}", e),
        }
    }
}

// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between `CrowdPulse` clients and the server.
//! This module defines the WebSocket protocol messages and supporting types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque session identifier (UUID string)
pub type SessionId = String;

/// Connection identifier; the unit of participant identity
pub type ConnectionId = String;

/// Role a connection plays inside a session
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Presenter,
    #[default]
    Participant,
    Viewer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Presenter => "presenter",
            Role::Participant => "participant",
            Role::Viewer => "viewer",
        }
    }
}

/// Lifecycle state of a session
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Active,
    PresenterDisconnected,
    Ended,
}

/// Declared type of an activity; drives response extraction
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Poll,
    Quiz,
    #[serde(alias = "word-cloud", alias = "word_cloud")]
    Wordcloud,
    #[serde(alias = "q&a", alias = "q-and-a")]
    Qna,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ActivityKind {
    /// Parse a caller-supplied type name, falling back to `Unknown`
    pub fn parse(raw: &str) -> Self {
        serde_json::from_value(Value::String(raw.trim().to_ascii_lowercase()))
            .unwrap_or(ActivityKind::Unknown)
    }
}

/// A type-specific value extracted from a raw response payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ExtractedAnswer {
    /// Poll option index (or a numeric quiz answer)
    Option(u64),
    /// Free text (word cloud entry, quiz answer, question)
    Text(String),
    /// Anything else, passed through unmodified
    Value(Value),
}

impl ExtractedAnswer {
    /// Key used when tallying answers for the presenter aggregate
    pub fn tally_key(&self) -> String {
        match self {
            ExtractedAnswer::Option(index) => index.to_string(),
            ExtractedAnswer::Text(text) => text.trim().to_lowercase(),
            ExtractedAnswer::Value(value) => value.to_string(),
        }
    }
}

/// Entry in an activity's lightweight response accumulator
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccumulatedResponse {
    pub participant_id: ConnectionId,
    pub answer: ExtractedAnswer,
}

/// The activity currently (or previously) broadcast within a session
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_secs: Option<u64>,
    #[serde(default)]
    pub moderated: bool,
    /// The caller-supplied payload, kept verbatim for clients
    #[serde(default)]
    pub config: Value,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub responses: Vec<AccumulatedResponse>,
}

/// One participant's accepted submission against one activity
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub id: String,
    pub session_id: SessionId,
    pub activity_id: String,
    pub participant_id: ConnectionId,
    pub display_name: String,
    pub answer: ExtractedAnswer,
    pub submitted_at: DateTime<Utc>,
}

/// Snapshot sent to a joining or rejoining connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub code: String,
    pub presentation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: SessionStatus,
    pub participant_count: usize,
    pub presenter_connected: bool,
    pub active_activity: Option<Activity>,
    pub total_responses: u64,
    pub connection_id: ConnectionId,
    pub role: Role,
}

/// Running results for the active activity, sent to the presenter
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseAggregate {
    pub session_id: SessionId,
    pub activity_id: String,
    pub total_responses: u64,
    pub responses: Vec<AccumulatedResponse>,
    pub tally: BTreeMap<String, u64>,
}

/// Messages sent from client to server
///
/// Legacy command names are accepted as aliases of the canonical variant.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Create a new session; the sending connection becomes its presenter
    CreateSession {
        presentation_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        presenter_name: Option<String>,
        /// Requested join code; generated when absent
        #[serde(default)]
        code: Option<String>,
    },
    /// Join a session by its join code
    #[serde(alias = "join")]
    JoinSession {
        code: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    /// Re-enter a session after a reconnect
    RejoinSession {
        code: String,
        #[serde(default)]
        is_presenter: bool,
        #[serde(default)]
        display_name: Option<String>,
    },
    /// Broadcast a new active activity, replacing any current one
    #[serde(alias = "activity-start", alias = "broadcast-activity")]
    StartActivity {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        code: Option<String>,
        activity: Value,
    },
    /// End the active activity if its id matches
    EndActivity {
        session_id: String,
        activity_id: String,
    },
    /// Submit a response to the active activity
    #[serde(alias = "submit-answer", alias = "activity-response")]
    SubmitResponse {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        activity_id: Option<String>,
        #[serde(default)]
        payload: Value,
    },
    /// Terminate the session
    EndSession { session_id: String },
    /// Keep the session alive
    #[serde(alias = "ping")]
    Heartbeat {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
}

impl ClientMessage {
    /// Canonical command name, used in acknowledgements and logs
    pub fn command_name(&self) -> &'static str {
        match self {
            ClientMessage::CreateSession { .. } => "create-session",
            ClientMessage::JoinSession { .. } => "join-session",
            ClientMessage::RejoinSession { .. } => "rejoin-session",
            ClientMessage::StartActivity { .. } => "start-activity",
            ClientMessage::EndActivity { .. } => "end-activity",
            ClientMessage::SubmitResponse { .. } => "submit-response",
            ClientMessage::EndSession { .. } => "end-session",
            ClientMessage::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Messages sent from server to client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First message on every connection
    Connected {
        connection_id: ConnectionId,
        role: Role,
    },
    /// Response to successful session creation
    SessionCreated { session_id: SessionId, code: String },
    /// Current session state for a joining connection
    SessionInfo(SessionInfo),
    /// Fanned out to every connection in the session
    ActivityStarted {
        session_id: SessionId,
        activity: Activity,
    },
    /// Fanned out to every connection in the session
    ActivityEnded {
        session_id: SessionId,
        activity_id: String,
        reason: String,
    },
    /// Presenter only
    ParticipantJoined {
        session_id: SessionId,
        connection_id: ConnectionId,
        display_name: String,
        participant_count: usize,
    },
    /// Presenter only
    ParticipantLeft {
        session_id: SessionId,
        connection_id: ConnectionId,
        participant_count: usize,
    },
    /// Presenter only
    ResponseReceived {
        session_id: SessionId,
        response: ResponseRecord,
    },
    /// Presenter only
    ResultsUpdated(ResponseAggregate),
    /// Command accepted
    Success { command: String },
    HeartbeatAck {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },
    /// The session has been terminated
    SessionEnded { session_id: SessionId, reason: String },
    /// Any rejected command
    SessionError { code: String, message: String },
}

// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_ACTIVE: &str = "ws.active";
pub const SESSION_CREATED: &str = "session.created";
pub const SESSION_ENDED: &str = "session.ended";
pub const SESSION_ACTIVE: &str = "session.active";
pub const PARTICIPANT_JOINED: &str = "participant.joined";
pub const ACTIVITY_STARTED: &str = "activity.started";
pub const RESPONSE_ACCEPTED: &str = "response.accepted";
pub const RESPONSE_DROPPED: &str = "response.dropped";
pub const PERSIST_FAILED: &str = "response.persist_failed";
pub const RATE_LIMITED: &str = "rate_limit.rejected";

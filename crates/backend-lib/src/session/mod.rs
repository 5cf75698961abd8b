// ============================
// crates/backend-lib/src/session/mod.rs
// ============================
//! Live session engine: registry, per-session actors, presence, activity
//! broadcast and response ingestion.

pub mod actor;
pub mod broadcast;
pub mod ingest;
pub mod model;
pub mod presence;
pub mod registry;

pub use actor::{spawn_session_actor, SessionCommand, SessionHandle};
pub use broadcast::{merge_definition, normalize_activity};
pub use ingest::{extract_answer, DropReason, SubmitOutcome};
pub use model::{ConnectionHandle, Session, SessionParams, SessionSnapshot};
pub use registry::{ArchivedSession, SessionRegistry, REASON_ENDED_BY_PRESENTER, REASON_IDLE};

// ============================
// crates/backend-lib/src/session/registry.rs
// ============================
//! Process-wide session table, indexed by id and by join code.
//!
//! The index maps have their own short-lived shard locks. Session state
//! itself lives in each session's actor and is never touched here.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crowdpulse_common::SessionId;
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::actor::{spawn_session_actor, SessionHandle};
use super::model::{Session, SessionParams, SessionSnapshot};
use crate::code_gen::CodeGenerator;
use crate::error::AppError;
use crate::metrics::{SESSION_ACTIVE, SESSION_CREATED, SESSION_ENDED};
use crate::storage::Storage;
use crate::validation::validate_session_code;

/// Reservation rounds before giving up on code allocation
const MAX_RESERVE_ROUNDS: usize = 3;

pub const REASON_ENDED_BY_PRESENTER: &str = "ended by presenter";
pub const REASON_IDLE: &str = "idle timeout";

/// Final state of an ended session, kept for the retention window
#[derive(Debug, Clone)]
pub struct ArchivedSession {
    pub snapshot: SessionSnapshot,
    pub reason: String,
    pub archived_at: DateTime<Utc>,
}

pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
    codes: DashMap<String, SessionId>,
    archive: DashMap<SessionId, ArchivedSession>,
    generator: CodeGenerator,
    storage: Arc<dyn Storage>,
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

impl SessionRegistry {
    pub fn new(storage: Arc<dyn Storage>, generator: CodeGenerator) -> Self {
        Self {
            sessions: DashMap::new(),
            codes: DashMap::new(),
            archive: DashMap::new(),
            generator,
            storage,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn record_active(&self) {
        gauge!(SESSION_ACTIVE).set(self.sessions.len() as f64);
    }

    /// Claim `code` for `session_id` if nobody holds it
    fn try_reserve(&self, code: String, session_id: &str) -> bool {
        match self.codes.entry(code) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session_id.to_string());
                true
            },
        }
    }

    fn allocate_code(&self, session_id: &str) -> Result<String, AppError> {
        for _ in 0..MAX_RESERVE_ROUNDS {
            let is_taken = |code: &str| self.codes.contains_key(code);
            let candidate = self
                .generator
                .generate_unique(is_taken)
                .or_else(|| {
                    warn!("random join codes exhausted, using timestamp fallback");
                    self.generator.fallback(is_taken)
                });

            let Some(code) = candidate else {
                break;
            };
            // Another creation may have claimed it since the check
            if self.try_reserve(code.clone(), session_id) {
                return Ok(code);
            }
        }
        Err(AppError::CodeGenerationFailed)
    }

    /// Create a session and spawn its actor. A requested code must be valid
    /// and free; otherwise one is generated.
    pub fn create_session(
        &self,
        params: SessionParams,
        requested_code: Option<&str>,
    ) -> Result<SessionHandle, AppError> {
        let session_id = Uuid::new_v4().to_string();

        let code = match requested_code {
            Some(requested) => {
                let code = validate_session_code(requested)?;
                if !self.try_reserve(code.clone(), &session_id) {
                    return Err(AppError::CodeInUse(code));
                }
                code
            },
            None => self.allocate_code(&session_id)?,
        };

        let session = Session::new(session_id.clone(), code.clone(), params);
        let handle = spawn_session_actor(session, Arc::clone(&self.storage));
        self.sessions.insert(session_id.clone(), handle.clone());

        counter!(SESSION_CREATED).increment(1);
        self.record_active();
        info!(%session_id, %code, "session created");

        Ok(handle)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_closed())
    }

    /// Look up by join code, case-insensitively
    pub fn get_by_code(&self, code: &str) -> Option<SessionHandle> {
        let session_id = self.codes.get(&normalize_code(code))?.value().clone();
        self.get(&session_id)
    }

    /// Resolve by id first, then by code
    pub fn find(&self, session_id: Option<&str>, code: Option<&str>) -> Option<SessionHandle> {
        session_id
            .and_then(|id| self.get(id))
            .or_else(|| code.and_then(|code| self.get_by_code(code)))
    }

    pub async fn touch(&self, session_id: &str) -> Result<DateTime<Utc>, AppError> {
        let handle = self.get(session_id).ok_or(AppError::SessionNotFound)?;
        handle.touch().await
    }

    /// Drop a session from both indexes; its code becomes free
    fn evict(&self, session_id: &str) -> Option<SessionHandle> {
        let (_, handle) = self.sessions.remove(session_id)?;
        self.codes.remove_if(&handle.code, |_, owner| owner == session_id);
        self.record_active();
        Some(handle)
    }

    /// End a session: notify its connections, evict it and keep its
    /// responses in the archive.
    pub async fn end(&self, session_id: &str, reason: &str) -> Result<ArchivedSession, AppError> {
        let handle = self.evict(session_id).ok_or(AppError::SessionNotFound)?;
        let snapshot = handle.end(reason).await?;

        let archived = ArchivedSession {
            snapshot,
            reason: reason.to_string(),
            archived_at: Utc::now(),
        };
        self.archive
            .insert(session_id.to_string(), archived.clone());
        counter!(SESSION_ENDED).increment(1);
        info!(%session_id, %reason, "session ended");

        // The actor's writer archives the stored responses after its last append
        Ok(archived)
    }

    /// Evict every session idle for longer than `max_idle`, whatever its
    /// status. Returns how many were evicted.
    pub async fn sweep(&self, max_idle: Duration) -> usize {
        let now = Utc::now();
        let expired: Vec<(SessionId, bool)> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_closed() || entry.idle_for(now) > max_idle)
            .map(|entry| (entry.key().clone(), entry.is_closed()))
            .collect();

        let mut evicted = 0;
        for (session_id, closed) in expired {
            if closed {
                // Actor already gone, nothing left to notify
                if self.evict(&session_id).is_some() {
                    evicted += 1;
                }
                continue;
            }
            match self.end(&session_id, REASON_IDLE).await {
                Ok(_) => evicted += 1,
                Err(e) => debug!(%session_id, "sweep skipped session: {}", e),
            }
        }

        if evicted > 0 {
            info!(evicted, remaining = self.len(), "session sweep finished");
        }
        evicted
    }

    /// Forget archived sessions older than `retention`
    pub fn purge_archive(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        let before = self.archive.len();
        self.archive.retain(|_, archived| archived.archived_at > cutoff);
        before.saturating_sub(self.archive.len())
    }

    pub fn archived(&self, session_id: &str) -> Option<ArchivedSession> {
        self.archive.get(session_id).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::collections::HashSet;

    fn registry() -> (Arc<SessionRegistry>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let registry = SessionRegistry::new(storage.clone(), CodeGenerator::default());
        (Arc::new(registry), storage)
    }

    fn params() -> SessionParams {
        SessionParams {
            presentation_id: "deck-1".to_string(),
            title: Some("All hands".to_string()),
            description: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let (registry, _) = registry();
        let handle = registry.create_session(params(), None).unwrap();

        assert_eq!(handle.code.len(), 6);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&handle.id).unwrap().code, handle.code);
        assert_eq!(
            registry.get_by_code(&handle.code.to_lowercase()).unwrap().id,
            handle.id
        );

        // Id takes precedence, then code
        assert_eq!(
            registry.find(Some(&handle.id), Some("ZZZZZZ")).unwrap().id,
            handle.id
        );
        assert_eq!(
            registry.find(Some("missing"), Some(&handle.code)).unwrap().id,
            handle.id
        );
        assert!(registry.find(Some("missing"), None).is_none());
        assert!(registry.find(None, None).is_none());
    }

    #[tokio::test]
    async fn test_requested_codes() {
        let (registry, _) = registry();
        let handle = registry.create_session(params(), Some(" team42 ")).unwrap();
        assert_eq!(handle.code, "TEAM42");

        assert!(matches!(
            registry.create_session(params(), Some("TEAM42")),
            Err(AppError::CodeInUse(_))
        ));
        assert!(matches!(
            registry.create_session(params(), Some("O0I1")),
            Err(AppError::InvalidCode(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creations_get_unique_codes() {
        let (registry, _) = registry();

        let mut tasks = Vec::new();
        for _ in 0..1000 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.create_session(params(), None).map(|h| h.code)
            }));
        }

        let mut codes = HashSet::new();
        for task in tasks {
            codes.insert(task.await.unwrap().unwrap());
        }
        assert_eq!(codes.len(), 1000);
        assert_eq!(registry.len(), 1000);
    }

    #[tokio::test]
    async fn test_single_attempt_generator_stays_unique() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = SessionRegistry::new(storage, CodeGenerator::new(4, 1));

        let mut codes = HashSet::new();
        for _ in 0..200 {
            let handle = registry.create_session(params(), None).unwrap();
            assert!(codes.insert(handle.code));
        }
    }

    #[tokio::test]
    async fn test_end_archives_and_frees_code() {
        let (registry, storage) = registry();
        let handle = registry.create_session(params(), Some("ENDME2")).unwrap();

        let archived = registry
            .end(&handle.id, REASON_ENDED_BY_PRESENTER)
            .await
            .unwrap();
        assert_eq!(archived.reason, REASON_ENDED_BY_PRESENTER);
        assert!(registry.get(&handle.id).is_none());
        assert!(registry.get_by_code("ENDME2").is_none());
        assert!(registry.archived(&handle.id).is_some());
        assert!(matches!(
            registry.end(&handle.id, REASON_ENDED_BY_PRESENTER).await,
            Err(AppError::SessionNotFound)
        ));

        // Code can be handed out again
        registry.create_session(params(), Some("ENDME2")).unwrap();

        // Storage archival runs in the background
        for _ in 0..50 {
            if storage.is_archived(&handle.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.purge_archive(Duration::from_secs(3600)), 0);
        assert_eq!(registry.purge_archive(Duration::ZERO), 1);
        assert!(registry.archived(&handle.id).is_none());
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_sessions() {
        let (registry, _) = registry();
        let idle = registry.create_session(params(), Some("SLEEP2")).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = registry.create_session(params(), None).unwrap();

        assert_eq!(registry.sweep(Duration::from_secs(3600)).await, 0);
        assert_eq!(registry.sweep(Duration::from_millis(20)).await, 1);

        assert!(registry.get(&idle.id).is_none());
        assert!(registry.get(&fresh.id).is_some());
        assert!(registry.get_by_code("SLEEP2").is_none());
        assert_eq!(registry.archived(&idle.id).unwrap().reason, REASON_IDLE);

        // The swept code is free again
        registry.create_session(params(), Some("SLEEP2")).unwrap();
    }

    #[tokio::test]
    async fn test_touch_resets_idle_clock() {
        let (registry, _) = registry();
        let handle = registry.create_session(params(), None).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.touch(&handle.id).await.unwrap();

        assert_eq!(registry.sweep(Duration::from_millis(20)).await, 0);
        assert!(matches!(
            registry.touch("missing").await,
            Err(AppError::SessionNotFound)
        ));
    }
}

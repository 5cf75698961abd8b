// ============================
// crates/backend-lib/src/storage.rs
// ============================
//! Storage abstraction with flat-file and in-memory implementations.
//!
//! The live path never awaits these calls; each session actor queues its
//! writes to one writer task and failures are only logged.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::{fs as tokio_fs, io::AsyncWriteExt, sync::Mutex};
use uuid::Uuid;

use crate::error::AppError;

/// A response as held by the durable store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredResponse {
    pub id: String,
    pub session_id: String,
    pub activity_id: String,
    pub participant_id: String,
    pub payload: Value,
    pub stored_at: DateTime<Utc>,
}

impl StoredResponse {
    fn new(session_id: &str, activity_id: &str, payload: &Value, participant_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            activity_id: activity_id.to_string(),
            participant_id: participant_id.to_string(),
            payload: payload.clone(),
            stored_at: Utc::now(),
        }
    }
}

/// Trait for storage backends
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append one response, returning its storage id
    async fn append_response(
        &self,
        session_id: &str,
        activity_id: &str,
        payload: &Value,
        participant_id: &str,
    ) -> Result<String, AppError>;

    /// List a session's responses, optionally filtered by activity
    async fn list_responses(
        &self,
        session_id: &str,
        activity_id: Option<&str>,
    ) -> Result<Vec<StoredResponse>, AppError>;

    /// Archive a session (move from current to finished)
    async fn archive_session(&self, session_id: &str) -> Result<(), AppError>;

    /// Look up the static definition of an activity within a presentation
    async fn activity_definition(
        &self,
        presentation_id: &str,
        activity_id: &str,
    ) -> Result<Option<Value>, AppError>;
}

fn find_activity(presentation: &Value, activity_id: &str) -> Option<Value> {
    presentation
        .get("activities")?
        .as_array()?
        .iter()
        .find(|activity| match activity.get("id") {
            Some(Value::String(id)) => id == activity_id,
            Some(Value::Number(n)) => n.to_string() == activity_id,
            _ => false,
        })
        .cloned()
}

fn parse_log(
    content: &str,
    activity_id: Option<&str>,
    out: &mut Vec<StoredResponse>,
) -> Result<(), AppError> {
    for line in content.lines().filter(|line| !line.trim().is_empty()) {
        let record: StoredResponse = serde_json::from_str(line)?;
        if activity_id.is_none_or(|id| record.activity_id == id) {
            out.push(record);
        }
    }
    Ok(())
}

/// Flat-file implementation of the Storage trait
#[derive(Clone)]
pub struct FlatFileStorage {
    root: PathBuf,
    /// One lock per session log; every read and write of a log holds it
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl FlatFileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("current-sessions"))?;
        fs::create_dir_all(root.join("finished-sessions"))?;
        fs::create_dir_all(root.join("presentations"))?;
        Ok(Self {
            root,
            locks: Arc::new(DashMap::new()),
        })
    }

    fn responses_path(&self, dir: &str, session_id: &str) -> PathBuf {
        self.root.join(dir).join(session_id).join("responses.log")
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }
}

#[async_trait]
impl Storage for FlatFileStorage {
    /// Append a JSON line to `responses.log`.
    async fn append_response(
        &self,
        session_id: &str,
        activity_id: &str,
        payload: &Value,
        participant_id: &str,
    ) -> Result<String, AppError> {
        let record = StoredResponse::new(session_id, activity_id, payload, participant_id);
        let mut json_line = serde_json::to_string(&record)?;
        json_line.push('\n');

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let path = self.responses_path("current-sessions", session_id);
        if let Some(parent) = path.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }

        let mut file = tokio_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        // One write per record, so a line is never split
        file.write_all(json_line.as_bytes()).await?;
        Ok(record.id)
    }

    async fn list_responses(
        &self,
        session_id: &str,
        activity_id: Option<&str>,
    ) -> Result<Vec<StoredResponse>, AppError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        // Archived records first, then anything appended since
        let mut responses = Vec::new();
        for dir in ["finished-sessions", "current-sessions"] {
            let path = self.responses_path(dir, session_id);
            if path.exists() {
                let content = tokio_fs::read_to_string(&path).await?;
                parse_log(&content, activity_id, &mut responses)?;
            }
        }
        Ok(responses)
    }

    async fn archive_session(&self, session_id: &str) -> Result<(), AppError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let src = self.root.join("current-sessions").join(session_id);
        let dst = self.root.join("finished-sessions").join(session_id);
        if !src.exists() {
            return Ok(());
        }
        if !dst.exists() {
            tokio_fs::rename(src, dst).await?;
            return Ok(());
        }

        // Archived before: fold the newer records into the finished log
        let src_log = self.responses_path("current-sessions", session_id);
        if src_log.exists() {
            let content = tokio_fs::read(&src_log).await?;
            let mut file = tokio_fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.responses_path("finished-sessions", session_id))
                .await?;
            file.write_all(&content).await?;
        }
        tokio_fs::remove_dir_all(src).await?;
        Ok(())
    }

    async fn activity_definition(
        &self,
        presentation_id: &str,
        activity_id: &str,
    ) -> Result<Option<Value>, AppError> {
        let path = self
            .root
            .join("presentations")
            .join(format!("{presentation_id}.json"));

        if !path.exists() {
            return Ok(None);
        }

        let content = tokio_fs::read_to_string(&path).await?;
        let presentation: Value = serde_json::from_str(&content)?;
        Ok(find_activity(&presentation, activity_id))
    }
}

/// In-process store, used for `--memory` runs and tests
#[derive(Default)]
pub struct MemoryStorage {
    current: DashMap<String, Vec<StoredResponse>>,
    finished: DashMap<String, Vec<StoredResponse>>,
    presentations: RwLock<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a presentation definition (`{"activities": [...]}`)
    pub fn insert_presentation(&self, presentation_id: &str, definition: Value) {
        self.presentations
            .write()
            .insert(presentation_id.to_string(), definition);
    }

    /// Whether a session has been archived
    pub fn is_archived(&self, session_id: &str) -> bool {
        self.finished.contains_key(session_id)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn append_response(
        &self,
        session_id: &str,
        activity_id: &str,
        payload: &Value,
        participant_id: &str,
    ) -> Result<String, AppError> {
        let record = StoredResponse::new(session_id, activity_id, payload, participant_id);
        let id = record.id.clone();
        self.current
            .entry(session_id.to_string())
            .or_default()
            .push(record);
        Ok(id)
    }

    async fn list_responses(
        &self,
        session_id: &str,
        activity_id: Option<&str>,
    ) -> Result<Vec<StoredResponse>, AppError> {
        let mut responses = Vec::new();
        for source in [&self.finished, &self.current] {
            if let Some(records) = source.get(session_id) {
                responses.extend(
                    records
                        .iter()
                        .filter(|r| activity_id.is_none_or(|id| r.activity_id == id))
                        .cloned(),
                );
            }
        }
        Ok(responses)
    }

    async fn archive_session(&self, session_id: &str) -> Result<(), AppError> {
        let records = self
            .current
            .remove(session_id)
            .map(|(_, records)| records)
            .unwrap_or_default();
        self.finished
            .entry(session_id.to_string())
            .or_default()
            .extend(records);
        Ok(())
    }

    async fn activity_definition(
        &self,
        presentation_id: &str,
        activity_id: &str,
    ) -> Result<Option<Value>, AppError> {
        Ok(self
            .presentations
            .read()
            .get(presentation_id)
            .and_then(|presentation| find_activity(presentation, activity_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_flat_file_append_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FlatFileStorage::new(temp_dir.path()).unwrap();

        let first = storage
            .append_response("s1", "a1", &json!(1), "c1")
            .await
            .unwrap();
        storage
            .append_response("s1", "a2", &json!("hello"), "c2")
            .await
            .unwrap();

        let all = storage.list_responses("s1", None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first);
        assert_eq!(all[0].payload, json!(1));

        let only_a2 = storage.list_responses("s1", Some("a2")).await.unwrap();
        assert_eq!(only_a2.len(), 1);
        assert_eq!(only_a2[0].participant_id, "c2");

        assert!(storage.list_responses("missing", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flat_file_archive_keeps_responses_readable() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FlatFileStorage::new(temp_dir.path()).unwrap();

        storage
            .append_response("s1", "a1", &json!(0), "c1")
            .await
            .unwrap();
        storage.archive_session("s1").await.unwrap();

        assert!(!temp_dir.path().join("current-sessions/s1").exists());
        assert!(temp_dir.path().join("finished-sessions/s1/responses.log").exists());
        assert_eq!(storage.list_responses("s1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_flat_file_activity_definition() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FlatFileStorage::new(temp_dir.path()).unwrap();

        std::fs::write(
            temp_dir.path().join("presentations/deck-1.json"),
            json!({
                "activities": [
                    {"id": "q1", "type": "poll", "options": ["A", "B"]},
                    {"id": 7, "type": "wordcloud"}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let found = storage.activity_definition("deck-1", "q1").await.unwrap().unwrap();
        assert_eq!(found["options"], json!(["A", "B"]));
        assert!(storage.activity_definition("deck-1", "7").await.unwrap().is_some());
        assert!(storage.activity_definition("deck-1", "nope").await.unwrap().is_none());
        assert!(storage.activity_definition("other", "q1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_flat_file_concurrent_appends_stay_line_delimited() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(FlatFileStorage::new(temp_dir.path()).unwrap());

        let mut tasks = Vec::new();
        for i in 0..400 {
            let storage = Arc::clone(&storage);
            tasks.push(tokio::spawn(async move {
                storage
                    .append_response("s1", "a1", &json!({"word": format!("word-{i}")}), &format!("c{i}"))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let responses = storage.list_responses("s1", None).await.unwrap();
        assert_eq!(responses.len(), 400);
        let ids: HashSet<_> = responses.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids.len(), 400);
    }

    #[tokio::test]
    async fn test_flat_file_late_append_after_archive_is_kept() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FlatFileStorage::new(temp_dir.path()).unwrap();

        storage.append_response("s1", "a1", &json!(0), "c1").await.unwrap();
        storage.archive_session("s1").await.unwrap();
        storage.append_response("s1", "a1", &json!(1), "c2").await.unwrap();

        let responses = storage.list_responses("s1", None).await.unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].participant_id, "c1");
        assert_eq!(responses[1].participant_id, "c2");

        // Archiving again folds the late record into the finished log
        storage.archive_session("s1").await.unwrap();
        assert!(!temp_dir.path().join("current-sessions/s1").exists());
        assert_eq!(storage.list_responses("s1", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_storage_late_append_after_archive_is_kept() {
        let storage = MemoryStorage::new();
        storage.append_response("s1", "a1", &json!(0), "c1").await.unwrap();
        storage.archive_session("s1").await.unwrap();
        storage.append_response("s1", "a1", &json!(1), "c2").await.unwrap();

        assert_eq!(storage.list_responses("s1", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        storage
            .append_response("s1", "a1", &json!({"answer": "B"}), "c1")
            .await
            .unwrap();
        storage.archive_session("s1").await.unwrap();

        assert!(storage.is_archived("s1"));
        let responses = storage.list_responses("s1", Some("a1")).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].payload["answer"], "B");
    }
}

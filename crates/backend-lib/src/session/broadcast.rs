// ============================
// crates/backend-lib/src/session/broadcast.rs
// ============================
//! Activity broadcasting.
//!
//! A session has at most one active activity. Starting a new one ends the
//! previous one first, so every connection observes `activity-ended` then
//! `activity-started`, in commit order.

use chrono::{DateTime, Utc};
use crowdpulse_common::{Activity, ActivityKind, ServerMessage};
use metrics::counter;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::model::Session;
use crate::metrics::ACTIVITY_STARTED;

pub const DEFAULT_ACTIVITY_TITLE: &str = "Untitled Activity";
pub const REASON_REPLACED: &str = "replaced";
pub const REASON_ENDED: &str = "ended";

fn non_empty_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn option_label(option: &Value) -> String {
    match option {
        Value::String(s) => s.clone(),
        Value::Object(obj) => non_empty_str(obj, "text")
            .or_else(|| non_empty_str(obj, "label"))
            .map(str::to_string)
            .unwrap_or_else(|| option.to_string()),
        other => other.to_string(),
    }
}

/// Normalize a caller-supplied activity. Missing id, type and title get
/// defaults; the raw payload is kept as `config`.
pub fn normalize_activity(raw: &Value, started_at: DateTime<Utc>) -> Activity {
    let empty = Map::new();
    let obj = raw.as_object().unwrap_or(&empty);

    let id = match obj.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => format!("activity-{}", Uuid::new_v4()),
    };

    let kind = non_empty_str(obj, "type")
        .map(ActivityKind::parse)
        .unwrap_or_default();

    let title = non_empty_str(obj, "title")
        .unwrap_or(DEFAULT_ACTIVITY_TITLE)
        .to_string();

    let options = obj
        .get("options")
        .and_then(Value::as_array)
        .map(|options| options.iter().map(option_label).collect())
        .unwrap_or_default();

    let time_limit_secs = obj
        .get("timeLimit")
        .or_else(|| obj.get("timeLimitSecs"))
        .and_then(Value::as_u64);

    let moderated = obj
        .get("moderation")
        .or_else(|| obj.get("moderated"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Activity {
        id,
        kind,
        title,
        question: non_empty_str(obj, "question").map(str::to_string),
        options,
        time_limit_secs,
        moderated,
        config: raw.clone(),
        started_at,
        responses: Vec::new(),
    }
}

/// Fill config fields missing from `raw` with those of a stored definition
pub fn merge_definition(raw: &mut Value, definition: &Value) {
    let (Some(target), Some(source)) = (raw.as_object_mut(), definition.as_object()) else {
        return;
    };
    for (key, value) in source {
        target.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

impl Session {
    /// Replace the active activity and broadcast it to every connection
    pub fn start_activity(&mut self, raw: &Value) -> Activity {
        let activity = normalize_activity(raw, Utc::now());

        if let Some(previous) = self.active_activity.take() {
            debug!(session_id = %self.id, activity_id = %previous.id, "replacing active activity");
            self.fan_out(&ServerMessage::ActivityEnded {
                session_id: self.id.clone(),
                activity_id: previous.id,
                reason: REASON_REPLACED.to_string(),
            });
        }

        self.active_activity = Some(activity.clone());
        self.touch();
        counter!(ACTIVITY_STARTED).increment(1);

        info!(
            session_id = %self.id,
            activity_id = %activity.id,
            kind = ?activity.kind,
            "activity started"
        );

        self.fan_out(&ServerMessage::ActivityStarted {
            session_id: self.id.clone(),
            activity: activity.clone(),
        });

        activity
    }

    /// Clear the active activity if its id matches. Anything else is a no-op.
    pub fn end_activity(&mut self, activity_id: &str) -> bool {
        let matches = self
            .active_activity
            .as_ref()
            .is_some_and(|activity| activity.id == activity_id);

        if !matches {
            debug!(session_id = %self.id, %activity_id, "end-activity ignored, not active");
            return false;
        }

        self.active_activity = None;
        self.touch();
        info!(session_id = %self.id, %activity_id, "activity ended");

        self.fan_out(&ServerMessage::ActivityEnded {
            session_id: self.id.clone(),
            activity_id: activity_id.to_string(),
            reason: REASON_ENDED.to_string(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::model::test_support::*;
    use super::*;
    use crowdpulse_common::Role;
    use serde_json::json;

    #[test]
    fn test_normalize_applies_defaults() {
        let activity = normalize_activity(&json!({}), Utc::now());
        assert!(activity.id.starts_with("activity-"));
        assert_eq!(activity.kind, ActivityKind::Unknown);
        assert_eq!(activity.title, DEFAULT_ACTIVITY_TITLE);
        assert!(activity.responses.is_empty());

        // Non-object payloads normalize the same way
        let activity = normalize_activity(&json!(null), Utc::now());
        assert_eq!(activity.title, DEFAULT_ACTIVITY_TITLE);
    }

    #[test]
    fn test_normalize_reads_config() {
        let raw = json!({
            "id": 42,
            "type": "Poll",
            "title": "  Lunch?  ",
            "question": "Where should we eat?",
            "options": ["Tacos", {"text": "Ramen"}, {"label": "Pizza"}, 3],
            "timeLimit": 30,
            "moderation": true
        });
        let activity = normalize_activity(&raw, Utc::now());

        assert_eq!(activity.id, "42");
        assert_eq!(activity.kind, ActivityKind::Poll);
        assert_eq!(activity.title, "Lunch?");
        assert_eq!(activity.question.as_deref(), Some("Where should we eat?"));
        assert_eq!(activity.options, vec!["Tacos", "Ramen", "Pizza", "3"]);
        assert_eq!(activity.time_limit_secs, Some(30));
        assert!(activity.moderated);
        assert_eq!(activity.config, raw);
    }

    #[test]
    fn test_merge_definition_keeps_caller_fields() {
        let mut raw = json!({"id": "q1", "title": "Live title"});
        merge_definition(
            &mut raw,
            &json!({"id": "q1", "title": "Stored title", "type": "poll", "options": ["A", "B"]}),
        );
        assert_eq!(raw["title"], "Live title");
        assert_eq!(raw["type"], "poll");
        assert_eq!(raw["options"], json!(["A", "B"]));
    }

    #[test]
    fn test_start_replaces_previous_with_single_transition() {
        let mut session = session();
        let (presenter, mut presenter_rx) = connection(Role::Presenter, "Host");
        let (ada, mut ada_rx) = connection(Role::Participant, "Ada");
        session.bind_presenter(presenter);
        session.join(ada);
        drain(&mut presenter_rx);

        let first = session.start_activity(&json!({"id": "a", "type": "poll"}));
        let second = session.start_activity(&json!({"id": "b", "type": "quiz"}));

        assert_eq!(session.active_activity.as_ref().unwrap().id, second.id);

        for rx in [&mut presenter_rx, &mut ada_rx] {
            let messages = drain(rx);
            assert_eq!(messages.len(), 3);
            assert!(matches!(
                &messages[0],
                ServerMessage::ActivityStarted { activity, .. } if activity.id == first.id
            ));
            assert!(matches!(
                &messages[1],
                ServerMessage::ActivityEnded { activity_id, reason, .. }
                    if activity_id == "a" && reason == REASON_REPLACED
            ));
            assert!(matches!(
                &messages[2],
                ServerMessage::ActivityStarted { activity, .. } if activity.id == "b"
            ));
        }
    }

    #[test]
    fn test_end_activity_only_when_matching() {
        let mut session = session();
        let (ada, mut ada_rx) = connection(Role::Participant, "Ada");
        session.join(ada);
        session.start_activity(&json!({"id": "a"}));
        drain(&mut ada_rx);

        assert!(!session.end_activity("other"));
        assert!(session.active_activity.is_some());
        assert!(drain(&mut ada_rx).is_empty());

        assert!(session.end_activity("a"));
        assert!(session.active_activity.is_none());
        assert!(!session.end_activity("a"));

        let messages = drain(&mut ada_rx);
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], ServerMessage::ActivityEnded { activity_id, .. } if activity_id == "a"));
    }

    #[test]
    fn test_late_joiner_sees_active_activity() {
        let mut session = session();
        session.start_activity(&json!({"id": "a", "type": "wordcloud", "title": "One word"}));

        let (late, mut late_rx) = connection(Role::Participant, "Late");
        let info = session.join(late);
        let replayed = info.active_activity.expect("active activity replayed");
        assert_eq!(replayed.id, "a");
        assert_eq!(replayed.kind, ActivityKind::Wordcloud);
        // Nothing was broadcast to the late joiner
        assert!(drain(&mut late_rx).is_empty());
    }
}

// ============================
// crates/backend-lib/src/session/ingest.rs
// ============================
//! Response ingestion.
//!
//! Payloads are reduced to a type-specific answer for the active activity.
//! Anything that does not fit is dropped silently: it is logged and counted,
//! never stored and never reported back to the submitter.

use std::collections::BTreeMap;

use chrono::Utc;
use crowdpulse_common::{
    AccumulatedResponse, ActivityKind, ExtractedAnswer, ResponseAggregate, ResponseRecord,
    ServerMessage,
};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::model::Session;
use crate::metrics::{RESPONSE_ACCEPTED, RESPONSE_DROPPED};

/// Why a submission was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoActiveActivity,
    ActivityMismatch,
    NotAParticipant,
    ExtractionFailed,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::NoActiveActivity => "no_active_activity",
            DropReason::ActivityMismatch => "activity_mismatch",
            DropReason::NotAParticipant => "not_a_participant",
            DropReason::ExtractionFailed => "extraction_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Accepted(ResponseRecord),
    Dropped(DropReason),
}

fn field<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let obj = payload.as_object()?;
    keys.iter().find_map(|key| obj.get(*key).filter(|v| !v.is_null()))
}

fn poll_answer(options: &[String], payload: &Value) -> Option<ExtractedAnswer> {
    let index = match payload {
        Value::Number(n) => n.as_u64(),
        Value::Object(_) => {
            field(payload, &["selectedOption", "optionIndex", "option"]).and_then(Value::as_u64)
        },
        _ => None,
    }?;

    // With a known option list the index has to point into it
    if !options.is_empty() && index >= options.len() as u64 {
        return None;
    }
    Some(ExtractedAnswer::Option(index))
}

fn wordcloud_answer(payload: &Value) -> Option<ExtractedAnswer> {
    let text = match payload {
        Value::String(s) => s.as_str(),
        Value::Object(_) => field(payload, &["word", "text", "answer"])?.as_str()?,
        _ => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| ExtractedAnswer::Text(text.to_string()))
}

fn quiz_answer(payload: &Value) -> Option<ExtractedAnswer> {
    let answer = match payload {
        Value::Object(_) => field(payload, &["answer"])?,
        other => other,
    };
    match answer {
        Value::String(s) if !s.trim().is_empty() => Some(ExtractedAnswer::Text(s.trim().to_string())),
        Value::Number(n) => Some(
            n.as_u64()
                .map(ExtractedAnswer::Option)
                .unwrap_or_else(|| ExtractedAnswer::Value(answer.clone())),
        ),
        _ => None,
    }
}

fn qna_answer(payload: &Value) -> ExtractedAnswer {
    match field(payload, &["answer"]) {
        Some(Value::String(s)) => ExtractedAnswer::Text(s.clone()),
        Some(other) => ExtractedAnswer::Value(other.clone()),
        None => match payload {
            Value::String(s) => ExtractedAnswer::Text(s.clone()),
            other => ExtractedAnswer::Value(other.clone()),
        },
    }
}

/// Reduce a raw payload to the answer shape an activity type expects.
/// `None` means the payload is dropped.
pub fn extract_answer(
    kind: ActivityKind,
    options: &[String],
    payload: &Value,
) -> Option<ExtractedAnswer> {
    if payload.is_null() {
        return None;
    }
    match kind {
        ActivityKind::Poll => poll_answer(options, payload),
        ActivityKind::Wordcloud => wordcloud_answer(payload),
        ActivityKind::Quiz => quiz_answer(payload),
        ActivityKind::Qna => Some(qna_answer(payload)),
        ActivityKind::Unknown => Some(ExtractedAnswer::Value(payload.clone())),
    }
}

impl Session {
    fn drop_response(&self, participant_id: &str, reason: DropReason) -> SubmitOutcome {
        counter!(RESPONSE_DROPPED, "reason" => reason.as_str()).increment(1);
        warn!(
            session_id = %self.id,
            %participant_id,
            reason = reason.as_str(),
            "response dropped"
        );
        SubmitOutcome::Dropped(reason)
    }

    /// Validate and record one response. On success the presenter receives
    /// the response and the updated aggregate.
    pub fn submit_response(
        &mut self,
        activity_id: Option<&str>,
        participant_id: &str,
        payload: &Value,
    ) -> SubmitOutcome {
        let Some(participant) = self.participants.get(participant_id) else {
            return self.drop_response(participant_id, DropReason::NotAParticipant);
        };
        let display_name = participant.display_name.clone();

        let Some(activity) = self.active_activity.as_ref() else {
            return self.drop_response(participant_id, DropReason::NoActiveActivity);
        };

        // An absent activity id targets whatever is active
        if let Some(requested) = activity_id.map(str::trim).filter(|id| !id.is_empty()) {
            if requested != activity.id {
                return self.drop_response(participant_id, DropReason::ActivityMismatch);
            }
        }

        let Some(answer) = extract_answer(activity.kind, &activity.options, payload) else {
            return self.drop_response(participant_id, DropReason::ExtractionFailed);
        };

        let record = ResponseRecord {
            id: Uuid::new_v4().to_string(),
            session_id: self.id.clone(),
            activity_id: activity.id.clone(),
            participant_id: participant_id.to_string(),
            display_name,
            answer: answer.clone(),
            submitted_at: Utc::now(),
        };

        if let Some(activity) = self.active_activity.as_mut() {
            activity.responses.push(AccumulatedResponse {
                participant_id: participant_id.to_string(),
                answer,
            });
        }
        self.responses.push(record.clone());
        self.total_responses += 1;
        self.touch();
        counter!(RESPONSE_ACCEPTED).increment(1);

        debug!(
            session_id = %self.id,
            activity_id = %record.activity_id,
            total_responses = self.total_responses,
            "response accepted"
        );

        self.notify_presenter(ServerMessage::ResponseReceived {
            session_id: self.id.clone(),
            response: record.clone(),
        });
        if let Some(aggregate) = self.aggregate() {
            self.notify_presenter(ServerMessage::ResultsUpdated(aggregate));
        }

        SubmitOutcome::Accepted(record)
    }

    /// Accumulator of the active activity plus the session response count
    pub fn aggregate(&self) -> Option<ResponseAggregate> {
        let activity = self.active_activity.as_ref()?;
        let mut tally = BTreeMap::new();
        for response in &activity.responses {
            *tally.entry(response.answer.tally_key()).or_insert(0u64) += 1;
        }
        Some(ResponseAggregate {
            session_id: self.id.clone(),
            activity_id: activity.id.clone(),
            total_responses: self.total_responses,
            responses: activity.responses.clone(),
            tally,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::model::test_support::*;
    use super::*;
    use crowdpulse_common::Role;
    use serde_json::json;

    fn options(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extract_poll() {
        let opts = options(&["A", "B"]);
        assert_eq!(
            extract_answer(ActivityKind::Poll, &opts, &json!(1)),
            Some(ExtractedAnswer::Option(1))
        );
        assert_eq!(
            extract_answer(ActivityKind::Poll, &opts, &json!({"selectedOption": 0})),
            Some(ExtractedAnswer::Option(0))
        );
        assert_eq!(
            extract_answer(ActivityKind::Poll, &opts, &json!({"optionIndex": 1})),
            Some(ExtractedAnswer::Option(1))
        );
        assert_eq!(extract_answer(ActivityKind::Poll, &opts, &json!({"foo": "bar"})), None);
        assert_eq!(extract_answer(ActivityKind::Poll, &opts, &json!("1")), None);
        assert_eq!(extract_answer(ActivityKind::Poll, &opts, &json!(2)), None);
        assert_eq!(extract_answer(ActivityKind::Poll, &opts, &json!(-1)), None);
        // Without options any index is accepted
        assert_eq!(
            extract_answer(ActivityKind::Poll, &[], &json!(9)),
            Some(ExtractedAnswer::Option(9))
        );
    }

    #[test]
    fn test_extract_wordcloud() {
        assert_eq!(
            extract_answer(ActivityKind::Wordcloud, &[], &json!("  rust ")),
            Some(ExtractedAnswer::Text("rust".to_string()))
        );
        assert_eq!(
            extract_answer(ActivityKind::Wordcloud, &[], &json!({"word": "tokio"})),
            Some(ExtractedAnswer::Text("tokio".to_string()))
        );
        assert_eq!(extract_answer(ActivityKind::Wordcloud, &[], &json!("   ")), None);
        assert_eq!(extract_answer(ActivityKind::Wordcloud, &[], &json!({"word": 3})), None);
        assert_eq!(extract_answer(ActivityKind::Wordcloud, &[], &json!(3)), None);
    }

    #[test]
    fn test_extract_quiz() {
        assert_eq!(
            extract_answer(ActivityKind::Quiz, &[], &json!("Paris")),
            Some(ExtractedAnswer::Text("Paris".to_string()))
        );
        assert_eq!(
            extract_answer(ActivityKind::Quiz, &[], &json!(2)),
            Some(ExtractedAnswer::Option(2))
        );
        assert_eq!(
            extract_answer(ActivityKind::Quiz, &[], &json!({"answer": "B"})),
            Some(ExtractedAnswer::Text("B".to_string()))
        );
        assert_eq!(extract_answer(ActivityKind::Quiz, &[], &json!({"guess": "B"})), None);
        assert_eq!(extract_answer(ActivityKind::Quiz, &[], &json!(true)), None);
    }

    #[test]
    fn test_extract_qna_and_unknown() {
        assert_eq!(
            extract_answer(ActivityKind::Qna, &[], &json!({"answer": "Why Rust?"})),
            Some(ExtractedAnswer::Text("Why Rust?".to_string()))
        );
        let raw = json!({"question": "How?", "anonymous": true});
        assert_eq!(
            extract_answer(ActivityKind::Qna, &[], &raw),
            Some(ExtractedAnswer::Value(raw.clone()))
        );
        assert_eq!(
            extract_answer(ActivityKind::Unknown, &[], &raw),
            Some(ExtractedAnswer::Value(raw))
        );
        assert_eq!(extract_answer(ActivityKind::Unknown, &[], &Value::Null), None);
    }

    #[test]
    fn test_poll_scenario_drops_garbage() {
        let mut session = session();
        let (presenter, mut presenter_rx) = connection(Role::Presenter, "Host");
        let (ada, _ada_rx) = connection(Role::Participant, "Ada");
        let (bob, _bob_rx) = connection(Role::Participant, "Bob");
        session.bind_presenter(presenter);
        session.join(ada.clone());
        session.join(bob.clone());
        let activity = session.start_activity(&json!({"id": "p1", "type": "poll", "options": ["A", "B"]}));
        drain(&mut presenter_rx);

        let outcome = session.submit_response(
            Some(activity.id.as_str()),
            &ada.id,
            &json!({"selectedOption": 1}),
        );
        assert!(matches!(outcome, SubmitOutcome::Accepted(_)));

        let messages = drain(&mut presenter_rx);
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            ServerMessage::ResponseReceived { response, .. } => {
                assert_eq!(response.answer, ExtractedAnswer::Option(1));
                assert_eq!(response.display_name, "Ada");
            },
            other => panic!("Expected ResponseReceived, got {other:?}"),
        }
        match &messages[1] {
            ServerMessage::ResultsUpdated(aggregate) => {
                assert_eq!(aggregate.total_responses, 1);
                assert_eq!(aggregate.tally.get("1"), Some(&1));
            },
            other => panic!("Expected ResultsUpdated, got {other:?}"),
        }

        let outcome = session.submit_response(Some(activity.id.as_str()), &bob.id, &json!({"foo": "bar"}));
        assert!(matches!(outcome, SubmitOutcome::Dropped(DropReason::ExtractionFailed)));
        assert_eq!(session.total_responses, 1);
        assert_eq!(session.responses.len(), 1);
        assert!(drain(&mut presenter_rx).is_empty());
    }

    #[test]
    fn test_drops_without_matching_activity() {
        let mut session = session();
        let (ada, _ada_rx) = connection(Role::Participant, "Ada");
        session.join(ada.clone());

        assert!(matches!(
            session.submit_response(None, &ada.id, &json!("hi")),
            SubmitOutcome::Dropped(DropReason::NoActiveActivity)
        ));

        session.start_activity(&json!({"id": "w1", "type": "wordcloud"}));
        assert!(matches!(
            session.submit_response(Some("old"), &ada.id, &json!("hi")),
            SubmitOutcome::Dropped(DropReason::ActivityMismatch)
        ));
        // Absent or blank id targets the active activity
        assert!(matches!(
            session.submit_response(Some(""), &ada.id, &json!("hi")),
            SubmitOutcome::Accepted(_)
        ));
        assert!(matches!(
            session.submit_response(None, &ada.id, &json!("there")),
            SubmitOutcome::Accepted(_)
        ));
        assert_eq!(session.total_responses, 2);
        assert!(session.responses.iter().all(|r| r.activity_id == "w1"));
    }

    #[test]
    fn test_non_participants_cannot_submit() {
        let mut session = session();
        let (viewer, _rx) = connection(Role::Viewer, "Screen");
        session.join(viewer.clone());
        session.start_activity(&json!({"type": "qna"}));

        assert!(matches!(
            session.submit_response(None, &viewer.id, &json!({"answer": "?"})),
            SubmitOutcome::Dropped(DropReason::NotAParticipant)
        ));
        assert!(matches!(
            session.submit_response(None, "stranger", &json!({"answer": "?"})),
            SubmitOutcome::Dropped(DropReason::NotAParticipant)
        ));
        assert_eq!(session.total_responses, 0);
    }

    #[test]
    fn test_wordcloud_tally_folds_case() {
        let mut session = session();
        let (ada, _a) = connection(Role::Participant, "Ada");
        let (bob, _b) = connection(Role::Participant, "Bob");
        session.join(ada.clone());
        session.join(bob.clone());
        session.start_activity(&json!({"type": "wordcloud"}));

        session.submit_response(None, &ada.id, &json!("Rust"));
        session.submit_response(None, &bob.id, &json!({"word": "rust "}));

        let aggregate = session.aggregate().unwrap();
        assert_eq!(aggregate.tally.get("rust"), Some(&2));
        assert_eq!(aggregate.responses.len(), 2);
    }
}

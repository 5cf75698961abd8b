// ============================
// crates/backend-lib/src/session/presence.rs
// ============================
//! Presence tracking: who is connected to a session, and in which role.
//!
//! Joins and leaves are idempotent; a disconnect racing an explicit leave is
//! expected and harmless.

use crowdpulse_common::{Role, ServerMessage, SessionInfo, SessionStatus};
use metrics::counter;
use tracing::{debug, info};

use super::model::{ConnectionHandle, Session};
use crate::metrics::PARTICIPANT_JOINED;

impl Session {
    /// Add a participant (or viewer). Re-adding a member is a no-op.
    /// Returns the session info the joining connection should receive.
    pub fn join(&mut self, connection: ConnectionHandle) -> SessionInfo {
        self.touch();

        let role = connection.role;
        let connection_id = connection.id.clone();

        if role == Role::Viewer {
            self.viewers
                .entry(connection_id.clone())
                .or_insert(connection);
            return self.info_for(&connection_id, role);
        }

        if self.participants.contains_key(&connection_id) {
            debug!(session_id = %self.id, %connection_id, "duplicate join ignored");
            return self.info_for(&connection_id, role);
        }

        // A presenter joining as a participant gives up the presenter slot
        if self
            .presenter
            .as_ref()
            .is_some_and(|presenter| presenter.id == connection_id)
        {
            self.presenter = None;
            self.status = SessionStatus::PresenterDisconnected;
            info!(session_id = %self.id, %connection_id, "presenter rejoined as participant");
        }

        let display_name = connection.display_name.clone();
        self.participants.insert(connection_id.clone(), connection);
        self.sync_participant_count();
        counter!(PARTICIPANT_JOINED).increment(1);

        info!(
            session_id = %self.id,
            %connection_id,
            participant_count = self.participant_count,
            "participant joined"
        );

        self.notify_presenter(ServerMessage::ParticipantJoined {
            session_id: self.id.clone(),
            connection_id: connection_id.clone(),
            display_name,
            participant_count: self.participant_count,
        });

        self.info_for(&connection_id, role)
    }

    /// Remove a participant or viewer; returns whether anything was removed
    pub fn leave(&mut self, connection_id: &str) -> bool {
        if self.viewers.remove(connection_id).is_some() {
            return true;
        }

        if self.participants.remove(connection_id).is_none() {
            return false;
        }

        self.sync_participant_count();
        self.touch();

        info!(
            session_id = %self.id,
            %connection_id,
            participant_count = self.participant_count,
            "participant left"
        );

        self.notify_presenter(ServerMessage::ParticipantLeft {
            session_id: self.id.clone(),
            connection_id: connection_id.to_string(),
            participant_count: self.participant_count,
        });

        true
    }

    /// Set or replace the presenter connection (last writer wins)
    pub fn bind_presenter(&mut self, connection: ConnectionHandle) -> SessionInfo {
        self.touch();

        // A connection holds one role per session
        if self.participants.remove(&connection.id).is_some() {
            self.sync_participant_count();
        }
        self.viewers.remove(&connection.id);

        if self.status == SessionStatus::PresenterDisconnected {
            self.status = SessionStatus::Active;
            info!(session_id = %self.id, "presenter reconnected");
        }

        let connection_id = connection.id.clone();
        self.presenter = Some(connection);
        self.info_for(&connection_id, Role::Presenter)
    }

    /// On disconnect: if this is the current presenter, enter the
    /// presenter-disconnected grace state. The session stays live.
    pub fn unbind_presenter_if_current(&mut self, connection_id: &str) -> bool {
        let is_current = self
            .presenter
            .as_ref()
            .is_some_and(|presenter| presenter.id == connection_id);

        if !is_current {
            return false;
        }

        self.presenter = None;
        self.status = SessionStatus::PresenterDisconnected;
        info!(session_id = %self.id, "presenter disconnected");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::model::test_support::*;
    use super::*;

    fn assert_count_invariant(session: &Session) {
        assert_eq!(session.participant_count, session.participants.len());
    }

    #[test]
    fn test_count_tracks_set_through_duplicates_and_stray_leaves() {
        let mut session = session();
        let (a, _a_rx) = connection(Role::Participant, "A");
        let (b, _b_rx) = connection(Role::Participant, "B");

        session.join(a.clone());
        assert_count_invariant(&session);
        session.join(a.clone());
        assert_count_invariant(&session);
        assert_eq!(session.participant_count, 1);

        session.join(b.clone());
        assert_eq!(session.participant_count, 2);

        assert!(!session.leave("not-a-member"));
        assert_count_invariant(&session);

        assert!(session.leave(&a.id));
        assert!(!session.leave(&a.id));
        assert_count_invariant(&session);
        assert_eq!(session.participant_count, 1);
    }

    #[test]
    fn test_presenter_notified_of_join_and_leave() {
        let mut session = session();
        let (presenter, mut presenter_rx) = connection(Role::Presenter, "Host");
        session.bind_presenter(presenter);

        let (ada, _ada_rx) = connection(Role::Participant, "Ada");
        let info = session.join(ada.clone());
        assert_eq!(info.participant_count, 1);
        assert_eq!(info.connection_id, ada.id);

        // Duplicate join does not notify twice
        session.join(ada.clone());
        session.leave(&ada.id);

        let messages = drain(&mut presenter_rx);
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            ServerMessage::ParticipantJoined {
                display_name,
                participant_count,
                ..
            } => {
                assert_eq!(display_name, "Ada");
                assert_eq!(*participant_count, 1);
            },
            other => panic!("Expected ParticipantJoined, got {other:?}"),
        }
        assert!(matches!(
            messages[1],
            ServerMessage::ParticipantLeft {
                participant_count: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_viewers_are_not_counted() {
        let mut session = session();
        let (viewer, _rx) = connection(Role::Viewer, "Screen");
        let info = session.join(viewer.clone());

        assert_eq!(info.participant_count, 0);
        assert!(session.is_member(&viewer.id));
        assert!(session.leave(&viewer.id));
        assert!(!session.is_member(&viewer.id));
    }

    #[test]
    fn test_presenter_disconnect_and_rebind() {
        let mut session = session();
        let (first, _first_rx) = connection(Role::Presenter, "Host");
        let (ada, _ada_rx) = connection(Role::Participant, "Ada");
        session.bind_presenter(first.clone());
        session.join(ada.clone());

        // A participant disconnecting is not a presenter disconnect
        assert!(!session.unbind_presenter_if_current(&ada.id));
        assert_eq!(session.status, SessionStatus::Active);

        assert!(session.unbind_presenter_if_current(&first.id));
        assert_eq!(session.status, SessionStatus::PresenterDisconnected);
        assert!(session.presenter.is_none());
        assert_eq!(session.participant_count, 1);

        let (second, _second_rx) = connection(Role::Presenter, "Host");
        let info = session.bind_presenter(second.clone());
        assert_eq!(info.status, SessionStatus::Active);
        assert_eq!(info.participant_count, 1);
        assert!(info.presenter_connected);

        // Stale presenter disconnect after a rebind changes nothing
        assert!(!session.unbind_presenter_if_current(&first.id));
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn test_presenter_joining_as_participant_releases_presenter_slot() {
        let mut session = session();
        let (host, _host_rx) = connection(Role::Presenter, "Host");
        session.bind_presenter(host.clone());

        let info = session.join(host.with_identity(Role::Participant, "Host".to_string()));
        assert!(!info.presenter_connected);
        assert_eq!(info.status, SessionStatus::PresenterDisconnected);
        assert_eq!(session.participant_count, 1);

        // Leaving as a participant does not strand a presenter reference
        assert!(session.leave(&host.id));
        assert!(session.presenter.is_none());
        assert!(!session.is_member(&host.id));
        assert_count_invariant(&session);
    }

    #[test]
    fn test_session_info_hides_responses_from_non_presenters() {
        let mut session = session();
        let (ada, _ada_rx) = connection(Role::Participant, "Ada");
        session.join(ada.clone());
        session.start_activity(&serde_json::json!({"type": "wordcloud"}));
        session.submit_response(None, &ada.id, &serde_json::json!("rust"));

        let (bob, _bob_rx) = connection(Role::Participant, "Bob");
        let late = session.join(bob);
        let activity = late.active_activity.unwrap();
        assert!(activity.responses.is_empty());
        assert_eq!(late.total_responses, 1);

        let (viewer, _viewer_rx) = connection(Role::Viewer, "Screen");
        assert!(session.join(viewer).active_activity.unwrap().responses.is_empty());

        let (host, _host_rx) = connection(Role::Presenter, "Host");
        let presenter_info = session.bind_presenter(host);
        assert_eq!(presenter_info.active_activity.unwrap().responses.len(), 1);
    }

    #[test]
    fn test_bind_presenter_removes_participant_membership() {
        let mut session = session();
        let (conn, _rx) = connection(Role::Participant, "Ada");
        session.join(conn.clone());
        assert_eq!(session.participant_count, 1);

        session.bind_presenter(conn.with_identity(Role::Presenter, "Ada".to_string()));
        assert_eq!(session.participant_count, 0);
        assert_count_invariant(&session);
    }
}

//! Call session lifecycle manager.
//!
//! The single place call state changes happen. Every operation validates the
//! acting user, applies the transition through the store's conditional
//! updates, and broadcasts the result to the call's room. A transition the
//! store refuses (wrong current status, or a concurrent actor got there
//! first) surfaces as `InvalidTransition` — a no-op the caller reports as
//! "cannot perform action in current state", never a server fault.
//!
//! ```text
//! initiated -> ringing
//! initiated -> declined*, failed*
//! ringing   -> answered | declined* | rejected* | missed* | ended*
//! answered  -> ended*
//! any-active -> failed*
//! ```
//!
//! Terminal states (`*`) are final.

use chrono::Utc;

use crate::dispatch::{self, DeliveryOutcome};
use crate::error::{Error, Result};
use crate::groups::{call_group, user_group};
use crate::protocol::{PushNotification, ServerMessage};
use crate::session::{CallSession, CallStatus, CallType, ConnectionQuality};
use crate::state::{AppState, GroupEndPolicy};

/// Statuses a call can fail out of.
const ACTIVE_STATUSES: &[CallStatus] = &[
    CallStatus::Initiated,
    CallStatus::Ringing,
    CallStatus::Answered,
];

/// Statuses an answer/decline/reject is valid from.
const UNANSWERED_STATUSES: &[CallStatus] = &[CallStatus::Initiated, CallStatus::Ringing];

/// Statuses a hangup is valid from (caller cancel during ring included).
const ENDABLE_STATUSES: &[CallStatus] = &[CallStatus::Answered, CallStatus::Ringing];

/// Create a call session and invite the callee.
///
/// The session is stored as `initiated`, immediately moved to `ringing`
/// (signaling starts now), and the invitation goes out through the fallback
/// dispatcher — socket if the callee is connected, push otherwise. An
/// unreachable callee is not an error: the ringing sweep will resolve the
/// call as missed.
pub async fn create_call(
    state: &AppState,
    caller_id: &str,
    caller_name: Option<&str>,
    callee_id: &str,
    call_type: CallType,
    extra_participants: &[String],
) -> Result<(CallSession, DeliveryOutcome)> {
    if caller_id.trim().is_empty() {
        return Err(Error::InvalidUser("caller id is empty".to_string()));
    }
    if callee_id.trim().is_empty() {
        return Err(Error::InvalidUser("callee id is empty".to_string()));
    }
    if caller_id == callee_id {
        return Err(Error::InvalidRequest(
            "caller and callee are the same user".to_string(),
        ));
    }

    let caller_name = match caller_name {
        Some(name) if !name.trim().is_empty() => name,
        _ => caller_id,
    };

    let session = CallSession::new(
        caller_id,
        caller_name,
        callee_id,
        call_type,
        extra_participants,
        state.config.ringing_timeout_secs,
    );
    state.store.create_session(&session)?;

    tracing::info!(
        call_id = session.call_id.as_str(),
        caller_id = caller_id,
        callee_id = callee_id,
        call_type = call_type.as_str(),
        "Call created"
    );

    // Signaling begins as soon as the invite goes out.
    start_ringing(state, &session.call_id, Some(caller_id))?;

    let invite = ServerMessage::IncomingCall {
        call_id: session.call_id.clone(),
        caller_id: caller_id.to_string(),
        caller_name: caller_name.to_string(),
        call_type,
    };
    let push = PushNotification::incoming_call(&session);
    let delivery = dispatch::deliver(state, callee_id, invite, Some(&push)).await;

    tracing::info!(
        call_id = session.call_id.as_str(),
        socket = delivery.socket,
        push = delivery.push,
        "Call invite dispatched"
    );

    let session = load(state, &session.call_id)?;
    Ok((session, delivery))
}

/// Move a still-`initiated` call to `ringing` and broadcast the change.
///
/// Driven by call creation and by the first relayed offer. Returns false
/// when the call already moved past `initiated` — a no-op, not an error.
pub fn start_ringing(state: &AppState, call_id: &str, actor: Option<&str>) -> Result<bool> {
    if !state.store.mark_ringing(call_id)? {
        return Ok(false);
    }
    broadcast_status(state, call_id, CallStatus::Ringing, actor, None);
    Ok(true)
}

/// Answer a ringing call. Callee side only — the caller cannot answer their
/// own call, and a second concurrent answer loses the store race and gets
/// `InvalidTransition`.
pub fn answer(state: &AppState, call_id: &str, user_id: &str) -> Result<CallSession> {
    let session = load(state, call_id)?;
    if !session.can_answer(user_id) {
        return Err(Error::Unauthorized);
    }

    if !state.store.mark_answered(call_id, Utc::now().timestamp())? {
        return Err(Error::InvalidTransition);
    }

    tracing::info!(call_id = call_id, user_id = user_id, "Call answered");
    broadcast_status(state, call_id, CallStatus::Answered, Some(user_id), None);

    // The caller may not have joined the room yet; tell their inbox too.
    state.groups.publish(
        &user_group(&session.caller_id),
        &ServerMessage::CallStatus {
            call_id: call_id.to_string(),
            status: CallStatus::Answered,
            user_id: Some(user_id.to_string()),
            reason: None,
        },
    );

    load(state, call_id)
}

/// Decline an incoming call (callee side).
pub async fn decline(
    state: &AppState,
    call_id: &str,
    user_id: &str,
    reason: Option<&str>,
) -> Result<CallSession> {
    let session = load(state, call_id)?;
    if !session.can_answer(user_id) {
        return Err(Error::Unauthorized);
    }
    apply_terminal(
        state,
        &session,
        Some(user_id),
        CallStatus::Declined,
        reason,
        UNANSWERED_STATUSES,
    )
    .await
}

/// Reject an incoming call (callee side; distinct terminal status).
pub async fn reject(
    state: &AppState,
    call_id: &str,
    user_id: &str,
    reason: Option<&str>,
) -> Result<CallSession> {
    let session = load(state, call_id)?;
    if !session.can_answer(user_id) {
        return Err(Error::Unauthorized);
    }
    apply_terminal(
        state,
        &session,
        Some(user_id),
        CallStatus::Rejected,
        reason,
        UNANSWERED_STATUSES,
    )
    .await
}

/// Hang up. Valid from `answered` (normal hangup, duration recorded) and
/// from `ringing` (caller cancel, disconnect timeout). Idempotent in effect:
/// the second of two end attempts is a no-op failure.
pub async fn end(
    state: &AppState,
    call_id: &str,
    user_id: &str,
    reason: Option<&str>,
) -> Result<CallSession> {
    let session = load(state, call_id)?;
    if !session.is_participant(user_id) {
        return Err(Error::Unauthorized);
    }
    apply_terminal(
        state,
        &session,
        Some(user_id),
        CallStatus::Ended,
        reason,
        ENDABLE_STATUSES,
    )
    .await
}

/// Mark a call failed after an unrecoverable error. Valid from any active
/// status. `actor` is a participant reporting the failure, or `None` when
/// the server decides on its own.
pub async fn fail(
    state: &AppState,
    call_id: &str,
    actor: Option<&str>,
    reason: Option<&str>,
) -> Result<CallSession> {
    let session = load(state, call_id)?;
    if let Some(user_id) = actor {
        if !session.is_participant(user_id) {
            return Err(Error::Unauthorized);
        }
    }
    apply_terminal(state, &session, actor, CallStatus::Failed, reason, ACTIVE_STATUSES).await
}

/// Apply a client-requested status change (the WebSocket `call_status`
/// entry point). Maps the requested status onto the operation that owns it;
/// statuses no client may set directly (`initiated`, `missed`) are invalid
/// transitions.
pub async fn apply_status(
    state: &AppState,
    call_id: &str,
    user_id: &str,
    status: &str,
    reason: Option<&str>,
) -> Result<CallSession> {
    let Some(status) = CallStatus::parse(status) else {
        return Err(Error::InvalidRequest(format!("unknown status: {}", status)));
    };

    match status {
        CallStatus::Answered => answer(state, call_id, user_id),
        CallStatus::Ended => end(state, call_id, user_id, reason).await,
        CallStatus::Declined => decline(state, call_id, user_id, reason).await,
        CallStatus::Rejected => reject(state, call_id, user_id, reason).await,
        CallStatus::Failed => fail(state, call_id, Some(user_id), reason).await,
        // Server-set statuses: `ringing` comes from call creation and the
        // offer path, `missed` only from the sweep, and nothing returns to
        // `initiated`.
        CallStatus::Initiated | CallStatus::Ringing | CallStatus::Missed => {
            Err(Error::InvalidTransition)
        }
    }
}

/// Authorized point-in-time snapshot of a call.
pub fn get_status(state: &AppState, call_id: &str, user_id: &str) -> Result<CallSession> {
    let session = load(state, call_id)?;
    if !session.is_participant(user_id) {
        return Err(Error::Unauthorized);
    }
    Ok(session)
}

/// Consistency repair for reconnecting clients: force the session to the
/// status the client observed, filling in implied timestamps. Broadcasts
/// only when something actually changed; terminal sessions are never
/// touched.
pub fn sync_status(
    state: &AppState,
    call_id: &str,
    user_id: &str,
    status: &str,
) -> Result<(CallSession, bool)> {
    let session = load(state, call_id)?;
    if !session.is_participant(user_id) {
        return Err(Error::Unauthorized);
    }
    let Some(status) = CallStatus::parse(status) else {
        return Err(Error::InvalidRequest(format!("unknown status: {}", status)));
    };
    // Same exclusion as `apply_status`: server-set statuses cannot be forced
    // by a client. Syncing back to `ringing` would re-expose an answered
    // call to the ringing sweep.
    if matches!(
        status,
        CallStatus::Initiated | CallStatus::Ringing | CallStatus::Missed
    ) {
        return Err(Error::InvalidTransition);
    }

    let changed = state
        .store
        .sync_status(call_id, status, Utc::now().timestamp())?;

    if changed {
        tracing::info!(
            call_id = call_id,
            user_id = user_id,
            status = status.as_str(),
            "Call status synced"
        );
        broadcast_status(state, call_id, status, Some(user_id), None);
        for participant in &session.participants {
            state.groups.publish(
                &user_group(participant),
                &ServerMessage::CallStatus {
                    call_id: call_id.to_string(),
                    status,
                    user_id: Some(user_id.to_string()),
                    reason: None,
                },
            );
        }
        if status.is_terminal() {
            state.disconnects.clear_call(call_id);
        }
    }

    let session = load(state, call_id)?;
    Ok((session, changed))
}

/// Record a quality report and relay it to the other room members.
pub fn update_quality(
    state: &AppState,
    call_id: &str,
    user_id: &str,
    quality: &str,
    network_info: Option<serde_json::Value>,
) -> Result<()> {
    let session = load(state, call_id)?;
    if !session.is_participant(user_id) {
        return Err(Error::Unauthorized);
    }
    let Some(quality) = ConnectionQuality::parse(quality) else {
        return Err(Error::InvalidRequest(format!(
            "unknown connection quality: {}",
            quality
        )));
    };

    if !state
        .store
        .update_quality(call_id, quality, network_info.as_ref())?
    {
        return Err(Error::InvalidTransition);
    }

    if quality == ConnectionQuality::Poor {
        tracing::warn!(
            call_id = call_id,
            user_id = user_id,
            "Poor connection quality reported"
        );
    }

    state.groups.publish_except(
        &call_group(call_id),
        user_id,
        &ServerMessage::CallQuality {
            call_id: call_id.to_string(),
            user_id: user_id.to_string(),
            connection_quality: quality,
            network_info,
        },
    );

    Ok(())
}

/// Decide whether an intentional leave ends the call, per the configured
/// group policy. Returns true when the call was ended by this check.
pub async fn check_termination(state: &AppState, call_id: &str, leaver: &str) -> Result<bool> {
    let session = load(state, call_id)?;
    if !session.status.is_active() {
        return Ok(false);
    }

    let should_end = match state.config.group_end_policy {
        GroupEndPolicy::LastTwoLeave => state.groups.member_count(&call_group(call_id)) < 2,
        GroupEndPolicy::InitiatorLeaves => leaver == session.caller_id,
    };
    if !should_end {
        return Ok(false);
    }

    match apply_terminal(
        state,
        &session,
        Some(leaver),
        CallStatus::Ended,
        Some("participant_left"),
        ENDABLE_STATUSES,
    )
    .await
    {
        Ok(_) => Ok(true),
        // Still initiated, or someone else already terminated it.
        Err(Error::InvalidTransition) => Ok(false),
        Err(e) => Err(e),
    }
}

// ── Internals ─────────────────────────────────────────────────────────────────

fn load(state: &AppState, call_id: &str) -> Result<CallSession> {
    state
        .store
        .get_session(call_id)?
        .ok_or_else(|| Error::CallNotFound(call_id.to_string()))
}

/// Apply a terminal transition: store CAS, room broadcast, dispatcher
/// notification for parties not in the room, disconnect-state cleanup.
async fn apply_terminal(
    state: &AppState,
    session: &CallSession,
    actor: Option<&str>,
    status: CallStatus,
    reason: Option<&str>,
    allowed_from: &[CallStatus],
) -> Result<CallSession> {
    if !state.store.mark_terminal(
        &session.call_id,
        status,
        Utc::now().timestamp(),
        reason,
        allowed_from,
    )? {
        return Err(Error::InvalidTransition);
    }

    tracing::info!(
        call_id = session.call_id.as_str(),
        status = status.as_str(),
        reason = reason.unwrap_or(""),
        "Call terminated"
    );

    broadcast_status(state, &session.call_id, status, actor, reason);

    // Parties outside the room may be offline entirely; route their copy
    // through the fallback dispatcher.
    let room = call_group(&session.call_id);
    let push = PushNotification::call_status(session, status, reason);
    for peer in &session.participants {
        if actor == Some(peer.as_str()) || state.groups.is_member(&room, peer) {
            continue;
        }
        let message = ServerMessage::CallStatus {
            call_id: session.call_id.clone(),
            status,
            user_id: actor.map(String::from),
            reason: reason.map(String::from),
        };
        dispatch::deliver(state, peer, message, Some(&push)).await;
    }

    state.disconnects.clear_call(&session.call_id);

    load(state, &session.call_id)
}

fn broadcast_status(
    state: &AppState,
    call_id: &str,
    status: CallStatus,
    user_id: Option<&str>,
    reason: Option<&str>,
) {
    state.groups.publish(
        &call_group(call_id),
        &ServerMessage::CallStatus {
            call_id: call_id.to_string(),
            status,
            user_id: user_id.map(String::from),
            reason: reason.map(String::from),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::PushClient;
    use crate::state::CallConfig;
    use crate::store::SessionStore;
    use tokio::sync::mpsc;

    fn test_state() -> AppState {
        AppState::new(
            CallConfig::default(),
            SessionStore::open(None).unwrap(),
            PushClient::disabled(),
        )
    }

    fn test_state_with(config: CallConfig) -> AppState {
        AppState::new(config, SessionStore::open(None).unwrap(), PushClient::disabled())
    }

    async fn make_call(state: &AppState) -> CallSession {
        let (session, _delivery) = create_call(
            state,
            "alice",
            Some("Alice"),
            "bob",
            CallType::Audio,
            &[],
        )
        .await
        .unwrap();
        session
    }

    #[tokio::test]
    async fn test_create_call_rings_and_stores() {
        let state = test_state();
        let session = make_call(&state).await;

        assert_eq!(session.status, CallStatus::Ringing);
        assert_eq!(session.caller_id, "alice");
        assert_eq!(session.callee_id, "bob");
        assert_eq!(
            session.timeout_at,
            session.started_at + state.config.ringing_timeout_secs
        );

        let stored = state.store.get_session(&session.call_id).unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn test_create_call_validates_identities() {
        let state = test_state();

        let err = create_call(&state, "", None, "bob", CallType::Audio, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUser(_)));

        let err = create_call(&state, "alice", None, "alice", CallType::Audio, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_create_call_invites_connected_callee() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.groups.join("user:bob", "bob", tx);

        let (session, delivery) = create_call(
            &state,
            "alice",
            Some("Alice"),
            "bob",
            CallType::Video,
            &[],
        )
        .await
        .unwrap();

        assert!(delivery.socket);
        assert!(!delivery.push);

        let invite = rx.try_recv().unwrap();
        match invite {
            ServerMessage::IncomingCall {
                call_id,
                caller_name,
                call_type,
                ..
            } => {
                assert_eq!(call_id, session.call_id);
                assert_eq!(caller_name, "Alice");
                assert_eq!(call_type, CallType::Video);
            }
            other => panic!("Expected incoming_call, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_ringing_once_and_broadcasts() {
        let state = test_state();
        let session = CallSession::new("alice", "Alice", "bob", CallType::Audio, &[], 60);
        state.store.create_session(&session).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.groups.join(&call_group(&session.call_id), "bob", tx);

        assert!(start_ringing(&state, &session.call_id, Some("alice")).unwrap());
        match rx.try_recv().unwrap() {
            ServerMessage::CallStatus { status, .. } => assert_eq!(status, CallStatus::Ringing),
            other => panic!("Expected call_status, got {:?}", other),
        }

        // Already ringing — a repeat is a silent no-op with no broadcast.
        assert!(!start_ringing(&state, &session.call_id, Some("alice")).unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_answer_by_callee() {
        let state = test_state();
        let session = make_call(&state).await;

        let answered = answer(&state, &session.call_id, "bob").unwrap();
        assert_eq!(answered.status, CallStatus::Answered);
        assert!(answered.answered_at.is_some());
    }

    #[tokio::test]
    async fn test_answer_authorization() {
        let state = test_state();
        let session = make_call(&state).await;

        // The caller cannot answer their own call.
        assert!(matches!(
            answer(&state, &session.call_id, "alice"),
            Err(Error::Unauthorized)
        ));
        // A stranger gets the same answer — no state leaked.
        assert!(matches!(
            answer(&state, &session.call_id, "mallory"),
            Err(Error::Unauthorized)
        ));
        // Unknown calls are reported distinctly.
        assert!(matches!(
            answer(&state, "call_missing", "bob"),
            Err(Error::CallNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_double_answer_exactly_one_winner() {
        let state = test_state();
        let session = make_call(&state).await;

        let (first, second) = tokio::join!(
            async { answer(&state, &session.call_id, "bob") },
            async { answer(&state, &session.call_id, "bob") },
        );
        let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        let loser = if first.is_ok() { second } else { first };
        assert!(matches!(loser, Err(Error::InvalidTransition)));
    }

    #[tokio::test]
    async fn test_decline_has_zero_duration() {
        let state = test_state();
        let session = make_call(&state).await;

        let declined = decline(&state, &session.call_id, "bob", Some("busy"))
            .await
            .unwrap();
        assert_eq!(declined.status, CallStatus::Declined);
        assert_eq!(declined.duration_secs(), 0);
        assert_eq!(declined.end_reason.as_deref(), Some("busy"));

        // Nothing moves out of a terminal state.
        assert!(matches!(
            answer(&state, &session.call_id, "bob"),
            Err(Error::InvalidTransition)
        ));
    }

    #[tokio::test]
    async fn test_end_computes_duration() {
        let state = test_state();
        let session = make_call(&state).await;

        // Answered 60 seconds ago.
        let answered_at = Utc::now().timestamp() - 60;
        assert!(state.store.mark_answered(&session.call_id, answered_at).unwrap());

        let ended = end(&state, &session.call_id, "alice", None).await.unwrap();
        assert_eq!(ended.status, CallStatus::Ended);
        assert!(ended.duration_secs() >= 60);
        assert!(ended.duration_secs() <= 62);
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let state = test_state();
        let session = make_call(&state).await;
        answer(&state, &session.call_id, "bob").unwrap();

        let first = end(&state, &session.call_id, "alice", None).await.unwrap();
        let again = end(&state, &session.call_id, "bob", None).await;
        assert!(matches!(again, Err(Error::InvalidTransition)));

        let stored = state.store.get_session(&session.call_id).unwrap().unwrap();
        assert_eq!(stored.ended_at, first.ended_at);
    }

    #[tokio::test]
    async fn test_caller_can_cancel_while_ringing() {
        let state = test_state();
        let session = make_call(&state).await;

        let ended = end(&state, &session.call_id, "alice", Some("cancelled"))
            .await
            .unwrap();
        assert_eq!(ended.status, CallStatus::Ended);
        assert_eq!(ended.duration_secs(), 0);
    }

    #[tokio::test]
    async fn test_terminal_notifies_absent_peer() {
        let state = test_state();
        let session = make_call(&state).await;
        answer(&state, &session.call_id, "bob").unwrap();

        // Alice is connected but not in the call room.
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.groups.join("user:alice", "alice", tx);

        end(&state, &session.call_id, "bob", Some("hangup"))
            .await
            .unwrap();

        let notice = rx.try_recv().unwrap();
        match notice {
            ServerMessage::CallStatus { status, reason, .. } => {
                assert_eq!(status, CallStatus::Ended);
                assert_eq!(reason.as_deref(), Some("hangup"));
            }
            other => panic!("Expected call_status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fail_from_any_active_status() {
        let state = test_state();

        // Server-side failure while ringing.
        let session = make_call(&state).await;
        let failed = fail(&state, &session.call_id, None, Some("signaling_error"))
            .await
            .unwrap();
        assert_eq!(failed.status, CallStatus::Failed);
        assert_eq!(failed.end_reason.as_deref(), Some("signaling_error"));

        // Participant-reported failure mid-call.
        let session = make_call(&state).await;
        answer(&state, &session.call_id, "bob").unwrap();
        let failed = fail(&state, &session.call_id, Some("bob"), Some("ice_failed"))
            .await
            .unwrap();
        assert_eq!(failed.status, CallStatus::Failed);

        // Strangers cannot report failures.
        let session = make_call(&state).await;
        assert!(matches!(
            fail(&state, &session.call_id, Some("mallory"), None).await,
            Err(Error::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_apply_status_rejects_reserved_targets() {
        let state = test_state();
        let session = make_call(&state).await;

        assert!(matches!(
            apply_status(&state, &session.call_id, "bob", "missed", None).await,
            Err(Error::InvalidTransition)
        ));
        assert!(matches!(
            apply_status(&state, &session.call_id, "bob", "initiated", None).await,
            Err(Error::InvalidTransition)
        ));
        assert!(matches!(
            apply_status(&state, &session.call_id, "bob", "ringing", None).await,
            Err(Error::InvalidTransition)
        ));
        assert!(matches!(
            apply_status(&state, &session.call_id, "bob", "connected", None).await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_status_routes_to_operations() {
        let state = test_state();
        let session = make_call(&state).await;

        let answered = apply_status(&state, &session.call_id, "bob", "answered", None)
            .await
            .unwrap();
        assert_eq!(answered.status, CallStatus::Answered);

        let ended = apply_status(&state, &session.call_id, "alice", "ended", None)
            .await
            .unwrap();
        assert_eq!(ended.status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_get_status_authorization() {
        let state = test_state();
        let session = make_call(&state).await;

        assert!(get_status(&state, &session.call_id, "alice").is_ok());
        assert!(matches!(
            get_status(&state, &session.call_id, "mallory"),
            Err(Error::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_sync_status_reports_change() {
        let state = test_state();
        let session = make_call(&state).await;

        let (synced, changed) = sync_status(&state, &session.call_id, "bob", "answered").unwrap();
        assert!(changed);
        assert_eq!(synced.status, CallStatus::Answered);

        let (_, changed) = sync_status(&state, &session.call_id, "bob", "answered").unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn test_sync_status_rejects_server_set_targets() {
        let state = test_state();
        let session = make_call(&state).await;
        answer(&state, &session.call_id, "bob").unwrap();

        // An answered call cannot be pushed back under the ringing sweep or
        // forced into the sweep-only terminal status.
        for target in ["ringing", "initiated", "missed"] {
            assert!(matches!(
                sync_status(&state, &session.call_id, "bob", target),
                Err(Error::InvalidTransition)
            ));
        }
        let stored = state.store.get_session(&session.call_id).unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Answered);
    }

    #[tokio::test]
    async fn test_update_quality_relays_to_peers() {
        let state = test_state();
        let session = make_call(&state).await;
        let room = call_group(&session.call_id);

        let (tx_bob, mut rx_bob) = mpsc::unbounded_channel();
        let (tx_alice, mut rx_alice) = mpsc::unbounded_channel();
        state.groups.join(&room, "bob", tx_bob);
        state.groups.join(&room, "alice", tx_alice);

        let info = serde_json::json!({"rtt_ms": 300});
        update_quality(&state, &session.call_id, "alice", "poor", Some(info)).unwrap();

        // Sender excluded, peer notified.
        assert!(rx_alice.try_recv().is_err());
        match rx_bob.try_recv().unwrap() {
            ServerMessage::CallQuality {
                user_id,
                connection_quality,
                ..
            } => {
                assert_eq!(user_id, "alice");
                assert_eq!(connection_quality, ConnectionQuality::Poor);
            }
            other => panic!("Expected call_quality, got {:?}", other),
        }

        let stored = state.store.get_session(&session.call_id).unwrap().unwrap();
        assert_eq!(stored.connection_quality, Some(ConnectionQuality::Poor));
    }

    #[tokio::test]
    async fn test_check_termination_last_two_leave() {
        let state = test_state();
        let session = make_call(&state).await;
        answer(&state, &session.call_id, "bob").unwrap();

        // Bob is still in the room; Alice just left it.
        let (tx, _rx) = mpsc::unbounded_channel();
        state.groups.join(&call_group(&session.call_id), "bob", tx);

        assert!(check_termination(&state, &session.call_id, "alice")
            .await
            .unwrap());
        let stored = state.store.get_session(&session.call_id).unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
        assert_eq!(stored.end_reason.as_deref(), Some("participant_left"));
    }

    #[tokio::test]
    async fn test_check_termination_initiator_policy() {
        let config = CallConfig {
            group_end_policy: GroupEndPolicy::InitiatorLeaves,
            ..CallConfig::default()
        };
        let state = test_state_with(config);
        let session = make_call(&state).await;
        answer(&state, &session.call_id, "bob").unwrap();

        // Callee leaving does not end the call under this policy.
        assert!(!check_termination(&state, &session.call_id, "bob")
            .await
            .unwrap());
        // The initiator leaving does.
        assert!(check_termination(&state, &session.call_id, "alice")
            .await
            .unwrap());
    }
}

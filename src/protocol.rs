//! Signaling protocol message definitions.
//!
//! Clients speak JSON over a persistent WebSocket. Offer/answer/ICE payloads
//! are opaque to the server — it relays them between room members without
//! inspecting their contents. Only `call_status` and `call_quality` mutate
//! state, and they do so through the lifecycle manager.

use serde::{Deserialize, Serialize};

use crate::session::{CallSession, CallStatus, CallType, ConnectionQuality};

// ── Client → Server ───────────────────────────────────────────────────────────

/// Messages sent from a client to the call server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Associate this WebSocket connection with a user id.
    /// Must be sent first after connecting; joins the user's personal group.
    Register {
        user_id: String,
    },

    /// Join a call's signaling room. Allowed for call participants only;
    /// the server replies with the current call snapshot.
    JoinCall {
        call_id: String,
    },

    /// Leave a call's signaling room.
    LeaveCall {
        call_id: String,
    },

    /// Relay a WebRTC offer to the other room members.
    Offer {
        call_id: String,
        payload: serde_json::Value,
    },

    /// Relay a WebRTC answer to the other room members.
    Answer {
        call_id: String,
        payload: serde_json::Value,
    },

    /// Relay an ICE candidate to the other room members.
    IceCandidate {
        call_id: String,
        payload: serde_json::Value,
    },

    /// Request a call status transition (answered/ended/declined/rejected/
    /// failed). The result is broadcast to the room.
    CallStatus {
        call_id: String,
        status: String,
        reason: Option<String>,
    },

    /// Report connection quality and network metadata for the call.
    CallQuality {
        call_id: String,
        connection_quality: String,
        network_info: Option<serde_json::Value>,
    },

    /// Tell the other members a media track was muted/unmuted.
    /// Pure relay, no state change.
    ToggleMedia {
        call_id: String,
        media_type: String,
        enabled: bool,
    },

    /// Keep-alive.
    Ping,
}

// ── Server → Client ───────────────────────────────────────────────────────────

/// Messages sent from the call server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgement of successful registration.
    Registered {
        user_id: String,
    },

    /// A request could not be processed.
    Error {
        message: String,
    },

    Pong,

    /// Current call snapshot — sent on room join and on reconnect so the
    /// client can resynchronize without replaying signaling history.
    CallState {
        call: CallSnapshot,
    },

    /// A call invitation delivered to the callee's personal group.
    IncomingCall {
        call_id: String,
        caller_id: String,
        caller_name: String,
        call_type: CallType,
    },

    /// A call status change, broadcast to the room after every successful
    /// transition.
    CallStatus {
        call_id: String,
        status: CallStatus,
        user_id: Option<String>,
        reason: Option<String>,
    },

    /// Follow-up to the caller after a call rang out unanswered.
    MissedCall {
        call_id: String,
        peer_name: String,
    },

    /// A relayed WebRTC offer.
    Offer {
        call_id: String,
        from_user: String,
        payload: serde_json::Value,
    },

    /// A relayed WebRTC answer.
    Answer {
        call_id: String,
        from_user: String,
        payload: serde_json::Value,
    },

    /// A relayed ICE candidate.
    IceCandidate {
        call_id: String,
        from_user: String,
        payload: serde_json::Value,
    },

    /// A peer's quality report.
    CallQuality {
        call_id: String,
        user_id: String,
        connection_quality: ConnectionQuality,
        network_info: Option<serde_json::Value>,
    },

    /// A user joined the call room.
    ParticipantJoined {
        call_id: String,
        user_id: String,
    },

    /// A user left the call room (intentionally or by connection loss).
    ParticipantLeft {
        call_id: String,
        user_id: String,
    },

    /// A peer muted/unmuted a media track.
    ToggleMedia {
        call_id: String,
        user_id: String,
        media_type: String,
        enabled: bool,
    },
}

// ── Call Snapshot ─────────────────────────────────────────────────────────────

/// Point-in-time view of a call session, safe to hand to participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub call_id: String,
    pub caller_id: String,
    pub caller_name: String,
    pub callee_id: String,
    pub participants: Vec<String>,
    pub call_type: CallType,
    pub status: CallStatus,
    /// Unix seconds.
    pub started_at: i64,
    pub answered_at: Option<i64>,
    pub ended_at: Option<i64>,
    /// Final duration for ended calls, elapsed time for answered ones.
    pub duration_secs: i64,
    pub end_reason: Option<String>,
    pub connection_quality: Option<ConnectionQuality>,
}

impl From<&CallSession> for CallSnapshot {
    fn from(session: &CallSession) -> Self {
        Self {
            call_id: session.call_id.clone(),
            caller_id: session.caller_id.clone(),
            caller_name: session.caller_name.clone(),
            callee_id: session.callee_id.clone(),
            participants: session.participants.clone(),
            call_type: session.call_type,
            status: session.status,
            started_at: session.started_at,
            answered_at: session.answered_at,
            ended_at: session.ended_at,
            duration_secs: session.duration_secs(),
            end_reason: session.end_reason.clone(),
            connection_quality: session.connection_quality,
        }
    }
}

// ── Push Notifications ────────────────────────────────────────────────────────

/// Push time-to-live: an undelivered call notification is useless after an
/// hour.
const PUSH_TTL_SECS: u64 = 3600;

/// A notification handed to the push provider when the live socket path
/// cannot reach the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    /// Structured payload the client app routes on (`data.type`).
    pub data: serde_json::Value,
    /// Delivery hint for the provider; calls are always time-sensitive.
    pub priority: String,
    pub ttl_secs: u64,
}

impl PushNotification {
    /// Invitation push for a callee with no live connection.
    pub fn incoming_call(session: &CallSession) -> Self {
        Self {
            title: format!("Incoming {} Call", session.call_type.label()),
            body: format!("{} is calling you", session.caller_name),
            data: serde_json::json!({
                "type": "incoming_call",
                "call_id": session.call_id,
                "caller_name": session.caller_name,
                "caller_id": session.caller_id,
                "call_type": session.call_type.as_str(),
            }),
            priority: "high".to_string(),
            ttl_secs: PUSH_TTL_SECS,
        }
    }

    /// Follow-up to the caller after the ringing timeout expired.
    pub fn missed_call(session: &CallSession, peer_name: &str) -> Self {
        Self {
            title: "Missed Call".to_string(),
            body: format!("{} didn't answer your call", peer_name),
            data: serde_json::json!({
                "type": "missed_call",
                "call_id": session.call_id,
                "call_type": session.call_type.as_str(),
            }),
            priority: "high".to_string(),
            ttl_secs: PUSH_TTL_SECS,
        }
    }

    /// Terminal status notice for a party who may be offline.
    pub fn call_status(session: &CallSession, status: CallStatus, reason: Option<&str>) -> Self {
        Self {
            title: "Call Ended".to_string(),
            body: match status {
                CallStatus::Declined => format!("{} declined the call", session.callee_id),
                CallStatus::Rejected => "Call rejected".to_string(),
                _ => "Call ended".to_string(),
            },
            data: serde_json::json!({
                "type": "call_status",
                "call_id": session.call_id,
                "status": status.as_str(),
                "reason": reason,
            }),
            priority: "high".to_string(),
            ttl_secs: PUSH_TTL_SECS,
        }
    }
}

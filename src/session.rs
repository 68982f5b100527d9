//! Call session domain model.
//!
//! A `CallSession` is one logical call attempt from creation to a terminal
//! state, identified by an opaque `call_id` that doubles as the signaling
//! room key. The session row in the store is the single source of truth for
//! call state; everything here is read/written through the lifecycle
//! manager's validated transitions.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audio or video call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(CallType::Audio),
            "video" => Some(CallType::Video),
            _ => None,
        }
    }

    /// Title-cased label for notification text ("Audio" / "Video").
    pub fn label(&self) -> &'static str {
        match self {
            CallType::Audio => "Audio",
            CallType::Video => "Video",
        }
    }
}

/// Call session status.
///
/// Terminal statuses are final — no transition leaves them, and the only
/// later mutation is the archival flag set by the retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    Ended,
    Missed,
    Declined,
    Rejected,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
            CallStatus::Declined => "declined",
            CallStatus::Rejected => "rejected",
            CallStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(CallStatus::Initiated),
            "ringing" => Some(CallStatus::Ringing),
            "answered" => Some(CallStatus::Answered),
            "ended" => Some(CallStatus::Ended),
            "missed" => Some(CallStatus::Missed),
            "declined" => Some(CallStatus::Declined),
            "rejected" => Some(CallStatus::Rejected),
            "failed" => Some(CallStatus::Failed),
            _ => None,
        }
    }

    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended
                | CallStatus::Missed
                | CallStatus::Declined
                | CallStatus::Rejected
                | CallStatus::Failed
        )
    }

    /// Whether the call is still live (pre-terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Statuses from which an answer is valid.
    pub fn can_be_answered(&self) -> bool {
        matches!(self, CallStatus::Initiated | CallStatus::Ringing)
    }
}

/// Last-reported connection quality for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConnectionQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Excellent => "excellent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "poor" => Some(ConnectionQuality::Poor),
            "fair" => Some(ConnectionQuality::Fair),
            "good" => Some(ConnectionQuality::Good),
            "excellent" => Some(ConnectionQuality::Excellent),
            _ => None,
        }
    }
}

/// One call session record.
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Externally visible opaque token; also the signaling room key.
    pub call_id: String,
    pub caller_id: String,
    /// Display name snapshot taken at creation, used in notification text.
    pub caller_name: String,
    pub callee_id: String,
    /// Everyone allowed in the call room; always includes caller and callee.
    pub participants: Vec<String>,
    pub call_type: CallType,
    pub status: CallStatus,
    /// Unix seconds.
    pub started_at: i64,
    pub answered_at: Option<i64>,
    pub ended_at: Option<i64>,
    /// Deadline for the ringing sweep while the call is unanswered.
    pub timeout_at: i64,
    pub end_reason: Option<String>,
    pub connection_quality: Option<ConnectionQuality>,
    /// Free-form network metadata from the last quality report (JSON).
    pub network_info: Option<serde_json::Value>,
    pub archived: bool,
}

impl CallSession {
    /// Create a fresh session in `initiated` with a newly generated call id.
    pub fn new(
        caller_id: &str,
        caller_name: &str,
        callee_id: &str,
        call_type: CallType,
        extra_participants: &[String],
        ringing_timeout_secs: i64,
    ) -> Self {
        let now = Utc::now().timestamp();

        let mut participants = vec![caller_id.to_string(), callee_id.to_string()];
        for p in extra_participants {
            if !participants.contains(p) {
                participants.push(p.clone());
            }
        }

        Self {
            call_id: generate_call_id(),
            caller_id: caller_id.to_string(),
            caller_name: caller_name.to_string(),
            callee_id: callee_id.to_string(),
            participants,
            call_type,
            status: CallStatus::Initiated,
            started_at: now,
            answered_at: None,
            ended_at: None,
            timeout_at: now + ringing_timeout_secs,
            end_reason: None,
            connection_quality: None,
            network_info: None,
            archived: false,
        }
    }

    /// Whether the user may act on this call.
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.caller_id == user_id
            || self.callee_id == user_id
            || self.participants.iter().any(|p| p == user_id)
    }

    /// Whether the user may answer this call (everyone but the caller).
    pub fn can_answer(&self, user_id: &str) -> bool {
        self.is_participant(user_id) && self.caller_id != user_id
    }

    /// Call duration in seconds: `ended_at - answered_at` when both are
    /// recorded, otherwise 0 (unanswered calls have no duration).
    pub fn duration_secs(&self) -> i64 {
        match (self.answered_at, self.ended_at) {
            (Some(answered), Some(ended)) => (ended - answered).max(0),
            _ => {
                // An answered call still in progress reports elapsed time
                // for reconnect "duration so far".
                if let Some(answered) = self.answered_at {
                    (Utc::now().timestamp() - answered).max(0)
                } else {
                    0
                }
            }
        }
    }
}

/// Generate a unique call id: `call_` + 16 hex chars of a v4 UUID.
pub fn generate_call_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..16])
}

//! Delivery fallback dispatcher.
//!
//! Guarantees a signaling event reaches its target through some channel:
//! the live socket path first, the push provider when the target has no
//! connection. Delivery failures are logged and absorbed — an unreachable
//! callee is resolved by the ringing timeout, not by an error here, and
//! nothing retries automatically (the missed-call follow-up is a distinct
//! event owned by the supervisor).

use serde::Serialize;

use crate::error::{Error, Result};
use crate::groups::user_group;
use crate::protocol::{PushNotification, ServerMessage};
use crate::state::AppState;

/// Which paths carried an event to its target.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DeliveryOutcome {
    /// Handed to at least one live subscriber of the target's user group.
    pub socket: bool,
    /// Accepted by the push provider.
    pub push: bool,
}

impl DeliveryOutcome {
    /// Whether the event went out on any channel at all.
    pub fn reached(&self) -> bool {
        self.socket || self.push
    }
}

// ── Push Provider Client ──────────────────────────────────────────────────────

/// HTTP client for the push-notification provider.
///
/// The provider's internals are not our concern; we submit
/// `{token, title, body, data, priority, ttl_secs}` and treat any 2xx as
/// accepted. An unconfigured endpoint disables push entirely.
#[derive(Clone)]
pub struct PushClient {
    http: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
}

impl PushClient {
    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }

    /// A client with no provider configured. Every send fails softly.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Submit a notification for the given device token.
    pub async fn send(&self, token: &str, notification: &PushNotification) -> Result<()> {
        let Some(endpoint) = &self.endpoint else {
            return Err(Error::PushFailed("push provider not configured".to_string()));
        };

        let mut request = self.http.post(endpoint).json(&serde_json::json!({
            "token": token,
            "title": notification.title,
            "body": notification.body,
            "data": notification.data,
            "priority": notification.priority,
            "ttl_secs": notification.ttl_secs,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::PushFailed(format!("request failed: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(Error::PushFailed(format!(
                "provider returned {}: {}",
                status, body
            )))
        }
    }
}

// ── Delivery ──────────────────────────────────────────────────────────────────

/// Deliver an event to a user: live socket first, push fallback second.
///
/// "Socket success" only means the message was handed to a live connection;
/// there is no synchronous acknowledgment that anyone saw it. Under
/// force-push the socket attempt is skipped entirely so the secondary path
/// can be tested end to end; push still requires a registered token.
pub async fn deliver(
    state: &AppState,
    target_user: &str,
    message: ServerMessage,
    push: Option<&PushNotification>,
) -> DeliveryOutcome {
    let mut outcome = DeliveryOutcome::default();

    if state.config.force_push {
        tracing::debug!(
            user_id = target_user,
            "Force-push enabled, skipping socket delivery"
        );
    } else {
        outcome.socket = state.groups.publish(&user_group(target_user), &message) > 0;
    }

    if !outcome.socket {
        if let Some(push) = push {
            outcome.push = send_push(state, target_user, push).await;
        }
    }

    if !outcome.reached() {
        tracing::warn!(
            user_id = target_user,
            "Delivery failed on both socket and push paths"
        );
    }

    outcome
}

/// Resolve the target's push token and submit the notification.
async fn send_push(state: &AppState, target_user: &str, notification: &PushNotification) -> bool {
    let token = match state.store.get_push_token(target_user) {
        Ok(Some(token)) => token,
        Ok(None) => {
            tracing::debug!(user_id = target_user, "No push token registered");
            return false;
        }
        Err(e) => {
            tracing::error!(
                user_id = target_user,
                error = %e,
                "Failed to look up push token"
            );
            return false;
        }
    };

    match state.push.send(&token, notification).await {
        Ok(()) => {
            tracing::info!(user_id = target_user, "Push notification sent");
            true
        }
        Err(e) => {
            tracing::warn!(
                user_id = target_user,
                error = %e,
                "Push delivery failed"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CallSession, CallType};
    use crate::state::CallConfig;
    use crate::store::SessionStore;
    use tokio::sync::mpsc;

    fn test_state(force_push: bool) -> AppState {
        let config = CallConfig {
            force_push,
            ..CallConfig::default()
        };
        AppState::new(config, SessionStore::open(None).unwrap(), PushClient::disabled())
    }

    fn test_push() -> PushNotification {
        let session = CallSession::new("alice", "Alice", "bob", CallType::Audio, &[], 60);
        PushNotification::incoming_call(&session)
    }

    #[tokio::test]
    async fn test_deliver_prefers_socket() {
        let state = test_state(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.groups.join("user:bob", "bob", tx);
        // A registered token must not be used while the socket path works.
        state
            .store
            .register_push_token("bob", "token-1", "fcm")
            .unwrap();

        let push = test_push();
        let outcome = deliver(&state, "bob", ServerMessage::Pong, Some(&push)).await;

        assert!(outcome.socket);
        assert!(!outcome.push);
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Pong)));
    }

    #[tokio::test]
    async fn test_deliver_falls_back_when_offline() {
        let state = test_state(false);
        state
            .store
            .register_push_token("bob", "token-1", "fcm")
            .unwrap();

        let push = test_push();
        let outcome = deliver(&state, "bob", ServerMessage::Pong, Some(&push)).await;

        // The push path was taken; with no provider configured it fails
        // softly rather than erroring.
        assert!(!outcome.socket);
        assert!(!outcome.push);
    }

    #[tokio::test]
    async fn test_deliver_no_connection_no_token() {
        let state = test_state(false);
        let push = test_push();
        let outcome = deliver(&state, "bob", ServerMessage::Pong, Some(&push)).await;
        assert!(!outcome.reached());
    }

    #[tokio::test]
    async fn test_force_push_skips_socket() {
        let state = test_state(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.groups.join("user:bob", "bob", tx);

        let push = test_push();
        let outcome = deliver(&state, "bob", ServerMessage::Pong, Some(&push)).await;

        // Live connection ignored in force mode.
        assert!(!outcome.socket);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_push_payload_means_socket_only() {
        let state = test_state(false);
        state
            .store
            .register_push_token("bob", "token-1", "fcm")
            .unwrap();

        let outcome = deliver(&state, "bob", ServerMessage::Pong, None).await;
        assert!(!outcome.socket);
        assert!(!outcome.push);
    }

    #[tokio::test]
    async fn test_disabled_client_send_errors() {
        let client = PushClient::disabled();
        assert!(!client.is_configured());
        let err = client.send("token", &test_push()).await.unwrap_err();
        assert!(matches!(err, Error::PushFailed(_)));
    }
}

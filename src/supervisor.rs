//! Timeout supervision: disconnect grace timers and background sweeps.
//!
//! Three timing concerns live here:
//!
//! * Disconnect grace — a participant whose socket drops mid-call gets a
//!   grace window to reconnect before the call is ended for them.
//! * Ringing sweep — unanswered calls past their deadline become `missed`.
//! * Retention sweep — terminal sessions older than the retention window
//!   are flagged archived.
//!
//! Timers and sweeps race against user actions by construction. Every
//! resolution funnels through a conditional store update or a single
//! registry removal, so each expiry is acted on exactly once no matter how
//! many paths reach it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::dispatch;
use crate::error::{Error, Result};
use crate::groups::call_group;
use crate::lifecycle;
use crate::protocol::{PushNotification, ServerMessage};
use crate::session::CallStatus;
use crate::state::AppState;

// ── Disconnect Registry ───────────────────────────────────────────────────────

#[derive(Default)]
struct DisconnectEntry {
    /// Participants currently inside their grace window.
    disconnected: HashSet<String>,
    /// Pending grace timers, keyed by user id.
    timers: HashMap<String, JoinHandle<()>>,
    /// Unix seconds of the last mark/remove, for the stale-entry backstop.
    last_activity: i64,
}

impl DisconnectEntry {
    fn is_empty(&self) -> bool {
        self.disconnected.is_empty() && self.timers.is_empty()
    }
}

/// Per-call tracking of disconnected participants and their grace timers.
///
/// The `disconnected` marker is the decision point: whichever path removes
/// it (reconnect, grace expiry, terminal cleanup) owns the outcome. Timer
/// handles exist only so losing timers can be aborted early.
#[derive(Clone, Default)]
pub struct DisconnectRegistry {
    inner: Arc<DashMap<String, DisconnectEntry>>,
}

impl DisconnectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a participant as disconnected. Returns false if they were
    /// already inside a grace window for this call.
    pub fn mark_disconnected(&self, call_id: &str, user_id: &str) -> bool {
        let mut entry = self.inner.entry(call_id.to_string()).or_default();
        entry.last_activity = Utc::now().timestamp();
        entry.disconnected.insert(user_id.to_string())
    }

    /// Remove the disconnected marker. Returns true for exactly one caller
    /// per mark.
    pub fn remove_disconnected(&self, call_id: &str, user_id: &str) -> bool {
        let removed = self
            .inner
            .get_mut(call_id)
            .map(|mut entry| {
                entry.last_activity = Utc::now().timestamp();
                entry.disconnected.remove(user_id)
            })
            .unwrap_or(false);
        self.inner.remove_if(call_id, |_, entry| entry.is_empty());
        removed
    }

    pub fn is_disconnected(&self, call_id: &str, user_id: &str) -> bool {
        self.inner
            .get(call_id)
            .map(|entry| entry.disconnected.contains(user_id))
            .unwrap_or(false)
    }

    /// Keep the handle of a spawned grace timer so it can be aborted.
    ///
    /// The handle is kept only while its user is still marked disconnected.
    /// A timer that already resolved its mark (instant fire, or a reconnect
    /// in between) stays detached instead; it gates itself on the mark and
    /// cannot act twice.
    pub fn store_timer(&self, call_id: &str, user_id: &str, handle: JoinHandle<()>) {
        if let Some(mut entry) = self.inner.get_mut(call_id) {
            if entry.disconnected.contains(user_id) {
                if let Some(old) = entry.timers.insert(user_id.to_string(), handle) {
                    old.abort();
                }
                return;
            }
        }
        // Dropping the handle detaches the task, it does not abort it.
    }

    /// Detach a stored timer handle without aborting it.
    pub fn take_timer(&self, call_id: &str, user_id: &str) -> Option<JoinHandle<()>> {
        let handle = self
            .inner
            .get_mut(call_id)
            .and_then(|mut entry| entry.timers.remove(user_id));
        self.inner.remove_if(call_id, |_, entry| entry.is_empty());
        handle
    }

    /// Drop all tracking for a call and abort its pending timers. Called
    /// after every terminal transition.
    pub fn clear_call(&self, call_id: &str) {
        if let Some((_, entry)) = self.inner.remove(call_id) {
            for handle in entry.timers.into_values() {
                handle.abort();
            }
        }
    }

    /// Number of calls with at least one tracked disconnect.
    pub fn tracked_call_count(&self) -> usize {
        self.inner.len()
    }

    /// Call ids whose entry saw no activity since the cutoff.
    pub fn stale_calls(&self, cutoff: i64) -> Vec<String> {
        self.inner
            .iter()
            .filter(|entry| entry.value().last_activity < cutoff)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

// ── Disconnect handling ───────────────────────────────────────────────────────

/// Start a grace timer for a participant whose connection dropped.
///
/// No-op unless the call is still active and the user belongs to it.
/// Duplicate drops (two sockets, same user) are tracked once.
pub fn handle_disconnect(state: &AppState, call_id: &str, user_id: &str) {
    let session = match state.store.get_session(call_id) {
        Ok(Some(session)) => session,
        Ok(None) => return,
        Err(e) => {
            tracing::error!(
                call_id = call_id,
                error = %e,
                "Failed to look up call for disconnect tracking"
            );
            return;
        }
    };
    if !session.status.is_active() || !session.is_participant(user_id) {
        return;
    }

    // The mark goes in before the timer exists, so an instantly firing
    // timer still finds it.
    if !state.disconnects.mark_disconnected(call_id, user_id) {
        return;
    }

    tracing::info!(
        call_id = call_id,
        user_id = user_id,
        grace_secs = state.config.disconnect_grace_secs,
        "Participant disconnected, grace timer started"
    );

    let grace = Duration::from_secs(state.config.disconnect_grace_secs);
    let handle = tokio::spawn({
        let state = state.clone();
        let call_id = call_id.to_string();
        let user_id = user_id.to_string();
        async move {
            tokio::time::sleep(grace).await;
            on_grace_expired(&state, &call_id, &user_id).await;
        }
    });
    state.disconnects.store_timer(call_id, user_id, handle);
}

/// Cancel a participant's grace timer on reconnect. Returns whether they
/// were inside a grace window.
pub fn handle_reconnect(state: &AppState, call_id: &str, user_id: &str) -> bool {
    let was_disconnected = state.disconnects.remove_disconnected(call_id, user_id);
    if let Some(handle) = state.disconnects.take_timer(call_id, user_id) {
        handle.abort();
    }
    if was_disconnected {
        tracing::info!(
            call_id = call_id,
            user_id = user_id,
            "Participant reconnected within grace"
        );
    }
    was_disconnected
}

async fn on_grace_expired(state: &AppState, call_id: &str, user_id: &str) {
    // Detach our own handle first; the terminal cleanup below aborts every
    // stored timer for the call and must not hit this task mid-flight.
    drop(state.disconnects.take_timer(call_id, user_id));

    // A removal that comes back false means a reconnect or terminal
    // cleanup got here first.
    if !state.disconnects.remove_disconnected(call_id, user_id) {
        return;
    }

    match lifecycle::end(state, call_id, user_id, Some("disconnect_timeout")).await {
        Ok(session) => {
            tracing::info!(
                call_id = call_id,
                user_id = user_id,
                status = session.status.as_str(),
                "Call ended after disconnect grace expired"
            );
        }
        // The call settled some other way in the meantime.
        Err(Error::InvalidTransition) | Err(Error::CallNotFound(_)) => {}
        Err(e) => {
            tracing::error!(
                call_id = call_id,
                error = %e,
                "Failed to end call after disconnect timeout"
            );
        }
    }
}

// ── Background sweeps ─────────────────────────────────────────────────────────

/// Spawn the periodic maintenance tasks.
pub fn spawn(state: AppState) {
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(sweep_state.config.sweep_interval_secs));
        loop {
            interval.tick().await;
            match run_ringing_sweep(&sweep_state).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(missed = n, "Ringing sweep resolved unanswered calls"),
                Err(e) => tracing::error!(error = %e, "Ringing sweep failed"),
            }
            clear_stale_tracking(&sweep_state, Utc::now().timestamp());
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(
            state.config.retention_sweep_interval_secs,
        ));
        loop {
            interval.tick().await;
            match run_retention_sweep(&state) {
                Ok(0) => {}
                Ok(n) => tracing::info!(archived = n, "Retention sweep archived terminal calls"),
                Err(e) => tracing::error!(error = %e, "Retention sweep failed"),
            }
        }
    });
}

/// Resolve every unanswered call past its ringing deadline as missed.
/// Returns the number of calls this pass settled.
pub async fn run_ringing_sweep(state: &AppState) -> Result<usize> {
    let now = Utc::now().timestamp();
    let expired = state.store.list_timed_out(now)?;
    let mut missed = 0;

    for session in expired {
        // A user action can settle the call between the scan and this
        // update; the conditional update decides who wins.
        if !state.store.mark_missed(&session.call_id, now)? {
            continue;
        }
        missed += 1;

        tracing::info!(
            call_id = session.call_id.as_str(),
            caller_id = session.caller_id.as_str(),
            "Call rang out unanswered"
        );

        state.groups.publish(
            &call_group(&session.call_id),
            &ServerMessage::CallStatus {
                call_id: session.call_id.clone(),
                status: CallStatus::Missed,
                user_id: None,
                reason: Some("ringing_timeout".to_string()),
            },
        );

        // The caller hears back whichever way they are reachable.
        let notice = ServerMessage::MissedCall {
            call_id: session.call_id.clone(),
            peer_name: session.callee_id.clone(),
        };
        let push = PushNotification::missed_call(&session, &session.callee_id);
        dispatch::deliver(state, &session.caller_id, notice, Some(&push)).await;

        state.disconnects.clear_call(&session.call_id);
    }

    Ok(missed)
}

/// Flag terminal sessions older than the retention window as archived.
pub fn run_retention_sweep(state: &AppState) -> Result<usize> {
    let cutoff = Utc::now().timestamp() - state.config.retention_days * 86_400;
    state.store.archive_terminal_older_than(cutoff)
}

/// Drop disconnect tracking for calls that stopped being supervisable.
///
/// Entries normally live no longer than one grace window; one idle for many
/// windows whose call is settled or gone has nothing left to resolve.
/// Entries of still-active calls are never touched here.
pub fn clear_stale_tracking(state: &AppState, now: i64) -> usize {
    let idle_secs = (state.config.disconnect_grace_secs as i64 * 10).max(60);
    let mut cleared = 0;

    for call_id in state.disconnects.stale_calls(now - idle_secs) {
        let active = match state.store.get_session(&call_id) {
            Ok(Some(session)) => session.status.is_active(),
            Ok(None) => false,
            // Cannot tell; leave the entry for the next pass.
            Err(_) => continue,
        };
        if !active {
            state.disconnects.clear_call(&call_id);
            cleared += 1;
            tracing::debug!(call_id = call_id.as_str(), "Dropped stale disconnect tracking");
        }
    }
    cleared
}

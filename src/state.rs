//! Shared server state.
//!
//! `AppState` ties the gateway's group registry, the durable session store,
//! the push client, and the supervisor's disconnect registry together. It is
//! cheap to clone — every field is an `Arc`-backed handle.

use clap::ValueEnum;

use crate::dispatch::PushClient;
use crate::groups::GroupRegistry;
use crate::store::SessionStore;
use crate::supervisor::DisconnectRegistry;

/// Default ringing timeout before a call is marked missed.
const DEFAULT_RINGING_TIMEOUT_SECS: i64 = 60;

/// Default cadence of the ringing-timeout sweep.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;

/// Default window a disconnected participant has to reconnect.
const DEFAULT_DISCONNECT_GRACE_SECS: u64 = 30;

/// Default retention window before terminal sessions are archived.
const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Default cadence of the retention sweep (daily).
const DEFAULT_RETENTION_SWEEP_INTERVAL_SECS: u64 = 24 * 3600;

/// When an active group call ends after a member leaves.
///
/// Single-callee calls are the primary case; under either policy they end
/// as soon as one of the two parties leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GroupEndPolicy {
    /// End the call once fewer than two members remain in its room.
    LastTwoLeave,
    /// End the call when the initiator leaves, regardless of who remains.
    InitiatorLeaves,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub port: u16,
    pub ringing_timeout_secs: i64,
    pub sweep_interval_secs: u64,
    pub disconnect_grace_secs: u64,
    pub retention_days: i64,
    pub retention_sweep_interval_secs: u64,
    pub group_end_policy: GroupEndPolicy,
    /// Test mode: skip the live-socket path so the push fallback is
    /// exercised even for connected targets.
    pub force_push: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            ringing_timeout_secs: DEFAULT_RINGING_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            disconnect_grace_secs: DEFAULT_DISCONNECT_GRACE_SECS,
            retention_days: DEFAULT_RETENTION_DAYS,
            retention_sweep_interval_secs: DEFAULT_RETENTION_SWEEP_INTERVAL_SECS,
            group_end_policy: GroupEndPolicy::LastTwoLeave,
            force_push: false,
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// Broadcast groups: `user:<id>` inboxes and `call:<id>` rooms.
    pub groups: GroupRegistry,

    /// Durable call sessions and push tokens.
    pub store: SessionStore,

    /// Push provider client for fallback delivery.
    pub push: PushClient,

    /// Per-call disconnect tracking owned by the supervisor.
    pub disconnects: DisconnectRegistry,

    /// Server configuration.
    pub config: CallConfig,
}

impl AppState {
    /// Create server state with the given configuration and store.
    pub fn new(config: CallConfig, store: SessionStore, push: PushClient) -> Self {
        Self {
            groups: GroupRegistry::new(),
            store,
            push,
            disconnects: DisconnectRegistry::new(),
            config,
        }
    }

    /// Number of clients with a live connection.
    pub fn online_count(&self) -> usize {
        self.groups.online_user_count()
    }

    /// Number of call rooms with at least one member.
    pub fn active_room_count(&self) -> usize {
        self.groups.active_room_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CallConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.ringing_timeout_secs, 60);
        assert_eq!(config.sweep_interval_secs, 10);
        assert_eq!(config.disconnect_grace_secs, 30);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.group_end_policy, GroupEndPolicy::LastTwoLeave);
        assert!(!config.force_push);
    }

    #[test]
    fn test_state_creation() {
        let state = AppState::new(
            CallConfig::default(),
            crate::store::SessionStore::open(None).unwrap(),
            PushClient::disabled(),
        );
        assert_eq!(state.online_count(), 0);
        assert_eq!(state.active_room_count(), 0);
    }
}

//! Broadcast group registry.
//!
//! The pub/sub primitive behind the gateway: named groups of connected
//! subscribers. Two naming conventions are used — `user:<id>` for a user's
//! personal inbox (call invitations, cross-call events) and `call:<id>` for
//! a call's signaling room. Backed by an in-process concurrent map; a
//! distributed pub/sub can replace it behind the same interface for
//! multi-instance deployments.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::protocol::ServerMessage;

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// The personal group for a user.
pub fn user_group(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// The signaling room for a call.
pub fn call_group(call_id: &str) -> String {
    format!("call:{}", call_id)
}

/// The call id behind a group name, if it names a signaling room.
pub fn call_id_of(group: &str) -> Option<&str> {
    group.strip_prefix("call:")
}

/// Named broadcast groups over an in-process registry.
///
/// Messages published to one group reach its current members in publish
/// order (each member's channel is FIFO); nothing is ordered across groups.
#[derive(Clone, Default)]
pub struct GroupRegistry {
    /// Group name → member id → sender channel.
    groups: Arc<DashMap<String, HashMap<String, ClientSender>>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self {
            groups: Arc::new(DashMap::new()),
        }
    }

    /// Add a member to a group, replacing any previous sender for the same
    /// member id (one logical connection per user).
    pub fn join(&self, group: &str, member: &str, sender: ClientSender) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(member.to_string(), sender);
        tracing::debug!(group = group, member = member, "Joined group");
    }

    /// Remove a member from a group. Empty groups are dropped.
    pub fn leave(&self, group: &str, member: &str) {
        if let Some(mut entry) = self.groups.get_mut(group) {
            entry.remove(member);
            drop(entry);
            // Conditional removal under the shard lock: a join landing after
            // the drop keeps the group alive.
            self.groups.remove_if(group, |_, members| members.is_empty());
            tracing::debug!(group = group, member = member, "Left group");
        }
    }

    /// Publish a message to every member of a group.
    /// Returns the number of members it was handed to.
    pub fn publish(&self, group: &str, message: &ServerMessage) -> usize {
        self.publish_inner(group, None, message)
    }

    /// Publish to every member except one (the sender of a relayed signal
    /// never hears its own message back).
    pub fn publish_except(&self, group: &str, excluded: &str, message: &ServerMessage) -> usize {
        self.publish_inner(group, Some(excluded), message)
    }

    fn publish_inner(
        &self,
        group: &str,
        excluded: Option<&str>,
        message: &ServerMessage,
    ) -> usize {
        let Some(entry) = self.groups.get(group) else {
            return 0;
        };

        let mut delivered = 0;
        for (member, sender) in entry.iter() {
            if excluded == Some(member.as_str()) {
                continue;
            }
            if sender.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Current member ids of a group.
    pub fn members(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .map(|entry| entry.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, group: &str, member: &str) -> bool {
        self.groups
            .get(group)
            .map(|entry| entry.contains_key(member))
            .unwrap_or(false)
    }

    pub fn member_count(&self, group: &str) -> usize {
        self.groups.get(group).map(|entry| entry.len()).unwrap_or(0)
    }

    /// Every group a member currently belongs to.
    pub fn groups_of(&self, member: &str) -> Vec<String> {
        self.groups
            .iter()
            .filter(|entry| entry.value().contains_key(member))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove a member from all groups (connection teardown).
    /// Returns the groups that were left.
    pub fn leave_all(&self, member: &str) -> Vec<String> {
        let names = self.groups_of(member);
        for group in &names {
            self.leave(group, member);
        }
        names
    }

    /// Number of distinct groups with at least one member.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of `call:` rooms with at least one member.
    pub fn active_room_count(&self) -> usize {
        self.groups
            .iter()
            .filter(|entry| entry.key().starts_with("call:"))
            .count()
    }

    /// Number of users with a registered personal group (live connections).
    pub fn online_user_count(&self) -> usize {
        self.groups
            .iter()
            .filter(|entry| entry.key().starts_with("user:"))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (ClientSender, mpsc::UnboundedReceiver<ServerMessage>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_group_names() {
        assert_eq!(user_group("alice"), "user:alice");
        assert_eq!(call_group("call_abc123"), "call:call_abc123");
        assert_eq!(call_id_of("call:call_abc123"), Some("call_abc123"));
        assert_eq!(call_id_of("user:alice"), None);
    }

    #[test]
    fn test_join_and_publish() {
        let registry = GroupRegistry::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();

        registry.join("call:c1", "alice", tx_a);
        registry.join("call:c1", "bob", tx_b);

        let delivered = registry.publish("call:c1", &ServerMessage::Pong);
        assert_eq!(delivered, 2);
        assert!(matches!(rx_a.try_recv(), Ok(ServerMessage::Pong)));
        assert!(matches!(rx_b.try_recv(), Ok(ServerMessage::Pong)));
    }

    #[test]
    fn test_publish_except_excludes_sender() {
        let registry = GroupRegistry::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();

        registry.join("call:c1", "alice", tx_a);
        registry.join("call:c1", "bob", tx_b);

        let delivered = registry.publish_except("call:c1", "alice", &ServerMessage::Pong);
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(matches!(rx_b.try_recv(), Ok(ServerMessage::Pong)));
    }

    #[test]
    fn test_publish_to_empty_group() {
        let registry = GroupRegistry::new();
        assert_eq!(registry.publish("call:nope", &ServerMessage::Pong), 0);
    }

    #[test]
    fn test_leave_drops_empty_groups() {
        let registry = GroupRegistry::new();
        let (tx, _rx) = channel();

        registry.join("call:c1", "alice", tx);
        assert_eq!(registry.group_count(), 1);

        registry.leave("call:c1", "alice");
        assert_eq!(registry.group_count(), 0);
        assert!(!registry.is_member("call:c1", "alice"));
    }

    #[test]
    fn test_members_and_groups_of() {
        let registry = GroupRegistry::new();
        let (tx, _rx) = channel();

        registry.join("user:alice", "alice", tx.clone());
        registry.join("call:c1", "alice", tx.clone());
        registry.join("call:c2", "alice", tx);

        let mut groups = registry.groups_of("alice");
        groups.sort();
        assert_eq!(groups, vec!["call:c1", "call:c2", "user:alice"]);

        assert_eq!(registry.members("call:c1"), vec!["alice"]);
        assert_eq!(registry.active_room_count(), 2);
        assert_eq!(registry.online_user_count(), 1);
    }

    #[test]
    fn test_leave_all() {
        let registry = GroupRegistry::new();
        let (tx, _rx) = channel();

        registry.join("user:alice", "alice", tx.clone());
        registry.join("call:c1", "alice", tx);

        let mut left = registry.leave_all("alice");
        left.sort();
        assert_eq!(left, vec!["call:c1", "user:alice"]);
        assert_eq!(registry.group_count(), 0);
    }

    #[test]
    fn test_join_racing_last_leave_keeps_membership() {
        // A join landing while the last member's leave is mid-flight must
        // survive: the empty-group removal is conditional, so it cannot
        // discard a member inserted after the leave's shard lock dropped.
        let registry = GroupRegistry::new();
        for _ in 0..200 {
            let (tx_a, _rx_a) = channel();
            registry.join("call:c1", "alice", tx_a);

            let joiner = {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let (tx_b, rx_b) = mpsc::unbounded_channel();
                    registry.join("call:c1", "bob", tx_b);
                    rx_b
                })
            };
            registry.leave("call:c1", "alice");
            let mut rx_b = joiner.join().unwrap();

            assert!(registry.is_member("call:c1", "bob"));
            assert_eq!(registry.publish("call:c1", &ServerMessage::Pong), 1);
            assert!(matches!(rx_b.try_recv(), Ok(ServerMessage::Pong)));
            registry.leave("call:c1", "bob");
        }
        assert_eq!(registry.group_count(), 0);
    }

    #[test]
    fn test_rejoin_replaces_sender() {
        let registry = GroupRegistry::new();
        let (tx_old, mut rx_old) = channel();
        let (tx_new, mut rx_new) = channel();

        registry.join("user:alice", "alice", tx_old);
        registry.join("user:alice", "alice", tx_new);

        registry.publish("user:alice", &ServerMessage::Pong);
        assert!(rx_old.try_recv().is_err());
        assert!(matches!(rx_new.try_recv(), Ok(ServerMessage::Pong)));
        assert_eq!(registry.member_count("user:alice"), 1);
    }

    #[test]
    fn test_closed_receiver_not_counted() {
        let registry = GroupRegistry::new();
        let (tx, rx) = channel();
        registry.join("user:alice", "alice", tx);
        drop(rx);

        assert_eq!(registry.publish("user:alice", &ServerMessage::Pong), 0);
    }
}

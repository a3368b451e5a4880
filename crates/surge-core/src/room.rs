//! The addressable session directory.
//!
//! The room composes the bijective id map, the channel membership index,
//! and the user ownership index into one directory that request handlers
//! resolve recipients against. All resolution is process-local; cross-node
//! discovery goes through the presence distributor, which the room feeds
//! on login, channel membership changes, and teardown.

use std::sync::atomic::{AtomicI64, Ordering};

use surge_protocol::{ConnectionId, UserId};
use surge_transport::{ClientGroup, ClientHandle};
use tracing::debug;

use crate::index::{OwnerIndex, PairIndex, SetIndex};
use crate::presence::{self, DistributorHandle};

/// The session directory of one server process.
pub struct Room {
    connections: PairIndex<ConnectionId, ClientHandle>,
    channels: SetIndex<ClientHandle, String>,
    users: OwnerIndex<UserId, ClientHandle>,
    next_id: AtomicI64,
    presence: Option<DistributorHandle>,
}

impl Room {
    /// A room without distributed presence.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: PairIndex::new(),
            channels: SetIndex::new(),
            users: OwnerIndex::new(true),
            next_id: AtomicI64::new(0),
            presence: None,
        }
    }

    /// A room that publishes presence through the given distributor.
    #[must_use]
    pub fn with_presence(handle: DistributorHandle) -> Self {
        Self {
            presence: Some(handle),
            ..Self::new()
        }
    }

    // Ids are process-lifetime only: monotonically increasing, never
    // reused, never zero (zero means "unassigned").
    fn alloc_id(&self) -> ConnectionId {
        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if id == 0 {
            id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        }
        id
    }

    /// Register a freshly accepted connection and assign its id.
    pub fn add_connection(&self, cli: ClientHandle) -> ConnectionId {
        let id = self.alloc_id();
        cli.set_id(id);
        self.connections.put(id, cli);
        debug!(id, "connection registered");
        id
    }

    /// Link a connection to its authenticated user.
    ///
    /// Publishes presence for the connection id, and for the user id when
    /// this is the user's first connection on this node.
    pub fn login(&self, cli: &ClientHandle, uid: UserId) {
        let first = !self.users.contains_owner(&uid);
        self.users.add_members(&uid, std::slice::from_ref(cli));
        debug!(uid, id = cli.id(), "connection logged in");

        if let Some(p) = &self.presence {
            if let Some(id) = self.connections.get_by_value(cli) {
                p.register(presence::connection_key(id));
            }
            if first {
                p.register(presence::user_key(uid));
            }
        }
    }

    /// Unwind every index entry for a connection.
    ///
    /// Runs synchronously: once this returns, the connection is
    /// unresolvable through the room. Presence revocations for the
    /// connection key, any channel key whose local membership emptied, and
    /// the user key when the user's last local connection left, are
    /// submitted to the distributor.
    pub fn remove_connection(&self, cli: &ClientHandle) {
        let id = self.connections.remove_by_value(cli);
        let chans = self.channels.tags_of(cli).unwrap_or_default();
        self.channels.remove_key(cli);
        let uid = self.users.remove_member(cli);
        debug!(id, uid, "connection removed");

        if let Some(p) = &self.presence {
            if let Some(id) = id {
                p.unregister(presence::connection_key(id));
            }
            for chan in &chans {
                if !self.channels.contains_tag(chan.as_str()) {
                    p.unregister(presence::channel_key(chan));
                }
            }
            if let Some(uid) = uid {
                if !self.users.contains_owner(&uid) {
                    p.unregister(presence::user_key(uid));
                }
            }
        }
    }

    /// Add the connection to the named channels. Empty names are dropped.
    pub fn join_channels(&self, cli: &ClientHandle, chans: &[String]) {
        let chans: Vec<String> = chans.iter().filter(|c| !c.is_empty()).cloned().collect();
        if chans.is_empty() {
            return;
        }

        let newly_populated: Vec<String> = match &self.presence {
            Some(_) => chans
                .iter()
                .filter(|c| !self.channels.contains_tag(c.as_str()))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        self.channels.add_tags(cli, &chans);
        debug!(id = cli.id(), ?chans, "joined channels");

        if let Some(p) = &self.presence {
            for chan in newly_populated {
                p.register(presence::channel_key(&chan));
            }
        }
    }

    /// Remove the connection from the named channels.
    pub fn leave_channels(&self, cli: &ClientHandle, chans: &[String]) {
        self.channels.remove_tags(cli, chans);
        debug!(id = cli.id(), ?chans, "left channels");

        if let Some(p) = &self.presence {
            for chan in chans {
                if !chan.is_empty() && !self.channels.contains_tag(chan.as_str()) {
                    p.unregister(presence::channel_key(chan));
                }
            }
        }
    }

    /// Resolve one connection id.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<ClientHandle> {
        self.connections.get_by_key(&id)
    }

    /// Resolve many connection ids; misses contribute nothing.
    #[must_use]
    pub fn connections(&self, ids: &[ConnectionId]) -> ClientGroup {
        ClientGroup::new(self.connections.get_many(ids).into_iter().flatten().collect())
    }

    /// The id assigned to a registered connection.
    #[must_use]
    pub fn connection_id(&self, cli: &ClientHandle) -> Option<ConnectionId> {
        self.connections.get_by_value(cli)
    }

    /// The user a connection is logged in as.
    #[must_use]
    pub fn user_of(&self, cli: &ClientHandle) -> Option<UserId> {
        self.users.owner_of(cli)
    }

    /// Every connection of one user, or not-found when the user has none.
    #[must_use]
    pub fn connections_of_user(&self, uid: UserId) -> Option<ClientGroup> {
        self.users.members_of(&uid).map(ClientGroup::new)
    }

    /// Every connection of the given users; absent users contribute
    /// nothing.
    #[must_use]
    pub fn connections_of_users(&self, uids: &[UserId]) -> ClientGroup {
        ClientGroup::new(self.users.members_of_any(uids))
    }

    /// Every member of one channel, or not-found when the channel has
    /// none.
    #[must_use]
    pub fn channel_connections(&self, chan: &str) -> Option<ClientGroup> {
        self.channels.keys_of(chan).map(ClientGroup::new)
    }

    /// The concatenated members of several channels, once per channel.
    #[must_use]
    pub fn channels_connections(&self, chans: &[String]) -> ClientGroup {
        ClientGroup::new(self.channels.keys_of_any(chans))
    }

    /// Every registered connection (the liveness loop iterates this).
    #[must_use]
    pub fn all_connections(&self) -> Vec<ClientHandle> {
        self.connections.values()
    }

    /// Directory statistics.
    #[must_use]
    pub fn stats(&self) -> RoomStats {
        RoomStats {
            connection_count: self.connections.len(),
            user_count: self.users.all_owners().len(),
            channel_count: self.channels.all_tags().len(),
        }
    }
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory statistics.
#[derive(Debug, Clone)]
pub struct RoomStats {
    /// Number of registered connections.
    pub connection_count: usize,
    /// Number of users with at least one connection.
    pub user_count: usize,
    /// Number of channels with at least one member.
    pub channel_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::Op;
    use surge_transport::pipe;
    use tokio::sync::mpsc;

    fn new_client() -> ClientHandle {
        let (wire, _events) = pipe();
        let (ready_tx, _ready_rx) = mpsc::channel(16);
        ClientHandle::new(Box::new(wire), ready_tx)
    }

    fn room_with_ops() -> (Room, mpsc::Receiver<Op>) {
        let (tx, rx) = mpsc::channel(64);
        (Room::with_presence(DistributorHandle::new(tx)), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Op>) -> Vec<Op> {
        let mut ops = Vec::new();
        while let Ok(op) = rx.try_recv() {
            ops.push(op);
        }
        ops
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_nonzero() {
        let room = Room::new();
        let a = room.add_connection(new_client());
        let b = room.add_connection(new_client());

        assert_ne!(a, 0);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_login_and_resolution() {
        let room = Room::new();
        let cli = new_client();
        let id = room.add_connection(cli.clone());

        room.login(&cli, 100);

        assert_eq!(room.connection_id(&cli), Some(id));
        assert_eq!(room.user_of(&cli), Some(100));
        assert_eq!(room.connections_of_user(100).unwrap().len(), 1);
        assert_eq!(cli.id(), id);
    }

    #[tokio::test]
    async fn test_remove_connection_unwinds_everything() {
        let room = Room::new();
        let cli = new_client();
        let id = room.add_connection(cli.clone());
        room.login(&cli, 100);
        room.join_channels(&cli, &["news".to_string()]);

        room.remove_connection(&cli);

        assert!(room.connection(id).is_none());
        assert!(room.user_of(&cli).is_none());
        assert!(room.connections_of_user(100).is_none());
        assert!(room.channel_connections("news").is_none());

        // removing again is harmless
        room.remove_connection(&cli);
        assert_eq!(room.stats().connection_count, 0);
    }

    #[tokio::test]
    async fn test_join_filters_empty_channel_names() {
        let room = Room::new();
        let cli = new_client();
        room.add_connection(cli.clone());

        room.join_channels(&cli, &[String::new(), "news".to_string(), String::new()]);

        assert_eq!(room.stats().channel_count, 1);
        assert!(room.channel_connections("news").is_some());
        assert!(room.channel_connections("").is_none());
    }

    #[tokio::test]
    async fn test_resolution_skips_absent_targets() {
        let room = Room::new();
        let a = new_client();
        let b = new_client();
        let id_a = room.add_connection(a.clone());
        let id_b = room.add_connection(b.clone());
        room.login(&a, 100);
        room.login(&b, 200);

        let group = room.connections(&[id_a, 9999, id_b]);
        assert_eq!(group.len(), 2);

        let group = room.connections_of_users(&[100, 300]);
        assert_eq!(group.len(), 1);
    }

    #[tokio::test]
    async fn test_multi_channel_resolution_is_once_per_channel() {
        let room = Room::new();
        let cli = new_client();
        room.add_connection(cli.clone());
        room.join_channels(&cli, &["a".to_string(), "b".to_string()]);

        let group = room.channels_connections(&["a".to_string(), "b".to_string()]);
        assert_eq!(group.len(), 2);
    }

    #[tokio::test]
    async fn test_presence_published_on_login_and_join() {
        let (room, mut rx) = room_with_ops();
        let cli = new_client();
        let id = room.add_connection(cli.clone());

        room.login(&cli, 100);
        assert_eq!(
            drain(&mut rx),
            vec![
                Op::Register(format!("/ids/{id}")),
                Op::Register("/uids/100".to_string()),
            ]
        );

        room.join_channels(&cli, &["news".to_string()]);
        assert_eq!(drain(&mut rx), vec![Op::Register("/chans/news".to_string())]);

        // a second member of the same channel registers nothing new
        let other = new_client();
        room.add_connection(other.clone());
        room.join_channels(&other, &["news".to_string()]);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_presence_revoked_on_teardown() {
        let (room, mut rx) = room_with_ops();
        let a = new_client();
        let b = new_client();
        let id_a = room.add_connection(a.clone());
        room.add_connection(b.clone());
        room.login(&a, 100);
        room.login(&b, 100);
        room.join_channels(&a, &["news".to_string()]);
        room.join_channels(&b, &["news".to_string()]);
        drain(&mut rx);

        // user 100 and channel "news" still live through b
        room.remove_connection(&a);
        assert_eq!(
            drain(&mut rx),
            vec![Op::Unregister(format!("/ids/{id_a}"))]
        );

        // last connection: everything is revoked
        let id_b = room.connection_id(&b).unwrap();
        room.remove_connection(&b);
        assert_eq!(
            drain(&mut rx),
            vec![
                Op::Unregister(format!("/ids/{id_b}")),
                Op::Unregister("/chans/news".to_string()),
                Op::Unregister("/uids/100".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_leaving_last_member_revokes_channel_key() {
        let (room, mut rx) = room_with_ops();
        let cli = new_client();
        room.add_connection(cli.clone());
        room.join_channels(&cli, &["news".to_string()]);
        drain(&mut rx);

        room.leave_channels(&cli, &["news".to_string()]);
        assert_eq!(
            drain(&mut rx),
            vec![Op::Unregister("/chans/news".to_string())]
        );
    }
}

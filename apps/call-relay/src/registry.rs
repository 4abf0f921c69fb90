use std::collections::HashMap;

use crate::protocol::{ConnectionId, UserId};

/// What a `bind` displaced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Rebind {
    /// Connection that held the identifier before; it stays open but is no
    /// longer addressable under that identifier.
    pub detached: Option<ConnectionId>,
    /// Identifier the binding connection was registered under before, if it
    /// switched to a different one.
    pub released: Option<UserId>,
}

/// Bidirectional map between registered identifiers and live connections.
///
/// The registry holds no locks of its own; the router owns it behind the
/// relay-wide state lock so bind/resolve/unbind are linearizable.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    by_user: HashMap<UserId, ConnectionId>,
    by_connection: HashMap<ConnectionId, UserId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user` to `connection`, last writer wins.
    pub fn bind(&mut self, user: UserId, connection: ConnectionId) -> Rebind {
        let mut rebind = Rebind::default();

        if let Some(previous) = self.by_connection.remove(&connection) {
            if previous != user {
                self.by_user.remove(&previous);
                rebind.released = Some(previous);
            }
        }

        if let Some(old) = self.by_user.insert(user.clone(), connection) {
            if old != connection {
                self.by_connection.remove(&old);
                rebind.detached = Some(old);
            }
        }
        self.by_connection.insert(connection, user);

        rebind
    }

    pub fn resolve(&self, user: &UserId) -> Option<ConnectionId> {
        self.by_user.get(user).copied()
    }

    /// Identifier currently bound to `connection`.
    pub fn identity_of(&self, connection: ConnectionId) -> Option<&UserId> {
        self.by_connection.get(&connection)
    }

    /// Drop whatever entry `connection` owns and hand back the freed
    /// identifier. Unknown or already-detached connections are a no-op.
    pub fn unbind_by_handle(&mut self, connection: ConnectionId) -> Option<UserId> {
        let user = self.by_connection.remove(&connection)?;
        self.by_user.remove(&user);
        Some(user)
    }

    pub fn len(&self) -> usize {
        self.by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }
}

//! Registry of live WebSocket connections, keyed by user.
//!
//! A user may hold several connections (tabs, devices). Presence flips to
//! online when the first one opens and to offline when the last one closes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use carechat_shared::protocol::{PresenceUpdate, ServerFrame};
use carechat_shared::types::{PresenceStatus, UserId};

pub type ConnectionId = u64;

#[derive(Clone, Default)]
pub struct Hub {
    connections: Arc<Mutex<HashMap<UserId, HashMap<ConnectionId, mpsc::UnboundedSender<ServerFrame>>>>>,
    away: Arc<Mutex<HashSet<UserId>>>,
    next_id: Arc<AtomicU64>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection for `user`. Announces the user as online if this is
    /// their first connection.
    ///
    /// Returns the presence of everyone else, taken under the same lock so a
    /// user connecting concurrently is either in the snapshot or announced.
    pub async fn register(
        &self,
        user: &UserId,
        tx: mpsc::UnboundedSender<ServerFrame>,
    ) -> (ConnectionId, Vec<PresenceUpdate>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut connections = self.connections.lock().await;
        let away = self.away.lock().await;

        let snapshot = connections
            .keys()
            .filter(|u| *u != user)
            .map(|u| PresenceUpdate {
                user_id: u.clone(),
                status: if away.contains(u) {
                    PresenceStatus::Away
                } else {
                    PresenceStatus::Online
                },
            })
            .collect();

        let entry = connections.entry(user.clone()).or_default();
        let first = entry.is_empty();
        entry.insert(id, tx);

        if first {
            info!(user = %user, "User online");
            fan_out_except(&connections, user, presence(user, PresenceStatus::Online));
        }
        debug!(user = %user, conn = id, "Connection registered");
        (id, snapshot)
    }

    /// Drop a connection. Announces the user as offline when it was their last.
    pub async fn unregister(&self, user: &UserId, id: ConnectionId) {
        let mut connections = self.connections.lock().await;
        let Some(entry) = connections.get_mut(user) else {
            return;
        };
        entry.remove(&id);
        debug!(user = %user, conn = id, "Connection unregistered");

        if entry.is_empty() {
            connections.remove(user);
            self.away.lock().await.remove(user);
            info!(user = %user, "User offline");
            fan_out_except(&connections, user, presence(user, PresenceStatus::Offline));
        }
    }

    /// Deliver `frame` to every connection of `user`. Returns how many
    /// connections accepted it.
    pub async fn send_to(&self, user: &UserId, frame: ServerFrame) -> usize {
        let connections = self.connections.lock().await;
        connections
            .get(user)
            .map(|conns| {
                conns
                    .values()
                    .filter(|tx| tx.send(frame.clone()).is_ok())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Mark a connected user away or back and tell everyone else. Repeats
    /// and users without a connection are ignored.
    pub async fn set_away(&self, user: &UserId, away: bool) {
        let connections = self.connections.lock().await;
        if !connections.contains_key(user) {
            return;
        }
        let mut away_set = self.away.lock().await;
        let changed = if away {
            away_set.insert(user.clone())
        } else {
            away_set.remove(user)
        };
        if !changed {
            return;
        }
        let status = if away {
            PresenceStatus::Away
        } else {
            PresenceStatus::Online
        };
        debug!(user = %user, ?status, "Presence changed");
        fan_out_except(&connections, user, presence(user, status));
    }

    /// Users with at least one open connection, except `exclude`.
    #[cfg(test)]
    pub async fn online_users(&self, exclude: &UserId) -> Vec<UserId> {
        let connections = self.connections.lock().await;
        connections
            .keys()
            .filter(|u| *u != exclude)
            .cloned()
            .collect()
    }
}

fn presence(user: &UserId, status: PresenceStatus) -> ServerFrame {
    ServerFrame::UserStatusChange(PresenceUpdate {
        user_id: user.clone(),
        status,
    })
}

fn fan_out_except(
    connections: &HashMap<UserId, HashMap<ConnectionId, mpsc::UnboundedSender<ServerFrame>>>,
    exclude: &UserId,
    frame: ServerFrame,
) {
    for (user, conns) in connections {
        if user == exclude {
            continue;
        }
        for tx in conns.values() {
            let _ = tx.send(frame.clone());
        }
    }
}

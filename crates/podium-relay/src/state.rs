//! Relay shared state: rooms keyed by session name.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use podium_core::config::Config;

use crate::rate_limit::RateLimiter;

/// Shared relay state accessible from all connections and handlers.
pub struct RelayState {
    pub bind: String,
    pub port: u16,
    pub max_payload_bytes: usize,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    rooms: RwLock<HashMap<String, Room>>,
}

/// Peers of one session, keyed by connection id.
#[derive(Default)]
struct Room {
    peers: HashMap<String, mpsc::UnboundedSender<String>>,
}

impl RelayState {
    pub fn new(config: &Config) -> Self {
        let rate_limiter = config
            .max_connections_per_ip()
            .map(|max| Arc::new(RateLimiter::new(max)));

        Self {
            bind: config.relay_bind(),
            port: config.relay_port(),
            max_payload_bytes: config.max_payload_bytes(),
            rate_limiter,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn join(&self, session: &str, conn_id: &str, tx: mpsc::UnboundedSender<String>) {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(session.to_string()).or_default();
        room.peers.insert(conn_id.to_string(), tx);
        debug!(%session, %conn_id, peers = room.peers.len(), "Peer joined");
    }

    /// Remove a peer; the room goes away with its last peer.
    pub async fn leave(&self, session: &str, conn_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(session) {
            room.peers.remove(conn_id);
            if room.peers.is_empty() {
                rooms.remove(session);
                debug!(%session, "Room closed");
            }
        }
    }

    /// Send `text` to every peer in `session` except `from`. Returns how many
    /// peers it reached. Peers whose channel is gone are dropped.
    pub async fn forward(&self, session: &str, from: &str, text: &str) -> usize {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(session) else {
            return 0;
        };
        let mut delivered = 0;
        room.peers.retain(|conn_id, tx| {
            if conn_id == from {
                return true;
            }
            let alive = tx.send(text.to_string()).is_ok();
            if alive {
                delivered += 1;
            }
            alive
        });
        delivered
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.rooms
            .read()
            .await
            .values()
            .map(|room| room.peers.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forward_skips_sender() {
        let state = RelayState::new(&Config::default());
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        state.join("room", "a", a_tx).await;
        state.join("room", "b", b_tx).await;

        assert_eq!(state.forward("room", "a", "hello").await, 1);
        assert_eq!(b_rx.recv().await.as_deref(), Some("hello"));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let state = RelayState::new(&Config::default());
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        state.join("one", "a", a_tx).await;
        state.join("two", "b", b_tx).await;

        assert_eq!(state.forward("one", "a", "x").await, 0);
        assert!(b_rx.try_recv().is_err());
        assert_eq!(state.room_count().await, 2);
        assert_eq!(state.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_empty_room_is_removed() {
        let state = RelayState::new(&Config::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        state.join("room", "a", tx).await;
        state.leave("room", "a").await;
        assert_eq!(state.room_count().await, 0);
        // Leaving twice is fine.
        state.leave("room", "a").await;
    }

    #[tokio::test]
    async fn test_dead_peers_are_pruned() {
        let state = RelayState::new(&Config::default());
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        state.join("room", "a", a_tx).await;
        state.join("room", "b", b_tx).await;
        drop(b_rx);

        assert_eq!(state.forward("room", "a", "x").await, 0);
        assert_eq!(state.connection_count().await, 1);
    }

    #[test]
    fn test_defaults_from_config() {
        let state = RelayState::new(&Config::default());
        assert_eq!(state.port, 18790);
        assert_eq!(state.bind, "0.0.0.0");
        assert_eq!(state.max_payload_bytes, 65536);
        assert!(state.rate_limiter.is_none());
    }
}

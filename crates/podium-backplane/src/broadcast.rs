//! Same-device broadcast transport.
//!
//! A [`BroadcastHub`] is a registry of named `tokio::sync::broadcast`
//! channels. Backplanes built with the same hub and channel name see each
//! other's envelopes; a backplane never receives its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Shared;

const DEFAULT_CAPACITY: usize = 256;

/// One structured message on a broadcast channel.
#[derive(Debug, Clone)]
pub(crate) struct BroadcastFrame {
    pub(crate) origin: Uuid,
    pub(crate) data: Value,
}

/// Named broadcast channels shared by backplanes in one process.
#[derive(Clone)]
pub struct BroadcastHub {
    capacity: usize,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<BroadcastFrame>>>>,
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("capacity", &self.capacity)
            .field("channels", &self.channel_names())
            .finish()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Frames beyond `capacity` unread by a slow receiver are skipped for it.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn channel_names(&self) -> Vec<String> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn sender(&self, name: &str) -> broadcast::Sender<BroadcastFrame> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

/// Receive loop for one backplane's broadcast subscription.
pub(crate) async fn run(
    shared: Arc<Shared>,
    mut receiver: broadcast::Receiver<BroadcastFrame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = receiver.recv() => frame,
        };

        match frame {
            Ok(frame) if frame.origin == shared.instance_id() => {}
            Ok(frame) => shared.deliver_value(&frame.data),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Broadcast channel receiver lagged; envelopes dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Broadcast channel receive loop stopped");
}

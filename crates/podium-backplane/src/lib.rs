//! Realtime backplane: the transport layer under session sync.
//!
//! Three mutually exclusive transports, tried in order by [`RealtimeBackplane::connect`]:
//!
//! 1. `websocket`, when an endpoint is configured and the `websocket` feature
//!    is compiled in;
//! 2. `broadcast-channel`, a same-device bus shared through a [`BroadcastHub`];
//! 3. `none`, a legitimate terminal state in which every publish is dropped.
//!
//! Publishing is fire-and-forget. Everything received from any transport is
//! re-validated through [`podium_core::protocol::validate`] before it reaches
//! a subscriber.

pub mod broadcast;
#[cfg(feature = "websocket")]
mod websocket;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{broadcast as tokio_broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use podium_core::protocol::{SessionSyncEnvelope, validate, validate_text};

pub use broadcast::BroadcastHub;
use broadcast::BroadcastFrame;

/// Which transport the backplane settled on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Websocket,
    BroadcastChannel,
    #[default]
    None,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Websocket => "websocket",
            TransportKind::BroadcastChannel => "broadcast-channel",
            TransportKind::None => "none",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ready state of the websocket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Construction-time options. The endpoint is read once, here.
#[derive(Debug, Clone)]
pub struct BackplaneOptions {
    pub endpoint: Option<String>,
    pub hub: Option<BroadcastHub>,
    pub channel_name: String,
}

impl Default for BackplaneOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            hub: None,
            channel_name: "podium-session-sync".into(),
        }
    }
}

pub type SubscriptionId = u64;

/// Receiving end of a backplane subscription. Only validated envelopes arrive
/// here; the channel closes when the backplane is closed.
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::UnboundedReceiver<SessionSyncEnvelope>,
}

struct SocketLink {
    state: SocketState,
    out_tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct BackplaneState {
    connect_started: bool,
    transport: TransportKind,
    socket: Option<SocketLink>,
    channel: Option<tokio_broadcast::Sender<BroadcastFrame>>,
    cancel: Option<CancellationToken>,
    outbox: Vec<String>,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<SessionSyncEnvelope>)>,
}

pub(crate) struct Shared {
    instance_id: Uuid,
    endpoint: Option<String>,
    hub: Option<BroadcastHub>,
    channel_name: String,
    next_subscription: AtomicU64,
    state: Mutex<BackplaneState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BackplaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the socket to `next` unless the connection generation was closed.
    pub(crate) fn mark_socket(&self, cancel: &CancellationToken, next: SocketState) {
        let mut state = self.lock();
        if cancel.is_cancelled() {
            return;
        }
        if let Some(link) = state.socket.as_mut() {
            link.state = next;
        }
        if next == SocketState::Closed {
            // Anything still queued was never going to reach an open socket.
            state.outbox.clear();
        }
    }

    /// Flush the outbox in order and mark the socket open.
    pub(crate) fn open_socket(&self, cancel: &CancellationToken) -> bool {
        let mut guard = self.lock();
        if cancel.is_cancelled() {
            return false;
        }
        let state = &mut *guard;
        let Some(link) = state.socket.as_mut() else {
            return false;
        };
        let flushed = state.outbox.len();
        for text in state.outbox.drain(..) {
            let _ = link.out_tx.send(text);
        }
        link.state = SocketState::Open;
        debug!(flushed, "Realtime websocket open");
        true
    }

    pub(crate) fn deliver_text(&self, raw: &str) {
        match validate_text(raw) {
            Ok(envelope) => self.notify(envelope),
            Err(e) => debug!(code = %e.code, path = %e.path, "Dropping invalid inbound envelope"),
        }
    }

    pub(crate) fn deliver_value(&self, raw: &Value) {
        match validate(raw) {
            Ok(envelope) => self.notify(envelope),
            Err(e) => debug!(code = %e.code, path = %e.path, "Dropping invalid inbound envelope"),
        }
    }

    fn notify(&self, envelope: SessionSyncEnvelope) {
        let mut state = self.lock();
        state
            .subscribers
            .retain(|(_, tx)| tx.send(envelope.clone()).is_ok());
    }

    pub(crate) fn instance_id(&self) -> Uuid {
        self.instance_id
    }
}

/// Transport abstraction with fallback and outbound queueing.
///
/// Instances are independent: nothing is shared between two backplanes except
/// an explicitly passed [`BroadcastHub`].
#[derive(Clone)]
pub struct RealtimeBackplane {
    shared: Arc<Shared>,
}

impl RealtimeBackplane {
    pub fn new(options: BackplaneOptions) -> Self {
        let endpoint = options
            .endpoint
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());
        Self {
            shared: Arc::new(Shared {
                instance_id: Uuid::new_v4(),
                endpoint,
                hub: options.hub,
                channel_name: options.channel_name,
                next_subscription: AtomicU64::new(1),
                state: Mutex::new(BackplaneState::default()),
            }),
        }
    }

    /// Pick a transport. Idempotent: only the first call since construction
    /// (or since the last [`close`](Self::close)) does anything.
    pub fn connect(&self) -> TransportKind {
        let mut state = self.shared.lock();
        if state.connect_started {
            return state.transport;
        }
        state.connect_started = true;

        let Ok(runtime) = Handle::try_current() else {
            info!("No async runtime available; realtime transport disabled");
            state.transport = TransportKind::None;
            return TransportKind::None;
        };

        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());

        if self.try_websocket(&mut state, &runtime, &cancel) {
            return TransportKind::Websocket;
        }

        if let Some(hub) = &self.shared.hub {
            let sender = hub.sender(&self.shared.channel_name);
            let receiver = sender.subscribe();
            state.channel = Some(sender);
            state.transport = TransportKind::BroadcastChannel;
            runtime.spawn(broadcast::run(self.shared.clone(), receiver, cancel));
            info!(channel = %self.shared.channel_name, "Realtime transport: broadcast-channel");
            return TransportKind::BroadcastChannel;
        }

        info!("Realtime transport: none");
        state.transport = TransportKind::None;
        TransportKind::None
    }

    #[cfg(feature = "websocket")]
    fn try_websocket(
        &self,
        state: &mut BackplaneState,
        runtime: &Handle,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(endpoint) = &self.shared.endpoint else {
            return false;
        };
        let request = match websocket::client_request(endpoint) {
            Ok(request) => request,
            Err(reason) => {
                info!(%endpoint, %reason, "Realtime endpoint unusable; trying next transport");
                return false;
            }
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        state.socket = Some(SocketLink {
            state: SocketState::Connecting,
            out_tx,
        });
        state.transport = TransportKind::Websocket;
        runtime.spawn(websocket::run(
            self.shared.clone(),
            request,
            out_rx,
            cancel.clone(),
        ));
        info!(%endpoint, "Realtime transport: websocket");
        true
    }

    #[cfg(not(feature = "websocket"))]
    fn try_websocket(
        &self,
        _state: &mut BackplaneState,
        _runtime: &Handle,
        _cancel: &CancellationToken,
    ) -> bool {
        if self.shared.endpoint.is_some() {
            debug!("Built without websocket support; ignoring realtime endpoint");
        }
        false
    }

    /// Send an envelope. Returns `false` when it was dropped.
    ///
    /// While the websocket is still connecting the envelope is queued and
    /// flushed in order once the socket opens.
    pub fn publish(&self, envelope: &SessionSyncEnvelope) -> bool {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        match state.transport {
            TransportKind::Websocket => {
                let Some(link) = state.socket.as_ref() else {
                    return false;
                };
                if matches!(link.state, SocketState::Closing | SocketState::Closed) {
                    return false;
                }
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        debug!(%e, "Failed to serialize envelope");
                        return false;
                    }
                };
                if link.state == SocketState::Connecting {
                    state.outbox.push(text);
                    return true;
                }
                link.out_tx.send(text).is_ok()
            }
            TransportKind::BroadcastChannel => {
                let Some(sender) = state.channel.as_ref() else {
                    return false;
                };
                let data = match envelope.to_value() {
                    Ok(data) => data,
                    Err(e) => {
                        debug!(%e, "Failed to serialize envelope");
                        return false;
                    }
                };
                // Our own receiver keeps the channel alive, so this only
                // fails after close().
                sender
                    .send(BroadcastFrame {
                        origin: self.shared.instance_id,
                        data,
                    })
                    .is_ok()
            }
            TransportKind::None => false,
        }
    }

    /// Register a listener for validated inbound envelopes.
    pub fn subscribe(&self) -> Subscription {
        let id = self.shared.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (tx, receiver) = mpsc::unbounded_channel();
        self.shared.lock().subscribers.push((id, tx));
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.lock().subscribers.retain(|(sub, _)| *sub != id);
    }

    /// Tear everything down and return to the unconnected state. Safe to call
    /// repeatedly and after a failed connect.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        let previous = state.transport;
        *state = BackplaneState::default();
        debug!(transport = %previous, "Backplane closed");
    }

    pub fn transport(&self) -> TransportKind {
        self.shared.lock().transport
    }

    /// Websocket ready state, if the websocket transport is in use.
    pub fn socket_state(&self) -> Option<SocketState> {
        self.shared.lock().socket.as_ref().map(|link| link.state)
    }

    pub fn is_connect_started(&self) -> bool {
        self.shared.lock().connect_started
    }

    /// Envelopes waiting for the websocket to open.
    pub fn outbox_len(&self) -> usize {
        self.shared.lock().outbox.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }
}

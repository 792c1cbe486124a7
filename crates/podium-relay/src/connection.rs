//! Relay connection lifecycle: join a room, forward validated frames, leave.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use podium_core::protocol::{EnvelopeValidationError, SessionSyncEnvelope, validate_text};

use crate::rate_limit::Admission;
use crate::state::RelayState;

/// Why an inbound frame was not relayed.
#[derive(Debug)]
pub enum FrameRejection {
    Oversize { len: usize, limit: usize },
    Invalid(EnvelopeValidationError),
    Encode(serde_json::Error),
}

impl FrameRejection {
    pub fn label(&self) -> &'static str {
        match self {
            FrameRejection::Oversize { .. } => "oversize",
            FrameRejection::Invalid(_) => "invalid-envelope",
            FrameRejection::Encode(_) => "encode",
        }
    }
}

/// Validate one inbound text frame and return the envelope together with its
/// canonical re-serialization, which is what peers receive.
pub fn prepare_frame(
    text: &str,
    max_payload_bytes: usize,
) -> Result<(SessionSyncEnvelope, String), FrameRejection> {
    if text.len() > max_payload_bytes {
        return Err(FrameRejection::Oversize {
            len: text.len(),
            limit: max_payload_bytes,
        });
    }
    let envelope = validate_text(text).map_err(FrameRejection::Invalid)?;
    let canonical = envelope.to_json().map_err(FrameRejection::Encode)?;
    Ok((envelope, canonical))
}

/// Handle one peer connection on `/ws/{session}`. The rate-limit slot in
/// `admission` is held until the peer leaves.
pub async fn handle_relay_connection(
    state: Arc<RelayState>,
    ws: WebSocket,
    session: String,
    ip: IpAddr,
    admission: Option<Admission>,
) {
    let conn_id = Uuid::new_v4().to_string();
    info!(%conn_id, %session, %ip, "Peer connected");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel::<String>();
    state.join(&session, &conn_id, peer_tx).await;
    #[cfg(feature = "metrics")]
    crate::metrics::record_peer_join();

    let send_task = tokio::spawn(async move {
        while let Some(text) = peer_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                match prepare_frame(text.as_str(), state.max_payload_bytes) {
                    Ok((envelope, canonical)) => {
                        let fan_out = state.forward(&session, &conn_id, &canonical).await;
                        debug!(%conn_id, kind = %envelope.kind(), fan_out, "Relayed envelope");
                        #[cfg(feature = "metrics")]
                        crate::metrics::record_forward(envelope.kind().as_str(), fan_out);
                    }
                    Err(rejection) => {
                        match &rejection {
                            FrameRejection::Oversize { len, limit } => {
                                warn!(%conn_id, len, limit, "Dropping oversize frame");
                            }
                            FrameRejection::Invalid(e) => {
                                debug!(%conn_id, %e, "Dropping invalid envelope");
                            }
                            FrameRejection::Encode(e) => {
                                warn!(%conn_id, %e, "Failed to re-encode envelope");
                            }
                        }
                        #[cfg(feature = "metrics")]
                        crate::metrics::record_dropped(rejection.label());
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                debug!(%conn_id, "Ignoring binary frame");
            }
            Ok(Message::Close(_)) => {
                debug!(%conn_id, "Peer requested close");
                break;
            }
            Err(e) => {
                error!(%conn_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
    drop(admission);
    state.leave(&session, &conn_id).await;
    #[cfg(feature = "metrics")]
    crate::metrics::record_peer_leave();
    info!(%conn_id, %session, "Peer disconnected");
}

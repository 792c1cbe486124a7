//! Websocket transport: connect, flush the outbox, then pump frames both ways.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Shared, SocketState};

/// Build the handshake request, rejecting anything that is not a ws/wss URL.
pub(crate) fn client_request(endpoint: &str) -> Result<Request, String> {
    let request = endpoint
        .into_client_request()
        .map_err(|e| e.to_string())?;
    match request.uri().scheme_str() {
        Some("ws") | Some("wss") => Ok(request),
        other => Err(format!("unsupported scheme: {}", other.unwrap_or("<none>"))),
    }
}

pub(crate) async fn run(
    shared: Arc<Shared>,
    request: Request,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connect_async(request) => result,
    };

    let ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(%e, "Realtime websocket failed to connect");
            shared.mark_socket(&cancel, SocketState::Closed);
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = ws.split();

    if !shared.open_socket(&cancel) {
        let _ = ws_tx.close().await;
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.close().await;
                break;
            }
            outbound = out_rx.recv() => match outbound {
                Some(text) => {
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        warn!(%e, "Realtime websocket send failed");
                        break;
                    }
                }
                None => break,
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => shared.deliver_text(text.as_str()),
                Some(Ok(Message::Close(_))) => {
                    debug!("Realtime websocket closed by peer");
                    shared.mark_socket(&cancel, SocketState::Closing);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%e, "Realtime websocket error");
                    break;
                }
                None => break,
            },
        }
    }

    shared.mark_socket(&cancel, SocketState::Closed);
    debug!("Realtime websocket loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_request_accepts_ws_urls() {
        assert!(client_request("ws://127.0.0.1:18790/ws/room").is_ok());
        assert!(client_request("wss://relay.example.com/ws/room").is_ok());
    }

    #[test]
    fn test_client_request_rejects_other_schemes() {
        assert!(client_request("http://127.0.0.1/ws").is_err());
        assert!(client_request("not a url").is_err());
        assert!(client_request("").is_err());
    }
}

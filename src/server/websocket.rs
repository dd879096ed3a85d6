//! WebSocket adapters for the two HSM streams
//!
//! `/v1/hsm/node` carries a hosted node's signing requests and client
//! grants and is opened with the node's launch credential;
//! `/v1/hsm/signer` attaches a signer device for the same identity.
//! Frames are JSON text (binary frames holding JSON are accepted too). The
//! relay does the correlation; these handlers only translate.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::http::{AppState, DeviceAuth, NodeAuth};
use crate::auth::AuthenticatedNode;
use crate::hsm::{HsmRelay, NodeFrame, NodeStream, RelayFrame, SignerFrame};
use crate::types::KeyholeError;

/// GET /v1/hsm/node
pub async fn node_stream(
    State(state): State<Arc<AppState>>,
    NodeAuth(node): NodeAuth,
    ws: WebSocketUpgrade,
) -> Response {
    info!(node_id = %node.node_id(), "Node stream upgrade");
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| run_node_stream(socket, relay, node))
}

/// GET /v1/hsm/signer
pub async fn signer_stream(
    State(state): State<Arc<AppState>>,
    DeviceAuth(node): DeviceAuth,
    ws: WebSocketUpgrade,
) -> Response {
    info!(node_id = %node.node_id(), "Signer stream upgrade");
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| run_signer_stream(socket, relay, node))
}

fn decode<T: DeserializeOwned>(message: &Message) -> Option<Result<T, KeyholeError>> {
    let parsed = match message {
        Message::Text(text) => serde_json::from_str(text),
        Message::Binary(bytes) => serde_json::from_slice(bytes),
        _ => return None,
    };
    Some(parsed.map_err(|e| KeyholeError::BadRequest(format!("invalid frame: {}", e))))
}

async fn send_json<T: serde::Serialize>(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &T,
) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            error!("Failed to encode frame: {}", e);
            false
        }
    }
}

async fn run_node_stream(socket: WebSocket, relay: HsmRelay, node: AuthenticatedNode) {
    let stream = relay.open_node_stream(&node);
    let (mut sink, mut source) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RelayFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if !send_json(&mut sink, &frame).await {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(Message::Close(_)) => break,
            Ok(message) => message,
            Err(e) => {
                debug!(node_id = %node.node_id(), "Node socket error: {}", e);
                break;
            }
        };

        let frame = match decode::<NodeFrame>(&message) {
            None => continue,
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                let _ = out_tx.send(RelayFrame::error(None, &e));
                continue;
            }
        };

        handle_node_frame(&stream, frame, &out_tx);
    }

    stream.close();
    drop(out_tx);
    if let Err(e) = writer.await {
        warn!("Node stream writer failed: {}", e);
    }
}

/// Act on one node frame. Every request eventually produces exactly one
/// frame on `out`, echoing the node's tag.
fn handle_node_frame(
    stream: &NodeStream,
    frame: NodeFrame,
    out: &mpsc::UnboundedSender<RelayFrame>,
) {
    match frame {
        NodeFrame::Request {
            tag,
            dbid,
            capabilities,
            raw,
        } => match stream.submit(dbid, capabilities, raw) {
            Ok(pending) => {
                let request_id = pending.request_id();
                let out = out.clone();
                tokio::spawn(async move {
                    let frame = match pending.await {
                        Ok(raw) => RelayFrame::Response {
                            tag,
                            request_id,
                            raw,
                        },
                        Err(e) => RelayFrame::error(Some(tag), &e),
                    };
                    let _ = out.send(frame);
                });
            }
            Err(e) => {
                let _ = out.send(RelayFrame::error(Some(tag), &e));
            }
        },
        NodeFrame::Grant { dbid, capabilities } => {
            if let Err(e) = stream.grant_client(dbid, capabilities) {
                let _ = out.send(RelayFrame::error(None, &e));
            }
        }
    }
}

async fn run_signer_stream(socket: WebSocket, relay: HsmRelay, node: AuthenticatedNode) {
    let mut session = relay.attach_signer(&node);
    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            request = session.next_request() => {
                let Some(request) = request else {
                    info!(node_id = %node.node_id(), "Signer request stream ended");
                    break;
                };
                if !send_json(&mut sink, &SignerFrame::Request(request)).await {
                    break;
                }
            }
            message = source.next() => {
                let message = match message {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!(node_id = %node.node_id(), "Signer socket error: {}", e);
                        break;
                    }
                };
                match decode::<SignerFrame>(&message) {
                    None => {}
                    Some(Ok(SignerFrame::Response(response))) => {
                        // Duplicates are logged by the relay and go no further
                        let _ = session.submit_response(response);
                    }
                    Some(Ok(SignerFrame::Request(_))) => {
                        warn!(node_id = %node.node_id(), "Signer sent a request frame, ignoring");
                    }
                    Some(Err(e)) => {
                        warn!(node_id = %node.node_id(), "Bad signer frame: {}", e);
                    }
                }
            }
        }
    }

    let _ = sink.close().await;
}

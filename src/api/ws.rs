//! Live observer endpoint
//!
//! On connect the observer receives a snapshot of every node, then one
//! message per node update. Observers may report liveness they measured
//! themselves with `status_update` messages.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

use super::routes::ApiState;
use crate::liveness::LivenessProbe;
use crate::registry::NodeRegistry;
use crate::types::{ClientMessage, StatusReport};

/// GET /ws - Upgrade to a live observer connection
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serve one observer until either side closes.
///
/// A forwarder task drains the subscriber queue into the socket while this
/// task reads client messages. Whichever ends first tears down the other.
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut subscriber = state.broadcaster.subscribe();
    let id = subscriber.id;

    let mut forwarder = tokio::spawn(async move {
        while let Some(message) = subscriber.receiver.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(subscriber = id, "Failed to encode update: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::Text(text)).await {
                debug!(subscriber = id, "WebSocket send failed: {}", e);
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            _ = &mut forwarder => break,
            msg = ws_receiver.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                handle_text_message(&text, &state.registry, &state.liveness, id);
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(subscriber = id, "WebSocket receive error: {}", e);
                break;
            }
        }
    }

    forwarder.abort();
    state.broadcaster.unsubscribe(id);
}

/// Apply one inbound observer message. Returns true if it changed a node.
fn handle_text_message(
    text: &str,
    registry: &NodeRegistry,
    liveness: &LivenessProbe,
    subscriber: u64,
) -> bool {
    let report = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::StatusUpdate(report)) => report,
        Err(e) => {
            debug!(subscriber, "Ignoring observer message: {}", e);
            return false;
        }
    };

    apply_status_report(&report, registry, liveness, subscriber)
}

fn apply_status_report(
    report: &StatusReport,
    registry: &NodeRegistry,
    liveness: &LivenessProbe,
    subscriber: u64,
) -> bool {
    if !registry.contains(&report.ip) {
        warn!(subscriber, ip = %report.ip, "Status update for unknown node");
        return false;
    }

    debug!(
        subscriber,
        ip = %report.ip,
        is_online = report.is_online,
        latency = ?report.latency,
        "Observer status update"
    );
    liveness
        .record_and_publish(&report.ip, report.is_online, false)
        .is_some()
}

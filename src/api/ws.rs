// =============================================================================
// Realtime Push Channel — /ws/realtime
// =============================================================================
//
// Protocol:
//   client → server: {"action": "subscribe" | "unsubscribe", "symbols": [..]}
//   server → client: {"type": "quote" | "status" | "error" | "subscribed" |
//                     "unsubscribed", "data": ..., "message"?: ...}
//
// On connect the server emits the current market status. A subscribe is
// acknowledged and immediately followed by an on-demand quote per symbol;
// afterwards the periodic broadcaster supplies updates. On disconnect the
// sink is removed from every symbol.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::realtime::clock;
use crate::realtime::hub::PushEnvelope;

#[derive(Debug, Deserialize)]
struct ClientCommand {
    action: String,
    #[serde(default)]
    symbols: Vec<String>,
}

// =============================================================================
// Upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("realtime WebSocket connection accepted, upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

// =============================================================================
// Connection lifecycle
// =============================================================================

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let hub = &state.realtime.hub;
    let (sink_id, sink_tx, mut sink_rx) = hub.register_sink();

    // The connection opens with the current market status.
    let status = PushEnvelope::Status {
        data: clock::current_market_status(),
    };
    if send_envelope(&mut sender, &status).await.is_err() {
        hub.remove_sink(&sink_id);
        return;
    }

    loop {
        tokio::select! {
            // ── Broadcaster deliveries ──────────────────────────────
            envelope = sink_rx.recv() => {
                match envelope {
                    Some(envelope) => {
                        if send_envelope(&mut sender, &envelope).await.is_err() {
                            debug!(%sink_id, "push send failed, disconnecting");
                            break;
                        }
                    }
                    None => break,
                }
            }

            // ── Client commands ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_command(&state, sink_id, &sink_tx, &text).await;
                        if send_envelope(&mut sender, &reply).await.is_err() {
                            break;
                        }

                        // Acked subscribes are primed with an immediate quote
                        // per symbol before the broadcaster takes over.
                        if let PushEnvelope::Subscribed { data } = &reply {
                            for symbol in data {
                                let envelope = match state.realtime.get_quote(symbol).await {
                                    Ok(quote) => PushEnvelope::Quote { data: quote },
                                    Err(e) => PushEnvelope::Error {
                                        message: format!("quote fetch for {symbol} failed: {e}"),
                                    },
                                };
                                if send_envelope(&mut sender, &envelope).await.is_err() {
                                    hub.remove_sink(&sink_id);
                                    return;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(%sink_id, "close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(%sink_id, error = %e, "receive error, disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    hub.remove_sink(&sink_id);
    info!(%sink_id, "realtime connection closed, sink cleaned up");
}

// =============================================================================
// Commands
// =============================================================================

async fn handle_command(
    state: &Arc<AppState>,
    sink_id: crate::realtime::SinkId,
    sink_tx: &tokio::sync::mpsc::Sender<PushEnvelope>,
    text: &str,
) -> PushEnvelope {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(cmd) => cmd,
        Err(e) => {
            return PushEnvelope::Error {
                message: format!("malformed command: {e}"),
            }
        }
    };

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for raw in &command.symbols {
        match crate::symbol::canonicalize(raw) {
            Ok(sym) => accepted.push(sym),
            Err(_) => rejected.push(raw.clone()),
        }
    }
    if !rejected.is_empty() {
        return PushEnvelope::Error {
            message: format!("invalid symbols: {}", rejected.join(", ")),
        };
    }
    if accepted.is_empty() {
        return PushEnvelope::Error {
            message: "symbols must not be empty".to_string(),
        };
    }

    let hub = &state.realtime.hub;
    match command.action.as_str() {
        "subscribe" => {
            for symbol in &accepted {
                hub.subscribe(symbol, sink_id, sink_tx.clone());
            }
            PushEnvelope::Subscribed { data: accepted }
        }
        "unsubscribe" => {
            for symbol in &accepted {
                hub.unsubscribe(symbol, &sink_id);
            }
            PushEnvelope::Unsubscribed { data: accepted }
        }
        other => PushEnvelope::Error {
            message: format!("unknown action '{other}'"),
        },
    }
}

async fn send_envelope<S>(sender: &mut S, envelope: &PushEnvelope) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(envelope) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            // Serialisation failures are ours, not the socket's.
            warn!(error = %e, "failed to serialise push envelope");
            Ok(())
        }
    }
}

// src/live/socket.rs
// WebSocket endpoint: handshake check, then pump the hub's outbox into the socket.

use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::live::{LiveHub, Outbound, Subscription};

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
}

/// `/ws?clientId=...`
pub fn router(hub: LiveHub) -> Router {
    Router::new().route("/ws", get(connect)).with_state(hub)
}

async fn connect(
    State(hub): State<LiveHub>,
    Query(params): Query<ConnectParams>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(client_id) = params
        .client_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
    else {
        tracing::warn!("rejecting live connection without clientId");
        return (StatusCode::UNAUTHORIZED, "ClientId required").into_response();
    };

    match upgrade {
        Ok(ws) => ws
            .on_upgrade(move |socket| serve_client(socket, hub, client_id))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn serve_client(socket: WebSocket, hub: LiveHub, client_id: String) {
    let Subscription {
        conn_id, mut outbox, ..
    } = hub.open(&client_id).await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            out = outbox.recv() => {
                let frame = match out {
                    Some(Outbound::Message(msg)) => match serde_json::to_string(&msg) {
                        Ok(json) => Message::Text(json.into()),
                        Err(e) => {
                            tracing::warn!(client_id, error = %e, "failed to encode live message");
                            continue;
                        }
                    },
                    Some(Outbound::Ping) => Message::Ping(Bytes::new()),
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    tracing::debug!(client_id, error = %e, "send failed, dropping client");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Pong(_))) => hub.mark_alive(&client_id, conn_id),
                Some(Ok(Message::Close(_))) | None => break,
                // Inbound payloads carry no meaning.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(client_id, error = %e, "socket error");
                    break;
                }
            }
        }
    }

    hub.close(&client_id, conn_id);
}

//! Per-connection signaling loop.
//!
//! One socket serves one room session: the room key comes from the upgrade
//! query (falling back to the connection id, so a key-less client gets a
//! private room), requests are handled sequentially in arrival order, and a
//! disconnect, clean or not, closes the session.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SignalError;
use crate::session::ResourceKind;
use crate::state::AppState;
use peerscope_protocol::{AnalysisEvent, ClientRequest, ServerMessage, SignalRequest};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    room: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.room))
}

/// Room keys become registry keys and file names; keep them boring.
fn valid_room_key(room: &str) -> bool {
    !room.is_empty()
        && room.len() <= 64
        && room
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn handle_socket(socket: WebSocket, state: AppState, room: Option<String>) {
    let connection_id = Uuid::new_v4();
    let room = room.unwrap_or_else(|| connection_id.to_string());
    let (mut sender, mut receiver) = socket.split();

    if !valid_room_key(&room) {
        tracing::warn!(%connection_id, "rejected invalid room key");
        let _ = sender
            .send(Message::Text(
                serde_json::to_string(&ServerMessage::Error {
                    request_id: None,
                    code: "invalidRoom".to_string(),
                    message: "room keys are limited to 64 alphanumeric characters".to_string(),
                })
                .unwrap()
                .into(),
            ))
            .await;
        return;
    }

    if let Err(e) = state.sessions.connect(&room).await {
        tracing::error!(%room, error = %e, "failed to create session");
        let _ = sender
            .send(Message::Text(
                serde_json::to_string(&ServerMessage::Error {
                    request_id: None,
                    code: e.code().to_string(),
                    message: e.to_string(),
                })
                .unwrap()
                .into(),
            ))
            .await;
        return;
    }

    tracing::info!(%room, %connection_id, "connected");

    // Outbound channel; one task forwards everything to the socket.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(ServerMessage::SessionReady {
        room: room.clone(),
        connection_id,
    });

    // Analysis events ride the same socket as pushed messages.
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<AnalysisEvent>();
    let event_out = tx.clone();
    let event_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if event_out
                .send(ServerMessage::AnalysisResult { event })
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let request: SignalRequest = match serde_json::from_str(&text) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::warn!(%room, error = %e, "unparseable signaling message");
                        let _ = tx.send(ServerMessage::Error {
                            request_id: None,
                            code: "badRequest".to_string(),
                            message: format!("invalid message: {e}"),
                        });
                        continue;
                    }
                };
                let reply = dispatch(&state, &room, request, &events_tx).await;
                if tx.send(reply).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(%room, %connection_id, error = %e, "websocket error");
                break;
            }
        }
    }

    state.sessions.close(&room).await;
    event_task.abort();
    send_task.abort();
    tracing::info!(%room, %connection_id, "disconnected");
}

async fn dispatch(
    state: &AppState,
    room: &str,
    request: SignalRequest,
    events: &mpsc::UnboundedSender<AnalysisEvent>,
) -> ServerMessage {
    let request_id = request.request_id;
    let sessions = &state.sessions;

    let result: Result<ServerMessage, SignalError> = match request.request {
        ClientRequest::GetRouterRtpCapabilities => sessions
            .router_rtp_capabilities(room)
            .await
            .map(|rtp_capabilities| ServerMessage::RouterRtpCapabilities {
                request_id,
                rtp_capabilities,
            }),
        ClientRequest::CreateProducerTransport => sessions
            .create_producer_transport(room)
            .await
            .map(|params| ServerMessage::TransportCreated { request_id, params }),
        ClientRequest::CreateConsumerTransport => sessions
            .create_consumer_transport(room)
            .await
            .map(|params| ServerMessage::TransportCreated { request_id, params }),
        ClientRequest::ConnectProducerTransport { dtls_parameters } => sessions
            .connect_transport(room, ResourceKind::ProducerTransport, dtls_parameters)
            .await
            .map(|()| ServerMessage::TransportConnected { request_id }),
        ClientRequest::ConnectConsumerTransport { dtls_parameters } => sessions
            .connect_transport(room, ResourceKind::ConsumerTransport, dtls_parameters)
            .await
            .map(|()| ServerMessage::TransportConnected { request_id }),
        ClientRequest::Produce {
            kind,
            rtp_parameters,
        } => sessions
            .produce(room, kind, rtp_parameters)
            .await
            .map(|id| ServerMessage::Produced { request_id, id }),
        ClientRequest::Consume { rtp_capabilities } => sessions
            .consume(room, rtp_capabilities)
            .await
            .map(|params| ServerMessage::Consumed { request_id, params }),
        ClientRequest::StartAnalysis => sessions
            .start_analysis(room, events.clone())
            .await
            .map(|start| ServerMessage::AnalysisStarted {
                request_id,
                consumer_id: start.consumer_id,
                already_active: start.already_active,
            }),
    };

    result.unwrap_or_else(|e| ServerMessage::Error {
        request_id: Some(request_id),
        code: e.code().to_string(),
        message: e.to_string(),
    })
}

//! Stream Hub (C8): the WebSocket upgrade that carries transmission audio
//! and channel presence events to subscribed participants.

use crate::AppState;
use aloft_agent::AgentEvent;
use aloft_identity::IdentityVerifier;
use aloft_store::participant;
use aloft_types::ConnectionQuality;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Extension, Path, Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IncomingMessage {
    Heartbeat,
    LocationUpdate {
        lat: f64,
        lon: f64,
        connection_quality: Option<String>,
    },
    QualityReport {
        connection_quality: String,
    },
    Emergency {
        content: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutgoingMessage {
    TransmissionStarted {
        session_id: String,
        user_id: String,
        username: String,
        audio_format: aloft_types::AudioFormat,
    },
    AudioChunk {
        session_id: String,
        sequence: u32,
        payload: String,
        timestamp_ms: u64,
    },
    TransmissionEnded {
        session_id: String,
        reason: String,
        total_duration_ms: u64,
    },
    ParticipantJoined {
        user_id: String,
        username: String,
    },
    ParticipantLeft {
        user_id: String,
        reason: String,
    },
    EmergencyAlert {
        user_id: String,
        username: String,
        content: Option<String>,
    },
    Error {
        message: String,
    },
}

/// Converts an agent broadcast into a wire message for `connection_user_id`,
/// suppressing the one event a subscriber must not see echoed: their own
/// audio chunk.
fn to_outgoing(event: AgentEvent, connection_user_id: &str) -> Option<OutgoingMessage> {
    match event {
        AgentEvent::TransmissionStarted { session_id, user_id, username, audio_format } => {
            Some(OutgoingMessage::TransmissionStarted { session_id, user_id, username, audio_format })
        }
        AgentEvent::AudioChunk { session_id, sequence, payload, timestamp_ms, sender_user_id } => {
            if sender_user_id == connection_user_id {
                None
            } else {
                Some(OutgoingMessage::AudioChunk {
                    session_id,
                    sequence,
                    payload: STANDARD.encode(payload),
                    timestamp_ms,
                })
            }
        }
        AgentEvent::TransmissionEnded { session_id, reason, total_duration_ms } => {
            Some(OutgoingMessage::TransmissionEnded { session_id, reason, total_duration_ms })
        }
        AgentEvent::ParticipantJoined { user_id, username } => {
            Some(OutgoingMessage::ParticipantJoined { user_id, username })
        }
        AgentEvent::ParticipantLeft { user_id, reason } => {
            Some(OutgoingMessage::ParticipantLeft { user_id, reason })
        }
        AgentEvent::EmergencyAlert { user_id, username, content } => {
            Some(OutgoingMessage::EmergencyAlert { user_id, username, content })
        }
        AgentEvent::Error { message } => Some(OutgoingMessage::Error { message }),
    }
}

/// Upgrade handshake: verifies the credential (C1), the `access:{uuid}`
/// scope (C2), and that the subject is a current participant holding a
/// non-null ephemeral token, then hands the socket off to [`handle_socket`].
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<Arc<AppState>>,
    Path(uuid): Path<String>,
    Query(query): Query<WsQuery>,
    headers: axum::http::HeaderMap,
) -> Response {
    let uuid = match aloft_types::normalize_uuid(&uuid).filter(|u| aloft_types::is_valid_uuid_v4(u)) {
        Some(u) => u,
        None => return (StatusCode::BAD_REQUEST, "malformed channel uuid").into_response(),
    };

    let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let credential = IdentityVerifier::extract_credential(auth_header, query.token.as_deref());

    let claims = match state.identity.verify(credential.as_deref()).await {
        Ok(c) => c,
        Err(_) => return (StatusCode::UNAUTHORIZED, "invalid or expired credential").into_response(),
    };

    if !aloft_identity::permission::can_access_channel(&claims, &uuid) {
        return (StatusCode::FORBIDDEN, "no access scope for this channel").into_response();
    }

    let pool = state.pool.clone();
    let uuid_for_check = uuid.clone();
    let user_id = claims.sub.clone();
    let has_token = tokio::task::spawn_blocking(move || {
        let conn = pool.get().ok()?;
        let participants = participant::get_participants(&conn, &uuid_for_check).ok()?;
        Some(participants.iter().any(|p| p.user_id == user_id && p.ephemeral_push_token.is_some()))
    })
    .await;

    if !matches!(has_token, Ok(Some(true))) {
        return (StatusCode::FORBIDDEN, "not a participant with an active stream token").into_response();
    }

    let username = claims.username();
    ws.on_upgrade(move |socket| handle_socket(socket, state, uuid, claims.sub, username))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, channel_uuid: String, user_id: String, username: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let agent = state.agents.get_or_create(&channel_uuid);

    let (event_tx, mut event_rx) = mpsc::channel::<AgentEvent>(aloft_types::constants::STREAM_SEND_QUEUE_CAPACITY);
    agent.subscribe(&user_id, event_tx).await;

    let forward_user_id = user_id.clone();
    let mut forward_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Some(outgoing) = to_outgoing(event, &forward_user_id) {
                let Ok(text) = serde_json::to_string(&outgoing) else { continue };
                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            WsMessage::Text(text) => {
                let Ok(incoming) = serde_json::from_str::<IncomingMessage>(&text) else {
                    continue;
                };
                dispatch_incoming(&state, &agent, &channel_uuid, &user_id, &username, incoming).await;
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    // Disconnection removes the stream subscription but leaves channel
    // membership untouched — the pilot must call `leave` explicitly.
    agent.unsubscribe(&user_id).await;
    forward_task.abort();
}

async fn dispatch_incoming(
    state: &Arc<AppState>,
    agent: &aloft_agent::AgentHandle,
    channel_uuid: &str,
    user_id: &str,
    username: &str,
    incoming: IncomingMessage,
) {
    match incoming {
        IncomingMessage::Heartbeat => {
            agent.participant_seen(user_id, None).await;
        }
        IncomingMessage::LocationUpdate { lat, lon, connection_quality } => {
            let quality = connection_quality
                .as_deref()
                .and_then(ConnectionQuality::parse)
                .unwrap_or_default();
            let pool = state.pool.clone();
            let channel_uuid_owned = channel_uuid.to_string();
            let user_id_owned = user_id.to_string();
            let _ = tokio::task::spawn_blocking(move || -> Option<()> {
                let conn = pool.get().ok()?;
                participant::update_participant_location(
                    &conn,
                    &channel_uuid_owned,
                    &user_id_owned,
                    aloft_types::Coordinates { lat, lon },
                    quality,
                )
                .ok()
            })
            .await;
            agent.participant_seen(user_id, Some(quality)).await;
        }
        IncomingMessage::QualityReport { connection_quality } => {
            let quality = ConnectionQuality::parse(&connection_quality).unwrap_or_default();
            agent.participant_seen(user_id, Some(quality)).await;
        }
        IncomingMessage::Emergency { content } => {
            agent.emergency(user_id, username, content).await;
        }
    }
}

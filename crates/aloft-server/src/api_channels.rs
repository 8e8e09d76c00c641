//! Control API (C9): channel CRUD, membership, and transmission endpoints.
//! Every handler authenticates via the `Claims` inserted by
//! [`crate::middleware::auth_middleware`], authorizes via
//! [`aloft_identity::permission`], translates the URL into a store/cache/
//! agent call, and shapes the response with the common envelope.

use crate::envelope::{self, ApiError};
use crate::AppState;
use aloft_identity::permission;
use aloft_store::{channel, participant, StoreError};
use aloft_types::{
    AloftError, AudioFormat, ChannelType, Coordinates, DeviceInfo, Difficulty, NetworkQuality,
};
use axum::extract::{Path, Query};
use axum::response::Response;
use axum::{Extension, Json};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn normalize_path_uuid(raw: &str) -> Result<String, ApiError> {
    aloft_types::normalize_uuid(raw)
        .filter(|u| aloft_types::is_valid_uuid_v4(u))
        .ok_or_else(|| ApiError(AloftError::Invalid("malformed channel uuid".into())))
}

async fn db_conn(state: &AppState) -> Result<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>, ApiError> {
    state
        .pool
        .get()
        .map_err(|e| ApiError(AloftError::Unavailable(format!("database unavailable: {e}"))))
}

fn require_read(claims: &aloft_types::Claims) -> Result<(), ApiError> {
    if permission::can_read(claims) {
        Ok(())
    } else {
        Err(ApiError(AloftError::Forbidden("read:api scope required".into())))
    }
}

fn require_write(claims: &aloft_types::Claims) -> Result<(), ApiError> {
    if permission::can_write(claims) {
        Ok(())
    } else {
        Err(ApiError(AloftError::Forbidden("write:api scope required".into())))
    }
}

fn require_admin(claims: &aloft_types::Claims) -> Result<(), ApiError> {
    if permission::can_admin(claims) {
        Ok(())
    } else {
        Err(ApiError(AloftError::Forbidden("admin:api scope required".into())))
    }
}

fn require_channel_access(claims: &aloft_types::Claims, uuid: &str) -> Result<(), ApiError> {
    if permission::can_access_channel(claims, uuid) {
        Ok(())
    } else {
        Err(ApiError(AloftError::Forbidden(format!("no access scope for channel {uuid}"))))
    }
}

// ---------------------------------------------------------------------
// Channel CRUD
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListChannelsQuery {
    #[serde(rename = "type")]
    pub channel_type: Option<String>,
    pub active_only: Option<bool>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub radius_km: Option<f64>,
}

pub async fn list_channels(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Query(q): Query<ListChannelsQuery>,
) -> Result<Response, ApiError> {
    require_read(&claims)?;

    let channel_type = match &q.channel_type {
        Some(s) => Some(ChannelType::parse(s).ok_or_else(|| ApiError(AloftError::Invalid("unknown channel type".into())))?),
        None => None,
    };
    let near = match (q.lat, q.lon, q.radius_km) {
        (Some(lat), Some(lon), Some(radius_km)) => Some((Coordinates { lat, lon }, radius_km)),
        _ => None,
    };
    let filter = channel::ChannelFilter {
        channel_type,
        active_only: q.active_only.unwrap_or(false),
        near,
        is_admin: permission::can_admin(&claims),
    };

    let unfiltered = filter.channel_type.is_none() && !filter.active_only && filter.near.is_none();

    let listed = if unfiltered {
        let state_for_load = Arc::clone(&state);
        state
            .cache
            .get_list(async move {
                let conn = db_conn(&state_for_load).await?;
                let default_filter = channel::ChannelFilter::default();
                tokio::task::spawn_blocking(move || channel::list_channels(&conn, &default_filter))
                    .await
                    .map_err(|e| ApiError(AloftError::Unavailable(format!("task join error: {e}"))))?
                    .map_err(|e: StoreError| ApiError(e.into()))
            })
            .await?
    } else {
        let conn = db_conn(&state).await?;
        tokio::task::spawn_blocking(move || channel::list_channels(&conn, &filter))
            .await
            .map_err(|e| ApiError(AloftError::Unavailable(format!("task join error: {e}"))))?
            .map_err(|e| ApiError(e.into()))?
    };

    Ok(envelope::ok(listed))
}

pub async fn get_channel(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Path(uuid): Path<String>,
) -> Result<Response, ApiError> {
    require_read(&claims)?;
    let uuid = normalize_path_uuid(&uuid)?;

    let state_for_load = Arc::clone(&state);
    let uuid_for_load = uuid.clone();
    let found = state
        .cache
        .get_channel(&uuid, async move {
            let conn = db_conn(&state_for_load).await?;
            tokio::task::spawn_blocking(move || channel::get_channel(&conn, &uuid_for_load))
                .await
                .map_err(|e| ApiError(AloftError::Unavailable(format!("task join error: {e}"))))?
                .map_err(|e| ApiError(e.into()))
        })
        .await?;

    Ok(envelope::ok(found))
}

#[derive(Debug, Deserialize)]
pub struct CreateChannelBody {
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: Option<String>,
    pub description: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub radius_km: Option<f64>,
    pub vhf_frequency: Option<String>,
    pub max_participants: Option<u32>,
    pub difficulty: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateChannelWithUuidBody {
    pub uuid: String,
    #[serde(flatten)]
    pub channel: CreateChannelBody,
}

fn parse_create_body(body: CreateChannelBody) -> Result<channel::CreateChannelRequest, ApiError> {
    let channel_type = match &body.channel_type {
        Some(s) => Some(ChannelType::parse(s).ok_or_else(|| ApiError(AloftError::Invalid("unknown channel type".into())))?),
        None => None,
    };
    let difficulty = match &body.difficulty {
        Some(s) => Some(Difficulty::parse(s).ok_or_else(|| ApiError(AloftError::Invalid("unknown difficulty".into())))?),
        None => None,
    };
    Ok(channel::CreateChannelRequest {
        name: body.name,
        channel_type,
        description: body.description,
        coordinates: body.coordinates,
        radius_km: body.radius_km,
        vhf_frequency: body.vhf_frequency,
        max_participants: body.max_participants,
        difficulty,
    })
}

async fn finish_create(
    state: &Arc<AppState>,
    created: aloft_types::Channel,
) {
    state.cache.invalidate_list().await;
    state.registrar.notify_channel_created(&created.uuid, &created.name);
}

pub async fn create_channel(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Json(body): Json<CreateChannelBody>,
) -> Result<Response, ApiError> {
    require_write(&claims)?;

    let req = parse_create_body(body)?;
    if req.channel_type == Some(ChannelType::Emergency) {
        require_admin(&claims)?;
    }

    let conn = db_conn(&state).await?;
    let created_by = claims.sub.clone();
    let created = tokio::task::spawn_blocking(move || channel::create_channel(&conn, &req, &created_by))
        .await
        .map_err(|e| ApiError(AloftError::Unavailable(format!("task join error: {e}"))))?
        .map_err(|e| ApiError(e.into()))?;

    finish_create(&state, created.clone()).await;

    Ok(envelope::ok_with_status(axum::http::StatusCode::CREATED, created))
}

pub async fn create_channel_with_uuid(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Json(body): Json<CreateChannelWithUuidBody>,
) -> Result<Response, ApiError> {
    require_write(&claims)?;

    let uuid = body.uuid.clone();
    let req = parse_create_body(body.channel)?;
    if req.channel_type == Some(ChannelType::Emergency) {
        require_admin(&claims)?;
    }

    let conn = db_conn(&state).await?;
    let created_by = claims.sub.clone();
    let created = tokio::task::spawn_blocking(move || channel::create_channel_with_uuid(&conn, &req, &created_by, &uuid))
        .await
        .map_err(|e| ApiError(AloftError::Unavailable(format!("task join error: {e}"))))?
        .map_err(|e| ApiError(e.into()))?;

    finish_create(&state, created.clone()).await;

    Ok(envelope::ok_with_status(axum::http::StatusCode::CREATED, created))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateChannelBody {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub channel_type: Option<String>,
    pub description: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub radius_km: Option<f64>,
    pub vhf_frequency: Option<String>,
    pub max_participants: Option<u32>,
    pub difficulty: Option<String>,
}

pub async fn update_channel(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Path(uuid): Path<String>,
    Json(body): Json<UpdateChannelBody>,
) -> Result<Response, ApiError> {
    require_write(&claims)?;
    let uuid = normalize_path_uuid(&uuid)?;

    let channel_type = match &body.channel_type {
        Some(s) => Some(ChannelType::parse(s).ok_or_else(|| ApiError(AloftError::Invalid("unknown channel type".into())))?),
        None => None,
    };

    // Changing *to* emergency, or modifying a channel already of that type, both require admin.
    let needs_admin = channel_type == Some(ChannelType::Emergency) || {
        let conn = db_conn(&state).await?;
        let uuid_for_check = uuid.clone();
        tokio::task::spawn_blocking(move || channel::get_channel(&conn, &uuid_for_check))
            .await
            .map_err(|e| ApiError(AloftError::Unavailable(format!("task join error: {e}"))))?
            .map(|c| c.channel_type == ChannelType::Emergency)
            .unwrap_or(false)
    };
    if needs_admin {
        require_admin(&claims)?;
    }
    let difficulty = match &body.difficulty {
        Some(s) => Some(Difficulty::parse(s).ok_or_else(|| ApiError(AloftError::Invalid("unknown difficulty".into())))?),
        None => None,
    };
    let updates = channel::UpdateChannelRequest {
        name: body.name,
        channel_type,
        description: body.description,
        coordinates: body.coordinates,
        radius_km: body.radius_km,
        vhf_frequency: body.vhf_frequency,
        max_participants: body.max_participants,
        difficulty,
    };

    let conn = db_conn(&state).await?;
    let updated_by = claims.sub.clone();
    let uuid_for_update = uuid.clone();
    let updated = tokio::task::spawn_blocking(move || channel::update_channel(&conn, &uuid_for_update, &updates, &updated_by))
        .await
        .map_err(|e| ApiError(AloftError::Unavailable(format!("task join error: {e}"))))?
        .map_err(|e| ApiError(e.into()))?;

    state.cache.invalidate(&uuid).await;
    state.registrar.notify_channel_updated(&updated.uuid, &updated.name);

    Ok(envelope::ok(updated))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteChannelQuery {
    #[serde(default)]
    pub hard: bool,
}

pub async fn delete_channel(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Path(uuid): Path<String>,
    Query(q): Query<DeleteChannelQuery>,
) -> Result<Response, ApiError> {
    let uuid = normalize_path_uuid(&uuid)?;
    if q.hard {
        require_admin(&claims)?;
    } else {
        require_write(&claims)?;
    }

    let conn = db_conn(&state).await?;
    let uuid_for_delete = uuid.clone();
    let hard = q.hard;
    tokio::task::spawn_blocking(move || {
        if hard {
            channel::hard_delete_channel(&conn, &uuid_for_delete)
        } else {
            channel::soft_delete_channel(&conn, &uuid_for_delete)
        }
    })
    .await
    .map_err(|e| ApiError(AloftError::Unavailable(format!("task join error: {e}"))))?
    .map_err(|e| ApiError(e.into()))?;

    state.cache.invalidate(&uuid).await;
    if hard {
        state.registrar.notify_channel_hard_deleted(&uuid);
    }

    Ok(envelope::ok(serde_json::json!({ "uuid": uuid, "hard": hard })))
}

// ---------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct JoinChannelBody {
    pub location: Option<Coordinates>,
    pub device_info: Option<DeviceInfo>,
    pub push_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JoinChannelResponse {
    pub outcome: &'static str,
}

pub async fn join_channel(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Path(uuid): Path<String>,
    Json(body): Json<JoinChannelBody>,
) -> Result<Response, ApiError> {
    let uuid = normalize_path_uuid(&uuid)?;
    require_channel_access(&claims, &uuid)?;

    let conn = db_conn(&state).await?;
    let user_id = claims.sub.clone();
    let username = claims.username();
    let uuid_for_join = uuid.clone();
    let username_for_join = username.clone();
    let device_info = body.device_info.clone();
    let location = body.location;
    let outcome = tokio::task::spawn_blocking(move || {
        participant::join_channel(
            &conn,
            &uuid_for_join,
            &user_id,
            &username_for_join,
            location,
            device_info.as_ref(),
        )
    })
    .await
    .map_err(|e| ApiError(AloftError::Unavailable(format!("task join error: {e}"))))?
    .map_err(|e| ApiError(e.into()))?;

    if let Some(token) = &body.push_token {
        let conn = db_conn(&state).await?;
        let uuid_for_token = uuid.clone();
        let user_id = claims.sub.clone();
        let token = token.clone();
        tokio::task::spawn_blocking(move || {
            participant::update_participant_push_token(&conn, &uuid_for_token, &user_id, Some(&token))
        })
        .await
        .map_err(|e| ApiError(AloftError::Unavailable(format!("task join error: {e}"))))?
        .map_err(|e| ApiError(e.into()))?;
    }

    let agent = state.agents.get_or_create(&uuid);
    agent.participant_joined(&claims.sub, &username, body.push_token.clone()).await;

    let outcome_str = match outcome {
        participant::JoinOutcome::Joined => "joined",
        participant::JoinOutcome::Rejoined => "rejoined",
    };
    Ok(envelope::ok(JoinChannelResponse { outcome: outcome_str }))
}

pub async fn leave_channel(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Path(uuid): Path<String>,
) -> Result<Response, ApiError> {
    let uuid = normalize_path_uuid(&uuid)?;
    require_channel_access(&claims, &uuid)?;

    let conn = db_conn(&state).await?;
    let user_id = claims.sub.clone();
    let uuid_for_leave = uuid.clone();
    tokio::task::spawn_blocking(move || participant::leave_channel(&conn, &uuid_for_leave, &user_id))
        .await
        .map_err(|e| ApiError(AloftError::Unavailable(format!("task join error: {e}"))))?
        .map_err(|e| ApiError(e.into()))?;

    if let Some(agent) = state.agents.get(&uuid) {
        agent.participant_left(&claims.sub).await;
    }

    Ok(envelope::ok(serde_json::json!({ "left": true })))
}

pub async fn list_participants(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Path(uuid): Path<String>,
) -> Result<Response, ApiError> {
    let uuid = normalize_path_uuid(&uuid)?;
    require_channel_access(&claims, &uuid)?;

    let conn = db_conn(&state).await?;
    let uuid_for_list = uuid.clone();
    let participants = tokio::task::spawn_blocking(move || participant::get_participants(&conn, &uuid_for_list))
        .await
        .map_err(|e| ApiError(AloftError::Unavailable(format!("task join error: {e}"))))?
        .map_err(|e| ApiError(e.into()))?;

    Ok(envelope::ok(participants))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTokenBody {
    pub token: Option<String>,
}

pub async fn update_push_token(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Path(uuid): Path<String>,
    Json(body): Json<UpdateTokenBody>,
) -> Result<Response, ApiError> {
    let uuid = normalize_path_uuid(&uuid)?;
    require_channel_access(&claims, &uuid)?;

    let conn = db_conn(&state).await?;
    let user_id = claims.sub.clone();
    let token = body.token.clone();
    tokio::task::spawn_blocking(move || {
        participant::update_participant_push_token(&conn, &uuid, &user_id, token.as_deref())
    })
    .await
    .map_err(|e| ApiError(AloftError::Unavailable(format!("task join error: {e}"))))?
    .map_err(|e| ApiError(e.into()))?;

    Ok(envelope::ok(serde_json::json!({ "updated": true })))
}

// ---------------------------------------------------------------------
// Transmissions
// ---------------------------------------------------------------------
//
// Routing note: `chunk`/`end` address a session by its opaque session_id
// path segment, not a channel UUID. The id embeds the channel UUID
// (`ptt_{channel_uuid}_{user_id}_{start_ms}_{rand}`) purely so the Control
// API knows which agent to dispatch to; the agent itself remains the sole
// authority on whether that session is actually active.

fn resolve_session_channel(session_id: &str) -> Result<String, ApiError> {
    aloft_types::channel_uuid_from_session_id(session_id)
        .and_then(aloft_types::normalize_uuid)
        .filter(|u| aloft_types::is_valid_uuid_v4(u))
        .ok_or_else(|| ApiError(AloftError::Invalid("malformed session_id".into())))
}

#[derive(Debug, Deserialize)]
pub struct PttStartBody {
    pub channel_uuid: String,
    pub audio_format: String,
    pub sample_rate: u32,
    pub bitrate: Option<u32>,
    pub network_quality: Option<String>,
}

pub async fn ptt_start(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Json(body): Json<PttStartBody>,
) -> Result<Response, ApiError> {
    let uuid = normalize_path_uuid(&body.channel_uuid)?;
    require_write(&claims)?;
    require_channel_access(&claims, &uuid)?;

    let audio_format = AudioFormat::parse(&body.audio_format)
        .ok_or_else(|| ApiError(AloftError::Invalid("unknown audio format".into())))?;
    let network_quality = match &body.network_quality {
        Some(s) => NetworkQuality::parse(s).ok_or_else(|| ApiError(AloftError::Invalid("unknown network quality".into())))?,
        None => NetworkQuality::Good,
    };

    let agent = state.agents.get_or_create(&uuid);
    let response = agent
        .ptt_start(
            &claims.sub,
            &claims.username(),
            aloft_agent::PttStartRequest {
                audio_format,
                sample_rate: body.sample_rate,
                bitrate: body.bitrate,
                network_quality,
            },
        )
        .await
        .map_err(ApiError)?;

    Ok(envelope::ok_with_status(axum::http::StatusCode::CREATED, response))
}

#[derive(Debug, Deserialize)]
pub struct PttChunkBody {
    pub session_id: String,
    pub chunk_sequence: u32,
    pub audio_data: String,
    pub chunk_size_bytes: usize,
    pub timestamp_ms: u64,
}

pub async fn ptt_chunk(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Path(session_id): Path<String>,
    Json(body): Json<PttChunkBody>,
) -> Result<Response, ApiError> {
    if body.session_id != session_id {
        return Err(ApiError(AloftError::Invalid("session_id path and body disagree".into())));
    }
    let uuid = resolve_session_channel(&session_id)?;
    require_write(&claims)?;
    require_channel_access(&claims, &uuid)?;

    let payload = STANDARD
        .decode(&body.audio_data)
        .map_err(|_| ApiError(AloftError::Invalid("malformed base64 payload".into())))?;

    let agent = state
        .agents
        .get(&uuid)
        .ok_or_else(|| ApiError(AloftError::NotFound("session not found".into())))?;
    let response = agent
        .ptt_chunk(aloft_agent::PttChunkRequest {
            session_id,
            sender_user_id: claims.sub.clone(),
            chunk_sequence: body.chunk_sequence,
            payload,
            declared_size_bytes: body.chunk_size_bytes,
            timestamp_ms: body.timestamp_ms,
        })
        .await
        .map_err(ApiError)?;

    Ok(envelope::ok(response))
}

#[derive(Debug, Deserialize)]
pub struct PttEndBody {
    pub session_id: String,
    pub total_duration_ms: u64,
    pub final_location: Option<Coordinates>,
    pub reason: Option<String>,
}

pub async fn ptt_end(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Path(session_id): Path<String>,
    Json(body): Json<PttEndBody>,
) -> Result<Response, ApiError> {
    if body.session_id != session_id {
        return Err(ApiError(AloftError::Invalid("session_id path and body disagree".into())));
    }
    let uuid = resolve_session_channel(&session_id)?;
    require_write(&claims)?;
    require_channel_access(&claims, &uuid)?;

    let agent = state
        .agents
        .get(&uuid)
        .ok_or_else(|| ApiError(AloftError::NotFound("session not found".into())))?;
    let response = agent
        .ptt_end(aloft_agent::PttEndRequest {
            session_id,
            user_id: claims.sub.clone(),
            total_duration_ms: body.total_duration_ms,
            reason: body.reason,
        })
        .await
        .map_err(ApiError)?;

    if let Some(location) = body.final_location {
        let conn = db_conn(&state).await?;
        let uuid_for_location = uuid.clone();
        let user_id = claims.sub.clone();
        let quality = aloft_types::ConnectionQuality::default();
        let _ = tokio::task::spawn_blocking(move || {
            participant::update_participant_location(&conn, &uuid_for_location, &user_id, location, quality)
        })
        .await;
    }

    Ok(envelope::ok(response))
}

pub async fn ptt_active(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<aloft_types::Claims>,
    Path(channel_uuid): Path<String>,
) -> Result<Response, ApiError> {
    let uuid = normalize_path_uuid(&channel_uuid)?;
    require_channel_access(&claims, &uuid)?;

    let snapshot = match state.agents.get(&uuid) {
        Some(agent) => agent.ptt_status().await,
        None => None,
    };

    Ok(envelope::ok(snapshot))
}

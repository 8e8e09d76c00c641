use crate::StoreError;
use aloft_types::{
    constants, is_valid_uuid_v4, is_valid_vhf_frequency, normalize_uuid, Channel, ChannelType,
    Coordinates, Difficulty,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

/// Request body for `createChannel` / `createChannelWithUuid`.
#[derive(Debug, Clone, Default)]
pub struct CreateChannelRequest {
    pub name: String,
    pub channel_type: Option<ChannelType>,
    pub description: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub radius_km: Option<f64>,
    pub vhf_frequency: Option<String>,
    pub max_participants: Option<u32>,
    pub difficulty: Option<Difficulty>,
}

fn validate_create(req: &CreateChannelRequest) -> Result<(), StoreError> {
    if req.name.trim().is_empty() {
        return Err(StoreError::Invalid("name is required".into()));
    }
    let Some(_) = req.channel_type else {
        return Err(StoreError::Invalid("type is required".into()));
    };
    if let Some(coords) = &req.coordinates {
        if !coords.in_range() {
            return Err(StoreError::Invalid("coordinates out of range".into()));
        }
    }
    if let Some(freq) = &req.vhf_frequency {
        if !is_valid_vhf_frequency(freq) {
            return Err(StoreError::Invalid("malformed VHF frequency".into()));
        }
    }
    if let Some(max) = req.max_participants {
        if !(1..=100).contains(&max) {
            return Err(StoreError::Invalid(
                "max_participants must be between 1 and 100".into(),
            ));
        }
    }
    Ok(())
}

/// Creates a channel with a server-generated UUID.
pub fn create_channel(
    conn: &Connection,
    req: &CreateChannelRequest,
    created_by: &str,
) -> Result<Channel, StoreError> {
    let uuid = Uuid::new_v4().to_string().to_ascii_lowercase();
    insert_channel(conn, &uuid, req, created_by)
}

/// Creates a channel with a caller-supplied UUID. Fails if the UUID is
/// malformed or already taken (after lowercasing).
pub fn create_channel_with_uuid(
    conn: &Connection,
    req: &CreateChannelRequest,
    created_by: &str,
    uuid: &str,
) -> Result<Channel, StoreError> {
    let lower = normalize_uuid(uuid)
        .ok_or_else(|| StoreError::Invalid("malformed uuid".into()))?;
    if !is_valid_uuid_v4(&lower) {
        return Err(StoreError::Invalid("malformed uuid".into()));
    }
    if get_channel_row(conn, &lower)?.is_some() {
        return Err(StoreError::ChannelExists(lower));
    }
    insert_channel(conn, &lower, req, created_by)
}

fn insert_channel(
    conn: &Connection,
    uuid: &str,
    req: &CreateChannelRequest,
    created_by: &str,
) -> Result<Channel, StoreError> {
    validate_create(req)?;
    let channel_type = req.channel_type.expect("validated above");
    let now = Utc::now();
    let radius_km = req.radius_km.unwrap_or(constants::DEFAULT_RADIUS_KM);
    let max_participants = req
        .max_participants
        .unwrap_or(constants::DEFAULT_MAX_PARTICIPANTS);

    conn.execute(
        "INSERT INTO channels (
            uuid, name, channel_type, description, lat, lon, radius_km,
            vhf_frequency, max_participants, difficulty, active, created_at, created_by
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?12)",
        params![
            uuid,
            req.name,
            channel_type.as_str(),
            req.description,
            req.coordinates.map(|c| c.lat),
            req.coordinates.map(|c| c.lon),
            radius_km,
            req.vhf_frequency,
            max_participants,
            req.difficulty.map(|d| d.as_str()),
            now.to_rfc3339(),
            created_by,
        ],
    )?;

    crate::event::log_event(
        conn,
        uuid,
        None,
        None,
        aloft_types::EventType::ChannelCreated,
        None,
        None,
    )?;

    get_channel_row(conn, uuid)?.ok_or_else(|| StoreError::ChannelNotFound(uuid.to_string()))
}

/// Fetches a single channel by (already-normalized) UUID.
pub fn get_channel(conn: &Connection, uuid: &str) -> Result<Channel, StoreError> {
    get_channel_row(conn, uuid)?.ok_or_else(|| StoreError::ChannelNotFound(uuid.to_string()))
}

fn get_channel_row(conn: &Connection, uuid: &str) -> Result<Option<Channel>, StoreError> {
    conn.query_row(SELECT_CHANNEL, [uuid], map_row_to_channel)
        .optional()
        .map_err(StoreError::from)
}

/// Filter parameters for `listChannels`.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    pub channel_type: Option<ChannelType>,
    pub active_only: bool,
    pub near: Option<(Coordinates, f64)>,
    pub is_admin: bool,
}

/// A channel plus the rollup stats shown in the list/detail views.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ListedChannel {
    #[serde(flatten)]
    pub channel: Channel,
    pub stats: ChannelStats,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct ChannelStats {
    pub participants_today: u32,
    pub transmissions_today: u32,
    pub avg_duration_ms: f64,
    pub last_activity: Option<chrono::DateTime<Utc>>,
}

/// Lists channels, applying type/active/proximity filters. Emergency channels
/// sort first; ties break by name (Unicode code-point ascending), then UUID.
pub fn list_channels(conn: &Connection, filter: &ChannelFilter) -> Result<Vec<ListedChannel>, StoreError> {
    let mut stmt = conn.prepare(&format!("{SELECT_CHANNEL_BASE} ORDER BY uuid ASC"))?;
    let rows = stmt.query_map([], map_row_to_channel)?;

    let radius_cap = if filter.is_admin {
        f64::INFINITY
    } else {
        constants::MAX_PROXIMITY_RADIUS_KM_NON_ADMIN
    };

    let mut channels = Vec::new();
    for row in rows {
        let channel = row?;
        if let Some(t) = filter.channel_type {
            if channel.channel_type != t {
                continue;
            }
        }
        if filter.active_only && !channel.active {
            continue;
        }
        if let Some((origin, radius)) = &filter.near {
            let Some(coords) = channel.coordinates else {
                continue;
            };
            let effective_radius = radius.min(radius_cap);
            if origin.distance_km(&coords) > effective_radius {
                continue;
            }
        }
        let stats = channel_stats(conn, &channel.uuid)?;
        channels.push(ListedChannel { channel, stats });
    }

    channels.sort_by(|a, b| {
        let a_emergency = a.channel.channel_type.is_emergency();
        let b_emergency = b.channel.channel_type.is_emergency();
        b_emergency
            .cmp(&a_emergency)
            .then_with(|| a.channel.name.cmp(&b.channel.name))
            .then_with(|| a.channel.uuid.cmp(&b.channel.uuid))
    });

    Ok(channels)
}

fn channel_stats(conn: &Connection, uuid: &str) -> Result<ChannelStats, StoreError> {
    let today_start = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc()
        .to_rfc3339();

    let participants_today: u32 = conn.query_row(
        "SELECT COUNT(*) FROM channel_participants WHERE channel_uuid = ?1 AND join_time >= ?2",
        params![uuid, today_start],
        |r| r.get(0),
    )?;

    let transmissions_today: u32 = conn.query_row(
        "SELECT COUNT(*) FROM transmission_history WHERE channel_uuid = ?1 AND start_time >= ?2",
        params![uuid, today_start],
        |r| r.get(0),
    )?;

    let avg_duration_ms: f64 = conn
        .query_row(
            "SELECT AVG((julianday(end_time) - julianday(start_time)) * 86400000.0)
             FROM transmission_history
             WHERE channel_uuid = ?1 AND end_time IS NOT NULL",
            [uuid],
            |r| r.get(0),
        )
        .unwrap_or(Some(0.0))
        .unwrap_or(0.0);

    let last_activity: Option<String> = conn
        .query_row(
            "SELECT MAX(timestamp) FROM channel_messages WHERE channel_uuid = ?1",
            [uuid],
            |r| r.get(0),
        )
        .optional()?
        .flatten();

    Ok(ChannelStats {
        participants_today,
        transmissions_today,
        avg_duration_ms,
        last_activity: last_activity
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
    })
}

/// Partial update for `updateChannel`. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateChannelRequest {
    pub name: Option<String>,
    pub channel_type: Option<ChannelType>,
    pub description: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub radius_km: Option<f64>,
    pub vhf_frequency: Option<String>,
    pub max_participants: Option<u32>,
    pub difficulty: Option<Difficulty>,
}

/// Updates a channel with a single atomic `UPDATE` statement. Only `Some`
/// fields in `updates` are modified, avoiding a read-modify-write race.
pub fn update_channel(
    conn: &Connection,
    uuid: &str,
    updates: &UpdateChannelRequest,
    updated_by: &str,
) -> Result<Channel, StoreError> {
    if let Some(freq) = &updates.vhf_frequency {
        if !is_valid_vhf_frequency(freq) {
            return Err(StoreError::Invalid("malformed VHF frequency".into()));
        }
    }
    if let Some(coords) = &updates.coordinates {
        if !coords.in_range() {
            return Err(StoreError::Invalid("coordinates out of range".into()));
        }
    }
    if let Some(max) = updates.max_participants {
        if !(1..=100).contains(&max) {
            return Err(StoreError::Invalid(
                "max_participants must be between 1 and 100".into(),
            ));
        }
    }

    let mut set_parts: Vec<String> = vec!["updated_at = ?1".into(), "updated_by = ?2".into()];
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
        Box::new(Utc::now().to_rfc3339()),
        Box::new(updated_by.to_string()),
    ];
    let mut idx = 3usize;

    macro_rules! set_field {
        ($col:literal, $val:expr) => {{
            set_parts.push(format!("{} = ?{}", $col, idx));
            values.push(Box::new($val));
            idx += 1;
        }};
    }

    if let Some(name) = &updates.name {
        set_field!("name", name.clone());
    }
    if let Some(t) = updates.channel_type {
        set_field!("channel_type", t.as_str().to_string());
    }
    if let Some(desc) = &updates.description {
        set_field!("description", desc.clone());
    }
    if let Some(coords) = &updates.coordinates {
        set_field!("lat", coords.lat);
        set_field!("lon", coords.lon);
    }
    if let Some(radius) = updates.radius_km {
        set_field!("radius_km", radius);
    }
    if let Some(freq) = &updates.vhf_frequency {
        set_field!("vhf_frequency", freq.clone());
    }
    if let Some(max) = updates.max_participants {
        set_field!("max_participants", max);
    }
    if let Some(diff) = updates.difficulty {
        set_field!("difficulty", diff.as_str().to_string());
    }

    let sql = format!(
        "UPDATE channels SET {} WHERE uuid = ?{}",
        set_parts.join(", "),
        idx
    );
    values.push(Box::new(uuid.to_string()));

    let bound: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let count = conn.execute(&sql, bound.as_slice())?;
    if count == 0 {
        return Err(StoreError::ChannelNotFound(uuid.to_string()));
    }

    crate::event::log_event(
        conn,
        uuid,
        None,
        None,
        aloft_types::EventType::ChannelUpdated,
        None,
        None,
    )?;

    get_channel(conn, uuid)
}

/// Soft-deletes a channel: sets `active = false`, preserving participants
/// and history.
pub fn soft_delete_channel(conn: &Connection, uuid: &str) -> Result<(), StoreError> {
    let count = conn.execute(
        "UPDATE channels SET active = 0, updated_at = ?1 WHERE uuid = ?2",
        params![Utc::now().to_rfc3339(), uuid],
    )?;
    if count == 0 {
        return Err(StoreError::ChannelNotFound(uuid.to_string()));
    }
    crate::event::log_event(
        conn,
        uuid,
        None,
        None,
        aloft_types::EventType::ChannelDeleted,
        None,
        None,
    )?;
    Ok(())
}

/// Hard-deletes a channel and cascades to its participants and history.
/// A `channel_hard_deleted` event is deliberately not logged — the event
/// row itself would be removed by the cascade.
pub fn hard_delete_channel(conn: &Connection, uuid: &str) -> Result<(), StoreError> {
    let count = conn.execute("DELETE FROM channels WHERE uuid = ?1", [uuid])?;
    if count == 0 {
        return Err(StoreError::ChannelNotFound(uuid.to_string()));
    }
    Ok(())
}

const SELECT_CHANNEL_BASE: &str = "SELECT
    uuid, name, channel_type, description, lat, lon, radius_km,
    vhf_frequency, max_participants, difficulty, active, created_at, created_by,
    updated_at, updated_by
FROM channels";

const SELECT_CHANNEL: &str = "SELECT
    uuid, name, channel_type, description, lat, lon, radius_km,
    vhf_frequency, max_participants, difficulty, active, created_at, created_by,
    updated_at, updated_by
FROM channels WHERE uuid = ?1";

fn map_row_to_channel(row: &Row) -> rusqlite::Result<Channel> {
    let channel_type_str: String = row.get(2)?;
    let channel_type = ChannelType::parse(&channel_type_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(2, "channel_type".into(), rusqlite::types::Type::Text)
    })?;

    let lat: Option<f64> = row.get(4)?;
    let lon: Option<f64> = row.get(5)?;
    let coordinates = match (lat, lon) {
        (Some(lat), Some(lon)) => Some(Coordinates { lat, lon }),
        _ => None,
    };

    let difficulty_str: Option<String> = row.get(9)?;
    let difficulty = difficulty_str.and_then(|s| Difficulty::parse(&s));

    let active: bool = row.get(10)?;

    let created_at: String = row.get(11)?;
    let updated_at: Option<String> = row.get(13)?;

    Ok(Channel {
        uuid: row.get(0)?,
        name: row.get(1)?,
        channel_type,
        description: row.get(3)?,
        coordinates,
        radius_km: row.get(6)?,
        vhf_frequency: row.get(7)?,
        max_participants: row.get(8)?,
        difficulty,
        active,
        created_at: parse_rfc3339(&created_at),
        created_by: row.get(12)?,
        updated_at: updated_at.map(|s| parse_rfc3339(&s)),
        updated_by: row.get(14)?,
    })
}

fn parse_rfc3339(s: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

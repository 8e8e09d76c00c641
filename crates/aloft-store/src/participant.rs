use crate::StoreError;
use aloft_types::{ConnectionQuality, Coordinates, DeviceInfo, Participant};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Outcome of a `join_channel` call. Joining an already-joined channel is
/// idempotent: it refreshes `last_seen` rather than erroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Rejoined,
}

/// Adds `user_id` to `channel_uuid`, enforcing `max_participants`. Rejoining
/// a channel the user already belongs to refreshes presence instead of
/// failing, matching how a flaky mobile connection reconnects.
pub fn join_channel(
    conn: &Connection,
    channel_uuid: &str,
    user_id: &str,
    username: &str,
    location: Option<Coordinates>,
    device_info: Option<&DeviceInfo>,
) -> Result<JoinOutcome, StoreError> {
    let max_participants: u32 = conn
        .query_row(
            "SELECT max_participants FROM channels WHERE uuid = ?1",
            [channel_uuid],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::ChannelNotFound(channel_uuid.to_string()))?;

    let already_joined: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM channel_participants WHERE channel_uuid = ?1 AND user_id = ?2)",
        params![channel_uuid, user_id],
        |r| r.get(0),
    )?;

    let now = Utc::now().to_rfc3339();

    if already_joined {
        conn.execute(
            "UPDATE channel_participants SET last_seen = ?1, username = ?2, lat = ?3, lon = ?4
             WHERE channel_uuid = ?5 AND user_id = ?6",
            params![
                now,
                username,
                location.map(|c| c.lat),
                location.map(|c| c.lon),
                channel_uuid,
                user_id,
            ],
        )?;
        return Ok(JoinOutcome::Rejoined);
    }

    let current_count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM channel_participants WHERE channel_uuid = ?1",
        [channel_uuid],
        |r| r.get(0),
    )?;
    if current_count >= max_participants {
        return Err(StoreError::ChannelFull);
    }

    conn.execute(
        "INSERT INTO channel_participants (
            channel_uuid, user_id, username, join_time, last_seen, lat, lon,
            connection_quality, is_transmitting, device_os, os_version, app_version, user_agent
        ) VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, 'good', 0, ?7, ?8, ?9, ?10)",
        params![
            channel_uuid,
            user_id,
            username,
            now,
            location.map(|c| c.lat),
            location.map(|c| c.lon),
            device_info.and_then(|d| d.os.clone()),
            device_info.and_then(|d| d.os_version.clone()),
            device_info.and_then(|d| d.app_version.clone()),
            device_info.and_then(|d| d.user_agent.clone()),
        ],
    )?;

    crate::event::log_event(
        conn,
        channel_uuid,
        Some(user_id),
        Some(username),
        aloft_types::EventType::UserJoined,
        None,
        None,
    )?;

    Ok(JoinOutcome::Joined)
}

/// Removes `user_id` from `channel_uuid`. Fails with `NotParticipant` if the
/// user was never a member.
pub fn leave_channel(conn: &Connection, channel_uuid: &str, user_id: &str) -> Result<(), StoreError> {
    let username: Option<String> = conn
        .query_row(
            "SELECT username FROM channel_participants WHERE channel_uuid = ?1 AND user_id = ?2",
            params![channel_uuid, user_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(username) = username else {
        return Err(StoreError::NotParticipant(user_id.to_string()));
    };

    conn.execute(
        "DELETE FROM channel_participants WHERE channel_uuid = ?1 AND user_id = ?2",
        params![channel_uuid, user_id],
    )?;

    crate::event::log_event(
        conn,
        channel_uuid,
        Some(user_id),
        Some(&username),
        aloft_types::EventType::UserLeft,
        None,
        None,
    )?;

    Ok(())
}

/// Lists every current participant of a channel, ordered by join time.
pub fn get_participants(conn: &Connection, channel_uuid: &str) -> Result<Vec<Participant>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT channel_uuid, user_id, username, join_time, last_seen, lat, lon,
                connection_quality, is_transmitting, ephemeral_push_token,
                device_os, os_version, app_version, user_agent
         FROM channel_participants WHERE channel_uuid = ?1 ORDER BY join_time ASC",
    )?;
    let rows = stmt.query_map([channel_uuid], map_row_to_participant)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

/// Updates the ephemeral push token used for background notification fan-out.
pub fn update_participant_push_token(
    conn: &Connection,
    channel_uuid: &str,
    user_id: &str,
    token: Option<&str>,
) -> Result<(), StoreError> {
    let count = conn.execute(
        "UPDATE channel_participants SET ephemeral_push_token = ?1 WHERE channel_uuid = ?2 AND user_id = ?3",
        params![token, channel_uuid, user_id],
    )?;
    if count == 0 {
        return Err(StoreError::NotParticipant(user_id.to_string()));
    }
    Ok(())
}

/// Updates a participant's last-known location and refreshes `last_seen`.
pub fn update_participant_location(
    conn: &Connection,
    channel_uuid: &str,
    user_id: &str,
    location: Coordinates,
    connection_quality: ConnectionQuality,
) -> Result<(), StoreError> {
    let count = conn.execute(
        "UPDATE channel_participants
         SET lat = ?1, lon = ?2, connection_quality = ?3, last_seen = ?4
         WHERE channel_uuid = ?5 AND user_id = ?6",
        params![
            location.lat,
            location.lon,
            connection_quality.as_str(),
            Utc::now().to_rfc3339(),
            channel_uuid,
            user_id,
        ],
    )?;
    if count == 0 {
        return Err(StoreError::NotParticipant(user_id.to_string()));
    }
    Ok(())
}

fn map_row_to_participant(row: &Row) -> rusqlite::Result<Participant> {
    let lat: Option<f64> = row.get(5)?;
    let lon: Option<f64> = row.get(6)?;
    let location = match (lat, lon) {
        (Some(lat), Some(lon)) => Some(Coordinates { lat, lon }),
        _ => None,
    };

    let quality_str: String = row.get(7)?;
    let connection_quality = ConnectionQuality::parse(&quality_str).unwrap_or_default();

    let join_time: String = row.get(3)?;
    let last_seen: String = row.get(4)?;

    let device_info = DeviceInfo {
        os: row.get(10)?,
        os_version: row.get(11)?,
        app_version: row.get(12)?,
        user_agent: row.get(13)?,
    };
    let device_info = if device_info == DeviceInfo::default() {
        None
    } else {
        Some(device_info)
    };

    Ok(Participant {
        channel_uuid: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        join_time: parse_rfc3339(&join_time),
        last_seen: parse_rfc3339(&last_seen),
        location,
        connection_quality,
        is_transmitting: row.get(8)?,
        ephemeral_push_token: row.get(9)?,
        device_info,
    })
}

fn parse_rfc3339(s: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{create_channel, CreateChannelRequest};
    use crate::test_support::setup_db;
    use aloft_types::ChannelType;

    fn new_channel(conn: &Connection, max_participants: u32) -> String {
        let req = CreateChannelRequest {
            name: "Test Channel".into(),
            channel_type: Some(ChannelType::General),
            max_participants: Some(max_participants),
            ..Default::default()
        };
        create_channel(conn, &req, "admin").unwrap().uuid
    }

    #[test]
    fn join_then_leave_round_trip() {
        let conn = setup_db();
        let channel_uuid = new_channel(&conn, 10);

        let outcome = join_channel(&conn, &channel_uuid, "u1", "Pilot One", None, None).unwrap();
        assert_eq!(outcome, JoinOutcome::Joined);

        let participants = get_participants(&conn, &channel_uuid).unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].user_id, "u1");

        leave_channel(&conn, &channel_uuid, "u1").unwrap();
        assert!(get_participants(&conn, &channel_uuid).unwrap().is_empty());
    }

    #[test]
    fn join_is_idempotent() {
        let conn = setup_db();
        let channel_uuid = new_channel(&conn, 10);

        join_channel(&conn, &channel_uuid, "u1", "Pilot One", None, None).unwrap();
        let outcome = join_channel(&conn, &channel_uuid, "u1", "Pilot One", None, None).unwrap();
        assert_eq!(outcome, JoinOutcome::Rejoined);
        assert_eq!(get_participants(&conn, &channel_uuid).unwrap().len(), 1);
    }

    #[test]
    fn join_rejects_when_channel_full() {
        let conn = setup_db();
        let channel_uuid = new_channel(&conn, 1);

        join_channel(&conn, &channel_uuid, "u1", "Pilot One", None, None).unwrap();
        let err = join_channel(&conn, &channel_uuid, "u2", "Pilot Two", None, None).unwrap_err();
        assert!(matches!(err, StoreError::ChannelFull));
    }

    #[test]
    fn leave_fails_for_non_participant() {
        let conn = setup_db();
        let channel_uuid = new_channel(&conn, 10);
        let err = leave_channel(&conn, &channel_uuid, "ghost").unwrap_err();
        assert!(matches!(err, StoreError::NotParticipant(_)));
    }

    #[test]
    fn update_push_token_and_location() {
        let conn = setup_db();
        let channel_uuid = new_channel(&conn, 10);
        join_channel(&conn, &channel_uuid, "u1", "Pilot One", None, None).unwrap();

        update_participant_push_token(&conn, &channel_uuid, "u1", Some("tok-abc")).unwrap();
        update_participant_location(
            &conn,
            &channel_uuid,
            "u1",
            Coordinates { lat: 1.0, lon: 2.0 },
            ConnectionQuality::Excellent,
        )
        .unwrap();

        let participants = get_participants(&conn, &channel_uuid).unwrap();
        assert_eq!(participants[0].ephemeral_push_token.as_deref(), Some("tok-abc"));
        assert_eq!(participants[0].connection_quality, ConnectionQuality::Excellent);
    }
}

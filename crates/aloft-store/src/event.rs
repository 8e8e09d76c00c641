use crate::StoreError;
use aloft_types::{ChannelEvent, EventType};
use chrono::Utc;
use rusqlite::{params, Connection, Row};

/// Appends a row to the channel event log. Hard-deleting a channel removes
/// its events via cascade rather than logging a terminal entry, since the
/// row would have nothing left to point at.
pub fn log_event(
    conn: &Connection,
    channel_uuid: &str,
    user_id: Option<&str>,
    username: Option<&str>,
    event_type: EventType,
    content: Option<&str>,
    metadata: Option<serde_json::Value>,
) -> Result<(), StoreError> {
    let metadata_json = metadata.map(|m| serde_json::to_string(&m)).transpose()?;

    conn.execute(
        "INSERT INTO channel_messages (channel_uuid, user_id, username, event_type, content, metadata, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            channel_uuid,
            user_id,
            username,
            event_type.as_str(),
            content,
            metadata_json,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Lists events for a channel, most recent first, capped at `limit` rows.
pub fn list_events(conn: &Connection, channel_uuid: &str, limit: u32) -> Result<Vec<ChannelEvent>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, channel_uuid, user_id, username, event_type, content, metadata, timestamp
         FROM channel_messages WHERE channel_uuid = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![channel_uuid, limit], map_row_to_event)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

fn map_row_to_event(row: &Row) -> rusqlite::Result<ChannelEvent> {
    let metadata_str: Option<String> = row.get(6)?;
    let metadata = metadata_str
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e)))?;
    let timestamp: String = row.get(7)?;

    Ok(ChannelEvent {
        id: row.get(0)?,
        channel_uuid: row.get(1)?,
        user_id: row.get(2)?,
        username: row.get(3)?,
        event_type: row.get(4)?,
        content: row.get(5)?,
        metadata,
        timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{create_channel, CreateChannelRequest};
    use crate::test_support::setup_db;
    use aloft_types::ChannelType;

    fn new_channel(conn: &Connection) -> String {
        let req = CreateChannelRequest {
            name: "Test Channel".into(),
            channel_type: Some(ChannelType::General),
            ..Default::default()
        };
        create_channel(conn, &req, "admin").unwrap().uuid
    }

    #[test]
    fn create_channel_logs_a_channel_created_event() {
        let conn = setup_db();
        let channel_uuid = new_channel(&conn);
        let events = list_events(&conn, &channel_uuid, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "channel_created");
    }

    #[test]
    fn log_event_round_trips_metadata() {
        let conn = setup_db();
        let channel_uuid = new_channel(&conn);
        log_event(
            &conn,
            &channel_uuid,
            Some("u1"),
            Some("Pilot One"),
            EventType::Emergency,
            Some("going down near the ridge"),
            Some(serde_json::json!({"severity": "high"})),
        )
        .unwrap();

        let events = list_events(&conn, &channel_uuid, 10).unwrap();
        let emergency = events.iter().find(|e| e.event_type == "emergency").unwrap();
        assert_eq!(emergency.content.as_deref(), Some("going down near the ridge"));
        assert_eq!(emergency.metadata.as_ref().unwrap()["severity"], "high");
    }

    #[test]
    fn list_events_respects_limit_and_ordering() {
        let conn = setup_db();
        let channel_uuid = new_channel(&conn);
        for i in 0..5 {
            log_event(
                &conn,
                &channel_uuid,
                None,
                None,
                EventType::UserJoined,
                Some(&format!("entry {i}")),
                None,
            )
            .unwrap();
        }
        let events = list_events(&conn, &channel_uuid, 3).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].content.as_deref(), Some("entry 4"));
    }
}

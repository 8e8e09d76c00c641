use crate::StoreError;
use aloft_types::{AudioFormat, NetworkQuality, TransmissionSession};
use chrono::Utc;
use rusqlite::{params, Connection};

/// Writes the opening row of a transmission's durable history. Called by the
/// Channel Agent once it accepts a `pttStart`; failure here does not roll
/// back the in-memory session, since the agent is the source of truth while
/// a transmission is live.
pub fn start_transmission_record(conn: &Connection, session: &TransmissionSession) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO transmission_history (
            session_id, channel_uuid, user_id, start_time, audio_format,
            sample_rate, bitrate, network_quality, chunks_received, total_bytes
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0)",
        params![
            session.session_id,
            session.channel_uuid,
            session.user_id,
            session.start_time.to_rfc3339(),
            session.audio_format.as_str(),
            session.sample_rate,
            session.bitrate,
            network_quality_str(session.network_quality),
        ],
    )?;
    Ok(())
}

/// Closes out a transmission's history row with its final tallies.
pub fn finish_transmission_record(
    conn: &Connection,
    session_id: &str,
    end_time: chrono::DateTime<Utc>,
    chunks_received: u32,
    total_bytes: u64,
    end_reason: &str,
) -> Result<(), StoreError> {
    let count = conn.execute(
        "UPDATE transmission_history
         SET end_time = ?1, chunks_received = ?2, total_bytes = ?3, end_reason = ?4
         WHERE session_id = ?5",
        params![
            end_time.to_rfc3339(),
            chunks_received,
            total_bytes,
            end_reason,
            session_id,
        ],
    )?;
    if count == 0 {
        return Err(StoreError::Invalid(format!(
            "no transmission record for session {session_id}"
        )));
    }
    Ok(())
}

fn network_quality_str(q: NetworkQuality) -> &'static str {
    match q {
        NetworkQuality::Excellent => "excellent",
        NetworkQuality::Good => "good",
        NetworkQuality::Fair => "fair",
        NetworkQuality::Poor => "poor",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{create_channel, CreateChannelRequest};
    use crate::test_support::setup_db;
    use aloft_types::ChannelType;
    use rusqlite::Connection;

    fn new_channel(conn: &Connection) -> String {
        let req = CreateChannelRequest {
            name: "Test Channel".into(),
            channel_type: Some(ChannelType::General),
            ..Default::default()
        };
        create_channel(conn, &req, "admin").unwrap().uuid
    }

    fn sample_session(channel_uuid: &str) -> TransmissionSession {
        TransmissionSession {
            session_id: aloft_types::make_session_id(channel_uuid, "u1", 1_700_000_000_000, 1),
            channel_uuid: channel_uuid.to_string(),
            user_id: "u1".into(),
            start_time: Utc::now(),
            end_time: None,
            audio_format: AudioFormat::Opus,
            sample_rate: 16_000,
            bitrate: Some(24_000),
            network_quality: NetworkQuality::Good,
            chunks_received: 0,
            total_bytes: 0,
            next_expected_sequence: 0,
        }
    }

    #[test]
    fn start_then_finish_transmission_record() {
        let conn = setup_db();
        let channel_uuid = new_channel(&conn);
        let session = sample_session(&channel_uuid);

        start_transmission_record(&conn, &session).unwrap();
        finish_transmission_record(&conn, &session.session_id, Utc::now(), 42, 65_536, "normal").unwrap();

        let (chunks, bytes, reason): (u32, i64, String) = conn
            .query_row(
                "SELECT chunks_received, total_bytes, end_reason FROM transmission_history WHERE session_id = ?1",
                [&session.session_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(chunks, 42);
        assert_eq!(bytes, 65_536);
        assert_eq!(reason, "normal");
    }

    #[test]
    fn finish_fails_for_unknown_session() {
        let conn = setup_db();
        let err = finish_transmission_record(&conn, "ptt_missing_u1_0_0", Utc::now(), 0, 0, "normal")
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn get_channel_stats_reflect_transmissions_today() {
        let conn = setup_db();
        let channel_uuid = new_channel(&conn);
        let session = sample_session(&channel_uuid);
        start_transmission_record(&conn, &session).unwrap();

        let listed = crate::channel::list_channels(&conn, &crate::channel::ChannelFilter::default()).unwrap();
        let entry = listed.iter().find(|c| c.channel.uuid == channel_uuid).unwrap();
        assert_eq!(entry.stats.transmissions_today, 1);
    }
}

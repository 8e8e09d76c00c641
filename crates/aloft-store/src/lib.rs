//! The durable Channel Store for the Aloft PTT platform.
//!
//! Persistent CRUD of channels, participants, transmission history, and the
//! append-only channel event log. The store is the single owner of durable
//! records; a Channel Agent holds live session state in memory and reads
//! through this crate for anything that must survive a restart.

mod channel;
mod event;
mod participant;
mod transmission;

pub use channel::{
    create_channel, create_channel_with_uuid, get_channel, hard_delete_channel, list_channels,
    soft_delete_channel, update_channel, ChannelFilter, ChannelStats, CreateChannelRequest,
    ListedChannel, UpdateChannelRequest,
};
pub use event::{list_events, log_event};
pub use participant::{
    get_participants, join_channel, leave_channel, update_participant_location,
    update_participant_push_token, JoinOutcome,
};
pub use transmission::{finish_transmission_record, start_transmission_record};

use thiserror::Error;

/// Errors internal to the store layer, before being folded into [`aloft_types::AloftError`]
/// at the component boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("channel already exists: {0}")]
    ChannelExists(String),
    #[error("not a participant: {0}")]
    NotParticipant(String),
    #[error("channel is full")]
    ChannelFull,
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl From<StoreError> for aloft_types::AloftError {
    fn from(e: StoreError) -> Self {
        use aloft_types::AloftError;
        match e {
            StoreError::ChannelNotFound(m) => AloftError::NotFound(format!("channel not found: {m}")),
            StoreError::ChannelExists(m) => AloftError::Conflict(format!("channel already exists: {m}")),
            StoreError::NotParticipant(m) => AloftError::NotFound(format!("not a participant: {m}")),
            StoreError::ChannelFull => AloftError::Conflict("channel is full".to_string()),
            StoreError::Invalid(m) => AloftError::Invalid(m),
            StoreError::Database(e) => AloftError::Unavailable(format!("store unavailable: {e}")),
            StoreError::Json(e) => AloftError::Unavailable(format!("store unavailable: {e}")),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use rusqlite::Connection;

    pub fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().expect("failed to open in-memory db");
        aloft_db::run_migrations(&conn).expect("failed to run migrations");
        conn
    }
}

//! Shared types, error definitions, and constants for the Aloft PTT platform.
//!
//! This crate provides the foundational types used across every Aloft crate:
//! the cross-cutting error taxonomy (via `thiserror`), the channel/participant/
//! transmission data model, and shared constants.
//!
//! No crate in the workspace depends on anything *except* `aloft-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies between the store, cache, agent, and server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod constants {
    //! Defaults recognized as configuration overrides (see the server's `Config`).
    pub const DEFAULT_RADIUS_KM: f64 = 50.0;
    pub const DEFAULT_MAX_PARTICIPANTS: u32 = 50;
    pub const MAX_TRANSMISSION_DURATION_SECS: u64 = 30;
    pub const PARTICIPANT_TIMEOUT_SECS: u64 = 300;
    pub const CACHE_TTL_SECS: u64 = 300;
    pub const LIST_CACHE_TTL_SECS: u64 = 15;
    pub const ACCESS_SCOPE_PREFIX: &str = "access:";
    pub const MAX_PROXIMITY_RADIUS_KM_NON_ADMIN: f64 = 100.0;
    pub const STREAM_SEND_QUEUE_CAPACITY: usize = 64;
}

/// The cross-cutting error taxonomy every component maps its failures into.
///
/// The Control API is the only place that turns a variant into an HTTP status
/// code and response envelope; everything upstream just produces one of these.
#[derive(Error, Debug, Clone)]
pub enum AloftError {
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Unavailable(String),
}

impl AloftError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Unauthenticated(m)
            | Self::Forbidden(m)
            | Self::NotFound(m)
            | Self::Conflict(m)
            | Self::Invalid(m)
            | Self::Timeout(m)
            | Self::Unavailable(m) => m,
        }
    }
}

/// The abstract error kind named in the error handling design, independent of
/// its message. Used by transports that need to branch on kind without string
/// matching (e.g. the stream hub's `error` message type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    Invalid,
    Timeout,
    Unavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Invalid => "invalid",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Channel type as named in the channel CRUD surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    SiteLocal,
    Emergency,
    General,
    CrossCountry,
    Instructors,
}

impl ChannelType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SiteLocal => "site_local",
            Self::Emergency => "emergency",
            Self::General => "general",
            Self::CrossCountry => "cross_country",
            Self::Instructors => "instructors",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "site_local" => Some(Self::SiteLocal),
            "emergency" => Some(Self::Emergency),
            "general" => Some(Self::General),
            "cross_country" => Some(Self::CrossCountry),
            "instructors" => Some(Self::Instructors),
            _ => None,
        }
    }

    pub fn is_emergency(self) -> bool {
        matches!(self, Self::Emergency)
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Difficulty rating of the site a channel is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
    Expert,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
            Self::Expert => "expert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "beginner" => Some(Self::Beginner),
            "intermediate" => Some(Self::Intermediate),
            "advanced" => Some(Self::Advanced),
            "expert" => Some(Self::Expert),
            _ => None,
        }
    }
}

/// A geographic coordinate pair. Latitude in `[-90, 90]`, longitude in `[-180, 180]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn in_range(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance to `other`, in kilometers (Haversine formula).
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();
        EARTH_RADIUS_KM * c
    }
}

/// A named real-time voice channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub uuid: String,
    pub name: String,
    pub channel_type: ChannelType,
    pub description: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub radius_km: f64,
    pub vhf_frequency: Option<String>,
    pub max_participants: u32,
    pub difficulty: Option<Difficulty>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

/// Connection quality self-reported by a participant's client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self::Good
    }
}

impl ConnectionQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Poor => "poor",
            Self::Fair => "fair",
            Self::Good => "good",
            Self::Excellent => "excellent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "poor" => Some(Self::Poor),
            "fair" => Some(Self::Fair),
            "good" => Some(Self::Good),
            "excellent" => Some(Self::Excellent),
            _ => None,
        }
    }
}

/// Client platform metadata attached to a participant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub app_version: Option<String>,
    pub user_agent: Option<String>,
}

/// A pilot's membership in a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub channel_uuid: String,
    pub user_id: String,
    pub username: String,
    pub join_time: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub location: Option<Coordinates>,
    pub connection_quality: ConnectionQuality,
    pub is_transmitting: bool,
    pub ephemeral_push_token: Option<String>,
    pub device_info: Option<DeviceInfo>,
}

/// Audio codec used for a transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AudioFormat {
    AacLc,
    Opus,
    Pcm,
}

impl AudioFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AacLc => "aac-lc",
            Self::Opus => "opus",
            Self::Pcm => "pcm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aac-lc" => Some(Self::AacLc),
            "opus" => Some(Self::Opus),
            "pcm" => Some(Self::Pcm),
            _ => None,
        }
    }
}

/// Network quality reported at transmission start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "excellent" => Some(Self::Excellent),
            "good" => Some(Self::Good),
            "fair" => Some(Self::Fair),
            "poor" => Some(Self::Poor),
            _ => None,
        }
    }
}

/// A single PTT transmission, owned by exactly one participant at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionSession {
    pub session_id: String,
    pub channel_uuid: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub audio_format: AudioFormat,
    pub sample_rate: u32,
    pub bitrate: Option<u32>,
    pub network_quality: NetworkQuality,
    pub chunks_received: u32,
    pub total_bytes: u64,
    pub next_expected_sequence: u32,
}

/// Builds a `session_id` of the form `ptt_{channel_uuid}_{user_id}_{start_ms}_{rand}`.
pub fn make_session_id(channel_uuid: &str, user_id: &str, start_ms: u64, rand: u32) -> String {
    format!("ptt_{channel_uuid}_{user_id}_{start_ms}_{rand:08x}")
}

/// Validates the shape required by the spec: `parts[0] == "ptt"` and at least 5 segments.
pub fn is_well_formed_session_id(session_id: &str) -> bool {
    let parts: Vec<&str> = session_id.split('_').collect();
    parts.len() >= 5 && parts[0] == "ptt"
}

/// Extracts the channel UUID segment from a session_id for routing purposes
/// only — the owning agent is still the authority on whether the session is
/// actually active there.
pub fn channel_uuid_from_session_id(session_id: &str) -> Option<&str> {
    if !is_well_formed_session_id(session_id) {
        return None;
    }
    session_id.split('_').nth(1)
}

/// Append-only audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ChannelCreated,
    ChannelUpdated,
    ChannelDeleted,
    UserJoined,
    UserLeft,
    AudioStart,
    AudioEnd,
    Emergency,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChannelCreated => "channel_created",
            Self::ChannelUpdated => "channel_updated",
            Self::ChannelDeleted => "channel_deleted",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::AudioStart => "audio_start",
            Self::AudioEnd => "audio_end",
            Self::Emergency => "emergency",
        }
    }
}

/// A row in the append-only channel event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub id: i64,
    pub channel_uuid: String,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub event_type: String,
    pub content: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// The verified claim set produced by the identity verifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub scopes: Vec<String>,
    #[serde(flatten)]
    pub display: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    pub fn username(&self) -> String {
        self.display
            .get("username")
            .or_else(|| self.display.get("name"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.sub.clone())
    }
}

/// Lowercases and validates a UUID against the canonical v4 textual form.
pub fn normalize_uuid(raw: &str) -> Option<String> {
    let lower = raw.to_ascii_lowercase();
    if is_valid_uuid_v4(&lower) {
        Some(lower)
    } else {
        None
    }
}

/// `^[0-9a-f]{8}-[0-9a-f]{4}-[1-5][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$`
pub fn is_valid_uuid_v4(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    let groups = [(0, 8), (9, 4), (14, 4), (19, 4), (24, 12)];
    for (i, &(start, len)) in groups.iter().enumerate() {
        let dash_ok = if i > 0 { bytes[start - 1] == b'-' } else { true };
        if !dash_ok {
            return false;
        }
        let segment = &s[start..start + len];
        if !segment.bytes().all(|b| b.is_ascii_hexdigit()) {
            return false;
        }
    }
    let version = bytes[14];
    if !(b'1'..=b'5').contains(&version) {
        return false;
    }
    let variant = bytes[19];
    matches!(variant, b'8' | b'9' | b'a' | b'b')
}

/// `1[4-7]\d\.\d{3,4}` — VHF air-band frequency (MHz, three decimal places common in Europe).
pub fn is_valid_vhf_frequency(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() < 6 {
        return false;
    }
    if bytes[0] != b'1' {
        return false;
    }
    if !(b'4'..=b'7').contains(&bytes[1]) {
        return false;
    }
    if !bytes[2].is_ascii_digit() {
        return false;
    }
    if bytes[3] != b'.' {
        return false;
    }
    let frac = &s[4..];
    (3..=4).contains(&frac.len()) && frac.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_validation_accepts_lowercase_v4() {
        assert!(is_valid_uuid_v4("8879f616-d468-4793-afcd-d66f0cea4651"));
    }

    #[test]
    fn uuid_validation_rejects_bad_version() {
        assert!(!is_valid_uuid_v4("8879f616-d468-6793-afcd-d66f0cea4651"));
    }

    #[test]
    fn normalize_uuid_lowercases() {
        let out = normalize_uuid("AA11BB22-CC33-4444-A555-FF6677889900").unwrap();
        assert_eq!(out, "aa11bb22-cc33-4444-a555-ff6677889900");
    }

    #[test]
    fn normalize_uuid_rejects_malformed() {
        assert!(normalize_uuid("not-a-uuid").is_none());
    }

    #[test]
    fn vhf_frequency_accepts_three_and_four_decimals() {
        assert!(is_valid_vhf_frequency("143.500"));
        assert!(is_valid_vhf_frequency("167.9875"));
    }

    #[test]
    fn vhf_frequency_rejects_out_of_band() {
        assert!(!is_valid_vhf_frequency("130.500"));
        assert!(!is_valid_vhf_frequency("188.500"));
    }

    #[test]
    fn haversine_known_distance() {
        let chamonix = Coordinates {
            lat: 45.929681,
            lon: 6.876345,
        };
        let annecy = Coordinates {
            lat: 45.899235,
            lon: 6.129385,
        };
        let d = chamonix.distance_km(&annecy);
        assert!((55.0..62.0).contains(&d), "distance was {d}");
    }

    #[test]
    fn session_id_format() {
        let id = make_session_id(
            "8879f616-d468-4793-afcd-d66f0cea4651",
            "u1",
            1_700_000_000_000,
            0xabcd,
        );
        assert!(is_well_formed_session_id(&id));
        assert!(id.starts_with("ptt_8879f616-d468-4793-afcd-d66f0cea4651_u1_1700000000000_"));
    }

    #[test]
    fn session_id_requires_five_segments() {
        assert!(!is_well_formed_session_id("ptt_onlytwo"));
    }

    #[test]
    fn channel_uuid_from_session_id_extracts_segment() {
        let id = make_session_id("8879f616-d468-4793-afcd-d66f0cea4651", "u1", 1_700_000_000_000, 0xabcd);
        assert_eq!(
            channel_uuid_from_session_id(&id),
            Some("8879f616-d468-4793-afcd-d66f0cea4651")
        );
        assert_eq!(channel_uuid_from_session_id("ptt_onlytwo"), None);
    }

    #[test]
    fn error_kind_mapping() {
        let e = AloftError::Conflict("channel is full".into());
        assert_eq!(e.kind(), ErrorKind::Conflict);
        assert_eq!(e.message(), "channel is full");
    }
}

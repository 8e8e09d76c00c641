use aloft_types::{AloftError, AudioFormat, ConnectionQuality, NetworkQuality};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// Request body for `pttStart`.
#[derive(Debug, Clone)]
pub struct PttStartRequest {
    pub audio_format: AudioFormat,
    pub sample_rate: u32,
    pub bitrate: Option<u32>,
    pub network_quality: NetworkQuality,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PttStartResponse {
    pub session_id: String,
    pub max_duration_secs: u64,
    pub websocket_url: String,
}

/// Request body for `pttChunk`. `payload` is already decoded from base64 —
/// the Control API decodes once at the boundary.
#[derive(Debug, Clone)]
pub struct PttChunkRequest {
    pub session_id: String,
    pub sender_user_id: String,
    pub chunk_sequence: u32,
    pub payload: Vec<u8>,
    pub declared_size_bytes: usize,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PttChunkResponse {
    pub chunk_received: bool,
    pub next_expected_sequence: u32,
    pub duration_so_far_ms: u64,
}

/// Request body for `pttEnd`.
#[derive(Debug, Clone)]
pub struct PttEndRequest {
    pub session_id: String,
    pub user_id: String,
    pub total_duration_ms: u64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PttEndResponse {
    pub total_duration_ms: u64,
    pub chunks_received: u32,
    pub total_bytes: u64,
    pub participants_notified: u32,
}

/// Snapshot returned by `pttStatus`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransmissionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub audio_format: AudioFormat,
    pub next_expected_sequence: u32,
    pub chunks_received: u32,
    pub total_bytes: u64,
    pub elapsed_ms: u64,
}

/// Broadcast to stream-hub subscribers, and consulted by the push gateway
/// wiring to decide what to fan out.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    TransmissionStarted {
        session_id: String,
        user_id: String,
        username: String,
        audio_format: AudioFormat,
    },
    AudioChunk {
        session_id: String,
        sequence: u32,
        payload: Vec<u8>,
        timestamp_ms: u64,
        /// Subscribers must not echo a chunk back to its own sender.
        sender_user_id: String,
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

pub(crate) enum Command {
    ParticipantJoined {
        user_id: String,
        username: String,
        push_token: Option<String>,
    },
    ParticipantLeft {
        user_id: String,
    },
    ParticipantSeen {
        user_id: String,
        quality: Option<ConnectionQuality>,
    },
    Emergency {
        user_id: String,
        username: String,
        content: Option<String>,
    },
    PttStart {
        user_id: String,
        username: String,
        request: PttStartRequest,
        respond: oneshot::Sender<Result<PttStartResponse, AloftError>>,
    },
    PttChunk {
        request: PttChunkRequest,
        respond: oneshot::Sender<Result<PttChunkResponse, AloftError>>,
    },
    PttEnd {
        request: PttEndRequest,
        respond: oneshot::Sender<Result<PttEndResponse, AloftError>>,
    },
    PttStatus {
        respond: oneshot::Sender<Option<TransmissionSnapshot>>,
    },
    Subscribe {
        user_id: String,
        sender: mpsc::Sender<AgentEvent>,
        respond: oneshot::Sender<()>,
    },
    Unsubscribe {
        user_id: String,
    },
    Tick,
}

/// A clonable handle to a single channel's agent task. Every RPC enqueues a
/// command and awaits the agent's reply — callers never touch agent state
/// directly, preserving the single-threaded-per-channel invariant.
#[derive(Clone)]
pub struct AgentHandle {
    pub(crate) sender: mpsc::Sender<Command>,
}

impl AgentHandle {
    pub async fn participant_joined(&self, user_id: &str, username: &str, push_token: Option<String>) {
        let _ = self
            .sender
            .send(Command::ParticipantJoined {
                user_id: user_id.to_string(),
                username: username.to_string(),
                push_token,
            })
            .await;
    }

    pub async fn participant_left(&self, user_id: &str) {
        let _ = self
            .sender
            .send(Command::ParticipantLeft { user_id: user_id.to_string() })
            .await;
    }

    pub async fn participant_seen(&self, user_id: &str, quality: Option<ConnectionQuality>) {
        let _ = self
            .sender
            .send(Command::ParticipantSeen {
                user_id: user_id.to_string(),
                quality,
            })
            .await;
    }

    pub async fn emergency(&self, user_id: &str, username: &str, content: Option<String>) {
        let _ = self
            .sender
            .send(Command::Emergency {
                user_id: user_id.to_string(),
                username: username.to_string(),
                content,
            })
            .await;
    }

    pub async fn ptt_start(
        &self,
        user_id: &str,
        username: &str,
        request: PttStartRequest,
    ) -> Result<PttStartResponse, AloftError> {
        let (respond, rx) = oneshot::channel();
        self.sender
            .send(Command::PttStart {
                user_id: user_id.to_string(),
                username: username.to_string(),
                request,
                respond,
            })
            .await
            .map_err(|_| AloftError::Unavailable("channel agent unreachable".into()))?;
        rx.await.map_err(|_| AloftError::Unavailable("channel agent unreachable".into()))?
    }

    pub async fn ptt_chunk(&self, request: PttChunkRequest) -> Result<PttChunkResponse, AloftError> {
        let (respond, rx) = oneshot::channel();
        self.sender
            .send(Command::PttChunk { request, respond })
            .await
            .map_err(|_| AloftError::Unavailable("channel agent unreachable".into()))?;
        rx.await.map_err(|_| AloftError::Unavailable("channel agent unreachable".into()))?
    }

    pub async fn ptt_end(&self, request: PttEndRequest) -> Result<PttEndResponse, AloftError> {
        let (respond, rx) = oneshot::channel();
        self.sender
            .send(Command::PttEnd { request, respond })
            .await
            .map_err(|_| AloftError::Unavailable("channel agent unreachable".into()))?;
        rx.await.map_err(|_| AloftError::Unavailable("channel agent unreachable".into()))?
    }

    pub async fn ptt_status(&self) -> Option<TransmissionSnapshot> {
        let (respond, rx) = oneshot::channel();
        if self.sender.send(Command::PttStatus { respond }).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Registers a stream subscriber. On success the subscriber immediately
    /// receives a `TransmissionStarted` replay if a session is active.
    pub async fn subscribe(&self, user_id: &str, sender: mpsc::Sender<AgentEvent>) {
        let (respond, rx) = oneshot::channel();
        if self
            .sender
            .send(Command::Subscribe {
                user_id: user_id.to_string(),
                sender,
                respond,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn unsubscribe(&self, user_id: &str) {
        let _ = self
            .sender
            .send(Command::Unsubscribe { user_id: user_id.to_string() })
            .await;
    }

    pub(crate) async fn tick(&self) {
        let _ = self.sender.send(Command::Tick).await;
    }

    #[cfg(test)]
    pub(crate) fn same_channel(&self, other: &Self) -> bool {
        self.sender.same_channel(&other.sender)
    }
}

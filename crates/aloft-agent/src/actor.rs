use crate::handle::{
    AgentEvent, AgentHandle, Command, PttChunkRequest, PttChunkResponse, PttEndRequest,
    PttEndResponse, PttStartRequest, PttStartResponse, TransmissionSnapshot,
};
use aloft_types::{constants, AloftError, AudioFormat, ConnectionQuality, TransmissionSession};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const INBOX_CAPACITY: usize = 256;
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

struct ParticipantInfo {
    username: String,
    last_seen: Instant,
    push_token: Option<String>,
    #[allow(dead_code)]
    quality: ConnectionQuality,
}

struct ActiveTransmission {
    session_id: String,
    user_id: String,
    username: String,
    start_time: Instant,
    audio_format: AudioFormat,
    next_expected_sequence: u32,
    chunks_received: u32,
    total_bytes: u64,
}

/// Per-channel authoritative state. One instance runs on a dedicated task and
/// processes every command in arrival order — this serialization is what
/// gives "at most one transmitter per channel" without explicit locks.
pub(crate) struct ChannelAgent {
    channel_uuid: String,
    pool: aloft_db::DbPool,
    push: Arc<aloft_push::PushGateway>,
    websocket_base_url: String,
    participants: HashMap<String, ParticipantInfo>,
    active: Option<ActiveTransmission>,
    subscribers: HashMap<String, mpsc::Sender<AgentEvent>>,
}

/// Spawns a new agent task for `channel_uuid` and returns a handle to it.
pub(crate) fn spawn(
    channel_uuid: String,
    pool: aloft_db::DbPool,
    push: Arc<aloft_push::PushGateway>,
    websocket_base_url: String,
) -> AgentHandle {
    let (sender, mut receiver) = mpsc::channel(INBOX_CAPACITY);
    let handle = AgentHandle { sender };
    let ticker_handle = handle.clone();

    tokio::spawn(async move {
        let mut agent = ChannelAgent {
            channel_uuid,
            pool,
            push,
            websocket_base_url,
            participants: HashMap::new(),
            active: None,
            subscribers: HashMap::new(),
        };
        while let Some(command) = receiver.recv().await {
            agent.handle(command).await;
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            interval.tick().await;
            if ticker_handle.sender.send(Command::Tick).await.is_err() {
                break;
            }
        }
    });

    handle
}

impl ChannelAgent {
    async fn handle(&mut self, command: Command) {
        match command {
            Command::ParticipantJoined { user_id, username, push_token } => {
                self.participants.insert(
                    user_id.clone(),
                    ParticipantInfo {
                        username: username.clone(),
                        last_seen: Instant::now(),
                        push_token,
                        quality: ConnectionQuality::default(),
                    },
                );
                self.broadcast(AgentEvent::ParticipantJoined { user_id, username });
            }
            Command::ParticipantLeft { user_id } => {
                self.participants.remove(&user_id);
                self.subscribers.remove(&user_id);
            }
            Command::ParticipantSeen { user_id, quality } => {
                if let Some(p) = self.participants.get_mut(&user_id) {
                    p.last_seen = Instant::now();
                    if let Some(q) = quality {
                        p.quality = q;
                    }
                }
            }
            Command::Emergency { user_id, username, content } => {
                self.broadcast(AgentEvent::EmergencyAlert { user_id, username, content });
            }
            Command::PttStart { user_id, username, request, respond } => {
                let result = self.ptt_start(user_id, username, request).await;
                let _ = respond.send(result);
            }
            Command::PttChunk { request, respond } => {
                let result = self.ptt_chunk(request);
                let _ = respond.send(result);
            }
            Command::PttEnd { request, respond } => {
                let result = self.ptt_end(request, "ended").await;
                let _ = respond.send(result);
            }
            Command::PttStatus { respond } => {
                let _ = respond.send(self.status_snapshot());
            }
            Command::Subscribe { user_id, sender, respond } => {
                if let Some(active) = &self.active {
                    let _ = sender
                        .try_send(AgentEvent::TransmissionStarted {
                            session_id: active.session_id.clone(),
                            user_id: active.user_id.clone(),
                            username: active.username.clone(),
                            audio_format: active.audio_format,
                        });
                }
                self.subscribers.insert(user_id, sender);
                let _ = respond.send(());
            }
            Command::Unsubscribe { user_id } => {
                self.subscribers.remove(&user_id);
            }
            Command::Tick => {
                self.run_housekeeping().await;
            }
        }
    }

    async fn ptt_start(
        &mut self,
        user_id: String,
        username: String,
        request: PttStartRequest,
    ) -> Result<PttStartResponse, AloftError> {
        if !self.participants.contains_key(&user_id) {
            return Err(AloftError::NotFound("not a participant of this channel".into()));
        }
        if self.active.is_some() {
            return Err(AloftError::Conflict("a transmission is already active on this channel".into()));
        }
        if request.sample_rate == 0 {
            return Err(AloftError::Invalid("sample_rate must be greater than zero".into()));
        }

        let start_ms = Utc::now().timestamp_millis().max(0) as u64;
        let rand = (start_ms ^ (user_id.len() as u64)) as u32;
        let session_id = aloft_types::make_session_id(&self.channel_uuid, &user_id, start_ms, rand);
        let wall_start_time = Utc::now();

        let session = TransmissionSession {
            session_id: session_id.clone(),
            channel_uuid: self.channel_uuid.clone(),
            user_id: user_id.clone(),
            start_time: wall_start_time,
            end_time: None,
            audio_format: request.audio_format,
            sample_rate: request.sample_rate,
            bitrate: request.bitrate,
            network_quality: request.network_quality,
            chunks_received: 0,
            total_bytes: 0,
            next_expected_sequence: 1,
        };

        let pool = self.pool.clone();
        let channel_uuid = self.channel_uuid.clone();
        let user_id_for_log = user_id.clone();
        let username_for_log = username.clone();
        tokio::task::spawn_blocking(move || -> Result<(), AloftError> {
            let conn = pool
                .get()
                .map_err(|e| AloftError::Unavailable(format!("store unavailable: {e}")))?;
            aloft_store::start_transmission_record(&conn, &session)?;
            aloft_store::log_event(
                &conn,
                &channel_uuid,
                Some(&user_id_for_log),
                Some(&username_for_log),
                aloft_types::EventType::AudioStart,
                None,
                None,
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AloftError::Unavailable(format!("agent task join error: {e}")))??;

        self.active = Some(ActiveTransmission {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            username: username.clone(),
            start_time: Instant::now(),
            audio_format: request.audio_format,
            next_expected_sequence: 1,
            chunks_received: 0,
            total_bytes: 0,
        });
        if let Some(p) = self.participants.get_mut(&user_id) {
            p.last_seen = Instant::now();
        }

        self.broadcast(AgentEvent::TransmissionStarted {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            username: username.clone(),
            audio_format: request.audio_format,
        });
        self.fan_out_push(&session_id, &username, aloft_push::PushEventType::Start, Some(&user_id));

        Ok(PttStartResponse {
            session_id: session_id.clone(),
            max_duration_secs: constants::MAX_TRANSMISSION_DURATION_SECS,
            websocket_url: format!("{}/{}", self.websocket_base_url, self.channel_uuid),
        })
    }

    fn ptt_chunk(&mut self, request: PttChunkRequest) -> Result<PttChunkResponse, AloftError> {
        let is_first_chunk = {
            let active = self
                .active
                .as_ref()
                .filter(|a| a.session_id == request.session_id)
                .ok_or_else(|| AloftError::NotFound("no active transmission for that session".into()))?;

            if request.payload.len() != request.declared_size_bytes {
                return Err(AloftError::Invalid("declared chunk size does not match payload length".into()));
            }
            if request.chunk_sequence != active.next_expected_sequence {
                return Err(AloftError::Invalid(format!(
                    "Invalid chunk sequence: expected {}",
                    active.next_expected_sequence
                )));
            }
            active.next_expected_sequence == 1
        };

        let (session_id, next_expected, duration_so_far_ms, username) = {
            let active = self.active.as_mut().expect("checked present above");
            active.chunks_received += 1;
            active.total_bytes += request.payload.len() as u64;
            active.next_expected_sequence += 1;
            (
                active.session_id.clone(),
                active.next_expected_sequence,
                active.start_time.elapsed().as_millis() as u64,
                active.username.clone(),
            )
        };

        self.broadcast(AgentEvent::AudioChunk {
            session_id: session_id.clone(),
            sequence: request.chunk_sequence,
            payload: request.payload,
            timestamp_ms: request.timestamp_ms,
            sender_user_id: request.sender_user_id.clone(),
        });

        if is_first_chunk {
            self.fan_out_push(
                &session_id,
                &username,
                aloft_push::PushEventType::ChunkAvailable,
                Some(&request.sender_user_id),
            );
        }

        Ok(PttChunkResponse {
            chunk_received: true,
            next_expected_sequence: next_expected,
            duration_so_far_ms,
        })
    }

    async fn ptt_end(&mut self, request: PttEndRequest, default_reason: &str) -> Result<PttEndResponse, AloftError> {
        let active = self
            .active
            .as_ref()
            .filter(|a| a.session_id == request.session_id)
            .ok_or_else(|| AloftError::NotFound("no active transmission for that session".into()))?;

        if request.total_duration_ms == 0 {
            return Err(AloftError::Invalid("total_duration_ms must be greater than zero".into()));
        }

        let session_id = active.session_id.clone();
        let user_id = active.user_id.clone();
        let username = active.username.clone();
        let chunks_received = active.chunks_received;
        let total_bytes = active.total_bytes;
        let reason = request.reason.clone().unwrap_or_else(|| default_reason.to_string());

        let pool = self.pool.clone();
        let channel_uuid = self.channel_uuid.clone();
        let session_id_for_store = session_id.clone();
        let reason_for_store = reason.clone();
        let user_id_for_log = user_id.clone();
        let username_for_log = username.clone();
        tokio::task::spawn_blocking(move || -> Result<(), AloftError> {
            let conn = pool
                .get()
                .map_err(|e| AloftError::Unavailable(format!("store unavailable: {e}")))?;
            aloft_store::finish_transmission_record(
                &conn,
                &session_id_for_store,
                Utc::now(),
                chunks_received,
                total_bytes,
                &reason_for_store,
            )?;
            aloft_store::log_event(
                &conn,
                &channel_uuid,
                Some(&user_id_for_log),
                Some(&username_for_log),
                aloft_types::EventType::AudioEnd,
                None,
                None,
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AloftError::Unavailable(format!("agent task join error: {e}")))??;

        self.active = None;
        let participants_notified = self.subscribers.len() as u32;

        self.broadcast(AgentEvent::TransmissionEnded {
            session_id: session_id.clone(),
            reason: reason.clone(),
            total_duration_ms: request.total_duration_ms,
        });
        self.fan_out_push(&session_id, &username, aloft_push::PushEventType::End, Some(&user_id));

        Ok(PttEndResponse {
            total_duration_ms: request.total_duration_ms,
            chunks_received,
            total_bytes,
            participants_notified,
        })
    }

    fn status_snapshot(&self) -> Option<TransmissionSnapshot> {
        self.active.as_ref().map(|a| TransmissionSnapshot {
            session_id: a.session_id.clone(),
            user_id: a.user_id.clone(),
            username: a.username.clone(),
            audio_format: a.audio_format,
            next_expected_sequence: a.next_expected_sequence,
            chunks_received: a.chunks_received,
            total_bytes: a.total_bytes,
            elapsed_ms: a.start_time.elapsed().as_millis() as u64,
        })
    }

    async fn run_housekeeping(&mut self) {
        let expired_request = self.active.as_ref().and_then(|active| {
            let cap = Duration::from_secs(constants::MAX_TRANSMISSION_DURATION_SECS);
            if active.start_time.elapsed() >= cap {
                let elapsed_ms = active.start_time.elapsed().as_millis() as u64;
                Some(PttEndRequest {
                    session_id: active.session_id.clone(),
                    user_id: active.user_id.clone(),
                    total_duration_ms: elapsed_ms.max(1),
                    reason: Some("timeout".to_string()),
                })
            } else {
                None
            }
        });
        if let Some(end_request) = expired_request {
            if let Err(e) = self.ptt_end(end_request, "timeout").await {
                tracing::warn!(channel = %self.channel_uuid, error = %e, "autonomous transmission timeout failed to close cleanly");
            }
        }

        let timeout = Duration::from_secs(constants::PARTICIPANT_TIMEOUT_SECS);
        let now = Instant::now();
        let stale: Vec<String> = self
            .participants
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for user_id in stale {
            self.participants.remove(&user_id);
            self.subscribers.remove(&user_id);
            self.broadcast(AgentEvent::ParticipantLeft { user_id, reason: "timeout".to_string() });
        }
    }

    /// Sends `event` to every subscriber via a non-blocking `try_send`. A
    /// subscriber whose queue is full is dropped and the remaining
    /// subscribers observe its `participant_left reason=slow_consumer` —
    /// this is what keeps one slow connection from stalling the agent.
    fn broadcast(&mut self, event: AgentEvent) {
        let mut overflowed = Vec::new();
        for (user_id, sender) in self.subscribers.iter() {
            if sender.try_send(event.clone()).is_err() {
                overflowed.push(user_id.clone());
            }
        }
        for user_id in overflowed {
            self.subscribers.remove(&user_id);
            for sender in self.subscribers.values() {
                let _ = sender.try_send(AgentEvent::ParticipantLeft {
                    user_id: user_id.clone(),
                    reason: "slow_consumer".to_string(),
                });
            }
        }
    }

    fn fan_out_push(
        &self,
        session_id: &str,
        initiator_username: &str,
        event_type: aloft_push::PushEventType,
        exclude_user_id: Option<&str>,
    ) {
        let recipients: Vec<(String, String)> = self
            .participants
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != exclude_user_id)
            .filter_map(|(_, p)| p.push_token.clone().map(|t| (p.username.clone(), t)))
            .collect();
        if recipients.is_empty() {
            return;
        }

        let push = Arc::clone(&self.push);
        let channel_uuid = self.channel_uuid.clone();
        let session_id = session_id.to_string();
        let initiator_username = initiator_username.to_string();

        tokio::spawn(async move {
            for (_username, token) in recipients {
                let outcome = push
                    .deliver(&token, &channel_uuid, &session_id, &initiator_username, event_type)
                    .await;
                if outcome == aloft_push::DeliveryOutcome::TokenInvalid {
                    tracing::info!(channel = %channel_uuid, "push token permanently invalid, caller should clear it");
                }
            }
        });
    }
}

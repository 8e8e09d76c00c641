//! Channel Agent (C6) for the Aloft PTT platform.
//!
//! Each channel is owned by exactly one actor task that serializes every
//! command touching its state — roster membership, the single active
//! transmission, and the set of stream subscribers. Routing through this
//! actor rather than shared locks is what gives the "at most one
//! transmitter per channel" and strict per-channel ordering guarantees for
//! free: a command can only be handled after the previous one finished.

mod actor;
mod handle;
mod registry;

pub use handle::{
    AgentEvent, AgentHandle, PttChunkRequest, PttChunkResponse, PttEndRequest, PttEndResponse,
    PttStartRequest, PttStartResponse, TransmissionSnapshot,
};
pub use registry::AgentRegistry;

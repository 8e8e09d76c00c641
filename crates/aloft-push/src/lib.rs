//! Push Fan-out (C7) for the Aloft PTT platform.
//!
//! Delivers per-transmission events to each participant's ephemeral push
//! token through an external gateway. Delivery is fire-and-forget with
//! bounded retry; permanent failures (dead token, unregistered device) are
//! reported back to the caller as [`service::DeliveryOutcome::TokenInvalid`]
//! so it can clear the token through the Channel Store. Emergency events are
//! sent at the gateway's highest priority; everything else at normal priority.

pub mod error;
pub mod service;

pub use error::PushError;
pub use service::{DeliveryOutcome, PushConfig, PushEventType, PushGateway};

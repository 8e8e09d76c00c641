use thiserror::Error;

/// Errors internal to the Push Fan-out component, before being folded into
/// [`aloft_types::AloftError`]. Push failures are best-effort side effects —
/// callers log them and never propagate a failure back to the transmitting
/// participant.
#[derive(Error, Debug)]
pub enum PushError {
    #[error("push gateway request failed: {0}")]
    Gateway(#[from] reqwest::Error),

    #[error("push gateway rejected the token as permanently invalid")]
    TokenInvalid,
}

use std::time::Duration;

use thiserror::Error;

use crate::session::ConnectionState;

/// Failures of the underlying simulation transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Endpoint could not be reached or refused the session
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// The remote side answered the request with an error
    #[error("request rejected by transport: {0}")]
    Rejected(String),
    /// No answer within the transport's own request deadline
    #[error("transport request timed out after {0:?}")]
    Timeout(Duration),
    /// The link has already been torn down
    #[error("transport link closed")]
    Closed,
    /// Payload could not be encoded or decoded
    #[error("malformed transport payload: {0}")]
    Protocol(String),
}

/// Session-level failures surfaced to callers.
///
/// Every variant carries a stable machine code (see [`codes`]) and a short
/// remediation hint so the tool layer never has to invent one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("a connection attempt is already in progress (state: {state}); poll session status and retry later")]
    ConnectionBusy { state: ConnectionState },
    #[error("already connected as {identity}; disconnect before connecting again")]
    AlreadyConnected { identity: String },
    #[error("connection attempt timed out after {}ms", .0.as_millis())]
    ConnectionTimeout(Duration),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("reconnect budget exhausted after {attempts} attempts")]
    AttemptBudgetExhausted { attempts: u32 },
    #[error("no live session; connect first")]
    NotConnected,
    #[error("connection attempt aborted: {0}")]
    Aborted(String),
    #[error("a protected action is already being verified at {target}")]
    VerificationBusy { target: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::ConnectionBusy { .. } => codes::CONNECTION_BUSY,
            SessionError::AlreadyConnected { .. } => codes::ALREADY_CONNECTED,
            SessionError::ConnectionTimeout(_) => codes::CONNECTION_TIMEOUT,
            SessionError::ConnectionLost(_) => codes::CONNECTION_LOST,
            SessionError::AttemptBudgetExhausted { .. } => codes::ATTEMPT_BUDGET_EXHAUSTED,
            SessionError::NotConnected => codes::NOT_CONNECTED,
            SessionError::Aborted(_) => codes::ABORTED,
            SessionError::VerificationBusy { .. } => codes::VERIFICATION_BUSY,
            SessionError::Transport(_) => codes::TRANSPORT_ERROR,
        }
    }

    pub fn docs_hint(&self) -> &'static str {
        match self {
            SessionError::ConnectionBusy { .. } => {
                "Poll tether_session_status until the state settles, then retry."
            }
            SessionError::AlreadyConnected { .. } => {
                "Call tether_disconnect first if you want to switch server or identity."
            }
            SessionError::ConnectionTimeout(_) | SessionError::ConnectionLost(_) => {
                "Check that the server is reachable; retained credentials trigger automatic reconnects."
            }
            SessionError::AttemptBudgetExhausted { .. } => {
                "Automatic reconnects stopped. Call tether_connect explicitly to start over."
            }
            SessionError::NotConnected => "Call tether_connect and wait for state=connected.",
            SessionError::Aborted(_) => "The attempt was cancelled by an explicit disconnect.",
            SessionError::VerificationBusy { .. } => {
                "Wait for the in-flight action on this target to resolve before issuing another."
            }
            SessionError::Transport(_) => "Inspect the bridge process logs for the underlying failure.",
        }
    }
}

/// Error codes used across the tool surface
pub mod codes {
    pub const CONNECTION_BUSY: &str = "connection_busy";
    pub const ALREADY_CONNECTED: &str = "already_connected";
    pub const CONNECTION_TIMEOUT: &str = "connection_timeout";
    pub const CONNECTION_LOST: &str = "connection_lost";
    pub const ATTEMPT_BUDGET_EXHAUSTED: &str = "attempt_budget_exhausted";
    pub const NOT_CONNECTED: &str = "not_connected";
    pub const ABORTED: &str = "aborted";
    pub const VERIFICATION_BUSY: &str = "verification_busy";
    pub const TRANSPORT_ERROR: &str = "transport_error";
    pub const ACTION_DENIED: &str = "action_denied";
    pub const ACTION_FAILED_UNKNOWN: &str = "action_failed_unknown";
    pub const VALIDATION_FAILED: &str = "validation_failed";
}

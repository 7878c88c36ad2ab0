pub mod action;
pub mod chat;
pub mod claim;
pub mod classifier;
pub mod config;
pub mod denial;
pub mod error;
pub mod protocol;
pub mod session;
pub mod subscription;
pub mod transport;
pub mod verifier;

#[cfg(test)]
mod testing;

pub use action::{ActionKind, WorldAction};
pub use chat::{ChatKind, ChatLogEntry};
pub use claim::ClaimInfo;
pub use config::SessionConfig;
pub use error::{SessionError, TransportError};
pub use protocol::{ActionOutcome, ProtectedAction};
pub use session::{ConnectionState, SessionManager, SessionStatus};
pub use transport::{
    BlockPos, Channel, Connector, Credentials, Link, Snapshot, Target, TransportEvent,
};
pub use verifier::{Expectation, Verdict};

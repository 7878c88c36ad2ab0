//! Contracts for the collaborators this crate drives but does not implement:
//! the simulation transport, world-state observation and the command channel.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::action::WorldAction;
use crate::error::TransportError;

/// Where a broadcast line arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Player-chat channel
    Chat,
    /// System / action-bar / plugin output
    Info,
}

/// Raw events produced by a live transport connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The agent is in the world. Socket-open alone does not count.
    Spawned,
    /// Structured player chat (sender already parsed by the transport)
    Chat { sender: String, text: String },
    /// Any server-originated text line with its channel tag
    Broadcast { channel: Channel, text: String },
    Error { message: String },
    Ended { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

impl Credentials {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// What a protected action re-observes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    Block { position: BlockPos },
    Entity { id: u64 },
    /// The agent itself (vehicle, open window, ...)
    Agent,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Block { position } => {
                write!(f, "block({}, {}, {})", position.x, position.y, position.z)
            }
            Target::Entity { id } => write!(f, "entity({id})"),
            Target::Agent => f.write_str("agent"),
        }
    }
}

/// Side-effect-free observation of one target.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Block or entity identity; `None` for air / absent
    #[serde(default)]
    pub kind: Option<String>,
    /// Sign lines or similar visible text
    #[serde(default)]
    pub text: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn of_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, lines: &[&str]) -> Self {
        self.text = lines.iter().map(|line| line.to_string()).collect();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Opens sessions against the simulation.
pub trait Connector: Send + Sync + 'static {
    type Link: Link;

    /// Opens a connection and returns the link plus its event stream. The
    /// session is only established once [`TransportEvent::Spawned`] arrives.
    fn connect(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<(Self::Link, mpsc::Receiver<TransportEvent>), TransportError>>
    + Send;
}

/// One live connection.
pub trait Link: Send + Sync + 'static {
    /// Fire-and-forget; any response arrives on the broadcast stream.
    fn send_command(&self, text: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn observe(&self, target: &Target)
    -> impl Future<Output = Result<Snapshot, TransportError>> + Send;

    fn perform(&self, action: &WorldAction)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}

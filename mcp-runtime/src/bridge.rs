//! TCP client for the simulation sidecar.
//!
//! The sidecar speaks newline-delimited JSON. Requests carry an `id` and an
//! `op`; responses echo the `id` with `ok` plus `result` or `error`. Lines
//! carrying an `event` key are unsolicited and feed the session's event
//! stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tether_core::{
    Channel, Connector, Credentials, Link, Snapshot, Target, TransportError, TransportEvent,
    WorldAction,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const CLOSED_REASON: &str = "bridge connection closed";

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeEvent {
    Spawned,
    Chat {
        username: String,
        message: String,
    },
    Message {
        text: String,
        #[serde(default)]
        position: Option<String>,
    },
    Error {
        message: String,
    },
    End {
        #[serde(default)]
        reason: Option<String>,
    },
    Kicked {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl BridgeEvent {
    fn into_transport_event(self) -> TransportEvent {
        match self {
            BridgeEvent::Spawned => TransportEvent::Spawned,
            BridgeEvent::Chat { username, message } => TransportEvent::Chat {
                sender: username,
                text: message,
            },
            BridgeEvent::Message { text, position } => {
                let channel = match position.as_deref() {
                    Some("chat") => Channel::Chat,
                    _ => Channel::Info,
                };
                TransportEvent::Broadcast { channel, text }
            }
            BridgeEvent::Error { message } => TransportEvent::Error { message },
            BridgeEvent::End { reason } => TransportEvent::Ended {
                reason: reason.unwrap_or_else(|| "ended by server".to_string()),
            },
            BridgeEvent::Kicked { reason } => TransportEvent::Ended {
                reason: format!("kicked: {}", reason.as_deref().unwrap_or("no reason given")),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Opens one sidecar connection per session.
#[derive(Clone, Debug)]
pub struct BridgeConnector {
    addr: String,
    request_timeout: Duration,
}

impl BridgeConnector {
    pub fn new(addr: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            request_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connector for BridgeConnector {
    type Link = BridgeLink;

    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<(BridgeLink, mpsc::Receiver<TransportEvent>), TransportError> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|err| {
            TransportError::Unavailable(format!("bridge at {}: {err}", self.addr))
        })?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(BridgeShared {
            writer: tokio::sync::Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            request_timeout: self.request_timeout,
        });
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_loop(
            BufReader::new(read_half),
            Arc::clone(&shared),
            events_tx,
        ));
        let link = BridgeLink { shared, reader };

        let params = serde_json::to_value(credentials)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        link.shared.request("connect", params).await?;
        info!(
            bridge = %self.addr,
            endpoint = %credentials.endpoint(),
            username = %credentials.username,
            "bridge accepted connect request"
        );
        Ok((link, events_rx))
    }
}

struct BridgeShared {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl BridgeShared {
    fn pending(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn request(&self, op: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut message = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("params".to_string(), other);
                map
            }
        };
        message.insert("id".to_string(), json!(id));
        message.insert("op".to_string(), json!(op));
        let mut line = serde_json::to_vec(&Value::Object(message))
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        line.push(b'\n');

        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&line).await {
                Ok(()) => writer.flush().await,
                Err(err) => Err(err),
            }
        };
        if let Err(err) = written {
            self.pending().remove(&id);
            debug!(id, op, error = %err, "bridge write failed");
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending().remove(&id);
                warn!(
                    id,
                    op,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "bridge request timed out"
                );
                Err(TransportError::Timeout(self.request_timeout))
            }
        }
    }

    fn resolve(&self, response: BridgeResponse) {
        let Some(tx) = self.pending().remove(&response.id) else {
            debug!(id = response.id, "bridge response for unknown or expired request");
            return;
        };
        let result = if response.ok {
            Ok(response.result)
        } else {
            Err(TransportError::Rejected(
                response
                    .error
                    .unwrap_or_else(|| "unspecified bridge error".to_string()),
            ))
        };
        let _ = tx.send(result);
    }

    fn fail_all_pending(&self) {
        let drained: Vec<_> = self.pending().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    shared: Arc<BridgeShared>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "bridge read failed");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "ignoring malformed bridge line");
                continue;
            }
        };

        if value.get("event").is_some() {
            match serde_json::from_value::<BridgeEvent>(value) {
                Ok(event) => {
                    let _ = events.send(event.into_transport_event()).await;
                }
                Err(err) => debug!(error = %err, "ignoring unrecognised bridge event"),
            }
            continue;
        }
        match serde_json::from_value::<BridgeResponse>(value) {
            Ok(response) => shared.resolve(response),
            Err(err) => warn!(error = %err, "ignoring malformed bridge response"),
        }
    }

    info!("bridge socket closed");
    shared.fail_all_pending();
    let _ = events
        .send(TransportEvent::Ended {
            reason: CLOSED_REASON.to_string(),
        })
        .await;
}

/// One live sidecar connection. Dropping it stops the reader and closes the
/// socket.
pub struct BridgeLink {
    shared: Arc<BridgeShared>,
    reader: JoinHandle<()>,
}

impl Link for BridgeLink {
    async fn send_command(&self, text: &str) -> Result<(), TransportError> {
        self.shared
            .request("command", json!({ "text": text }))
            .await
            .map(|_| ())
    }

    async fn observe(&self, target: &Target) -> Result<Snapshot, TransportError> {
        let result = self
            .shared
            .request("observe", json!({ "target": target }))
            .await?;
        if result.is_null() {
            return Ok(Snapshot::default());
        }
        serde_json::from_value(result).map_err(|err| TransportError::Protocol(err.to_string()))
    }

    async fn perform(&self, action: &WorldAction) -> Result<(), TransportError> {
        self.shared
            .request("perform", json!({ "action": action }))
            .await
            .map(|_| ())
    }

    async fn disconnect(&self) {
        if let Err(err) = self.shared.request("disconnect", Value::Null).await {
            debug!(error = %err, "bridge disconnect request failed");
        }
        self.reader.abort();
        let mut writer = self.shared.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl Drop for BridgeLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

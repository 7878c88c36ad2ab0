//! Connection lifecycle: a single owned [`Session`] value, the one live
//! transport connection, credential retention and the reconnect schedule.
//!
//! Every mutation happens under the session mutex and bumps or checks the
//! connection epoch. Background tasks (event pump, retry timers, in-flight
//! connects) carry the epoch they were started for and become no-ops once it
//! moves on, which is how an explicit disconnect cancels them.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::chat::{ChatLog, ChatLogEntry};
use crate::classifier::MessageClassifier;
use crate::config::SessionConfig;
use crate::error::{SessionError, TransportError};
use crate::subscription::{ClassifiedText, Subscription};
use crate::transport::{Connector, Credentials, Link, Target, TransportEvent};

const SESSION_BUS_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Reconnecting)
                | (Connected, Disconnected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
        )
    }

    /// An attempt is in flight; a new explicit connect must wait.
    pub fn is_busy(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only projection of the session handed to everything outside the
/// manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
    pub max_attempts: u32,
    pub last_disconnect_reason: Option<String>,
    /// Delay before the scheduled retry, while one is pending
    pub next_retry_delay_ms: Option<u64>,
    /// Credentials are retained, so an unexpected end triggers reconnects
    pub auto_reconnect: bool,
    pub identity: Option<String>,
    pub endpoint: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

struct Session<L> {
    state: ConnectionState,
    /// Non-empty exactly while auto-reconnect is armed
    credentials: Option<Credentials>,
    reconnect_attempt: u32,
    last_disconnect_reason: Option<String>,
    next_retry_delay: Option<Duration>,
    live: Option<LiveConnection<L>>,
}

impl<L> Session<L> {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            credentials: None,
            reconnect_attempt: 0,
            last_disconnect_reason: None,
            next_retry_delay: None,
            live: None,
        }
    }
}

struct LiveConnection<L> {
    identity: String,
    link: Arc<L>,
    bus: broadcast::Sender<ClassifiedText>,
    closed: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    pump: Option<JoinHandle<()>>,
    connected_at: DateTime<Utc>,
}

impl<L> LiveConnection<L> {
    /// Ends every listening window tied to this connection.
    fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// Handle on the current live connection for one operation.
pub(crate) struct ActiveSession<L> {
    pub(crate) link: Arc<L>,
    bus: broadcast::Sender<ClassifiedText>,
    pub(crate) closed: watch::Receiver<bool>,
}

impl<L> ActiveSession<L> {
    pub(crate) fn subscribe(&self, label: &'static str) -> Subscription {
        Subscription::open(label, &self.bus, self.closed.clone())
    }
}

pub struct SessionManager<C: Connector> {
    connector: C,
    pub(crate) config: SessionConfig,
    session: Mutex<Session<C::Link>>,
    chat_log: Mutex<ChatLog>,
    classifier: Mutex<MessageClassifier>,
    epoch: watch::Sender<u64>,
    status: watch::Sender<SessionStatus>,
    pub(crate) in_flight: Mutex<HashSet<Target>>,
}

impl<C: Connector> SessionManager<C> {
    pub fn new(connector: C, config: SessionConfig) -> Arc<Self> {
        let session = Session::new();
        let status = status_of(&session, &config);
        Arc::new(Self {
            connector,
            chat_log: Mutex::new(ChatLog::with_capacity(config.chat_log_capacity)),
            classifier: Mutex::new(MessageClassifier::new(config.classifier.clone())),
            config,
            session: Mutex::new(session),
            epoch: watch::channel(0).0,
            status: watch::channel(status).0,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Every transition and retry bookkeeping change is published here.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn chat_history(&self, limit: usize) -> Vec<ChatLogEntry> {
        lock(&self.chat_log).recent(limit)
    }

    /// Explicit connect. Resolves once the agent has spawned, or with the
    /// reason the attempt failed. A failed explicit attempt does not retry.
    pub async fn connect(
        self: &Arc<Self>,
        credentials: Credentials,
    ) -> Result<SessionStatus, SessionError> {
        let epoch = {
            let mut session = lock(&self.session);
            if session.state.is_busy() {
                return Err(SessionError::ConnectionBusy {
                    state: session.state,
                });
            }
            if session.state == ConnectionState::Connected {
                let identity = session
                    .live
                    .as_ref()
                    .map(|live| live.identity.clone())
                    .unwrap_or_default();
                return Err(SessionError::AlreadyConnected { identity });
            }
            session.credentials = Some(credentials.clone());
            session.reconnect_attempt = 0;
            session.next_retry_delay = None;
            session.last_disconnect_reason = None;
            let epoch = self.advance_epoch();
            info!(
                endpoint = %credentials.endpoint(),
                identity = %credentials.username,
                "connect requested"
            );
            self.transition(&mut session, ConnectionState::Connecting);
            epoch
        };

        match self.establish(epoch, &credentials).await {
            Ok(()) => Ok(self.status()),
            Err(err) => {
                let mut session = lock(&self.session);
                if self.current_epoch() == epoch && session.state == ConnectionState::Connecting {
                    warn!(error = %err, "connect attempt failed");
                    session.credentials = None;
                    session.last_disconnect_reason = Some(err.to_string());
                    self.transition(&mut session, ConnectionState::Disconnected);
                }
                Err(err)
            }
        }
    }

    /// Tears down the live connection, forgets credentials and resets the
    /// retry counter. The only way to stop the reconnect loop.
    pub async fn disconnect(&self) -> SessionStatus {
        let live = {
            let mut session = lock(&self.session);
            session.credentials = None;
            session.reconnect_attempt = 0;
            session.next_retry_delay = None;
            self.advance_epoch();
            let live = session.live.take();
            if session.state != ConnectionState::Disconnected {
                session.last_disconnect_reason = Some("disconnect requested".to_string());
                self.transition(&mut session, ConnectionState::Disconnected);
            } else {
                self.publish(&session);
            }
            live
        };

        if let Some(mut live) = live {
            live.close();
            if let Some(pump) = live.pump.take() {
                pump.abort();
            }
            live.link.disconnect().await;
            info!(identity = %live.identity, "session closed by request");
        }
        self.status()
    }

    /// Fire-and-forget chat line or command.
    pub async fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        let active = self.active()?;
        active.link.send_command(text).await?;
        Ok(())
    }

    pub(crate) fn active(&self) -> Result<ActiveSession<C::Link>, SessionError> {
        let session = lock(&self.session);
        match (&session.state, &session.live) {
            (ConnectionState::Connected, Some(live)) => Ok(ActiveSession {
                link: Arc::clone(&live.link),
                bus: live.bus.clone(),
                closed: live.closed_rx.clone(),
            }),
            _ => Err(SessionError::NotConnected),
        }
    }

    async fn establish(
        self: &Arc<Self>,
        epoch: u64,
        credentials: &Credentials,
    ) -> Result<(), SessionError> {
        let timeout = self.config.connect_timeout;
        let mut epochs = self.epoch.subscribe();

        let (link, events, pending) = tokio::select! {
            result = tokio::time::timeout(timeout, self.open_until_spawned(credentials)) => {
                match result {
                    Ok(outcome) => outcome?,
                    Err(_) => return Err(SessionError::ConnectionTimeout(timeout)),
                }
            }
            _ = superseded(&mut epochs, epoch) => {
                return Err(SessionError::Aborted("disconnect requested".to_string()));
            }
        };

        let link = Arc::new(link);
        let installed = {
            let mut session = lock(&self.session);
            if self.current_epoch() == epoch {
                let (bus, _) = broadcast::channel(SESSION_BUS_CAPACITY);
                let (closed, closed_rx) = watch::channel(false);
                lock(&self.classifier).reset(Some(credentials.username.clone()));
                if !pending.is_empty() {
                    debug!(buffered = pending.len(), "replaying events received before spawn");
                }
                for event in pending {
                    self.route(&bus, event);
                }

                let pump = self.spawn_pump(epoch, events, bus.clone());
                session.live = Some(LiveConnection {
                    identity: credentials.username.clone(),
                    link: Arc::clone(&link),
                    bus,
                    closed,
                    closed_rx,
                    pump: Some(pump),
                    connected_at: Utc::now(),
                });
                session.reconnect_attempt = 0;
                session.next_retry_delay = None;
                self.transition(&mut session, ConnectionState::Connected);
                true
            } else {
                false
            }
        };

        if !installed {
            link.disconnect().await;
            return Err(SessionError::Aborted("disconnect requested".to_string()));
        }
        Ok(())
    }

    /// Opens the transport and waits for the spawn signal, buffering any
    /// text that arrives first.
    async fn open_until_spawned(
        &self,
        credentials: &Credentials,
    ) -> Result<(C::Link, mpsc::Receiver<TransportEvent>, Vec<TransportEvent>), SessionError> {
        let (link, mut events) = self.connector.connect(credentials).await?;
        let mut pending = Vec::new();
        loop {
            match events.recv().await {
                Some(TransportEvent::Spawned) => return Ok((link, events, pending)),
                Some(TransportEvent::Ended { reason }) => {
                    link.disconnect().await;
                    return Err(SessionError::ConnectionLost(reason));
                }
                Some(TransportEvent::Error { message }) => {
                    link.disconnect().await;
                    return Err(TransportError::Unavailable(message).into());
                }
                Some(event) => pending.push(event),
                None => {
                    return Err(SessionError::ConnectionLost(
                        "transport closed before the agent spawned".to_string(),
                    ));
                }
            }
        }
    }

    fn spawn_pump(
        self: &Arc<Self>,
        epoch: u64,
        events: mpsc::Receiver<TransportEvent>,
        bus: broadcast::Sender<ClassifiedText>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.pump(epoch, events, bus).await })
    }

    /// The single listener on a live connection's event stream.
    async fn pump(
        self: Arc<Self>,
        epoch: u64,
        mut events: mpsc::Receiver<TransportEvent>,
        bus: broadcast::Sender<ClassifiedText>,
    ) {
        let reason = loop {
            match events.recv().await {
                Some(TransportEvent::Ended { reason }) => break reason,
                Some(TransportEvent::Error { message }) => {
                    warn!(error = %message, "transport reported an error");
                }
                Some(TransportEvent::Spawned) => debug!("agent respawned"),
                Some(event) => self.route(&bus, event),
                None => break "transport event stream closed".to_string(),
            }
        };
        self.handle_session_end(epoch, reason);
    }

    fn route(&self, bus: &broadcast::Sender<ClassifiedText>, event: TransportEvent) {
        let now = Instant::now();
        match event {
            TransportEvent::Chat { sender, text } => {
                let classification =
                    lock(&self.classifier).classify_player_chat(&sender, &text, now);
                trace!(
                    sender = %sender,
                    disposition = ?classification.disposition,
                    "chat event classified"
                );
                if let Some(entry) = classification.entry {
                    lock(&self.chat_log).push(entry);
                }
            }
            TransportEvent::Broadcast { channel, text } => {
                let classification = lock(&self.classifier).classify(channel, &text, now);
                trace!(
                    ?channel,
                    disposition = ?classification.disposition,
                    "broadcast text classified"
                );
                if let Some(denial) = &classification.denial {
                    debug!(
                        category = ?denial.category,
                        text = %denial.text,
                        "denial signal observed"
                    );
                }
                if let Some(entry) = classification.entry {
                    lock(&self.chat_log).push(entry);
                }
                // No open windows means no receivers; that is fine.
                let _ = bus.send(ClassifiedText {
                    channel,
                    text,
                    disposition: classification.disposition,
                    denial: classification.denial,
                    received_at: now,
                });
            }
            TransportEvent::Spawned
            | TransportEvent::Error { .. }
            | TransportEvent::Ended { .. } => {}
        }
    }

    fn handle_session_end(self: &Arc<Self>, epoch: u64, reason: String) {
        let mut session = lock(&self.session);
        if self.current_epoch() != epoch || session.state != ConnectionState::Connected {
            return;
        }
        if let Some(live) = session.live.take() {
            live.close();
        }
        warn!(reason = %reason, "session ended");
        session.last_disconnect_reason = Some(reason);
        self.advance_epoch();
        if session.credentials.is_some() {
            self.schedule_retry(&mut session);
        } else {
            self.transition(&mut session, ConnectionState::Disconnected);
        }
    }

    /// Called with the session locked, after a session end or a failed retry.
    fn schedule_retry(self: &Arc<Self>, session: &mut Session<C::Link>) {
        let policy = &self.config.reconnect;
        let next = session.reconnect_attempt + 1;
        if next > policy.max_attempts {
            let exhausted = SessionError::AttemptBudgetExhausted {
                attempts: session.reconnect_attempt,
            };
            warn!(attempts = session.reconnect_attempt, "reconnect budget exhausted");
            session.credentials = None;
            session.next_retry_delay = None;
            session.last_disconnect_reason = Some(match session.last_disconnect_reason.take() {
                Some(reason) => format!("{exhausted} (last failure: {reason})"),
                None => exhausted.to_string(),
            });
            self.transition(session, ConnectionState::Disconnected);
            return;
        }

        let delay = policy.delay_for(next);
        session.reconnect_attempt = next;
        session.next_retry_delay = Some(delay);
        info!(
            attempt = next,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        if session.state == ConnectionState::Reconnecting {
            self.publish(session);
        } else {
            self.transition(session, ConnectionState::Reconnecting);
        }
        self.spawn_retry(self.current_epoch(), delay);
    }

    fn spawn_retry(self: &Arc<Self>, epoch: u64, delay: Duration) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut epochs = manager.epoch.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(delay) => manager.retry(epoch).await,
                _ = superseded(&mut epochs, epoch) => debug!("scheduled reconnect cancelled"),
            }
        });
    }

    async fn retry(self: &Arc<Self>, epoch: u64) {
        let (credentials, attempt) = {
            let mut session = lock(&self.session);
            if self.current_epoch() != epoch || session.state != ConnectionState::Reconnecting {
                return;
            }
            let Some(credentials) = session.credentials.clone() else {
                self.transition(&mut session, ConnectionState::Disconnected);
                return;
            };
            session.next_retry_delay = None;
            self.transition(&mut session, ConnectionState::Connecting);
            (credentials, session.reconnect_attempt)
        };

        info!(attempt, endpoint = %credentials.endpoint(), "reconnect attempt started");
        match self.establish(epoch, &credentials).await {
            Ok(()) => info!(attempt, "reconnected"),
            Err(err) => {
                let mut session = lock(&self.session);
                if self.current_epoch() != epoch || session.state != ConnectionState::Connecting {
                    return;
                }
                warn!(attempt, error = %err, "reconnect attempt failed");
                session.last_disconnect_reason = Some(err.to_string());
                self.schedule_retry(&mut session);
            }
        }
    }

    fn transition(&self, session: &mut Session<C::Link>, next: ConnectionState) {
        let previous = session.state;
        if previous == next {
            self.publish(session);
            return;
        }
        if !previous.can_transition_to(next) {
            warn!(from = %previous, to = %next, "unexpected session transition");
        }
        info!(
            from = %previous,
            to = %next,
            attempt = session.reconnect_attempt,
            "session state changed"
        );
        session.state = next;
        self.publish(session);
    }

    fn publish(&self, session: &Session<C::Link>) {
        self.status.send_replace(status_of(session, &self.config));
    }

    fn advance_epoch(&self) -> u64 {
        self.epoch.send_modify(|epoch| *epoch += 1);
        self.current_epoch()
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }
}

fn status_of<L>(session: &Session<L>, config: &SessionConfig) -> SessionStatus {
    SessionStatus {
        state: session.state,
        reconnect_attempt: session.reconnect_attempt,
        max_attempts: config.reconnect.max_attempts,
        last_disconnect_reason: session.last_disconnect_reason.clone(),
        next_retry_delay_ms: session.next_retry_delay.map(|delay| delay.as_millis() as u64),
        auto_reconnect: session.credentials.is_some(),
        identity: session
            .live
            .as_ref()
            .map(|live| live.identity.clone())
            .or_else(|| session.credentials.as_ref().map(|c| c.username.clone())),
        endpoint: session.credentials.as_ref().map(Credentials::endpoint),
        connected_at: session.live.as_ref().map(|live| live.connected_at),
    }
}

/// Resolves once the connection epoch has moved past `epoch`.
async fn superseded(epochs: &mut watch::Receiver<u64>, epoch: u64) {
    let _ = epochs.wait_for(|current| *current != epoch).await;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

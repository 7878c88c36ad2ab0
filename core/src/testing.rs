//! Scripted in-memory transport for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::action::WorldAction;
use crate::error::TransportError;
use crate::session::lock;
use crate::transport::{Channel, Connector, Credentials, Link, Snapshot, Target, TransportEvent};

pub(crate) fn credentials() -> Credentials {
    Credentials {
        host: "mc.example.net".to_string(),
        port: 25565,
        username: "Tether".to_string(),
        auth: None,
    }
}

pub(crate) enum ConnectPlan {
    Accept,
    /// Delivers these events before the spawn signal
    AcceptWith(Vec<TransportEvent>),
    Refuse(String),
    Hang,
}

/// What the world does when an action is performed.
#[derive(Clone, Default)]
pub(crate) struct PerformScript {
    /// New snapshot stored at the action's target
    pub(crate) apply: Option<Snapshot>,
    /// Informational lines sent after the given delay
    pub(crate) broadcasts: Vec<(Duration, String)>,
    pub(crate) fail: Option<TransportError>,
}

impl PerformScript {
    pub(crate) fn applies(snapshot: Snapshot) -> Self {
        Self {
            apply: Some(snapshot),
            ..Self::default()
        }
    }

    pub(crate) fn replies_after(mut self, delay_ms: u64, text: &str) -> Self {
        self.broadcasts.push((Duration::from_millis(delay_ms), text.to_string()));
        self
    }
}

#[derive(Default)]
struct FakeState {
    plans: VecDeque<ConnectPlan>,
    connect_times: Vec<Instant>,
    disconnects: u32,
    events: Option<mpsc::Sender<TransportEvent>>,
    snapshots: HashMap<Target, Snapshot>,
    script: PerformScript,
    replies: HashMap<String, Vec<String>>,
    commands: Vec<String>,
    performed: Vec<WorldAction>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn plan(&self, plan: ConnectPlan) {
        lock(&self.state).plans.push_back(plan);
    }

    pub(crate) fn connect_calls(&self) -> usize {
        lock(&self.state).connect_times.len()
    }

    pub(crate) fn connect_times(&self) -> Vec<Instant> {
        lock(&self.state).connect_times.clone()
    }

    pub(crate) fn disconnect_calls(&self) -> u32 {
        lock(&self.state).disconnects
    }

    pub(crate) fn set_snapshot(&self, target: Target, snapshot: Snapshot) {
        lock(&self.state).snapshots.insert(target, snapshot);
    }

    pub(crate) fn script_perform(&self, script: PerformScript) {
        lock(&self.state).script = script;
    }

    pub(crate) fn reply_to(&self, command: &str, lines: &[&str]) {
        lock(&self.state).replies.insert(
            command.to_string(),
            lines.iter().map(|line| line.to_string()).collect(),
        );
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    pub(crate) fn performed(&self) -> Vec<WorldAction> {
        lock(&self.state).performed.clone()
    }

    pub(crate) fn drop_connection(&self, reason: &str) {
        if let Some(events) = lock(&self.state).events.take() {
            let _ = events.try_send(TransportEvent::Ended {
                reason: reason.to_string(),
            });
        }
    }

    pub(crate) fn push_chat(&self, sender: &str, text: &str) {
        self.emit(TransportEvent::Chat {
            sender: sender.to_string(),
            text: text.to_string(),
        });
    }

    pub(crate) fn push_text(&self, channel: Channel, text: &str) {
        self.emit(TransportEvent::Broadcast {
            channel,
            text: text.to_string(),
        });
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = lock(&self.state).events.as_ref() {
            let _ = events.try_send(event);
        }
    }

    fn emit_later(&self, delay: Duration, text: String) {
        let connector = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            connector.push_text(Channel::Info, &text);
        });
    }
}

impl Connector for FakeConnector {
    type Link = FakeLink;

    async fn connect(
        &self,
        _credentials: &Credentials,
    ) -> Result<(FakeLink, mpsc::Receiver<TransportEvent>), TransportError> {
        let plan = {
            let mut state = lock(&self.state);
            state.connect_times.push(Instant::now());
            state.plans.pop_front().unwrap_or(ConnectPlan::Accept)
        };
        let early = match plan {
            ConnectPlan::Accept => Vec::new(),
            ConnectPlan::AcceptWith(events) => events,
            ConnectPlan::Refuse(message) => return Err(TransportError::Unavailable(message)),
            ConnectPlan::Hang => std::future::pending().await,
        };

        let (tx, rx) = mpsc::channel(64);
        for event in early {
            let _ = tx.try_send(event);
        }
        let _ = tx.try_send(TransportEvent::Spawned);
        lock(&self.state).events = Some(tx);
        Ok((
            FakeLink {
                connector: self.clone(),
            },
            rx,
        ))
    }
}

pub(crate) struct FakeLink {
    connector: FakeConnector,
}

impl Link for FakeLink {
    async fn send_command(&self, text: &str) -> Result<(), TransportError> {
        let replies = {
            let mut state = lock(&self.connector.state);
            state.commands.push(text.to_string());
            state.replies.get(text).cloned().unwrap_or_default()
        };
        for line in replies {
            self.connector.push_text(Channel::Info, &line);
        }
        Ok(())
    }

    async fn observe(&self, target: &Target) -> Result<Snapshot, TransportError> {
        Ok(lock(&self.connector.state)
            .snapshots
            .get(target)
            .cloned()
            .unwrap_or_default())
    }

    async fn perform(&self, action: &WorldAction) -> Result<(), TransportError> {
        let script = {
            let mut state = lock(&self.connector.state);
            state.performed.push(action.clone());
            let script = state.script.clone();
            if let (None, Some(snapshot)) = (&script.fail, &script.apply) {
                state.snapshots.insert(action.target(), snapshot.clone());
            }
            script
        };
        if let Some(err) = script.fail {
            return Err(err);
        }
        for (delay, text) in script.broadcasts {
            self.connector.emit_later(delay, text);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = lock(&self.connector.state);
        state.disconnects += 1;
        state.events = None;
    }
}

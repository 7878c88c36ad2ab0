//! Deadline-bound listening windows over the classified broadcast stream.
//!
//! A [`Subscription`] is a receiver on the per-session bus plus a handle on
//! the session's "closed" flag. Dropping it unsubscribes; a disconnect ends
//! every open window at once.

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::classifier::Disposition;
use crate::denial::DenialSignal;
use crate::transport::Channel;

/// One broadcast line after classification, as seen by listening windows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassifiedText {
    pub channel: Channel,
    pub text: String,
    pub disposition: Disposition,
    pub denial: Option<DenialSignal>,
    pub received_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowEnd {
    /// The deadline passed
    Elapsed,
    /// The session ended while the window was open
    Cancelled,
}

#[derive(Debug)]
pub struct Captured {
    pub texts: Vec<ClassifiedText>,
    pub end: WindowEnd,
}

impl Captured {
    pub fn denials(&self) -> Vec<DenialSignal> {
        self.texts
            .iter()
            .filter_map(|text| text.denial.clone())
            .collect()
    }
}

#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    label: &'static str,
    receiver: broadcast::Receiver<ClassifiedText>,
    closed: watch::Receiver<bool>,
}

impl Subscription {
    pub(crate) fn open(
        label: &'static str,
        bus: &broadcast::Sender<ClassifiedText>,
        closed: watch::Receiver<bool>,
    ) -> Self {
        let id = Uuid::now_v7();
        trace!(window_id = %id, label, "listening window opened");
        Self {
            id,
            label,
            receiver: bus.subscribe(),
            closed,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Resolves once the owning session has ended.
    pub async fn cancelled(&mut self) {
        session_closed(&mut self.closed).await;
    }

    /// Collects everything published until `deadline`, or until the session
    /// ends. Consumes the subscription, so the window is always torn down.
    pub async fn collect_until(mut self, deadline: Instant) -> Captured {
        let mut texts = Vec::new();
        let end = loop {
            tokio::select! {
                biased;
                _ = session_closed(&mut self.closed) => break WindowEnd::Cancelled,
                received = self.receiver.recv() => match received {
                    Ok(text) => texts.push(text),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            window_id = %self.id,
                            label = self.label,
                            skipped,
                            "listening window lagged behind the session bus"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break WindowEnd::Cancelled,
                },
                _ = tokio::time::sleep_until(deadline) => break WindowEnd::Elapsed,
            }
        };
        debug!(
            window_id = %self.id,
            label = self.label,
            captured = texts.len(),
            cancelled = end == WindowEnd::Cancelled,
            "listening window closed"
        );
        Captured { texts, end }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        trace!(window_id = %self.id, label = self.label, "listening window released");
    }
}

pub(crate) async fn session_closed(closed: &mut watch::Receiver<bool>) {
    // A dropped sender means the session is gone too.
    let _ = closed.wait_for(|closed| *closed).await;
}

//! The protected-action protocol: observe, open a capture window, act, let
//! the server settle, observe again and judge the outcome.
//!
//! Every mutating action that can touch third-party-owned state goes through
//! [`SessionManager::perform_protected_action`]; only the target and the
//! expectation differ between action kinds. Nothing here retries.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::action::{ActionKind, WorldAction};
use crate::claim::ClaimInfo;
use crate::denial::DenialSignal;
use crate::error::{SessionError, TransportError};
use crate::session::{SessionManager, lock};
use crate::subscription::WindowEnd;
use crate::transport::{Connector, Link, Target};
use crate::verifier::{Expectation, Verdict, verify};

#[derive(Clone, Debug)]
pub struct ProtectedAction {
    pub kind: ActionKind,
    pub target: Target,
    pub expectation: Expectation,
    /// The permission layer may reject this action without any text, so a
    /// `failed_unknown` verdict still warrants a claim lookup.
    pub silent_rejection: bool,
}

impl ProtectedAction {
    pub fn new(kind: ActionKind, target: Target, expectation: Expectation) -> Self {
        Self {
            kind,
            target,
            expectation,
            silent_rejection: kind.rejects_silently(),
        }
    }

    pub fn for_world_action(action: &WorldAction) -> Self {
        Self::new(action.kind(), action.target(), action.expectation())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ActionOutcome {
    pub action: ActionKind,
    pub target: Target,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub denial_text: Option<String>,
    /// Every denial captured in the window, in arrival order
    pub denials: Vec<DenialSignal>,
    pub claim_info: Option<ClaimInfo>,
    pub elapsed_ms: u64,
}

impl ActionOutcome {
    pub fn succeeded(&self) -> bool {
        self.verdict == Verdict::Succeeded
    }
}

/// Marks a target as under verification until dropped.
struct TargetGuard<'a> {
    in_flight: &'a Mutex<HashSet<Target>>,
    target: Target,
}

impl<'a> TargetGuard<'a> {
    fn acquire(
        in_flight: &'a Mutex<HashSet<Target>>,
        target: &Target,
    ) -> Result<Self, SessionError> {
        if !lock(in_flight).insert(target.clone()) {
            return Err(SessionError::VerificationBusy {
                target: target.to_string(),
            });
        }
        Ok(Self {
            in_flight,
            target: target.clone(),
        })
    }
}

impl Drop for TargetGuard<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(&self.target);
    }
}

impl<C: Connector> SessionManager<C> {
    /// Runs `perform` under the verification protocol and reports what
    /// actually happened. Errors are reserved for "could not even start"
    /// (no session, busy target, pre-action observation failed); everything
    /// after the action is issued resolves to a verdict.
    pub async fn perform_protected_action<F, Fut>(
        &self,
        action: ProtectedAction,
        perform: F,
    ) -> Result<ActionOutcome, SessionError>
    where
        F: FnOnce(Arc<C::Link>) -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let active = self.active()?;
        let _guard = TargetGuard::acquire(&self.in_flight, &action.target)?;
        let started = Instant::now();

        let before = active.link.observe(&action.target).await?;
        let mut subscription = active.subscribe("action_verification");
        let window_id = subscription.id();

        let performed = tokio::select! {
            biased;
            _ = subscription.cancelled() => {
                Err("session ended while the action was in flight".to_string())
            }
            result = tokio::time::timeout(
                self.config.action_timeout,
                perform(Arc::clone(&active.link)),
            ) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(format!("action failed: {err}")),
                Err(_) => Err(format!(
                    "action did not complete within {}ms",
                    self.config.action_timeout.as_millis()
                )),
            },
        };
        if let Err(reason) = performed {
            warn!(
                %window_id,
                kind = %action.kind,
                target = %action.target,
                reason = %reason,
                "protected action aborted"
            );
            let verdict = Verdict::FailedUnknown { reason };
            return Ok(outcome(&action, verdict, Vec::new(), None, started));
        }

        let captured = subscription
            .collect_until(Instant::now() + self.config.settle_delay)
            .await;
        let denials = captured.denials();
        if captured.end == WindowEnd::Cancelled {
            let verdict = Verdict::FailedUnknown {
                reason: "session ended during the verification window".to_string(),
            };
            return Ok(outcome(&action, verdict, denials, None, started));
        }

        let after = match active.link.observe(&action.target).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let verdict = Verdict::FailedUnknown {
                    reason: format!("could not re-observe {}: {err}", action.target),
                };
                return Ok(outcome(&action, verdict, denials, None, started));
            }
        };

        let verdict = verify(&before, &after, &action.expectation, &denials);
        let wants_claim_info = match verdict {
            Verdict::Succeeded => false,
            Verdict::Denied { .. } => true,
            Verdict::FailedUnknown { .. } => action.silent_rejection,
        };
        let claim_info = if wants_claim_info && self.config.claim.enabled {
            match self.lookup_claim().await {
                Ok(info) => Some(info),
                Err(err) => {
                    warn!(%window_id, error = %err, "claim lookup after rejected action failed");
                    None
                }
            }
        } else {
            None
        };

        let result = outcome(&action, verdict, denials, claim_info, started);
        info!(
            %window_id,
            kind = %action.kind,
            target = %action.target,
            verdict = result.verdict.as_str(),
            elapsed_ms = result.elapsed_ms,
            "protected action resolved"
        );
        Ok(result)
    }

    /// Convenience over [`perform_protected_action`](Self::perform_protected_action)
    /// using the action kind's default target and expectation.
    pub async fn perform_world_action(
        &self,
        action: WorldAction,
    ) -> Result<ActionOutcome, SessionError> {
        let protected = ProtectedAction::for_world_action(&action);
        self.perform_protected_action(protected, move |link| async move {
            link.perform(&action).await
        })
        .await
    }
}

fn outcome(
    action: &ProtectedAction,
    verdict: Verdict,
    denials: Vec<DenialSignal>,
    claim_info: Option<ClaimInfo>,
    started: Instant,
) -> ActionOutcome {
    let denial_text = match &verdict {
        Verdict::Denied { reason } => Some(reason.clone()),
        _ => None,
    };
    ActionOutcome {
        action: action.kind,
        target: action.target.clone(),
        verdict,
        denial_text,
        denials,
        claim_info,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

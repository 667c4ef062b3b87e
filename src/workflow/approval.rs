//! Approval gates
//!
//! Each workflow has at most one open gate. The driver opens it and waits;
//! `respond_to_approval` resolves it from outside.

use crate::shutdown::CancellationToken;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};

/// An approver's decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub comment: Option<String>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            comment: None,
        }
    }

    pub fn reject(comment: impl Into<String>) -> Self {
        Self {
            approved: false,
            comment: Some(comment.into()),
        }
    }
}

/// How waiting on a gate ended
#[derive(Debug, PartialEq)]
pub(crate) enum GateOutcome {
    Decided(ApprovalDecision),
    Expired,
    Cancelled,
}

struct OpenGate {
    step: String,
    sender: oneshot::Sender<ApprovalDecision>,
}

/// The decision slot for one workflow
#[derive(Default)]
pub(crate) struct ApprovalGate {
    open: Mutex<Option<OpenGate>>,
}

impl ApprovalGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Open the gate for a step, replacing any stale one
    pub(crate) async fn open(&self, step: &str) -> oneshot::Receiver<ApprovalDecision> {
        let (sender, receiver) = oneshot::channel();
        *self.open.lock().await = Some(OpenGate {
            step: step.to_string(),
            sender,
        });
        receiver
    }

    /// Deliver a decision; returns the step it resolved, if a gate was open
    pub(crate) async fn resolve(&self, decision: ApprovalDecision) -> Option<String> {
        let gate = self.open.lock().await.take()?;
        // The driver may have stopped waiting (expiry, cancel) a moment ago
        gate.sender.send(decision).ok()?;
        Some(gate.step)
    }

    pub(crate) async fn close(&self) {
        self.open.lock().await.take();
    }

    #[cfg(test)]
    pub(crate) async fn pending_step(&self) -> Option<String> {
        self.open.lock().await.as_ref().map(|g| g.step.clone())
    }
}

/// Wait for a decision, an optional expiry, or cancellation
pub(crate) async fn wait_for_decision(
    receiver: oneshot::Receiver<ApprovalDecision>,
    expiry: Option<Duration>,
    cancel: &CancellationToken,
) -> GateOutcome {
    let expired = async {
        match expiry {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        decision = receiver => match decision {
            Ok(decision) => GateOutcome::Decided(decision),
            // Gate replaced or dropped without a decision
            Err(_) => GateOutcome::Cancelled,
        },
        _ = expired => GateOutcome::Expired,
        _ = cancel.cancelled() => GateOutcome::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_open_gate() {
        let gate = ApprovalGate::new();
        let receiver = gate.open("deploy").await;
        assert_eq!(gate.pending_step().await.as_deref(), Some("deploy"));

        assert_eq!(
            gate.resolve(ApprovalDecision::approve()).await.as_deref(),
            Some("deploy")
        );
        let outcome = wait_for_decision(receiver, None, &CancellationToken::new()).await;
        assert_eq!(outcome, GateOutcome::Decided(ApprovalDecision::approve()));
        assert!(gate.pending_step().await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_without_open_gate() {
        let gate = ApprovalGate::new();
        assert!(gate.resolve(ApprovalDecision::approve()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let gate = ApprovalGate::new();
        let receiver = gate.open("deploy").await;
        let outcome = wait_for_decision(
            receiver,
            Some(Duration::from_secs(60)),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, GateOutcome::Expired);

        // A late decision finds the receiver gone
        assert!(gate.resolve(ApprovalDecision::approve()).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let gate = ApprovalGate::new();
        let receiver = gate.open("deploy").await;
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            wait_for_decision(receiver, None, &token).await,
            GateOutcome::Cancelled
        );
    }
}

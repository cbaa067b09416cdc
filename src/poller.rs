//! Cast status polling
//!
//! After a cast is submitted the bridge canister walks it through a
//! sub-state machine:
//!
//! ```text
//! Created -> SubmittingToOrchestrator -> SubmittedToOrchestrator
//!         -> WaitingOnContract -> WaitingOnMint -> WaitingOnTransfer
//!         -> Completed | RemoteFinalized | Error
//! ```
//!
//! [`CastStatusPoller`] reads those states on a fixed interval for a bounded
//! number of attempts. Intermediate states are reported as progress messages;
//! only terminal states (or exhaustion) end the loop. Remote collection
//! deployments are polled by the same loop.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::env_or;
use crate::error::{BridgeError, BridgeResult};
use crate::ic::{BridgeCanister, DeploymentState};
use crate::signal::{CancelSignal, ProgressSink};
use crate::types::CastId;

/// Bridge-side state of one cast
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastState {
    Created,
    SubmittingToOrchestrator,
    SubmittedToOrchestrator,
    WaitingOnContract,
    WaitingOnMint,
    WaitingOnTransfer,
    Completed,
    RemoteFinalized,
    Error(String),
}

impl CastState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CastState::Completed | CastState::RemoteFinalized | CastState::Error(_)
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CastState::Completed | CastState::RemoteFinalized)
    }

    pub fn label(&self) -> &str {
        match self {
            CastState::Created => "Created",
            CastState::SubmittingToOrchestrator => "SubmittingToOrchestrator",
            CastState::SubmittedToOrchestrator => "SubmittedToOrchestrator",
            CastState::WaitingOnContract => "WaitingOnContract",
            CastState::WaitingOnMint => "WaitingOnMint",
            CastState::WaitingOnTransfer => "WaitingOnTransfer",
            CastState::Completed => "Completed",
            CastState::RemoteFinalized => "RemoteFinalized",
            CastState::Error(_) => "Error",
        }
    }
}

impl fmt::Display for CastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CastState::Error(msg) => write!(f, "Error: {}", msg),
            other => f.write_str(other.label()),
        }
    }
}

/// Poll cadence
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 120,
        }
    }
}

impl PollerConfig {
    /// Read `CAST_POLL_INTERVAL_MS` / `CAST_POLL_MAX_ATTEMPTS`, falling back
    /// to the defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: Duration::from_millis(env_or(
                "CAST_POLL_INTERVAL_MS",
                defaults.interval.as_millis() as u64,
            )),
            max_attempts: env_or("CAST_POLL_MAX_ATTEMPTS", defaults.max_attempts).max(1),
        }
    }
}

/// Final state of every cast in a successful poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastOutcome {
    pub states: Vec<(CastId, CastState)>,
    /// Status reads it took
    pub attempts: u32,
}

/// Bounded, cancellable status loop over the bridge canister
pub struct CastStatusPoller {
    bridge: Arc<dyn BridgeCanister>,
    config: PollerConfig,
}

impl CastStatusPoller {
    pub fn new(bridge: Arc<dyn BridgeCanister>, config: PollerConfig) -> Self {
        Self { bridge, config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Poll until every cast is terminal.
    ///
    /// Any `Error` ends the loop with [`BridgeError::RemoteError`] carrying
    /// every cast's latest state. Running out of attempts yields
    /// [`BridgeError::RemoteTimeout`]. Transient read failures consume an
    /// attempt and are otherwise ignored.
    pub async fn poll_until_terminal(
        &self,
        ids: &[CastId],
        progress: &ProgressSink,
        cancel: &CancelSignal,
    ) -> BridgeResult<CastOutcome> {
        let mut latest: BTreeMap<CastId, CastState> =
            ids.iter().map(|id| (id.clone(), CastState::Created)).collect();
        if ids.is_empty() {
            return Ok(CastOutcome {
                states: Vec::new(),
                attempts: 0,
            });
        }

        let mut cancel = cancel.clone();
        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }

            match self.bridge.cast_status(ids).await {
                Ok(states) => {
                    let mut changed = Vec::new();
                    for (id, state) in ids.iter().zip(states) {
                        let Some(state) = state else { continue };
                        let Some(previous) = latest.get_mut(id) else { continue };
                        // terminal states are final even if a later read lags
                        if previous.is_terminal() || *previous == state {
                            continue;
                        }
                        *previous = state;
                        changed.push(id);
                    }
                    let done = ids_done(&latest);
                    for id in changed {
                        let state = &latest[id];
                        progress.report(&format!("{}: {} ({}/{} complete)", id, state, done, ids.len()));
                        debug!(cast = %id, state = %state, attempt, "Cast state changed");
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, attempt, "Cast status read failed, will retry");
                }
                Err(e) => return Err(e.into()),
            }

            if let Some((id, message)) = first_error(&latest) {
                warn!(cast = %id, error = %message, "Cast failed on the remote side");
                return Err(BridgeError::RemoteError {
                    message: format!("{}: {}", id, message),
                    partial: snapshot(&latest),
                });
            }
            if latest.values().all(CastState::is_success) {
                info!(casts = ids.len(), attempts = attempt, "All casts completed");
                return Ok(CastOutcome {
                    states: snapshot(&latest),
                    attempts: attempt,
                });
            }

            if attempt < self.config.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
        }

        warn!(
            attempts = self.config.max_attempts,
            pending = ids.len() - ids_done(&latest),
            "Cast polling exhausted"
        );
        Err(BridgeError::RemoteTimeout {
            attempts: self.config.max_attempts,
            last_states: snapshot(&latest),
        })
    }

    /// Poll a remote collection deployment until `Deployed` or `Failed`.
    ///
    /// Returns the deployed collection address.
    pub async fn poll_deployment(
        &self,
        deployment_id: u128,
        progress: &ProgressSink,
        cancel: &CancelSignal,
    ) -> BridgeResult<String> {
        let mut cancel = cancel.clone();
        let mut last: Option<DeploymentState> = None;
        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }

            match self.bridge.deployment_status(deployment_id).await {
                Ok(DeploymentState::Deployed { address }) => {
                    info!(deployment_id, address = %address, attempts = attempt, "Remote collection deployed");
                    return Ok(address);
                }
                Ok(DeploymentState::Failed { reason }) => {
                    return Err(BridgeError::RemoteError {
                        message: format!("deployment {} failed: {}", deployment_id, reason),
                        partial: Vec::new(),
                    });
                }
                Ok(state) => {
                    if last.as_ref() != Some(&state) {
                        progress.report(&format!("deployment {}: {:?}", deployment_id, state));
                        last = Some(state);
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, attempt, "Deployment status read failed, will retry");
                }
                Err(e) => return Err(e.into()),
            }

            if attempt < self.config.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
        }

        Err(BridgeError::RemoteTimeout {
            attempts: self.config.max_attempts,
            last_states: Vec::new(),
        })
    }
}

fn ids_done(states: &BTreeMap<CastId, CastState>) -> usize {
    states.values().filter(|s| s.is_success()).count()
}

fn first_error(states: &BTreeMap<CastId, CastState>) -> Option<(&CastId, &str)> {
    states.iter().find_map(|(id, s)| match s {
        CastState::Error(msg) => Some((id, msg.as_str())),
        _ => None,
    })
}

fn snapshot(states: &BTreeMap<CastId, CastState>) -> Vec<(CastId, CastState)> {
    states.iter().map(|(id, s)| (id.clone(), s.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;
    use crate::signal::cancel_pair;
    use crate::testing::MockBridgeCanister;
    use std::sync::Mutex;

    fn fast() -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(1),
            max_attempts: 5,
        }
    }

    fn recording_sink() -> (ProgressSink, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            ProgressSink::new(move |m| seen.lock().unwrap().push(m.to_string()))
        };
        (sink, seen)
    }

    #[test]
    fn test_terminal_classification() {
        assert!(CastState::Completed.is_success());
        assert!(CastState::RemoteFinalized.is_success());
        assert!(CastState::Error("x".into()).is_terminal());
        assert!(!CastState::Error("x".into()).is_success());
        assert!(!CastState::WaitingOnMint.is_terminal());
    }

    #[tokio::test]
    async fn test_reaches_remote_finalized() {
        let bridge = Arc::new(MockBridgeCanister::new());
        bridge.script_cast_status(vec![
            vec![Some(CastState::SubmittedToOrchestrator)],
            vec![Some(CastState::WaitingOnMint)],
            vec![Some(CastState::RemoteFinalized)],
        ]);
        let poller = CastStatusPoller::new(bridge.clone(), fast());
        let (sink, seen) = recording_sink();

        let outcome = poller
            .poll_until_terminal(&[CastId(7)], &sink, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(outcome.states, vec![(CastId(7), CastState::RemoteFinalized)]);
        assert_eq!(outcome.attempts, 3);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[1].contains("WaitingOnMint"));
    }

    #[tokio::test]
    async fn test_error_state_fails_with_partial_results() {
        let bridge = Arc::new(MockBridgeCanister::new());
        bridge.script_cast_status(vec![
            vec![Some(CastState::WaitingOnMint), Some(CastState::WaitingOnMint)],
            vec![Some(CastState::Completed), Some(CastState::Error("mint reverted".into()))],
        ]);
        let poller = CastStatusPoller::new(bridge, fast());

        let err = poller
            .poll_until_terminal(&[CastId(1), CastId(2)], &ProgressSink::tracing("test"), &CancelSignal::never())
            .await
            .unwrap_err();
        match err {
            BridgeError::RemoteError { message, partial } => {
                assert!(message.contains("mint reverted"));
                assert_eq!(partial[0], (CastId(1), CastState::Completed));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exhaustion_is_timeout_not_remote_error() {
        let bridge = Arc::new(MockBridgeCanister::new());
        bridge.script_cast_status(vec![vec![Some(CastState::WaitingOnTransfer)]]);
        let poller = CastStatusPoller::new(bridge.clone(), fast());

        let err = poller
            .poll_until_terminal(&[CastId(3)], &ProgressSink::tracing("test"), &CancelSignal::never())
            .await
            .unwrap_err();
        match &err {
            BridgeError::RemoteTimeout { attempts, last_states } => {
                assert_eq!(*attempts, 5);
                assert_eq!(last_states[0].1, CastState::WaitingOnTransfer);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.is_retryable());
        assert_eq!(bridge.cast_status_calls(), 5);
    }

    #[tokio::test]
    async fn test_transient_read_errors_consume_attempts() {
        let bridge = Arc::new(MockBridgeCanister::new());
        bridge.fail_cast_status_once(AdapterError::rpc("bridge", "503"));
        bridge.script_cast_status(vec![vec![Some(CastState::Completed)]]);
        let poller = CastStatusPoller::new(bridge, fast());

        let outcome = poller
            .poll_until_terminal(&[CastId(9)], &ProgressSink::tracing("test"), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let bridge = Arc::new(MockBridgeCanister::new());
        bridge.script_cast_status(vec![vec![Some(CastState::WaitingOnMint)]]);
        let poller = CastStatusPoller::new(
            bridge,
            PollerConfig {
                interval: Duration::from_secs(30),
                max_attempts: 10,
            },
        );
        let (handle, signal) = cancel_pair();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });

        let err = poller
            .poll_until_terminal(&[CastId(4)], &ProgressSink::tracing("test"), &signal)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_deployment_polling() {
        let bridge = Arc::new(MockBridgeCanister::new());
        bridge.script_deployment(vec![
            DeploymentState::Pending,
            DeploymentState::Deploying,
            DeploymentState::Deployed {
                address: "0xmirror".into(),
            },
        ]);
        let poller = CastStatusPoller::new(bridge, fast());
        let address = poller
            .poll_deployment(1, &ProgressSink::tracing("test"), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(address, "0xmirror");
    }
}

//! Workflow, poller and reconciliation properties

use async_trait::async_trait;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use cknft_bridge::cost::reconcile;
use cknft_bridge::ic::Allowance;
use cknft_bridge::testing::{init_tracing, MockBridgeCanister, ScriptedAction};
use cknft_bridge::workflow::{StepContext, Submission};
use cknft_bridge::{
    buffered_amount, AdapterError, AllowanceStatus, ApprovalPurpose, BridgeError, BridgeResult, BridgeWorkflow,
    CastId, CastState, CastStatusPoller, Chain, ContractPointer, CostBreakdown, LiveFunds, PollerConfig,
    StageSpec, StepAction, StepStatus,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn single_step(id: &str, action: Arc<dyn StepAction>) -> BridgeWorkflow {
    BridgeWorkflow::new(vec![StageSpec::new("execute", "Execute").step(id, id, action)]).unwrap()
}

fn breakdown(total: u128) -> CostBreakdown {
    CostBreakdown {
        source: ContractPointer::new(Chain::evm(1), "0x1111111111111111111111111111111111111111"),
        target: Chain::InternetComputer,
        deployment_cost: None,
        per_asset_cost: total,
        asset_count: 1,
        native_funding_required: 0,
        total,
    }
}

proptest! {
    #[test]
    fn approval_amount_is_ceil_of_120_percent(cost in any::<u64>()) {
        let cost = cost as u128;
        let expected = (cost * 12 + 9) / 10;
        prop_assert_eq!(buffered_amount(cost), expected);

        let status = AllowanceStatus::evaluate(ApprovalPurpose::Cast, "spender", Allowance::default(), cost, 0);
        prop_assert_eq!(status.required, expected);
    }

    #[test]
    fn buffer_never_shrinks_a_cost(a in any::<u64>(), b in any::<u64>()) {
        let (lo, hi) = if a <= b { (a as u128, b as u128) } else { (b as u128, a as u128) };
        prop_assert!(buffered_amount(lo) >= lo);
        prop_assert!(buffered_amount(lo) <= buffered_amount(hi));
    }

    #[test]
    fn failed_never_completes_without_loading(failures in 0usize..5) {
        let rt = runtime();
        let action = Arc::new(ScriptedAction::new());
        for _ in 0..failures {
            action.fail_submit(BridgeError::Adapter(AdapterError::rpc("evm:1", "connection reset")));
        }
        let workflow = single_step("step", action.clone());

        rt.block_on(async {
            let mut result = workflow.start().await;
            while result.is_err() {
                result = workflow.retry_step("step").await;
            }
        });

        let transitions = workflow.transitions();
        prop_assert_eq!(transitions.len(), 2 + 2 * failures);
        for t in &transitions {
            prop_assert!(t.from.can_transition_to(t.to));
            prop_assert!(!(t.from == StepStatus::Failed && t.to == StepStatus::Completed));
        }
        prop_assert_eq!(action.submit_count(), failures + 1);
    }
}

#[tokio::test]
async fn test_non_retryable_step_never_reenters_loading() {
    init_tracing();
    let action = Arc::new(ScriptedAction::new());
    action.fail_submit(BridgeError::RemoteError {
        message: "cast-1: mint reverted".to_string(),
        partial: Vec::new(),
    });
    let workflow = single_step("cast", action.clone());

    assert_err!(workflow.start().await);
    for _ in 0..3 {
        assert!(matches!(
            workflow.retry_step("cast").await,
            Err(BridgeError::InvalidTransition { .. })
        ));
    }
    let loading_entries = workflow
        .transitions()
        .iter()
        .filter(|t| t.to == StepStatus::Loading)
        .count();
    assert_eq!(loading_entries, 1);
    assert_eq!(action.submit_count(), 1);
    assert_eq!(workflow.snapshot().step("cast").unwrap().status, StepStatus::Failed);
}

/// Polls one cast, as the execution step does
struct PollCast {
    poller: CastStatusPoller,
}

#[async_trait]
impl StepAction for PollCast {
    fn irreversible(&self) -> bool {
        true
    }

    async fn submit(&self, _ctx: &StepContext) -> BridgeResult<Submission> {
        Ok(Submission::with_ids(vec![1]))
    }

    async fn confirm(&self, submission: &Submission, ctx: &StepContext) -> BridgeResult<()> {
        let ids: Vec<CastId> = submission.ids.iter().copied().map(CastId).collect();
        self.poller
            .poll_until_terminal(&ids, &ctx.progress, &ctx.cancel)
            .await
            .map(|_| ())
    }
}

fn poll_workflow(script: Vec<CastState>) -> BridgeWorkflow {
    let bridge = Arc::new(MockBridgeCanister::new());
    bridge.script_cast_status(script.into_iter().map(|s| vec![Some(s)]).collect());
    let poller = CastStatusPoller::new(
        bridge,
        PollerConfig {
            interval: Duration::from_millis(1),
            max_attempts: 6,
        },
    );
    single_step("cast", Arc::new(PollCast { poller }))
}

#[tokio::test]
async fn test_poll_ending_in_error_fails_step() {
    init_tracing();
    let workflow = poll_workflow(vec![
        CastState::SubmittingToOrchestrator,
        CastState::WaitingOnContract,
        CastState::Error("mint reverted".to_string()),
    ]);
    let err = workflow.start().await.unwrap_err();
    assert!(matches!(err, BridgeError::RemoteError { .. }));
    let snapshot = workflow.snapshot();
    let step = snapshot.step("cast").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(!step.retryable);
}

#[tokio::test]
async fn test_poll_ending_remote_finalized_completes_step() {
    let workflow = poll_workflow(vec![
        CastState::SubmittedToOrchestrator,
        CastState::WaitingOnMint,
        CastState::WaitingOnTransfer,
        CastState::RemoteFinalized,
    ]);
    let snapshot = assert_ok!(workflow.start().await);
    assert_eq!(snapshot.step("cast").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn test_poll_without_terminal_state_times_out() {
    let workflow = poll_workflow(vec![CastState::WaitingOnMint]);
    let err = workflow.start().await.unwrap_err();
    assert!(matches!(err, BridgeError::RemoteTimeout { attempts: 6, .. }));
    let snapshot = workflow.snapshot();
    let step = snapshot.step("cast").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error.as_deref().unwrap().contains("timed out"));
    assert!(step.submitted);
}

#[tokio::test]
async fn test_cancel_stops_polling() {
    let bridge = Arc::new(MockBridgeCanister::new());
    bridge.script_cast_status(vec![vec![Some(CastState::WaitingOnMint)]]);
    let poller = CastStatusPoller::new(
        bridge.clone(),
        PollerConfig {
            interval: Duration::from_millis(50),
            max_attempts: 1_000,
        },
    );
    let workflow = Arc::new(single_step("cast", Arc::new(PollCast { poller })));
    let handle = workflow.cancel_handle();

    let running = {
        let workflow = workflow.clone();
        tokio::spawn(async move { workflow.start().await })
    };
    tokio::time::sleep(Duration::from_millis(120)).await;
    handle.cancel();

    let result = running.await.unwrap();
    assert!(matches!(result, Err(BridgeError::Cancelled)));
    assert!(bridge.cast_status_calls() < 10);
    let snapshot = workflow.snapshot();
    assert!(snapshot.cancelled);
    let step = snapshot.step("cast").unwrap();
    assert!(step.submitted);
    assert_eq!(step.status, StepStatus::Loading);
    assert!(step.error.is_none());
    assert!(matches!(workflow.start().await, Err(BridgeError::Cancelled)));
}

#[test]
fn test_reconcile_against_buffered_balance() {
    let live = |fee_balance| LiveFunds {
        fee_balance,
        native_balance: None,
        allowances: Vec::new(),
        now: 0,
    };
    assert!(!reconcile(&breakdown(100), &live(100)).sufficient_fee);
    assert!(reconcile(&breakdown(100), &live(120)).sufficient_fee);
}

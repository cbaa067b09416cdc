//! Bridge workflow state machine
//!
//! A workflow is an ordered list of stages, each an ordered list of steps.
//! Every step moves through
//!
//! ```text
//! Pending -> Loading -> Completed
//!                    -> Failed -> (retry_step) -> Loading
//! ```
//!
//! Steps run strictly in declared order. A failed step halts the workflow
//! until it is retried (when `retryable`) or the workflow is cancelled.
//! Stage status is derived from its steps and never stored.
//!
//! Each step runs a [`StepAction`] in two phases: `submit` and `confirm`.
//! For irreversible actions the submission is recorded the moment it
//! succeeds; a retry after that point skips `submit` and resumes at
//! `confirm`, so the irreversible leg runs at most once.
//!
//! An irreversible submit that times out, or whose future is dropped
//! mid-call, may still have landed. The step is marked `submitted` and
//! fails without retry, so the leg is never sent twice.
//!
//! A run whose future is dropped while a step is Loading leaves that step
//! Failed and retryable. Cancellation leaves recorded step state as it was
//! and only flags the snapshot `cancelled`.
//!
//! Callers observe the workflow only through [`WorkflowSnapshot`]s
//! (`snapshot()` or a `subscribe()` receiver).

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{AdapterErrorKind, BridgeError, BridgeResult};
use crate::signal::{cancel_pair, CancelHandle, CancelSignal, ProgressSink};

pub mod plan;

pub use plan::{BridgePlan, BridgeRequest, BridgeServices, PlanOutputs};

// ============================================================================
// Steps and stages
// ============================================================================

/// Coarse status of a step (and, derived, of a stage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StepStatus {
    Pending,
    Loading,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Loading => "loading",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    /// Whether `self -> next` is an edge of the step state machine
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Loading)
                | (StepStatus::Loading, StepStatus::Completed)
                | (StepStatus::Loading, StepStatus::Failed)
                | (StepStatus::Failed, StepStatus::Loading)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeStep {
    pub id: String,
    pub title: String,
    /// Id of the stage this step belongs to
    pub stage: String,
    pub status: StepStatus,
    pub error: Option<String>,
    pub tx_hash: Option<String>,
    /// Meaningful once Failed: whether `retry_step` is accepted
    pub retryable: bool,
    /// Latest progress message reported while Loading
    pub progress: Option<String>,
    /// An irreversible submission for this step went through
    pub submitted: bool,
}

impl BridgeStep {
    fn new(stage: &str, id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            stage: stage.to_string(),
            status: StepStatus::Pending,
            error: None,
            tx_hash: None,
            retryable: false,
            progress: None,
            submitted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeStage {
    pub id: String,
    pub title: String,
    pub steps: Vec<BridgeStep>,
}

impl BridgeStage {
    /// Aggregate status: `Completed` iff every step is, `Failed` iff a step
    /// failed and none is running, `Loading` while work is under way,
    /// `Pending` before any step started.
    pub fn status(&self) -> StepStatus {
        let any = |status: StepStatus| self.steps.iter().any(|s| s.status == status);
        if self.steps.iter().all(|s| s.status == StepStatus::Completed) {
            StepStatus::Completed
        } else if any(StepStatus::Loading) {
            StepStatus::Loading
        } else if any(StepStatus::Failed) {
            StepStatus::Failed
        } else if any(StepStatus::Completed) {
            StepStatus::Loading
        } else {
            StepStatus::Pending
        }
    }
}

/// Everything a caller may observe about a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowSnapshot {
    pub stages: Vec<BridgeStage>,
    pub cancelled: bool,
}

impl WorkflowSnapshot {
    pub fn steps(&self) -> impl Iterator<Item = &BridgeStep> {
        self.stages.iter().flat_map(|stage| stage.steps.iter())
    }

    pub fn step(&self, id: &str) -> Option<&BridgeStep> {
        self.steps().find(|s| s.id == id)
    }

    pub fn stage(&self, id: &str) -> Option<&BridgeStage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// The step that halted the workflow, if any
    pub fn failed_step(&self) -> Option<&BridgeStep> {
        self.steps().find(|s| s.status == StepStatus::Failed)
    }

    pub fn active_step(&self) -> Option<&BridgeStep> {
        self.steps().find(|s| s.status == StepStatus::Loading)
    }

    pub fn is_complete(&self) -> bool {
        self.steps().all(|s| s.status == StepStatus::Completed)
    }
}

/// One recorded status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub step: String,
    pub from: StepStatus,
    pub to: StepStatus,
}

// ============================================================================
// Actions
// ============================================================================

/// What a step's `submit` phase produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub tx_hash: Option<String>,
    /// Remote identifiers to confirm (cast ids, deployment id, ledger block)
    pub ids: Vec<u128>,
    /// Parts of the submission the remote side refused outright
    pub rejected: Vec<String>,
}

impl Submission {
    /// Nothing was submitted
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_ids(ids: Vec<u128>) -> Self {
        Self {
            ids,
            ..Self::default()
        }
    }

    pub fn tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }
}

/// Handed to actions while their step is Loading
#[derive(Debug, Clone)]
pub struct StepContext {
    pub step_id: String,
    /// Updates the step's progress message
    pub progress: ProgressSink,
    pub cancel: CancelSignal,
}

/// The work behind one step
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Whether `submit` has effects that must never be repeated once it
    /// succeeded (burn, lock, cast submission)
    fn irreversible(&self) -> bool {
        false
    }

    async fn submit(&self, ctx: &StepContext) -> BridgeResult<Submission>;

    /// Confirm a submission. Must be safe to run more than once.
    async fn confirm(&self, _submission: &Submission, _ctx: &StepContext) -> BridgeResult<()> {
        Ok(())
    }
}

/// Declared stage, before the workflow is built
pub struct StageSpec {
    id: String,
    title: String,
    steps: Vec<(String, String, Arc<dyn StepAction>)>,
}

impl StageSpec {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, id: &str, title: &str, action: Arc<dyn StepAction>) -> Self {
        self.steps.push((id.to_string(), title.to_string(), action));
        self
    }
}

// ============================================================================
// Workflow
// ============================================================================

struct StepSlot {
    id: String,
    stage: usize,
    index: usize,
    action: Arc<dyn StepAction>,
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Fails a step whose run was dropped while it was Loading
struct Interrupted<'a> {
    workflow: &'a BridgeWorkflow,
    slot: usize,
    /// An irreversible submit was in flight
    submitting: &'a AtomicBool,
    armed: bool,
}

impl Drop for Interrupted<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let ambiguous = self.submitting.load(Ordering::SeqCst);
        let error = if ambiguous {
            "interrupted during an irreversible submission; outcome unknown"
        } else {
            "interrupted before the step finished"
        };
        let _ = self.workflow.transition(self.slot, StepStatus::Failed, |step| {
            step.error = Some(error.to_string());
            step.retryable = !ambiguous;
            step.submitted |= ambiguous;
        });
        warn!(step = %self.workflow.slots[self.slot].id, ambiguous, "Step interrupted");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct BridgeWorkflow {
    slots: Vec<StepSlot>,
    state: Arc<watch::Sender<WorkflowSnapshot>>,
    submissions: Mutex<HashMap<String, Submission>>,
    transitions: Mutex<Vec<Transition>>,
    cancel: CancelHandle,
    running: AtomicBool,
}

impl BridgeWorkflow {
    /// Build a workflow with every step Pending. Step ids must be unique.
    pub fn new(stages: Vec<StageSpec>) -> BridgeResult<Self> {
        let mut seen = HashSet::new();
        let mut slots = Vec::new();
        let mut snapshot_stages = Vec::new();

        for (stage_index, stage) in stages.into_iter().enumerate() {
            let mut steps = Vec::new();
            for (index, (id, title, action)) in stage.steps.into_iter().enumerate() {
                if !seen.insert(id.clone()) {
                    return Err(BridgeError::InvalidRequest(format!("duplicate step id {}", id)));
                }
                steps.push(BridgeStep::new(&stage.id, &id, &title));
                slots.push(StepSlot {
                    id,
                    stage: stage_index,
                    index,
                    action,
                });
            }
            snapshot_stages.push(BridgeStage {
                id: stage.id,
                title: stage.title,
                steps,
            });
        }

        let (state, _) = watch::channel(WorkflowSnapshot {
            stages: snapshot_stages,
            cancelled: false,
        });
        let (cancel, _) = cancel_pair();
        Ok(Self {
            slots,
            state: Arc::new(state),
            submissions: Mutex::new(HashMap::new()),
            transitions: Mutex::new(Vec::new()),
            cancel,
            running: AtomicBool::new(false),
        })
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver that sees every published snapshot change
    pub fn subscribe(&self) -> watch::Receiver<WorkflowSnapshot> {
        self.state.subscribe()
    }

    /// Every status change so far, oldest first
    pub fn transitions(&self) -> Vec<Transition> {
        lock(&self.transitions).clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Abort the workflow. A running poll stops at its next check; recorded
    /// step state is kept. Nothing runs afterwards.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.state.send_modify(|s| s.cancelled = true);
        info!("Workflow cancelled");
    }

    /// Run pending steps in order until all complete or one fails
    pub async fn start(&self) -> BridgeResult<WorkflowSnapshot> {
        let _guard = self.enter()?;
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        self.advance().await
    }

    /// Re-run a failed, retryable step, then continue with the steps after it
    pub async fn retry_step(&self, step_id: &str) -> BridgeResult<WorkflowSnapshot> {
        let _guard = self.enter()?;
        let slot = self
            .slots
            .iter()
            .position(|s| s.id == step_id)
            .ok_or_else(|| invalid(step_id, "no such step"))?;
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let step = self.step_at(slot);
        if step.status != StepStatus::Failed {
            return Err(invalid(step_id, &format!("step is {}, not failed", step.status)));
        }
        if !step.retryable {
            return Err(invalid(step_id, "step failed with a non-retryable error"));
        }

        info!(step = %step_id, "Retrying step");
        self.execute(slot).await?;
        self.advance().await
    }

    fn enter(&self) -> BridgeResult<RunGuard<'_>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(invalid("workflow", "already running"));
        }
        Ok(RunGuard(&self.running))
    }

    fn step_at(&self, slot: usize) -> BridgeStep {
        let slot = &self.slots[slot];
        self.state.borrow().stages[slot.stage].steps[slot.index].clone()
    }

    async fn advance(&self) -> BridgeResult<WorkflowSnapshot> {
        for slot in 0..self.slots.len() {
            let step = self.step_at(slot);
            match step.status {
                StepStatus::Completed => continue,
                StepStatus::Pending => {}
                StepStatus::Failed => {
                    return Err(invalid(&step.id, "step failed; retry it or cancel the workflow"));
                }
                StepStatus::Loading => return Err(invalid(&step.id, "step is already running")),
            }
            if self.cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            self.execute(slot).await?;
        }
        info!(steps = self.slots.len(), "Workflow complete");
        Ok(self.snapshot())
    }

    /// Move one step through Loading to Completed or Failed
    async fn execute(&self, slot: usize) -> BridgeResult<()> {
        self.transition(slot, StepStatus::Loading, |step| {
            step.error = None;
            step.progress = None;
        })?;

        let id = self.slots[slot].id.clone();
        info!(step = %id, "Step started");
        let ctx = self.context(slot);
        let submitting = AtomicBool::new(false);
        let mut interrupted = Interrupted {
            workflow: self,
            slot,
            submitting: &submitting,
            armed: true,
        };

        let result = self.run_action(slot, &ctx, &submitting).await;
        interrupted.armed = false;
        match result {
            Ok(()) => {
                self.transition(slot, StepStatus::Completed, |step| {
                    step.progress = None;
                    step.retryable = false;
                })?;
                info!(step = %id, "Step completed");
                Ok(())
            }
            Err(BridgeError::Cancelled) => {
                self.cancel.cancel();
                self.state.send_modify(|s| s.cancelled = true);
                info!(step = %id, "Step cancelled, state left as recorded");
                Err(BridgeError::Cancelled)
            }
            Err(e) => {
                let retryable = e.is_retryable();
                let message = e.to_string();
                self.transition(slot, StepStatus::Failed, |step| {
                    step.error = Some(message);
                    step.retryable = retryable;
                })?;
                warn!(step = %id, error = %e, retryable, "Step failed");
                Err(e)
            }
        }
    }

    async fn run_action(&self, slot: usize, ctx: &StepContext, submitting: &AtomicBool) -> BridgeResult<()> {
        let StepSlot { id, action, .. } = &self.slots[slot];
        let recorded = lock(&self.submissions).get(id).cloned();

        let submission = match recorded {
            Some(submission) => {
                debug!(step = %id, "Submission already recorded, resuming at confirmation");
                submission
            }
            None if action.irreversible() => {
                submitting.store(true, Ordering::SeqCst);
                let submitted = action.submit(ctx).await;
                submitting.store(false, Ordering::SeqCst);
                match submitted {
                    Ok(submission) => {
                        self.record_submission(slot, &submission);
                        submission
                    }
                    Err(BridgeError::Adapter(e)) if e.kind == AdapterErrorKind::Timeout => {
                        self.mark_ambiguous(slot);
                        return Err(BridgeError::RemoteError {
                            message: format!("submission outcome unknown, not resubmitting: {}", e),
                            partial: Vec::new(),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
            None => action.submit(ctx).await?,
        };
        action.confirm(&submission, ctx).await
    }

    fn record_submission(&self, slot: usize, submission: &Submission) {
        let StepSlot { id, stage, index, .. } = &self.slots[slot];
        lock(&self.submissions).insert(id.clone(), submission.clone());
        self.state.send_modify(|s| {
            let step = &mut s.stages[*stage].steps[*index];
            step.submitted = true;
            if submission.tx_hash.is_some() {
                step.tx_hash = submission.tx_hash.clone();
            }
        });
        info!(step = %id, tx_hash = ?submission.tx_hash, ids = submission.ids.len(), "Irreversible submission recorded");
    }

    /// The irreversible leg may have landed without a reply
    fn mark_ambiguous(&self, slot: usize) {
        let StepSlot { id, stage, index, .. } = &self.slots[slot];
        self.state.send_modify(|s| s.stages[*stage].steps[*index].submitted = true);
        warn!(step = %id, "Irreversible submission timed out; treating it as sent");
    }

    fn context(&self, slot: usize) -> StepContext {
        let StepSlot { id, stage, index, .. } = &self.slots[slot];
        let (stage, index) = (*stage, *index);
        let state = self.state.clone();
        let step_id = id.clone();
        let progress = ProgressSink::new(move |message| {
            debug!(step = %step_id, progress = %message, "Step progress");
            state.send_modify(|s| s.stages[stage].steps[index].progress = Some(message.to_string()));
        });
        StepContext {
            step_id: id.clone(),
            progress,
            cancel: self.cancel.signal(),
        }
    }

    fn transition(
        &self,
        slot: usize,
        to: StepStatus,
        update: impl FnOnce(&mut BridgeStep),
    ) -> BridgeResult<()> {
        let StepSlot { id, stage, index, .. } = &self.slots[slot];
        let mut from = None;
        self.state.send_if_modified(|s| {
            let step = &mut s.stages[*stage].steps[*index];
            if !step.status.can_transition_to(to) {
                return false;
            }
            from = Some(step.status);
            step.status = to;
            update(step);
            true
        });

        match from {
            Some(from) => {
                lock(&self.transitions).push(Transition {
                    step: id.clone(),
                    from,
                    to,
                });
                Ok(())
            }
            None => Err(invalid(id, &format!("illegal transition to {}", to))),
        }
    }
}

fn invalid(step: &str, reason: &str) -> BridgeError {
    BridgeError::InvalidTransition {
        step: step.to_string(),
        reason: reason.to_string(),
    }
}

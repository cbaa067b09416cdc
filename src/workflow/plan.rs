//! Standard bridge plan
//!
//! Assembles the six stages of a bridge operation from built-in actions:
//!
//! | stage    | step                 | action                                   |
//! |----------|----------------------|------------------------------------------|
//! | connect  | `connect`            | validate owner, fee payer and recipient  |
//! | discover | `verify-ownership`   | re-classify every selected asset         |
//! | estimate | `estimate-costs`     | cost breakdown + live balance check      |
//! | approve  | `approve-deployment` | ledger approval for the orchestrator     |
//! | approve  | `approve-cast`       | ledger approval for the cast spender     |
//! | execute  | `deploy-remote`      | remote collection deployment (once)      |
//! | execute  | `submit-casts`       | cast submission (once) + status polling  |
//! | confirm  | `refresh-state`      | drop stale oracle answers                |
//!
//! Results of earlier steps are kept in [`PlanOutputs`], shared by the
//! actions of one workflow. Every `build()` starts from empty outputs.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use super::{BridgeWorkflow, StageSpec, StepAction, StepContext, Submission};
use crate::adapter::AdapterRegistry;
use crate::cost::{ApprovalReceipt, CostAndFundingReconciler, CostBreakdown, Reconciliation};
use crate::discovery::DiscoveryEngine;
use crate::error::{AdapterError, ApprovalPurpose, BridgeError, BridgeResult};
use crate::ic::{BridgeCanister, CastRequest};
use crate::poller::{CastOutcome, CastStatusPoller};
use crate::types::{Asset, CastId, Chain, ContractPointer, DiscoveredAsset};

/// Collaborators a plan drives
pub struct BridgeServices {
    pub adapters: AdapterRegistry,
    pub discovery: Arc<DiscoveryEngine>,
    pub reconciler: Arc<CostAndFundingReconciler>,
    pub bridge: Arc<dyn BridgeCanister>,
    pub poller: Arc<CastStatusPoller>,
}

/// What to bridge, from whom, to where
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    /// Holder of the assets on the source chain
    pub owner: String,
    /// IC principal paying fee-ledger costs
    pub fee_payer: String,
    /// Assets as discovery classified them
    pub assets: Vec<DiscoveredAsset>,
    pub target: Chain,
    /// Receiving account on the target chain
    pub recipient: String,
}

/// Results collected while the workflow runs
#[derive(Debug, Clone, Default)]
pub struct PlanOutputs {
    pub breakdown: Option<CostBreakdown>,
    pub reconciliation: Option<Reconciliation>,
    pub approvals: Vec<ApprovalReceipt>,
    pub remote_collection: Option<String>,
    pub casts: Option<CastOutcome>,
}

struct Shared {
    services: Arc<BridgeServices>,
    request: Arc<BridgeRequest>,
    source: ContractPointer,
    outputs: Mutex<PlanOutputs>,
}

impl Shared {
    fn outputs(&self) -> MutexGuard<'_, PlanOutputs> {
        self.outputs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn assets(&self) -> Vec<Asset> {
        self.request.assets.iter().map(|d| d.asset.clone()).collect()
    }

    fn breakdown(&self) -> BridgeResult<CostBreakdown> {
        self.outputs()
            .breakdown
            .clone()
            .ok_or_else(|| BridgeError::InvalidRequest("costs have not been estimated".to_string()))
    }
}

pub struct BridgePlan {
    services: Arc<BridgeServices>,
    request: Arc<BridgeRequest>,
    source: ContractPointer,
    /// State of the most recently built workflow
    current: Mutex<Option<Arc<Shared>>>,
}

impl BridgePlan {
    /// Validate a request. All assets must come from one collection and be
    /// selectable (owned, in bridge, or ready to finalize).
    pub fn new(services: Arc<BridgeServices>, request: BridgeRequest) -> BridgeResult<Self> {
        let Some(first) = request.assets.first() else {
            return Err(BridgeError::InvalidRequest("no assets selected".to_string()));
        };
        let source = first.asset.pointer();

        let sources: BTreeSet<String> = request.assets.iter().map(|d| d.asset.pointer().to_string()).collect();
        if sources.len() > 1 {
            return Err(BridgeError::InvalidRequest(format!(
                "assets span {} source collections; bridge one collection at a time",
                sources.len()
            )));
        }
        if let Some(blocked) = request.assets.iter().find(|d| !d.state.is_selectable()) {
            return Err(BridgeError::InvalidRequest(format!(
                "{} is {} and cannot be bridged",
                blocked.asset, blocked.state
            )));
        }

        Ok(Self {
            services,
            request: Arc::new(request),
            source,
            current: Mutex::new(None),
        })
    }

    pub fn source(&self) -> &ContractPointer {
        &self.source
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<Shared>>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fresh workflow over the standard stages; earlier workflows keep their
    /// own state
    pub fn build(&self) -> BridgeResult<BridgeWorkflow> {
        let shared = Arc::new(Shared {
            services: self.services.clone(),
            request: self.request.clone(),
            source: self.source.clone(),
            outputs: Mutex::new(PlanOutputs::default()),
        });
        *self.current() = Some(shared.clone());
        info!(
            source = %shared.source,
            target_chain = %shared.request.target,
            assets = shared.request.assets.len(),
            "Building bridge workflow"
        );

        BridgeWorkflow::new(vec![
            StageSpec::new("connect", "Connect").step(
                "connect",
                "Check accounts",
                Arc::new(Connect(shared.clone())),
            ),
            StageSpec::new("discover", "Discover").step(
                "verify-ownership",
                "Verify ownership",
                Arc::new(VerifyOwnership(shared.clone())),
            ),
            StageSpec::new("estimate", "Estimate").step(
                "estimate-costs",
                "Estimate costs",
                Arc::new(EstimateCosts(shared.clone())),
            ),
            StageSpec::new("approve", "Approve")
                .step(
                    "approve-deployment",
                    "Approve deployment fee",
                    Arc::new(Approve(shared.clone(), ApprovalPurpose::Deployment)),
                )
                .step(
                    "approve-cast",
                    "Approve cast fee",
                    Arc::new(Approve(shared.clone(), ApprovalPurpose::Cast)),
                ),
            StageSpec::new("execute", "Execute")
                .step(
                    "deploy-remote",
                    "Deploy remote collection",
                    Arc::new(DeployRemote(shared.clone())),
                )
                .step(
                    "submit-casts",
                    "Cast assets",
                    Arc::new(SubmitCasts(shared.clone())),
                ),
            StageSpec::new("confirm", "Confirm").step(
                "refresh-state",
                "Refresh ownership state",
                Arc::new(RefreshState(shared.clone())),
            ),
        ])
    }

    /// Outputs of the most recently built workflow
    pub fn outputs(&self) -> PlanOutputs {
        self.current()
            .as_ref()
            .map(|shared| shared.outputs().clone())
            .unwrap_or_default()
    }
}

// ============================================================================
// Actions
// ============================================================================

struct Connect(Arc<Shared>);

#[async_trait]
impl StepAction for Connect {
    async fn submit(&self, ctx: &StepContext) -> BridgeResult<Submission> {
        let shared = &self.0;
        let request = &shared.request;
        let checks = [
            (shared.source.chain, request.owner.as_str(), "owner"),
            (Chain::InternetComputer, request.fee_payer.as_str(), "fee payer"),
            (request.target, request.recipient.as_str(), "recipient"),
        ];
        for (chain, account, role) in checks {
            chain
                .validate_address(account)
                .map_err(|e| BridgeError::InvalidRequest(format!("{}: {:#}", role, e)))?;
        }
        let mut needed = vec![shared.source.chain];
        if request.target.needs_native_funding() {
            needed.push(request.target);
        }
        for chain in needed {
            shared
                .services
                .adapters
                .get(chain)
                .map_err(|e| BridgeError::InvalidRequest(e.to_string()))?;
        }
        ctx.progress.report("accounts checked");
        Ok(Submission::none())
    }
}

struct VerifyOwnership(Arc<Shared>);

#[async_trait]
impl StepAction for VerifyOwnership {
    async fn submit(&self, ctx: &StepContext) -> BridgeResult<Submission> {
        let shared = &self.0;
        let discovery = &shared.services.discovery;
        let total = shared.request.assets.len();

        for (done, selected) in shared.request.assets.iter().enumerate() {
            let asset = &selected.asset;
            discovery.oracle().invalidate(&shared.source, &asset.token_id);
            let found = discovery
                .resolve_token(&shared.request.owner, &shared.source, asset.token_id.clone())
                .await?;
            if found.state != selected.state {
                warn!(asset = %asset, expected = %selected.state, found = %found.state, "Ownership changed since discovery");
                return Err(BridgeError::OwnershipMismatch {
                    asset: asset.to_string(),
                    expected: selected.state.to_string(),
                    found: found.state.to_string(),
                });
            }
            ctx.progress.report(&format!("verified {}/{}", done + 1, total));
        }
        Ok(Submission::none())
    }
}

struct EstimateCosts(Arc<Shared>);

#[async_trait]
impl StepAction for EstimateCosts {
    async fn submit(&self, ctx: &StepContext) -> BridgeResult<Submission> {
        let shared = &self.0;
        let reconciler = &shared.services.reconciler;

        let breakdown = reconciler.estimate(&shared.assets(), shared.request.target).await?;
        let live = reconciler.fetch_live_funds(&shared.request.fee_payer, &breakdown).await?;
        let reconciliation = reconciler.reconcile(&breakdown, &live);
        ctx.progress.report(&format!(
            "fee total {} (need {} with buffer), native {}",
            breakdown.total, reconciliation.fee_required, reconciliation.native_required
        ));

        let blocked = !(reconciliation.sufficient_fee && reconciliation.sufficient_native);
        let blocker = if blocked {
            reconciliation.first_blocker(breakdown.target.native_unit())
        } else {
            None
        };

        let mut outputs = shared.outputs();
        outputs.breakdown = Some(breakdown);
        outputs.reconciliation = Some(reconciliation);
        drop(outputs);

        match blocker {
            Some(err) => Err(err),
            None => Ok(Submission::none()),
        }
    }
}

struct Approve(Arc<Shared>, ApprovalPurpose);

impl Approve {
    fn status(&self) -> BridgeResult<Option<crate::cost::AllowanceStatus>> {
        let outputs = self.0.outputs();
        let reconciliation = outputs
            .reconciliation
            .as_ref()
            .ok_or_else(|| BridgeError::InvalidRequest("funds have not been reconciled".to_string()))?;
        Ok(reconciliation.approvals.iter().find(|a| a.purpose == self.1).cloned())
    }
}

#[async_trait]
impl StepAction for Approve {
    async fn submit(&self, ctx: &StepContext) -> BridgeResult<Submission> {
        let status = match self.status()? {
            Some(status) if !status.is_sufficient => status,
            Some(_) => {
                ctx.progress.report("allowance already sufficient");
                return Ok(Submission::none());
            }
            None => {
                ctx.progress.report("no approval needed");
                return Ok(Submission::none());
            }
        };

        let receipt = self.0.services.reconciler.approve(&status).await?;
        ctx.progress.report(&format!("approved {} for {}", receipt.amount, receipt.spender));
        let block = receipt.block;
        self.0.outputs().approvals.push(receipt);
        Ok(Submission::with_ids(vec![block]))
    }

    async fn confirm(&self, submission: &Submission, _ctx: &StepContext) -> BridgeResult<()> {
        if submission.ids.is_empty() {
            return Ok(());
        }
        let shared = &self.0;
        let reconciler = &shared.services.reconciler;
        let breakdown = shared.breakdown()?;
        let live = reconciler.fetch_live_funds(&shared.request.fee_payer, &breakdown).await?;
        let reconciliation = reconciler.reconcile(&breakdown, &live);

        let unmet = reconciliation
            .missing_approvals()
            .find(|a| a.purpose == self.1)
            .map(|a| BridgeError::InsufficientAllowance {
                purpose: a.purpose,
                spender: a.spender.clone(),
                available: a.amount,
                required: a.required,
            });
        shared.outputs().reconciliation = Some(reconciliation);
        match unmet {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct DeployRemote(Arc<Shared>);

#[async_trait]
impl StepAction for DeployRemote {
    fn irreversible(&self) -> bool {
        true
    }

    async fn submit(&self, ctx: &StepContext) -> BridgeResult<Submission> {
        let shared = &self.0;
        let breakdown = shared.breakdown()?;
        if breakdown.deployment_cost.is_none() {
            ctx.progress.report("remote collection already exists");
            return Ok(Submission::none());
        }
        // update call: no client deadline, a late reply still counts
        let id = shared
            .services
            .bridge
            .deploy_remote(&shared.source, shared.request.target)
            .await?;
        info!(source = %shared.source, target_chain = %shared.request.target, deployment_id = id, "Remote deployment submitted");
        Ok(Submission::with_ids(vec![id]))
    }

    async fn confirm(&self, submission: &Submission, ctx: &StepContext) -> BridgeResult<()> {
        let Some(id) = submission.ids.first().copied() else {
            return Ok(());
        };
        let shared = &self.0;
        let address = shared
            .services
            .poller
            .poll_deployment(id, &ctx.progress, &ctx.cancel)
            .await?;
        shared.services.discovery.oracle().invalidate_mirror(&shared.source);
        shared.outputs().remote_collection = Some(address);
        Ok(())
    }
}

struct SubmitCasts(Arc<Shared>);

#[async_trait]
impl StepAction for SubmitCasts {
    fn irreversible(&self) -> bool {
        true
    }

    async fn submit(&self, ctx: &StepContext) -> BridgeResult<Submission> {
        let shared = &self.0;
        let requests: Vec<CastRequest> = shared
            .assets()
            .into_iter()
            .map(|asset| CastRequest {
                asset,
                target: shared.request.target,
                recipient: shared.request.target.normalize_address(&shared.request.recipient),
            })
            .collect();

        let results = shared.services.bridge.cast(&requests).await?;
        if results.len() != requests.len() {
            return Err(BridgeError::Decode(format!(
                "cast returned {} results for {} requests",
                results.len(),
                requests.len()
            )));
        }

        let mut submission = Submission::none();
        for (request, result) in requests.iter().zip(results) {
            match result {
                Ok(id) => submission.ids.push(id.0),
                Err(reason) => submission.rejected.push(format!("{}: {}", request.asset, reason)),
            }
        }
        if submission.ids.is_empty() {
            // nothing went out, so the submission may be repeated
            return Err(AdapterError::rpc("bridge", format!("all casts rejected: {}", submission.rejected.join("; "))).into());
        }

        info!(
            accepted = submission.ids.len(),
            rejected = submission.rejected.len(),
            target_chain = %shared.request.target,
            "Casts submitted"
        );
        ctx.progress.report(&format!("submitted {} of {} casts", submission.ids.len(), requests.len()));
        Ok(submission)
    }

    async fn confirm(&self, submission: &Submission, ctx: &StepContext) -> BridgeResult<()> {
        let shared = &self.0;
        let ids: Vec<CastId> = submission.ids.iter().copied().map(CastId).collect();
        let outcome = shared
            .services
            .poller
            .poll_until_terminal(&ids, &ctx.progress, &ctx.cancel)
            .await?;
        let partial = outcome.states.clone();
        shared.outputs().casts = Some(outcome);

        if submission.rejected.is_empty() {
            return Ok(());
        }
        Err(BridgeError::RemoteError {
            message: format!(
                "{} of {} casts rejected: {}",
                submission.rejected.len(),
                submission.rejected.len() + submission.ids.len(),
                submission.rejected.join("; ")
            ),
            partial,
        })
    }
}

struct RefreshState(Arc<Shared>);

#[async_trait]
impl StepAction for RefreshState {
    async fn submit(&self, ctx: &StepContext) -> BridgeResult<Submission> {
        let shared = &self.0;
        let oracle = shared.services.discovery.oracle();
        oracle.invalidate_mirror(&shared.source);

        let mut mirrored = 0;
        for selected in &shared.request.assets {
            let token = &selected.asset.token_id;
            oracle.invalidate(&shared.source, token);
            match oracle.is_mirrored(&shared.source, token).await {
                Ok(Some(_)) => mirrored += 1,
                Ok(None) => {}
                Err(e) => warn!(asset = %selected.asset, error = %e, "Mirror re-check failed"),
            }
        }
        ctx.progress.report(&format!("{} of {} assets mirrored", mirrored, shared.request.assets.len()));
        Ok(Submission::none())
    }
}

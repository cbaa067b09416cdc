//! Cost and funding reconciliation
//!
//! Before any irreversible action the operation must be covered on two
//! independent axes:
//!
//! - **Fee ledger** (cycles): one-time remote deployment plus one cast per
//!   asset. These sum into [`CostBreakdown::total`]. Each spender needs an
//!   ICRC-2 allowance of at least the buffered amount.
//! - **Native funding** (wei / lamports): gas or rent the mirror mints burn
//!   on the target chain, paid into the bridge's funding account. It is
//!   estimated from live fee inputs plus a safety margin and compared on its
//!   own; it is never added to `total`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapter::{with_timeout, AdapterRegistry};
use crate::config::env_or;
use crate::error::{AdapterResult, ApprovalPurpose, BridgeError, BridgeResult};
use crate::ic::{Allowance, BridgeCanister, FeeLedger};
use crate::types::{Asset, Chain, ContractPointer};

/// Approvals and balance checks require this percentage of the base cost
pub const APPROVAL_BUFFER_PERCENT: u128 = 120;

/// `ceil(base * APPROVAL_BUFFER_PERCENT / 100)`, saturating at `u128::MAX`
pub fn buffered_amount(base: u128) -> u128 {
    let whole = (base / 100).saturating_mul(APPROVAL_BUFFER_PERCENT);
    let rest = (base % 100 * APPROVAL_BUFFER_PERCENT).div_ceil(100);
    whole.saturating_add(rest)
}

/// `base` plus `margin_percent` of it, rounded up
pub fn with_margin(base: u128, margin_percent: u32) -> u128 {
    let margin = (base / 100)
        .saturating_mul(margin_percent as u128)
        .saturating_add((base % 100 * margin_percent as u128).div_ceil(100));
    base.saturating_add(margin)
}

/// Ledger timestamp (ns since the epoch) of `at`
pub fn ledger_nanos(at: DateTime<Utc>) -> u64 {
    at.timestamp_nanos_opt().map(|n| n.max(0) as u64).unwrap_or(0)
}

pub fn now_nanos() -> u64 {
    ledger_nanos(Utc::now())
}

/// Reconciler tuning
#[derive(Debug, Clone)]
pub struct CostConfig {
    /// Added on top of the live native estimate
    pub native_margin_percent: u32,
    /// Lifetime requested for new approvals; `None` never expires
    pub approval_ttl: Option<Duration>,
    pub call_timeout: Duration,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            native_margin_percent: 50,
            approval_ttl: None,
            call_timeout: Duration::from_secs(15),
        }
    }
}

impl CostConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ttl_secs: u64 = env_or("APPROVAL_TTL_SECS", 0);
        Self {
            native_margin_percent: env_or("NATIVE_SAFETY_MARGIN_PERCENT", defaults.native_margin_percent),
            approval_ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
            call_timeout: Duration::from_millis(env_or(
                "ADAPTER_CALL_TIMEOUT_MS",
                defaults.call_timeout.as_millis() as u64,
            )),
        }
    }
}

/// Cost of bridging a set of assets from one collection to one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CostBreakdown {
    pub source: ContractPointer,
    pub target: Chain,
    /// Present only when the target collection does not exist yet
    pub deployment_cost: Option<u128>,
    pub per_asset_cost: u128,
    pub asset_count: usize,
    /// Native units, margin included; not part of `total`
    pub native_funding_required: u128,
    /// Fee-ledger units: deployment + per-asset casts
    pub total: u128,
}

impl CostBreakdown {
    pub fn cast_total(&self) -> u128 {
        self.per_asset_cost.saturating_mul(self.asset_count as u128)
    }

    /// Un-buffered ledger amount each approval purpose must cover
    pub fn approval_bases(&self) -> Vec<(ApprovalPurpose, u128)> {
        let mut bases = Vec::new();
        if let Some(cost) = self.deployment_cost.filter(|c| *c > 0) {
            bases.push((ApprovalPurpose::Deployment, cost));
        }
        if self.cast_total() > 0 {
            bases.push((ApprovalPurpose::Cast, self.cast_total()));
        }
        bases
    }
}

/// One allowance measured against what the operation needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowanceStatus {
    pub purpose: ApprovalPurpose,
    pub spender: String,
    pub amount: u128,
    pub expires_at: Option<u64>,
    /// Buffered requirement
    pub required: u128,
    pub is_sufficient: bool,
    pub is_expired: bool,
}

impl AllowanceStatus {
    pub fn evaluate(purpose: ApprovalPurpose, spender: &str, allowance: Allowance, base: u128, now: u64) -> Self {
        let required = buffered_amount(base);
        let is_expired = allowance.expires_at.is_some_and(|at| at <= now);
        Self {
            purpose,
            spender: spender.to_string(),
            amount: allowance.amount,
            expires_at: allowance.expires_at,
            required,
            is_sufficient: allowance.amount >= required && !is_expired,
            is_expired,
        }
    }
}

/// Live balances and allowances, read right before reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFunds {
    pub fee_balance: u128,
    /// Balance of the funding account; `None` when it could not be located
    pub native_balance: Option<u128>,
    pub allowances: Vec<(ApprovalPurpose, String, Allowance)>,
    /// Reference time for expiry checks, ns since the epoch
    pub now: u64,
}

/// Outcome of comparing a breakdown with live funds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub sufficient_fee: bool,
    pub sufficient_native: bool,
    pub fee_required: u128,
    pub fee_available: u128,
    pub native_required: u128,
    pub native_available: u128,
    pub approvals: Vec<AllowanceStatus>,
}

impl Reconciliation {
    pub fn is_ready(&self) -> bool {
        self.sufficient_fee && self.sufficient_native && self.approvals.iter().all(|a| a.is_sufficient)
    }

    /// Approvals that still need to be requested
    pub fn missing_approvals(&self) -> impl Iterator<Item = &AllowanceStatus> {
        self.approvals.iter().filter(|a| !a.is_sufficient)
    }

    /// First unmet requirement as an error; balances before allowances
    pub fn first_blocker(&self, native_denomination: &str) -> Option<BridgeError> {
        if !self.sufficient_fee {
            return Some(BridgeError::InsufficientBalance {
                denomination: "fee ledger".to_string(),
                available: self.fee_available,
                required: self.fee_required,
            });
        }
        if !self.sufficient_native {
            return Some(BridgeError::InsufficientBalance {
                denomination: native_denomination.to_string(),
                available: self.native_available,
                required: self.native_required,
            });
        }
        self.missing_approvals().next().map(|a| BridgeError::InsufficientAllowance {
            purpose: a.purpose,
            spender: a.spender.clone(),
            available: if a.is_expired { 0 } else { a.amount },
            required: a.required,
        })
    }
}

/// Compare a breakdown with live funds
pub fn reconcile(breakdown: &CostBreakdown, live: &LiveFunds) -> Reconciliation {
    let fee_required = buffered_amount(breakdown.total);
    let native_required = breakdown.native_funding_required;
    let native_available = live.native_balance.unwrap_or(0);

    let bases = breakdown.approval_bases();
    let lookup = |purpose: ApprovalPurpose| {
        live.allowances
            .iter()
            .find(|(p, _, _)| *p == purpose)
            .map(|(_, s, a)| (s.as_str(), *a))
            .unwrap_or(("", Allowance::default()))
    };

    // One ICRC-2 allowance exists per spender, so purposes sharing a spender
    // must be covered together.
    let mut per_spender: HashMap<&str, u128> = HashMap::new();
    for (purpose, base) in &bases {
        let (spender, _) = lookup(*purpose);
        let total = per_spender.entry(spender).or_default();
        *total = total.saturating_add(*base);
    }

    let approvals = bases
        .iter()
        .map(|(purpose, _)| {
            let (spender, allowance) = lookup(*purpose);
            let base = per_spender.get(spender).copied().unwrap_or_default();
            AllowanceStatus::evaluate(*purpose, spender, allowance, base, live.now)
        })
        .collect();

    Reconciliation {
        sufficient_fee: live.fee_balance >= fee_required,
        sufficient_native: native_required == 0 || native_available >= native_required,
        fee_required,
        fee_available: live.fee_balance,
        native_required,
        native_available,
        approvals,
    }
}

/// A fee-ledger approval that was submitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalReceipt {
    pub purpose: ApprovalPurpose,
    pub spender: String,
    pub amount: u128,
    pub block: u128,
}

pub struct CostAndFundingReconciler {
    bridge: Arc<dyn BridgeCanister>,
    ledger: Arc<dyn FeeLedger>,
    adapters: AdapterRegistry,
    config: CostConfig,
}

impl CostAndFundingReconciler {
    pub fn new(
        bridge: Arc<dyn BridgeCanister>,
        ledger: Arc<dyn FeeLedger>,
        adapters: AdapterRegistry,
        config: CostConfig,
    ) -> Self {
        Self {
            bridge,
            ledger,
            adapters,
            config,
        }
    }

    pub fn config(&self) -> &CostConfig {
        &self.config
    }

    fn source_of(assets: &[Asset]) -> BridgeResult<ContractPointer> {
        let pointers: BTreeSet<String> = assets.iter().map(|a| a.pointer().to_string()).collect();
        match (assets.first(), pointers.len()) {
            (None, _) => Err(BridgeError::InvalidRequest("no assets selected".to_string())),
            (Some(first), 1) => Ok(first.pointer()),
            (Some(_), n) => Err(BridgeError::InvalidRequest(format!(
                "assets span {} source collections; bridge one collection at a time",
                n
            ))),
        }
    }

    async fn native_requirement(&self, target: Chain, asset_count: usize) -> AdapterResult<u128> {
        if !target.needs_native_funding() {
            return Ok(0);
        }
        let adapter = self.adapters.get(target)?;
        let schedule = with_timeout(&target.to_string(), self.config.call_timeout, adapter.fee_schedule()).await?;
        let base = schedule.base_cost(asset_count);
        debug!(target_chain = %target, ?schedule, base, "Native funding estimate");
        Ok(with_margin(base, self.config.native_margin_percent))
    }

    /// Estimate the cost of bridging `assets` to `target`
    pub async fn estimate(&self, assets: &[Asset], target: Chain) -> BridgeResult<CostBreakdown> {
        let source = Self::source_of(assets)?;
        let timeout = self.config.call_timeout;

        let (deployment_cost, per_asset_cost, native_funding_required) = tokio::try_join!(
            with_timeout("bridge", timeout, self.bridge.deployment_cost(&source, target)),
            with_timeout("bridge", timeout, self.bridge.cast_cost(&source, target)),
            self.native_requirement(target, assets.len()),
        )?;

        let total = deployment_cost
            .unwrap_or(0)
            .saturating_add(per_asset_cost.saturating_mul(assets.len() as u128));
        let breakdown = CostBreakdown {
            source,
            target,
            deployment_cost,
            per_asset_cost,
            asset_count: assets.len(),
            native_funding_required,
            total,
        };
        info!(
            source = %breakdown.source,
            target_chain = %target,
            assets = breakdown.asset_count,
            ?deployment_cost,
            per_asset_cost,
            total,
            native = native_funding_required,
            "Estimated bridge cost"
        );
        Ok(breakdown)
    }

    /// Read balances and allowances for `owner` (the IC principal paying fees)
    pub async fn fetch_live_funds(&self, owner: &str, breakdown: &CostBreakdown) -> BridgeResult<LiveFunds> {
        let timeout = self.config.call_timeout;
        let fee_balance = with_timeout("ledger", timeout, self.ledger.balance_of(owner)).await?;

        let native_balance = if breakdown.native_funding_required > 0 {
            let funding = with_timeout(
                "bridge",
                timeout,
                self.bridge.funding_address(&breakdown.source, breakdown.target),
            )
            .await?;
            match funding {
                Some(account) => {
                    let adapter = self.adapters.get(breakdown.target)?;
                    Some(with_timeout(&breakdown.target.to_string(), timeout, adapter.native_balance(&account)).await?)
                }
                None => {
                    warn!(target_chain = %breakdown.target, "No funding account for target chain");
                    None
                }
            }
        } else {
            None
        };

        let mut allowances = Vec::new();
        for (purpose, _) in breakdown.approval_bases() {
            let spender = with_timeout(
                "bridge",
                timeout,
                self.bridge.spender_for(purpose, &breakdown.source),
            )
            .await?;
            let allowance = with_timeout("ledger", timeout, self.ledger.allowance(owner, &spender)).await?;
            allowances.push((purpose, spender, allowance));
        }

        Ok(LiveFunds {
            fee_balance,
            native_balance,
            allowances,
            now: now_nanos(),
        })
    }

    /// Compare a breakdown with live funds
    pub fn reconcile(&self, breakdown: &CostBreakdown, live: &LiveFunds) -> Reconciliation {
        reconcile(breakdown, live)
    }

    /// Request the buffered amount for one allowance
    pub async fn approve(&self, status: &AllowanceStatus) -> BridgeResult<ApprovalReceipt> {
        let expires_at = self.config.approval_ttl.map(|ttl| {
            ledger_nanos(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)))
        });
        let block = with_timeout(
            "ledger",
            self.config.call_timeout,
            self.ledger.approve(&status.spender, status.required, expires_at),
        )
        .await?;
        info!(
            purpose = status.purpose.as_str(),
            spender = %status.spender,
            amount = status.required,
            block,
            "Approved fee ledger spender"
        );
        Ok(ApprovalReceipt {
            purpose: status.purpose,
            spender: status.spender.clone(),
            amount: status.required,
            block,
        })
    }

    /// Approve every allowance that is not yet sufficient; sufficient ones
    /// are left alone.
    pub async fn approve_missing(&self, reconciliation: &Reconciliation) -> BridgeResult<Vec<ApprovalReceipt>> {
        let mut receipts = Vec::new();
        for status in reconciliation.missing_approvals() {
            receipts.push(self.approve(status).await?);
        }
        Ok(receipts)
    }
}

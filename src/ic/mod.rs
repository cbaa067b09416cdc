//! Internet Computer side of the bridge
//!
//! The fee ledger (ICRC-2, cycles-denominated) and the bridge orchestrator
//! canister are reached through a [`CanisterTransport`], which performs raw
//! query/update calls and hands back candid-shaped JSON. The clients here
//! decode those replies into the normalized types the engines use.
//!
//! ## Submodules
//!
//! - `decode` - candid JSON decoding helpers
//! - `ledger` - ICRC-2 fee ledger client
//! - `bridge` - bridge orchestrator and mirror canister client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AdapterResult, ApprovalPurpose};
use crate::poller::CastState;
use crate::types::{Asset, CastId, Chain, ContractPointer, TokenId};

pub mod bridge;
pub mod decode;
pub mod ledger;

pub use bridge::{BridgeCanisterClient, BridgeMethods};
pub use ledger::IcrcFeeLedger;

/// Raw canister call transport.
///
/// Implementations own the caller identity (wallet / agent); the orchestrator
/// never sees keys. Arguments and replies are candid values rendered as JSON.
#[async_trait]
pub trait CanisterTransport: Send + Sync {
    async fn query(&self, canister: &str, method: &str, arg: Value) -> AdapterResult<Value>;
    async fn update(&self, canister: &str, method: &str, arg: Value) -> AdapterResult<Value>;
}

/// ICRC-2 allowance as reported by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Allowance {
    pub amount: u128,
    /// Expiry in nanoseconds since the Unix epoch
    pub expires_at: Option<u64>,
}

/// Fee ledger operations (ICRC-1 balance + ICRC-2 approvals)
#[async_trait]
pub trait FeeLedger: Send + Sync {
    async fn balance_of(&self, account: &str) -> AdapterResult<u128>;

    async fn allowance(&self, account: &str, spender: &str) -> AdapterResult<Allowance>;

    /// Approve `spender` for `amount`; returns the ledger block index
    async fn approve(&self, spender: &str, amount: u128, expires_at: Option<u64>) -> AdapterResult<u128>;
}

/// Lookups the remote-mint oracle needs
#[async_trait]
pub trait MirrorDirectory: Send + Sync {
    /// Mirror canister/contract for a source collection, if one was created
    async fn mirror_canister(&self, source: &ContractPointer) -> AdapterResult<Option<String>>;

    /// Owner of the mirror of `token_id` inside `mirror`, if minted
    async fn mirror_owner(&self, mirror: &str, token_id: &TokenId) -> AdapterResult<Option<String>>;
}

/// One asset to cast to a remote chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastRequest {
    pub asset: Asset,
    pub target: Chain,
    /// Receiving account on the target chain
    pub recipient: String,
}

/// Remote collection deployment state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentState {
    Pending,
    Deploying,
    Deployed { address: String },
    Failed { reason: String },
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentState::Deployed { .. } | DeploymentState::Failed { .. })
    }
}

/// Bridge orchestrator canister API
#[async_trait]
pub trait BridgeCanister: Send + Sync {
    /// Address assets are sent to when bridged out of `source`
    async fn approval_address(&self, source: &ContractPointer) -> AdapterResult<Option<String>>;

    /// Native-chain account that pays gas/rent for mints on `target`
    async fn funding_address(&self, source: &ContractPointer, target: Chain) -> AdapterResult<Option<String>>;

    /// Fee-ledger spender for the given approval purpose
    async fn spender_for(&self, purpose: ApprovalPurpose, source: &ContractPointer) -> AdapterResult<String>;

    /// One-time deployment cost; `None` when the target collection exists
    async fn deployment_cost(&self, source: &ContractPointer, target: Chain) -> AdapterResult<Option<u128>>;

    /// Fee-ledger cost of casting one asset to `target`
    async fn cast_cost(&self, source: &ContractPointer, target: Chain) -> AdapterResult<u128>;

    /// Start a remote collection deployment; returns a deployment id
    async fn deploy_remote(&self, source: &ContractPointer, target: Chain) -> AdapterResult<u128>;

    async fn deployment_status(&self, deployment_id: u128) -> AdapterResult<DeploymentState>;

    /// Submit casts; one result per request, in request order. A rejected
    /// request carries the canister's reason.
    async fn cast(&self, requests: &[CastRequest]) -> AdapterResult<Vec<Result<CastId, String>>>;

    /// Current state per cast id; `None` for ids the canister does not know yet
    async fn cast_status(&self, ids: &[CastId]) -> AdapterResult<Vec<Option<CastState>>>;
}

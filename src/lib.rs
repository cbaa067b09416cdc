//! cknft-bridge: Cross-Chain NFT Bridge Orchestration
//!
//! Finds a wallet's bridgeable NFTs on a source chain, prices a bridge
//! operation against the fee ledger and native-chain funding, and drives the
//! operation through a staged, retryable workflow until every cast reaches a
//! terminal state on the remote side.
//!
//! - **Discovery** - classifies assets as owned, in bridge, ready to
//!   finalize, already migrated or unknown, from enumerable indexes and
//!   transfer history
//! - **Remote-mint oracle** - session-cached, single-flight mirror lookups
//! - **Cost reconciliation** - fee-ledger costs, 120% approval buffer,
//!   separately tracked native funding
//! - **Workflow** - ordered stages of steps with explicit retry and
//!   at-most-once irreversible submissions
//! - **Cast polling** - bounded, cancellable status loop
//! - **Chain adapters** - EVM (alloy), Solana (solana-client) and IC (ICRC-7)
//!
//! ## Feature Flags
//!
//! - `evm` - EVM adapter over alloy (default)
//! - `solana` - Solana adapter over solana-client (default)
//! - `testing` - in-memory mocks for every collaborator
//! - `full` - all of the above

// Core modules (always available)
pub mod adapter;
pub mod cache;
pub mod config;
pub mod cost;
pub mod discovery;
pub mod error;
pub mod ic;
pub mod oracle;
pub mod poller;
pub mod retry;
pub mod signal;
pub mod types;
pub mod workflow;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used items at the crate root
pub use adapter::{AdapterRegistry, ChainQueryAdapter, FeeSchedule};
pub use cost::{
    buffered_amount, AllowanceStatus, CostAndFundingReconciler, CostBreakdown, CostConfig, LiveFunds,
    Reconciliation, APPROVAL_BUFFER_PERCENT,
};
pub use discovery::{DiscoveryConfig, DiscoveryEngine, DiscoveryReport, LookbackWindow};
pub use error::{AdapterError, AdapterErrorKind, ApprovalPurpose, BridgeError, BridgeResult};
pub use ic::{BridgeCanister, CanisterTransport, FeeLedger, MirrorDirectory};
pub use oracle::RemoteMintOracle;
pub use poller::{CastOutcome, CastState, CastStatusPoller, PollerConfig};
pub use signal::{cancel_pair, CancelHandle, CancelSignal, ProgressSink};
pub use types::{
    Asset, CastId, Chain, ContractPointer, DiscoveredAsset, OwnershipState, SolanaCluster, TokenId,
    TransferRecord,
};
pub use workflow::{
    BridgePlan, BridgeRequest, BridgeServices, BridgeStage, BridgeStep, BridgeWorkflow, StageSpec,
    StepAction, StepStatus, WorkflowSnapshot,
};

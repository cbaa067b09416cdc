//! Chain Query Adapters
//!
//! Uniform read access to a chain family's ownership, event and balance
//! primitives. The discovery engine and the cost reconciler only ever talk to
//! [`ChainQueryAdapter`]; chain-specific result shapes are decoded inside the
//! implementations.
//!
//! ## Submodules
//!
//! - `evm` - ERC-721 reads and `Transfer` log scans over alloy (feature `evm`)
//! - `solana` - SPL token / Metaplex reads over solana-client (feature `solana`)
//! - `ic` - ICRC-7 reads through a [`crate::ic::CanisterTransport`]

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AdapterError, AdapterResult};
use crate::types::{Chain, TokenId, TransferRecord};

#[cfg(feature = "evm")]
pub mod evm;
pub mod ic;
#[cfg(feature = "solana")]
pub mod solana;

#[cfg(feature = "evm")]
pub use evm::EvmQueryAdapter;
pub use ic::IcrcQueryAdapter;
#[cfg(feature = "solana")]
pub use solana::SolanaQueryAdapter;

/// Live fee inputs for native funding estimates.
///
/// Values come from the chain at estimation time; nothing here is a
/// hardcoded price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeeSchedule {
    Evm {
        /// Current gas price in wei
        gas_price: u128,
        /// Gas units for one mirror mint/unlock on this chain
        gas_per_asset: u64,
    },
    Solana {
        /// Lamports a signature costs at the current fee rate
        fee_per_signature: u64,
        /// Rent-exempt minimum for every account one mint creates
        rent_per_asset: u64,
        /// Signatures one mint transaction carries
        signatures_per_asset: u64,
    },
    /// No native funding needed (cycles are paid through the fee ledger)
    None,
}

impl FeeSchedule {
    /// Native cost of producing `asset_count` mirrors, before safety margin
    pub fn base_cost(&self, asset_count: usize) -> u128 {
        let n = asset_count as u128;
        match self {
            FeeSchedule::Evm {
                gas_price,
                gas_per_asset,
            } => gas_price.saturating_mul(*gas_per_asset as u128).saturating_mul(n),
            FeeSchedule::Solana {
                fee_per_signature,
                rent_per_asset,
                signatures_per_asset,
            } => {
                let per_asset = (*rent_per_asset as u128)
                    + (*fee_per_signature as u128) * (*signatures_per_asset as u128);
                per_asset.saturating_mul(n)
            }
            FeeSchedule::None => 0,
        }
    }
}

/// Read-only access to one chain
#[async_trait]
pub trait ChainQueryAdapter: Send + Sync {
    /// Chain this adapter reads from
    fn chain(&self) -> Chain;

    /// Whether `collection` exposes an enumerable ownership index
    async fn supports_enumeration(&self, collection: &str) -> AdapterResult<bool>;

    /// Tokens of `collection` currently held by `owner` (enumerable index)
    async fn tokens_of_owner(&self, collection: &str, owner: &str) -> AdapterResult<Vec<TokenId>>;

    /// Current holder of a token; `None` if burned or nonexistent
    async fn owner_of(&self, collection: &str, token_id: &TokenId) -> AdapterResult<Option<String>>;

    /// Latest block number / slot
    async fn latest_height(&self) -> AdapterResult<u64>;

    /// Transfers of `collection` in `[from_height, to_height]` where `account`
    /// is the sender or the recipient.
    async fn transfer_history(
        &self,
        collection: &str,
        account: &str,
        from_height: u64,
        to_height: u64,
    ) -> AdapterResult<Vec<TransferRecord>>;

    /// Native balance (wei, lamports) of an account
    async fn native_balance(&self, account: &str) -> AdapterResult<u128>;

    /// Live fee inputs for native funding estimates
    async fn fee_schedule(&self) -> AdapterResult<FeeSchedule>;
}

/// Adapters by chain
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Chain, Arc<dyn ChainQueryAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under the chain it reports; replaces any previous one
    pub fn register(&mut self, adapter: Arc<dyn ChainQueryAdapter>) {
        let chain = adapter.chain();
        tracing::debug!(chain = %chain, "Registered chain adapter");
        self.adapters.insert(chain, adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ChainQueryAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, chain: Chain) -> AdapterResult<Arc<dyn ChainQueryAdapter>> {
        self.adapters
            .get(&chain)
            .cloned()
            .ok_or_else(|| AdapterError::unsupported(chain.to_string(), "chain without adapter"))
    }

    pub fn chains(&self) -> Vec<Chain> {
        self.adapters.keys().copied().collect()
    }
}

/// Run an adapter call under a deadline.
///
/// A slow provider turns into a `Timeout` adapter error instead of blocking
/// the caller's other branches.
pub async fn with_timeout<T, Fut>(source: &str, timeout: Duration, call: Fut) -> AdapterResult<T>
where
    Fut: Future<Output = AdapterResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::timeout(source, timeout)),
    }
}

/// Split `[from, to]` into inclusive chunks of at most `max_range` heights.
///
/// Providers cap `eth_getLogs` ranges, so long windows are scanned piecewise.
pub fn chunk_range(from: u64, to: u64, max_range: u64) -> Vec<(u64, u64)> {
    let max_range = max_range.max(1);
    let mut chunks = Vec::new();
    let mut current = from;
    while current <= to {
        let end = current.saturating_add(max_range - 1).min(to);
        chunks.push((current, end));
        if end == u64::MAX {
            break;
        }
        current = end + 1;
    }
    chunks
}

//! Asset Discovery
//!
//! Finds every asset of one source collection that an owner holds, has in
//! flight, or has already bridged, and classifies each as an
//! [`OwnershipState`].
//!
//! Candidates come from two stages:
//!
//! 1. **Direct ownership**: the collection's enumerable index, when offered.
//! 2. **Event history**: transfers to and from the owner over a bounded
//!    window (primary window first, deep window if the primary one is
//!    empty). The latest transfer of a token decides whether it is still
//!    owned or was sent away.
//!
//! Each candidate is then classified independently, checking in order:
//!
//! - the remote-mint oracle (a mirror wins and short-circuits everything else)
//! - a direct owner read (`Owned` when the owner still holds it)
//! - the collection's bridge address (`ReadyToFinalize` when parked there)
//! - whether the owner sent it away (`InBridge`, a stranded transfer)
//!
//! A failing stage never aborts the others; its error is reported next to the
//! assets that were found. A failed lookup for one asset makes that asset
//! `Unknown`.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapter::{chunk_range, with_timeout, AdapterRegistry, ChainQueryAdapter};
use crate::cache::SingleFlightCache;
use crate::config::env_or;
use crate::error::{AdapterError, AdapterErrorKind, AdapterResult, BridgeResult};
use crate::ic::BridgeCanister;
use crate::oracle::RemoteMintOracle;
use crate::retry::{with_retry, RetryConfig};
use crate::types::{Asset, Chain, ContractPointer, DiscoveredAsset, OwnershipState, TokenId, TransferRecord};

/// History lookback, in blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookbackWindow {
    pub primary: u64,
    pub deep: u64,
}

impl Default for LookbackWindow {
    fn default() -> Self {
        Self {
            primary: 5_000,
            deep: 100_000,
        }
    }
}

/// Discovery tuning
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Lookback used for chains without an override
    pub window: LookbackWindow,
    pub chain_windows: HashMap<Chain, LookbackWindow>,
    /// Largest block range a single log query may span
    pub max_log_range: u64,
    /// Candidates classified at once
    pub concurrency: usize,
    /// Deadline for every adapter call
    pub call_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            window: LookbackWindow::default(),
            chain_windows: HashMap::new(),
            max_log_range: 2_000,
            concurrency: 8,
            call_timeout: Duration::from_secs(15),
            retry: RetryConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            window: LookbackWindow {
                primary: env_or("DISCOVERY_PRIMARY_WINDOW", defaults.window.primary),
                deep: env_or("DISCOVERY_DEEP_WINDOW", defaults.window.deep),
            },
            chain_windows: HashMap::new(),
            max_log_range: env_or("DISCOVERY_MAX_LOG_RANGE", defaults.max_log_range).max(1),
            concurrency: env_or("DISCOVERY_CONCURRENCY", defaults.concurrency).max(1),
            call_timeout: Duration::from_millis(env_or(
                "ADAPTER_CALL_TIMEOUT_MS",
                defaults.call_timeout.as_millis() as u64,
            )),
            retry: RetryConfig::from_env(),
        }
    }

    /// Override the lookback for one chain (block times differ widely)
    pub fn with_window(mut self, chain: Chain, window: LookbackWindow) -> Self {
        self.chain_windows.insert(chain, window);
        self
    }

    pub fn window_for(&self, chain: Chain) -> LookbackWindow {
        self.chain_windows.get(&chain).copied().unwrap_or(self.window)
    }
}

/// Discovery stage a reported error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiscoveryStage {
    DirectOwnership,
    EventHistory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    pub stage: DiscoveryStage,
    pub error: AdapterError,
}

/// Result of one discovery pass
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub assets: Vec<DiscoveredAsset>,
    pub stage_errors: Vec<StageError>,
}

impl DiscoveryReport {
    pub fn in_state(&self, state: OwnershipState) -> impl Iterator<Item = &DiscoveredAsset> {
        self.assets.iter().filter(move |a| a.state == state)
    }

    /// Assets that may be offered for a bridge operation
    pub fn selectable(&self) -> Vec<Asset> {
        self.assets
            .iter()
            .filter(|a| a.state.is_selectable())
            .map(|a| a.asset.clone())
            .collect()
    }

    pub fn count(&self, state: OwnershipState) -> usize {
        self.in_state(state).count()
    }
}

/// How a token relates to the owner according to history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryVerdict {
    Received,
    Sent,
}

/// Latest verdict per token among transfers involving the owner
fn fold_history(owner: &str, mut records: Vec<TransferRecord>) -> BTreeMap<TokenId, HistoryVerdict> {
    records.sort_by_key(|r| (r.height, r.log_index));
    let mut verdicts = BTreeMap::new();
    for record in records {
        if record.to == owner {
            verdicts.insert(record.token_id, HistoryVerdict::Received);
        } else if record.from == owner {
            verdicts.insert(record.token_id, HistoryVerdict::Sent);
        }
    }
    verdicts
}

/// Numeric ids sort by value, other ids lexically
fn token_order(a: &TokenId, b: &TokenId) -> std::cmp::Ordering {
    (a.as_str().len(), a.as_str()).cmp(&(b.as_str().len(), b.as_str()))
}

pub struct DiscoveryEngine {
    adapters: AdapterRegistry,
    bridge: Arc<dyn BridgeCanister>,
    oracle: Arc<RemoteMintOracle>,
    bridge_addresses: SingleFlightCache<ContractPointer, Option<String>>,
    config: DiscoveryConfig,
}

impl DiscoveryEngine {
    pub fn new(
        adapters: AdapterRegistry,
        bridge: Arc<dyn BridgeCanister>,
        oracle: Arc<RemoteMintOracle>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            adapters,
            bridge,
            oracle,
            bridge_addresses: SingleFlightCache::new("bridge-address"),
            config,
        }
    }

    pub fn oracle(&self) -> &Arc<RemoteMintOracle> {
        &self.oracle
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Drop cached bridge addresses and oracle answers
    pub fn refresh(&self) {
        self.bridge_addresses.clear();
        self.oracle.clear();
    }

    /// Adapter read under the call deadline, retried on transient failures
    async fn read<T, F, Fut>(&self, source: &str, op: F) -> AdapterResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        with_retry(&self.config.retry, |_| {
            with_timeout(source, self.config.call_timeout, op())
        })
        .await
    }

    /// Bridge address for a collection, looked up once per session
    async fn bridge_address(&self, pointer: &ContractPointer) -> AdapterResult<Option<String>> {
        self.bridge_addresses
            .get_or_try_resolve(pointer, || async {
                let address = self
                    .read("bridge", || self.bridge.approval_address(pointer))
                    .await?;
                debug!(collection = %pointer, ?address, "Resolved bridge address");
                Ok::<_, AdapterError>(address.map(|a| pointer.chain.normalize_address(&a)))
            })
            .await
    }

    async fn enumerate(
        &self,
        adapter: &dyn ChainQueryAdapter,
        pointer: &ContractPointer,
        owner: &str,
    ) -> AdapterResult<Option<Vec<TokenId>>> {
        let source = pointer.chain.to_string();
        let supported = self
            .read(&source, || adapter.supports_enumeration(&pointer.contract))
            .await?;
        if !supported {
            return Ok(None);
        }
        let tokens = self
            .read(&source, || adapter.tokens_of_owner(&pointer.contract, owner))
            .await?;
        Ok(Some(tokens))
    }

    async fn scan_window(
        &self,
        adapter: &dyn ChainQueryAdapter,
        pointer: &ContractPointer,
        owner: &str,
        from: u64,
        to: u64,
    ) -> AdapterResult<Vec<TransferRecord>> {
        let source = pointer.chain.to_string();
        let mut records = Vec::new();
        for (start, end) in chunk_range(from, to, self.config.max_log_range) {
            let chunk = self
                .read(&source, || adapter.transfer_history(&pointer.contract, owner, start, end))
                .await?;
            records.extend(chunk);
        }
        Ok(records)
    }

    /// Transfers involving the owner: primary window, then the deep window
    /// below it if the primary one saw nothing.
    async fn history(
        &self,
        adapter: &dyn ChainQueryAdapter,
        pointer: &ContractPointer,
        owner: &str,
    ) -> AdapterResult<Vec<TransferRecord>> {
        let source = pointer.chain.to_string();
        let window = self.config.window_for(pointer.chain);
        let latest = self.read(&source, || adapter.latest_height()).await?;

        let primary_from = latest.saturating_sub(window.primary.saturating_sub(1));
        let records = self
            .scan_window(adapter, pointer, owner, primary_from, latest)
            .await?;
        if !records.is_empty() || primary_from == 0 || window.deep <= window.primary {
            return Ok(records);
        }

        let deep_from = latest.saturating_sub(window.deep.saturating_sub(1));
        debug!(
            collection = %pointer,
            from = deep_from,
            to = primary_from - 1,
            "Primary window empty, scanning deep window"
        );
        self.scan_window(adapter, pointer, owner, deep_from, primary_from - 1)
            .await
    }

    /// Classify one candidate. Never fails: lookup errors yield `Unknown`.
    async fn classify(
        &self,
        adapter: &dyn ChainQueryAdapter,
        pointer: &ContractPointer,
        owner: &str,
        token_id: TokenId,
        sent_away: bool,
    ) -> DiscoveredAsset {
        let asset = Asset::new(pointer, token_id, owner);
        let unknown = |asset: Asset, what: &str, e: &AdapterError| {
            debug!(asset = %asset, error = %e, "Lookup failed, asset left unclassified");
            DiscoveredAsset::new(asset, OwnershipState::Unknown).with_note(format!("{} failed: {}", what, e))
        };

        let mirrored = self.oracle.is_mirrored(pointer, &asset.token_id).await;
        match mirrored {
            Ok(Some(mirror_owner)) => {
                let mut found = DiscoveredAsset::new(asset, OwnershipState::AlreadyMigrated);
                found.mirror_owner = Some(mirror_owner);
                return found;
            }
            Ok(None) => {}
            Err(e) => return unknown(asset, "mirror lookup", &e),
        }

        let source = pointer.chain.to_string();
        let holder_read = self
            .read(&source, || adapter.owner_of(&pointer.contract, &asset.token_id))
            .await;
        let holder = match holder_read {
            Ok(holder) => holder.map(|h| pointer.chain.normalize_address(&h)),
            Err(e) => return unknown(asset, "owner lookup", &e),
        };

        if holder.as_deref() == Some(owner) {
            return DiscoveredAsset::new(asset, OwnershipState::Owned).with_holder(holder);
        }

        let bridge_address = match self.bridge_address(pointer).await {
            Ok(address) => address,
            Err(e) => return unknown(asset, "bridge address lookup", &e).with_holder(holder),
        };
        if holder.is_some() && holder == bridge_address {
            return DiscoveredAsset::new(asset, OwnershipState::ReadyToFinalize).with_holder(holder);
        }

        if sent_away {
            return DiscoveredAsset::new(asset, OwnershipState::InBridge).with_holder(holder);
        }

        let note = match &holder {
            Some(h) => format!("held by {} with no transfer history from the owner", h),
            None => "no holder and no transfer history".to_string(),
        };
        DiscoveredAsset::new(asset, OwnershipState::Unknown)
            .with_holder(holder)
            .with_note(note)
    }

    /// Discover and classify the owner's assets in `collection`
    pub async fn discover(&self, owner: &str, collection: &ContractPointer) -> BridgeResult<DiscoveryReport> {
        let adapter = self.adapters.get(collection.chain)?;
        let owner = collection.chain.normalize_address(owner);
        let mut report = DiscoveryReport::default();

        // Stage 1: enumerable index
        let enumerated = match self.enumerate(adapter.as_ref(), collection, &owner).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(collection = %collection, error = %e, "Direct ownership stage failed");
                report.stage_errors.push(StageError {
                    stage: DiscoveryStage::DirectOwnership,
                    error: e,
                });
                None
            }
        };

        // Stage 2: transfer history
        let verdicts = match self.history(adapter.as_ref(), collection, &owner).await {
            Ok(records) => fold_history(&owner, records),
            Err(e) => {
                if e.kind == AdapterErrorKind::Unsupported && enumerated.is_some() {
                    debug!(collection = %collection, "No transfer history on this chain");
                } else {
                    warn!(collection = %collection, error = %e, "Event history stage failed");
                }
                report.stage_errors.push(StageError {
                    stage: DiscoveryStage::EventHistory,
                    error: e,
                });
                BTreeMap::new()
            }
        };

        let mut candidates: BTreeSet<TokenId> = enumerated.iter().flatten().cloned().collect();
        candidates.extend(verdicts.keys().cloned());
        let sent: BTreeSet<TokenId> = verdicts
            .iter()
            .filter(|(_, v)| **v == HistoryVerdict::Sent)
            .map(|(t, _)| t.clone())
            .collect();

        let owner_ref = owner.as_str();
        let adapter_ref = adapter.as_ref();
        let mut assets: Vec<DiscoveredAsset> = stream::iter(candidates)
            .map(|token| {
                let sent_away = sent.contains(&token);
                self.classify(adapter_ref, collection, owner_ref, token, sent_away)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        assets.sort_by(|a, b| token_order(&a.asset.token_id, &b.asset.token_id));
        report.assets = assets;

        info!(
            collection = %collection,
            owner = %owner,
            owned = report.count(OwnershipState::Owned),
            in_bridge = report.count(OwnershipState::InBridge),
            ready = report.count(OwnershipState::ReadyToFinalize),
            migrated = report.count(OwnershipState::AlreadyMigrated),
            unknown = report.count(OwnershipState::Unknown),
            stage_errors = report.stage_errors.len(),
            "Discovery complete"
        );
        Ok(report)
    }

    /// Classify one explicitly entered token id with the same rules
    pub async fn resolve_token(
        &self,
        owner: &str,
        collection: &ContractPointer,
        token_id: TokenId,
    ) -> BridgeResult<DiscoveredAsset> {
        let adapter = self.adapters.get(collection.chain)?;
        let owner = collection.chain.normalize_address(owner);

        let sent_away = match self.history(adapter.as_ref(), collection, &owner).await {
            Ok(records) => {
                let records = records.into_iter().filter(|r| r.token_id == token_id).collect();
                fold_history(&owner, records).get(&token_id) == Some(&HistoryVerdict::Sent)
            }
            Err(e) => {
                debug!(collection = %collection, error = %e, "No history for manual resolution");
                false
            }
        };

        let found = self
            .classify(adapter.as_ref(), collection, &owner, token_id, sent_away)
            .await;
        info!(asset = %found.asset, state = %found.state, "Resolved token");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "0x00000000000000000000000000000000000000aa";
    const OTHER: &str = "0x00000000000000000000000000000000000000bb";

    fn record(token: u64, from: &str, to: &str, height: u64, log_index: u64) -> TransferRecord {
        TransferRecord {
            token_id: TokenId::from(token),
            from: from.into(),
            to: to.into(),
            height,
            log_index,
        }
    }

    #[test]
    fn test_fold_history_uses_latest_transfer() {
        let records = vec![
            record(1, OTHER, OWNER, 10, 0),
            record(1, OWNER, OTHER, 20, 0),
            record(2, OWNER, OTHER, 5, 0),
            record(2, OTHER, OWNER, 5, 1),
            record(3, OTHER, OWNER, 7, 0),
        ];
        let verdicts = fold_history(OWNER, records);
        assert_eq!(verdicts[&TokenId::from(1)], HistoryVerdict::Sent);
        assert_eq!(verdicts[&TokenId::from(2)], HistoryVerdict::Received);
        assert_eq!(verdicts[&TokenId::from(3)], HistoryVerdict::Received);
    }

    #[test]
    fn test_token_order_is_numeric_for_decimal_ids() {
        let mut ids: Vec<TokenId> = ["10", "2", "1"].into_iter().map(TokenId::from).collect();
        ids.sort_by(token_order);
        assert_eq!(ids, vec![TokenId::from("1"), TokenId::from("2"), TokenId::from("10")]);
    }

    #[test]
    fn test_window_overrides() {
        let config = DiscoveryConfig::default().with_window(
            Chain::evm(8453),
            LookbackWindow {
                primary: 50_000,
                deep: 1_000_000,
            },
        );
        assert_eq!(config.window_for(Chain::evm(1)), LookbackWindow::default());
        assert_eq!(config.window_for(Chain::evm(8453)).primary, 50_000);
    }
}

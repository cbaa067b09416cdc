//! Discovery scenarios over in-memory chain and canister mocks

use std::sync::Arc;
use std::time::Duration;

use cknft_bridge::discovery::{DiscoveryStage, LookbackWindow};
use cknft_bridge::retry::RetryConfig;
use cknft_bridge::testing::{init_tracing, MockBridgeCanister, MockChainAdapter, MockMirrorDirectory};
use cknft_bridge::{
    AdapterError, AdapterRegistry, Chain, ContractPointer, DiscoveryConfig, DiscoveryEngine, OwnershipState,
    RemoteMintOracle, TokenId,
};

const COLLECTION: &str = "0x1111111111111111111111111111111111111111";
const OWNER: &str = "0x00000000000000000000000000000000000000AA";
const BRIDGE: &str = "0x000000000000000000000000000000000000b81d";
const STRANGER: &str = "0x00000000000000000000000000000000000000dd";
const MINTER: &str = "0x0000000000000000000000000000000000000000";

struct Scenario {
    chain: Arc<MockChainAdapter>,
    bridge: Arc<MockBridgeCanister>,
    directory: Arc<MockMirrorDirectory>,
    engine: DiscoveryEngine,
}

fn pointer() -> ContractPointer {
    ContractPointer::new(Chain::evm(1), COLLECTION)
}

fn scenario() -> Scenario {
    init_tracing();
    let chain = Arc::new(MockChainAdapter::new(Chain::evm(1)));
    let bridge = Arc::new(MockBridgeCanister::new());
    bridge.set_approval_address(&pointer(), BRIDGE);
    let directory = Arc::new(MockMirrorDirectory::new());
    let oracle = Arc::new(RemoteMintOracle::new(directory.clone(), Duration::from_secs(1)));
    let engine = DiscoveryEngine::new(
        AdapterRegistry::new().with(chain.clone()),
        bridge.clone(),
        oracle,
        DiscoveryConfig {
            retry: RetryConfig::none(),
            ..DiscoveryConfig::default()
        },
    );
    Scenario {
        chain,
        bridge,
        directory,
        engine,
    }
}

#[tokio::test]
async fn test_held_parked_and_mirrored_assets() {
    let s = scenario();
    s.chain.record_transfer(COLLECTION, 1u64, MINTER, OWNER, 100);
    s.chain.record_transfer(COLLECTION, 2u64, MINTER, OWNER, 100);
    s.chain.record_transfer(COLLECTION, 3u64, MINTER, OWNER, 100);
    s.chain.record_transfer(COLLECTION, 2u64, OWNER, BRIDGE, 200);
    s.chain.record_transfer(COLLECTION, 3u64, OWNER, BRIDGE, 210);
    s.directory.set_mirror(&pointer(), "mirror-canister");
    s.directory.set_mirror_owner("mirror-canister", 3u64, "owner-principal");

    let report = s.engine.discover(OWNER, &pointer()).await.unwrap();

    assert_eq!(report.assets.len(), 3);
    assert_eq!(report.count(OwnershipState::Owned), 1);
    assert_eq!(report.count(OwnershipState::ReadyToFinalize), 1);
    assert_eq!(report.count(OwnershipState::AlreadyMigrated), 1);
    assert!(report.stage_errors.is_empty());

    let by_token = |id: u64| {
        report
            .assets
            .iter()
            .find(|a| a.asset.token_id == TokenId::from(id))
            .unwrap()
    };
    assert_eq!(by_token(1).state, OwnershipState::Owned);
    assert_eq!(by_token(2).state, OwnershipState::ReadyToFinalize);
    assert_eq!(by_token(2).current_holder.as_deref(), Some(BRIDGE));
    assert_eq!(by_token(3).state, OwnershipState::AlreadyMigrated);
    assert_eq!(by_token(3).mirror_owner.as_deref(), Some("owner-principal"));
    // the mirrored asset never reaches the owner read
    assert_eq!(s.chain.owner_of_calls(), 2);
    assert_eq!(s.bridge.approval_address_calls(), 1);
    assert_eq!(s.directory.mirror_canister_calls(), 1);

    // Selection excludes the migrated asset
    let selectable: Vec<_> = report.selectable().into_iter().map(|a| a.token_id).collect();
    assert_eq!(selectable, vec![TokenId::from(1u64), TokenId::from(2u64)]);

    // one owner lookup per token; "not minted" answers are cached too
    assert_eq!(s.directory.mirror_owner_calls(), 3);
    let again = s.engine.discover(OWNER, &pointer()).await.unwrap();
    assert_eq!(again.count(OwnershipState::AlreadyMigrated), 1);
    assert_eq!(s.directory.mirror_owner_calls(), 3);
    assert_eq!(s.directory.mirror_canister_calls(), 1);
}

#[tokio::test]
async fn test_migrated_assets_skip_bridge_address_lookup() {
    let s = scenario();
    s.directory.set_mirror(&pointer(), "mirror-canister");
    for id in 1..=4u64 {
        s.chain.record_transfer(COLLECTION, id, MINTER, OWNER, 10);
        s.chain.record_transfer(COLLECTION, id, OWNER, BRIDGE, 20 + id);
        s.directory.set_mirror_owner("mirror-canister", id, "owner-principal");
    }

    let report = s.engine.discover(OWNER, &pointer()).await.unwrap();
    assert_eq!(report.count(OwnershipState::AlreadyMigrated), 4);
    assert_eq!(s.bridge.approval_address_calls(), 0);
    assert_eq!(s.chain.owner_of_calls(), 0);
}

#[tokio::test]
async fn test_stranded_transfer_is_recoverable() {
    let s = scenario();
    s.chain.record_transfer(COLLECTION, 7u64, MINTER, OWNER, 10);
    s.chain.record_transfer(COLLECTION, 7u64, OWNER, STRANGER, 50);

    let report = s.engine.discover(OWNER, &pointer()).await.unwrap();
    let asset = &report.assets[0];
    assert_eq!(asset.state, OwnershipState::InBridge);
    assert_eq!(asset.current_holder.as_deref(), Some(STRANGER));
    assert!(asset.state.is_selectable());
}

#[tokio::test]
async fn test_history_failure_keeps_enumerated_assets() {
    let s = scenario();
    s.chain.enable_enumeration(COLLECTION);
    s.chain.set_holder(COLLECTION, 1u64, OWNER);
    s.chain.set_holder(COLLECTION, 2u64, OWNER);
    s.chain.fail_history(AdapterError::rpc("evm:1", "429 Too Many Requests"));

    let report = s.engine.discover(OWNER, &pointer()).await.unwrap();
    assert_eq!(report.count(OwnershipState::Owned), 2);
    assert_eq!(report.stage_errors.len(), 1);
    assert_eq!(report.stage_errors[0].stage, DiscoveryStage::EventHistory);
}

#[tokio::test]
async fn test_failed_owner_read_yields_unknown() {
    let s = scenario();
    s.chain.enable_enumeration(COLLECTION);
    s.chain.set_holder(COLLECTION, 1u64, OWNER);
    s.chain.set_holder(COLLECTION, 2u64, OWNER);
    s.chain.fail_owner_of(2u64);

    let report = s.engine.discover(OWNER, &pointer()).await.unwrap();
    assert_eq!(report.count(OwnershipState::Owned), 1);
    let unknown: Vec<_> = report.in_state(OwnershipState::Unknown).collect();
    assert_eq!(unknown.len(), 1);
    assert!(unknown[0].note.as_deref().unwrap().contains("owner lookup failed"));
}

#[tokio::test]
async fn test_manual_entry_for_foreign_holder() {
    let s = scenario();
    s.chain.set_holder(COLLECTION, 42u64, STRANGER);

    let found = s
        .engine
        .resolve_token(OWNER, &pointer(), TokenId::from(42u64))
        .await
        .unwrap();
    assert_eq!(found.state, OwnershipState::Unknown);
    assert_eq!(found.current_holder.as_deref(), Some(STRANGER));
    assert!(found.note.is_some());
}

#[tokio::test]
async fn test_deep_window_used_when_primary_is_empty() {
    let s = scenario();
    s.chain.record_transfer(COLLECTION, 5u64, MINTER, OWNER, 150_000);
    s.chain.set_height(200_000);

    let report = s.engine.discover(OWNER, &pointer()).await.unwrap();
    assert_eq!(report.count(OwnershipState::Owned), 1);
    // 5_000 blocks in 2_000-block chunks, then 95_000 more
    assert_eq!(s.chain.history_calls(), 3 + 48);
}

#[tokio::test]
async fn test_per_chain_window_override() {
    let s = scenario();
    let engine = DiscoveryEngine::new(
        AdapterRegistry::new().with(s.chain.clone()),
        s.bridge.clone(),
        s.engine.oracle().clone(),
        DiscoveryConfig {
            retry: RetryConfig::none(),
            ..DiscoveryConfig::default()
        }
        .with_window(
            Chain::evm(1),
            LookbackWindow {
                primary: 2_000,
                deep: 2_000,
            },
        ),
    );
    s.chain.record_transfer(COLLECTION, 5u64, MINTER, OWNER, 150_000);
    s.chain.set_height(200_000);

    let report = engine.discover(OWNER, &pointer()).await.unwrap();
    assert!(report.assets.is_empty());
    assert_eq!(s.chain.history_calls(), 1);
}

#[tokio::test]
async fn test_concurrent_discovery_resolves_shared_lookups_once() {
    let s = scenario();
    s.directory.set_mirror(&pointer(), "mirror-canister");
    s.directory.delay_resolution(Duration::from_millis(20));
    for id in 1..=20u64 {
        s.chain.record_transfer(COLLECTION, id, MINTER, OWNER, 10);
        s.chain.record_transfer(COLLECTION, id, OWNER, BRIDGE, 20);
    }

    let report = s.engine.discover(OWNER, &pointer()).await.unwrap();
    assert_eq!(report.count(OwnershipState::ReadyToFinalize), 20);
    assert_eq!(s.directory.mirror_canister_calls(), 1);
    assert_eq!(s.bridge.approval_address_calls(), 1);
}

#[tokio::test]
async fn test_refresh_forgets_cached_answers() {
    let s = scenario();
    s.chain.record_transfer(COLLECTION, 1u64, MINTER, OWNER, 10);
    s.chain.record_transfer(COLLECTION, 1u64, OWNER, BRIDGE, 20);

    let first = s.engine.discover(OWNER, &pointer()).await.unwrap();
    assert_eq!(first.assets[0].state, OwnershipState::ReadyToFinalize);

    // mirror minted after the first pass
    s.directory.set_mirror(&pointer(), "mirror-canister");
    s.directory.set_mirror_owner("mirror-canister", 1u64, "owner-principal");
    let cached = s.engine.discover(OWNER, &pointer()).await.unwrap();
    assert_eq!(cached.assets[0].state, OwnershipState::ReadyToFinalize);

    s.engine.refresh();
    let fresh = s.engine.discover(OWNER, &pointer()).await.unwrap();
    assert_eq!(fresh.assets[0].state, OwnershipState::AlreadyMigrated);
}

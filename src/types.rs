//! Common types for cross-chain NFT operations
//!
//! Chain identities, asset identifiers and the ownership classification the
//! discovery engine produces. Everything here is plain data; the engines that
//! fill these types in live in their own modules.

use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Chains
// ============================================================================

/// Solana cluster a collection lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolanaCluster {
    Mainnet,
    Devnet,
    Testnet,
    Localnet,
}

impl SolanaCluster {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolanaCluster::Mainnet => "mainnet",
            SolanaCluster::Devnet => "devnet",
            SolanaCluster::Testnet => "testnet",
            SolanaCluster::Localnet => "localnet",
        }
    }
}

/// A chain an asset can live on
///
/// EVM chains are identified by their native chain ID (1 for Ethereum,
/// 8453 for Base, ...). The IC is a single network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chain {
    Evm { chain_id: u64 },
    Solana { cluster: SolanaCluster },
    InternetComputer,
}

impl Chain {
    pub fn evm(chain_id: u64) -> Self {
        Chain::Evm { chain_id }
    }

    pub fn solana(cluster: SolanaCluster) -> Self {
        Chain::Solana { cluster }
    }

    /// Short family name, used as a metrics/log label
    pub fn family(&self) -> &'static str {
        match self {
            Chain::Evm { .. } => "evm",
            Chain::Solana { .. } => "solana",
            Chain::InternetComputer => "ic",
        }
    }

    /// Smallest native denomination
    pub fn native_unit(&self) -> &'static str {
        match self {
            Chain::Evm { .. } => "wei",
            Chain::Solana { .. } => "lamports",
            Chain::InternetComputer => "cycles",
        }
    }

    /// Whether this chain needs native gas/rent funding for a remote mint
    pub fn needs_native_funding(&self) -> bool {
        !matches!(self, Chain::InternetComputer)
    }

    /// Canonical form of an address on this chain.
    ///
    /// EVM addresses are compared case-insensitively, so they are lowercased.
    /// Solana (base58) and IC principals are case-sensitive and only trimmed.
    pub fn normalize_address(&self, address: &str) -> String {
        let trimmed = address.trim();
        match self {
            Chain::Evm { .. } => trimmed.to_ascii_lowercase(),
            Chain::Solana { .. } | Chain::InternetComputer => trimmed.to_string(),
        }
    }

    /// Validate an address for this chain
    pub fn validate_address(&self, address: &str) -> Result<()> {
        let trimmed = address.trim();
        match self {
            Chain::Evm { .. } => {
                let hex = trimmed
                    .strip_prefix("0x")
                    .ok_or_else(|| eyre!("EVM address must start with 0x: {}", trimmed))?;
                let bytes = hex::decode(hex)?;
                if bytes.len() != 20 {
                    return Err(eyre!("EVM address must be 20 bytes, got {}", bytes.len()));
                }
                Ok(())
            }
            Chain::Solana { .. } => {
                let bytes = bs58::decode(trimmed).into_vec()?;
                if bytes.len() != 32 {
                    return Err(eyre!("Solana address must be 32 bytes, got {}", bytes.len()));
                }
                Ok(())
            }
            Chain::InternetComputer => {
                if trimmed.is_empty() || !trimmed.contains('-') {
                    return Err(eyre!("Invalid principal text: {}", trimmed));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Evm { chain_id } => write!(f, "evm:{}", chain_id),
            Chain::Solana { cluster } => write!(f, "solana:{}", cluster.as_str()),
            Chain::InternetComputer => write!(f, "ic"),
        }
    }
}

impl FromStr for Chain {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "ic" {
            return Ok(Chain::InternetComputer);
        }
        if let Some(id) = s.strip_prefix("evm:") {
            let chain_id = id
                .parse()
                .map_err(|_| eyre!("Invalid EVM chain id: {}", id))?;
            return Ok(Chain::Evm { chain_id });
        }
        if let Some(cluster) = s.strip_prefix("solana:") {
            let cluster = match cluster {
                "mainnet" => SolanaCluster::Mainnet,
                "devnet" => SolanaCluster::Devnet,
                "testnet" => SolanaCluster::Testnet,
                "localnet" => SolanaCluster::Localnet,
                other => return Err(eyre!("Unknown Solana cluster: {}", other)),
            };
            return Ok(Chain::Solana { cluster });
        }
        Err(eyre!("Unknown chain: {}", s))
    }
}

// ============================================================================
// Assets
// ============================================================================

/// Token identifier within a collection.
///
/// EVM and IC token IDs are unsigned integers of arbitrary width and are kept
/// in decimal form; Solana NFTs are identified by their mint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(pub String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Self {
        TokenId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for TokenId {
    fn from(id: u64) -> Self {
        TokenId(id.to_string())
    }
}

impl From<&str> for TokenId {
    fn from(id: &str) -> Self {
        TokenId(id.to_string())
    }
}

/// A contract or collection on a specific chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractPointer {
    pub chain: Chain,
    /// Contract address, collection canister ID, or Solana collection mint
    pub contract: String,
}

impl ContractPointer {
    pub fn new(chain: Chain, contract: &str) -> Self {
        Self {
            chain,
            contract: chain.normalize_address(contract),
        }
    }
}

impl fmt::Display for ContractPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chain, self.contract)
    }
}

/// A bridgeable item, immutable once discovered within a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    pub source_chain: Chain,
    pub contract: String,
    pub token_id: TokenId,
    pub owner_at_source: String,
}

impl Asset {
    pub fn new(pointer: &ContractPointer, token_id: TokenId, owner: &str) -> Self {
        Self {
            source_chain: pointer.chain,
            contract: pointer.contract.clone(),
            token_id,
            owner_at_source: pointer.chain.normalize_address(owner),
        }
    }

    pub fn pointer(&self) -> ContractPointer {
        ContractPointer {
            chain: self.source_chain,
            contract: self.contract.clone(),
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.source_chain, self.contract, self.token_id)
    }
}

// ============================================================================
// Ownership classification
// ============================================================================

/// Ownership classification of a candidate asset.
///
/// Derived on every discovery pass, never stored authoritatively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnershipState {
    /// Held by the owner on the source chain
    Owned,
    /// Left the owner toward a bridge flow that did not complete
    InBridge,
    /// Sitting at the contract's bridge address, waiting to be finalized
    ReadyToFinalize,
    /// A mirror already exists on the target chain
    AlreadyMigrated,
    /// Could not be classified; needs manual resolution
    Unknown,
}

impl OwnershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnershipState::Owned => "owned",
            OwnershipState::InBridge => "in_bridge",
            OwnershipState::ReadyToFinalize => "ready_to_finalize",
            OwnershipState::AlreadyMigrated => "already_migrated",
            OwnershipState::Unknown => "unknown",
        }
    }

    /// Whether the asset may be offered for a new bridge operation
    pub fn is_selectable(&self) -> bool {
        matches!(
            self,
            OwnershipState::Owned | OwnershipState::InBridge | OwnershipState::ReadyToFinalize
        )
    }
}

impl fmt::Display for OwnershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An asset together with its classification and supporting evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredAsset {
    pub asset: Asset,
    pub state: OwnershipState,
    /// Current holder on the source chain, when it could be read
    pub current_holder: Option<String>,
    /// Owner of the mirror on the target chain (AlreadyMigrated only)
    pub mirror_owner: Option<String>,
    /// Why the asset ended up Unknown, if it did
    pub note: Option<String>,
}

impl DiscoveredAsset {
    pub fn new(asset: Asset, state: OwnershipState) -> Self {
        Self {
            asset,
            state,
            current_holder: None,
            mirror_owner: None,
            note: None,
        }
    }

    pub fn with_holder(mut self, holder: Option<String>) -> Self {
        self.current_holder = holder;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// One ERC-721 style transfer observed in chain history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub token_id: TokenId,
    pub from: String,
    pub to: String,
    /// Block number or slot
    pub height: u64,
    /// Position inside the block, for ordering transfers at the same height
    pub log_index: u64,
}

/// Identifier of a cast submitted to the bridge canister
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CastId(pub u128);

impl fmt::Display for CastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cast-{}", self.0)
    }
}

//! Solana chain adapter
//!
//! NFTs are SPL mints with supply 1; a "collection" is the Metaplex
//! collection mint that member NFTs point to (verified) from their metadata
//! account. Enumeration walks the owner's token accounts and keeps the mints
//! whose metadata names the collection.
//!
//! Solana has no indexed transfer log comparable to ERC-721 events, so
//! `transfer_history` is unsupported and discovery relies on enumeration.

use async_trait::async_trait;
use borsh::{BorshDeserialize, BorshSerialize};
use eyre::Result;
use serde_json::Value;
use solana_client::{nonblocking::rpc_client::RpcClient, rpc_request::TokenAccountsFilter};
use solana_sdk::{commitment_config::CommitmentConfig, message::Message, pubkey::Pubkey};
use std::fmt::Display;
use std::str::FromStr;
use tracing::{debug, info};

use super::{ChainQueryAdapter, FeeSchedule};
use crate::config::EndpointConfig;
use crate::error::{AdapterError, AdapterResult};
use crate::retry::rpc_failure;
use crate::types::{Chain, SolanaCluster, TokenId, TransferRecord};

pub const TOKEN_PROGRAM_ID: Pubkey = solana_sdk::pubkey!("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");
pub const METADATA_PROGRAM_ID: Pubkey = solana_sdk::pubkey!("metaqbxxUerdq28cj1RbAWkYQm3ybzjb6a8bt518x1s");

/// Account sizes one NFT mint creates: mint, token account, metadata,
/// master edition
const MINT_ACCOUNT_SPACES: [usize; 4] = [82, 165, 679, 282];

/// Signatures on a mint transaction (payer + mint keypair)
const SIGNATURES_PER_MINT: u64 = 2;

#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
struct Creator {
    address: [u8; 32],
    verified: bool,
    share: u8,
}

#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
struct CollectionRef {
    verified: bool,
    key: [u8; 32],
}

/// Leading fields of a Metaplex metadata account, up to the collection
#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
struct MetadataPrefix {
    key: u8,
    update_authority: [u8; 32],
    mint: [u8; 32],
    name: String,
    symbol: String,
    uri: String,
    seller_fee_basis_points: u16,
    creators: Option<Vec<Creator>>,
    primary_sale_happened: bool,
    is_mutable: bool,
    edition_nonce: Option<u8>,
    token_standard: Option<u8>,
    collection: Option<CollectionRef>,
}

/// Verified collection mint named by a metadata account, if any
fn verified_collection(data: &[u8]) -> Option<Pubkey> {
    // accounts are zero padded past the collection field
    let meta = MetadataPrefix::deserialize(&mut &data[..]).ok()?;
    meta.collection
        .filter(|c| c.verified)
        .map(|c| Pubkey::new_from_array(c.key))
}

/// `(mint, holds exactly one whole token)` from a jsonParsed token account
fn parse_holding(data: &Value) -> Option<(String, bool)> {
    let info = data.get("parsed")?.get("info")?;
    let mint = info.get("mint")?.as_str()?.to_string();
    let amount = info.get("tokenAmount")?;
    let is_single = amount.get("amount")?.as_str()? == "1"
        && amount.get("decimals")?.as_u64()? == 0;
    Some((mint, is_single))
}

pub fn metadata_address(mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[b"metadata", METADATA_PROGRAM_ID.as_ref(), mint.as_ref()],
        &METADATA_PROGRAM_ID,
    )
    .0
}

/// Read-only Solana adapter
pub struct SolanaQueryAdapter {
    client: RpcClient,
    cluster: SolanaCluster,
    source: String,
}

impl SolanaQueryAdapter {
    pub fn new(rpc_url: &str, cluster: SolanaCluster) -> Self {
        let client = RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed());
        info!(cluster = cluster.as_str(), "Created Solana query adapter");
        Self {
            client,
            cluster,
            source: Chain::solana(cluster).to_string(),
        }
    }

    /// Build from `SOLANA_RPC_URL`; the cluster is taken from the URL
    pub fn from_env() -> Result<Self> {
        let endpoints = EndpointConfig::from_env()?;
        let url = endpoints.solana()?;
        let cluster = if url.contains("devnet") {
            SolanaCluster::Devnet
        } else if url.contains("testnet") {
            SolanaCluster::Testnet
        } else if url.contains("localhost") || url.contains("127.0.0.1") {
            SolanaCluster::Localnet
        } else {
            SolanaCluster::Mainnet
        };
        Ok(Self::new(url, cluster))
    }

    fn err(&self, context: &str, e: impl Display) -> AdapterError {
        rpc_failure(&self.source, format!("{}: {}", context, e))
    }

    fn pubkey(&self, value: &str) -> AdapterResult<Pubkey> {
        Pubkey::from_str(value.trim())
            .map_err(|e| AdapterError::decode(&self.source, format!("bad pubkey {}: {}", value, e)))
    }

    async fn collection_of(&self, mint: &Pubkey) -> AdapterResult<Option<Pubkey>> {
        match self.client.get_account_data(&metadata_address(mint)).await {
            Ok(data) => Ok(verified_collection(&data)),
            Err(e) if e.to_string().contains("AccountNotFound") => Ok(None),
            Err(e) => Err(self.err("metadata account", e)),
        }
    }
}

#[async_trait]
impl ChainQueryAdapter for SolanaQueryAdapter {
    fn chain(&self) -> Chain {
        Chain::solana(self.cluster)
    }

    async fn supports_enumeration(&self, _collection: &str) -> AdapterResult<bool> {
        Ok(true)
    }

    async fn tokens_of_owner(&self, collection: &str, owner: &str) -> AdapterResult<Vec<TokenId>> {
        let collection = self.pubkey(collection)?;
        let owner = self.pubkey(owner)?;
        let accounts = self
            .client
            .get_token_accounts_by_owner(&owner, TokenAccountsFilter::ProgramId(TOKEN_PROGRAM_ID))
            .await
            .map_err(|e| self.err("getTokenAccountsByOwner", e))?;

        let mut tokens = Vec::new();
        for keyed in accounts {
            let data = serde_json::to_value(&keyed.account.data)
                .map_err(|e| AdapterError::decode(&self.source, e))?;
            let Some((mint, true)) = parse_holding(&data) else { continue };
            let mint_key = self.pubkey(&mint)?;
            if self.collection_of(&mint_key).await? == Some(collection) {
                tokens.push(TokenId(mint));
            }
        }
        tokens.sort();
        debug!(collection = %collection, owner = %owner, count = tokens.len(), "Enumerated Solana NFTs");
        Ok(tokens)
    }

    async fn owner_of(&self, _collection: &str, token_id: &TokenId) -> AdapterResult<Option<String>> {
        let mint = self.pubkey(token_id.as_str())?;
        let largest = match self.client.get_token_largest_accounts(&mint).await {
            Ok(accounts) => accounts,
            Err(e) if e.to_string().contains("could not find mint") => return Ok(None),
            Err(e) => return Err(self.err("getTokenLargestAccounts", e)),
        };
        let Some(holding) = largest.into_iter().find(|a| a.amount.amount == "1") else {
            return Ok(None);
        };
        let account = self
            .client
            .get_token_account(&self.pubkey(&holding.address)?)
            .await
            .map_err(|e| self.err("getTokenAccount", e))?;
        Ok(account.map(|a| a.owner))
    }

    async fn latest_height(&self) -> AdapterResult<u64> {
        self.client
            .get_slot()
            .await
            .map_err(|e| self.err("getSlot", e))
    }

    async fn transfer_history(
        &self,
        _collection: &str,
        _account: &str,
        _from_height: u64,
        _to_height: u64,
    ) -> AdapterResult<Vec<TransferRecord>> {
        Err(AdapterError::unsupported(&self.source, "transfer history"))
    }

    async fn native_balance(&self, account: &str) -> AdapterResult<u128> {
        let lamports = self
            .client
            .get_balance(&self.pubkey(account)?)
            .await
            .map_err(|e| self.err("getBalance", e))?;
        Ok(lamports as u128)
    }

    async fn fee_schedule(&self) -> AdapterResult<FeeSchedule> {
        let mut rent_per_asset = 0u64;
        for space in MINT_ACCOUNT_SPACES {
            rent_per_asset += self
                .client
                .get_minimum_balance_for_rent_exemption(space)
                .await
                .map_err(|e| self.err("getMinimumBalanceForRentExemption", e))?;
        }

        let blockhash = self
            .client
            .get_latest_blockhash()
            .await
            .map_err(|e| self.err("getLatestBlockhash", e))?;
        // a message with only a payer costs exactly one signature
        let empty = Message::new_with_blockhash(&[], Some(&Pubkey::default()), &blockhash);
        let fee_per_signature = self
            .client
            .get_fee_for_message(&empty)
            .await
            .map_err(|e| self.err("getFeeForMessage", e))?;

        Ok(FeeSchedule::Solana {
            fee_per_signature,
            rent_per_asset,
            signatures_per_asset: SIGNATURES_PER_MINT,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(collection: Option<CollectionRef>) -> Vec<u8> {
        let meta = MetadataPrefix {
            key: 4,
            update_authority: [1; 32],
            mint: [2; 32],
            name: "Mirror #1".into(),
            symbol: "MIR".into(),
            uri: "https://example.invalid/1.json".into(),
            seller_fee_basis_points: 500,
            creators: Some(vec![Creator {
                address: [3; 32],
                verified: true,
                share: 100,
            }]),
            primary_sale_happened: true,
            is_mutable: true,
            edition_nonce: Some(255),
            token_standard: Some(0),
            collection,
        };
        let mut bytes = meta.try_to_vec().unwrap();
        bytes.resize(679, 0);
        bytes
    }

    #[test]
    fn test_verified_collection_from_padded_account() {
        let data = metadata(Some(CollectionRef {
            verified: true,
            key: [9; 32],
        }));
        assert_eq!(verified_collection(&data), Some(Pubkey::new_from_array([9; 32])));

        let unverified = metadata(Some(CollectionRef {
            verified: false,
            key: [9; 32],
        }));
        assert_eq!(verified_collection(&unverified), None);
        assert_eq!(verified_collection(&metadata(None)), None);
        assert_eq!(verified_collection(&[4, 1, 2]), None);
    }

    #[test]
    fn test_parse_holding() {
        let nft = json!({
            "program": "spl-token",
            "parsed": {"info": {"mint": "Mint1", "owner": "Owner", "tokenAmount": {"amount": "1", "decimals": 0}}},
            "space": 165
        });
        assert_eq!(parse_holding(&nft), Some(("Mint1".to_string(), true)));

        let fungible = json!({
            "parsed": {"info": {"mint": "Usdc", "tokenAmount": {"amount": "1", "decimals": 6}}}
        });
        assert_eq!(parse_holding(&fungible), Some(("Usdc".to_string(), false)));
        assert_eq!(parse_holding(&json!(["base64data", "base64"])), None);
    }

    #[test]
    fn test_metadata_pda_is_deterministic() {
        let mint = Pubkey::new_from_array([7; 32]);
        assert_eq!(metadata_address(&mint), metadata_address(&mint));
        assert_ne!(metadata_address(&mint), metadata_address(&Pubkey::new_from_array([8; 32])));
    }

    #[tokio::test]
    async fn test_history_is_unsupported() {
        let adapter = SolanaQueryAdapter::new("http://127.0.0.1:8899", SolanaCluster::Localnet);
        let err = adapter.transfer_history("c", "o", 0, 1).await.unwrap_err();
        assert_eq!(err.kind, crate::error::AdapterErrorKind::Unsupported);
        assert_eq!(err.source_name, "solana:localnet");
    }
}

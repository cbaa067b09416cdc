//! EVM chain adapter
//!
//! ERC-721 reads through alloy `sol!` bindings and `Transfer` log scans.
//! Enumeration is only offered when the collection reports ERC-721
//! Enumerable (`0x780e9d63`) through ERC-165.

use alloy::{
    primitives::{Address, FixedBytes, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::Filter,
    sol,
    sol_types::SolEvent,
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use eyre::{eyre, Result};
use std::fmt::Display;
use tracing::{debug, info};

use super::{ChainQueryAdapter, FeeSchedule};
use crate::config::EndpointConfig;
use crate::error::{AdapterError, AdapterResult};
use crate::retry::rpc_failure;
use crate::types::{Chain, TokenId, TransferRecord};

sol! {
    /// Subset of ERC-721 + ERC-721 Enumerable + ERC-165
    #[sol(rpc)]
    contract ERC721 {
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);

        function balanceOf(address owner) external view returns (uint256);
        function ownerOf(uint256 tokenId) external view returns (address);
        function tokenOfOwnerByIndex(address owner, uint256 index) external view returns (uint256);
        function supportsInterface(bytes4 interfaceId) external view returns (bool);
    }
}

/// ERC-165 interface id of ERC-721 Enumerable
pub const ERC721_ENUMERABLE_INTERFACE: [u8; 4] = [0x78, 0x0e, 0x9d, 0x63];

/// Gas one mirror mint/unlock costs on an EVM target
pub const DEFAULT_MINT_GAS: u64 = 250_000;

/// Read-only EVM adapter
pub struct EvmQueryAdapter {
    provider: RootProvider<Http<Client>>,
    chain_id: u64,
    mint_gas: u64,
    source: String,
}

impl EvmQueryAdapter {
    pub fn new(rpc_url: &str, chain_id: u64) -> Result<Self> {
        let provider = ProviderBuilder::new().on_http(
            rpc_url
                .parse()
                .map_err(|e| eyre!("Invalid RPC URL: {}", e))?,
        );
        info!(chain_id, "Created EVM query adapter");
        Ok(Self {
            provider,
            chain_id,
            mint_gas: DEFAULT_MINT_GAS,
            source: Chain::evm(chain_id).to_string(),
        })
    }

    /// Build from `EVM_RPC_URL` / `EVM_CHAIN_ID`
    pub fn from_env() -> Result<Self> {
        let endpoints = EndpointConfig::from_env()?;
        let (url, chain_id) = endpoints.evm()?;
        Self::new(url, chain_id)
    }

    pub fn with_mint_gas(mut self, gas: u64) -> Self {
        self.mint_gas = gas;
        self
    }

    pub fn provider(&self) -> &RootProvider<Http<Client>> {
        &self.provider
    }

    fn err(&self, context: &str, e: impl Display) -> AdapterError {
        rpc_failure(&self.source, format!("{}: {}", context, e))
    }

    fn address(&self, value: &str) -> AdapterResult<Address> {
        value
            .trim()
            .parse()
            .map_err(|e| AdapterError::decode(&self.source, format!("bad address {}: {}", value, e)))
    }

    fn token(&self, token_id: &TokenId) -> AdapterResult<U256> {
        token_id
            .as_str()
            .parse()
            .map_err(|e| AdapterError::decode(&self.source, format!("bad token id {}: {}", token_id, e)))
    }

    fn format_address(address: Address) -> String {
        format!("{:#x}", address)
    }

    async fn transfer_logs(
        &self,
        collection: Address,
        account: Address,
        outgoing: bool,
        from_height: u64,
        to_height: u64,
    ) -> AdapterResult<Vec<TransferRecord>> {
        let filter = Filter::new()
            .address(collection)
            .event_signature(ERC721::Transfer::SIGNATURE_HASH)
            .from_block(from_height)
            .to_block(to_height);
        let filter = if outgoing {
            filter.topic1(account.into_word())
        } else {
            filter.topic2(account.into_word())
        };

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| self.err(&format!("get_logs {}..{}", from_height, to_height), e))?;

        let mut records = Vec::with_capacity(logs.len());
        for log in logs {
            // ERC-20 shares the Transfer signature; its amount is not indexed
            if log.topics().len() != 4 {
                continue;
            }
            let height = log.block_number.unwrap_or(from_height);
            let log_index = log.log_index.unwrap_or(0);
            let decoded = log
                .log_decode::<ERC721::Transfer>()
                .map_err(|e| AdapterError::decode(&self.source, format!("Transfer log: {}", e)))?;
            let event = decoded.inner.data;
            records.push(TransferRecord {
                token_id: TokenId(event.tokenId.to_string()),
                from: Self::format_address(event.from),
                to: Self::format_address(event.to),
                height,
                log_index,
            });
        }
        Ok(records)
    }
}

fn is_revert(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("revert") || lower.contains("nonexistent")
}

#[async_trait]
impl ChainQueryAdapter for EvmQueryAdapter {
    fn chain(&self) -> Chain {
        Chain::evm(self.chain_id)
    }

    async fn supports_enumeration(&self, collection: &str) -> AdapterResult<bool> {
        let contract = ERC721::new(self.address(collection)?, &self.provider);
        match contract
            .supportsInterface(FixedBytes(ERC721_ENUMERABLE_INTERFACE))
            .call()
            .await
        {
            Ok(result) => Ok(result._0),
            // Contracts without ERC-165 revert; treat as not enumerable
            Err(e) if is_revert(&e.to_string()) => Ok(false),
            Err(e) => Err(self.err("supportsInterface", e)),
        }
    }

    async fn tokens_of_owner(&self, collection: &str, owner: &str) -> AdapterResult<Vec<TokenId>> {
        let contract = ERC721::new(self.address(collection)?, &self.provider);
        let owner = self.address(owner)?;
        let balance = contract
            .balanceOf(owner)
            .call()
            .await
            .map_err(|e| self.err("balanceOf", e))?
            ._0;
        let count: u64 = balance
            .try_into()
            .map_err(|_| AdapterError::decode(&self.source, "balance exceeds u64"))?;

        let mut tokens = Vec::with_capacity(count as usize);
        for index in 0..count {
            let token = contract
                .tokenOfOwnerByIndex(owner, U256::from(index))
                .call()
                .await
                .map_err(|e| self.err("tokenOfOwnerByIndex", e))?
                ._0;
            tokens.push(TokenId(token.to_string()));
        }
        debug!(collection = %collection, count, "Enumerated ERC-721 holdings");
        Ok(tokens)
    }

    async fn owner_of(&self, collection: &str, token_id: &TokenId) -> AdapterResult<Option<String>> {
        let contract = ERC721::new(self.address(collection)?, &self.provider);
        match contract.ownerOf(self.token(token_id)?).call().await {
            Ok(result) => Ok(Some(Self::format_address(result._0))),
            // Burned or never minted
            Err(e) if is_revert(&e.to_string()) => Ok(None),
            Err(e) => Err(self.err("ownerOf", e)),
        }
    }

    async fn latest_height(&self) -> AdapterResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| self.err("eth_blockNumber", e))
    }

    async fn transfer_history(
        &self,
        collection: &str,
        account: &str,
        from_height: u64,
        to_height: u64,
    ) -> AdapterResult<Vec<TransferRecord>> {
        let collection = self.address(collection)?;
        let account = self.address(account)?;
        let mut records = self
            .transfer_logs(collection, account, true, from_height, to_height)
            .await?;
        let incoming = self
            .transfer_logs(collection, account, false, from_height, to_height)
            .await?;
        for record in incoming {
            // self-transfers show up in both queries
            if !records
                .iter()
                .any(|r| r.height == record.height && r.log_index == record.log_index)
            {
                records.push(record);
            }
        }
        records.sort_by_key(|r| (r.height, r.log_index));
        Ok(records)
    }

    async fn native_balance(&self, account: &str) -> AdapterResult<u128> {
        let balance = self
            .provider
            .get_balance(self.address(account)?)
            .await
            .map_err(|e| self.err("eth_getBalance", e))?;
        balance
            .try_into()
            .map_err(|_| AdapterError::decode(&self.source, "balance exceeds u128"))
    }

    async fn fee_schedule(&self) -> AdapterResult<FeeSchedule> {
        let gas_price = self
            .provider
            .get_gas_price()
            .await
            .map_err(|e| self.err("eth_gasPrice", e))?;
        Ok(FeeSchedule::Evm {
            gas_price,
            gas_per_asset: self.mint_gas,
        })
    }
}

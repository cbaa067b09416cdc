//! ICRC-7 collection reads on the Internet Computer

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::{ChainQueryAdapter, FeeSchedule};
use crate::error::{AdapterError, AdapterResult};
use crate::ic::{decode, CanisterTransport};
use crate::types::{Chain, TokenId, TransferRecord};

/// Page size for `icrc7_tokens_of`
const PAGE_SIZE: u64 = 100;

/// Read-only ICRC-7 adapter. Collections are canister IDs.
pub struct IcrcQueryAdapter<T: CanisterTransport> {
    transport: Arc<T>,
    page_size: u64,
}

impl<T: CanisterTransport> IcrcQueryAdapter<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            page_size: PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[async_trait]
impl<T: CanisterTransport> ChainQueryAdapter for IcrcQueryAdapter<T> {
    fn chain(&self) -> Chain {
        Chain::InternetComputer
    }

    async fn supports_enumeration(&self, _collection: &str) -> AdapterResult<bool> {
        // icrc7_tokens_of is part of the base standard
        Ok(true)
    }

    async fn tokens_of_owner(&self, collection: &str, owner: &str) -> AdapterResult<Vec<TokenId>> {
        let mut tokens = Vec::new();
        let mut prev: Option<String> = None;
        loop {
            let arg = json!([
                decode::account(owner),
                decode::some_or_none(prev.clone()),
                decode::some_or_none(Some(self.page_size)),
            ]);
            let reply = self
                .transport
                .query(collection, "icrc7_tokens_of", arg)
                .await?;
            let page = reply
                .as_array()
                .ok_or_else(|| AdapterError::decode("ic", "icrc7_tokens_of reply is not a vector"))?;
            for id in page {
                tokens.push(TokenId(decode::nat(id)?.to_string()));
            }
            if (page.len() as u64) < self.page_size {
                break;
            }
            prev = tokens.last().map(|t| t.0.clone());
        }
        debug!(collection = %collection, owner = %owner, count = tokens.len(), "Enumerated ICRC-7 tokens");
        Ok(tokens)
    }

    async fn owner_of(&self, collection: &str, token_id: &TokenId) -> AdapterResult<Option<String>> {
        let reply = self
            .transport
            .query(collection, "icrc7_owner_of", json!([[token_id.as_str()]]))
            .await?;
        let first = match &reply {
            Value::Array(items) => items.first(),
            other => Some(other),
        };
        first
            .and_then(decode::opt)
            .map(decode::account_owner)
            .transpose()
    }

    async fn latest_height(&self) -> AdapterResult<u64> {
        Err(AdapterError::unsupported("ic", "block height"))
    }

    async fn transfer_history(
        &self,
        _collection: &str,
        _account: &str,
        _from_height: u64,
        _to_height: u64,
    ) -> AdapterResult<Vec<TransferRecord>> {
        Err(AdapterError::unsupported("ic", "transfer history"))
    }

    async fn native_balance(&self, _account: &str) -> AdapterResult<u128> {
        Err(AdapterError::unsupported("ic", "native balance"))
    }

    async fn fee_schedule(&self) -> AdapterResult<FeeSchedule> {
        Ok(FeeSchedule::None)
    }
}

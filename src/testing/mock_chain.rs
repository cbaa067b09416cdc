//! Programmable chain adapter
//!
//! Holds a holder table and a transfer log per collection. Recording a
//! transfer appends to the log and moves the token, so scenarios read like
//! the chain history that produced them.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::adapter::{ChainQueryAdapter, FeeSchedule};
use crate::error::{AdapterError, AdapterResult};
use crate::types::{Chain, TokenId, TransferRecord};

#[derive(Default)]
struct ChainState {
    enumerable: HashSet<String>,
    holders: HashMap<(String, TokenId), String>,
    transfers: Vec<(String, TransferRecord)>,
    height: u64,
    balances: HashMap<String, u128>,
    fee_schedule: Option<FeeSchedule>,
    failing_tokens: HashSet<TokenId>,
    history_error: Option<AdapterError>,
    owner_delay: Option<Duration>,
}

/// Per-method call counters
#[derive(Debug, Default)]
pub struct ChainCalls {
    pub tokens_of_owner: AtomicUsize,
    pub owner_of: AtomicUsize,
    pub transfer_history: AtomicUsize,
    pub native_balance: AtomicUsize,
}

pub struct MockChainAdapter {
    chain: Chain,
    state: Mutex<ChainState>,
    pub calls: ChainCalls,
}

impl MockChainAdapter {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            state: Mutex::new(ChainState {
                height: 1_000,
                ..Default::default()
            }),
            calls: ChainCalls::default(),
        }
    }

    fn norm(&self, address: &str) -> String {
        self.chain.normalize_address(address)
    }

    /// Expose an enumerable ownership index for `collection`
    pub fn enable_enumeration(&self, collection: &str) {
        let key = self.norm(collection);
        self.state.lock().unwrap().enumerable.insert(key);
    }

    /// Place a token with a holder, without history
    pub fn set_holder(&self, collection: &str, token_id: impl Into<TokenId>, holder: &str) {
        let key = (self.norm(collection), token_id.into());
        let holder = self.norm(holder);
        self.state.lock().unwrap().holders.insert(key, holder);
    }

    /// Append a transfer at `height` and move the token to `to`
    pub fn record_transfer(&self, collection: &str, token_id: impl Into<TokenId>, from: &str, to: &str, height: u64) {
        let collection = self.norm(collection);
        let token_id = token_id.into();
        let mut state = self.state.lock().unwrap();
        let log_index = state.transfers.len() as u64;
        state.transfers.push((
            collection.clone(),
            TransferRecord {
                token_id: token_id.clone(),
                from: self.norm(from),
                to: self.norm(to),
                height,
                log_index,
            },
        ));
        state.holders.insert((collection, token_id), self.norm(to));
        state.height = state.height.max(height);
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    pub fn set_balance(&self, account: &str, amount: u128) {
        let account = self.norm(account);
        self.state.lock().unwrap().balances.insert(account, amount);
    }

    pub fn set_fee_schedule(&self, schedule: FeeSchedule) {
        self.state.lock().unwrap().fee_schedule = Some(schedule);
    }

    /// Make `owner_of` fail for one token
    pub fn fail_owner_of(&self, token_id: impl Into<TokenId>) {
        self.state.lock().unwrap().failing_tokens.insert(token_id.into());
    }

    /// Make every `transfer_history` call fail
    pub fn fail_history(&self, error: AdapterError) {
        self.state.lock().unwrap().history_error = Some(error);
    }

    /// Delay every `owner_of` reply
    pub fn delay_owner_of(&self, delay: Duration) {
        self.state.lock().unwrap().owner_delay = Some(delay);
    }

    pub fn owner_of_calls(&self) -> usize {
        self.calls.owner_of.load(Ordering::SeqCst)
    }

    pub fn history_calls(&self) -> usize {
        self.calls.transfer_history.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainQueryAdapter for MockChainAdapter {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn supports_enumeration(&self, collection: &str) -> AdapterResult<bool> {
        let key = self.norm(collection);
        Ok(self.state.lock().unwrap().enumerable.contains(&key))
    }

    async fn tokens_of_owner(&self, collection: &str, owner: &str) -> AdapterResult<Vec<TokenId>> {
        self.calls.tokens_of_owner.fetch_add(1, Ordering::SeqCst);
        let collection = self.norm(collection);
        let owner = self.norm(owner);
        let state = self.state.lock().unwrap();
        if !state.enumerable.contains(&collection) {
            return Err(AdapterError::unsupported(self.chain.to_string(), "enumeration"));
        }
        let mut tokens: Vec<TokenId> = state
            .holders
            .iter()
            .filter(|((c, _), holder)| *c == collection && **holder == owner)
            .map(|((_, t), _)| t.clone())
            .collect();
        tokens.sort();
        Ok(tokens)
    }

    async fn owner_of(&self, collection: &str, token_id: &TokenId) -> AdapterResult<Option<String>> {
        self.calls.owner_of.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().unwrap().owner_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        if state.failing_tokens.contains(token_id) {
            return Err(AdapterError::rpc(self.chain.to_string(), "owner_of reverted"));
        }
        Ok(state
            .holders
            .get(&(self.norm(collection), token_id.clone()))
            .cloned())
    }

    async fn latest_height(&self) -> AdapterResult<u64> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn transfer_history(
        &self,
        collection: &str,
        account: &str,
        from_height: u64,
        to_height: u64,
    ) -> AdapterResult<Vec<TransferRecord>> {
        self.calls.transfer_history.fetch_add(1, Ordering::SeqCst);
        let collection = self.norm(collection);
        let account = self.norm(account);
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.history_error {
            return Err(err.clone());
        }
        Ok(state
            .transfers
            .iter()
            .filter(|(c, r)| {
                *c == collection
                    && r.height >= from_height
                    && r.height <= to_height
                    && (r.from == account || r.to == account)
            })
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn native_balance(&self, account: &str) -> AdapterResult<u128> {
        self.calls.native_balance.fetch_add(1, Ordering::SeqCst);
        let account = self.norm(account);
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(&account)
            .copied()
            .unwrap_or(0))
    }

    async fn fee_schedule(&self) -> AdapterResult<FeeSchedule> {
        let schedule = self.state.lock().unwrap().fee_schedule.clone();
        Ok(schedule.unwrap_or(match self.chain {
            Chain::Evm { .. } => FeeSchedule::Evm {
                gas_price: 1_000_000_000,
                gas_per_asset: 200_000,
            },
            Chain::Solana { .. } => FeeSchedule::Solana {
                fee_per_signature: 5_000,
                rent_per_asset: 2_039_280,
                signatures_per_asset: 2,
            },
            Chain::InternetComputer => FeeSchedule::None,
        }))
    }
}

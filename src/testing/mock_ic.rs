//! Mocks for the IC-side collaborators

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{AdapterError, AdapterResult, ApprovalPurpose};
use crate::ic::{
    Allowance, BridgeCanister, CastRequest, DeploymentState, FeeLedger, MirrorDirectory,
};
use crate::poller::CastState;
use crate::types::{CastId, Chain, ContractPointer, TokenId};

// ============================================================================
// Mirror directory
// ============================================================================

#[derive(Default)]
pub struct MockMirrorDirectory {
    mirrors: Mutex<HashMap<ContractPointer, String>>,
    owners: Mutex<HashMap<(String, TokenId), String>>,
    failing_tokens: Mutex<Vec<TokenId>>,
    resolve_delay: Mutex<Option<Duration>>,
    mirror_calls: AtomicUsize,
    owner_calls: AtomicUsize,
}

impl MockMirrorDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mirror(&self, source: &ContractPointer, mirror: &str) {
        self.mirrors.lock().unwrap().insert(source.clone(), mirror.to_string());
    }

    pub fn set_mirror_owner(&self, mirror: &str, token_id: impl Into<TokenId>, owner: &str) {
        self.owners
            .lock()
            .unwrap()
            .insert((mirror.to_string(), token_id.into()), owner.to_string());
    }

    pub fn fail_owner_of(&self, token_id: impl Into<TokenId>) {
        self.failing_tokens.lock().unwrap().push(token_id.into());
    }

    /// Slow down mirror identity resolution, to widen race windows
    pub fn delay_resolution(&self, delay: Duration) {
        *self.resolve_delay.lock().unwrap() = Some(delay);
    }

    pub fn mirror_canister_calls(&self) -> usize {
        self.mirror_calls.load(Ordering::SeqCst)
    }

    pub fn mirror_owner_calls(&self) -> usize {
        self.owner_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MirrorDirectory for MockMirrorDirectory {
    async fn mirror_canister(&self, source: &ContractPointer) -> AdapterResult<Option<String>> {
        self.mirror_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.resolve_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.mirrors.lock().unwrap().get(source).cloned())
    }

    async fn mirror_owner(&self, mirror: &str, token_id: &TokenId) -> AdapterResult<Option<String>> {
        self.owner_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_tokens.lock().unwrap().contains(token_id) {
            return Err(AdapterError::rpc("mirror", "icrc7_owner_of trapped"));
        }
        Ok(self
            .owners
            .lock()
            .unwrap()
            .get(&(mirror.to_string(), token_id.clone()))
            .cloned())
    }
}

// ============================================================================
// Bridge canister
// ============================================================================

pub struct MockBridgeCanister {
    pub orchestrator: String,
    approval_addresses: Mutex<HashMap<ContractPointer, String>>,
    funding_address: Mutex<Option<String>>,
    cast_spender: Mutex<Option<String>>,
    deployment_cost: Mutex<Option<u128>>,
    cast_cost: Mutex<u128>,
    cast_replies: Mutex<VecDeque<AdapterResult<Vec<Result<CastId, String>>>>>,
    status_script: Mutex<VecDeque<Vec<Option<CastState>>>>,
    status_failures: Mutex<VecDeque<AdapterError>>,
    deployment_script: Mutex<VecDeque<DeploymentState>>,
    cast_requests: Mutex<Vec<CastRequest>>,
    cast_reply_delay: Mutex<Option<Duration>>,
    next_cast_id: AtomicU64,
    approval_calls: AtomicUsize,
    cast_calls: AtomicUsize,
    cast_status_calls: AtomicUsize,
    deploy_calls: AtomicUsize,
}

impl Default for MockBridgeCanister {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBridgeCanister {
    pub fn new() -> Self {
        Self {
            orchestrator: "orchestrator-canister".to_string(),
            approval_addresses: Mutex::new(HashMap::new()),
            funding_address: Mutex::new(None),
            cast_spender: Mutex::new(None),
            deployment_cost: Mutex::new(None),
            cast_cost: Mutex::new(0),
            cast_replies: Mutex::new(VecDeque::new()),
            status_script: Mutex::new(VecDeque::new()),
            status_failures: Mutex::new(VecDeque::new()),
            deployment_script: Mutex::new(VecDeque::new()),
            cast_requests: Mutex::new(Vec::new()),
            cast_reply_delay: Mutex::new(None),
            next_cast_id: AtomicU64::new(1),
            approval_calls: AtomicUsize::new(0),
            cast_calls: AtomicUsize::new(0),
            cast_status_calls: AtomicUsize::new(0),
            deploy_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_approval_address(&self, source: &ContractPointer, address: &str) {
        self.approval_addresses
            .lock()
            .unwrap()
            .insert(source.clone(), source.chain.normalize_address(address));
    }

    pub fn set_funding_address(&self, address: &str) {
        *self.funding_address.lock().unwrap() = Some(address.to_string());
    }

    /// Spender for cast approvals; the orchestrator when unset
    pub fn set_cast_spender(&self, spender: &str) {
        *self.cast_spender.lock().unwrap() = Some(spender.to_string());
    }

    pub fn set_costs(&self, deployment: Option<u128>, per_cast: u128) {
        *self.deployment_cost.lock().unwrap() = deployment;
        *self.cast_cost.lock().unwrap() = per_cast;
    }

    /// Queue the reply of the next `cast` call; unqueued calls accept everything
    pub fn push_cast_reply(&self, reply: AdapterResult<Vec<Result<CastId, String>>>) {
        self.cast_replies.lock().unwrap().push_back(reply);
    }

    /// Accept casts at once but hold every reply back by `delay`
    pub fn delay_cast_reply(&self, delay: Duration) {
        *self.cast_reply_delay.lock().unwrap() = Some(delay);
    }

    /// Successive `cast_status` replies; the last one repeats. With no script
    /// every cast reads `Completed`.
    pub fn script_cast_status(&self, replies: Vec<Vec<Option<CastState>>>) {
        *self.status_script.lock().unwrap() = replies.into();
    }

    pub fn fail_cast_status_once(&self, error: AdapterError) {
        self.status_failures.lock().unwrap().push_back(error);
    }

    /// Successive deployment states; the last one repeats
    pub fn script_deployment(&self, states: Vec<DeploymentState>) {
        *self.deployment_script.lock().unwrap() = states.into();
    }

    pub fn approval_address_calls(&self) -> usize {
        self.approval_calls.load(Ordering::SeqCst)
    }

    pub fn cast_calls(&self) -> usize {
        self.cast_calls.load(Ordering::SeqCst)
    }

    pub fn cast_status_calls(&self) -> usize {
        self.cast_status_calls.load(Ordering::SeqCst)
    }

    pub fn deploy_calls(&self) -> usize {
        self.deploy_calls.load(Ordering::SeqCst)
    }

    pub fn cast_requests(&self) -> Vec<CastRequest> {
        self.cast_requests.lock().unwrap().clone()
    }
}

fn pop_or_repeat<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

#[async_trait]
impl BridgeCanister for MockBridgeCanister {
    async fn approval_address(&self, source: &ContractPointer) -> AdapterResult<Option<String>> {
        self.approval_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.approval_addresses.lock().unwrap().get(source).cloned())
    }

    async fn funding_address(&self, _source: &ContractPointer, _target: Chain) -> AdapterResult<Option<String>> {
        Ok(self.funding_address.lock().unwrap().clone())
    }

    async fn spender_for(&self, purpose: ApprovalPurpose, _source: &ContractPointer) -> AdapterResult<String> {
        Ok(match purpose {
            ApprovalPurpose::Deployment => self.orchestrator.clone(),
            ApprovalPurpose::Cast => self
                .cast_spender
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| self.orchestrator.clone()),
        })
    }

    async fn deployment_cost(&self, _source: &ContractPointer, _target: Chain) -> AdapterResult<Option<u128>> {
        Ok(*self.deployment_cost.lock().unwrap())
    }

    async fn cast_cost(&self, _source: &ContractPointer, _target: Chain) -> AdapterResult<u128> {
        Ok(*self.cast_cost.lock().unwrap())
    }

    async fn deploy_remote(&self, _source: &ContractPointer, _target: Chain) -> AdapterResult<u128> {
        let n = self.deploy_calls.fetch_add(1, Ordering::SeqCst);
        Ok(n as u128 + 1)
    }

    async fn deployment_status(&self, _deployment_id: u128) -> AdapterResult<DeploymentState> {
        let mut script = self.deployment_script.lock().unwrap();
        Ok(pop_or_repeat(&mut script).unwrap_or(DeploymentState::Deployed {
            address: "mock-remote-collection".to_string(),
        }))
    }

    async fn cast(&self, requests: &[CastRequest]) -> AdapterResult<Vec<Result<CastId, String>>> {
        self.cast_calls.fetch_add(1, Ordering::SeqCst);
        let queued = self.cast_replies.lock().unwrap().pop_front();
        let reply = match queued {
            Some(reply) => reply,
            None => Ok(requests
                .iter()
                .map(|_| Ok(CastId(self.next_cast_id.fetch_add(1, Ordering::SeqCst) as u128)))
                .collect()),
        };
        if reply.is_ok() {
            self.cast_requests.lock().unwrap().extend_from_slice(requests);
        }
        let delay = *self.cast_reply_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reply
    }

    async fn cast_status(&self, ids: &[CastId]) -> AdapterResult<Vec<Option<CastState>>> {
        self.cast_status_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.status_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut script = self.status_script.lock().unwrap();
        let mut states = pop_or_repeat(&mut script)
            .unwrap_or_else(|| vec![Some(CastState::Completed); ids.len()]);
        states.resize(ids.len(), None);
        Ok(states)
    }
}

// ============================================================================
// Fee ledger
// ============================================================================

/// Fee ledger whose caller identity is `owner`
pub struct MockFeeLedger {
    pub owner: String,
    balances: Mutex<HashMap<String, u128>>,
    allowances: Mutex<HashMap<(String, String), Allowance>>,
    approvals: Mutex<Vec<(String, u128, Option<u64>)>>,
    approve_error: Mutex<Option<AdapterError>>,
}

impl MockFeeLedger {
    pub fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            balances: Mutex::new(HashMap::new()),
            allowances: Mutex::new(HashMap::new()),
            approvals: Mutex::new(Vec::new()),
            approve_error: Mutex::new(None),
        }
    }

    pub fn set_balance(&self, account: &str, amount: u128) {
        self.balances.lock().unwrap().insert(account.to_string(), amount);
    }

    pub fn set_allowance(&self, account: &str, spender: &str, allowance: Allowance) {
        self.allowances
            .lock()
            .unwrap()
            .insert((account.to_string(), spender.to_string()), allowance);
    }

    pub fn fail_approve(&self, error: AdapterError) {
        *self.approve_error.lock().unwrap() = Some(error);
    }

    /// `(spender, amount, expires_at)` of every approval, oldest first
    pub fn approvals(&self) -> Vec<(String, u128, Option<u64>)> {
        self.approvals.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeeLedger for MockFeeLedger {
    async fn balance_of(&self, account: &str) -> AdapterResult<u128> {
        Ok(self.balances.lock().unwrap().get(account).copied().unwrap_or(0))
    }

    async fn allowance(&self, account: &str, spender: &str) -> AdapterResult<Allowance> {
        Ok(self
            .allowances
            .lock()
            .unwrap()
            .get(&(account.to_string(), spender.to_string()))
            .copied()
            .unwrap_or_default())
    }

    async fn approve(&self, spender: &str, amount: u128, expires_at: Option<u64>) -> AdapterResult<u128> {
        if let Some(err) = self.approve_error.lock().unwrap().clone() {
            return Err(err);
        }
        let mut approvals = self.approvals.lock().unwrap();
        approvals.push((spender.to_string(), amount, expires_at));
        self.allowances.lock().unwrap().insert(
            (self.owner.clone(), spender.to_string()),
            Allowance { amount, expires_at },
        );
        Ok(approvals.len() as u128)
    }
}

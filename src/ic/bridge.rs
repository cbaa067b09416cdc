//! Bridge orchestrator canister client
//!
//! Wraps the orchestrator's query/update surface (costs, casts, remote
//! deployments, approval and funding addresses) and the ICRC-7 surface of
//! the mirror canisters it creates.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{AdapterError, AdapterResult, ApprovalPurpose};
use crate::ic::decode;
use crate::ic::{
    BridgeCanister, CanisterTransport, CastRequest, DeploymentState, MirrorDirectory,
};
use crate::poller::CastState;
use crate::types::{CastId, Chain, ContractPointer, TokenId};

/// Orchestrator method names
#[derive(Debug, Clone)]
pub struct BridgeMethods {
    pub mirror_canister: &'static str,
    pub approval_address: &'static str,
    pub funding_address: &'static str,
    pub remote_contract: &'static str,
    pub remote_cost: &'static str,
    pub cast_cost: &'static str,
    pub create_remote: &'static str,
    pub remote_status: &'static str,
    pub cast: &'static str,
    pub cast_state: &'static str,
}

impl Default for BridgeMethods {
    fn default() -> Self {
        Self {
            mirror_canister: "get_ck_nft_canister",
            approval_address: "get_approval_address",
            funding_address: "get_funding_address",
            remote_contract: "get_remote",
            remote_cost: "get_remote_cost",
            cast_cost: "get_cast_cost",
            create_remote: "create_remote",
            remote_status: "get_remote_status",
            cast: "cast",
            cast_state: "get_cast_state",
        }
    }
}

/// Candid `Network` variant for a chain
pub fn network_arg(chain: Chain) -> Value {
    match chain {
        Chain::Evm { chain_id } => json!({ "Ethereum": [decode::nat_arg(chain_id as u128)] }),
        Chain::Solana { cluster } => json!({ "Solana": [cluster.as_str()] }),
        Chain::InternetComputer => json!({ "IC": [] }),
    }
}

/// Candid `ContractPointer` record
pub fn pointer_arg(pointer: &ContractPointer) -> Value {
    json!({
        "contract": pointer.contract,
        "network": network_arg(pointer.chain),
    })
}

/// Decode a cast state variant into the poller's sub-state type
pub fn cast_state(value: &Value) -> AdapterResult<CastState> {
    let (tag, payload) = decode::variant(value)?;
    let state = match tag {
        "Created" => CastState::Created,
        "SubmittingToOrchestrator" => CastState::SubmittingToOrchestrator,
        "SubmittedToOrchestrator" => CastState::SubmittedToOrchestrator,
        "WaitingOnContract" => CastState::WaitingOnContract,
        "WaitingOnMint" => CastState::WaitingOnMint,
        "WaitingOnTransfer" => CastState::WaitingOnTransfer,
        "Completed" => CastState::Completed,
        "RemoteFinalized" => CastState::RemoteFinalized,
        "Error" => CastState::Error(match payload {
            Value::String(msg) => msg.clone(),
            Value::Null => "unspecified error".to_string(),
            other => decode::describe_error(other),
        }),
        other => {
            return Err(AdapterError::decode(
                "bridge",
                format!("unknown cast state {}", other),
            ))
        }
    };
    Ok(state)
}

fn deployment_state(value: &Value) -> AdapterResult<DeploymentState> {
    let (tag, payload) = decode::variant(value)?;
    match tag {
        "Pending" => Ok(DeploymentState::Pending),
        "Deploying" => Ok(DeploymentState::Deploying),
        "Deployed" => Ok(DeploymentState::Deployed {
            address: decode::text(payload)?,
        }),
        "Failed" => Ok(DeploymentState::Failed {
            reason: match payload {
                Value::String(s) => s.clone(),
                other => decode::describe_error(other),
            },
        }),
        other => Err(AdapterError::decode(
            "bridge",
            format!("unknown deployment state {}", other),
        )),
    }
}

/// Client for the bridge orchestrator and its mirror canisters
pub struct BridgeCanisterClient<T: CanisterTransport> {
    transport: Arc<T>,
    orchestrator: String,
    methods: BridgeMethods,
}

impl<T: CanisterTransport> BridgeCanisterClient<T> {
    pub fn new(transport: Arc<T>, orchestrator: &str) -> Self {
        Self::with_methods(transport, orchestrator, BridgeMethods::default())
    }

    pub fn with_methods(transport: Arc<T>, orchestrator: &str, methods: BridgeMethods) -> Self {
        info!(orchestrator = %orchestrator, "Created bridge canister client");
        Self {
            transport,
            orchestrator: orchestrator.to_string(),
            methods,
        }
    }

    pub fn orchestrator(&self) -> &str {
        &self.orchestrator
    }

    async fn query(&self, method: &str, arg: Value) -> AdapterResult<Value> {
        self.transport.query(&self.orchestrator, method, arg).await
    }

    async fn update(&self, method: &str, arg: Value) -> AdapterResult<Value> {
        self.transport.update(&self.orchestrator, method, arg).await
    }

    fn target_arg(source: &ContractPointer, target: Chain) -> Value {
        json!({
            "source": pointer_arg(source),
            "target": network_arg(target),
        })
    }
}

#[async_trait]
impl<T: CanisterTransport> MirrorDirectory for BridgeCanisterClient<T> {
    async fn mirror_canister(&self, source: &ContractPointer) -> AdapterResult<Option<String>> {
        let reply = self
            .query(self.methods.mirror_canister, json!([pointer_arg(source)]))
            .await?;
        // vec opt principal, one entry per requested pointer
        let first = match &reply {
            Value::Array(items) => items.first(),
            other => Some(other),
        };
        first
            .and_then(decode::opt)
            .map(decode::text)
            .transpose()
    }

    async fn mirror_owner(&self, mirror: &str, token_id: &TokenId) -> AdapterResult<Option<String>> {
        let reply = self
            .transport
            .query(mirror, "icrc7_owner_of", json!([[token_id.as_str()]]))
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
}

#[async_trait]
impl<T: CanisterTransport> BridgeCanister for BridgeCanisterClient<T> {
    async fn approval_address(&self, source: &ContractPointer) -> AdapterResult<Option<String>> {
        let reply = self
            .query(self.methods.approval_address, pointer_arg(source))
            .await?;
        let address = decode::opt(&reply).map(decode::text).transpose()?;
        debug!(source = %source, ?address, "Resolved approval address");
        Ok(address.map(|a| source.chain.normalize_address(&a)))
    }

    async fn funding_address(&self, source: &ContractPointer, target: Chain) -> AdapterResult<Option<String>> {
        let reply = self
            .query(self.methods.funding_address, Self::target_arg(source, target))
            .await?;
        decode::opt(&reply).map(decode::text).transpose()
    }

    async fn spender_for(&self, purpose: ApprovalPurpose, source: &ContractPointer) -> AdapterResult<String> {
        match purpose {
            ApprovalPurpose::Deployment => Ok(self.orchestrator.clone()),
            ApprovalPurpose::Cast => match self.mirror_canister(source).await? {
                Some(mirror) => Ok(mirror),
                // The orchestrator takes cast fees until the mirror exists
                None => Ok(self.orchestrator.clone()),
            },
        }
    }

    async fn deployment_cost(&self, source: &ContractPointer, target: Chain) -> AdapterResult<Option<u128>> {
        let existing = self
            .query(self.methods.remote_contract, Self::target_arg(source, target))
            .await?;
        if decode::opt(&existing).is_some() {
            return Ok(None);
        }
        let cost = self
            .query(self.methods.remote_cost, Self::target_arg(source, target))
            .await?;
        decode::nat(&cost).map(Some)
    }

    async fn cast_cost(&self, source: &ContractPointer, target: Chain) -> AdapterResult<u128> {
        let reply = self
            .query(self.methods.cast_cost, Self::target_arg(source, target))
            .await?;
        decode::nat(&reply)
    }

    async fn deploy_remote(&self, source: &ContractPointer, target: Chain) -> AdapterResult<u128> {
        let reply = self
            .update(self.methods.create_remote, Self::target_arg(source, target))
            .await?;
        let id = decode::result(&reply).and_then(decode::nat)?;
        info!(source = %source, target_chain = %target, deployment_id = id, "Remote deployment started");
        Ok(id)
    }

    async fn deployment_status(&self, deployment_id: u128) -> AdapterResult<DeploymentState> {
        let reply = self
            .query(self.methods.remote_status, json!([decode::nat_arg(deployment_id)]))
            .await?;
        let state = decode::opt(&reply)
            .ok_or_else(|| AdapterError::decode("bridge", format!("unknown deployment {}", deployment_id)))?;
        deployment_state(state)
    }

    async fn cast(&self, requests: &[CastRequest]) -> AdapterResult<Vec<Result<CastId, String>>> {
        let arg: Vec<Value> = requests
            .iter()
            .map(|r| {
                json!({
                    "token_id": r.asset.token_id.as_str(),
                    "source": pointer_arg(&r.asset.pointer()),
                    "target": network_arg(r.target),
                    "recipient": r.recipient,
                })
            })
            .collect();
        let reply = self.update(self.methods.cast, Value::Array(arg)).await?;
        let items = reply
            .as_array()
            .ok_or_else(|| AdapterError::decode("bridge", "cast reply is not a vector"))?;
        if items.len() != requests.len() {
            return Err(AdapterError::decode(
                "bridge",
                format!("cast reply has {} entries for {} requests", items.len(), requests.len()),
            ));
        }

        let results: Vec<Result<CastId, String>> = items
            .iter()
            .map(|item| match decode::result(item) {
                Ok(v) => decode::nat(v).map(CastId).map_err(|e| e.message),
                Err(e) => Err(e.message),
            })
            .collect();
        let rejected = results.iter().filter(|r| r.is_err()).count();
        if rejected > 0 {
            warn!(rejected, total = results.len(), "Bridge rejected some casts");
        }
        Ok(results)
    }

    async fn cast_status(&self, ids: &[CastId]) -> AdapterResult<Vec<Option<CastState>>> {
        let arg: Vec<Value> = ids.iter().map(|id| decode::nat_arg(id.0)).collect();
        let reply = self
            .query(self.methods.cast_state, json!([arg]))
            .await?;
        let items = reply
            .as_array()
            .ok_or_else(|| AdapterError::decode("bridge", "cast state reply is not a vector"))?;
        items
            .iter()
            .map(|item| decode::opt(item).map(cast_state).transpose())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use crate::types::SolanaCluster;

    fn client() -> (Arc<ScriptedTransport>, BridgeCanisterClient<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new());
        let client = BridgeCanisterClient::new(transport.clone(), "orchestrator-canister");
        (transport, client)
    }

    fn pointer() -> ContractPointer {
        ContractPointer::new(Chain::evm(1), "0xAA00000000000000000000000000000000000000")
    }

    #[test]
    fn test_cast_state_decoding() {
        assert_eq!(cast_state(&json!("Created")).unwrap(), CastState::Created);
        assert_eq!(
            cast_state(&json!({"WaitingOnMint": {"retries": 2}})).unwrap(),
            CastState::WaitingOnMint
        );
        assert_eq!(
            cast_state(&json!({"Error": "mint reverted"})).unwrap(),
            CastState::Error("mint reverted".into())
        );
        assert_eq!(
            cast_state(&json!({"Error": {"GenericError": "nonce"}})).unwrap(),
            CastState::Error("GenericError: nonce".into())
        );
        assert!(cast_state(&json!("Teleporting")).is_err());
    }

    #[test]
    fn test_network_args() {
        assert_eq!(network_arg(Chain::evm(8453)), json!({"Ethereum": ["8453"]}));
        assert_eq!(
            network_arg(Chain::solana(SolanaCluster::Devnet)),
            json!({"Solana": ["devnet"]})
        );
        assert_eq!(network_arg(Chain::InternetComputer), json!({"IC": []}));
    }

    #[tokio::test]
    async fn test_mirror_lookups() {
        let (transport, client) = client();
        transport.on("get_ck_nft_canister", json!([["mirror-canister"]]));
        transport.on(
            "icrc7_owner_of",
            json!([[{"owner": "holder-principal", "subaccount": []}]]),
        );
        assert_eq!(
            client.mirror_canister(&pointer()).await.unwrap(),
            Some("mirror-canister".to_string())
        );
        assert_eq!(
            client.mirror_owner("mirror-canister", &TokenId::from(5)).await.unwrap(),
            Some("holder-principal".to_string())
        );

        transport.on("icrc7_owner_of", json!([[]]));
        assert_eq!(
            client.mirror_owner("mirror-canister", &TokenId::from(6)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_deployment_cost_skips_existing_remote() {
        let (transport, client) = client();
        transport.on("get_remote", json!(["0xremote"]));
        assert_eq!(client.deployment_cost(&pointer(), Chain::evm(8453)).await.unwrap(), None);
        assert!(transport.calls_to("get_remote_cost").is_empty());

        transport.on("get_remote", json!([]));
        transport.on("get_remote_cost", json!("5_000_000"));
        assert_eq!(
            client.deployment_cost(&pointer(), Chain::evm(8453)).await.unwrap(),
            Some(5_000_000)
        );
    }

    #[tokio::test]
    async fn test_cast_keeps_per_request_results() {
        let (transport, client) = client();
        transport.on("cast", json!([{"Ok": "11"}, {"Err": {"GenericError": "not owner"}}]));
        let asset = crate::types::Asset::new(&pointer(), TokenId::from(1), "0xbb");
        let req = CastRequest {
            asset,
            target: Chain::evm(8453),
            recipient: "0xcc".into(),
        };
        let results = client.cast(&[req.clone(), req]).await.unwrap();
        assert_eq!(results[0], Ok(CastId(11)));
        assert!(results[1].as_ref().unwrap_err().contains("not owner"));
    }

    #[tokio::test]
    async fn test_cast_status_and_spender() {
        let (transport, client) = client();
        transport.on("get_cast_state", json!([["WaitingOnTransfer"], []]));
        let states = client.cast_status(&[CastId(1), CastId(2)]).await.unwrap();
        assert_eq!(states, vec![Some(CastState::WaitingOnTransfer), None]);

        transport.on("get_ck_nft_canister", json!([[]]));
        assert_eq!(
            client.spender_for(ApprovalPurpose::Cast, &pointer()).await.unwrap(),
            "orchestrator-canister"
        );
        assert_eq!(
            client.spender_for(ApprovalPurpose::Deployment, &pointer()).await.unwrap(),
            "orchestrator-canister"
        );
    }

    #[tokio::test]
    async fn test_deployment_status() {
        let (transport, client) = client();
        transport.on("get_remote_status", json!([{"Deployed": "0xabc"}]));
        assert_eq!(
            client.deployment_status(3).await.unwrap(),
            DeploymentState::Deployed {
                address: "0xabc".into()
            }
        );
        transport.on("get_remote_status", json!([]));
        assert!(client.deployment_status(4).await.is_err());
    }
}

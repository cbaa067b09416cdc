//! ICRC-2 fee ledger client
//!
//! Cycles-denominated ledger used to pay the bridge canister. Balances and
//! allowances are queries; approvals are update calls signed by the
//! transport's identity.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{AdapterError, AdapterResult};
use crate::ic::decode;
use crate::ic::{Allowance, CanisterTransport, FeeLedger};

/// Fee ledger reached through a canister transport
pub struct IcrcFeeLedger<T: CanisterTransport> {
    transport: Arc<T>,
    ledger_canister: String,
}

impl<T: CanisterTransport> IcrcFeeLedger<T> {
    pub fn new(transport: Arc<T>, ledger_canister: &str) -> Self {
        Self {
            transport,
            ledger_canister: ledger_canister.to_string(),
        }
    }

    fn source(&self) -> String {
        format!("ledger:{}", self.ledger_canister)
    }
}

#[async_trait]
impl<T: CanisterTransport> FeeLedger for IcrcFeeLedger<T> {
    async fn balance_of(&self, account: &str) -> AdapterResult<u128> {
        let reply = self
            .transport
            .query(&self.ledger_canister, "icrc1_balance_of", decode::account(account))
            .await?;
        decode::nat(&reply)
    }

    async fn allowance(&self, account: &str, spender: &str) -> AdapterResult<Allowance> {
        let arg = json!({
            "account": decode::account(account),
            "spender": decode::account(spender),
        });
        let reply = self
            .transport
            .query(&self.ledger_canister, "icrc2_allowance", arg)
            .await?;

        let amount = decode::nat(decode::field(&reply, "allowance")?)?;
        let expires_at = match reply.get("expires_at").and_then(decode::opt) {
            Some(v) => Some(u64::try_from(decode::nat(v)?).map_err(|_| {
                AdapterError::decode(self.source(), "expires_at exceeds nat64")
            })?),
            None => None,
        };
        debug!(account = %account, spender = %spender, amount, ?expires_at, "Read allowance");
        Ok(Allowance { amount, expires_at })
    }

    async fn approve(&self, spender: &str, amount: u128, expires_at: Option<u64>) -> AdapterResult<u128> {
        let arg = json!({
            "spender": decode::account(spender),
            "amount": decode::nat_arg(amount),
            "expires_at": decode::some_or_none(expires_at),
            "expected_allowance": [],
            "fee": [],
            "memo": [],
            "from_subaccount": [],
            "created_at_time": [],
        });
        let reply = self
            .transport
            .update(&self.ledger_canister, "icrc2_approve", arg)
            .await?;
        let block = decode::result(&reply)
            .map_err(|e| AdapterError::rpc(self.source(), format!("approve rejected: {}", e.message)))
            .and_then(decode::nat)?;

        info!(spender = %spender, amount, block, "Fee ledger approval submitted");
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use serde_json::json;

    #[tokio::test]
    async fn test_balance_and_allowance_decoding() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("icrc1_balance_of", json!("1_500"));
        transport.on(
            "icrc2_allowance",
            json!({"allowance": "120", "expires_at": [1_700_000_000_000_000_000u64]}),
        );
        let ledger = IcrcFeeLedger::new(transport.clone(), "um5iw-rqaaa-aaaaq-qaaba-cai");

        assert_eq!(ledger.balance_of("user-principal").await.unwrap(), 1_500);
        let allowance = ledger.allowance("user-principal", "spender-principal").await.unwrap();
        assert_eq!(allowance.amount, 120);
        assert_eq!(allowance.expires_at, Some(1_700_000_000_000_000_000));
    }

    #[tokio::test]
    async fn test_allowance_without_expiry() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("icrc2_allowance", json!({"allowance": 0, "expires_at": []}));
        let ledger = IcrcFeeLedger::new(transport, "ledger");
        let allowance = ledger.allowance("a", "b").await.unwrap();
        assert_eq!(allowance, Allowance::default());
    }

    #[tokio::test]
    async fn test_approve_ok_and_err() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("icrc2_approve", json!({"Ok": "88"}));
        let ledger = IcrcFeeLedger::new(transport.clone(), "ledger");
        assert_eq!(ledger.approve("spender", 120, None).await.unwrap(), 88);

        let args = transport.calls_to("icrc2_approve");
        assert_eq!(args[0]["amount"], json!("120"));
        assert_eq!(args[0]["spender"]["owner"], json!("spender"));

        transport.on("icrc2_approve", json!({"Err": {"InsufficientFunds": {"balance": "3"}}}));
        let err = ledger.approve("spender", 120, None).await.unwrap_err();
        assert!(err.message.contains("InsufficientFunds"));
    }
}

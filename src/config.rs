//! Environment configuration helpers
//!
//! Every engine has a config struct with a `Default` impl and a `from_env()`
//! constructor; optional variables fall back to the defaults. Adapter
//! endpoints are required once an adapter is built from the environment.

use eyre::{eyre, Result, WrapErr};
use std::env;
use std::str::FromStr;

/// Load `.env` from the working directory or its parents, if present
pub fn load_dotenv() {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!("Loaded .env from {:?}", path);
    }
}

/// Optional variable parsed as `T`, or `default` when unset or malformed
pub fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "Ignoring malformed environment variable");
                default
            }
        },
        Err(_) => default,
    }
}

/// Required variable
pub fn env_required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} required", name))
}

/// Required variable parsed as `T`
pub fn env_parse<T>(name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_required(name)?
        .trim()
        .parse()
        .wrap_err_with(|| format!("Invalid {}", name))
}

/// Endpoints for building chain adapters from the environment
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub evm_rpc_url: Option<String>,
    pub evm_chain_id: Option<u64>,
    pub solana_rpc_url: Option<String>,
}

impl EndpointConfig {
    pub fn from_env() -> Result<Self> {
        load_dotenv();
        let evm_chain_id = match env::var("EVM_CHAIN_ID") {
            Ok(_) => Some(env_parse("EVM_CHAIN_ID")?),
            Err(_) => None,
        };
        Ok(Self {
            evm_rpc_url: env::var("EVM_RPC_URL").ok(),
            evm_chain_id,
            solana_rpc_url: env::var("SOLANA_RPC_URL").ok(),
        })
    }

    /// EVM endpoint, failing if either half is missing
    pub fn evm(&self) -> Result<(&str, u64)> {
        match (&self.evm_rpc_url, self.evm_chain_id) {
            (Some(url), Some(id)) => Ok((url.as_str(), id)),
            (None, _) => Err(eyre!("EVM_RPC_URL required")),
            (_, None) => Err(eyre!("EVM_CHAIN_ID required")),
        }
    }

    pub fn solana(&self) -> Result<&str> {
        self.solana_rpc_url
            .as_deref()
            .ok_or_else(|| eyre!("SOLANA_RPC_URL required"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back() {
        env::remove_var("CKNFT_TEST_UNSET_VAR");
        assert_eq!(env_or("CKNFT_TEST_UNSET_VAR", 42u64), 42);

        env::set_var("CKNFT_TEST_BAD_VAR", "not-a-number");
        assert_eq!(env_or("CKNFT_TEST_BAD_VAR", 7u32), 7);

        env::set_var("CKNFT_TEST_GOOD_VAR", " 9000 ");
        assert_eq!(env_or("CKNFT_TEST_GOOD_VAR", 1u64), 9000);
    }

    #[test]
    fn test_env_parse_reports_name() {
        env::set_var("CKNFT_TEST_PARSE_VAR", "abc");
        let err = env_parse::<u64>("CKNFT_TEST_PARSE_VAR").unwrap_err();
        assert!(err.to_string().contains("CKNFT_TEST_PARSE_VAR"));
        assert!(env_required("CKNFT_TEST_MISSING_VAR").is_err());
    }

    #[test]
    fn test_endpoint_halves() {
        let cfg = EndpointConfig {
            evm_rpc_url: Some("http://localhost:8545".into()),
            evm_chain_id: None,
            solana_rpc_url: None,
        };
        assert!(cfg.evm().unwrap_err().to_string().contains("EVM_CHAIN_ID"));
        assert!(cfg.solana().is_err());
    }
}

//! Testing Utilities Module
//!
//! In-memory stand-ins for every collaborator the engines talk to, so that
//! discovery, reconciliation, workflows and polling can be exercised without
//! a node or a replica.
//!
//! ## Submodules
//!
//! - `transport` - scripted canister transport for the IC clients
//! - `mock_chain` - programmable chain adapter (holders, transfers, balances)
//! - `mock_ic` - mirror directory, bridge canister and fee ledger mocks
//! - `action` - scripted workflow step

pub mod action;
pub mod mock_chain;
pub mod mock_ic;
pub mod transport;

pub use action::ScriptedAction;
pub use mock_chain::*;
pub use mock_ic::*;
pub use transport::*;

/// Install a test subscriber honoring `RUST_LOG`; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

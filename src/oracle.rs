//! Remote-mint oracle
//!
//! Answers "does this source asset already have a mirror on the IC side?".
//! Two session caches back it:
//!
//! | cache     | key                                  | value                     |
//! |-----------|--------------------------------------|---------------------------|
//! | `mirrors` | `ContractPointer` (contract + chain) | mirror canister, or none  |
//! | `tokens`  | `(ContractPointer, TokenId)`         | mirror owner, or none     |
//!
//! Negative results are cached in both. A lookup that fails is not cached
//! and the error is returned to the caller (the entry is "unresolved").

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::adapter::with_timeout;
use crate::cache::SingleFlightCache;
use crate::error::AdapterResult;
use crate::ic::MirrorDirectory;
use crate::types::{ContractPointer, TokenId};

const SOURCE: &str = "mirror-directory";

pub struct RemoteMintOracle {
    directory: Arc<dyn MirrorDirectory>,
    mirrors: SingleFlightCache<ContractPointer, Option<String>>,
    tokens: SingleFlightCache<(ContractPointer, TokenId), Option<String>>,
    call_timeout: Duration,
}

impl RemoteMintOracle {
    pub fn new(directory: Arc<dyn MirrorDirectory>, call_timeout: Duration) -> Self {
        Self {
            directory,
            mirrors: SingleFlightCache::new("mirror-canister"),
            tokens: SingleFlightCache::new("mirror-owner"),
            call_timeout,
        }
    }

    /// Mirror canister for a source collection; resolved once per session
    pub async fn mirror_of(&self, source: &ContractPointer) -> AdapterResult<Option<String>> {
        self.mirrors
            .get_or_try_resolve(source, || {
                with_timeout(SOURCE, self.call_timeout, self.directory.mirror_canister(source))
            })
            .await
    }

    /// Owner of the mirror of `token_id`, or `None` if no mirror was minted
    pub async fn is_mirrored(&self, source: &ContractPointer, token_id: &TokenId) -> AdapterResult<Option<String>> {
        let key = (source.clone(), token_id.clone());
        if let Some(cached) = self.tokens.peek(&key) {
            return Ok(cached);
        }

        let Some(mirror) = self.mirror_of(source).await? else {
            // No mirror canister means no mirrored token either
            self.tokens.insert(key, None);
            return Ok(None);
        };

        let owner = self
            .tokens
            .get_or_try_resolve(&key, || {
                with_timeout(
                    SOURCE,
                    self.call_timeout,
                    self.directory.mirror_owner(&mirror, token_id),
                )
            })
            .await?;
        if let Some(owner) = &owner {
            debug!(source = %source, token = %token_id, mirror_owner = %owner, "Asset already mirrored");
        }
        Ok(owner)
    }

    /// Forget one token's answer
    pub fn invalidate(&self, source: &ContractPointer, token_id: &TokenId) -> bool {
        self.tokens.invalidate(&(source.clone(), token_id.clone()))
    }

    /// Forget a collection's mirror identity (e.g. after a deployment)
    pub fn invalidate_mirror(&self, source: &ContractPointer) -> bool {
        self.mirrors.invalidate(source)
    }

    pub fn clear(&self) {
        self.mirrors.clear();
        self.tokens.clear();
    }

    /// Number of times the mirror identity was actually resolved
    pub fn mirror_resolutions(&self) -> u64 {
        self.mirrors.stats().resolutions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMirrorDirectory;
    use crate::types::Chain;

    fn pointer() -> ContractPointer {
        ContractPointer::new(Chain::evm(1), "0x1111111111111111111111111111111111111111")
    }

    #[tokio::test]
    async fn test_caches_positive_and_negative_answers() {
        let directory = Arc::new(MockMirrorDirectory::new());
        directory.set_mirror(&pointer(), "mirror-canister");
        directory.set_mirror_owner("mirror-canister", 1, "holder");
        let oracle = RemoteMintOracle::new(directory.clone(), Duration::from_secs(1));

        assert_eq!(
            oracle.is_mirrored(&pointer(), &TokenId::from(1)).await.unwrap(),
            Some("holder".to_string())
        );
        assert_eq!(oracle.is_mirrored(&pointer(), &TokenId::from(2)).await.unwrap(), None);
        assert_eq!(oracle.is_mirrored(&pointer(), &TokenId::from(1)).await.unwrap(), Some("holder".into()));
        assert_eq!(oracle.is_mirrored(&pointer(), &TokenId::from(2)).await.unwrap(), None);

        assert_eq!(directory.mirror_canister_calls(), 1);
        assert_eq!(directory.mirror_owner_calls(), 2);
    }

    #[tokio::test]
    async fn test_no_mirror_canister_skips_owner_lookup() {
        let directory = Arc::new(MockMirrorDirectory::new());
        let oracle = RemoteMintOracle::new(directory.clone(), Duration::from_secs(1));
        for id in 0..5u64 {
            assert_eq!(oracle.is_mirrored(&pointer(), &TokenId::from(id)).await.unwrap(), None);
        }
        assert_eq!(directory.mirror_canister_calls(), 1);
        assert_eq!(directory.mirror_owner_calls(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let directory = Arc::new(MockMirrorDirectory::new());
        directory.set_mirror(&pointer(), "mirror-canister");
        directory.fail_owner_of(3);
        let oracle = RemoteMintOracle::new(directory.clone(), Duration::from_secs(1));

        assert!(oracle.is_mirrored(&pointer(), &TokenId::from(3)).await.is_err());
        assert!(oracle.is_mirrored(&pointer(), &TokenId::from(3)).await.is_err());
        assert_eq!(directory.mirror_owner_calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let directory = Arc::new(MockMirrorDirectory::new());
        let oracle = RemoteMintOracle::new(directory.clone(), Duration::from_secs(1));
        assert_eq!(oracle.is_mirrored(&pointer(), &TokenId::from(1)).await.unwrap(), None);

        // mirror appears later in the session
        directory.set_mirror(&pointer(), "mirror-canister");
        directory.set_mirror_owner("mirror-canister", 1, "holder");
        assert_eq!(oracle.is_mirrored(&pointer(), &TokenId::from(1)).await.unwrap(), None);

        oracle.clear();
        assert_eq!(
            oracle.is_mirrored(&pointer(), &TokenId::from(1)).await.unwrap(),
            Some("holder".to_string())
        );
        assert!(oracle.invalidate(&pointer(), &TokenId::from(1)));
        assert!(oracle.invalidate_mirror(&pointer()));
    }

    #[tokio::test]
    async fn test_concurrent_identity_resolution_is_single_flight() {
        let directory = Arc::new(MockMirrorDirectory::new());
        directory.set_mirror(&pointer(), "mirror-canister");
        directory.delay_resolution(Duration::from_millis(30));
        let oracle = Arc::new(RemoteMintOracle::new(directory.clone(), Duration::from_secs(1)));

        let handles: Vec<_> = (0..8u64)
            .map(|id| {
                let oracle = oracle.clone();
                tokio::spawn(async move { oracle.is_mirrored(&pointer(), &TokenId::from(id)).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), None);
        }
        assert_eq!(directory.mirror_canister_calls(), 1);
        assert_eq!(oracle.mirror_resolutions(), 1);
    }
}

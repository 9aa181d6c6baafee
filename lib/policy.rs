//! Mount policy adapter.
//!
//! The allowlist policy engine itself lives outside this crate; the
//! orchestrator only consults it as a pure validation function and stages
//! nothing the validator did not return.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::{config::Mount, WarrenError, WarrenResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Validates caller-requested mounts before anything is staged.
#[async_trait]
pub trait MountPolicy: Send + Sync {
    /// Returns the approved subset of the requested mounts.
    async fn validate(
        &self,
        requested: &[Mount],
        owner: &str,
        privileged: bool,
    ) -> WarrenResult<Vec<Mount>>;
}

/// A prefix allowlist used where no external validator is wired in.
///
/// Approves a mount when its host path starts with one of the allowed
/// prefixes; privileged owners bypass the check. Anything else is rejected
/// outright rather than silently dropped, so callers learn which mount was
/// refused.
#[derive(Debug, Default)]
pub struct PrefixAllowlistPolicy {
    /// Host path prefixes mounts may be taken from.
    allowed_prefixes: Vec<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PrefixAllowlistPolicy {
    /// Creates a policy allowing mounts under the given host prefixes.
    pub fn new(allowed_prefixes: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            allowed_prefixes: allowed_prefixes.into_iter().collect(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl MountPolicy for PrefixAllowlistPolicy {
    async fn validate(
        &self,
        requested: &[Mount],
        _owner: &str,
        privileged: bool,
    ) -> WarrenResult<Vec<Mount>> {
        if privileged {
            return Ok(requested.to_vec());
        }

        for mount in requested {
            let allowed = self
                .allowed_prefixes
                .iter()
                .any(|prefix| mount.get_host().starts_with(prefix));

            if !allowed {
                return Err(WarrenError::MountRejected(mount.to_string()));
            }
        }

        Ok(requested.to_vec())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

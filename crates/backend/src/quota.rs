//! Identity/quota boundary: which token bucket applies to an owner.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use conductor_core::rate_limit::Quota;
use conductor_core::types::OwnerId;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("Quota lookup failed for {owner_id}: {message}")]
    Lookup { owner_id: OwnerId, message: String },
}

/// Resolves the rate-limit quota for an owner.
#[async_trait]
pub trait QuotaProvider: Send + Sync {
    async fn quota_for(&self, owner_id: &str) -> Result<Quota, QuotaError>;
}

/// Billing tier of an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(format!("unknown tier \"{other}\"")),
        }
    }
}

/// Quota per tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierTable {
    pub free: Quota,
    pub pro: Quota,
    pub enterprise: Quota,
}

impl TierTable {
    /// The same quota for every tier.
    pub fn uniform(quota: Quota) -> Self {
        Self {
            free: quota,
            pro: quota,
            enterprise: quota,
        }
    }

    pub fn quota(&self, tier: Tier) -> Quota {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Enterprise => self.enterprise,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: Quota::per_hour(10),
            pro: Quota::per_hour(100),
            enterprise: Quota::per_hour(1000),
        }
    }
}

/// Maps owners to tiers in memory; unknown owners are on the free tier.
#[derive(Debug, Default)]
pub struct TierQuotaProvider {
    table: TierTable,
    assignments: RwLock<HashMap<OwnerId, Tier>>,
}

impl TierQuotaProvider {
    pub fn new(table: TierTable) -> Self {
        Self {
            table,
            assignments: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_tier(&self, owner_id: impl Into<OwnerId>, tier: Tier) {
        self.assignments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(owner_id.into(), tier);
    }

    pub fn tier_of(&self, owner_id: &str) -> Tier {
        self.assignments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner_id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl QuotaProvider for TierQuotaProvider {
    async fn quota_for(&self, owner_id: &str) -> Result<Quota, QuotaError> {
        Ok(self.table.quota(self.tier_of(owner_id)))
    }
}

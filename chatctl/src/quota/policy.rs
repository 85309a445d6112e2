//! Quota policy resolution: which monthly caps apply to a user.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::QuotaConfig;
use crate::db::errors::Result;
use crate::db::models::user_groups::UserGroupDBResponse;
use crate::types::{GroupId, is_builtin_group};

/// The account dimension a cap applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapScope {
    /// Total usage of every member of the group
    Group,
    /// Usage of the individual user within the group
    User,
}

impl fmt::Display for CapScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapScope::Group => write!(f, "group"),
            CapScope::User => write!(f, "user"),
        }
    }
}

/// How a cap of exactly zero is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroCapPolicy {
    /// Zero means "not configured": the cap is skipped.
    #[default]
    Disabled,
    /// Zero is a real cap: any usage, including none, exceeds it.
    Enforced,
}

/// A single enforceable monthly cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cap {
    pub scope: CapScope,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaPolicy {
    /// Nothing to check
    Unlimited,
    /// Caps of the quota-determining group, group-wide first
    Limited { group_id: GroupId, caps: Vec<Cap> },
}

/// Read access to user groups, as needed by the resolver.
#[async_trait::async_trait]
pub trait GroupLookup: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<UserGroupDBResponse>>;
}

#[async_trait::async_trait]
impl GroupLookup for HashMap<GroupId, UserGroupDBResponse> {
    async fn find_by_id(&self, id: &str) -> Result<Option<UserGroupDBResponse>> {
        Ok(self.get(id).cloned())
    }
}

/// Maps a user's group memberships to a [`QuotaPolicy`].
///
/// Only the first group in the membership list decides the quota; further memberships are ignored.
#[derive(Clone)]
pub struct PolicyResolver {
    groups: Arc<dyn GroupLookup>,
    scopes: Vec<CapScope>,
    zero_cap: ZeroCapPolicy,
}

impl PolicyResolver {
    pub fn new(config: &QuotaConfig, groups: Arc<dyn GroupLookup>) -> Self {
        let mut scopes = config.scopes.clone();
        // group-wide caps are checked before per-user caps
        scopes.sort();
        scopes.dedup();

        Self {
            groups,
            scopes,
            zero_cap: config.zero_cap,
        }
    }

    #[instrument(skip(self, user_group_ids), fields(groups = user_group_ids.len()), err)]
    pub async fn resolve(&self, user_group_ids: &[GroupId]) -> Result<QuotaPolicy> {
        if user_group_ids.iter().any(|id| is_builtin_group(id)) {
            return Ok(QuotaPolicy::Unlimited);
        }

        let Some(group_id) = user_group_ids.first() else {
            return Ok(QuotaPolicy::Unlimited);
        };

        let Some(group) = self.groups.find_by_id(group_id).await? else {
            debug!("User group '{}' not found, quota not enforced", group_id);
            return Ok(QuotaPolicy::Unlimited);
        };

        if group.is_admin {
            return Ok(QuotaPolicy::Unlimited);
        }

        let caps = self.caps_for(&group);
        if caps.is_empty() {
            return Ok(QuotaPolicy::Unlimited);
        }

        Ok(QuotaPolicy::Limited {
            group_id: group.id,
            caps,
        })
    }

    /// Enforceable caps of a group for the configured scopes.
    pub fn caps_for(&self, group: &UserGroupDBResponse) -> Vec<Cap> {
        self.scopes
            .iter()
            .filter_map(|&scope| {
                let limit = match scope {
                    CapScope::Group => group.monthly_tokens,
                    CapScope::User => group.monthly_user_tokens,
                }
                .unwrap_or(0);

                self.is_enforceable(limit).then_some(Cap { scope, limit })
            })
            .collect()
    }

    fn is_enforceable(&self, limit: i64) -> bool {
        match limit {
            l if l < 0 => false,
            0 => self.zero_cap == ZeroCapPolicy::Enforced,
            _ => true,
        }
    }
}

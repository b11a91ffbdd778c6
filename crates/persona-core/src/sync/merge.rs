//! Two-way reconciliation of profile sets by id
//!
//! - id only local → kept
//! - id only remote → added, in remote order after the local entries
//! - id in both → the strictly higher `usageCount` replaces the whole profile;
//!   equal counts keep the local copy
//!
//! The active pointer prefers the remote one when it resolves in the merged set, then
//! the local one, then none.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::profile::{Profile, ProfilesConfig};

/// Counts reported by a merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    /// Remote-only profiles added
    pub added: usize,
    /// Shared profiles replaced by the remote copy
    pub updated: usize,
    /// Local profiles retained (local-only, or shared where local won)
    pub kept_local: usize,
}

/// Result of [`merge_configs`]
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub config: ProfilesConfig,
    pub report: MergeReport,
}

/// Remote wins only with a strictly greater usage count
fn remote_wins(local: &Profile, remote: &Profile) -> bool {
    remote.usage_count() > local.usage_count()
}

/// Merge `remote` into `local`
pub fn merge_configs(local: &ProfilesConfig, remote: &ProfilesConfig) -> MergeOutcome {
    let remote_by_id: HashMap<&str, &Profile> =
        remote.list.iter().map(|p| (p.id.as_str(), p)).collect();
    let mut report = MergeReport::default();
    let mut list = Vec::with_capacity(local.list.len() + remote.list.len());

    for local_profile in &local.list {
        match remote_by_id.get(local_profile.id.as_str()) {
            Some(remote_profile) if remote_wins(local_profile, remote_profile) => {
                list.push((*remote_profile).clone());
                report.updated += 1;
            }
            _ => {
                list.push(local_profile.clone());
                report.kept_local += 1;
            }
        }
    }

    let local_ids: HashSet<&str> = local.list.iter().map(|p| p.id.as_str()).collect();
    for remote_profile in &remote.list {
        if !local_ids.contains(remote_profile.id.as_str()) {
            list.push(remote_profile.clone());
            report.added += 1;
        }
    }

    let resolves = |id: &Option<String>| -> Option<String> {
        id.as_ref()
            .filter(|id| list.iter().any(|p| &p.id == *id))
            .cloned()
    };
    let active_profile_id = resolves(&remote.active_profile_id)
        .or_else(|| resolves(&local.active_profile_id));

    MergeOutcome {
        config: ProfilesConfig::new(list, active_profile_id),
        report,
    }
}

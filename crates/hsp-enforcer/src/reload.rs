//! Keeps the running policy set in line with the policy directory.
//!
//! Every file in the directory is applied through the lifecycle manager
//! (creating or replacing), and any active policy whose file is gone is
//! deleted. Used once at startup and again on every SIGHUP.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use hsp_engine::lifecycle::{ApplyOutcome, LifecycleError, LifecycleHandle};
use hsp_engine::loader::load_policy_dir;

/// What one pass over the policy directory changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub created: Vec<String>,
    pub replaced: Vec<String>,
    pub removed: Vec<String>,
    /// Policies that failed to compile or insert. A replaced policy keeps
    /// its previous version.
    pub rejected: Vec<String>,
}

pub async fn sync_policy_dir(policies: &LifecycleHandle, dir: &Path) -> Result<SyncReport> {
    let docs = load_policy_dir(dir).context("failed to load policy directory")?;
    let wanted: BTreeSet<String> = docs.iter().map(|d| d.name.clone()).collect();
    let mut report = SyncReport::default();

    for doc in docs {
        let name = doc.name.clone();
        match policies.apply(doc).await {
            Ok(ApplyOutcome::Created) => report.created.push(name),
            Ok(ApplyOutcome::Replaced) => report.replaced.push(name),
            Err(e) if e.is_fatal() => {
                error!(policy = %name, error = %e, "rule index inconsistent");
                return Err(e).context("failed to apply policies");
            }
            // Already logged by the lifecycle manager.
            Err(e) => {
                warn!(policy = %name, error = %e, "policy not applied");
                report.rejected.push(name);
            }
        }
    }

    let stale: Vec<String> = policies
        .status()
        .await?
        .into_iter()
        .map(|s| s.name)
        .filter(|name| !wanted.contains(name))
        .collect();
    for name in stale {
        match policies.delete(name.clone()).await {
            Ok(()) => report.removed.push(name),
            Err(e) if e.is_fatal() => {
                error!(policy = %name, error = %e, "rule index inconsistent");
                return Err(e).context("failed to remove policies");
            }
            Err(e) => warn!(policy = %name, error = %e, "policy not removed"),
        }
    }

    info!(
        dir = %dir.display(),
        created = report.created.len(),
        replaced = report.replaced.len(),
        removed = report.removed.len(),
        rejected = report.rejected.len(),
        "policy directory synced"
    );
    Ok(report)
}

/// Whether a sync failure means the rule index can no longer be trusted.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<LifecycleError>()
        .is_some_and(LifecycleError::is_fatal)
}

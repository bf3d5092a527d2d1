// src/state.rs

//! Durable install state
//!
//! Two records in the settings store drive the crash-detection state
//! machine: the pending-update record, written at install time and flipped
//! to the loading state on the first launch of the new package, and the
//! failed-updates list, which remembers every package hash that was ever
//! rolled back so it is never offered for install again.

use crate::error::Result;
use crate::package::{InstallPhase, Package, PendingUpdate};
use crate::settings::Settings;
use tracing::warn;

/// Settings key holding the pending-update record
pub const PENDING_UPDATE_KEY: &str = "pending_update";
/// Settings key holding the list of rolled-back packages
pub const FAILED_UPDATES_KEY: &str = "failed_updates";

pub fn save_pending(settings: &Settings, pending: &PendingUpdate) -> Result<()> {
    settings.set_json(PENDING_UPDATE_KEY, pending)
}

pub fn pending(settings: &Settings) -> Result<Option<PendingUpdate>> {
    settings.get_json(PENDING_UPDATE_KEY)
}

pub fn remove_pending(settings: &Settings) -> Result<()> {
    settings.remove(PENDING_UPDATE_KEY)
}

/// Whether an installed update is still waiting to be run. With a hash the
/// pending record must also be for that hash. A record in the loading state
/// does not count: that package is already running its first launch.
pub fn is_pending(settings: &Settings, package_hash: Option<&str>) -> Result<bool> {
    Ok(match pending(settings)? {
        Some(update) if !update.is_loading => match package_hash {
            Some(hash) => update.hash == hash,
            None => true,
        },
        _ => false,
    })
}

/// Observable phase of the install state machine, read from the pending
/// record alone.
pub fn phase(settings: &Settings) -> Result<InstallPhase> {
    Ok(match pending(settings)? {
        None => InstallPhase::NoPendingUpdate,
        Some(update) if update.is_loading => InstallPhase::PendingLoading,
        Some(_) => InstallPhase::PendingReady,
    })
}

/// Every package that was rolled back on this device, oldest first. An
/// unparseable record is dropped along with its settings key, leaving the
/// device with an empty history rather than a wedged one.
pub fn failed_updates(settings: &Settings) -> Result<Vec<Package>> {
    let Some(raw) = settings.get(FAILED_UPDATES_KEY)? else {
        return Ok(Vec::new());
    };
    match serde_json::from_str(&raw) {
        Ok(list) => Ok(list),
        Err(e) => {
            warn!("Unable to parse failed updates record, clearing it: {}", e);
            settings.remove(FAILED_UPDATES_KEY)?;
            Ok(Vec::new())
        }
    }
}

/// Record a rolled-back package. Hashes already in the list are not added
/// again.
pub fn save_failed_update(settings: &Settings, package: &Package) -> Result<()> {
    let mut failed = failed_updates(settings)?;
    if failed
        .iter()
        .any(|p| p.package_hash == package.package_hash)
    {
        return Ok(());
    }
    failed.push(package.clone());
    settings.set_json(FAILED_UPDATES_KEY, &failed)
}

pub fn is_failed_hash(settings: &Settings, package_hash: &str) -> Result<bool> {
    Ok(failed_updates(settings)?
        .iter()
        .any(|p| p.package_hash == package_hash))
}

/// The most recently recorded rollback, if any.
pub fn latest_failed_update(settings: &Settings) -> Result<Option<Package>> {
    Ok(failed_updates(settings)?.pop())
}

pub fn remove_failed_updates(settings: &Settings) -> Result<()> {
    settings.remove(FAILED_UPDATES_KEY)
}

// src/manager.rs

//! Update lifecycle orchestration
//!
//! `UpdateManager` ties the pipeline together: download an update payload,
//! extract and merge it into a fresh package directory, verify it, flip the
//! store pointer, and track the pending/rollback state machine across
//! process restarts. One manager is constructed per application session and
//! handed into every operation; install-affecting operations are serialized
//! through a process-wide guard keyed by the storage root, so overlapping
//! pipelines cannot interleave pointer writes.

use crate::archive;
use crate::download::{DownloadClient, DownloadProgress};
use crate::error::{Error, Result, RollbackError};
use crate::merge::{self, MergeOutcome};
use crate::package::{InstallPhase, Package, PendingUpdate, UpdateState};
use crate::settings::Settings;
use crate::state;
use crate::store::PackageStore;
use crate::telemetry::{self, StatusReport};
use crate::verify;
use once_cell::sync::Lazy;
use sequoia_openpgp::Cert;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Subdirectory of the root that holds the package store
pub const PACKAGES_FOLDER_NAME: &str = "packages";
/// Default settings database file inside the root
pub const SETTINGS_FILE_NAME: &str = "settings.db";

/// One guard per storage root, shared by every manager in the process.
static INSTALL_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_for_root(root: &Path) -> Arc<Mutex<()>> {
    let canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let mut locks = INSTALL_LOCKS.lock().unwrap_or_else(|e| e.into_inner());
    Arc::clone(
        locks
            .entry(canonical)
            .or_insert_with(|| Arc::new(Mutex::new(()))),
    )
}

/// Configuration for an update manager session.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Application-writable directory holding packages and settings
    pub root: PathBuf,
    /// Override for the settings database location
    pub settings_path: Option<PathBuf>,
    /// Version of the application binary
    pub app_version: String,
    /// File name of the loadable entry resource expected inside a package
    pub entry_point_name: String,
    /// Armored public key for release signature verification
    pub public_key: Option<String>,
    /// Whether the host application is a debug build
    pub is_debug: bool,
}

impl UpdateConfig {
    pub fn new(
        root: impl Into<PathBuf>,
        app_version: impl Into<String>,
        entry_point_name: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            settings_path: None,
            app_version: app_version.into(),
            entry_point_name: entry_point_name.into(),
            public_key: None,
            is_debug: false,
        }
    }
}

/// Session handle over the package store, settings records, and telemetry.
pub struct UpdateManager {
    config: UpdateConfig,
    store: PackageStore,
    settings: Settings,
    cert: Option<Cert>,
    guard: Arc<Mutex<()>>,
    did_update: bool,
    need_to_report_rollback: bool,
    is_running_binary: bool,
}

impl UpdateManager {
    pub fn new(config: UpdateConfig) -> Result<UpdateManager> {
        fs::create_dir_all(&config.root)?;
        let settings_path = config
            .settings_path
            .clone()
            .unwrap_or_else(|| config.root.join(SETTINGS_FILE_NAME));
        let settings = Settings::open(&settings_path)?;
        let cert = match &config.public_key {
            Some(armored) => Some(verify::parse_public_key(armored)?),
            None => None,
        };
        let guard = lock_for_root(&config.root);
        let store = PackageStore::new(config.root.join(PACKAGES_FOLDER_NAME));

        Ok(UpdateManager {
            config,
            store,
            settings,
            cert,
            guard,
            did_update: false,
            need_to_report_rollback: false,
            is_running_binary: false,
        })
    }

    /// Tell the manager whether the host loaded its bundled binary assets
    /// instead of an installed package this run.
    pub fn set_running_binary(&mut self, is_running_binary: bool) {
        self.is_running_binary = is_running_binary;
    }

    /// Whether this session is the first to run a freshly installed update.
    pub fn did_update(&self) -> bool {
        self.did_update
    }

    /// Whether the host reported it is running its bundled binary assets.
    pub fn is_running_binary(&self) -> bool {
        self.is_running_binary
    }

    /// Run the crash-detection step of the install state machine. Called
    /// once per process start, before the host decides what to load.
    ///
    /// A pending record still in the loading state means the previous run
    /// installed an update, started it, and never acknowledged readiness:
    /// the update is treated as broken and rolled back. A pending record in
    /// the ready state is the normal first launch of a fresh install; it is
    /// flipped to loading so that a crash before acknowledgment is caught
    /// by the next start.
    pub fn initialize_after_restart(&mut self) -> Result<InstallPhase> {
        let guard = Arc::clone(&self.guard);
        let _lock = guard.lock().unwrap_or_else(|e| e.into_inner());

        self.did_update = false;
        self.need_to_report_rollback = false;

        match state::pending(&self.settings)? {
            Some(pending) if pending.is_loading => {
                warn!(
                    "Update did not finish loading the last time, rolling back to a previous version."
                );
                self.need_to_report_rollback = true;
                self.rollback_crashed_update(&pending.hash)?;
                Ok(InstallPhase::RolledBack)
            }
            Some(pending) => {
                self.did_update = true;
                state::save_pending(
                    &self.settings,
                    &PendingUpdate {
                        hash: pending.hash,
                        is_loading: true,
                    },
                )?;
                Ok(InstallPhase::PendingLoading)
            }
            None => Ok(InstallPhase::NoPendingUpdate),
        }
    }

    /// Roll back a crashed pending update. The failed package is recorded
    /// first so the hash is remembered even if the rollback itself is
    /// interrupted; with no previous package to return to, the store is
    /// cleared and the host falls back to its binary assets.
    fn rollback_crashed_update(&self, pending_hash: &str) -> Result<()> {
        let failed = match self.store.current_package()? {
            Some(package) => package,
            None => Package::new(self.config.app_version.clone(), "", "", pending_hash, ""),
        };
        state::save_failed_update(&self.settings, &failed)?;

        match self.store.rollback() {
            Ok(()) => {}
            Err(Error::Rollback(RollbackError::NoPreviousPackage)) => {
                warn!("No previous package to roll back to, clearing all packages.");
                self.store.clear_all()?;
            }
            Err(e) => return Err(e),
        }
        state::remove_pending(&self.settings)
    }

    /// Download, reconstruct, and verify an update, then install it as the
    /// pending package. Returns the enriched local package metadata.
    pub fn download_and_install<F>(
        &self,
        package: &Package,
        download_url: &str,
        on_progress: F,
    ) -> Result<Package>
    where
        F: FnMut(DownloadProgress),
    {
        let guard = Arc::clone(&self.guard);
        let _lock = guard.lock().unwrap_or_else(|e| e.into_inner());
        let local = self.download_update_locked(package, download_url, on_progress)?;
        self.install_update_locked(&local)?;
        Ok(local)
    }

    /// Download and stage an update without installing it.
    pub fn download_update<F>(
        &self,
        package: &Package,
        download_url: &str,
        on_progress: F,
    ) -> Result<Package>
    where
        F: FnMut(DownloadProgress),
    {
        let guard = Arc::clone(&self.guard);
        let _lock = guard.lock().unwrap_or_else(|e| e.into_inner());
        self.download_update_locked(package, download_url, on_progress)
    }

    fn download_update_locked<F>(
        &self,
        package: &Package,
        download_url: &str,
        on_progress: F,
    ) -> Result<Package>
    where
        F: FnMut(DownloadProgress),
    {
        let result = self.run_download_pipeline(package, download_url, on_progress);
        if result.is_err() {
            self.cleanup_failed_download(&package.package_hash);
        }
        result
    }

    fn run_download_pipeline<F>(
        &self,
        package: &Package,
        download_url: &str,
        on_progress: F,
    ) -> Result<Package>
    where
        F: FnMut(DownloadProgress),
    {
        let target_dir = self.store.package_dir(&package.package_hash);
        if target_dir.exists() {
            // Leftover from an interrupted attempt at this same hash
            fs::remove_dir_all(&target_dir)?;
        }

        let spool = self.store.download_spool_path();
        let client = DownloadClient::new()?;
        let downloaded = client.download_update(download_url, &spool, on_progress)?;

        let app_entry_point = if downloaded.is_zip {
            let staging = self.store.staging_dir();
            if staging.exists() {
                fs::remove_dir_all(&staging)?;
            }
            archive::unzip(&spool, &staging)?;
            fs::remove_file(&spool)?;

            let base_dir = self
                .store
                .current_package_hash()?
                .map(|hash| self.store.package_dir(&hash));
            let outcome = merge::merge_update(
                &staging,
                base_dir.as_deref(),
                &target_dir,
                &self.config.entry_point_name,
            )?;
            fs::remove_dir_all(&staging)?;

            verify::verify_update(
                &target_dir,
                &package.package_hash,
                self.cert.as_ref(),
                outcome.is_diff,
            )?;
            outcome.app_entry_point
        } else {
            // Legacy raw bundle: the downloaded file is the entry resource
            info!("The update package is not a zip, treating it as a raw bundle.");
            fs::create_dir_all(&target_dir)?;
            fs::rename(&spool, target_dir.join(&self.config.entry_point_name))?;
            self.config.entry_point_name.clone()
        };

        let mut local = package.clone();
        local.app_entry_point = app_entry_point;
        local.downloaded_at = Some(chrono::Utc::now().to_rfc3339());
        self.store.write_metadata(&package.package_hash, &local)?;
        Ok(local)
    }

    fn cleanup_failed_download(&self, package_hash: &str) {
        let _ = fs::remove_file(self.store.download_spool_path());
        let staging = self.store.staging_dir();
        if staging.exists() {
            let _ = fs::remove_dir_all(&staging);
        }
        let target_dir = self.store.package_dir(package_hash);
        if target_dir.exists() {
            let _ = fs::remove_dir_all(&target_dir);
        }
    }

    /// Make a downloaded package current and mark it pending acknowledgment.
    pub fn install_update(&self, package: &Package) -> Result<()> {
        let guard = Arc::clone(&self.guard);
        let _lock = guard.lock().unwrap_or_else(|e| e.into_inner());
        self.install_update_locked(package)
    }

    fn install_update_locked(&self, package: &Package) -> Result<()> {
        // Replacing an update the app never ran must not consume the
        // rollback slot that still holds the last known-good package
        let discard_pending = state::is_pending(&self.settings, None)?;
        self.store.install(&package.package_hash, discard_pending)?;
        state::save_pending(
            &self.settings,
            &PendingUpdate {
                hash: package.package_hash.clone(),
                is_loading: false,
            },
        )?;
        info!("Installed update {}", package.label);
        Ok(())
    }

    /// Roll back to the previous package on request. The abandoned package
    /// is recorded as failed so it is not offered again.
    pub fn rollback(&self) -> Result<()> {
        let guard = Arc::clone(&self.guard);
        let _lock = guard.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(current) = self.store.current_package()? {
            state::save_failed_update(&self.settings, &current)?;
        }
        self.store.rollback()?;
        state::remove_pending(&self.settings)
    }

    /// Acknowledge that the application started successfully on the pending
    /// package, then build and hand off at most one status report.
    /// `deliver` returns whether the report reached the backend; a report
    /// that did not is buffered for retry on a later opportunity. Delivery
    /// runs outside the root guard, so the callback may call back into a
    /// manager for the same root.
    pub fn acknowledge_ready<F>(&mut self, deliver: F) -> Result<Option<StatusReport>>
    where
        F: FnOnce(&StatusReport) -> bool,
    {
        let guard = Arc::clone(&self.guard);
        let report = {
            let _lock = guard.lock().unwrap_or_else(|e| e.into_inner());
            state::remove_pending(&self.settings)?;
            self.new_status_report_locked()?
        };
        let Some(report) = report else {
            return Ok(None);
        };

        let delivered = deliver(&report);

        let _lock = guard.lock().unwrap_or_else(|e| e.into_inner());
        if delivered {
            telemetry::record_sent(&self.settings, &report)?;
        } else {
            telemetry::save_for_retry(&self.settings, &report)?;
        }
        Ok(Some(report))
    }

    /// Build the single report this session owes the backend, if any:
    /// a rollback report, a fresh install report, a binary-version report,
    /// or a buffered retry report, in that order of precedence.
    pub fn new_status_report(&mut self) -> Result<Option<StatusReport>> {
        let guard = Arc::clone(&self.guard);
        let _lock = guard.lock().unwrap_or_else(|e| e.into_inner());
        self.new_status_report_locked()
    }

    fn new_status_report_locked(&mut self) -> Result<Option<StatusReport>> {
        if self.need_to_report_rollback {
            self.need_to_report_rollback = false;
            if let Some(last_failed) = state::latest_failed_update(&self.settings)? {
                return Ok(Some(telemetry::rollback_report(&last_failed)));
            }
        } else if self.did_update {
            if let Some(current) = self.store.current_package()? {
                return telemetry::update_report(&self.settings, &current);
            }
        } else if self.is_running_binary {
            return telemetry::binary_update_report(&self.settings, &self.config.app_version);
        } else {
            return telemetry::retry_report(&self.settings);
        }
        Ok(None)
    }

    /// Resolve installed-package metadata with its derived flags.
    ///
    /// `Pending` answers only when an update awaits its first run;
    /// `Running` answers with the package the application is actually
    /// executing, which is the previous one while an install is pending;
    /// `Latest` answers with the most recently installed package either way.
    pub fn get_update_metadata(&self, update_state: UpdateState) -> Result<Option<Package>> {
        let Some(current) = self.store.current_package()? else {
            return Ok(None);
        };
        let current_is_pending =
            state::is_pending(&self.settings, Some(&current.package_hash))?;

        match update_state {
            UpdateState::Pending if !current_is_pending => Ok(None),
            UpdateState::Running if current_is_pending => {
                match self.store.previous_package()? {
                    Some(previous) => Ok(Some(self.with_derived_flags(previous)?)),
                    None => Ok(None),
                }
            }
            _ => Ok(Some(self.with_derived_flags(current)?)),
        }
    }

    /// The most recently installed package with derived flags, or `None`.
    pub fn get_current_package(&self) -> Result<Option<Package>> {
        self.get_update_metadata(UpdateState::Latest)
    }

    fn with_derived_flags(&self, mut package: Package) -> Result<Package> {
        package.is_pending = state::is_pending(&self.settings, Some(&package.package_hash))?;
        package.failed_install = state::is_failed_hash(&self.settings, &package.package_hash)?;
        package.is_first_run = self.is_first_run(&package.package_hash)?;
        package.is_debug_only = self.is_running_binary && self.config.is_debug;
        Ok(package)
    }

    /// Whether this session is the first run of the given package.
    pub fn is_first_run(&self, package_hash: &str) -> Result<bool> {
        Ok(self.did_update
            && !package_hash.is_empty()
            && self.store.current_package_hash()?.as_deref() == Some(package_hash))
    }

    /// Whether the given package hash was ever rolled back on this device.
    pub fn is_failed_update(&self, package_hash: &str) -> Result<bool> {
        state::is_failed_hash(&self.settings, package_hash)
    }

    /// Absolute path of the current package's entry point, or `None` when
    /// the host should load its binary assets.
    pub fn current_entry_path(&self) -> Result<Option<PathBuf>> {
        self.store.current_entry_path()
    }

    /// Observable phase of the install state machine.
    pub fn install_phase(&self) -> Result<InstallPhase> {
        state::phase(&self.settings)
    }

    /// Reconstruct a full package from an update payload. Exposed for
    /// orchestration layers that stage payloads themselves.
    pub fn merge_diff(
        &self,
        payload_dir: &Path,
        base_dir: Option<&Path>,
        target_dir: &Path,
    ) -> Result<MergeOutcome> {
        merge::merge_update(
            payload_dir,
            base_dir,
            target_dir,
            &self.config.entry_point_name,
        )
    }

    /// Verify a reconstructed package against this session's key policy.
    pub fn verify_signature(
        &self,
        package_dir: &Path,
        expected_hash: &str,
        is_diff: bool,
    ) -> Result<()> {
        verify::verify_update(package_dir, expected_hash, self.cert.as_ref(), is_diff)
    }

    /// Delete every installed package and all install-state records, as on
    /// a fresh binary install.
    pub fn reset(&self) -> Result<()> {
        let guard = Arc::clone(&self.guard);
        let _lock = guard.lock().unwrap_or_else(|e| e.into_inner());

        self.store.clear_all()?;
        state::remove_pending(&self.settings)?;
        state::remove_failed_updates(&self.settings)
    }
}

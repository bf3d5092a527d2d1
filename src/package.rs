// src/package.rs

//! Data model for update packages and durable records
//!
//! This module defines the structs that are serialized into the package
//! store's on-disk records (the pointer file, per-package metadata) and the
//! settings store (pending update, failed updates), plus the state enums
//! used by the install state machine.

use serde::{Deserialize, Serialize};

/// Metadata describing one update package.
///
/// The persisted attributes are immutable once the package is written. The
/// runtime flags (`is_pending`, `is_first_run`, `failed_install`,
/// `is_debug_only`) are derived from store state at read time and are never
/// written into the package's own metadata file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    /// Version of the application binary this update targets
    pub app_version: String,
    /// Update channel this package was released to
    pub deployment_key: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_mandatory: bool,
    /// Release label, e.g. "v12"
    pub label: String,
    /// Content hash; doubles as the storage folder name
    pub package_hash: String,
    /// Relative path to the loadable entry resource within the package
    pub app_entry_point: String,
    /// When the package landed on this device (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<String>,

    /// True while the package is installed but not yet acknowledged
    #[serde(skip)]
    pub is_pending: bool,
    /// True on the first run after this package was installed
    #[serde(skip)]
    pub is_first_run: bool,
    /// True if this package previously triggered an automatic rollback
    #[serde(skip)]
    pub failed_install: bool,
    /// True when a sideloaded update lingers while the binary itself runs
    #[serde(skip)]
    pub is_debug_only: bool,
}

impl Package {
    /// Create package metadata with the required attributes
    pub fn new(
        app_version: impl Into<String>,
        deployment_key: impl Into<String>,
        label: impl Into<String>,
        package_hash: impl Into<String>,
        app_entry_point: impl Into<String>,
    ) -> Self {
        Self {
            app_version: app_version.into(),
            deployment_key: deployment_key.into(),
            description: String::new(),
            is_mandatory: false,
            label: label.into(),
            package_hash: package_hash.into(),
            app_entry_point: app_entry_point.into(),
            downloaded_at: None,
            is_pending: false,
            is_first_run: false,
            failed_install: false,
            is_debug_only: false,
        }
    }

    /// Identifier used for status-report deduplication:
    /// `deploymentKey:label`, or `None` if either part is missing.
    pub fn status_report_identifier(&self) -> Option<String> {
        if self.deployment_key.is_empty() || self.label.is_empty() {
            None
        } else {
            Some(format!("{}:{}", self.deployment_key, self.label))
        }
    }
}

/// The store's root pointer record: which package is current, and which
/// previous package (if any) is preserved for rollback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_package_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_package_hash: Option<String>,
}

/// Durable record of an installed-but-not-yet-acknowledged update.
///
/// `is_loading` flips to true when the application first starts on the
/// pending package; finding it still true at a later startup means that run
/// never acknowledged readiness, which is the crash signal that triggers
/// rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpdate {
    pub hash: String,
    pub is_loading: bool,
}

/// Sparse manifest shipped inside a diff update: paths to delete from the
/// base package during reconstruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffManifest {
    #[serde(default)]
    pub deleted_files: Vec<String>,
}

/// Which installed update a metadata query should resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// The package the application is currently running
    Running,
    /// The installed-but-not-yet-running package, if one is pending
    Pending,
    /// The most recently installed package, pending or not
    Latest,
}

/// Observable state of the install state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallPhase {
    /// No update awaiting acknowledgment
    NoPendingUpdate,
    /// A pending update has started loading but has not acknowledged yet
    PendingLoading,
    /// A pending update is installed and will load on the next restart
    PendingReady,
    /// A crashed pending update was just rolled back; its failure report has
    /// not been built yet
    RolledBack,
}

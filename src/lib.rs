// src/lib.rs

//! Airlift Update Manager
//!
//! Client-side lifecycle manager for over-the-air content updates, with
//! content-addressed package storage, diff reconstruction, signature
//! verification, and crash-safe rollback.
//!
//! # Architecture
//!
//! - Content-addressed store: one directory per package, named by hash
//! - Atomic pointer: the current/previous package record is replaced via
//!   temp-file-and-rename, never written in place
//! - Crash detection: a pending update must acknowledge readiness on its
//!   first run, or the next start rolls it back automatically
//! - Verified installs: folder hash and optional OpenPGP release signature
//!   gate every package before the pointer flips
//! - Settings in SQLite: durable install-state and telemetry records

pub mod archive;
pub mod download;
mod error;
pub mod manager;
pub mod merge;
pub mod package;
pub mod settings;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod verify;

pub use error::{
    DownloadError, Error, MergeError, Result, RollbackError, SignatureVerificationError,
};
pub use manager::{UpdateConfig, UpdateManager};
pub use package::{InstallPhase, Package, PackageInfo, PendingUpdate, UpdateState};
pub use telemetry::{DeploymentStatus, StatusReport};

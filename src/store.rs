// src/store.rs

//! Content-addressed package store
//!
//! Installed packages live under one root, each in a directory named by its
//! content hash. A single pointer file (`status.json`) records which hash is
//! current and which was current before it. The pointer is the commit point
//! for every install and rollback: directory work happens first, then the
//! pointer is replaced atomically via a temp file and rename, so a crash at
//! any moment leaves either the old pointer or the new one, never a torn
//! file.

use crate::error::{Error, Result, RollbackError};
use crate::package::{Package, PackageInfo};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Pointer file at the store root
pub const STATUS_FILE_NAME: &str = "status.json";
/// Per-package metadata file
pub const METADATA_FILE_NAME: &str = "metadata.json";
/// Spool file a download is written to before extraction
pub const DOWNLOAD_FILE_NAME: &str = "update.zip";
/// Staging directory an archive is extracted into before merge
pub const UNZIPPED_FOLDER_NAME: &str = "unzipped";

/// Store of installed packages rooted at a single directory.
pub struct PackageStore {
    root: PathBuf,
}

impl PackageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        PackageStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a package with the given content hash lives in.
    pub fn package_dir(&self, package_hash: &str) -> PathBuf {
        self.root.join(package_hash)
    }

    /// Spool path downloads are written to.
    pub fn download_spool_path(&self) -> PathBuf {
        self.root.join(DOWNLOAD_FILE_NAME)
    }

    /// Staging directory archives are extracted into.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(UNZIPPED_FOLDER_NAME)
    }

    /// Read the pointer file. A missing file is a fresh store; a file that
    /// exists but does not parse is an error, since every install and
    /// rollback decision hangs off this record.
    pub fn info(&self) -> Result<PackageInfo> {
        let path = self.root.join(STATUS_FILE_NAME);
        if !path.exists() {
            return Ok(PackageInfo::default());
        }
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|e| Error::malformed(&path, e))
    }

    /// Replace the pointer file atomically.
    pub fn write_info(&self, info: &PackageInfo) -> Result<()> {
        write_json_atomic(&self.root.join(STATUS_FILE_NAME), info)
    }

    pub fn current_package_hash(&self) -> Result<Option<String>> {
        Ok(self.info()?.current_package_hash)
    }

    pub fn previous_package_hash(&self) -> Result<Option<String>> {
        Ok(self.info()?.previous_package_hash)
    }

    /// Metadata of the package a hash addresses. Missing or unreadable
    /// metadata is an error: the hash came from the pointer file or a
    /// pending record, so its package is supposed to exist.
    pub fn read_metadata(&self, package_hash: &str) -> Result<Package> {
        let path = self.package_dir(package_hash).join(METADATA_FILE_NAME);
        let raw = fs::read_to_string(&path).map_err(|e| Error::GetPackage {
            hash: package_hash.to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| Error::GetPackage {
            hash: package_hash.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn write_metadata(&self, package_hash: &str, package: &Package) -> Result<()> {
        let dir = self.package_dir(package_hash);
        fs::create_dir_all(&dir)?;
        write_json_atomic(&dir.join(METADATA_FILE_NAME), package)
    }

    /// Metadata of the current package, or `None` when no package is
    /// installed or the metadata file is absent.
    pub fn current_package(&self) -> Result<Option<Package>> {
        match self.current_package_hash()? {
            Some(hash) => self.read_package_if_present(&hash),
            None => Ok(None),
        }
    }

    /// Metadata of the previously current package, if any.
    pub fn previous_package(&self) -> Result<Option<Package>> {
        match self.previous_package_hash()? {
            Some(hash) => self.read_package_if_present(&hash),
            None => Ok(None),
        }
    }

    fn read_package_if_present(&self, package_hash: &str) -> Result<Option<Package>> {
        let path = self.package_dir(package_hash).join(METADATA_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        self.read_metadata(package_hash).map(Some)
    }

    /// Absolute path of the current package's entry point file, or `None`
    /// when nothing is installed.
    pub fn current_entry_path(&self) -> Result<Option<PathBuf>> {
        let Some(hash) = self.current_package_hash()? else {
            return Ok(None);
        };
        let Some(package) = self.read_package_if_present(&hash)? else {
            return Ok(None);
        };
        Ok(Some(self.package_dir(&hash).join(package.app_entry_point)))
    }

    /// Make `package_hash` the current package.
    ///
    /// Installing the hash that is already current is a no-op. With
    /// `discard_pending` the incoming package replaces a not-yet-confirmed
    /// one: the current directory is deleted and the previous pointer is
    /// left alone, keeping the last known-good package reachable for
    /// rollback. Otherwise the old previous directory is dropped and the
    /// current package becomes the new previous.
    pub fn install(&self, package_hash: &str, discard_pending: bool) -> Result<()> {
        let mut info = self.info()?;
        if info.current_package_hash.as_deref() == Some(package_hash) {
            return Ok(());
        }

        if discard_pending {
            if let Some(current_hash) = &info.current_package_hash {
                let current_dir = self.package_dir(current_hash);
                if current_dir.exists() {
                    fs::remove_dir_all(&current_dir)?;
                }
            }
        } else {
            // Keep the directory when the incoming package IS the old
            // previous one (a rollback-then-reinstall swap)
            if let Some(previous_hash) = &info.previous_package_hash {
                if previous_hash != package_hash {
                    let previous_dir = self.package_dir(previous_hash);
                    if previous_dir.exists() {
                        fs::remove_dir_all(&previous_dir)?;
                    }
                }
            }
            info.previous_package_hash = info.current_package_hash.take();
        }

        info.current_package_hash = Some(package_hash.to_string());
        self.write_info(&info)?;
        debug!("Installed package {}", package_hash);
        Ok(())
    }

    /// Drop the current package and promote the previous one. Fails without
    /// touching the pointer when there is no previous package to return to.
    pub fn rollback(&self) -> Result<()> {
        let mut info = self.info()?;
        let Some(previous_hash) = info.previous_package_hash.take() else {
            return Err(RollbackError::NoPreviousPackage.into());
        };

        if let Some(current_hash) = &info.current_package_hash {
            let current_dir = self.package_dir(current_hash);
            if current_dir.exists() {
                fs::remove_dir_all(&current_dir)?;
            }
        }

        info.current_package_hash = Some(previous_hash);
        info.previous_package_hash = None;
        self.write_info(&info)?;
        Ok(())
    }

    /// Delete every installed package along with the pointer file.
    pub fn clear_all(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

/// Serialize `value` to a temp file in the target's directory, then rename
/// over the target. Readers see the old contents or the new, never a torn
/// write.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Install(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let json = serde_json::to_string(value).map_err(|e| Error::Install(e.to_string()))?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(std::io::Error::from)?;
    Ok(())
}

// src/merge.rs

//! Diff reconstruction for update packages
//!
//! A diff update ships only changed files plus a sparse manifest of paths to
//! delete. This module rebuilds the full package tree: base copy (ignored
//! paths skipped, so stale signature tokens never transfer), payload
//! overlay, deletions, entry-point resolution, and removal of any metadata
//! file inherited from the base package.

use crate::error::{Error, MergeError, Result};
use crate::package::DiffManifest;
use crate::store::METADATA_FILE_NAME;
use crate::verify::is_hash_ignored;
use std::fs;
use std::io;
use std::path::{Component, Path};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Manifest file shipped inside a diff payload
pub const DIFF_MANIFEST_FILE_NAME: &str = "hotcodepush.json";

/// Result of reconstructing an update payload into a package directory.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Whether the payload arrived as a diff against the base package
    pub is_diff: bool,
    /// Resolved relative path of the application entry point
    pub app_entry_point: String,
}

/// Reconstruct a full package in `target_dir` from an unzipped payload.
///
/// With no diff manifest in the payload, the payload is the full package and
/// is copied verbatim. With a manifest, the base package is required: its
/// tree is copied first (skipping ignored paths), the payload is overlaid on
/// top, and the manifest's deletion list is applied. The reconstructed tree
/// must contain a file named `expected_entry_point`; the shallowest match
/// wins, with ties broken by lexicographic path order.
pub fn merge_update(
    payload_dir: &Path,
    base_dir: Option<&Path>,
    target_dir: &Path,
    expected_entry_point: &str,
) -> Result<MergeOutcome> {
    let manifest_path = payload_dir.join(DIFF_MANIFEST_FILE_NAME);
    let is_diff = manifest_path.exists();

    fs::create_dir_all(target_dir)?;

    if is_diff {
        let raw = fs::read_to_string(&manifest_path)?;
        let manifest: DiffManifest =
            serde_json::from_str(&raw).map_err(|e| Error::malformed(&manifest_path, e))?;

        let base = match base_dir {
            Some(dir) if dir.exists() => dir,
            _ => return Err(MergeError::NoBaseForDiff.into()),
        };

        copy_tree(base, target_dir, |relative| !is_hash_ignored(relative))?;
        copy_tree(payload_dir, target_dir, |relative| {
            relative != DIFF_MANIFEST_FILE_NAME
        })?;
        apply_deletions(target_dir, &manifest)?;
    } else {
        copy_tree(payload_dir, target_dir, |_| true)?;
    }

    let app_entry_point = find_entry_point(target_dir, expected_entry_point)?
        .ok_or_else(|| MergeError::EntryPointNotFound(expected_entry_point.to_string()))?;

    // Metadata always describes the package it sits in; a copy inherited
    // from the base would describe the wrong one
    let inherited_metadata = target_dir.join(METADATA_FILE_NAME);
    if inherited_metadata.exists() {
        fs::remove_file(&inherited_metadata)?;
    }

    if is_diff {
        info!("Applying diff update.");
    } else {
        info!("Applying full update.");
    }

    Ok(MergeOutcome {
        is_diff,
        app_entry_point,
    })
}

/// Search `dir` for a file named `expected_file_name`; shallowest path wins,
/// ties broken lexicographically.
pub fn find_entry_point(dir: &Path, expected_file_name: &str) -> Result<Option<String>> {
    let mut candidates: Vec<(usize, String)> = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy() != expected_file_name {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .expect("walked path is under its root")
            .to_string_lossy()
            .replace('\\', "/");
        candidates.push((relative.matches('/').count(), relative));
    }

    candidates.sort();
    Ok(candidates.into_iter().next().map(|(_, path)| path))
}

/// Copy every file under `src` into `dst` for which `keep(relative)` holds,
/// creating directories as needed and overwriting existing files.
fn copy_tree<F>(src: &Path, dst: &Path, keep: F) -> Result<()>
where
    F: Fn(&str) -> bool,
{
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::from)?;
        let suffix = entry
            .path()
            .strip_prefix(src)
            .expect("walked path is under its root");
        if suffix.as_os_str().is_empty() {
            continue;
        }
        let relative = suffix.to_string_lossy().replace('\\', "/");
        if !keep(&relative) {
            continue;
        }

        let dest = dst.join(suffix);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Remove the manifest's deleted paths from the reconstructed tree. Paths
/// that would escape the target are skipped; a hostile manifest must not be
/// able to reach outside the package directory.
fn apply_deletions(target_dir: &Path, manifest: &DiffManifest) -> Result<()> {
    for deleted in &manifest.deleted_files {
        if is_unsafe_relative(deleted) {
            warn!("Skipping unsafe deletion path in diff manifest: {}", deleted);
            continue;
        }
        let path = target_dir.join(deleted);
        if path.is_file() {
            fs::remove_file(&path)?;
        } else if path.is_dir() {
            fs::remove_dir_all(&path)?;
        }
    }
    Ok(())
}

fn is_unsafe_relative(path: &str) -> bool {
    let path = Path::new(path);
    path.is_absolute()
        || path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
}

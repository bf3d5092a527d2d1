// src/archive.rs

//! Zip extraction for downloaded update payloads

use crate::error::Result;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use tracing::debug;
use zip::ZipArchive;

/// Extract a zip archive into `destination`.
///
/// Entry names are resolved through `enclosed_name`, so entries that would
/// escape the destination (absolute paths, `..` traversal) are skipped
/// rather than written. Unix permission bits are restored when the archive
/// carries them.
pub fn unzip(archive_path: &Path, destination: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;

    fs::create_dir_all(destination)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(enclosed) = entry.enclosed_name() else {
            debug!("Skipping zip entry with unsafe name: {}", entry.name());
            continue;
        };
        let out_path = destination.join(enclosed);

        if entry.name().ends_with('/') {
            fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out_file = File::create(&out_path)?;
            io::copy(&mut entry, &mut out_file)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn build_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, contents) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_unzip_restores_tree() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("update.zip");
        build_zip(
            &archive_path,
            &[
                ("main.bundle", "console.log('hi')"),
                ("assets/", ""),
                ("assets/logo.png", "png-bytes"),
            ],
        );

        let dest = dir.path().join("unzipped");
        unzip(&archive_path, &dest).unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("main.bundle")).unwrap(),
            "console.log('hi')"
        );
        assert_eq!(
            fs::read_to_string(dest.join("assets/logo.png")).unwrap(),
            "png-bytes"
        );
        assert!(dest.join("assets").is_dir());
    }

    #[test]
    fn test_unzip_skips_escaping_entries() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("evil.zip");
        build_zip(
            &archive_path,
            &[("../evil.txt", "escaped"), ("safe.txt", "fine")],
        );

        let dest = dir.path().join("extract/unzipped");
        unzip(&archive_path, &dest).unwrap();

        assert!(dest.join("safe.txt").exists());
        assert!(!dir.path().join("extract/evil.txt").exists());
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn test_unzip_of_non_zip_file_fails() {
        let dir = tempdir().unwrap();
        let bogus = dir.path().join("not-a.zip");
        fs::write(&bogus, "plain text").unwrap();

        let dest = dir.path().join("unzipped");
        assert!(unzip(&bogus, &dest).is_err());
    }
}

// src/verify.rs

//! Integrity verification for update packages
//!
//! This module provides:
//! - The ignored-path rules shared by hashing and diff reconstruction
//! - A deterministic content hash over a directory tree
//! - Signature-token verification against a configured public key
//! - The once-per-install verification policy
//!
//! The content hash is computed from the lexicographically sorted list of
//! `"relativePath:fileHash"` entries, serialized as a JSON array and hashed
//! again, so the result is independent of filesystem enumeration order and
//! platform path separators.

use crate::error::{Error, Result, SignatureVerificationError};
use rayon::prelude::*;
use sequoia_openpgp as openpgp;
use sequoia_openpgp::Cert;
use sequoia_openpgp::KeyHandle;
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::parse::stream::{
    MessageLayer, MessageStructure, VerificationHelper, VerifierBuilder,
};
use sequoia_openpgp::policy::StandardPolicy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Detached signature token shipped at the root of a signed update
pub const SIGNATURE_FILE_NAME: &str = ".codepushrelease";

const MACOSX_PREFIX: &str = "__MACOSX/";
const DS_STORE: &str = ".DS_Store";

/// The hash claim embedded in the signed token body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureClaim {
    content_hash: String,
}

/// Returns true for paths that are OS or release-tooling noise, excluded
/// from both hashing and diff reconstruction.
pub fn is_hash_ignored(relative_path: &str) -> bool {
    relative_path.starts_with(MACOSX_PREFIX)
        || relative_path == DS_STORE
        || relative_path.ends_with(&format!("/{}", DS_STORE))
        || relative_path == SIGNATURE_FILE_NAME
        || relative_path.ends_with(&format!("/{}", SIGNATURE_FILE_NAME))
}

/// Compute the SHA-256 of one file's contents as lowercase hex.
fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Enumerate the non-ignored files under `dir` and return the sorted
/// `"relativePath:fileHash"` manifest entries.
pub fn content_manifest(dir: &Path) -> Result<Vec<String>> {
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .expect("walked path is under its root")
            .to_string_lossy()
            .replace('\\', "/");
        if is_hash_ignored(&relative) {
            continue;
        }
        files.push((relative, entry.path().to_path_buf()));
    }

    // Sorted by relative path so the aggregate is enumeration-order invariant
    files.sort_by(|a, b| a.0.cmp(&b.0));

    files
        .par_iter()
        .map(|(relative, path)| Ok(format!("{}:{}", relative, hash_file(path)?)))
        .collect::<Result<Vec<String>>>()
}

/// Compute the aggregate content hash of a directory tree.
pub fn content_hash(dir: &Path) -> Result<String> {
    let entries = content_manifest(dir)?;
    let manifest_json =
        serde_json::to_string(&entries).map_err(|e| Error::malformed(dir, e))?;

    let mut hasher = Sha256::new();
    hasher.update(manifest_json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Recompute the directory's content hash and compare it to the expected
/// package hash.
pub fn verify_folder_hash(dir: &Path, expected_hash: &str) -> Result<()> {
    debug!("Verifying content hash of {}", dir.display());
    let actual = content_hash(dir)?;
    if actual != expected_hash {
        return Err(SignatureVerificationError::HashMismatch {
            expected: expected_hash.to_string(),
            actual,
        }
        .into());
    }
    Ok(())
}

/// Parse an armored public key into a certificate.
pub fn parse_public_key(armored: &str) -> Result<Cert> {
    Cert::from_bytes(armored.as_bytes()).map_err(|e| {
        Error::from(SignatureVerificationError::SignatureInvalid(format!(
            "cannot parse public key: {}",
            e
        )))
    })
}

struct CertHelper<'a> {
    cert: &'a Cert,
}

impl VerificationHelper for CertHelper<'_> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(vec![self.cert.clone()])
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure {
            if let MessageLayer::SignatureGroup { results } = layer {
                if results.iter().any(|r| r.is_ok()) {
                    return Ok(());
                }
            }
        }
        Err(anyhow::anyhow!("no valid signature from the configured key"))
    }
}

/// Verify the armored token and return the signed body.
fn verified_token_body(
    token: &[u8],
    cert: &Cert,
) -> std::result::Result<Vec<u8>, SignatureVerificationError> {
    let policy = StandardPolicy::new();
    let helper = CertHelper { cert };
    let mut verifier = VerifierBuilder::from_bytes(token)
        .map_err(|e| SignatureVerificationError::SignatureInvalid(e.to_string()))?
        .with_policy(&policy, None, helper)
        .map_err(|e| SignatureVerificationError::SignatureInvalid(e.to_string()))?;

    let mut body = Vec::new();
    verifier
        .read_to_end(&mut body)
        .map_err(|e| SignatureVerificationError::SignatureInvalid(e.to_string()))?;
    Ok(body)
}

/// Verify the signature token found in `dir` against `cert`.
///
/// Fails `NoSignature` if the token file is absent, `SignatureInvalid` if
/// the cryptographic check fails, and `HashMismatch` if the signed claim
/// disagrees with the recomputed content hash (or the recomputed hash with
/// the expected one).
pub fn verify_signature(dir: &Path, expected_hash: &str, cert: &Cert) -> Result<()> {
    let token_path = dir.join(SIGNATURE_FILE_NAME);
    if !token_path.exists() {
        return Err(SignatureVerificationError::NoSignature.into());
    }

    let token = std::fs::read(&token_path)?;
    let body = verified_token_body(&token, cert)?;
    let claim: SignatureClaim = serde_json::from_slice(&body).map_err(|e| {
        Error::from(SignatureVerificationError::SignatureInvalid(format!(
            "signed claim is not valid JSON: {}",
            e
        )))
    })?;

    let actual = content_hash(dir)?;
    if claim.content_hash != actual {
        return Err(SignatureVerificationError::HashMismatch {
            expected: claim.content_hash,
            actual,
        }
        .into());
    }
    if actual != expected_hash {
        return Err(SignatureVerificationError::HashMismatch {
            expected: expected_hash.to_string(),
            actual,
        }
        .into());
    }

    debug!("Signature verified for {}", dir.display());
    Ok(())
}

/// The verification policy applied once per install, keyed on whether a
/// public key is configured, whether the update shipped a signature token,
/// and whether it arrived as a diff.
pub fn verify_update(
    dir: &Path,
    expected_hash: &str,
    public_key: Option<&Cert>,
    is_diff: bool,
) -> Result<()> {
    let has_token = dir.join(SIGNATURE_FILE_NAME).exists();

    match (public_key, has_token) {
        // Signature check subsumes the folder-hash check
        (Some(cert), true) => verify_signature(dir, expected_hash, cert),
        (Some(_), false) => Err(SignatureVerificationError::NoSignature.into()),
        (None, true) => {
            warn!(
                "Signature exists in the update but code integrity check couldn't be \
                 performed because there is no public key configured. Ensure that a \
                 public key is properly configured within your application."
            );
            verify_folder_hash(dir, expected_hash)
        }
        (None, false) => {
            if is_diff {
                verify_folder_hash(dir, expected_hash)
            } else {
                // Unverified full update, preserved as-observed behavior
                debug!("No verification performed for unsigned full update");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequoia_openpgp::cert::CertBuilder;
    use sequoia_openpgp::serialize::stream::{Armorer, LiteralWriter, Message, Signer};
    use std::fs;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    fn generate_signing_cert() -> Cert {
        let (cert, _revocation) = CertBuilder::new()
            .add_userid("releases@example.com")
            .add_signing_subkey()
            .generate()
            .unwrap();
        cert
    }

    fn sign_body(cert: &Cert, body: &[u8]) -> Vec<u8> {
        let policy = StandardPolicy::new();
        let keypair = cert
            .keys()
            .unencrypted_secret()
            .with_policy(&policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .unwrap()
            .key()
            .clone()
            .into_keypair()
            .unwrap();

        let mut sink = Vec::new();
        let message = Message::new(&mut sink);
        let message = Armorer::new(message).build().unwrap();
        let message = Signer::new(message, keypair).build().unwrap();
        let mut message = LiteralWriter::new(message).build().unwrap();
        message.write_all(body).unwrap();
        message.finalize().unwrap();
        sink
    }

    fn write_signed_token(root: &Path, cert: &Cert, content_hash: &str) {
        let claim = format!(r#"{{"contentHash":"{}"}}"#, content_hash);
        let token = sign_body(cert, claim.as_bytes());
        fs::write(root.join(SIGNATURE_FILE_NAME), token).unwrap();
    }

    #[test]
    fn test_ignored_path_classification() {
        assert!(is_hash_ignored("__MACOSX/path"));
        assert!(!is_hash_ignored("__MACOSXpath"));
        assert!(is_hash_ignored(".DS_Store"));
        assert!(is_hash_ignored("path/.DS_Store"));
        assert!(is_hash_ignored(".codepushrelease"));
        assert!(is_hash_ignored("path/.codepushrelease"));
    }

    #[test]
    fn test_content_hash_invariant_under_recopy() {
        let original = tempdir().unwrap();
        write_file(original.path(), "b.txt", "bravo");
        write_file(original.path(), "a.txt", "alpha");
        write_file(original.path(), "sub/c.txt", "charlie");

        // Re-create in a different creation order so OS-level listing differs
        let recopy = tempdir().unwrap();
        write_file(recopy.path(), "sub/c.txt", "charlie");
        write_file(recopy.path(), "a.txt", "alpha");
        write_file(recopy.path(), "b.txt", "bravo");

        assert_eq!(
            content_hash(original.path()).unwrap(),
            content_hash(recopy.path()).unwrap()
        );
    }

    #[test]
    fn test_content_hash_excludes_ignored_paths() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "index.html", "content");
        let clean_hash = content_hash(dir.path()).unwrap();

        write_file(dir.path(), ".DS_Store", "junk");
        write_file(dir.path(), "__MACOSX/resource", "junk");
        write_file(dir.path(), ".codepushrelease", "token");
        assert_eq!(content_hash(dir.path()).unwrap(), clean_hash);
    }

    #[test]
    fn test_content_hash_tracks_content() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "index.html", "content");
        let before = content_hash(dir.path()).unwrap();

        write_file(dir.path(), "index.html", "changed");
        assert_ne!(content_hash(dir.path()).unwrap(), before);
    }

    #[test]
    fn test_content_manifest_is_sorted() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "z.txt", "z");
        write_file(dir.path(), "a.txt", "a");
        write_file(dir.path(), "m/n.txt", "n");

        let entries = content_manifest(dir.path()).unwrap();
        let paths: Vec<&str> = entries
            .iter()
            .map(|e| e.split(':').next().unwrap())
            .collect();
        assert_eq!(paths, vec!["a.txt", "m/n.txt", "z.txt"]);
    }

    #[test]
    fn test_verify_folder_hash_mismatch() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "index.html", "content");

        let good = content_hash(dir.path()).unwrap();
        assert!(verify_folder_hash(dir.path(), &good).is_ok());

        let err = verify_folder_hash(dir.path(), "bogus").unwrap_err();
        assert!(matches!(
            err,
            Error::SignatureVerification(SignatureVerificationError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_signature_round_trip() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "index.html", "content");
        let hash = content_hash(dir.path()).unwrap();

        let cert = generate_signing_cert();
        write_signed_token(dir.path(), &cert, &hash);

        let public = cert.clone().strip_secret_key_material();
        assert!(verify_signature(dir.path(), &hash, &public).is_ok());
    }

    #[test]
    fn test_signature_detects_tampered_content() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "index.html", "content");
        let hash = content_hash(dir.path()).unwrap();

        let cert = generate_signing_cert();
        write_signed_token(dir.path(), &cert, &hash);

        // Tamper after signing
        write_file(dir.path(), "index.html", "evil");

        let public = cert.clone().strip_secret_key_material();
        let err = verify_signature(dir.path(), &hash, &public).unwrap_err();
        assert!(matches!(
            err,
            Error::SignatureVerification(SignatureVerificationError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_signature_rejects_wrong_key() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "index.html", "content");
        let hash = content_hash(dir.path()).unwrap();

        let signing_cert = generate_signing_cert();
        write_signed_token(dir.path(), &signing_cert, &hash);

        let other_cert = generate_signing_cert();
        let err = verify_signature(dir.path(), &hash, &other_cert).unwrap_err();
        assert!(matches!(
            err,
            Error::SignatureVerification(SignatureVerificationError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_policy_requires_token_when_key_configured() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "index.html", "content");
        let hash = content_hash(dir.path()).unwrap();

        let cert = generate_signing_cert();
        let err = verify_update(dir.path(), &hash, Some(&cert), false).unwrap_err();
        assert!(matches!(
            err,
            Error::SignatureVerification(SignatureVerificationError::NoSignature)
        ));
    }

    #[test]
    fn test_policy_hash_only_without_key() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "index.html", "content");
        let hash = content_hash(dir.path()).unwrap();

        let cert = generate_signing_cert();
        write_signed_token(dir.path(), &cert, &hash);

        // Token present, no key configured: hash check still runs
        assert!(verify_update(dir.path(), &hash, None, false).is_ok());
        assert!(verify_update(dir.path(), "bogus", None, false).is_err());
    }

    #[test]
    fn test_policy_unsigned_updates() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "index.html", "content");

        // Unsigned diff updates are still hash-checked
        let err = verify_update(dir.path(), "bogus", None, true).unwrap_err();
        assert!(matches!(
            err,
            Error::SignatureVerification(SignatureVerificationError::HashMismatch { .. })
        ));

        // Unsigned full updates skip verification entirely
        assert!(verify_update(dir.path(), "bogus", None, false).is_ok());
    }
}

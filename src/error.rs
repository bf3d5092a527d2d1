// src/error.rs

use thiserror::Error;

/// Core error types for Airlift
#[derive(Error, Debug)]
pub enum Error {
    /// Settings database errors
    #[error("Settings error: {0}")]
    Settings(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A durable record exists but cannot be parsed
    #[error("Malformed data in {path}: {reason}")]
    MalformedData { path: String, reason: String },

    /// A package's metadata could not be read
    #[error("Cannot read package {hash}: {reason}")]
    GetPackage { hash: String, reason: String },

    /// Update integrity or signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureVerification(#[from] SignatureVerificationError),

    /// Update archive could not be extracted
    #[error("Failed to unzip update: {0}")]
    Unzip(#[from] zip::result::ZipError),

    /// Diff reconstruction failed
    #[error("Merge failed: {0}")]
    Merge(#[from] MergeError),

    /// Package download failed
    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    /// Package install failed
    #[error("Install failed: {0}")]
    Install(String),

    /// Rollback failed
    #[error("Rollback failed: {0}")]
    Rollback(#[from] RollbackError),
}

/// Failures raised by the integrity verification gate
#[derive(Error, Debug)]
pub enum SignatureVerificationError {
    /// A public key is configured but the update carries no signature token
    #[error("update does not contain a signature file, but a public key was provided")]
    NoSignature,

    /// The signature's claimed content hash disagrees with the recomputed one
    #[error("content hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    /// The cryptographic signature did not validate against the public key
    #[error("invalid signature: {0}")]
    SignatureInvalid(String),
}

/// Failures raised by the diff merge engine
#[derive(Error, Debug)]
pub enum MergeError {
    /// A diff update arrived but there is no base package to diff against
    #[error("received a diff update, but there is no base package to apply it to")]
    NoBaseForDiff,

    /// The reconstructed tree does not contain the expected entry point
    #[error(
        "update is invalid - an entry point file named \"{0}\" could not be found \
         within the update contents; check that releases use the exact entry file \
         name shipped with the application binary"
    )]
    EntryPointNotFound(String),
}

/// Failures raised by the package downloader
#[derive(Error, Debug)]
pub enum DownloadError {
    /// The server-declared length disagrees with the bytes received
    #[error("received {received} bytes, expected {expected}")]
    SizeMismatch { received: u64, expected: u64 },

    /// The HTTP transfer itself failed
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The transfer was cancelled by the caller
    #[error("download cancelled")]
    Cancelled,
}

/// Failures raised by the rollback path
#[derive(Error, Debug)]
pub enum RollbackError {
    /// Rollback requires a preserved previous package
    #[error("no previous package to roll back to")]
    NoPreviousPackage,
}

/// Result type alias using Airlift's Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps a serde_json failure on a durable record into `MalformedData`.
    pub(crate) fn malformed(path: &std::path::Path, err: serde_json::Error) -> Self {
        Error::MalformedData {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}

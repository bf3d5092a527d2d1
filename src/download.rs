// src/download.rs

//! Update payload downloading
//!
//! Downloads are written to a temp file next to the destination and renamed
//! into place once complete, with retry on connection failures. The first
//! four bytes of the body are sniffed for the zip local-file-header magic so
//! the pipeline can tell archived packages from legacy raw bundles, and a
//! declared content length that does not match the received byte count fails
//! the download rather than handing a truncated payload to the installer.

use crate::error::{DownloadError, Error, Result};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts for failed downloads
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Read buffer size for the body copy loop
const DOWNLOAD_BUFFER_SIZE: usize = 1024 * 256;

/// Local file header magic of a zip archive
const ZIP_HEADER: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Progress of an in-flight download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub received_bytes: u64,
    /// Declared content length, when the server sent one
    pub total_bytes: Option<u64>,
}

/// A completed download on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedUpdate {
    pub path: PathBuf,
    /// Whether the payload starts with the zip magic. Anything else is
    /// treated as a legacy raw bundle.
    pub is_zip: bool,
}

/// HTTP client wrapper with retry support
pub struct DownloadClient {
    client: Client,
    max_retries: u32,
}

impl DownloadClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::Download(DownloadError::TransportFailure(format!(
                    "Failed to create HTTP client: {}",
                    e
                )))
            })?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// Download `url` to `dest_path`, reporting progress per chunk.
    pub fn download_update<F>(
        &self,
        url: &str,
        dest_path: &Path,
        on_progress: F,
    ) -> Result<DownloadedUpdate>
    where
        F: FnMut(DownloadProgress),
    {
        self.download_inner(url, dest_path, &AtomicBool::new(false), on_progress)
    }

    fn download_inner<F>(
        &self,
        url: &str,
        dest_path: &Path,
        cancelled: &AtomicBool,
        mut on_progress: F,
    ) -> Result<DownloadedUpdate>
    where
        F: FnMut(DownloadProgress),
    {
        info!("Downloading update from {} to {}", url, dest_path.display());

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut attempt = 0;
        let mut response = loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(DownloadError::TransportFailure(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        ))
                        .into());
                    }
                    break response;
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(DownloadError::TransportFailure(format!(
                            "Failed to download after {} attempts: {}",
                            attempt, e
                        ))
                        .into());
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        };

        let total_bytes = response.content_length();
        let temp_path = dest_path.with_extension("tmp");
        let result = copy_body(&mut response, &temp_path, total_bytes, cancelled, &mut on_progress);

        let (received_bytes, header) = match result {
            Ok(state) => state,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        if let Some(expected) = total_bytes {
            if received_bytes != expected {
                let _ = fs::remove_file(&temp_path);
                return Err(DownloadError::SizeMismatch {
                    received: received_bytes,
                    expected,
                }
                .into());
            }
        }

        fs::rename(&temp_path, dest_path)?;
        info!(
            "Received {} bytes, saved to {}",
            received_bytes,
            dest_path.display()
        );

        Ok(DownloadedUpdate {
            path: dest_path.to_path_buf(),
            is_zip: header == ZIP_HEADER,
        })
    }
}

/// Copy the response body to `temp_path`, collecting the received byte count
/// and the first four bytes of the stream.
fn copy_body<F>(
    response: &mut reqwest::blocking::Response,
    temp_path: &Path,
    total_bytes: Option<u64>,
    cancelled: &AtomicBool,
    on_progress: &mut F,
) -> Result<(u64, [u8; 4])>
where
    F: FnMut(DownloadProgress),
{
    let mut file = File::create(temp_path)?;
    let mut buffer = vec![0u8; DOWNLOAD_BUFFER_SIZE];
    let mut received_bytes: u64 = 0;
    let mut header = [0u8; 4];
    let mut header_len: usize = 0;

    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Err(DownloadError::Cancelled.into());
        }
        let count = response.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        if header_len < header.len() {
            let take = (header.len() - header_len).min(count);
            header[header_len..header_len + take].copy_from_slice(&buffer[..take]);
            header_len += take;
        }
        file.write_all(&buffer[..count])?;
        received_bytes += count as u64;
        on_progress(DownloadProgress {
            received_bytes,
            total_bytes,
        });
    }

    file.sync_all()?;
    Ok((received_bytes, header))
}

/// A download running on a background thread.
///
/// Cancellation is cooperative: the copy loop checks the flag between
/// chunks, abandons the temp file, and surfaces as a dedicated error so the
/// caller can tell an aborted download from a failed one.
pub struct DownloadTask {
    handle: JoinHandle<Result<DownloadedUpdate>>,
    cancelled: Arc<AtomicBool>,
}

impl DownloadTask {
    /// Start downloading `url` to `dest_path` on a background thread.
    pub fn spawn<F>(url: String, dest_path: PathBuf, on_progress: F) -> DownloadTask
    where
        F: FnMut(DownloadProgress) + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let handle = std::thread::spawn(move || {
            let client = DownloadClient::new()?;
            client.download_inner(&url, &dest_path, &flag, on_progress)
        });
        DownloadTask { handle, cancelled }
    }

    /// Request cancellation. Takes effect at the next chunk boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the download finishes and return its outcome.
    pub fn wait(self) -> Result<DownloadedUpdate> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(DownloadError::TransportFailure(
                "download thread panicked".to_string(),
            )
            .into()),
        }
    }
}

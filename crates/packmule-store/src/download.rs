use std::{io::Read, io::Write, time::Duration};

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::store::{ArtifactMeta, ArtifactStore, StoreError};

const USER_AGENT: &str = concat!("packmule/", env!("CARGO_PKG_VERSION"));
const DOWNLOAD_ATTEMPTS: usize = 3;

/// A registry artifact to fetch and ingest.
pub struct DownloadRequest<'a> {
    pub ecosystem: &'a str,
    pub url: &'a str,
    /// Published checksum, when the registry provides one. Without it the
    /// computed digest becomes ground truth.
    pub expected_sha256: Option<&'a str>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DownloadedArtifact {
    pub digest: String,
    pub size: u64,
}

/// Fetches `request.url`, verifies the bytes, and stores them content-addressed.
///
/// Transient failures are retried a bounded number of times; the last error is
/// kept and surfaced verbatim when every attempt is spent.
pub fn download_verified(
    store: &ArtifactStore,
    request: &DownloadRequest<'_>,
) -> Result<DownloadedArtifact> {
    if let Some(expected) = request.expected_sha256 {
        if let Some(path) = store.path(expected) {
            let size = std::fs::metadata(&path)?.len();
            debug!(url = request.url, digest = expected, "download cache hit");
            return Ok(DownloadedArtifact {
                digest: expected.to_string(),
                size,
            });
        }
    }

    let mut last_err = None;
    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        match download_once(store, request) {
            Ok(artifact) => return Ok(artifact),
            // A checksum mismatch is corruption, not a transient failure;
            // retrying would fetch the same bad bytes again.
            Err(err)
                if matches!(
                    err.downcast_ref::<StoreError>(),
                    Some(StoreError::DigestMismatch { .. })
                ) =>
            {
                return Err(err);
            }
            Err(err) => {
                debug!(url = request.url, attempt, error = %err, "download attempt failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("failed to download {}; no attempts left", request.url)))
}

fn download_once(
    store: &ArtifactStore,
    request: &DownloadRequest<'_>,
) -> Result<DownloadedArtifact> {
    let client = http_client(request.timeout)?;
    let mut response = client
        .get(request.url)
        .send()
        .with_context(|| format!("failed to fetch {}", request.url))?
        .error_for_status()
        .with_context(|| format!("unexpected response for {}", request.url))?;

    let mut tmp = NamedTempFile::new()?;
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = response
            .read(&mut buffer)
            .with_context(|| format!("stream error for {}", request.url))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        tmp.write_all(&buffer[..read])?;
        written += read as u64;
    }

    let actual = hex::encode(hasher.finalize());
    if let Some(expected) = request.expected_sha256 {
        if actual != expected {
            return Err(anyhow::Error::new(StoreError::DigestMismatch {
                digest: expected.to_string(),
                actual,
            })
            .context(format!("rejected download from {}", request.url)));
        }
    }

    let meta = ArtifactMeta {
        ecosystem: request.ecosystem.to_string(),
        origin: request.url.to_string(),
        size: written,
    };
    let digest = store.put_file(tmp.path(), &meta)?;
    debug_assert_eq!(digest, actual);
    Ok(DownloadedArtifact {
        digest,
        size: written,
    })
}

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .context("failed to build http client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_skips_the_network() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::open(temp.path())?;
        let digest = store.put_bytes(
            b"already here",
            &ArtifactMeta {
                ecosystem: "gomod".to_string(),
                origin: "https://example.invalid/seed".to_string(),
                size: 12,
            },
        )?;

        // The URL is unroutable; a hit must never touch it.
        let request = DownloadRequest {
            ecosystem: "gomod",
            url: "https://example.invalid/y/@v/v1.2.0.zip",
            expected_sha256: Some(&digest),
            timeout: Duration::from_secs(1),
        };
        let artifact = download_verified(&store, &request)?;
        assert_eq!(artifact.digest, digest);
        assert_eq!(artifact.size, 12);
        Ok(())
    }

    #[test]
    fn checksum_mismatch_is_not_retried() -> Result<()> {
        use httptest::{matchers::request, responders::status_code, Expectation, Server};

        let server = Server::run();
        // `times(1)` makes the server itself fail the test on a retry.
        server.expect(
            Expectation::matching(request::method_path("GET", "/y/@v/v1.2.0.zip"))
                .times(1)
                .respond_with(status_code(200).body("corrupted payload")),
        );

        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::open(temp.path())?;
        let url = server.url_str("/y/@v/v1.2.0.zip");
        let expected = "0".repeat(64);
        let request = DownloadRequest {
            ecosystem: "gomod",
            url: url.as_str(),
            expected_sha256: Some(expected.as_str()),
            timeout: Duration::from_secs(5),
        };
        let err = download_verified(&store, &request).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::DigestMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn unreachable_registry_reports_last_error() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::open(temp.path())?;
        let request = DownloadRequest {
            ecosystem: "gomod",
            url: "http://127.0.0.1:9/never",
            expected_sha256: None,
            timeout: Duration::from_millis(200),
        };
        let err = download_verified(&store, &request).unwrap_err();
        assert!(err.to_string().contains("failed to fetch"));
        Ok(())
    }
}

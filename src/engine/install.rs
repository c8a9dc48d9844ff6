//! Engine binary setup.
//!
//! Not on the search path: the server only needs a binary that already
//! exists. This fetches one over HTTP(S) so a fresh deployment can be
//! provisioned from the command line.

use std::{
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use futures_util::StreamExt;
use log::{error, info, warn};
use reqwest::{Client, Url};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const MAX_DOWNLOAD_SIZE: u64 = 512 * 1024 * 1024;
const DOWNLOAD_ATTEMPTS: u32 = 3;
const RETRY_STEP: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Download failed with status {0}")]
    Status(reqwest::StatusCode),

    #[error("File too large: {0} bytes")]
    TooLarge(u64),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Download failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<InstallError>,
    },
}

/// Download `url` to `dest` and mark it executable, trying up to three
/// times with a linearly growing pause between attempts.
pub async fn install_engine(url: &str, dest: &Path) -> Result<PathBuf, InstallError> {
    let parsed = Url::parse(url).map_err(|e| InstallError::InvalidUrl(e.to_string()))?;
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        return Err(InstallError::InvalidUrl(format!(
            "only HTTP/HTTPS allowed, got {}",
            parsed.scheme()
        )));
    }

    let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
    info!("Downloading engine from {} to {}", url, dest.display());

    let mut attempt = 1;
    loop {
        match download_to_file(&client, parsed.clone(), dest).await {
            Ok(bytes) => {
                info!("Downloaded {} bytes to {}", bytes, dest.display());
                break;
            }
            Err(e) if attempt < DOWNLOAD_ATTEMPTS => {
                warn!("Engine download failed (attempt {}), retrying: {}", attempt, e);
                tokio::time::sleep(RETRY_STEP * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                error!("Engine download failed after {} attempts: {}", attempt, e);
                return Err(InstallError::Exhausted {
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
        }
    }

    set_executable(dest)?;
    Ok(dest.to_path_buf())
}

async fn download_to_file(client: &Client, url: Url, path: &Path) -> Result<u64, InstallError> {
    let res = client.get(url).send().await?;
    if !res.status().is_success() {
        return Err(InstallError::Status(res.status()));
    }
    if let Some(size) = res.content_length().filter(|&s| s > MAX_DOWNLOAD_SIZE) {
        return Err(InstallError::TooLarge(size));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::File::create(path)?;
    let mut downloaded: u64 = 0;
    let mut stream = res.bytes_stream();

    while let Some(item) = stream.next().await {
        let chunk = item?;
        downloaded = downloaded.saturating_add(chunk.len() as u64);
        if downloaded > MAX_DOWNLOAD_SIZE {
            return Err(InstallError::TooLarge(downloaded));
        }
        file.write_all(&chunk)?;
    }

    file.sync_all()?;
    Ok(downloaded)
}

pub fn set_executable(path: &Path) -> Result<(), InstallError> {
    #[cfg(unix)]
    {
        let mut permissions = std::fs::metadata(path)?.permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(path, permissions)?;
        info!("Set file as executable: {}", path.display());
    }

    #[cfg(not(unix))]
    {
        if !path.is_file() {
            return Err(InstallError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                path.display().to_string(),
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let dir = tempfile::tempdir().unwrap();
        let err = install_engine("ftp://example.com/engine", &dir.path().join("engine"))
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::InvalidUrl(_)));

        let err = install_engine("not a url", &dir.path().join("engine"))
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let dir = tempfile::tempdir().unwrap();
        // nothing listens on port 1
        let err = install_engine("http://127.0.0.1:1/engine", &dir.path().join("engine"))
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::Exhausted { attempts: 3, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn marks_file_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine");
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        set_executable(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}

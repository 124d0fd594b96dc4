//! Streaming downloads into self-removing temporary files.

use super::PipelineError;
use crate::platform::{DownloadInfo, PlatformError};
use futures_util::StreamExt;
use reqwest::Client as HttpClient;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A downloaded file removed from disk when dropped
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    /// Take ownership of an existing file
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location on disk
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed temporary file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove temporary file"),
        }
    }
}

/// Fetches upstream audio into the download directory
pub struct Downloader {
    http: HttpClient,
    dir: PathBuf,
}

impl Downloader {
    /// Create a downloader writing into `dir`
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if the HTTP client cannot be built.
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, PipelineError> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            dir: dir.into(),
        })
    }

    /// Directory downloads are written to
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Download `info` into a fresh file.
    ///
    /// The partial file is removed on any failure.
    ///
    /// # Errors
    ///
    /// Returns `Canceled` if `cancel` fires, `Upstream` for HTTP status
    /// failures, `Transient` for broken transfers and `Io` for local failures.
    pub async fn fetch(
        &self,
        info: &DownloadInfo,
        cancel: &CancellationToken,
    ) -> Result<TempFile, PipelineError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let extension = sanitize_extension(&info.extension);
        let file = TempFile::new(
            self.dir
                .join(format!("{}.{extension}", uuid::Uuid::new_v4().simple())),
        );

        let path = file.path().to_path_buf();
        let written = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PipelineError::Canceled),
            result = self.stream_to(info, &path) => result?,
        };
        debug!(path = %path.display(), bytes = written, "Download finished");
        Ok(file)
    }

    async fn stream_to(&self, info: &DownloadInfo, path: &Path) -> Result<u64, PipelineError> {
        let mut request = self.http.get(&info.url);
        for (name, value) in &info.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, &info.url));
        }

        let mut out = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::Transient(e.to_string()))?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;

        if written == 0 {
            return Err(PipelineError::Transient("empty response body".to_string()));
        }
        if let Some(expected) = info.size {
            if expected != written {
                return Err(PipelineError::Transient(format!(
                    "truncated download: {written} of {expected} bytes"
                )));
            }
        }
        Ok(written)
    }
}

fn status_error(status: StatusCode, url: &str) -> PipelineError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => PlatformError::NotFound(url.to_string()).into(),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            PlatformError::AuthRequired(url.to_string()).into()
        }
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited { wait_secs: None }.into(),
        s => PipelineError::Transient(format!("download failed with HTTP {s}")),
    }
}

fn sanitize_extension(ext: &str) -> String {
    let clean: String = ext
        .trim_start_matches('.')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect();
    if clean.is_empty() {
        "bin".to_string()
    } else {
        clean.to_ascii_lowercase()
    }
}

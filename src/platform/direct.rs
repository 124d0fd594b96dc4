use super::{DownloadInfo, MusicPlatform, PlatformError, Quality, Track};
use crate::utils::retry_upstream_operation;
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client as HttpClient, Response, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Platform name used in request keys.
pub const DIRECT_PLATFORM: &str = "direct";

/// Plain http(s) audio links. The track id is the URL itself.
pub struct DirectLinkPlatform {
    http: HttpClient,
}

impl DirectLinkPlatform {
    /// Creates a platform client with the given request timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self { http }
    }

    async fn head(&self, url: &str) -> Result<Response, PlatformError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(PlatformError::Unsupported(format!("not an http link: {url}")));
        }

        retry_upstream_operation(
            || async {
                let response = self
                    .http
                    .head(url)
                    .send()
                    .await
                    .map_err(|e| PlatformError::Network(e.to_string()))?;
                check_status(response, url)
            },
            PlatformError::is_transient,
        )
        .await
    }
}

fn check_status(response: Response, url: &str) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    Err(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => PlatformError::NotFound(url.to_string()),
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited {
            wait_secs: response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            PlatformError::AuthRequired(format!("{status} for {url}"))
        }
        s if s.is_server_error() => PlatformError::Unavailable(format!("{status} for {url}")),
        _ => PlatformError::Unsupported(format!("{status} for {url}")),
    })
}

fn is_audio_content(content_type: Option<&str>) -> bool {
    content_type.is_none_or(|ct| {
        let ct = ct.to_ascii_lowercase();
        ct.starts_with("audio/") || ct.starts_with("application/octet-stream")
    })
}

/// Last path segment of a URL, without query string.
fn file_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path)
}

fn title_from_url(url: &str) -> String {
    let name = file_name(url);
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    stem.replace(['_', '+'], " ").replace("%20", " ")
}

fn extension_from(url: &str, content_type: Option<&str>) -> String {
    let from_name = file_name(url)
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| (2..=4).contains(&ext.len()) && ext.chars().all(char::is_alphanumeric));
    if let Some(ext) = from_name {
        return ext;
    }
    match content_type.map(str::to_ascii_lowercase).as_deref() {
        Some(ct) if ct.contains("ogg") => "ogg".to_string(),
        Some(ct) if ct.contains("flac") => "flac".to_string(),
        Some(ct) if ct.contains("mp4") || ct.contains("m4a") => "m4a".to_string(),
        _ => "mp3".to_string(),
    }
}

fn header_str(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

#[async_trait]
impl MusicPlatform for DirectLinkPlatform {
    fn name(&self) -> &str {
        DIRECT_PLATFORM
    }

    async fn get_track(&self, track_id: &str) -> Result<Track, PlatformError> {
        let response = self.head(track_id).await?;
        let content_type = header_str(&response, CONTENT_TYPE);
        if !is_audio_content(content_type.as_deref()) {
            return Err(PlatformError::Unsupported(format!(
                "not an audio file: {}",
                content_type.unwrap_or_default()
            )));
        }

        debug!(url = %track_id, "Resolved direct link track");
        Ok(Track {
            platform: DIRECT_PLATFORM.to_string(),
            id: track_id.to_string(),
            title: title_from_url(track_id),
            artist: String::new(),
            duration_secs: None,
        })
    }

    async fn get_download_info(
        &self,
        track_id: &str,
        _quality: Quality,
    ) -> Result<DownloadInfo, PlatformError> {
        let response = self.head(track_id).await?;
        let content_type = header_str(&response, CONTENT_TYPE);
        Ok(DownloadInfo {
            url: track_id.to_string(),
            headers: HashMap::new(),
            extension: extension_from(track_id, content_type.as_deref()),
            size: header_str(&response, CONTENT_LENGTH).and_then(|v| v.parse().ok()),
        })
    }

    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<Track>, PlatformError> {
        Err(PlatformError::Unsupported(
            "search is not available for direct links".to_string(),
        ))
    }

    async fn get_playlist(&self, _playlist_id: &str) -> Result<Vec<Track>, PlatformError> {
        Err(PlatformError::Unsupported(
            "playlists are not available for direct links".to_string(),
        ))
    }
}

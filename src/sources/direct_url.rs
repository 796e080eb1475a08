use async_trait::async_trait;
use futures::TryStreamExt;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use super::{ByteStream, MediaDescriptor, SourceResolver, SourceType};
use crate::error::ResolveError;

const AUDIO_EXTENSIONS: [&str; 7] = [".mp3", ".wav", ".ogg", ".opus", ".flac", ".m4a", ".aac"];

/// Cliente para archivos de audio servidos por HTTP(S)
pub struct DirectUrlClient {
    client: reqwest::Client,
}

impl DirectUrlClient {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Título a partir del último segmento de la ruta
    fn title_from_url(url: &url::Url) -> String {
        url.path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .map(|s| {
                let decoded = percent_decode(s);
                match decoded.rsplit_once('.') {
                    Some((stem, _)) if !stem.is_empty() => stem.to_string(),
                    _ => decoded,
                }
            })
            .unwrap_or_else(|| url.as_str().to_string())
    }

    fn map_request_error(url: &str, err: reqwest::Error) -> ResolveError {
        match err.status() {
            Some(status) if status.as_u16() == 404 || status.as_u16() == 410 => {
                ResolveError::NotFound(url.to_string())
            }
            Some(status) if status.is_client_error() => {
                ResolveError::InvalidReference(format!("{} ({})", url, status))
            }
            _ => ResolveError::Transient(err.to_string()),
        }
    }
}

impl Default for DirectUrlClient {
    fn default() -> Self {
        Self::new()
    }
}

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

#[async_trait]
impl SourceResolver for DirectUrlClient {
    async fn resolve(&self, query: &str) -> Result<MediaDescriptor, ResolveError> {
        let parsed = url::Url::parse(query)
            .map_err(|_| ResolveError::InvalidReference(query.to_string()))?;

        let response = self
            .client
            .head(parsed.as_str())
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Self::map_request_error(query, e))?;

        debug!("📡 HEAD {} -> {}", query, response.status());

        let media = MediaDescriptor::new(Self::title_from_url(&parsed), parsed.as_str(), SourceType::DirectUrl);
        info!("✅ URL directa: {}", media.title());
        Ok(media)
    }

    async fn open_stream(&self, media: &MediaDescriptor) -> Result<ByteStream, ResolveError> {
        let response = self
            .client
            .get(media.url())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Self::map_request_error(media.url(), e))?;

        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(body))))
    }

    fn is_valid_url(&self, url: &str) -> bool {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return false;
        }

        // Solo archivos de audio; el resto lo maneja yt-dlp
        let path = url::Url::parse(url)
            .map(|u| u.path().to_lowercase())
            .unwrap_or_default();

        AUDIO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }

    fn source_name(&self) -> &'static str {
        "direct"
    }
}

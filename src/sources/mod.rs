//! # Sources
//!
//! Resolución de consultas a descriptores reproducibles y apertura del
//! stream de bytes original (antes de transcodificar).
//!
//! - [`ytdlp`]: búsqueda y extracción con yt-dlp (YouTube y todo lo que soporte)
//! - [`direct_url`]: archivos de audio servidos por HTTP(S)
//! - [`SmartSource`]: enruta cada consulta a la fuente adecuada

pub mod direct_url;
pub mod ytdlp;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::debug;

pub use direct_url::DirectUrlClient;
pub use ytdlp::YtDlpClient;

use crate::error::ResolveError;

/// Bytes del audio original, en cualquier códec.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Trait común para todas las fuentes de música
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Convierte una consulta o URL en un descriptor reproducible
    async fn resolve(&self, query: &str) -> Result<MediaDescriptor, ResolveError>;

    /// Abre el stream de bytes del descriptor
    async fn open_stream(&self, media: &MediaDescriptor) -> Result<ByteStream, ResolveError>;

    /// Verifica si la URL es válida para esta fuente
    fn is_valid_url(&self, url: &str) -> bool;

    /// Nombre de la fuente
    fn source_name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    YouTube,
    DirectUrl,
}

/// Descriptor de un track ya resuelto.
///
/// Es opaco para el scheduler: solo la fuente que lo creó sabe abrirlo.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDescriptor {
    title: String,
    artist: Option<String>,
    duration: Option<Duration>,
    thumbnail: Option<String>,
    url: String,
    source_type: SourceType,
}

impl MediaDescriptor {
    pub fn new(title: impl Into<String>, url: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            title: title.into(),
            artist: None,
            duration: None,
            thumbnail: None,
            url: url.into(),
            source_type,
        }
    }

    // Getters
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn artist(&self) -> Option<&str> {
        self.artist.as_deref()
    }
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnail.as_deref()
    }
    pub fn url(&self) -> &str {
        &self.url
    }
    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    // Setters
    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }
}

/// Enruta entre yt-dlp y URLs directas.
///
/// Las URLs de archivos de audio van directo por HTTP; todo lo demás
/// (URLs de YouTube, texto libre) pasa por yt-dlp.
pub struct SmartSource {
    ytdlp: Arc<dyn SourceResolver>,
    direct: Arc<dyn SourceResolver>,
}

impl SmartSource {
    pub fn new(ytdlp: Arc<dyn SourceResolver>, direct: Arc<dyn SourceResolver>) -> Self {
        Self { ytdlp, direct }
    }

    fn route_query(&self, query: &str) -> &Arc<dyn SourceResolver> {
        if self.direct.is_valid_url(query) {
            &self.direct
        } else {
            &self.ytdlp
        }
    }

    fn route_media(&self, media: &MediaDescriptor) -> &Arc<dyn SourceResolver> {
        match media.source_type() {
            SourceType::DirectUrl => &self.direct,
            SourceType::YouTube => &self.ytdlp,
        }
    }
}

#[async_trait]
impl SourceResolver for SmartSource {
    async fn resolve(&self, query: &str) -> Result<MediaDescriptor, ResolveError> {
        let source = self.route_query(query.trim());
        debug!("🎯 Resolviendo '{}' con {}", query, source.source_name());
        source.resolve(query.trim()).await
    }

    async fn open_stream(&self, media: &MediaDescriptor) -> Result<ByteStream, ResolveError> {
        self.route_media(media).open_stream(media).await
    }

    fn is_valid_url(&self, url: &str) -> bool {
        self.direct.is_valid_url(url) || self.ytdlp.is_valid_url(url)
    }

    fn source_name(&self) -> &'static str {
        "smart"
    }
}

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::{ByteStream, MediaDescriptor, SourceResolver, SourceType};
use crate::error::ResolveError;

/// Cliente que resuelve y descarga con yt-dlp
pub struct YtDlpClient {
    program: PathBuf,
    cookies: Option<PathBuf>,
    timeout: Duration,
}

/// Información extraída de yt-dlp (`--dump-json`)
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: String,
    duration: Option<f64>,
    uploader: Option<String>,
    thumbnail: Option<String>,
    webpage_url: String,
    #[serde(default)]
    is_live: Option<bool>,
}

impl YtDlpClient {
    pub fn new(program: PathBuf, cookies: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            program,
            cookies,
            timeout,
        }
    }

    /// Verifica si la URL es válida para YouTube
    pub fn is_youtube_url(url: &str) -> bool {
        static YOUTUBE: OnceLock<Regex> = OnceLock::new();
        YOUTUBE
            .get_or_init(|| {
                Regex::new(r"^https?://(www\.|m\.|music\.)?(youtube\.com|youtu\.be)/")
                    .expect("regex de YouTube válida")
            })
            .is_match(url)
    }

    fn is_url(query: &str) -> bool {
        query.starts_with("http://") || query.starts_with("https://")
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["--no-playlist", "--no-warnings", "--socket-timeout", "15"]);

        // Agregar cookies si están disponibles
        if let Some(cookies) = &self.cookies {
            cmd.arg("--cookies").arg(cookies);
        }

        cmd.kill_on_drop(true);
        cmd
    }

    async fn extract_info(&self, query: &str) -> Result<MediaDescriptor, ResolveError> {
        let target = if Self::is_url(query) {
            query.to_string()
        } else {
            format!("ytsearch1:{}", query)
        };

        let mut cmd = self.base_command();
        cmd.args(["--dump-json", "--skip-download"]).arg(&target);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ResolveError::Transient(format!("yt-dlp tardó más de {:?}", self.timeout)))?
            .map_err(|e| ResolveError::Transient(format!("yt-dlp no se pudo ejecutar: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp falló para '{}': {}", query, stderr.trim());
            return Err(classify_failure(query, &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_info(query, &stdout)
    }
}

/// Clasifica el stderr de yt-dlp en el tipo de error correspondiente.
fn classify_failure(query: &str, stderr: &str) -> ResolveError {
    let lower = stderr.to_lowercase();

    if lower.contains("unsupported url")
        || lower.contains("is not a valid url")
        || lower.contains("incomplete youtube id")
        || lower.contains("invalid url")
    {
        ResolveError::InvalidReference(query.to_string())
    } else if lower.contains("video unavailable")
        || lower.contains("private video")
        || lower.contains("has been removed")
        || lower.contains("http error 404")
    {
        ResolveError::NotFound(query.to_string())
    } else {
        let last = stderr.lines().last().unwrap_or("error desconocido").trim();
        ResolveError::Transient(last.to_string())
    }
}

/// Toma la primera línea JSON de la salida de `--dump-json`.
fn parse_info(query: &str, stdout: &str) -> Result<MediaDescriptor, ResolveError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| ResolveError::NotFound(query.to_string()))?;

    let info: YtDlpInfo = serde_json::from_str(line)
        .map_err(|e| ResolveError::Transient(format!("respuesta de yt-dlp ilegible: {}", e)))?;

    let mut media = MediaDescriptor::new(info.title, info.webpage_url, SourceType::YouTube);

    if let Some(uploader) = info.uploader {
        media = media.with_artist(uploader);
    }

    // Los directos no tienen duración útil
    if !info.is_live.unwrap_or(false) {
        if let Some(duration) = info.duration.filter(|d| d.is_finite() && *d > 0.0) {
            media = media.with_duration(Duration::from_secs_f64(duration));
        }
    }

    if let Some(thumbnail) = info.thumbnail {
        media = media.with_thumbnail(thumbnail);
    }

    Ok(media)
}

#[async_trait]
impl SourceResolver for YtDlpClient {
    async fn resolve(&self, query: &str) -> Result<MediaDescriptor, ResolveError> {
        info!("🔍 Resolviendo con yt-dlp: {}", query);

        if Self::is_url(query) && url::Url::parse(query).is_err() {
            return Err(ResolveError::InvalidReference(query.to_string()));
        }

        let media = self.extract_info(query).await?;
        info!("✅ Resuelto: {} ({})", media.title(), media.url());
        Ok(media)
    }

    async fn open_stream(&self, media: &MediaDescriptor) -> Result<ByteStream, ResolveError> {
        debug!("🎵 Abriendo stream de yt-dlp para: {}", media.title());

        let mut cmd = self.base_command();
        cmd.args([
            "--format",
            "bestaudio[ext=m4a]/bestaudio[ext=webm]/bestaudio/best",
            "--quiet",
            "--output",
            "-",
        ])
        .arg(media.url())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| ResolveError::Transient(format!("yt-dlp no se pudo ejecutar: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ResolveError::Transient("yt-dlp sin stdout".to_string()))?;

        Ok(Box::new(ProcessStream {
            _child: child,
            stdout,
        }))
    }

    fn is_valid_url(&self, url: &str) -> bool {
        Self::is_youtube_url(url)
    }

    fn source_name(&self) -> &'static str {
        "yt-dlp"
    }
}

/// stdout de un proceso que vive mientras se lea; al soltarlo se mata
/// el proceso (`kill_on_drop`).
struct ProcessStream {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for ProcessStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

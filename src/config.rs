use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::audio::transcoder::PcmFormat;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,

    // Scheduler
    pub tick_interval_ms: u64,
    pub error_backoff_ms: u64,
    pub teardown_timeout_secs: u64,

    // Audio
    pub sample_rate: u32,
    pub channels: u16,
    pub pcm_pipe_capacity: usize,
    pub early_end_tolerance_secs: u64,

    // Binarios externos
    pub ffmpeg_path: PathBuf,
    pub ytdlp_path: PathBuf,
    pub ytdlp_cookies: Option<PathBuf>,

    // Resolución
    pub resolve_timeout_secs: u64,
    pub resolve_cache_size: usize,
    pub resolve_cache_ttl_secs: u64,

    // Límites
    pub max_song_duration: u64, // En segundos
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,

            // Scheduler
            tick_interval_ms: env_or("TICK_INTERVAL_MS", defaults.tick_interval_ms)?,
            error_backoff_ms: env_or("ERROR_BACKOFF_MS", defaults.error_backoff_ms)?,
            teardown_timeout_secs: env_or("TEARDOWN_TIMEOUT_SECS", defaults.teardown_timeout_secs)?,

            // Audio
            sample_rate: env_or("SAMPLE_RATE", defaults.sample_rate)?,
            channels: env_or("CHANNELS", defaults.channels)?,
            pcm_pipe_capacity: env_or("PCM_PIPE_CAPACITY", defaults.pcm_pipe_capacity)?,
            early_end_tolerance_secs: env_or(
                "EARLY_END_TOLERANCE_SECS",
                defaults.early_end_tolerance_secs,
            )?,

            // Binarios externos
            ffmpeg_path: std::env::var("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffmpeg_path),
            ytdlp_path: std::env::var("YTDLP_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ytdlp_path),
            ytdlp_cookies: std::env::var("YTDLP_COOKIES")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),

            // Resolución
            resolve_timeout_secs: env_or("RESOLVE_TIMEOUT_SECS", defaults.resolve_timeout_secs)?,
            resolve_cache_size: env_or("RESOLVE_CACHE_SIZE", defaults.resolve_cache_size)?,
            resolve_cache_ttl_secs: env_or(
                "RESOLVE_CACHE_TTL_SECS",
                defaults.resolve_cache_ttl_secs,
            )?,

            // Límites
            max_song_duration: env_or("MAX_SONG_DURATION", defaults.max_song_duration)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Sample rate must be one Opus supports (8, 12, 16, 24 or 48 kHz)
    /// - Only mono or stereo PCM
    /// - Tick interval, pipe capacity, timeouts and cache size must be > 0
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.sample_rate, 8000 | 12000 | 16000 | 24000 | 48000) {
            anyhow::bail!("Unsupported sample rate: {}", self.sample_rate);
        }

        if !(1..=2).contains(&self.channels) {
            anyhow::bail!("Channels must be 1 or 2, got: {}", self.channels);
        }

        if self.tick_interval_ms == 0 {
            anyhow::bail!("Tick interval must be greater than 0");
        }

        if self.pcm_pipe_capacity == 0 {
            anyhow::bail!("PCM pipe capacity must be greater than 0");
        }

        if self.resolve_timeout_secs == 0 || self.teardown_timeout_secs == 0 {
            anyhow::bail!("Timeouts must be greater than 0");
        }

        if self.resolve_cache_size == 0 {
            anyhow::bail!("Resolve cache size must be greater than 0");
        }

        if self.max_song_duration == 0 {
            anyhow::bail!("Max song duration must be greater than 0");
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn resolve_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.resolve_cache_ttl_secs)
    }

    pub fn max_song_duration(&self) -> Duration {
        Duration::from_secs(self.max_song_duration)
    }

    pub fn early_end_tolerance(&self) -> Duration {
        Duration::from_secs(self.early_end_tolerance_secs)
    }

    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The Discord token is never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Scheduler: tick {}ms, backoff {}ms, teardown {}s\n  \
            Audio: {}Hz x{} s16le, pipe {} bytes\n  \
            Tools: ffmpeg={}, yt-dlp={} (cookies: {})\n  \
            Resolve: timeout {}s, cache {} entries / {}s\n  \
            Limits: {}s max duration",
            self.tick_interval_ms,
            self.error_backoff_ms,
            self.teardown_timeout_secs,
            self.sample_rate,
            self.channels,
            self.pcm_pipe_capacity,
            self.ffmpeg_path.display(),
            self.ytdlp_path.display(),
            self.ytdlp_cookies.is_some(),
            self.resolve_timeout_secs,
            self.resolve_cache_size,
            self.resolve_cache_ttl_secs,
            self.max_song_duration,
        )
    }
}

/// Lee una variable de entorno o usa el valor por defecto.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().parse()?),
        _ => Ok(default),
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: String::new(),

            tick_interval_ms: 100,
            error_backoff_ms: 1000,
            teardown_timeout_secs: 5,

            sample_rate: 48000, // Discord
            channels: 2,
            pcm_pipe_capacity: 64 * 1024,
            early_end_tolerance_secs: 3,

            ffmpeg_path: "ffmpeg".into(),
            ytdlp_path: "yt-dlp".into(),
            ytdlp_cookies: None,

            resolve_timeout_secs: 30,
            resolve_cache_size: 100,
            resolve_cache_ttl_secs: 3600,

            max_song_duration: 7200, // 2 horas
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_unsupported_sample_rate() {
        let config = Config {
            sample_rate: 44100,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_tick() {
        let config = Config {
            tick_interval_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn summary_hides_token() {
        let config = Config {
            discord_token: "super-secret".into(),
            ..Config::default()
        };
        assert!(!config.summary().contains("super-secret"));
    }
}

//! # Audio Module
//!
//! Reproducción por guild: colas, sesiones y el scheduler que las une.
//!
//! ## Architecture
//!
//! ### [`queue`] - Guild Queue
//! - Cola FIFO sin límite por guild
//! - Copias consistentes para listados paginados
//!
//! ### [`transcoder`] - Transcoding Pipeline
//! - ffmpeg como proceso externo, PCM s16le por un pipe acotado
//! - La cancelación mata el proceso y cierra el PCM
//!
//! ### [`session`] - Playback Session
//! - `Starting → Transmitting → Completed | Cancelled`, o `Failed`
//! - Una señal de cancelación por sesión
//!
//! ### [`scheduler`] - Playback Scheduler
//! - Un tick cada ~100ms recoge sesiones terminadas y promueve la siguiente
//! - Nunca más de una sesión por guild
//!
//! ### [`player`] - Playback Service
//! - Resolución, cache y mensajes de estado para los comandos
//!
//! ## Audio Quality
//!
//! - **Sample Rate**: 48kHz (Discord standard)
//! - **Bit Depth**: 16-bit signed integers
//! - **Channels**: Stereo (2 channels)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use guild_player::audio::player::PlaybackService;
//! use serenity::all::{ChannelId, GuildId, UserId};
//!
//! # async fn example(service: PlaybackService) -> anyhow::Result<()> {
//! let guild_id = GuildId::new(123456789);
//! let voice = ChannelId::new(1);
//! let status = ChannelId::new(2);
//!
//! service.play(guild_id, voice, status, UserId::new(3), "never gonna give you up").await?;
//! service.skip(guild_id, status, 1).await;
//! # Ok(())
//! # }
//! ```

pub mod player;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod transcoder;

#[cfg(test)]
pub(crate) mod testing;

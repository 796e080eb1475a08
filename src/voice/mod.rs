//! # Voice
//!
//! Colaboradores externos del scheduler, detrás de traits:
//!
//! - [`VoiceTransport`]: conexión al canal de voz y transmisión de PCM
//! - [`PermissionCheck`]: permisos `CONNECT` + `SPEAK` del bot
//! - [`StatusNotifier`]: mensajes al canal de texto de estado
//!
//! Las implementaciones reales usan songbird ([`transport`]) y serenity
//! ([`discord`]).

pub mod discord;
pub mod transport;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use tokio_util::sync::CancellationToken;

use crate::audio::transcoder::PcmStream;
use crate::error::{PermissionError, TransportError};

pub use discord::{DiscordNotifier, DiscordPermissions};
pub use transport::SongbirdTransport;

/// Conexión de voz ya establecida para un guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceConnection {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Conecta al canal, o reutiliza la conexión si ya está en él.
    async fn ensure_connected(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<VoiceConnection, TransportError>;

    /// Transmite el PCM hasta EOF o hasta que se cancele.
    ///
    /// Cancelar detiene el envío pero mantiene la conexión.
    async fn transmit(
        &self,
        connection: VoiceConnection,
        pcm: PcmStream,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), TransportError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionCheck: Send + Sync {
    async fn can_speak_and_connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<(), PermissionError>;
}

#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn post(&self, channel_id: ChannelId, message: String) -> anyhow::Result<()>;
}

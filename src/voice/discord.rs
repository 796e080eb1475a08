use async_trait::async_trait;
use serenity::all::{Cache, ChannelId, GuildId, Http, Permissions};
use std::sync::Arc;
use tracing::debug;

use super::{PermissionCheck, StatusNotifier};
use crate::error::PermissionError;

/// Envía los mensajes de estado como texto plano al canal.
pub struct DiscordNotifier {
    http: Arc<Http>,
}

impl DiscordNotifier {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl StatusNotifier for DiscordNotifier {
    async fn post(&self, channel_id: ChannelId, message: String) -> anyhow::Result<()> {
        channel_id.say(&self.http, message).await?;
        Ok(())
    }
}

/// Verifica `CONNECT` y `SPEAK` del bot con los datos de la caché.
pub struct DiscordPermissions {
    cache: Arc<Cache>,
}

impl DiscordPermissions {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl PermissionCheck for DiscordPermissions {
    async fn can_speak_and_connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<(), PermissionError> {
        let permissions = {
            let guild = self
                .cache
                .guild(guild_id)
                .ok_or_else(|| PermissionError::Unknown(format!("guild {} no está en caché", guild_id)))?;

            let channel = guild
                .channels
                .get(&channel_id)
                .ok_or(PermissionError::ChannelNotFound)?;

            let bot_id = self.cache.current_user().id;
            let member = guild
                .members
                .get(&bot_id)
                .ok_or_else(|| PermissionError::Unknown("el bot no es miembro del guild".into()))?;

            guild.user_permissions_in(channel, member)
        };

        debug!("🔒 Permisos en canal {}: {:?}", channel_id, permissions);
        check_voice_permissions(permissions)
    }
}

fn check_voice_permissions(permissions: Permissions) -> Result<(), PermissionError> {
    if !permissions.contains(Permissions::CONNECT) {
        return Err(PermissionError::MissingConnect);
    }
    if !permissions.contains(Permissions::SPEAK) {
        return Err(PermissionError::MissingSpeak);
    }
    Ok(())
}

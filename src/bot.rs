//! # Bot Module
//!
//! Eventos de Discord que afectan a la reproducción. Los comandos de
//! usuario llegan al [`PlaybackService`] guardado en los datos del cliente.

use serenity::{
    all::{ChannelId, Context, EventHandler, Ready, VoiceState},
    async_trait,
    prelude::TypeMapKey,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::audio::player::PlaybackService;

/// Llave del [`PlaybackService`] en `client.data`.
pub struct PlaybackServiceKey;

impl TypeMapKey for PlaybackServiceKey {
    type Value = Arc<PlaybackService>;
}

/// Manejador de eventos; el servicio se toma de `ctx.data`.
pub struct GuildPlayerBot;

async fn playback_service(ctx: &Context) -> Option<Arc<PlaybackService>> {
    ctx.data.read().await.get::<PlaybackServiceKey>().cloned()
}

#[async_trait]
impl EventHandler for GuildPlayerBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id {
            return;
        }

        let old_channel = old.and_then(|old| old.channel_id);
        let Some(guild_id) = new.guild_id else {
            return;
        };

        if removed_from_voice(old_channel, new.channel_id) {
            info!("🔌 Bot desconectado en guild {}", guild_id);

            let Some(service) = playback_service(&ctx).await else {
                warn!("Servicio de reproducción no disponible");
                return;
            };
            if let Err(e) = service.leave(guild_id).await {
                error!("Error al limpiar guild {}: {:?}", guild_id, e);
            }
        }
    }
}

/// El bot estaba en un canal y ya no está en ninguno.
fn removed_from_voice(old: Option<ChannelId>, new: Option<ChannelId>) -> bool {
    old.is_some() && new.is_none()
}

/// Limpieza periódica del cache de resoluciones.
pub async fn maintenance_tasks(service: Arc<PlaybackService>) {
    let mut interval = tokio::time::interval(Duration::from_secs(3600)); // Cada hora

    loop {
        interval.tick().await;
        service.cleanup_cache();
        info!("🧹 Tareas de mantenimiento completadas");
    }
}

use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::queue::{PlaybackRequest, QueueInfo};
use super::scheduler::{PlaybackScheduler, SkipOutcome};
use super::session::SessionState;
use crate::cache::ResolveCache;
use crate::error::{ResolveError, TransportError};
use crate::sources::{MediaDescriptor, SourceResolver};
use crate::voice::StatusNotifier;

/// Punto de entrada para los comandos: resuelve, encola y confirma.
///
/// La reproducción la maneja el [`PlaybackScheduler`]; aquí solo se traduce
/// cada comando a operaciones de cola y se avisa al canal de estado.
pub struct PlaybackService {
    scheduler: Arc<PlaybackScheduler>,
    resolver: Arc<dyn SourceResolver>,
    cache: ResolveCache,
    notifier: Arc<dyn StatusNotifier>,
    max_duration: Duration,
}

impl PlaybackService {
    pub fn new(
        scheduler: Arc<PlaybackScheduler>,
        resolver: Arc<dyn SourceResolver>,
        cache: ResolveCache,
        notifier: Arc<dyn StatusNotifier>,
        max_duration: Duration,
    ) -> Self {
        Self {
            scheduler,
            resolver,
            cache,
            notifier,
            max_duration,
        }
    }

    pub fn scheduler(&self) -> &Arc<PlaybackScheduler> {
        &self.scheduler
    }

    /// Resuelve `query` y la agrega a la cola del guild.
    ///
    /// Si la resolución falla no se crea nada en la cola; el error se
    /// publica tal cual y se devuelve para que quien llama decida si
    /// reintentar (solo tiene sentido con [`ResolveError::is_transient`]).
    pub async fn play(
        &self,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        status_channel_id: ChannelId,
        requested_by: UserId,
        query: &str,
    ) -> Result<usize, ResolveError> {
        let media = match self.resolve(query).await {
            Ok(media) => media,
            Err(e) => {
                warn!("❌ No se pudo resolver '{}' en guild {}: {}", query, guild_id, e);
                self.post(status_channel_id, format!("❌ {}", e)).await;
                return Err(e);
            }
        };

        let request = PlaybackRequest::new(
            guild_id,
            voice_channel_id,
            status_channel_id,
            requested_by,
            media,
        );
        let title = request.title().to_string();
        let position = self.scheduler.enqueue(request);

        self.post(
            status_channel_id,
            format!("✅ Agregado a la cola: **{}** (posición {})", title, position),
        )
        .await;
        Ok(position)
    }

    async fn resolve(&self, query: &str) -> Result<MediaDescriptor, ResolveError> {
        let media = match self.cache.get(query) {
            Some(media) => {
                info!("📦 Cache hit para '{}'", query);
                media
            }
            None => {
                let media = self.resolver.resolve(query).await?;
                self.cache.put(query, media.clone());
                media
            }
        };

        match media.duration() {
            Some(duration) if duration > self.max_duration => Err(ResolveError::TooLong {
                title: media.title().to_string(),
                duration,
                max: self.max_duration,
            }),
            _ => Ok(media),
        }
    }

    pub async fn skip(&self, guild_id: GuildId, status_channel_id: ChannelId, count: usize) -> SkipOutcome {
        let outcome = self.scheduler.skip(guild_id, count).await;

        let message = match outcome.total() {
            0 => "❌ No hay nada que saltar".to_string(),
            1 => "⏭️ Canción saltada".to_string(),
            n => format!("⏭️ {} canciones saltadas", n),
        };
        self.post(status_channel_id, message).await;
        outcome
    }

    /// Vacía la cola y detiene la canción actual. La conexión se mantiene.
    pub async fn stop(&self, guild_id: GuildId, status_channel_id: ChannelId) {
        self.scheduler.clear(guild_id);
        self.scheduler.skip(guild_id, 1).await;
        self.post(status_channel_id, "⏹️ Reproducción detenida".to_string())
            .await;
    }

    pub async fn clear(&self, guild_id: GuildId, status_channel_id: ChannelId) -> usize {
        let removed = self.scheduler.clear(guild_id);
        self.post(
            status_channel_id,
            format!("🗑️ Cola limpiada ({} canciones)", removed),
        )
        .await;
        removed
    }

    /// Sale del canal de voz descartando todo lo pendiente.
    pub async fn leave(&self, guild_id: GuildId) -> Result<(), TransportError> {
        self.scheduler.force_disconnect(guild_id).await
    }

    pub fn queue_info(&self, guild_id: GuildId) -> QueueInfo {
        self.scheduler.peek(guild_id)
    }

    pub fn now_playing(&self, guild_id: GuildId) -> Option<(PlaybackRequest, SessionState)> {
        self.scheduler.now_playing(guild_id)
    }

    pub fn cleanup_cache(&self) {
        self.cache.cleanup_old_entries();
    }

    async fn post(&self, channel_id: ChannelId, message: String) {
        if let Err(e) = self.notifier.post(channel_id, message).await {
            warn!("No se pudo enviar mensaje al canal {}: {:?}", channel_id, e);
        }
    }
}

use chrono::{DateTime, Utc};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{collections::VecDeque, time::Duration};
use tracing::info;

use crate::sources::MediaDescriptor;

/// Petición de reproducción ya resuelta. Inmutable.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackRequest {
    pub guild_id: GuildId,
    pub voice_channel_id: ChannelId,
    pub status_channel_id: ChannelId,
    pub requested_by: UserId,
    pub media: MediaDescriptor,
    pub added_at: DateTime<Utc>,
}

impl PlaybackRequest {
    pub fn new(
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        status_channel_id: ChannelId,
        requested_by: UserId,
        media: MediaDescriptor,
    ) -> Self {
        Self {
            guild_id,
            voice_channel_id,
            status_channel_id,
            requested_by,
            media,
            added_at: Utc::now(),
        }
    }

    pub fn title(&self) -> &str {
        self.media.title()
    }
}

/// Cola FIFO de un guild. Sin límite de tamaño.
#[derive(Debug, Default)]
pub struct GuildQueue {
    items: VecDeque<PlaybackRequest>,
}

impl GuildQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agrega al final y devuelve la posición (1 = siguiente)
    pub fn push(&mut self, request: PlaybackRequest) -> usize {
        info!("➕ Agregado a la cola: {}", request.title());
        self.items.push_back(request);
        self.items.len()
    }

    /// Obtiene el siguiente track (FIFO - First In, First Out)
    pub fn pop(&mut self) -> Option<PlaybackRequest> {
        let next = self.items.pop_front();
        if let Some(ref item) = next {
            info!("➡️ Siguiente en cola (FIFO): {}", item.title());
        }
        next
    }

    /// Descarta hasta `amount` peticiones desde el frente
    pub fn discard(&mut self, amount: usize) -> usize {
        let discarded = amount.min(self.items.len());
        self.items.drain(..discarded);
        discarded
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> impl Iterator<Item = &PlaybackRequest> {
        self.items.iter()
    }

    pub fn total_duration(&self) -> Duration {
        self.items.iter().filter_map(|item| item.media.duration()).sum()
    }
}

/// Copia consistente del estado de un guild.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub current: Option<PlaybackRequest>,
    pub items: Vec<PlaybackRequest>,
    pub total_items: usize,
    pub total_duration: Duration,
}

impl QueueInfo {
    pub fn empty() -> Self {
        Self {
            current: None,
            items: Vec::new(),
            total_items: 0,
            total_duration: Duration::ZERO,
        }
    }

    /// Obtiene una página específica de la cola
    pub fn get_page(&self, page: usize, items_per_page: usize) -> QueuePage {
        let items_per_page = items_per_page.max(1);
        let safe_page = page.max(1);
        let start = (safe_page - 1) * items_per_page;
        let end = (start + items_per_page).min(self.items.len());
        let total_pages = if self.total_items == 0 {
            1
        } else {
            self.total_items.div_ceil(items_per_page)
        };

        QueuePage {
            items: if start < self.items.len() {
                self.items[start..end].to_vec()
            } else {
                Vec::new()
            },
            current_page: safe_page,
            total_pages,
            total_items: self.total_items,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<PlaybackRequest>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

//! # Cache
//!
//! Cache de resoluciones: la misma consulta dentro del TTL devuelve el mismo
//! [`MediaDescriptor`] sin volver a consultar la fuente.
//!
//! ```env
//! RESOLVE_CACHE_SIZE=100        # Entradas máximas
//! RESOLVE_CACHE_TTL_SECS=3600   # Tiempo de vida (1 hora)
//! ```

pub mod lru_cache;

use lru_cache::LRUCache;
use std::time::Duration;
use tracing::info;

use crate::sources::MediaDescriptor;

/// Resoluciones recientes, por consulta normalizada.
#[derive(Debug, Clone)]
pub struct ResolveCache {
    entries: LRUCache<String, MediaDescriptor>,
}

impl ResolveCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LRUCache::new(capacity, ttl),
        }
    }

    fn key(query: &str) -> String {
        query.trim().to_lowercase()
    }

    pub fn get(&self, query: &str) -> Option<MediaDescriptor> {
        self.entries.get(&Self::key(query))
    }

    pub fn put(&self, query: &str, media: MediaDescriptor) {
        self.entries.insert(Self::key(query), media);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mantenimiento periódico: elimina entradas vencidas.
    pub fn cleanup_old_entries(&self) {
        let removed = self.entries.cleanup_expired();
        if removed > 0 {
            let metrics = self.entries.metrics();
            info!(
                "🧹 Cache: {} entradas expiradas eliminadas ({}/{}, hit rate {:.0}%)",
                removed,
                self.entries.len(),
                self.entries.capacity(),
                metrics.hit_rate() * 100.0
            );
        }
    }
}

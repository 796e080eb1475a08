//! Errores de reproducción.
//!
//! Cada error por petición es terminal: se reporta al canal de estado y la
//! cola avanza. Nada en este módulo se reintenta automáticamente.

use std::time::Duration;
use thiserror::Error;

/// Error al resolver una consulta o abrir su stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("No se encontraron resultados para: {0}")]
    NotFound(String),

    #[error("Referencia inválida: {0}")]
    InvalidReference(String),

    #[error("**{title}** dura {} (máximo {})", humantime::format_duration(*duration), humantime::format_duration(*max))]
    TooLong {
        title: String,
        duration: Duration,
        max: Duration,
    },

    #[error("La fuente no respondió, intenta de nuevo: {0}")]
    Transient(String),
}

impl ResolveError {
    /// Solo los fallos transitorios tienen sentido reintentarlos, y eso lo
    /// decide quien llama, nunca el scheduler.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("No encuentro el canal de voz")]
    ChannelNotFound,

    #[error("No tengo permiso para conectarme a ese canal")]
    MissingConnect,

    #[error("No tengo permiso para hablar en ese canal")]
    MissingSpeak,

    #[error("No pude verificar permisos: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Error al conectar al canal de voz: {0}")]
    Connect(String),

    #[error("Error de transmisión: {0}")]
    Transmit(String),

    #[error("No hay conexión de voz para este guild")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("No se pudo lanzar el transcodificador: {0}")]
    Launch(#[source] std::io::Error),

    #[error("El transcodificador terminó con código {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("Error de E/S en el transcodificador: {0}")]
    Io(#[from] std::io::Error),
}

/// Fallo de una petición concreta dentro del scheduler.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Resolution(#[from] ResolveError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Transcoder(#[from] TranscodeError),

    #[error("Error interno: {0}")]
    Internal(String),
}

impl PlaybackError {
    /// Texto para el canal de estado.
    ///
    /// Los errores de resolución y permisos se muestran tal cual; los de
    /// transporte, transcodificación e internos se resumen en un mensaje
    /// genérico y el detalle queda en los logs.
    pub fn user_message(&self, title: &str) -> String {
        match self {
            Self::Resolution(e) => format!("❌ {}", e),
            Self::Permission(e) => format!("🔒 {}", e),
            Self::Transport(_) | Self::Transcoder(_) | Self::Internal(_) => {
                format!("❌ No se pudo reproducir **{}**", title)
            }
        }
    }
}

//! Ciclo de vida de una sesión de reproducción.
//!
//! Una sesión nace en `Starting` en el momento en que el scheduler la
//! registra, y todo el arranque (permisos, conexión, stream de la fuente,
//! transcodificador) corre dentro de su propia tarea. El scheduler nunca
//! espera ese trabajo: solo consulta [`PlaybackSession::is_finished`] en cada
//! tick y, al terminar, llama a [`PlaybackSession::teardown`].
//!
//! ```text
//! Starting ──► Transmitting ──► Completed
//!    │               └────────► Cancelled
//!    └──► Failed
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::queue::PlaybackRequest;
use super::transcoder::{PcmFormat, Transcode, Transcoder};
use crate::error::PlaybackError;
use crate::sources::SourceResolver;
use crate::sources::MediaDescriptor;
use crate::voice::{PermissionCheck, StatusNotifier, VoiceTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Transmitting,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Cómo terminó una sesión que no falló.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    Completed,
    Cancelled,
    /// El PCM se cerró antes de la duración esperada. No se reintenta.
    EndedEarly { played: Duration, expected: Duration },
}

pub type SessionResult = Result<SessionEnd, PlaybackError>;

/// Dependencias compartidas por todas las sesiones.
pub struct SessionContext {
    pub resolver: Arc<dyn SourceResolver>,
    pub transcoder: Arc<dyn Transcoder>,
    pub transport: Arc<dyn VoiceTransport>,
    pub permissions: Arc<dyn PermissionCheck>,
    pub notifier: Arc<dyn StatusNotifier>,
    pub pcm_format: PcmFormat,
    pub early_end_tolerance: Duration,
}

/// Sesión activa de un guild.
///
/// Si se suelta sin `teardown`, la señal de cancelación se dispara igual.
pub struct PlaybackSession {
    request: PlaybackRequest,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
    transmission: JoinHandle<SessionResult>,
    _guard: DropGuard,
}

impl PlaybackSession {
    /// Registra la sesión en `Starting` y lanza su tarea. No bloquea.
    pub fn start(request: PlaybackRequest, ctx: Arc<SessionContext>) -> Self {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);

        let transmission = tokio::spawn(drive(request.clone(), ctx, cancel.clone(), state_tx));

        Self {
            request,
            _guard: cancel.clone().drop_guard(),
            cancel,
            state: state_rx,
            transmission,
        }
    }

    pub fn request(&self) -> &PlaybackRequest {
        &self.request
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.transmission.is_finished()
    }

    /// Cancela, espera el resultado de la transmisión y libera la sesión.
    ///
    /// Si la tarea no termina dentro de `timeout` se aborta; el proceso
    /// del transcodificador muere igual porque su señal ya fue cancelada.
    pub async fn teardown(self, timeout: Duration) -> SessionResult {
        self.cancel.cancel();

        let mut transmission = self.transmission;
        match tokio::time::timeout(timeout, &mut transmission).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => Err(PlaybackError::Internal(format!(
                "la sesión de '{}' entró en pánico",
                self.request.title()
            ))),
            Ok(Err(e)) => Err(PlaybackError::Internal(e.to_string())),
            Err(_) => {
                warn!(
                    "⏰ La sesión de '{}' no terminó en {:?}, abortando",
                    self.request.title(),
                    timeout
                );
                transmission.abort();
                Err(PlaybackError::Internal("timeout al cerrar la sesión".into()))
            }
        }
    }
}

async fn drive(
    request: PlaybackRequest,
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
) -> SessionResult {
    let result = run(&request, &ctx, &cancel, &state).await;

    let final_state = match &result {
        Ok(SessionEnd::Cancelled) => SessionState::Cancelled,
        Ok(_) => SessionState::Completed,
        Err(_) => SessionState::Failed,
    };
    state.send_replace(final_state);
    debug!("Sesión '{}' terminó en {:?}", request.title(), final_state);

    result
}

async fn run(
    request: &PlaybackRequest,
    ctx: &SessionContext,
    cancel: &CancellationToken,
    state: &watch::Sender<SessionState>,
) -> SessionResult {
    let guild_id = request.guild_id;
    let channel_id = request.voice_channel_id;

    let starting = async {
        ctx.permissions.can_speak_and_connect(guild_id, channel_id).await?;
        let connection = ctx.transport.ensure_connected(guild_id, channel_id).await?;
        let source = ctx.resolver.open_stream(&request.media).await?;
        Ok::<_, PlaybackError>((connection, source))
    };

    let (connection, source) = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        started = starting => started?,
    };

    let Transcode { pcm, task } = ctx.transcoder.start(source, cancel.child_token());
    let meter = pcm.meter();

    state.send_replace(SessionState::Transmitting);
    info!("🎵 Reproduciendo '{}' en guild {}", request.title(), guild_id);
    announce(ctx, request);

    let transmitted = ctx.transport.transmit(connection, pcm, cancel.clone()).await;
    let cancelled = cancel.is_cancelled();

    // Sin transmisión el proceso sobra
    if cancelled || transmitted.is_err() {
        task.cancel();
    }
    let transcoded = task.wait().await;

    if cancelled {
        return Ok(SessionEnd::Cancelled);
    }
    transmitted?;
    transcoded?;

    let played = ctx.pcm_format.duration_of(meter.bytes());
    if let Some(expected) = request.media.duration() {
        if played + ctx.early_end_tolerance < expected {
            warn!(
                "⚠️ '{}' terminó antes de tiempo: {:?} de {:?}",
                request.title(),
                played,
                expected
            );
            return Ok(SessionEnd::EndedEarly { played, expected });
        }
    }

    Ok(SessionEnd::Completed)
}

/// Mensaje de "reproduciendo"; la miniatura va en su propia línea para que
/// Discord la muestre.
pub fn now_playing_message(media: &MediaDescriptor) -> String {
    let mut message = format!("🎵 Reproduciendo: **{}**", media.title());
    if let Some(artist) = media.artist() {
        message.push_str(&format!(" de {}", artist));
    }
    if let Some(thumbnail) = media.thumbnail() {
        message.push('\n');
        message.push_str(thumbnail);
    }
    message
}

fn announce(ctx: &SessionContext, request: &PlaybackRequest) {
    let notifier = ctx.notifier.clone();
    let channel_id = request.status_channel_id;
    let message = now_playing_message(&request.media);
    tokio::spawn(async move {
        if let Err(e) = notifier.post(channel_id, message).await {
            warn!("No se pudo enviar mensaje al canal {}: {:?}", channel_id, e);
        }
    });
}

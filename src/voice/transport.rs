use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    error::JoinError,
    input::{Input, RawAdapter},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::io::Read;
use std::sync::Arc;
use symphonia::core::io::ReadOnlySource;
use tokio::sync::oneshot;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{VoiceConnection, VoiceTransport};
use crate::audio::transcoder::{PcmFormat, PcmStream};
use crate::error::TransportError;

/// Transporte de voz sobre songbird.
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    format: PcmFormat,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, format: PcmFormat) -> Self {
        Self { manager, format }
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn ensure_connected(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<VoiceConnection, TransportError> {
        let connection = VoiceConnection {
            guild_id,
            channel_id,
        };

        if let Some(call) = self.manager.get(guild_id) {
            let current = call.lock().await.current_channel();
            if current == Some(songbird::id::ChannelId::from(channel_id)) {
                debug!("🔗 Reutilizando conexión de voz en guild {}", guild_id);
                return Ok(connection);
            }
        }

        info!("🔗 Conectando al canal {} en guild {}", channel_id, guild_id);
        self.manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(connection)
    }

    async fn transmit(
        &self,
        connection: VoiceConnection,
        pcm: PcmStream,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let call = self
            .manager
            .get(connection.guild_id)
            .ok_or(TransportError::NotConnected)?;

        // songbird lee en sus propios hilos: puente síncrono + s16 → f32
        let reader = PcmF32Reader::new(SyncIoBridge::new(pcm));
        let input: Input = RawAdapter::new(
            ReadOnlySource::new(reader),
            self.format.sample_rate,
            self.format.channels as u32,
        )
        .into();

        let (tx, rx) = oneshot::channel();
        let signal = TrackEndSignal {
            tx: Arc::new(Mutex::new(Some(tx))),
        };

        let track = call.lock().await.play_only_input(input);

        for event in [TrackEvent::End, TrackEvent::Error] {
            track
                .add_event(Event::Track(event), signal.clone())
                .map_err(|e| TransportError::Transmit(format!("Error al agregar event handler: {}", e)))?;
        }

        tokio::select! {
            ended = rx => match ended {
                Ok(Ok(())) => Ok(()),
                Ok(Err(reason)) => Err(TransportError::Transmit(reason)),
                Err(_) => Err(TransportError::Transmit("el track se soltó sin terminar".into())),
            },
            _ = cancel.cancelled() => {
                // Solo se detiene el track; la llamada sigue conectada
                let _ = track.stop();
                Ok(())
            }
        }
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), TransportError> {
        match self.manager.remove(guild_id).await {
            Ok(()) | Err(JoinError::NoCall) => {
                info!("👋 Desconectado del canal de voz en guild {}", guild_id);
                Ok(())
            }
            Err(e) => Err(TransportError::Connect(e.to_string())),
        }
    }
}

/// Avisa una sola vez del fin (o error) del track.
#[derive(Clone)]
struct TrackEndSignal {
    tx: Arc<Mutex<Option<oneshot::Sender<Result<(), String>>>>>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndSignal {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let outcome = match ctx {
            EventContext::Track(tracks) => tracks
                .iter()
                .find_map(|(state, _)| match &state.playing {
                    songbird::tracks::PlayMode::Errored(e) => Some(Err(e.to_string())),
                    _ => None,
                })
                .unwrap_or(Ok(())),
            _ => Ok(()),
        };

        if let Err(reason) = &outcome {
            warn!("❌ Error en track: {}", reason);
        }

        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome);
        }

        // Quitar el handler después de disparar
        Some(Event::Cancel)
    }
}

/// Convierte PCM s16le a f32le, que es lo que consume `RawAdapter`.
pub struct PcmF32Reader<R> {
    inner: R,
    carry: Option<u8>,
    scratch: Vec<u8>,
    out: Vec<u8>,
    pos: usize,
}

impl<R: Read> PcmF32Reader<R> {
    const MAX_CHUNK: usize = 8192;

    pub fn new(inner: R) -> Self {
        Self {
            inner,
            carry: None,
            scratch: Vec::new(),
            out: Vec::new(),
            pos: 0,
        }
    }

    /// Lee un bloque de s16 y lo deja convertido en `out`.
    /// Devuelve `false` en EOF.
    fn refill(&mut self, hint: usize) -> std::io::Result<bool> {
        self.out.clear();
        self.pos = 0;

        let want = (hint / 2).clamp(2, Self::MAX_CHUNK);
        self.scratch.resize(want, 0);

        let mut start = 0;
        if let Some(byte) = self.carry.take() {
            self.scratch[0] = byte;
            start = 1;
        }

        let n = self.inner.read(&mut self.scratch[start..])?;
        if n == 0 {
            // Un byte suelto al final no forma muestra
            return Ok(false);
        }

        let total = start + n;
        let even = total - total % 2;
        if total % 2 == 1 {
            self.carry = Some(self.scratch[total - 1]);
        }

        for pair in self.scratch[..even].chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
            self.out.extend_from_slice(&sample.to_le_bytes());
        }

        Ok(true)
    }
}

impl<R: Read> Read for PcmF32Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pos >= self.out.len() {
            if !self.refill(buf.len())? {
                return Ok(0);
            }
        }

        let n = (self.out.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

//! Dobles de prueba para el pipeline de reproducción.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

use super::queue::PlaybackRequest;
use super::scheduler::PlaybackScheduler;
use super::session::SessionContext;
use super::transcoder::{PcmFormat, PcmStream, Transcode, TranscodeExit, TranscodeTask, Transcoder};
use crate::error::{PermissionError, ResolveError, TransportError};
use crate::sources::{ByteStream, MediaDescriptor, SourceResolver, SourceType};
use crate::voice::{PermissionCheck, StatusNotifier, VoiceConnection, VoiceTransport};

const PIPE: usize = 4096;

pub fn guild(n: u64) -> GuildId {
    GuildId::new(n)
}

pub fn status_channel(n: u64) -> ChannelId {
    ChannelId::new(1000 + n)
}

pub fn voice_channel(n: u64) -> ChannelId {
    ChannelId::new(500 + n)
}

pub fn media(title: &str) -> MediaDescriptor {
    MediaDescriptor::new(title, format!("fake://{}", title), SourceType::YouTube)
}

pub fn request(guild_n: u64, title: &str) -> PlaybackRequest {
    PlaybackRequest::new(
        guild(guild_n),
        voice_channel(guild_n),
        status_channel(guild_n),
        UserId::new(7),
        media(title),
    )
}

/// Espera hasta que `condition` se cumpla; falla a los 5 segundos.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "la condición no se cumplió a tiempo");
}

#[derive(Default)]
struct Streams {
    writers: HashMap<String, DuplexStream>,
    finished: HashSet<String>,
}

/// Fuente en memoria: cada título abre un pipe que sigue abierto hasta
/// `finish_source`.
#[derive(Default)]
pub struct FakeResolver {
    streams: Mutex<Streams>,
    held: Mutex<HashSet<String>>,
    panics: Mutex<HashSet<String>>,
    open_failures: Mutex<HashMap<String, ResolveError>>,
    resolve_failures: Mutex<HashMap<String, ResolveError>>,
    durations: Mutex<HashMap<String, Duration>>,
    resolves: AtomicUsize,
}

impl FakeResolver {
    pub fn hold_open(&self, title: &str) {
        self.held.lock().insert(title.to_string());
    }

    pub fn fail_open(&self, title: &str, error: ResolveError) {
        self.open_failures.lock().insert(title.to_string(), error);
    }

    pub fn panic_open(&self, title: &str) {
        self.panics.lock().insert(title.to_string());
    }

    pub fn fail_resolve(&self, query: &str, error: ResolveError) {
        self.resolve_failures.lock().insert(query.to_string(), error);
    }

    pub fn set_duration(&self, query: &str, duration: Duration) {
        self.durations.lock().insert(query.to_string(), duration);
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    /// Cierra el stream del título (EOF). Si todavía no se abrió, se abrirá
    /// ya cerrado.
    pub fn finish(&self, title: &str) {
        let mut streams = self.streams.lock();
        streams.finished.insert(title.to_string());
        streams.writers.remove(title);
    }
}

#[async_trait]
impl SourceResolver for FakeResolver {
    async fn resolve(&self, query: &str) -> Result<MediaDescriptor, ResolveError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.resolve_failures.lock().get(query) {
            return Err(error.clone());
        }

        let mut descriptor = media(query);
        if let Some(duration) = self.durations.lock().get(query) {
            descriptor = descriptor.with_duration(*duration);
        }
        Ok(descriptor)
    }

    async fn open_stream(&self, media: &MediaDescriptor) -> Result<ByteStream, ResolveError> {
        let title = media.title().to_string();

        if self.panics.lock().contains(&title) {
            panic!("fuente rota: {}", title);
        }
        if let Some(error) = self.open_failures.lock().get(&title) {
            return Err(error.clone());
        }
        let held = self.held.lock().contains(&title);
        if held {
            std::future::pending::<()>().await;
        }

        let (writer, reader) = tokio::io::duplex(PIPE);
        {
            let mut streams = self.streams.lock();
            if !streams.finished.contains(&title) {
                streams.writers.insert(title, writer);
            }
        }
        Ok(Box::new(reader))
    }

    fn is_valid_url(&self, url: &str) -> bool {
        url.starts_with("fake://")
    }

    fn source_name(&self) -> &'static str {
        "fake"
    }
}

#[derive(Default)]
struct TranscoderStats {
    started: AtomicUsize,
    running: AtomicUsize,
    terminated: AtomicUsize,
}

/// Copia la fuente al PCM sin convertir nada.
#[derive(Default)]
pub struct FakeTranscoder {
    stats: Arc<TranscoderStats>,
}

impl FakeTranscoder {
    pub fn started(&self) -> usize {
        self.stats.started.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.stats.running.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.stats.terminated.load(Ordering::SeqCst)
    }
}

impl Transcoder for FakeTranscoder {
    fn start(&self, mut source: ByteStream, cancel: CancellationToken) -> Transcode {
        let (mut writer, pcm) = PcmStream::pipe(PIPE);
        let stats = self.stats.clone();
        stats.started.fetch_add(1, Ordering::SeqCst);
        stats.running.fetch_add(1, Ordering::SeqCst);

        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let exit = tokio::select! {
                _ = task_cancel.cancelled() => {
                    stats.terminated.fetch_add(1, Ordering::SeqCst);
                    TranscodeExit::Terminated
                }
                copied = tokio::io::copy(&mut source, &mut writer) => match copied {
                    Ok(_) => TranscodeExit::Finished,
                    Err(_) => TranscodeExit::Terminated,
                },
            };
            drop(writer);
            stats.running.fetch_sub(1, Ordering::SeqCst);
            Ok(exit)
        });

        Transcode {
            pcm,
            task: TranscodeTask::new(handle, cancel),
        }
    }
}

/// Transporte que consume el PCM y lleva la cuenta de todo.
#[derive(Default)]
pub struct FakeTransport {
    connected: Mutex<HashSet<GuildId>>,
    active: Mutex<HashMap<GuildId, usize>>,
    max_concurrent: AtomicUsize,
    connects: AtomicUsize,
    transmissions: AtomicUsize,
    disconnects: AtomicUsize,
    cancel_delay: Mutex<Duration>,
}

impl FakeTransport {
    /// Tras una cancelación, `transmit` tarda `delay` en volver
    pub fn set_cancel_delay(&self, delay: Duration) {
        *self.cancel_delay.lock() = delay;
    }

    pub fn is_connected(&self, guild_id: GuildId) -> bool {
        self.connected.lock().contains(&guild_id)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn transmissions(&self) -> usize {
        self.transmissions.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Máximo de transmisiones simultáneas observado en un mismo guild
    pub fn max_concurrent_per_guild(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn ensure_connected(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<VoiceConnection, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.lock().insert(guild_id);
        Ok(VoiceConnection {
            guild_id,
            channel_id,
        })
    }

    async fn transmit(
        &self,
        connection: VoiceConnection,
        mut pcm: PcmStream,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let guild_id = connection.guild_id;
        {
            let mut active = self.active.lock();
            let count = active.entry(guild_id).or_default();
            *count += 1;
            self.max_concurrent.fetch_max(*count, Ordering::SeqCst);
        }
        self.transmissions.fetch_add(1, Ordering::SeqCst);

        let mut sink = tokio::io::sink();
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                let delay = *self.cancel_delay.lock();
                tokio::time::sleep(delay).await;
                Ok(())
            }
            copied = tokio::io::copy(&mut pcm, &mut sink) => copied
                .map(|_| ())
                .map_err(|e| TransportError::Transmit(e.to_string())),
        };

        if let Some(count) = self.active.lock().get_mut(&guild_id) {
            *count -= 1;
        }
        result
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.lock().remove(&guild_id);
        Ok(())
    }
}

pub struct AllowAll;

#[async_trait]
impl PermissionCheck for AllowAll {
    async fn can_speak_and_connect(&self, _: GuildId, _: ChannelId) -> Result<(), PermissionError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(ChannelId, String)>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    /// Todos los envíos siguientes fallan
    pub fn fail_posts(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<(ChannelId, String)> {
        self.messages.lock().clone()
    }

    pub fn has_message(&self, channel_id: ChannelId, text: &str) -> bool {
        self.messages
            .lock()
            .iter()
            .any(|(channel, message)| *channel == channel_id && message == text)
    }

    pub async fn wait_for_message(&self, channel_id: ChannelId, text: &str) {
        wait_until(|| self.has_message(channel_id, text)).await;
    }
}

#[async_trait]
impl StatusNotifier for RecordingNotifier {
    async fn post(&self, channel_id: ChannelId, message: String) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("canal no disponible");
        }
        self.messages.lock().push((channel_id, message));
        Ok(())
    }
}

/// Conjunto de fakes listo para armar sesiones y schedulers.
pub struct Harness {
    pub resolver: Arc<FakeResolver>,
    pub transcoder: Arc<FakeTranscoder>,
    pub transport: Arc<FakeTransport>,
    pub notifier: Arc<RecordingNotifier>,
    permissions: Arc<dyn PermissionCheck>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_permission_check(Arc::new(AllowAll))
    }

    pub fn with_permissions(permissions: crate::voice::MockPermissionCheck) -> Self {
        Self::with_permission_check(Arc::new(permissions))
    }

    fn with_permission_check(permissions: Arc<dyn PermissionCheck>) -> Self {
        Self {
            resolver: Arc::default(),
            transcoder: Arc::default(),
            transport: Arc::default(),
            notifier: Arc::default(),
            permissions,
        }
    }

    pub fn context(&self) -> Arc<SessionContext> {
        Arc::new(SessionContext {
            resolver: self.resolver.clone(),
            transcoder: self.transcoder.clone(),
            transport: self.transport.clone(),
            permissions: self.permissions.clone(),
            notifier: self.notifier.clone(),
            pcm_format: PcmFormat::default(),
            early_end_tolerance: Duration::from_secs(3),
        })
    }

    pub fn scheduler(&self) -> PlaybackScheduler {
        PlaybackScheduler::new(self.context(), Duration::from_secs(5))
    }

    pub async fn wait_transmitting(&self, count: usize) {
        wait_until(|| self.transport.transmissions() >= count).await;
    }

    pub fn finish_source(&self, title: &str) {
        self.resolver.finish(title);
    }
}

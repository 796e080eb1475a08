//! Transcodificación a PCM con un proceso externo (ffmpeg).
//!
//! El audio original entra por stdin del proceso y el PCM sale por stdout
//! hacia un pipe en memoria acotado ([`PcmStream`]). Si quien lee va lento,
//! el pipe se llena, la copia se detiene y ffmpeg queda bloqueado escribiendo:
//! la memoria usada nunca supera la capacidad del pipe.

use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TranscodeError;
use crate::sources::ByteStream;

/// Formato del PCM de salida: s16le intercalado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub const BYTES_PER_SAMPLE: u64 = 2;

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * Self::BYTES_PER_SAMPLE
    }

    /// Duración de audio que representan `bytes` de PCM
    pub fn duration_of(&self, bytes: u64) -> Duration {
        Duration::from_secs_f64(bytes as f64 / self.bytes_per_second() as f64)
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
        }
    }
}

/// Extremo lector del pipe de PCM.
///
/// Cuenta los bytes leídos para saber cuánto audio llegó realmente a la
/// transmisión. Devuelve EOF cuando el transcodificador termina o se cancela.
#[derive(Debug)]
pub struct PcmStream {
    inner: DuplexStream,
    read: Arc<AtomicU64>,
}

impl PcmStream {
    /// Crea un pipe acotado: el escritor es para el transcodificador.
    pub fn pipe(capacity: usize) -> (DuplexStream, PcmStream) {
        let (writer, reader) = tokio::io::duplex(capacity);
        let stream = PcmStream {
            inner: reader,
            read: Arc::new(AtomicU64::new(0)),
        };
        (writer, stream)
    }

    pub fn meter(&self) -> PcmMeter {
        PcmMeter(self.read.clone())
    }
}

impl AsyncRead for PcmStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let n = (buf.filled().len() - before) as u64;
            self.read.fetch_add(n, Ordering::Relaxed);
        }
        poll
    }
}

/// Contador compartido de bytes de PCM consumidos.
#[derive(Debug, Clone)]
pub struct PcmMeter(Arc<AtomicU64>);

impl PcmMeter {
    pub fn bytes(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Cómo terminó el proceso.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeExit {
    /// Salió por sí mismo con éxito
    Finished,
    /// Fue terminado por cancelación
    Terminated,
}

/// Tarea de fondo que alimenta el proceso, vacía su salida y lo recoge.
#[derive(Debug)]
pub struct TranscodeTask {
    handle: JoinHandle<Result<TranscodeExit, TranscodeError>>,
    cancel: CancellationToken,
}

impl TranscodeTask {
    pub fn new(
        handle: JoinHandle<Result<TranscodeExit, TranscodeError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { handle, cancel }
    }

    /// Mata el proceso y cierra el PCM. Idempotente.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Espera a que el proceso haya terminado y sido recogido.
    pub async fn wait(self) -> Result<TranscodeExit, TranscodeError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(TranscodeError::Io(std::io::Error::other(e))),
        }
    }
}

/// Resultado de `Transcoder::start`.
#[derive(Debug)]
pub struct Transcode {
    pub pcm: PcmStream,
    pub task: TranscodeTask,
}

/// Motor externo que convierte audio arbitrario a PCM.
///
/// `start` nunca falla directamente: los errores de lanzamiento y de salida
/// se entregan a través de [`TranscodeTask::wait`], y en ese caso el PCM se
/// cierra sin datos.
pub trait Transcoder: Send + Sync {
    fn start(&self, source: ByteStream, cancel: CancellationToken) -> Transcode;
}

/// Transcodificador basado en ffmpeg (o cualquier programa stdin → stdout).
pub struct FfmpegTranscoder {
    program: PathBuf,
    args: Vec<String>,
    pipe_capacity: usize,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>, format: PcmFormat, pipe_capacity: usize) -> Self {
        Self {
            program: program.into(),
            args: Self::ffmpeg_args(format),
            pipe_capacity,
        }
    }

    /// Programa arbitrario con argumentos propios
    pub fn with_command(program: impl Into<PathBuf>, args: Vec<String>, pipe_capacity: usize) -> Self {
        Self {
            program: program.into(),
            args,
            pipe_capacity,
        }
    }

    fn ffmpeg_args(format: PcmFormat) -> Vec<String> {
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-vn",
            "-f",
            "s16le",
            "-acodec",
            "pcm_s16le",
            "-ar",
            &format.sample_rate.to_string(),
            "-ac",
            &format.channels.to_string(),
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl Transcoder for FfmpegTranscoder {
    fn start(&self, source: ByteStream, cancel: CancellationToken) -> Transcode {
        let (writer, pcm) = PcmStream::pipe(self.pipe_capacity);

        let spawned = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let handle = match spawned {
            Ok(child) => {
                debug!("🎛️ Transcodificador iniciado (pid {:?})", child.id());
                tokio::spawn(run_process(child, source, writer, cancel.clone()))
            }
            Err(e) => {
                warn!("❌ No se pudo lanzar {}: {}", self.program.display(), e);
                // El escritor se suelta aquí: el lector ve EOF de inmediato
                drop(writer);
                tokio::spawn(async move { Err(TranscodeError::Launch(e)) })
            }
        };

        Transcode {
            pcm,
            task: TranscodeTask::new(handle, cancel),
        }
    }
}

const STDERR_LIMIT: u64 = 4096;

async fn run_process(
    mut child: tokio::process::Child,
    mut source: ByteStream,
    mut writer: DuplexStream,
    cancel: CancellationToken,
) -> Result<TranscodeExit, TranscodeError> {
    let mut stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let feed = async move {
        if let Some(stdin) = stdin.as_mut() {
            let copied = tokio::io::copy(&mut source, stdin).await;
            let _ = stdin.shutdown().await;
            copied
        } else {
            Ok(0)
        }
        // stdin se suelta al salir: el proceso ve EOF
    };

    let drain = async move {
        let copied = match stdout {
            Some(mut stdout) => tokio::io::copy(&mut stdout, &mut writer).await,
            None => Ok(0),
        };
        let _ = writer.shutdown().await;
        copied
        // writer se suelta al salir: el lector del PCM ve EOF
    };

    let collect_stderr = async move {
        let mut text = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = (&mut stderr).take(STDERR_LIMIT).read_to_end(&mut text).await;
            // El resto se descarta para que el proceso no se bloquee escribiendo
            let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
        }
        String::from_utf8_lossy(&text).into_owned()
    };

    // Termina cuando el proceso cierra su salida; la alimentación puede
    // quedar pendiente si la fuente no llega a EOF.
    let pump = async move {
        tokio::pin!(feed);
        let output = async move { tokio::join!(drain, collect_stderr) };
        tokio::pin!(output);

        let mut fed = Ok(0);
        let mut feeding = true;
        loop {
            tokio::select! {
                result = &mut feed, if feeding => {
                    feeding = false;
                    fed = result;
                }
                (drained, stderr_text) = &mut output => break (fed, drained, stderr_text),
            }
        }
    };

    let pumped = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = pump => Some(result),
    };

    let Some((fed, drained, stderr_text)) = pumped else {
        terminate(&mut child).await;
        return Ok(TranscodeExit::Terminated);
    };

    if let Err(e) = &fed {
        // El proceso puede cerrar stdin antes de consumir todo (p. ej. -t)
        debug!("Alimentación del transcodificador cortada: {}", e);
    }
    if let Err(e) = &drained {
        // El lector del PCM se soltó: ya no hace falta el proceso
        debug!("Salida del transcodificador sin lector: {}", e);
        terminate(&mut child).await;
        return Ok(TranscodeExit::Terminated);
    }

    let status: ExitStatus = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            terminate(&mut child).await;
            return Ok(TranscodeExit::Terminated);
        }
        status = child.wait() => status?,
    };

    if status.success() {
        Ok(TranscodeExit::Finished)
    } else {
        Err(TranscodeError::Exit {
            code: status.code(),
            stderr: stderr_text.trim().to_string(),
        })
    }
}

/// Mata el proceso si sigue vivo y lo recoge.
async fn terminate(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        // Ya había salido
        debug!("start_kill: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("No se pudo recoger el transcodificador: {}", e);
    }
}

use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use guild_player::audio::player::PlaybackService;
use guild_player::audio::scheduler::{IntervalTicker, PlaybackScheduler};
use guild_player::audio::session::SessionContext;
use guild_player::audio::transcoder::FfmpegTranscoder;
use guild_player::bot::{self, GuildPlayerBot, PlaybackServiceKey};
use guild_player::cache::ResolveCache;
use guild_player::config::Config;
use guild_player::sources::{direct_url::DirectUrlClient, ytdlp::YtDlpClient, SmartSource};
use guild_player::voice::{DiscordNotifier, DiscordPermissions, SongbirdTransport};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_player=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Guild Player v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("⚙️ {}", config.summary());

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let manager = Songbird::serenity();
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(GuildPlayerBot)
        .register_songbird_with(manager.clone())
        .await?;

    // Fuentes: URLs directas por HTTP, todo lo demás por yt-dlp
    let resolver = Arc::new(SmartSource::new(
        Arc::new(YtDlpClient::new(
            config.ytdlp_path.clone(),
            config.ytdlp_cookies.clone(),
            config.resolve_timeout(),
        )),
        Arc::new(DirectUrlClient::new()),
    ));

    let notifier = Arc::new(DiscordNotifier::new(client.http.clone()));
    let context = Arc::new(SessionContext {
        resolver: resolver.clone(),
        transcoder: Arc::new(FfmpegTranscoder::new(
            config.ffmpeg_path.clone(),
            config.pcm_format(),
            config.pcm_pipe_capacity,
        )),
        transport: Arc::new(SongbirdTransport::new(manager, config.pcm_format())),
        permissions: Arc::new(DiscordPermissions::new(client.cache.clone())),
        notifier: notifier.clone(),
        pcm_format: config.pcm_format(),
        early_end_tolerance: config.early_end_tolerance(),
    });

    let scheduler = Arc::new(PlaybackScheduler::new(context, config.teardown_timeout()));
    let service = Arc::new(PlaybackService::new(
        scheduler.clone(),
        resolver,
        ResolveCache::new(config.resolve_cache_size, config.resolve_cache_ttl()),
        notifier,
        config.max_song_duration(),
    ));

    {
        let mut data = client.data.write().await;
        data.insert::<PlaybackServiceKey>(service.clone());
    }

    let shutdown = CancellationToken::new();
    let scheduler_task = {
        let shutdown = shutdown.clone();
        let ticker = IntervalTicker::new(config.tick_interval());
        let backoff = config.error_backoff();
        tokio::spawn(async move { scheduler.run(ticker, shutdown, backoff).await })
    };
    tokio::spawn(bot::maintenance_tasks(service));

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Error al registrar Ctrl+C: {:?}", e);
                return;
            }
            info!("⚠️ Señal de shutdown recibida, cerrando...");
            shutdown.cancel();
            shard_manager.shutdown_all().await;
        });
    }

    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        error!("El scheduler terminó con error: {:?}", e);
    }

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    let ytdlp = runs(&config.ytdlp_path, "--version").await;
    let ffmpeg = runs(&config.ffmpeg_path, "-version").await;

    if ytdlp && ffmpeg {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes (yt-dlp: {}, ffmpeg: {})", ytdlp, ffmpeg);
    }
}

async fn runs(program: &Path, arg: &str) -> bool {
    Command::new(program)
        .arg(arg)
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

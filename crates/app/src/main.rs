use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use voxbridge_app::allowlist::Allowlist;
use voxbridge_app::calls::{CallManager, CallsConfig};
use voxbridge_app::config::Config;
use voxbridge_app::registry::CallRegistry;
use voxbridge_app::server;
use voxbridge_app::webhook::WebhookNotifier;
use voxbridge_asr::AsrConfig;
use voxbridge_switch::{SwitchClient, SwitchConfig};
use voxbridge_tts::{TtsClient, TtsConfig};

#[derive(Parser, Debug)]
#[command(name = "voxbridge", about = "Real-time voice-call mediation service")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "voxbridge.toml")]
    config: PathBuf,
}

fn init_logging() -> anyhow::Result<()> {
    std::fs::create_dir_all("logs")?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, "logs", "voxbridge.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout.and(non_blocking_file))
        .with_env_filter(log_level)
        .init();

    // Keep the appender guard alive for the life of the process.
    std::mem::forget(guard);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    tracing::info!(
        switch = %config.switch.url,
        app = %config.switch.app,
        "starting voxbridge"
    );

    let switch = Arc::new(SwitchClient::new(SwitchConfig {
        url: config.switch.url.clone(),
        username: config.switch.username.clone(),
        password: config.switch.password.clone(),
        app: config.switch.app.clone(),
    }));

    let allowlist = match &config.allowlist.path {
        Some(path) => Allowlist::load(path)
            .with_context(|| format!("loading allowlist from {}", path.display()))?,
        None => Allowlist::allow_all(),
    };

    let tts = TtsClient::new(TtsConfig {
        url: config.tts.url.clone(),
        default_voice: config.tts.default_voice.clone(),
        default_language: config.tts.default_language.clone(),
        timeout: config.tts_timeout(),
    });
    if config.tts.url.is_none() {
        tracing::warn!("no TTS URL configured; speak operations will return 501");
    }

    let asr_cfg = config
        .asr
        .as_ref()
        .map(|asr| AsrConfig::new(asr.url.clone(), asr.language.clone()));
    if asr_cfg.is_none() {
        tracing::warn!("no ASR URL configured; calls will run without transcription");
    }

    let registry = CallRegistry::new();
    let manager = CallManager::new(
        switch.clone(),
        registry.clone(),
        allowlist,
        tts,
        asr_cfg,
        CallsConfig {
            ring_delay: config.ring_delay(),
            greeting_media: config.inbound.greeting_media.clone(),
            beep_media: config.inbound.beep_media.clone(),
            ..CallsConfig::default()
        },
    );

    let _webhook = WebhookNotifier::spawn(config.webhook.url.clone(), &registry);

    // Switch event link + dispatch loop.
    let events = switch.start_events();
    let dispatch_manager = manager.clone();
    let dispatch = tokio::spawn(async move { dispatch_manager.run(events).await });

    // Admin surface + event stream.
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding admin server to {addr}"))?;
    tracing::info!(%addr, "admin server listening");
    let app = server::router(manager.clone(), config.server.api_key.clone());
    let serve = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("admin server error: {e}");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    tracing::info!("shutdown signal received");

    manager.shutdown().await;
    dispatch.abort();
    serve.abort();
    tracing::info!("shutdown complete");
    Ok(())
}

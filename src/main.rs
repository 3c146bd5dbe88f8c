use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtwatch::config::{AppConfig, MediaConfig, DEFAULT_QUEUE_CAPACITY};
use rtwatch::error::AppError;
use rtwatch::media::{self, FlushGate, SampleEmitter, SourceKind};
use rtwatch::playback::PlaybackController;
use rtwatch::state::AppState;
use rtwatch::web;
use rtwatch::webrtc::{
    MdnsMode, OutboundTracks, SampleBridge, SamplePump, TimingMode, TurnServer, WebRtcPeerFactory,
};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// rtwatch command line arguments
#[derive(Parser, Debug)]
#[command(name = "rtwatch")]
#[command(version, about = "Watch a media file together over WebRTC", long_about = None)]
struct CliArgs {
    /// Media file to stream
    #[arg(long, value_name = "FILE")]
    container_path: PathBuf,

    /// HTTP listen address (`:8080` listens on every interface)
    #[arg(long, value_name = "ADDRESS", default_value = ":8080")]
    http_listen_address: String,

    /// Media source implementation
    #[arg(long, value_name = "SOURCE", default_value = "auto")]
    source: SourceKind,

    /// How sample durations are written to the tracks
    #[arg(long, value_name = "MODE", default_value = "clock-rate")]
    timing: TimingMode,

    /// STUN server URL (repeatable)
    #[arg(long = "stun-server", value_name = "URL")]
    stun_servers: Vec<String>,

    /// TURN server URL
    #[arg(long, value_name = "URL", requires = "turn_username", requires = "turn_credential")]
    turn_url: Option<String>,

    /// TURN username
    #[arg(long, value_name = "USER")]
    turn_username: Option<String>,

    /// TURN credential
    #[arg(long, value_name = "SECRET")]
    turn_credential: Option<String>,

    /// mDNS handling of host candidates
    #[arg(long, value_name = "MODE", default_value = "disabled")]
    mdns: MdnsMode,

    /// Also offer loopback candidates, for viewers on this machine
    #[arg(long)]
    loopback_candidates: bool,

    /// Video frame rate of the file source (pictures, not slices)
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Buffers queued between the media source and the tracks
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Stop at end of stream instead of starting over
    #[arg(long)]
    no_loop: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl CliArgs {
    fn into_config(self) -> AppConfig {
        let mut media = MediaConfig::new(self.container_path);
        media.source = self.source;
        media.timing = self.timing;
        media.fps = self.fps;
        media.looping = !self.no_loop;
        media.queue_capacity = self.queue_capacity;

        let mut config = AppConfig::new(media);
        config.web.listen_address = self.http_listen_address;
        config.webrtc.stun_servers = self.stun_servers;
        if let (Some(url), Some(username), Some(credential)) =
            (self.turn_url, self.turn_username, self.turn_credential)
        {
            config
                .webrtc
                .turn_servers
                .push(TurnServer::new(url, username, credential));
        }
        config.webrtc.mdns_mode = self.mdns;
        config.webrtc.include_loopback = self.loopback_candidates;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting rtwatch v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config();
    config.validate()?;
    let listen_addr = config.web.socket_addr()?;

    tracing::info!("Streaming {}", config.media.container_path.display());

    // Tracks exist before the pipeline so no early buffer is lost
    let tracks = OutboundTracks::new(config.media.timing);
    let source = media::open_source(&config.media.source_settings())?;

    let gate = FlushGate::new();
    let (emitter, rx) = SampleEmitter::channel(config.media.queue_capacity, gate.clone());

    let bridge = SampleBridge::from_tracks(&tracks);
    let mut pump = tokio::spawn(SamplePump::new(bridge.clone(), rx, gate).run());

    let controller = Arc::new(PlaybackController::new(source));
    controller.start(emitter).await?;

    let peers = Arc::new(WebRtcPeerFactory::new(config.webrtc.clone()));
    let state = AppState::new(config, controller.clone(), tracks, peers, bridge);
    let app = web::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("Open http://{} to watch", listener.local_addr()?);
    let server = async move { axum::serve(listener, app).await };

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => tracing::error!("Failed to listen for the shutdown signal: {}", e),
            }
            Ok(())
        }
        result = server => {
            match result {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::error!("HTTP server error: {}", e);
                    Err(anyhow::Error::from(e))
                }
            }
        }
        result = &mut pump => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    Err(anyhow::Error::from(AppError::from(e)).context("media delivery stopped"))
                }
                Err(e) => Err(anyhow::anyhow!("sample pump panicked: {}", e)),
            }
        }
    };

    cleanup(&state).await;
    pump.abort();

    tracing::info!("Shutdown complete");
    result
}

/// Close every viewer and stop the pipeline
async fn cleanup(state: &Arc<AppState>) {
    state.sessions.close_all();
    state.controller.shutdown().await;
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "rtwatch=error,tower_http=error",
        LogLevel::Warn => "rtwatch=warn,tower_http=warn",
        LogLevel::Info => "rtwatch=info,tower_http=info",
        LogLevel::Verbose => "rtwatch=debug,tower_http=info",
        LogLevel::Debug => "rtwatch=debug,tower_http=debug,webrtc=info",
        LogLevel::Trace => "rtwatch=trace,tower_http=debug,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

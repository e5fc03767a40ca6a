use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use classroom_rtc::client::{SessionClient, SyntheticDevices};
use classroom_rtc::config::ConfigStore;
use classroom_rtc::relay::{create_router, RelayAppState};
use classroom_rtc::signaling::Role;
use classroom_rtc::utils::bind_tcp_listener;

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

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliRole {
    Teacher,
    Student,
}

impl From<CliRole> for Role {
    fn from(role: CliRole) -> Self {
        match role {
            CliRole::Teacher => Role::Teacher,
            CliRole::Student => Role::Student,
        }
    }
}

/// classroom-rtc command line arguments
#[derive(Parser, Debug)]
#[command(name = "classroom-rtc")]
#[command(version, about = "Video session engine for live classes", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML); defaults apply when missing
    #[arg(short = 'c', long, value_name = "FILE", default_value = "classroom-rtc.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Run the signaling relay
    Relay {
        /// Listen address (overrides config)
        #[arg(short = 'a', long, value_name = "ADDRESS")]
        address: Option<String>,

        /// Listen port (overrides config)
        #[arg(short = 'p', long, value_name = "PORT")]
        port: Option<u16>,
    },
    /// Join a session as a headless participant
    Join {
        #[arg(long)]
        session: String,

        #[arg(long)]
        identity: String,

        #[arg(long, default_value = "")]
        token: String,

        #[arg(long, value_enum, default_value = "student")]
        role: CliRole,

        /// Relay WebSocket URL (overrides config)
        #[arg(long, value_name = "URL")]
        relay_url: Option<String>,

        /// Join without a camera
        #[arg(long)]
        audio_only: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting classroom-rtc v{}", env!("CARGO_PKG_VERSION"));

    let config_store = ConfigStore::load(&args.config).await?;

    match args.command {
        CliCommand::Relay { address, port } => {
            let mut config = (*config_store.get()).clone();
            if let Some(address) = address {
                config.relay.bind_address = address;
            }
            if let Some(port) = port {
                config.relay.port = port;
            }
            config_store.set(config);
            run_relay(config_store).await
        }
        CliCommand::Join {
            session,
            identity,
            token,
            role,
            relay_url,
            audio_only,
        } => {
            let mut config = (*config_store.get()).clone();
            if let Some(relay_url) = relay_url {
                config.client.relay_url = relay_url;
            }
            config_store.set(config);
            let devices = SyntheticDevices {
                camera_unavailable: audio_only,
                ..SyntheticDevices::new(identity.clone())
            };
            run_participant(
                SessionClient::new(config_store, Arc::new(devices))?,
                &session,
                &identity,
                &token,
                role.into(),
            )
            .await
        }
    }
}

async fn run_relay(config_store: ConfigStore) -> anyhow::Result<()> {
    let config = config_store.get();
    let ip: IpAddr = config
        .relay
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address {}", config.relay.bind_address))?;
    let addr = SocketAddr::new(ip, config.relay.port);

    let state = RelayAppState::new(config_store.clone())?;
    let app = create_router(state);

    let listener = bind_tcp_listener(addr).with_context(|| format!("failed to bind {}", addr))?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    tracing::info!(
        "Relay listening on {} (ws path {})",
        listener.local_addr()?,
        config.relay.ws_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Relay shutdown complete");
    Ok(())
}

async fn run_participant(
    client: SessionClient,
    session_id: &str,
    identity: &str,
    token: &str,
    role: Role,
) -> anyhow::Result<()> {
    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(event = %event.event_name(), "{}", json),
                Err(e) => tracing::warn!("Failed to encode event: {}", e),
            }
        }
    });

    let session = client.join(session_id, identity, token, role).await?;
    let mut profile = session.video_profile();

    let follow_profile = async {
        // Ends when the session task drops the sender
        while profile.changed().await.is_ok() {
            let current = *profile.borrow();
            tracing::info!(
                "Encoder target {} at {} kbps",
                current.level,
                current.max_bitrate_kbps
            );
        }
    };

    tokio::select! {
        _ = shutdown_signal() => session.leave().await?,
        _ = follow_profile => session.wait().await?,
    }

    tracing::info!("Participant shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
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
        LogLevel::Error => "classroom_rtc=error,tower_http=error,webrtc=error",
        LogLevel::Warn => "classroom_rtc=warn,tower_http=warn,webrtc=error",
        LogLevel::Info => "classroom_rtc=info,tower_http=info,webrtc=warn",
        LogLevel::Verbose => "classroom_rtc=debug,tower_http=info,webrtc=warn",
        LogLevel::Debug => "classroom_rtc=debug,tower_http=debug,webrtc=info",
        LogLevel::Trace => "classroom_rtc=trace,tower_http=debug,webrtc=debug",
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

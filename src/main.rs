//! Chatwire CLI - follow a chat server's realtime channels from a terminal.
//!
//! Prints every decoded event as one JSON line on stdout. Logs go to
//! stderr, or to `CHATWIRE_LOG_FILE` when set.

use std::sync::Arc;

use anyhow::{Context, Result};
use chatwire::{
    Config, ConnectionState, CredentialChain, EnvCredentials, EventDispatcher, EventKind,
    HttpStreamTransport, KeyringCredentials, SocketChannel, SocketSettings, StreamChannel,
    StreamOptions, WsConnector,
};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio::sync::watch;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "chatwire")]
#[command(version)]
#[command(about = "Realtime socket and event-stream client for the chat server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the socket channel and print events
    Socket {
        /// Room to join instead of the configured default
        #[arg(long)]
        join: Option<String>,
    },
    /// Connect the event stream and print events
    Stream,
    /// Show the effective configuration
    Config {
        /// Write it to the config file as well
        #[arg(long)]
        save: bool,
    },
    /// Store a bearer token in the OS keyring
    Login {
        #[arg(long)]
        token: String,
    },
    /// Remove the stored bearer token
    Logout,
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load config")?;

    match cli.command {
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                eprintln!("Saved to {}", Config::config_dir()?.display());
            }
            Ok(())
        }
        Commands::Login { token } => {
            KeyringCredentials::default().store(token.trim())?;
            eprintln!("Token saved");
            Ok(())
        }
        Commands::Logout => {
            KeyringCredentials::default().clear()?;
            eprintln!("Token removed");
            Ok(())
        }
        Commands::Socket { join } => runtime()?.block_on(run_socket(config, join)),
        Commands::Stream => runtime()?.block_on(run_stream(config)),
    }
}

/// `CHATWIRE_LOG_FILE` if set, stderr otherwise.
fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Ok(path) = std::env::var("CHATWIRE_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.format_timestamp_secs().init();
    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")
}

fn credentials() -> Arc<CredentialChain> {
    Arc::new(
        CredentialChain::new()
            .with(EnvCredentials::default())
            .with(KeyringCredentials::default()),
    )
}

/// Dispatcher that prints every event kind as a JSON line.
fn printing_dispatcher() -> EventDispatcher {
    let dispatcher = EventDispatcher::new();
    for kind in EventKind::ALL {
        dispatcher.subscribe(kind, |event| {
            println!("{}", serde_json::to_string(event)?);
            Ok(())
        });
    }
    dispatcher
}

async fn run_socket(config: Config, join: Option<String>) -> Result<()> {
    let mut settings = SocketSettings::from_config(&config);
    if let Some(room) = join {
        settings.default_room = room;
    }

    let channel = SocketChannel::builder(WsConnector::from_config(&config), credentials())
        .dispatcher(printing_dispatcher())
        .settings(settings)
        .build();

    channel.connect().await;
    if channel.state() == ConnectionState::Idle {
        anyhow::bail!("No token: set CHATWIRE_TOKEN or run `chatwire login --token …`");
    }

    let result = wait_until_done(channel.watch_state()).await;
    channel.disconnect();
    result
}

async fn run_stream(config: Config) -> Result<()> {
    let channel = StreamChannel::with_dispatcher(
        HttpStreamTransport::from_config(&config),
        credentials(),
        printing_dispatcher(),
    );

    let (missing_tx, mut missing_rx) = watch::channel(false);
    let options = StreamOptions::from_config(&config)
        .on_open(|| log::info!("Stream open"))
        .on_close(|| log::info!("Stream closed"))
        .on_error(move |e| {
            eprintln!("stream error: {e}");
            if *e == chatwire::ChannelError::MissingCredential {
                missing_tx.send_replace(true);
            }
        });

    channel.connect(options).await;
    if *missing_rx.borrow_and_update() {
        anyhow::bail!("No token: set CHATWIRE_TOKEN or run `chatwire login --token …`");
    }

    let result = wait_until_done(channel.watch_state()).await;
    channel.disconnect();
    result
}

/// Run until Ctrl-C, or fail once the channel gives up reconnecting.
async fn wait_until_done(mut state: watch::Receiver<ConnectionState>) -> Result<()> {
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                log::info!("Interrupted, disconnecting");
                return Ok(());
            }
            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                if let ConnectionState::Exhausted { attempts } = *state.borrow_and_update() {
                    anyhow::bail!("Gave up after {attempts} reconnect attempts");
                }
            }
        }
    }
}

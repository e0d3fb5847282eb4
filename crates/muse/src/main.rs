use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use muse::api::routes::create_router;
use muse::api::state::AppState;
use muse::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "muse")]
#[command(about = "Muse - streaming AI-chat backplane for the Muse app")]
#[command(version)]
struct Cli {
    /// Config file path (optional)
    #[arg(short, long, env = "MUSE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, env = "MUSE_VERBOSE", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve {
        /// Override the bind address
        #[arg(short, long)]
        bind: Option<String>,
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the resolved settings as TOML
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "muse=debug,tower_http=debug"
    } else {
        "muse=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;

    match cli.command {
        Command::Serve { bind, port } => serve(settings, bind, port).await,
        Command::Config {
            command: ConfigCommand::Show,
        } => {
            let rendered = toml::to_string_pretty(&settings).context("rendering settings")?;
            print!("{rendered}");
            Ok(())
        }
    }
}

async fn serve(mut settings: Settings, bind: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(bind) = bind {
        settings.server.host = bind;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("parsing bind address")?;

    let state = AppState::from_settings(settings).await?;
    let app = create_router(state);

    info!("starting muse on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await.context("serving")?;

    Ok(())
}

//! cowrite: Collaborative editing from the command line.
//!
//! `serve` runs the relay server. `edit` joins a channel and keeps a local
//! text file in sync with everyone else editing it.

use anyhow::Result;
use clap::{Parser, Subcommand};
use cowrite_core::{CollabEvent, EditorSurface, LocalStore};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cowrite_daemon::{CollabClient, DirStore, EditArgs, EditSettings, FileSurface, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "cowrite")]
#[command(about = "Collaborative text editing over a relay server")]
struct Args {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server
    Serve {
        /// Address to listen on for incoming connections
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        listen: String,
    },

    /// Edit a file collaboratively
    Edit(EditArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,cowrite_daemon=debug,cowrite_core=debug"
    } else {
        "info,cowrite_daemon=info,cowrite_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Serve { listen } => serve(&listen).await,
        Command::Edit(args) => edit(EditSettings::resolve(args)?).await,
    }
}

async fn serve(listen: &str) -> Result<()> {
    info!("Starting relay server");
    let listener = RelayServer::bind(listen).await?;

    RelayServer::new()
        .run_until(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await;

    info!("Shutting down");
    Ok(())
}

async fn edit(settings: EditSettings) -> Result<()> {
    info!("File: {:?}", settings.file);
    info!("Server: {}", settings.server);
    info!("Fallback store: {:?}", settings.store_dir);

    let surface = FileSurface::open(settings.file.clone()).await?;
    let store: Arc<dyn LocalStore> = Arc::new(DirStore::new(settings.store_dir.clone()));
    let editor: Arc<dyn EditorSurface> = surface.clone();

    let mut client = CollabClient::start_collaboration(settings.client_config(), editor, store)?;

    let _events = client.events().subscribe(|event: &CollabEvent| match event {
        CollabEvent::PeerJoined { user_id } => info!("Peer joined: {}", user_id),
        CollabEvent::PeerLeft { user_id } => info!("Peer left: {}", user_id),
        CollabEvent::FallbackActivated => info!("Server unreachable; syncing through local store"),
        _ => {}
    });

    info!("Editing. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    client.disconnect().await;
    surface.flush().await;
    info!("Shutting down");
    Ok(())
}

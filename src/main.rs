use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use robust_client::{frame_channel, ConnectionConfig, ConnectionManager, Dispatcher};
use robust_core::events::EventBus;
use robust_core::ports::{AuthPrompt, CredentialStore, MemoryCredentialStore, NullAuthPrompt};
use robust_store::{Database, MessageRepo};

/// Group-chat client: one persistent connection, a local indexed message
/// cache, and a subscribe-by-name event bus.
#[derive(Parser, Debug)]
#[command(name = "robust", version)]
struct Cli {
    /// Server address, host:port.
    #[arg(long, default_value = "127.0.0.1:6667")]
    addr: String,

    /// Message database path. Defaults to ~/.robust/database/messages.db.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let db_path = match cli.db {
        Some(path) => path,
        None => dirs_home().join(".robust").join("database").join("messages.db"),
    };
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let store = Arc::new(MessageRepo::new(db));
    let bus = Arc::new(EventBus::default());
    let credentials: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
    let prompt: Arc<dyn AuthPrompt> = Arc::new(NullAuthPrompt);

    let (sender, receiver) = frame_channel();
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        credentials,
        prompt,
        sender,
    );
    let manager = ConnectionManager::new(ConnectionConfig::default(), dispatcher.hooks(), receiver);

    let mut closed = bus.subscribe("connection-close");
    spawn_event_logger(&bus);

    manager
        .open(&cli.addr)
        .await
        .with_context(|| format!("failed to connect to {}", cli.addr))?;
    dispatcher.authenticate();
    tracing::info!(addr = %cli.addr, conn = %manager.id(), "client running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            manager.close();
        }
        _ = closed.recv() => {
            tracing::info!("connection closed by peer");
        }
    }

    Ok(())
}

/// One logging task per interesting event name.
fn spawn_event_logger(bus: &Arc<EventBus>) {
    for name in ["auth", "message", "backlog", "join", "part"] {
        let mut rx = bus.subscribe(name);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(payload) => tracing::info!(event = name, %payload),
                    Err(_) => tracing::info!(event = name),
                }
            }
        });
    }
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

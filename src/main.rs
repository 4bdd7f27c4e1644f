//! obnet
//!
//! Runs the object server, or a client that logs in and exercises it.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use obnet::network::{ClientConfig, ObjectClient, ObjectServer, ServerConfig};
use obnet::{Value, VERSION};

#[derive(Parser)]
#[command(name = "obnet", version, about = "Distributed object server and client")]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the world root over WebSocket
    Serve {
        /// Bind address (defaults to OBNET_BIND or 0.0.0.0:8080)
        #[arg(short, long)]
        bind: Option<SocketAddr>,
        /// Maximum live objects
        #[arg(long)]
        capacity: Option<usize>,
    },
    /// Connect, log in and print what the server sends back
    Connect {
        /// Server URL
        #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        /// Account name to log in as
        #[arg(short, long, default_value = "guest")]
        name: String,
        /// Bearer token
        #[arg(long)]
        token: Option<String>,
    },
    /// Start a server on a loopback port and run one client session against it
    Standalone {
        /// Account name to log in as
        #[arg(short, long, default_value = "guest")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;

    info!("obnet v{}", VERSION);

    match cli.command {
        Commands::Serve { bind, capacity } => {
            let mut config = ServerConfig::from_env()?;
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(capacity) = capacity {
                config.registry_capacity = capacity;
            }
            serve(config).await
        }
        Commands::Connect { url, name, token } => {
            let config = ClientConfig { token, ..Default::default() };
            session_demo(&url, &name, config).await
        }
        Commands::Standalone { name } => {
            let config = ServerConfig {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                ..Default::default()
            };
            let server = Arc::new(ObjectServer::new(config));
            let listener = server.bind().await?;
            let url = format!("ws://{}", listener.local_addr()?);

            let running = server.clone();
            let handle = tokio::spawn(async move { running.run_with_listener(listener).await });

            let result = session_demo(&url, &name, ClientConfig::default()).await;
            server.shutdown();
            handle.await??;
            result
        }
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let server = Arc::new(ObjectServer::new(config));

    let running = server.clone();
    let mut handle = tokio::spawn(async move { running.run().await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("Interrupted, shutting down");
            server.shutdown();
            (&mut handle).await??;
        }
        result = &mut handle => {
            result??;
        }
    }

    Ok(())
}

async fn session_demo(url: &str, name: &str, config: ClientConfig) -> anyhow::Result<()> {
    let client = ObjectClient::connect(url, config).await?;
    let root = client.server_root().ok_or_else(|| anyhow!("server exported no root"))?;

    let kind = client.call(&root, "get_type", vec![]).await?;
    info!("Server root is a {:?}", kind);

    let account = client.call(&root, "login", vec![Value::from(name)]).await?;
    let account = account
        .as_obref()
        .cloned()
        .ok_or_else(|| anyhow!("login returned {:?} instead of an object", account))?;

    for note in client.notifications() {
        info!("Notification: {}", note);
    }

    let visits = client.call(&account, "incr", vec![Value::from("visits")]).await?;
    let id = client.call(&account, "account_id", vec![]).await?;
    info!("Account {:?} visit #{:?}", id, visits);

    let count = client.call(&root, "object_count", vec![]).await?;
    info!("Server holds {:?} object(s)", count);

    client.call(&root, "logout", vec![account.into()]).await?;
    client.close().await;
    Ok(())
}

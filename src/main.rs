use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sadako::api::{self, SecurityConfig};
use sadako::config::SadakoConfig;
use sadako::db::Database;
use sadako::lease::{LeaseRegistry, LeaseStore};
use sadako::notify::{FanoutSink, MessageSink, TracingSink, WebhookDirectory};

#[derive(Parser)]
#[command(name = "sadako")]
#[command(about = "Seven days. Tracks curse leases and tells people when they end.")]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lease engine and admin API
    Serve {
        /// Port for HTTP API (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the leases in the store
    List,
}

/// Initialize tracing with output to stdout
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "sadako=debug,tower_http=debug".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn open_database(config: &SadakoConfig) -> anyhow::Result<Database> {
    let db = match &config.database_path {
        Some(path) => Database::open(path.clone())?,
        None => Database::open_default()?,
    };
    db.migrate()?;
    Ok(db)
}

async fn serve(config: SadakoConfig, port: Option<u16>) -> anyhow::Result<()> {
    let db = open_database(&config)?;

    let mut sink = FanoutSink::new().with(Arc::new(TracingSink));
    if let Some(url) = &config.webhook_url {
        tracing::info!("Sending lifecycle messages to {}", url);
        sink = sink.with(Arc::new(MessageSink::new(
            WebhookDirectory::new(url.clone()),
            config.messages.clone(),
        )));
    }

    let registry = Arc::new(LeaseRegistry::new(
        config.lease,
        Arc::new(db),
        Arc::new(sink),
    )?);
    let restored = registry.bootstrap().await?;
    tracing::info!("Restored {} active leases", restored);

    let stop = Arc::new(Notify::new());
    let expirations = tokio::spawn({
        let registry = Arc::clone(&registry);
        let stop = Arc::clone(&stop);
        async move { registry.run(async move { stop.notified().await }).await }
    });

    let app = api::create_router_with_config(
        Arc::clone(&registry),
        SecurityConfig::from_server_config(&config.server),
    );

    let port = port.unwrap_or(config.server.port);
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Sadako listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    stop.notify_one();
    expirations.await?;
    Ok(())
}

fn list(config: &SadakoConfig) -> anyhow::Result<()> {
    let db = open_database(config)?;
    let leases = db.list()?;
    if leases.is_empty() {
        println!("No one is cursed.");
        return Ok(());
    }

    let now = chrono::Utc::now();
    for lease in leases {
        println!(
            "{}\tends {}\t{} days left",
            lease.subject_id,
            lease.end.to_rfc3339(),
            lease.remaining_days_at(now)
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = SadakoConfig::load(cli.config.as_deref());

    match cli.command {
        Some(Commands::Serve { port }) => serve(config, port).await?,
        Some(Commands::List) => list(&config)?,
        None => serve(config, None).await?,
    }

    Ok(())
}

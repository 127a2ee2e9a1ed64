mod api;
mod auth;
mod config;
mod domain;
mod error;
mod hub;
mod storage;
mod sync;

use std::{path::Path, sync::Arc};

use anyhow::Context;
use api::AppState;
use auth::TokenValidator;
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{Config, MEMORY_STORE};
use domain::UserId;
use hub::Hub;
use migration::MigratorTrait;
use poem::{Server, listener::TcpListener};
use sea_orm::Database;
use storage::{MemoryProgressStore, ProgressStore, SeaOrmProgressStore};
use sync::SyncCoordinator;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder, prelude::*};

type AppResult<T> = anyhow::Result<T>;

#[derive(Parser)]
#[command(name = "progress_sync", version, about = "Reading progress sync server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP and WebSocket server (default)
    Serve,
    /// Print a bearer token for a user, signed with AUTH_SECRET
    IssueToken {
        /// User the token authenticates
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, default to info for our crate and warn for deps.
    let default_filter = format!(
        "{}=info,poem=info,sqlx=warn,sea_orm=warn",
        env!("CARGO_PKG_NAME")
    );
    let env_filter = std::env::var("RUST_LOG").unwrap_or(default_filter);
    SubscriberBuilder::default()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_target(false)
        .with_level(true)
        .pretty()
        .finish()
        .with(ErrorLayer::default())
        .init();

    if Path::new(".env.local").exists() {
        dotenvy::from_filename(".env.local")?;
    } else if Path::new(".env").exists() {
        dotenvy::from_filename(".env")?;
    };
    let config = Config::load()?;
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    let tokens = TokenValidator::new(config.auth_secret.as_bytes(), config.token_ttl);

    match cli.command.unwrap_or(Command::Serve) {
        Command::IssueToken { user_id } => {
            let user_id = UserId::parse(&user_id)?;
            let token = tokens.issue(&user_id, Utc::now())?;
            println!("{}", token);
            Ok(())
        }
        Command::Serve => {
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                "starting progress sync"
            );
            let store = open_store(&config.db_connection_string).await?;
            run_poem(store, tokens, Arc::new(config)).await
        }
    }
}

async fn open_store(connection_string: &str) -> AppResult<Arc<dyn ProgressStore>> {
    if connection_string == MEMORY_STORE {
        tracing::warn!("using in-memory progress store, nothing survives a restart");
        return Ok(Arc::new(MemoryProgressStore::new()));
    }

    let db_conn = Database::connect(connection_string)
        .await
        .with_context(|| "Failed to connect to database")?;
    migration::Migrator::up(&db_conn, None)
        .await
        .with_context(|| "Failed to run database migrations")?;
    Ok(Arc::new(SeaOrmProgressStore::new(Arc::new(db_conn))))
}

pub async fn run_poem(
    store: Arc<dyn ProgressStore>,
    tokens: TokenValidator,
    config: Arc<Config>,
) -> AppResult<()> {
    let hub = Hub::spawn(&config.sync);
    let coordinator = SyncCoordinator::new(store, hub, &config.sync);
    let state = AppState {
        coordinator: Arc::new(coordinator),
        tokens: Arc::new(tokens),
        sync: Arc::new(config.sync.clone()),
    };
    let app = api::app(state, &config.public_url);

    let bind_addr = config.bind_addr.as_str();
    tracing::info!(%bind_addr, public_url = %config.public_url, "starting HTTP server");
    Server::new(TcpListener::bind(bind_addr)).run(app).await?;
    Ok(())
}

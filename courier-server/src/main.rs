use std::sync::Arc;

use clap::Parser;
use courier_core::agent_client::HttpAgentClient;
use courier_core::models::User;
use courier_core::render::QrPngRenderer;
use courier_core::store::Stores;
use courier_core::CourierConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use courier_server::bridge::BridgeFactory;
use courier_server::http::{self, HttpState};
use courier_server::subsystems::execution::ExecutionProxy;
use courier_server::subsystems::sessions::SessionManager;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "courier.toml")]
    config: String,

    /// Check database connectivity and exit
    #[arg(long)]
    health: bool,

    /// Keep all state in memory instead of PostgreSQL
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match CourierConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over service.log_level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let (stores, pool) = if args.ephemeral {
        tracing::warn!("Running with in-memory stores, state is lost on exit");
        (Stores::memory(), None)
    } else {
        let pool = match courier_core::db::create_pool(&config.database).await {
            Ok(p) => p,
            Err(e) => {
                eprintln!("Failed to connect to database: {}", e);
                std::process::exit(1);
            }
        };

        if args.health {
            match courier_core::db::health_check(&pool).await {
                Ok(v) => println!("✅ PostgreSQL connected: {}", v),
                Err(e) => {
                    println!("❌ PostgreSQL connection failed: {}", e);
                    std::process::exit(1);
                }
            }
            println!("✅ Courier DB health check passed");
            return Ok(());
        }

        courier_core::db::run_migrations(&pool).await?;
        tracing::info!("Database migrations applied");
        (Stores::postgres(pool.clone()), Some(pool))
    };

    seed_bootstrap_user(&stores, &config).await;

    let factory = Arc::new(BridgeFactory::new(
        &config.bridge.socket_path,
        config.bridge.request_timeout(),
    ));
    if let Err(e) = factory.hello().await {
        tracing::warn!(
            socket = %config.bridge.socket_path,
            error = %e,
            "Transport bridge not reachable yet, sessions will connect once it is up"
        );
    }

    let backend = Arc::new(HttpAgentClient::new(config.agent_backend.timeout())?);
    let proxy = Arc::new(ExecutionProxy::new(
        stores.sessions.clone(),
        stores.executions.clone(),
        backend,
        config.agent_backend.clone(),
    ));
    let manager = SessionManager::new(
        stores.clone(),
        factory,
        proxy,
        Arc::new(QrPngRenderer),
        config.pairing.clone(),
    );

    match manager.initialize_sessions().await {
        Ok(n) => tracing::info!(sessions = n, "Restoring sessions"),
        Err(e) => tracing::error!(error = %e, "Failed to list sessions for restoration"),
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    if config.http.enabled {
        let state = Arc::new(HttpState {
            manager,
            stores,
            pool,
            config,
        });
        http::start_http_server(state, tx.subscribe()).await?;
    } else {
        tracing::info!("HTTP API disabled, running sessions only");
        let _ = tx.subscribe().recv().await;
    }

    tracing::info!("Courier stopped");
    Ok(())
}

/// Make sure the bootstrap API key exists for the default owner.
async fn seed_bootstrap_user(stores: &Stores, config: &CourierConfig) {
    let Some(api_key) = config
        .auth
        .bootstrap_api_key
        .as_deref()
        .filter(|k| !k.is_empty())
    else {
        return;
    };
    let owner = config.auth.default_owner.as_str();

    match stores.users.get_by_id(owner).await {
        Ok(Some(_)) => tracing::debug!(owner, "Bootstrap user already present"),
        Ok(None) => match stores.users.create(&User::new(owner, api_key)).await {
            Ok(()) => tracing::info!(owner, "Bootstrap user created"),
            Err(e) => tracing::warn!(owner, error = %e, "Failed to create bootstrap user"),
        },
        Err(e) => tracing::warn!(owner, error = %e, "Bootstrap user lookup failed"),
    }
}

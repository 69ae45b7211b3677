use std::sync::Arc;
use std::time::Duration;

use dpq_auth::PeerBook;
use dpq_broker::config::BrokerConfig;
use dpq_broker::frontend::Frontend;
use dpq_broker::risk::RiskClient;
use dpq_broker::server::{self, Broker, ServerSettings};
use dpq_channel::ChannelIdentity;
use dpq_processors::builtin_registry;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::RwLock;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match BrokerConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let pool = match SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&config.data_db_url)
        .await
    {
        Ok(pool) => pool,
        Err(err) => {
            eprintln!("STARTUP_ERROR ERR_STORE_INIT {}", err);
            std::process::exit(1);
        }
    };

    let selection_timeout = Duration::from_millis(config.selection_timeout_ms);
    let frontend = match Frontend::build(
        pool.clone(),
        builtin_registry(config.max_histogram_cells),
        selection_timeout,
    )
    .await
    {
        Ok(frontend) => Arc::new(RwLock::new(Arc::new(frontend))),
        Err(err) => {
            eprintln!("STARTUP_ERROR ERR_METADATA {}", err);
            std::process::exit(1);
        }
    };

    let peers = match PeerBook::load(&config.peers_path) {
        Ok(book) => Arc::new(RwLock::new(Arc::new(book))),
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    spawn_reload_task(config.clone(), pool, Arc::clone(&frontend), Arc::clone(&peers));

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(_) => {
            eprintln!("STARTUP_ERROR ERR_BIND_FAILED failed to bind query listener");
            std::process::exit(1);
        }
    };

    tracing::info!(
        bind_addr = %config.bind_addr,
        risk_addr = %config.risk_addr,
        allow_alias = config.allow_alias,
        allow_echo = config.allow_echo,
        "dpq-query-server listening"
    );

    let local = ChannelIdentity {
        identity: config.identity.clone(),
        token: config.token.clone(),
    };
    let risk_book = match PeerBook::load(&config.peers_path) {
        Ok(book) => Arc::new(book),
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };
    let risk = RiskClient::new(
        config.risk_addr.clone(),
        Duration::from_millis(config.risk_timeout_ms),
        local.clone(),
        risk_book,
    );
    let broker = Broker::new(
        frontend,
        risk,
        ServerSettings {
            allow_alias: config.allow_alias,
            allow_echo: config.allow_echo,
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
        },
    );

    server::listen(listener, local, peers, broker).await;
}

/// SIGUSR1 re-reads the peer file and rebuilds the metadata snapshot.
/// In-flight requests keep the snapshot they started with.
fn spawn_reload_task(
    config: BrokerConfig,
    pool: sqlx::SqlitePool,
    frontend: Arc<RwLock<Arc<Frontend>>>,
    peers: Arc<RwLock<Arc<PeerBook>>>,
) {
    tokio::spawn(async move {
        let Ok(mut stream) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
        else {
            tracing::warn!("failed to install SIGUSR1 handler, hot reload disabled");
            return;
        };
        let selection_timeout = Duration::from_millis(config.selection_timeout_ms);
        while stream.recv().await.is_some() {
            match PeerBook::load(&config.peers_path) {
                Ok(book) => {
                    let mut slot = peers.write().await;
                    *slot = Arc::new(book);
                    tracing::info!("peer book reloaded");
                }
                Err(err) => {
                    tracing::error!(error = %err, "peer book reload failed, keeping old book");
                }
            }
            match Frontend::build(
                pool.clone(),
                builtin_registry(config.max_histogram_cells),
                selection_timeout,
            )
            .await
            {
                Ok(fresh) => {
                    let mut slot = frontend.write().await;
                    *slot = Arc::new(fresh);
                    tracing::info!("metadata snapshot reloaded");
                }
                Err(err) => {
                    tracing::error!(error = %err, "metadata reload failed, keeping old snapshot");
                }
            }
        }
    });
}

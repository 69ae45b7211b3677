use std::sync::Arc;
use std::time::Duration;

use dpq_accountant::config::AccountantConfig;
use dpq_accountant::service::{self, RiskService};
use dpq_accountant::store::RiskStore;
use dpq_auth::PeerBook;
use dpq_channel::ChannelIdentity;
use dpq_policy::PolicySet;
use tokio::sync::RwLock;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match AccountantConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let store = match RiskStore::connect_and_migrate(
        &config.db_url,
        Duration::from_millis(config.op_timeout_ms),
    )
    .await
    {
        Ok(store) => store,
        Err(err) => {
            eprintln!("STARTUP_ERROR ERR_STORE_INIT {}", err);
            std::process::exit(1);
        }
    };

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("add-user") {
        run_add_user(&store, &args[2..]).await;
        return;
    }

    let policies = match PolicySet::builtin().with_active(&config.policy) {
        Ok(set) => Arc::new(RwLock::new(Arc::new(set))),
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
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

    spawn_reload_task(
        config.peers_path.clone(),
        Arc::clone(&peers),
        Arc::clone(&policies),
    );

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(_) => {
            eprintln!("STARTUP_ERROR ERR_BIND_FAILED failed to bind risk listener");
            std::process::exit(1);
        }
    };

    tracing::info!(bind_addr = %config.bind_addr, policy = %config.policy, "dpq-risk-server listening");

    let local = ChannelIdentity {
        identity: config.identity.clone(),
        token: config.token.clone(),
    };
    let service = RiskService::new(store, policies);
    service::listen(
        listener,
        local,
        peers,
        service,
        Duration::from_millis(config.handshake_timeout_ms),
    )
    .await;
}

/// `dpq-risk-server add-user <id> <total_threshold> <per_query_threshold> [info]`
async fn run_add_user(store: &RiskStore, args: &[String]) {
    let usage = "usage: dpq-risk-server add-user <id> <total_threshold> <per_query_threshold> [info]";
    let (Some(id), Some(tt), Some(qt)) = (args.first(), args.get(1), args.get(2)) else {
        eprintln!("{}", usage);
        std::process::exit(2);
    };
    let (Ok(tt), Ok(qt)) = (tt.parse::<f64>(), qt.parse::<f64>()) else {
        eprintln!("{}", usage);
        std::process::exit(2);
    };
    if !(tt.is_finite() && qt.is_finite() && tt >= 0.0 && qt >= 0.0) {
        eprintln!("thresholds must be non-negative numbers");
        std::process::exit(2);
    }
    let info = args.get(3).map(String::as_str).unwrap_or("");

    if let Err(err) = store.put_user(id, info, tt, qt).await {
        eprintln!("add-user failed: {}", err);
        std::process::exit(1);
    }
    println!("user {} registered (tt={}, qt={})", id, tt, qt);
}

/// SIGUSR1 re-reads the peer file and the configured policy, swapping both
/// snapshots for subsequent requests. In-flight decisions keep the
/// snapshot they captured.
fn spawn_reload_task(
    peers_path: String,
    peers: Arc<RwLock<Arc<PeerBook>>>,
    policies: Arc<RwLock<Arc<PolicySet>>>,
) {
    tokio::spawn(async move {
        let Ok(mut stream) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
        else {
            tracing::warn!("failed to install SIGUSR1 handler, hot reload disabled");
            return;
        };
        while stream.recv().await.is_some() {
            match PeerBook::load(&peers_path) {
                Ok(book) => {
                    let mut slot = peers.write().await;
                    *slot = Arc::new(book);
                    tracing::info!("peer book reloaded");
                }
                Err(err) => {
                    tracing::error!(error = %err, "peer book reload failed, keeping old book");
                }
            }
            let policy_name = match AccountantConfig::load() {
                Ok(config) => config.policy,
                Err(err) => {
                    tracing::error!(error = %err, "config reload failed, keeping old policy");
                    continue;
                }
            };
            match PolicySet::builtin().with_active(&policy_name) {
                Ok(set) => {
                    let mut slot = policies.write().await;
                    *slot = Arc::new(set);
                    tracing::info!(policy = %policy_name, "policy set reloaded");
                }
                Err(err) => {
                    tracing::error!(error = %err, "policy reload failed, keeping old policy set");
                }
            }
        }
    });
}

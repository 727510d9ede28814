//! Meridian node: HTTP gateway, TCP RPC listener and TCC recovery worker
//! around one dispatch pipeline.
//!
//! ```bash
//! meridian-node --http-port 8080 --rpc-port 9090 --tcc-repository redb
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use clap::Parser;
use meridian_core::{SystemClock, Value};
use meridian_server::network::{GatewayConfig, GatewayModule, ShutdownController};
use meridian_server::service::{
    handler_fn, BackgroundWorker, DispatchPipeline, HttpMethod, ServerConfig, ServiceEntry, ServiceEntryRegistry,
};
use meridian_server::tcc::{RecoveryRunnable, RepositoryCatalog, TccCoordinator, TransLogStore, TransactionConfig};
use meridian_server::transport::{LoopbackSender, RemoteInvoker, TcpMessageSender, TcpRpcServer, TcpTransportConfig};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meridian-node", version, about = "Runs one Meridian service node")]
struct Args {
    /// Node id, also the recovery lock owner.
    #[arg(long, env = "MERIDIAN_NODE_ID", default_value = "node-1")]
    node_id: String,

    #[arg(long, env = "MERIDIAN_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "MERIDIAN_HTTP_PORT", default_value_t = 8080)]
    http_port: u16,

    #[arg(long, env = "MERIDIAN_RPC_PORT", default_value_t = 9090)]
    rpc_port: u16,

    /// Address other nodes use to reach this node.
    #[arg(long, env = "MERIDIAN_ADVERTISED_ADDRESS", default_value = "127.0.0.1")]
    advertised_address: String,

    /// Send confirm/cancel calls to this peer instead of the local pipeline.
    #[arg(long, env = "MERIDIAN_TCC_PEER")]
    tcc_peer: Option<SocketAddr>,

    #[arg(long, env = "MERIDIAN_CALL_TIMEOUT_MS", default_value_t = 30_000)]
    call_timeout_ms: u64,

    #[arg(long, env = "MERIDIAN_MAX_CONCURRENT_CALLS", default_value_t = 1000)]
    max_concurrent_calls: u32,

    /// `memory` or `redb`.
    #[arg(long, env = "MERIDIAN_TCC_REPOSITORY", default_value = "memory")]
    tcc_repository: String,

    #[arg(long, env = "MERIDIAN_TCC_REDB_PATH", default_value = "meridian-tcc.redb")]
    tcc_redb_path: String,

    #[arg(long, env = "MERIDIAN_TCC_RECOVER_DELAY_MS", default_value_t = 60_000)]
    tcc_recover_delay_ms: u64,

    #[arg(long, env = "MERIDIAN_TCC_SCAN_INTERVAL_MS", default_value_t = 30_000)]
    tcc_scan_interval_ms: u64,

    /// Keep finished transactions until the periodic purge.
    #[arg(long, env = "MERIDIAN_TCC_DEFER_CLEANUP")]
    tcc_defer_cleanup: bool,

    /// Soft-delete log rows instead of removing them.
    #[arg(long, env = "MERIDIAN_TCC_SOFT_DELETE")]
    tcc_soft_delete: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "MERIDIAN_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            node_id: self.node_id.clone(),
            default_call_timeout_ms: self.call_timeout_ms,
            max_concurrent_calls: self.max_concurrent_calls,
            advertised_address: self.advertised_address.clone(),
        }
    }

    fn transaction_config(&self) -> TransactionConfig {
        TransactionConfig {
            repository: self.tcc_repository.clone(),
            redb_path: self.tcc_redb_path.clone().into(),
            phy_deleted: !self.tcc_soft_delete,
            recover_delay_ms: self.tcc_recover_delay_ms,
            scan_interval_ms: self.tcc_scan_interval_ms,
            cleanup_immediately: !self.tcc_defer_cleanup,
            ..TransactionConfig::default()
        }
    }

    fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            host: self.host.clone(),
            port: self.http_port,
            ..GatewayConfig::default()
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Lists the externally reachable routes of this node.
fn routes_entry(registry: &Arc<ServiceEntryRegistry>) -> anyhow::Result<ServiceEntry> {
    let registry: Weak<ServiceEntryRegistry> = Arc::downgrade(registry);
    let entry = ServiceEntry::builder("meridian.node.routes", HttpMethod::Get, "/_meridian/routes")
        .handler(handler_fn(move |_| {
            let registry = registry.upgrade();
            async move {
                let Some(registry) = registry else {
                    return Ok(Value::Null);
                };
                let routes = registry
                    .external_routes()
                    .iter()
                    .map(|e| serde_json::json!({ "id": e.id, "method": e.method.to_string(), "route": e.route.as_str() }))
                    .collect::<Vec<_>>();
                Ok(Value::from(serde_json::Value::Array(routes)))
            }
        }))
        .build()?;
    Ok(entry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let server_config = Arc::new(args.server_config());
    let registry = Arc::new(ServiceEntryRegistry::new());
    registry.upsert(routes_entry(&registry)?)?;
    let pipeline = Arc::new(DispatchPipeline::new(Arc::clone(&registry), Arc::clone(&server_config)));

    let tcc_config = args.transaction_config();
    let store = match TransLogStore::open(&tcc_config, &RepositoryCatalog::builtin()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "cannot open the transaction log");
            return Err(e.into());
        }
    };

    let client = match args.tcc_peer {
        Some(peer) => Arc::new(TcpMessageSender::client(peer, &TcpTransportConfig::default()).await?),
        None => Arc::new(LoopbackSender::client(Arc::clone(&pipeline))),
    };
    let invoker = RemoteInvoker::new(client).with_caller_address(args.advertised_address.clone());
    let scan_interval = Duration::from_millis(tcc_config.scan_interval_ms);
    let coordinator = Arc::new(TccCoordinator::new(
        store,
        invoker,
        Arc::new(SystemClock),
        tcc_config,
        args.node_id.clone(),
    ));

    let shutdown = Arc::new(ShutdownController::new());
    let mut gateway = GatewayModule::with_shutdown(args.gateway_config(), Arc::clone(&pipeline), Arc::clone(&shutdown));
    let http_port = gateway.start().await?;

    let rpc_listener = TcpListener::bind((args.host.as_str(), args.rpc_port)).await?;
    let rpc_server = TcpRpcServer::new(Arc::clone(&pipeline), TcpTransportConfig::default());
    let rpc_task = tokio::spawn(rpc_server.serve(rpc_listener, shutdown.shutdown_receiver()));

    let mut recovery = BackgroundWorker::start(RecoveryRunnable::new(coordinator), scan_interval);

    info!(
        node_id = %args.node_id,
        http_port,
        rpc_port = args.rpc_port,
        entries = registry.len(),
        "meridian node started"
    );

    let signal = Arc::clone(&shutdown);
    gateway
        .serve(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
            signal.trigger_shutdown();
        })
        .await?;

    recovery.stop().await;
    match rpc_task.await {
        Ok(Err(e)) => error!(error = %e, "rpc listener failed"),
        Err(e) => error!(error = %e, "rpc listener panicked"),
        Ok(Ok(())) => {}
    }
    info!("meridian node stopped");
    Ok(())
}

//! Demo node: an echo service registered in an in-memory store, called
//! back through discovery, plus one distributed lock round trip.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use skiff_core::types::WEIGHT_KEY;
use skiff_core::ServiceInfo;
use skiff_runtime::discovery::{
    DiscoveryProvider, RegistryConfig, ResolverBuilder, ResolverConfig, ServiceRegistry,
};
use skiff_runtime::lock::{DistributedMutex, SessionOptions};
use skiff_runtime::network::{
    BalancerPolicy, CallOptions, ClientConfig, RpcClient, RpcServer, ServerConfig,
};
use skiff_runtime::store::{CoordinationStore, MemoryStore};
use skiff_runtime::telemetry::{init_tracing, LogFormat};
use tokio_util::sync::CancellationToken;
use tracing::info;

const ECHO: &str = "/skiff.Echo/Say";

#[derive(Parser, Debug)]
#[command(name = "skiff-node", about = "Run a self-contained skiff demo node")]
struct Cli {
    /// Logical service name to register and dial.
    #[arg(long, env = "SKIFF_SERVICE", default_value = "echo")]
    service: String,

    /// Host the echo server binds.
    #[arg(long, env = "SKIFF_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port the echo server binds; 0 picks a free one.
    #[arg(long, env = "SKIFF_PORT", default_value_t = 0)]
    port: u16,

    /// Message sent to the echo service.
    #[arg(long, default_value = "hello")]
    message: String,

    #[arg(long, env = "SKIFF_BALANCER", default_value = "weighted_round_robin")]
    balancer: BalancerPolicy,

    /// Log output format: compact or json.
    #[arg(long, env = "SKIFF_LOG_FORMAT", default_value = "compact")]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "SKIFF_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Graceful stop deadline in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    stop_deadline_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, "info").context("installing tracing subscriber")?;

    if let Some(addr) = cli.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());

    let mut server = RpcServer::new(ServerConfig {
        host: cli.host.clone(),
        port: cli.port,
        ..ServerConfig::default()
    })?;
    server.unary(ECHO, |msg: String| async move { Ok(msg) });
    let server = server.start().await?;

    let registry = ServiceRegistry::new(Arc::clone(&store), RegistryConfig::default());
    let instance = ServiceInfo::new(&cli.service, "rpc", server.local_addr().to_string())
        .with_metadata(WEIGHT_KEY, "100");
    registry.register(&instance).await?;

    let provider: Arc<dyn DiscoveryProvider> = Arc::new(ResolverBuilder::new(
        Arc::clone(&store),
        ResolverConfig::default(),
    ));
    let client = RpcClient::dial(
        &format!("discovery:///{}", cli.service),
        ClientConfig {
            balancer: cli.balancer,
            ..ClientConfig::default()
        },
        Some(provider),
    )
    .await?;

    let reply: String = client
        .call(ECHO, &cli.message, CallOptions::default())
        .await?;
    info!(%reply, "echo call succeeded");

    let cancel = CancellationToken::new();
    let mut mutex = DistributedMutex::new(
        Arc::clone(&store),
        &format!("/locks/{}", cli.service),
        SessionOptions::default(),
    )
    .await?;
    mutex.lock(&cancel, Duration::from_secs(5)).await?;
    info!(key = ?mutex.key(), "lock acquired");
    mutex.unlock(&cancel).await?;
    info!("lock released");

    client.close().await;
    registry.close().await;
    server
        .stop(Duration::from_millis(cli.stop_deadline_ms))
        .await?;
    info!("node shut down");
    Ok(())
}

//! `carrier-proxy`: the binary wrapper around [`carrier_proxy::Proxy`]
//! (spec §6 "CLI surface of the proxy").
//!
//! Parses the four spec-named flags, listens on the TCP address, and
//! serves a liveness endpoint on `--healthz-address`. If `--name` is
//! given, the proxy's own endpoint is kept mounted under that name in
//! the namespace rooted at `V23_NAMESPACE*` for as long as the process
//! runs, the same `carrier-publisher` keep-alive a regular server uses.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use carrier_endpoint::{Endpoint, RoutingId, RuntimeConfig};
use carrier_manager::{StreamManager, TcpAcceptor};
use carrier_ns::NamespaceResolver;
use carrier_proxy::Proxy;
use carrier_publisher::{Publisher, PublisherConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "carrier-proxy")]
#[command(about = "NAT-traversal relay proxy for the carrier RPC runtime")]
struct Args {
    /// Address to listen on for VIF connections (spec §6 `--v23.tcp.address`).
    #[arg(long = "v23.tcp.address", default_value = "0.0.0.0:0")]
    tcp_address: String,

    /// Namespace name to mount this proxy's endpoint under, if any.
    #[arg(long)]
    name: Option<String>,

    /// Externally reachable address to advertise instead of the bound
    /// local address (for proxies behind their own NAT/port-forward).
    #[arg(long)]
    published_address: Option<String>,

    /// Address the healthz HTTP endpoint listens on.
    #[arg(long, default_value = "127.0.0.1:0")]
    healthz_address: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if let Err(err) = run(args).await {
        tracing::error!(error = %err, "carrier-proxy exited with a fatal error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(&args.tcp_address).await?;
    let bound_addr = listener.local_addr()?;
    let published = args.published_address.unwrap_or_else(|| bound_addr.to_string());
    tracing::info!(bound = %bound_addr, published, "carrier-proxy listening");

    let base_endpoint = Endpoint::new("tcp", published).with_routing_id(RoutingId::generate());
    let proxy = Arc::new(Proxy::new(base_endpoint.clone()));
    proxy.listen(Arc::new(TcpAcceptor(listener)));

    let _publisher = if let Some(name) = args.name.clone() {
        let runtime_config = RuntimeConfig::from_env();
        if runtime_config.namespace_roots.is_empty() {
            tracing::warn!(
                name,
                "--name given but no V23_NAMESPACE* roots are set; skipping publish"
            );
            None
        } else {
            let manager = StreamManager::with_tcp(base_endpoint.clone());
            let factory = carrier_testkit::rpc_client_factory(manager);
            let resolver = Arc::new(
                NamespaceResolver::new(runtime_config.namespace_roots.clone(), factory)
                    .with_max_resolve_depth(runtime_config.max_resolve_depth),
            );
            let publisher = Publisher::spawn(
                resolver,
                PublisherConfig {
                    refresh_interval: runtime_config.publisher_refresh_interval,
                    ..PublisherConfig::default()
                },
            );
            publisher.add(name, base_endpoint.to_string(), false).await;
            Some(publisher)
        }
    } else {
        None
    };

    let healthz_addr: SocketAddr = args.healthz_address.parse()?;
    let healthz_listener = tokio::net::TcpListener::bind(healthz_addr).await?;
    tracing::info!(address = %healthz_listener.local_addr()?, "healthz endpoint listening");
    let app = axum::Router::new().route("/", get(|| async { "ok" }));

    axum::serve(healthz_listener, app).await?;
    Ok(())
}

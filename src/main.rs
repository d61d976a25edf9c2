use anyhow::Context as _;
use memgrid::cluster::ClusterContext;
use memgrid::cluster::handlers::client_routes;
use memgrid::config::GridConfig;
use memgrid::membership::service::MembershipService;
use memgrid::membership::types::NodeId;
use memgrid::storage::map::ProcessorOutcome;
use memgrid::transport::protocol::internal_routes;
use memgrid::transport::{HttpTransport, InboundHandler};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} --bind <addr:port> [--seed <addr:port>]... [--config <file.json>] [--node-id <id>]",
        program
    );
    eprintln!("Example: {} --bind 127.0.0.1:5000 --node-id node-a", program);
    eprintln!(
        "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000 --node-id node-b",
        program
    );
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut config_path: Option<PathBuf> = None;
    let mut node_id: Option<NodeId> = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--bind", Some(v)) => bind_addr = Some(v.parse().context("invalid --bind")?),
            ("--seed", Some(v)) => seed_nodes.push(v.parse().context("invalid --seed")?),
            ("--config", Some(v)) => config_path = Some(PathBuf::from(v)),
            ("--node-id", Some(v)) => node_id = Some(NodeId::from(v.as_str())),
            _ => usage(&args[0]),
        }
        i += 2;
    }

    let Some(bind_addr) = bind_addr else {
        usage(&args[0]);
    };

    let config = match &config_path {
        Some(path) => GridConfig::load(path)?,
        None => GridConfig::demo(),
    };

    tracing::info!("Starting node on {}", bind_addr);
    if !seed_nodes.is_empty() {
        tracing::info!("Seed nodes: {:?}", seed_nodes);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip):
    let membership =
        MembershipService::new(bind_addr, seed_nodes, &config.cluster_name, node_id).await?;
    tracing::info!("Node ID: {}", membership.local_node.id);

    // 2. Grid components:
    let transport = HttpTransport::new(membership.clone());
    let context = ClusterContext::join(config, membership.clone(), transport).await?;
    register_demo_functions(&context);

    // 3. HTTP Router:
    let inbound: Arc<dyn InboundHandler> = context.clone();
    let app = client_routes(context.clone()).merge(internal_routes(inbound));

    // 4. Spawn stats reporter:
    let stats = context.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let table = stats.table();
            let owned = table.owned_by(stats.local_id()).len();
            tracing::info!(
                alive = stats.membership().get_alive_members().len(),
                table = table.version,
                owned,
                "Cluster stats"
            );
        }
    });

    // 5. Start HTTP server:
    let http_addr = membership.local_node.http_addr;
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let shutdown = context.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
            shutdown.leave().await;
        })
        .await?;

    Ok(())
}

/// Functions the demo profile's structures use. Every node registers the same set.
fn register_demo_functions(context: &Arc<ClusterContext>) {
    context.processors().register("increment", |_key, current, argument| {
        let by = argument.as_i64().unwrap_or(1);
        let next = current.and_then(Value::as_i64).unwrap_or(0) + by;
        ProcessorOutcome::set(json!(next), json!(next))
    });

    context.handlers().register("word_count", |payload: Value| async move {
        let text = payload["text"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing text"))?;
        Ok(json!({ "words": text.split_whitespace().count() }))
    });

    context.handlers().register("sleep", |payload: Value| async move {
        let ms = payload["ms"].as_u64().unwrap_or(1000);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    });
}

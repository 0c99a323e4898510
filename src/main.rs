use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use warden::cache::redis_sync::RedisSync;
use warden::config::{Config, HostsFileConfig};
use warden::error::{Result, WardenError};
use warden::http_server::{HttpState, run_http_server};
use warden::metrics::Metrics;
use warden::resolver::build_chain;
use warden::resolver::hosts_file::HostsTable;
use warden::server::{ServerContext, run_dot_server, run_tcp_server, run_udp_server};

/// Warden — a filtering, caching DNS proxy.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("WARDEN_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Cli::parse()).await {
        error!("startup failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    let metrics = Arc::new(Metrics::new()?);
    let cancel = CancellationToken::new();

    // Process-wide instance id, used for Redis self-dedup.
    let instance_id = uuid::Uuid::new_v4();
    let redis = if config.redis.enabled() {
        match RedisSync::connect(&config.redis.addresses, instance_id).await {
            Ok(redis) => Some(Arc::new(redis)),
            Err(e) => {
                warn!("redis unavailable, continuing with the local cache only: {}", e);
                None
            }
        }
    } else {
        None
    };

    let hosts_table = load_hosts_table(&config.hosts_file);
    let chain = build_chain(&config, hosts_table, metrics.clone(), redis, cancel.clone()).await?;
    chain.groups.init(&cancel).await?;

    let max_concurrent = if config.max_concurrent_queries == 0 {
        10_000
    } else {
        config.max_concurrent_queries
    };
    let context = ServerContext {
        chain: chain.head.clone(),
        metrics: metrics.clone(),
        query_semaphore: Arc::new(Semaphore::new(max_concurrent)),
        cancel: cancel.clone(),
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut servers: Vec<tokio::task::JoinHandle<Result<()>>> = Vec::new();

    let dns_addr = config.dns_bind_addr()?;
    servers.push(tokio::spawn(run_udp_server(dns_addr, context.clone(), shutdown_tx.subscribe())));
    servers.push(tokio::spawn(run_tcp_server(dns_addr, context.clone(), shutdown_tx.subscribe())));

    if let Some(tls_addr) = &config.ports.tls {
        let tls_addr: std::net::SocketAddr = tls_addr
            .parse()
            .map_err(|_| WardenError::Config(format!("invalid TLS bind address {}", tls_addr)))?;
        let (cert_file, key_file) = match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => {
                return Err(WardenError::Config(
                    "ports.tls requires certFile and keyFile".into(),
                ));
            }
        };
        let dot_context = context.clone();
        let dot_shutdown = shutdown_tx.subscribe();
        servers.push(tokio::spawn(async move {
            run_dot_server(tls_addr, &cert_file, &key_file, dot_context, dot_shutdown).await
        }));
    }

    if let Some(http_addr) = &config.ports.http {
        let http_addr: std::net::SocketAddr = http_addr
            .parse()
            .map_err(|_| WardenError::Config(format!("invalid HTTP bind address {}", http_addr)))?;
        let state = HttpState { context: context.clone(), blocking: chain.blocking.clone() };
        servers.push(tokio::spawn(run_http_server(http_addr, state, shutdown_tx.subscribe())));
    }

    info!("warden is up, serving DNS on {}", dns_addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        (finished, _, _) = futures::future::select_all(&mut servers) => {
            match finished {
                Ok(Ok(())) => warn!("a listener exited unexpectedly"),
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(WardenError::Startup(format!("listener task failed: {}", e))),
            }
        }
    }

    // Stop accepting, cancel background work, give in-flight queries a
    // moment to drain.
    let _ = shutdown_tx.send(());
    cancel.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    info!("shutdown complete");
    Ok(())
}

/// Materialise the hosts table from the configured sources. The chain only
/// consumes the parsed table; reading `/etc/hosts`-shaped files
/// (`ip name [name…]`, `#` comments) lives out here with the rest of the
/// wiring. Unreadable sources log a warning and are skipped.
fn load_hosts_table(config: &HostsFileConfig) -> HostsTable {
    let mut table = HostsTable::default();
    for source in &config.sources {
        let raw = match std::fs::read_to_string(source) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("cannot read hosts source {}: {}", source.display(), e);
                continue;
            }
        };
        let before = table.len();
        for line in raw.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(ip_field) = fields.next() else { continue };
            let Ok(ip) = ip_field.parse::<std::net::IpAddr>() else {
                debug!("skipping hosts line without address: {}", line);
                continue;
            };
            let names: Vec<String> = fields.map(|s| s.to_string()).collect();
            if !names.is_empty() {
                table.insert(ip, &names);
            }
        }
        info!("loaded {} hosts names from {}", table.len() - before, source.display());
    }
    table
}

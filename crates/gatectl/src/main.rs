use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gate_core::{
    AccessConfig, AccessVerifier, CookieSource, CookieTransport, CounterStore, GateConfig,
    HeaderValue, InMemoryCounterStore, InboundRequest, RateLimiter, ReqwestTransport, StoreConfig,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "gatectl", version, about = "Request gate: access checks and rate limits")]
struct Cli {
    #[arg(long, default_value = "./gate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Count one request against the rate limiter and print the outcome.
    Check {
        #[arg(long)]
        ip: Option<String>,

        /// Repeat to model a multi-valued header.
        #[arg(long = "forwarded-for")]
        forwarded_for: Vec<String>,

        #[arg(long)]
        peer: Option<IpAddr>,

        #[arg(long)]
        trust_proxy: bool,

        #[arg(long)]
        limit: Option<u32>,

        #[arg(long)]
        window: Option<u64>,

        #[arg(long, value_enum, default_value_t = StoreKind::Redis)]
        store: StoreKind,

        #[arg(long)]
        redis_url: Option<String>,

        /// Send the same request this many times.
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Ask the authorization backend about a session cookie.
    Verify {
        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        cookie_name: Option<String>,

        #[arg(long, default_value = "")]
        cookie_value: String,

        #[arg(long)]
        split_headers: bool,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Probe the counter store.
    Ping {
        #[arg(long, value_enum, default_value_t = StoreKind::Redis)]
        store: StoreKind,

        #[arg(long)]
        redis_url: Option<String>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    Redis,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = GateConfig::load(&cli.config)?;
    debug!(path = %cli.config.display(), "config loaded");

    match cli.command {
        Commands::Check {
            ip,
            forwarded_for,
            peer,
            trust_proxy,
            limit,
            window,
            store,
            redis_url,
            repeat,
        } => {
            let mut options = config.rate.clone();
            if let Some(limit) = limit {
                options.limit = limit;
            }
            if let Some(window) = window {
                options.window = window;
            }
            options.trust_proxy |= trust_proxy;
            options.validate()?;

            let store = open_store(store, &store_config(&config, redis_url))?;
            let limiter = RateLimiter::new(store, options);
            let req = inbound_request(ip, forwarded_for, peer);
            for _ in 0..repeat {
                let outcome = limiter.check(&req).await;
                println!("{}", serde_json::to_string(&outcome)?);
            }
        }
        Commands::Verify {
            url,
            cookie_name,
            cookie_value,
            split_headers,
            timeout_ms,
        } => {
            let access = access_config(config.access.clone(), url, cookie_name, split_headers, timeout_ms)?;
            let transport = ReqwestTransport::new(Duration::from_millis(access.timeout_ms))?;
            let verifier = AccessVerifier::new(
                Arc::new(transport),
                access.backend_url,
                access.cookie_name,
                access.transport,
            );
            let outcome = verifier.verify(CookieSource::Raw(&cookie_value)).await;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        Commands::Ping { store, redis_url } => {
            let store = open_store(store, &store_config(&config, redis_url))?;
            let timeout = Duration::from_millis(config.rate.timeout_ms);
            tokio::time::timeout(timeout, store.ping())
                .await
                .context("store did not answer")?
                .context("store ping")?;
            info!("store is reachable");
            println!("PONG");
        }
    }
    Ok(())
}

fn inbound_request(
    ip: Option<String>,
    mut forwarded_for: Vec<String>,
    peer: Option<IpAddr>,
) -> InboundRequest {
    let mut req = InboundRequest::new();
    req.ip = ip;
    req.peer_addr = peer;
    match forwarded_for.len() {
        0 => {}
        1 => {
            let value = forwarded_for.remove(0);
            req = req.with_header(gate_core::client_ip::FORWARDED_FOR, HeaderValue::Single(value));
        }
        _ => {
            req = req.with_header(gate_core::client_ip::FORWARDED_FOR, HeaderValue::Multi(forwarded_for));
        }
    }
    req
}

fn store_config(config: &GateConfig, redis_url: Option<String>) -> StoreConfig {
    let mut store = config.store.clone();
    if redis_url.is_some() {
        store.url = redis_url;
    }
    store
}

fn access_config(
    from_file: Option<AccessConfig>,
    url: Option<String>,
    cookie_name: Option<String>,
    split_headers: bool,
    timeout_ms: Option<u64>,
) -> Result<AccessConfig> {
    let backend_url = url
        .or_else(|| from_file.as_ref().map(|a| a.backend_url.clone()))
        .context("--url is required when the config has no [access] section")?;
    let cookie_name = cookie_name
        .or_else(|| from_file.as_ref().map(|a| a.cookie_name.clone()))
        .context("--cookie-name is required when the config has no [access] section")?;
    let transport = if split_headers {
        CookieTransport::SplitHeaders
    } else {
        from_file.as_ref().map(|a| a.transport).unwrap_or_default()
    };
    let timeout_ms = timeout_ms
        .or_else(|| from_file.as_ref().map(|a| a.timeout_ms))
        .unwrap_or(5000);
    Ok(AccessConfig {
        backend_url,
        cookie_name,
        transport,
        timeout_ms,
    })
}

fn open_store(kind: StoreKind, config: &StoreConfig) -> Result<Arc<dyn CounterStore>> {
    match kind {
        StoreKind::Memory => Ok(Arc::new(InMemoryCounterStore::new())),
        StoreKind::Redis => {
            #[cfg(feature = "redis")]
            {
                let client = redis::Client::open(config.connection_info()?)
                    .context("open redis client")?;
                Ok(Arc::new(gate_core::store::redis_store::RedisCounterStore::new(client)))
            }
            #[cfg(not(feature = "redis"))]
            {
                let _ = config;
                tracing::warn!("redis feature not enabled, using in-memory counters");
                Ok(Arc::new(InMemoryCounterStore::new()))
            }
        }
    }
}

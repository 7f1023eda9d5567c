//! The zipper binary: a dispatcher routing tagged frames between sources,
//! stream functions, and peer zippers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use iroh::address_lookup::{DnsAddressLookup, MdnsAddressLookup, PkarrPublisher};
use iroh::{Endpoint, SecretKey};
use seam_core::{ALPN, Authenticator, TokenAuthenticator, load_secret_key};
use seam_zipper::api::ApiState;
use seam_zipper::{MetricsEncoder, Zipper, ZipperMetrics, accept_connection};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "zipper")]
#[command(about = "Run a seam zipper")]
struct Args {
    /// File holding the zipper's 32-byte secret key (raw or base58).
    #[arg(short, long)]
    key_file: Option<PathBuf>,

    #[arg(short = 'B', long, default_value = "0.0.0.0:0")]
    bind: String,

    #[arg(short, long, default_value = "0.0.0.0:9090")]
    api_bind: SocketAddr,

    /// Shared token accepted from `token:<value>` credentials. Without
    /// one, every credential is accepted.
    #[arg(short, long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let secret_key = if let Some(ref key_path) = args.key_file {
        info!(?key_path, "loading secret key from file");
        let bytes = load_secret_key(key_path)?;
        SecretKey::from_bytes(&bytes)
    } else {
        let key = SecretKey::generate();
        info!(
            public_key = %key.public(),
            "generated ephemeral secret key (use --key-file to persist)"
        );
        key
    };

    let transport_config = iroh::endpoint::QuicTransportConfig::builder()
        .keep_alive_interval(std::time::Duration::from_secs(5))
        .max_idle_timeout(Some(std::time::Duration::from_secs(10).try_into().unwrap()))
        .build();

    let mut endpoint_builder = Endpoint::builder(iroh::endpoint::presets::Empty)
        .transport_config(transport_config)
        .secret_key(secret_key.clone())
        .alpns(vec![ALPN.to_vec()])
        .address_lookup(PkarrPublisher::n0_dns())
        .address_lookup(DnsAddressLookup::n0_dns())
        .address_lookup(MdnsAddressLookup::builder());

    for addr in tokio::net::lookup_host(&args.bind).await? {
        endpoint_builder = endpoint_builder.bind_addr(addr)?;
    }

    let endpoint = endpoint_builder.bind().await?;

    let authenticators: Vec<Box<dyn Authenticator>> = match args.token {
        Some(token) => vec![Box::new(TokenAuthenticator::new(token))],
        None => Vec::new(),
    };

    let metrics = Arc::new(MetricsEncoder::new(ZipperMetrics::new()));
    let zipper = Zipper::new(authenticators, metrics.clone());

    let api_state = ApiState {
        metrics,
        endpoint: endpoint.clone(),
        registry: zipper.registry().clone(),
    };
    let api_listener = tokio::net::TcpListener::bind(args.api_bind).await?;
    info!(addr = %args.api_bind, "API server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(api_listener, seam_zipper::api::router(api_state)).await {
            error!(error = %e, "API server error");
        }
    });

    let zipper_addr = bs58::encode(endpoint.id().as_bytes()).into_string();
    info!(zipper_addr, "zipper listening");
    println!("Zipper address: {zipper_addr}");

    while let Some(incoming) = endpoint.accept().await {
        let zipper = zipper.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_connection(incoming, zipper).await {
                error!(error = %e, "connection error");
            }
        });
    }

    Ok(())
}

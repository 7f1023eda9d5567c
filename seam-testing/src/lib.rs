//! Test utilities for seam integration tests.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use iroh::address_lookup::{AddressLookup, EndpointData, EndpointInfo, Item};
use iroh::{Endpoint, EndpointId, RelayMode};
use seam_core::{ALPN, Authenticator};
use seam_zipper::{MetricsEncoder, Zipper, ZipperMetrics, accept_connection};
use tracing_subscriber::{EnvFilter, fmt};

type LookupStream = std::pin::Pin<
    Box<dyn futures::Stream<Item = Result<Item, iroh::address_lookup::Error>> + Send>,
>;

/// In-process discovery so test zippers and clients can dial each other
/// by endpoint id without DNS or mDNS: one shared address map, fed by
/// every endpoint [`attach`](LocalDiscovery::attach)ed to it.
#[derive(Debug, Clone, Default)]
pub struct LocalDiscovery {
    addrs: Arc<Mutex<HashMap<EndpointId, EndpointData>>>,
}

impl LocalDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire an endpoint into this discovery: its addresses are published
    /// into the shared map, and peers are resolved from it.
    pub fn attach(&self, endpoint: &Endpoint) {
        endpoint
            .address_lookup()
            .expect("endpoint is not closed")
            .add(Attached {
                id: endpoint.id(),
                discovery: self.clone(),
            });
    }
}

/// The lookup registered on one endpoint; it knows which id to publish
/// under, which is why this is not implemented on [`LocalDiscovery`]
/// directly.
#[derive(Debug)]
struct Attached {
    id: EndpointId,
    discovery: LocalDiscovery,
}

impl AddressLookup for Attached {
    fn publish(&self, data: &EndpointData) {
        self.discovery
            .addrs
            .lock()
            .unwrap()
            .insert(self.id, data.clone());
    }

    fn resolve(&self, endpoint_id: EndpointId) -> Option<LookupStream> {
        let found: Vec<_> = self
            .discovery
            .addrs
            .lock()
            .unwrap()
            .get(&endpoint_id)
            .map(|data| {
                Ok(Item::new(
                    EndpointInfo::from_parts(endpoint_id, data.clone()),
                    "local",
                    None,
                ))
            })
            .into_iter()
            .collect();
        Some(Box::pin(futures::stream::iter(found)))
    }
}

/// Safe to call multiple times.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("seam=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Localhost-only endpoint attached to the shared discovery.
///
/// # Panics
/// Panics if the endpoint fails to bind.
pub async fn test_endpoint(discovery: &LocalDiscovery) -> Endpoint {
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
    let transport_config = iroh::endpoint::QuicTransportConfig::builder()
        .keep_alive_interval(std::time::Duration::from_secs(1))
        .max_idle_timeout(Some(std::time::Duration::from_secs(5).try_into().unwrap()))
        .build();

    let endpoint = Endpoint::builder(iroh::endpoint::presets::Empty)
        .transport_config(transport_config)
        .alpns(vec![ALPN.to_vec()])
        .bind_addr(bind_addr)
        .expect("valid bind address")
        .bind()
        .await
        .expect("failed to create endpoint");

    discovery.attach(&endpoint);
    endpoint
}

/// Returns (accept-loop handle, base58 zipper address, zipper state).
///
/// # Panics
/// Panics if the zipper endpoint fails to start.
pub async fn spawn_zipper(
    discovery: &LocalDiscovery,
    authenticators: Vec<Box<dyn Authenticator>>,
) -> (tokio::task::JoinHandle<()>, String, Zipper) {
    let endpoint = test_endpoint(discovery).await;
    let zipper_addr = bs58::encode(endpoint.id().as_bytes()).into_string();

    let metrics = Arc::new(MetricsEncoder::new(ZipperMetrics::new()));
    let zipper = Zipper::new(authenticators, metrics);

    let task = tokio::spawn({
        let endpoint = endpoint.clone();
        let zipper = zipper.clone();
        async move {
            while let Some(incoming) = endpoint.accept().await {
                let zipper = zipper.clone();
                tokio::spawn(async move {
                    let _ = accept_connection(incoming, zipper).await;
                });
            }
        }
    });

    (task, zipper_addr, zipper)
}

//! A locality: one participant in a mesh.
//!
//! Each locality owns a [`Registry`] of published objects, the root-side
//! state of any collectives rooted here, and RPC clients for every peer.
//! It serves `LocalityService` either over in-process tarpc channels or
//! over iroh QUIC connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tarpc::context;
use tarpc::server::{BaseChannel, Channel};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::collective::Collectives;
use crate::config::MeshConfig;
use crate::directory::LocalityDescriptor;
use crate::error::MeshError;
use crate::protocol::{Contribution, FetchReply, WireRegion};
use crate::registry::Registry;
use crate::transport::{
    tarpc_transport, LocalityService, LocalityServiceClient, MeshTransport, QuicStream,
};

/// RPC context whose deadline is `timeout` from now.
pub(crate) fn rpc_context(timeout: std::time::Duration) -> context::Context {
    let mut ctx = context::current();
    ctx.deadline = Instant::now() + timeout;
    ctx
}

struct LocalityInner {
    id: u32,
    num_localities: u32,
    config: MeshConfig,
    registry: Registry,
    collectives: Collectives,
    peers: RwLock<HashMap<u32, LocalityServiceClient>>,
    rounds: Mutex<HashMap<String, u64>>,
}

/// Handle to one locality. Cheap to clone.
#[derive(Clone)]
pub struct Locality {
    inner: Arc<LocalityInner>,
}

impl std::fmt::Debug for Locality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Locality({}/{})", self.inner.id, self.inner.num_localities)
    }
}

impl Locality {
    /// Create locality `id` of a mesh with `num_localities` members.
    pub fn new(id: u32, num_localities: u32, config: MeshConfig) -> Result<Self, MeshError> {
        LocalityDescriptor::new(id, num_localities)?;
        if config.root >= num_localities {
            return Err(MeshError::InvalidSite {
                site: config.root,
                num_sites: num_localities,
            });
        }
        let collectives = Collectives::new(config.collective_timeout);
        Ok(Self {
            inner: Arc::new(LocalityInner {
                id,
                num_localities,
                config,
                registry: Registry::new(),
                collectives,
                peers: RwLock::new(HashMap::new()),
                rounds: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// This locality's id.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Number of localities in the mesh.
    pub fn num_localities(&self) -> u32 {
        self.inner.num_localities
    }

    pub fn descriptor(&self) -> LocalityDescriptor {
        LocalityDescriptor {
            locality_id: self.inner.id,
            num_localities: self.inner.num_localities,
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub(crate) fn collectives(&self) -> &Collectives {
        &self.inner.collectives
    }

    /// Suffix `base` with how many times this locality has asked for it.
    ///
    /// Localities run the same program, so the n-th use of a base name is
    /// the same round everywhere. Names and keys from here are never
    /// reused, even while a slow peer still holds the previous round.
    pub(crate) fn round(&self, base: &str) -> String {
        let mut rounds = self
            .inner
            .rounds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let n = rounds.entry(base.to_string()).or_insert(0);
        let name = format!("{base}#{n}");
        *n += 1;
        name
    }

    /// Register the RPC client used to reach locality `site`.
    pub async fn add_peer(&self, site: u32, client: LocalityServiceClient) {
        self.inner.peers.write().await.insert(site, client);
    }

    /// Client for locality `site`.
    pub async fn peer(&self, site: u32) -> Result<LocalityServiceClient, MeshError> {
        if site >= self.inner.num_localities {
            return Err(MeshError::InvalidSite {
                site,
                num_sites: self.inner.num_localities,
            });
        }
        self.inner
            .peers
            .read()
            .await
            .get(&site)
            .cloned()
            .ok_or_else(|| MeshError::RemoteUnreachable(format!("locality {site} is not connected")))
    }

    /// Number of connected peers.
    pub async fn num_peers(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    /// Resolve `name` on locality `site`, returning the object id there.
    pub async fn resolve_remote(&self, site: u32, name: &str) -> Result<u64, MeshError> {
        if site == self.inner.id {
            return self
                .inner
                .registry
                .resolve(name, self.inner.config.resolve_timeout)
                .await;
        }
        let client = self.peer(site).await?;
        // The remote side waits up to its own resolve timeout; use the same deadline.
        client
            .resolve(rpc_context(self.inner.config.resolve_timeout), name.to_string())
            .await?
            .map_err(MeshError::RemoteUnreachable)
    }

    /// Fetch object `object` (or a region of it) from locality `site`.
    pub async fn fetch_remote(
        &self,
        site: u32,
        object: u64,
        region: Option<WireRegion>,
    ) -> Result<FetchReply, MeshError> {
        let client = self.peer(site).await?;
        client
            .fetch(rpc_context(self.inner.config.fetch_timeout), object, region)
            .await?
            .map_err(MeshError::RemoteUnreachable)
    }

    /// Ping every connected peer, returning the ids that answered.
    pub async fn ping_all(&self) -> Vec<u32> {
        let peers = self.inner.peers.read().await;
        let mut alive = Vec::new();
        for (site, client) in peers.iter() {
            match client.ping(context::current(), u64::from(*site)).await {
                Ok(seq) if seq == u64::from(*site) => alive.push(*site),
                _ => warn!("locality {site} did not respond to ping"),
            }
        }
        alive.sort_unstable();
        alive
    }

    fn handler(&self) -> LocalityHandler {
        LocalityHandler {
            inner: self.inner.clone(),
        }
    }

    /// Serve this locality over an in-process tarpc channel.
    ///
    /// Returns a client peers can use to reach it.
    pub fn spawn_channel(&self) -> LocalityServiceClient {
        let (client_transport, server_transport) = tarpc::transport::channel::unbounded();
        let server = BaseChannel::with_defaults(server_transport);
        let handler = self.handler();
        tokio::spawn(async move {
            use futures_util::StreamExt;
            server
                .execute(handler.serve())
                .for_each(|response| async move {
                    tokio::spawn(response);
                })
                .await;
        });
        LocalityServiceClient::new(tarpc::client::Config::default(), client_transport).spawn()
    }

    /// Serve a single incoming QUIC connection via tarpc.
    pub async fn serve_connection(&self, conn: iroh::endpoint::Connection) -> Result<(), MeshError> {
        let transport = tarpc_transport(QuicStream::accept(&conn).await?);
        let server = BaseChannel::with_defaults(transport);
        let handler = self.handler();
        tokio::spawn(async move {
            use futures_util::StreamExt;
            server
                .execute(handler.serve())
                .for_each(|response| async move {
                    tokio::spawn(response);
                })
                .await;
        });
        Ok(())
    }

    /// Accept loop: serve tarpc over incoming QUIC connections until the
    /// endpoint closes.
    pub async fn serve(&self, transport: &MeshTransport) -> Result<(), MeshError> {
        while let Some(incoming) = transport.accept().await {
            let this = self.clone();
            // Handshakes proceed in parallel so one slow peer does not block
            // the others.
            tokio::spawn(async move {
                let conn = match incoming.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("locality {}: incoming connection failed: {e}", this.id());
                        return;
                    }
                };
                if let Err(e) = this.serve_connection(conn).await {
                    warn!("locality {}: {e}", this.id());
                }
            });
        }
        info!("locality {} stopped accepting connections", self.id());
        Ok(())
    }

    /// Open a tarpc client to `peer` over QUIC and register it as `site`.
    pub async fn connect_quic(
        &self,
        transport: &MeshTransport,
        site: u32,
        peer: impl Into<iroh::EndpointAddr>,
    ) -> Result<(), MeshError> {
        let conn = transport.connect(peer).await?;
        let transport = tarpc_transport(QuicStream::open(&conn).await?);
        let client = LocalityServiceClient::new(tarpc::client::Config::default(), transport).spawn();
        self.add_peer(site, client).await;
        info!("locality {} connected to locality {site}", self.id());
        Ok(())
    }
}

/// tarpc service implementation for localities.
#[derive(Clone)]
struct LocalityHandler {
    inner: Arc<LocalityInner>,
}

impl LocalityService for LocalityHandler {
    async fn resolve(self, _ctx: context::Context, name: String) -> Result<u64, String> {
        self.inner
            .registry
            .resolve(&name, self.inner.config.resolve_timeout)
            .await
            .map_err(|e| e.to_string())
    }

    async fn fetch(
        self,
        _ctx: context::Context,
        object: u64,
        region: Option<WireRegion>,
    ) -> Result<FetchReply, String> {
        self.inner
            .registry
            .read(object, region.as_deref())
            .map(FetchReply::new)
            .map_err(|e| e.to_string())
    }

    async fn contribute(
        self,
        _ctx: context::Context,
        key: String,
        rank: u32,
        participants: u32,
        contribution: Contribution,
    ) -> Result<Vec<u8>, String> {
        if self.inner.config.root != self.inner.id {
            return Err(format!(
                "locality {} is not the collective root (root is {})",
                self.inner.id, self.inner.config.root
            ));
        }
        let collectives = &self.inner.collectives;
        let rx = collectives.join(&key, rank, participants, contribution, None);
        collectives
            .wait(&key, rx, self.inner.config.collective_timeout)
            .await
    }

    async fn ping(self, _ctx: context::Context, seq: u64) -> u64 {
        seq
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::encode;
    use crate::registry::Published;
    use crate::tiling::TilingSpan;

    struct Word(&'static str);

    impl Published for Word {
        fn read(&self, _region: Option<&[TilingSpan]>) -> Result<Vec<u8>, MeshError> {
            encode(self.0)
        }
    }

    #[test]
    fn rejects_out_of_range_ids() {
        assert!(Locality::new(3, 3, MeshConfig::default()).is_err());
        assert!(Locality::new(0, 2, MeshConfig::default().with_root(2)).is_err());
    }

    #[test]
    fn rounds_count_per_base_name() {
        let loc = Locality::new(0, 1, MeshConfig::default()).unwrap();
        assert_eq!(loc.round("v@0/slice"), "v@0/slice#0");
        assert_eq!(loc.round("v@0/slice"), "v@0/slice#1");
        assert_eq!(loc.round("v@0/rhs"), "v@0/rhs#0");
    }

    #[tokio::test]
    async fn resolve_and_fetch_over_channel() {
        let a = Locality::new(0, 2, MeshConfig::default()).unwrap();
        let b = Locality::new(1, 2, MeshConfig::default()).unwrap();
        a.add_peer(1, b.spawn_channel()).await;

        b.registry().publish("greeting/1", Arc::new(Word("hello"))).unwrap();
        let id = a.resolve_remote(1, "greeting/1").await.unwrap();
        let reply = a.fetch_remote(1, id, None).await.unwrap();
        assert_eq!(reply.decode::<String>().unwrap(), "hello");
    }

    #[tokio::test]
    async fn ping_reports_connected_peers() {
        let a = Locality::new(0, 3, MeshConfig::default()).unwrap();
        let b = Locality::new(1, 3, MeshConfig::default()).unwrap();
        let c = Locality::new(2, 3, MeshConfig::default()).unwrap();
        a.add_peer(2, c.spawn_channel()).await;
        a.add_peer(1, b.spawn_channel()).await;
        assert_eq!(a.ping_all().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let a = Locality::new(0, 2, MeshConfig::default()).unwrap();
        assert!(matches!(a.peer(1).await, Err(MeshError::RemoteUnreachable(_))));
        assert!(matches!(a.peer(5).await, Err(MeshError::InvalidSite { .. })));
    }
}

//! Mesh construction: wiring localities to each other.
//!
//! [`Mesh::local`] runs every locality in this process, connected through
//! tarpc channels; it is what tests and single-host runs use.
//! [`MeshBuilder`] brings up one locality of a multi-process mesh over iroh
//! QUIC.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::locality::Locality;
use crate::transport::MeshTransport;

/// Every locality of an in-process mesh.
pub struct Mesh {
    localities: Vec<Locality>,
}

impl Mesh {
    /// Start building one locality of a QUIC mesh.
    pub fn builder() -> MeshBuilder {
        MeshBuilder::new()
    }

    /// Create `n` localities in this process, each connected to all others.
    pub async fn local(n: u32, config: MeshConfig) -> Result<Self, MeshError> {
        if n == 0 {
            return Err(MeshError::InvalidSite { site: 0, num_sites: 0 });
        }
        let localities = (0..n)
            .map(|id| Locality::new(id, n, config.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        for target in &localities {
            for source in &localities {
                if source.id() != target.id() {
                    source.add_peer(target.id(), target.spawn_channel()).await;
                }
            }
        }
        info!("in-process mesh of {n} localities ready");
        Ok(Self { localities })
    }

    pub fn localities(&self) -> &[Locality] {
        &self.localities
    }

    /// Locality `id`, if it exists.
    pub fn locality(&self, id: u32) -> Option<&Locality> {
        self.localities.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.localities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.localities.is_empty()
    }

    /// Run `f` on every locality concurrently and collect the results in
    /// locality order. This is how SPMD code is driven in-process: every
    /// locality executes the same program on its own shard.
    pub async fn run<F, Fut, R>(&self, f: F) -> Vec<R>
    where
        F: Fn(Locality) -> Fut,
        Fut: Future<Output = R>,
    {
        join_all(self.localities.iter().cloned().map(f)).await
    }
}

/// Builder for one locality of a mesh spanning several processes.
///
/// Every process builds its own locality with the same ordered peer list;
/// the position in that list is the locality id.
pub struct MeshBuilder {
    peers: Vec<iroh::EndpointAddr>,
    this_site: Option<u32>,
    config: MeshConfig,
    transport: Option<MeshTransport>,
}

impl MeshBuilder {
    fn new() -> Self {
        Self {
            peers: Vec::new(),
            this_site: None,
            config: MeshConfig::default(),
            transport: None,
        }
    }

    /// Append a locality's address. The entry for this process itself is
    /// never dialed.
    pub fn peer(mut self, addr: impl Into<iroh::EndpointAddr>) -> Self {
        self.peers.push(addr.into());
        self
    }

    /// Which entry of the peer list this process is.
    pub fn this_site(mut self, site: u32) -> Self {
        self.this_site = Some(site);
        self
    }

    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an already bound transport instead of creating one.
    pub fn transport(mut self, transport: MeshTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Bind (or adopt) the transport, start serving, and connect to every
    /// other locality.
    pub async fn build(self) -> Result<Locality, MeshError> {
        let n = u32::try_from(self.peers.len())
            .map_err(|_| MeshError::Transport("too many peers".into()))?;
        let site = match self.this_site {
            Some(site) => site,
            None => return Err(MeshError::Transport("this_site was not set".into())),
        };
        let locality = Locality::new(site, n, self.config)?;
        let transport = Arc::new(match self.transport {
            Some(t) => t,
            None => MeshTransport::new().await?,
        });

        {
            let locality = locality.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                if let Err(e) = locality.serve(&transport).await {
                    warn!("locality {} accept loop failed: {e}", locality.id());
                }
            });
        }

        for (peer_site, addr) in self.peers.into_iter().enumerate() {
            let peer_site = peer_site as u32;
            if peer_site != site {
                locality.connect_quic(&transport, peer_site, addr).await?;
            }
        }
        info!("locality {site} joined a mesh of {n}");
        Ok(locality)
    }
}

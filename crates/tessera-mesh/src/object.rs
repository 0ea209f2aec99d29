//! Distributed objects: one named value per site, fetchable from any site.
//!
//! A `DistributedObject<T>` holds this site's value and publishes it under
//! `"{base_name}/{site}"` in the locality's registry. Any site can then
//! fetch a copy of another site's value (or a rectangular region of it).
//! Site `i` is always served by mesh locality `i`.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::debug;

use tessera_tensor::{with_tensor, Array, Element, Tensor};

use crate::collective::barrier_among;
use crate::error::MeshError;
use crate::locality::Locality;
use crate::protocol::encode;
use crate::registry::Published;
use crate::tiling::{ranges, TilingSpan};

/// A value that can live in a [`DistributedObject`].
pub trait Shard: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Copy out the sub-range `region` (in this value's own coordinates).
    fn extract(&self, region: &[TilingSpan]) -> Result<Self, MeshError> {
        let _ = region;
        Err(MeshError::unsupported("fetch", "value does not support region fetches"))
    }
}

fn check_region(dims: &[usize], region: &[TilingSpan]) -> Result<(), MeshError> {
    if region.len() != dims.len()
        || region.iter().zip(dims).any(|(s, &d)| s.start > s.stop || s.stop > d)
    {
        return Err(MeshError::shape(
            "fetch",
            format!("region {region:?} does not fit a shard of shape {dims:?}"),
        ));
    }
    Ok(())
}

impl<T: Element> Shard for Tensor<T> {
    fn extract(&self, region: &[TilingSpan]) -> Result<Self, MeshError> {
        check_region(self.dims(), region)?;
        Ok(self.region(&ranges(region)))
    }
}

impl Shard for Array {
    fn extract(&self, region: &[TilingSpan]) -> Result<Self, MeshError> {
        with_tensor!(self, t => t.extract(region).map(Array::from))
    }
}

macro_rules! plain_shard {
    ($($ty:ty),*) => {
        $(impl Shard for $ty {})*
    };
}

plain_shard!(bool, u64, i64, f64, String);

/// Registry adapter serving the shared local value.
struct SharedShard<T>(Arc<RwLock<T>>);

impl<T: Shard> Published for SharedShard<T> {
    fn read(&self, region: Option<&[TilingSpan]>) -> Result<Vec<u8>, MeshError> {
        let value = self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match region {
            None => encode(&*value),
            Some(region) => encode(&value.extract(region)?),
        }
    }
}

/// Where a peer's value lives once resolved.
#[derive(Clone, Copy, Debug)]
struct RemoteRef {
    object: u64,
}

/// A value with one instance per site, addressable by site index.
pub struct DistributedObject<T: Shard> {
    base_name: String,
    this_site: u32,
    num_sites: u32,
    value: Arc<RwLock<T>>,
    locality: Locality,
    /// Per-site resolution cache; the cell guarantees a single resolve per
    /// site even when fetches race.
    resolved: Vec<OnceCell<RemoteRef>>,
}

impl<T: Shard> DistributedObject<T> {
    /// Publish `value` as this site's instance of `base_name`.
    ///
    /// `num_sites` defaults to the mesh size and `this_site` to the
    /// locality's id. A site index must be the locality's own id.
    pub fn create(
        locality: &Locality,
        base_name: impl Into<String>,
        value: T,
        num_sites: Option<u32>,
        this_site: Option<u32>,
    ) -> Result<Self, MeshError> {
        let num_sites = num_sites.unwrap_or_else(|| locality.num_localities());
        let this_site = this_site.unwrap_or_else(|| locality.id());
        if num_sites == 0 || num_sites > locality.num_localities() {
            return Err(MeshError::InvalidSite {
                site: this_site,
                num_sites,
            });
        }
        if this_site >= num_sites || this_site != locality.id() {
            return Err(MeshError::InvalidSite {
                site: this_site,
                num_sites,
            });
        }

        let base_name = base_name.into();
        let value = Arc::new(RwLock::new(value));
        let name = format!("{base_name}/{this_site}");
        locality
            .registry()
            .publish(&name, Arc::new(SharedShard(value.clone())))?;
        debug!("site {this_site} created {base_name} over {num_sites} sites");

        Ok(Self {
            base_name,
            this_site,
            num_sites,
            value,
            locality: locality.clone(),
            resolved: (0..num_sites).map(|_| OnceCell::new()).collect(),
        })
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn this_site(&self) -> u32 {
        self.this_site
    }

    pub fn num_sites(&self) -> u32 {
        self.num_sites
    }

    /// Registry name of `site`'s instance.
    pub fn name(&self, site: u32) -> String {
        format!("{}/{site}", self.base_name)
    }

    /// Borrow this site's value.
    pub fn local(&self) -> RwLockReadGuard<'_, T> {
        self.value.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mutably borrow this site's value. Peers fetching concurrently see
    /// either the old or the new value, never a torn one.
    pub fn local_mut(&self) -> RwLockWriteGuard<'_, T> {
        self.value.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_site(&self, site: u32) -> Result<(), MeshError> {
        if site >= self.num_sites {
            return Err(MeshError::InvalidSite {
                site,
                num_sites: self.num_sites,
            });
        }
        Ok(())
    }

    async fn resolve(&self, site: u32) -> Result<RemoteRef, MeshError> {
        let name = self.name(site);
        let cell = &self.resolved[site as usize];
        let remote = cell
            .get_or_try_init(|| async {
                let object = self.locality.resolve_remote(site, &name).await?;
                Ok::<_, MeshError>(RemoteRef { object })
            })
            .await?;
        Ok(*remote)
    }

    async fn fetch_inner(&self, site: u32, region: Option<&[TilingSpan]>) -> Result<T, MeshError> {
        self.check_site(site)?;
        if site == self.this_site {
            let value = self.local();
            return match region {
                None => Ok(value.clone()),
                Some(region) => value.extract(region),
            };
        }
        let remote = self.resolve(site).await?;
        let reply = self
            .locality
            .fetch_remote(site, remote.object, region.map(<[TilingSpan]>::to_vec))
            .await?;
        reply.decode()
    }

    /// Copy of `site`'s value. No communication for the local site.
    pub async fn fetch(&self, site: u32) -> Result<T, MeshError> {
        self.fetch_inner(site, None).await
    }

    /// Copy of a rectangular region of `site`'s value, in that value's own
    /// coordinates.
    pub async fn fetch_region(&self, site: u32, region: &[TilingSpan]) -> Result<T, MeshError> {
        self.fetch_inner(site, Some(region)).await
    }

    /// Wait until every site is done with the object, then unpublish it.
    pub async fn retire(self) -> Result<(), MeshError> {
        let key = format!("barrier/{}", self.base_name);
        barrier_among(&self.locality, &key, self.num_sites).await
    }
}

impl<T: Shard> Drop for DistributedObject<T> {
    fn drop(&mut self) {
        self.locality.registry().unpublish(&self.name(self.this_site));
    }
}

//! Name-based discovery service for one locality.
//!
//! Distributed objects publish their local shard here under a name; peers
//! resolve the name to an object id (waiting for it to appear if the owner
//! has not published yet) and then fetch by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::MeshError;
use crate::tiling::TilingSpan;

/// Something a locality can serve to its peers.
pub trait Published: Send + Sync {
    /// Encode the whole object, or the sub-range `region` of it, for the
    /// wire.
    fn read(&self, region: Option<&[TilingSpan]>) -> Result<Vec<u8>, MeshError>;
}

#[derive(Default)]
struct RegistryState {
    names: HashMap<String, u64>,
    objects: HashMap<u64, Arc<dyn Published>>,
    next_id: u64,
}

/// Publish/resolve table for the objects owned by one locality.
pub struct Registry {
    state: Mutex<RegistryState>,
    /// Bumped on every publish so waiting resolvers re-check.
    changed: watch::Sender<u64>,
    resolves: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            state: Mutex::new(RegistryState::default()),
            changed,
            resolves: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish `object` under `name`. Fails if the name is taken.
    pub fn publish(&self, name: &str, object: Arc<dyn Published>) -> Result<u64, MeshError> {
        let id = {
            let mut state = self.state();
            if state.names.contains_key(name) {
                return Err(MeshError::DuplicateName(name.to_string()));
            }
            let id = state.next_id;
            state.next_id += 1;
            state.names.insert(name.to_string(), id);
            state.objects.insert(id, object);
            id
        };
        debug!("published {name} as object {id}");
        self.changed.send_modify(|v| *v += 1);
        Ok(id)
    }

    /// Remove `name`. Fetches already holding the object complete normally.
    pub fn unpublish(&self, name: &str) {
        let mut state = self.state();
        if let Some(id) = state.names.remove(name) {
            state.objects.remove(&id);
            debug!("unpublished {name} (object {id})");
        }
    }

    /// Object id for `name`, if published.
    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.state().names.get(name).copied()
    }

    /// Object id for `name`, waiting up to `timeout` for it to be published.
    pub async fn resolve(&self, name: &str, timeout: Duration) -> Result<u64, MeshError> {
        self.resolves.fetch_add(1, Ordering::Relaxed);
        let mut rx = self.changed.subscribe();
        let wait = async {
            loop {
                if let Some(id) = self.lookup(name) {
                    return Ok(id);
                }
                trace!("waiting for {name} to be published");
                if rx.changed().await.is_err() {
                    return Err(MeshError::RemoteUnreachable(format!(
                        "registry closed while resolving {name}"
                    )));
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            MeshError::RemoteUnreachable(format!("{name} was not published within {timeout:?}"))
        })?
    }

    /// Read a published object by id.
    pub fn read(&self, id: u64, region: Option<&[TilingSpan]>) -> Result<Vec<u8>, MeshError> {
        let object = self
            .state()
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| MeshError::RemoteUnreachable(format!("object {id} is not published")))?;
        object.read(region)
    }

    /// Number of resolve requests this registry has answered.
    pub fn resolves_served(&self) -> u64 {
        self.resolves.load(Ordering::Relaxed)
    }

    /// Number of published objects.
    pub fn len(&self) -> usize {
        self.state().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Runtime configuration shared by every locality in a mesh.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeouts and collective layout for a mesh.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// How long a collective waits for every participant before failing.
    pub collective_timeout: Duration,
    /// How long name resolution waits for a peer to publish.
    pub resolve_timeout: Duration,
    /// Deadline for a single remote fetch.
    pub fetch_timeout: Duration,
    /// Rank that gathers and redistributes collective contributions.
    pub root: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            collective_timeout: Duration::from_secs(60),
            resolve_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(30),
            root: 0,
        }
    }
}

impl MeshConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the collective timeout.
    pub fn with_collective_timeout(mut self, timeout: Duration) -> Self {
        self.collective_timeout = timeout;
        self
    }

    /// Set the name-resolution timeout.
    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// Set the remote fetch deadline.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the collective root rank.
    pub fn with_root(mut self, root: u32) -> Self {
        self.root = root;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let c = MeshConfig::new()
            .with_collective_timeout(Duration::from_millis(250))
            .with_root(1);
        assert_eq!(c.collective_timeout, Duration::from_millis(250));
        assert_eq!(c.root, 1);
        assert_eq!(c.resolve_timeout, MeshConfig::default().resolve_timeout);
    }

    #[test]
    fn config_roundtrips_through_postcard() {
        let c = MeshConfig::new().with_fetch_timeout(Duration::from_secs(3));
        let bytes = postcard::to_allocvec(&c).unwrap();
        let back: MeshConfig = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(c, back);
    }
}

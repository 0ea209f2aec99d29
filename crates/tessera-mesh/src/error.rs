//! Error types for tessera-mesh.

use std::fmt;

/// Errors that can occur in distributed array operations.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshError {
    /// Operand ranks or dimensions are incompatible for the operator.
    ShapeMismatch { op: &'static str, detail: String },
    /// Axis argument outside the valid range for the operand's rank.
    InvalidAxis { op: &'static str, axis: usize, rank: usize },
    /// A distributed object created or addressed with an out-of-range site.
    InvalidSite { site: u32, num_sites: u32 },
    /// A remote fetch or collective participant failed to respond.
    RemoteUnreachable(String),
    /// The operator does not implement this tiling pattern.
    UnsupportedDistribution { op: &'static str, detail: String },
    /// A name was published twice on the same locality.
    DuplicateName(String),
    /// Transport-level error (iroh/QUIC).
    Transport(String),
    /// Serialization/deserialization error.
    Serde(String),
    /// Protocol version mismatch.
    VersionMismatch { expected: u32, got: u32 },
}

impl MeshError {
    pub(crate) fn shape(op: &'static str, detail: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            op,
            detail: detail.into(),
        }
    }

    pub(crate) fn unsupported(op: &'static str, detail: impl Into<String>) -> Self {
        Self::UnsupportedDistribution {
            op,
            detail: detail.into(),
        }
    }

    /// Whether this error came from a lost peer rather than bad input.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteUnreachable(_) | Self::Transport(_))
    }
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch { op, detail } => write!(f, "{op}: shape mismatch: {detail}"),
            Self::InvalidAxis { op, axis, rank } => {
                write!(f, "{op}: axis {axis} is out of range for an operand of rank {rank}")
            }
            Self::InvalidSite { site, num_sites } => {
                write!(f, "site {site} is out of range for {num_sites} sites")
            }
            Self::RemoteUnreachable(msg) => write!(f, "remote unreachable: {msg}"),
            Self::UnsupportedDistribution { op, detail } => {
                write!(f, "{op}: distribution not supported: {detail}")
            }
            Self::DuplicateName(name) => write!(f, "name {name:?} is already published"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Serde(msg) => write!(f, "serialization error: {msg}"),
            Self::VersionMismatch { expected, got } => {
                write!(f, "protocol version mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for MeshError {}

impl From<iroh::endpoint::ConnectError> for MeshError {
    fn from(e: iroh::endpoint::ConnectError) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<iroh::endpoint::ConnectionError> for MeshError {
    fn from(e: iroh::endpoint::ConnectionError) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<postcard::Error> for MeshError {
    fn from(e: postcard::Error) -> Self {
        Self::Serde(e.to_string())
    }
}

impl From<tarpc::client::RpcError> for MeshError {
    fn from(e: tarpc::client::RpcError) -> Self {
        Self::RemoteUnreachable(e.to_string())
    }
}

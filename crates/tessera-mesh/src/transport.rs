//! Wire transport between localities: tarpc over iroh QUIC.
//!
//! Each pair of localities shares one QUIC connection carrying one
//! bidirectional stream. The stream is framed with a length prefix and
//! JSON-encoded tarpc messages; the payloads inside those messages
//! (shards, collective values) are already postcard bytes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use iroh::endpoint::{Connection, Incoming, RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr};
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::error::MeshError;
use crate::protocol::{Contribution, FetchReply, WireRegion};

/// ALPN protocol identifier for tessera-mesh.
pub const ALPN: &[u8] = b"tessera-mesh/0";

/// A bound iroh endpoint speaking the tessera-mesh ALPN.
pub struct MeshTransport {
    endpoint: Endpoint,
}

impl MeshTransport {
    /// Bind an endpoint with the default iroh configuration.
    pub async fn new() -> Result<Self, MeshError> {
        let endpoint = Endpoint::builder()
            .alpns(vec![ALPN.to_vec()])
            .bind()
            .await
            .map_err(|e| MeshError::Transport(e.to_string()))?;
        Ok(Self { endpoint })
    }

    /// Adopt an endpoint bound elsewhere. It must accept [`ALPN`].
    pub fn from_endpoint(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Address other localities dial to reach this one.
    pub fn addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    pub async fn connect(&self, peer: impl Into<EndpointAddr>) -> Result<Connection, MeshError> {
        let peer = peer.into();
        debug!("dialing {peer:?}");
        Ok(self.endpoint.connect(peer, ALPN).await?)
    }

    /// Next incoming connection; `None` once the endpoint is closing.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    pub async fn close(self) {
        self.endpoint.close().await;
    }
}

/// One QUIC bidirectional stream as a single `AsyncRead + AsyncWrite`.
#[pin_project]
pub struct QuicStream {
    #[pin]
    recv: RecvStream,
    #[pin]
    send: SendStream,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { recv, send }
    }

    /// Open the RPC stream on a connection this side dialed.
    pub async fn open(conn: &Connection) -> Result<Self, MeshError> {
        let (send, recv) = conn.open_bi().await?;
        Ok(Self::new(send, recv))
    }

    /// Accept the RPC stream the dialing side opened.
    pub async fn accept(conn: &Connection) -> Result<Self, MeshError> {
        let (send, recv) = conn.accept_bi().await?;
        Ok(Self::new(send, recv))
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().recv.poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(self.project().send, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().send.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().send.poll_shutdown(cx)
    }
}

/// tarpc transport over a [`QuicStream`]: length-delimited frames of JSON.
pub fn tarpc_transport<Item, SinkItem>(
    stream: QuicStream,
) -> tarpc::serde_transport::Transport<
    QuicStream,
    Item,
    SinkItem,
    tokio_serde::formats::Json<Item, SinkItem>,
>
where
    Item: for<'de> serde::Deserialize<'de>,
    SinkItem: serde::Serialize,
{
    let framed = tokio_util::codec::length_delimited::Builder::new().new_framed(stream);
    tarpc::serde_transport::new(framed, tokio_serde::formats::Json::default())
}

/// RPC surface every locality serves to its peers.
///
/// Errors travel as strings; the calling side maps them back into
/// [`MeshError`].
#[tarpc::service]
pub trait LocalityService {
    /// Object id of a published name, waiting (up to the resolve timeout)
    /// for it to be published.
    async fn resolve(name: String) -> Result<u64, String>;

    /// Copy of a published object, or of a rectangular region of it.
    async fn fetch(object: u64, region: Option<WireRegion>) -> Result<FetchReply, String>;

    /// Hand a contribution to a collective rooted on this locality. Returns
    /// the combined value once every participant has arrived.
    async fn contribute(
        key: String,
        rank: u32,
        participants: u32,
        contribution: Contribution,
    ) -> Result<Vec<u8>, String>;

    /// Echoes `seq`.
    async fn ping(seq: u64) -> u64;
}

//! Transport establishment.
//!
//! [`Connector`] is the seam between the connection manager and the
//! network: the manager only asks for a fresh WebSocket stream and owns
//! everything after that. [`WsConnector`] is the real implementation.

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::ClientError;

/// WebSocket stream produced by a [`Connector`].
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Factory for transport connections.
pub trait Connector: Send + Sync + 'static {
    /// Performs one connection attempt against `url`.
    ///
    /// No retry happens here; the connection manager owns the retry loop.
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<WsStream, ClientError>>;
}

/// Plain `tokio-tungstenite` connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<WsStream, ClientError>> {
        Box::pin(async move {
            let (stream, response) = connect_async(url).await?;
            tracing::debug!(url, status = %response.status(), "websocket upgrade accepted");
            Ok(stream)
        })
    }
}

//! Message-oriented duplex transport
//!
//! [`Connector`] is the seam between the connection manager and the actual
//! socket. The production implementation speaks WebSocket through
//! `tokio-tungstenite`; tests plug in channel-backed fakes.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::error::NetworkError;

/// Large binary payload whose bytes become available later
pub struct BlobHandle {
    size_hint: Option<usize>,
    bytes: BoxFuture<'static, Result<Bytes, NetworkError>>,
}

impl BlobHandle {
    pub fn new(
        size_hint: Option<usize>,
        bytes: impl std::future::Future<Output = Result<Bytes, NetworkError>> + Send + 'static,
    ) -> Self {
        Self {
            size_hint,
            bytes: Box::pin(bytes),
        }
    }

    pub fn size_hint(&self) -> Option<usize> {
        self.size_hint
    }

    /// Wait for the payload to be fully available
    pub async fn materialize(self) -> Result<Bytes, NetworkError> {
        self.bytes.await
    }
}

impl fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobHandle").field("size_hint", &self.size_hint).finish()
    }
}

/// One transport-level message
#[derive(Debug)]
pub enum WireMessage {
    Binary(Bytes),
    Text(String),
    Blob(BlobHandle),
    Close(Option<u16>),
}

pub type WireSink = Pin<Box<dyn Sink<WireMessage, Error = NetworkError> + Send>>;
pub type WireStream = Pin<Box<dyn Stream<Item = Result<WireMessage, NetworkError>> + Send>>;

/// Both halves of an established connection
pub struct Transport {
    pub sink: WireSink,
    pub stream: WireStream,
}

/// Opens transports to an endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<Transport, NetworkError>;
}

/// Check an endpoint before handing it to a connector
pub fn validate_endpoint(endpoint: &str) -> Result<(), NetworkError> {
    let rest = endpoint
        .strip_prefix("ws://")
        .or_else(|| endpoint.strip_prefix("wss://"))
        .ok_or_else(|| NetworkError::InvalidEndpoint(format!("{endpoint}: expected ws:// or wss://")))?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(NetworkError::InvalidEndpoint(format!("{endpoint}: missing host")));
    }
    Ok(())
}

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

fn to_tungstenite(msg: WireMessage) -> Result<Message, NetworkError> {
    Ok(match msg {
        WireMessage::Binary(data) => Message::Binary(data.to_vec()),
        WireMessage::Text(text) => Message::Text(text),
        WireMessage::Close(code) => Message::Close(code.map(|code| CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        })),
        WireMessage::Blob(_) => {
            return Err(NetworkError::SendFailed("blob payloads cannot be sent".into()));
        }
    })
}

/// Errors after which the socket is unusable
fn is_terminal(e: &WsError) -> bool {
    matches!(
        e,
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_) | WsError::Protocol(_) | WsError::Tls(_)
    )
}

fn from_tungstenite(msg: Result<Message, WsError>) -> Option<Result<WireMessage, NetworkError>> {
    match msg {
        Ok(Message::Binary(data)) => Some(Ok(WireMessage::Binary(Bytes::from(data)))),
        Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text))),
        Ok(Message::Close(frame)) => Some(Ok(WireMessage::Close(frame.map(|f| u16::from(f.code))))),
        // Control frames are answered by tungstenite itself
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
        Err(e) if is_terminal(&e) => Some(Err(NetworkError::ConnectionLost(e.to_string()))),
        Err(e) => Some(Err(NetworkError::ReceiveError(e.to_string()))),
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<Transport, NetworkError> {
        validate_endpoint(endpoint)?;
        let (ws, response) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|e| NetworkError::ConnectFailed(format!("{endpoint}: {e}")))?;
        tracing::debug!("WebSocket handshake complete ({})", response.status());

        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(|e| NetworkError::SendFailed(e.to_string()))
            .with(|msg: WireMessage| futures_util::future::ready(to_tungstenite(msg)));
        let stream = stream.filter_map(|msg| futures_util::future::ready(from_tungstenite(msg)));

        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("ws://localhost:8000/ws").is_ok());
        assert!(validate_endpoint("wss://example.org/ws").is_ok());
        assert!(matches!(
            validate_endpoint("http://example.org/ws"),
            Err(NetworkError::InvalidEndpoint(_))
        ));
        assert!(matches!(validate_endpoint("ws:///ws"), Err(NetworkError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_inbound_mapping() {
        let binary = from_tungstenite(Ok(Message::Binary(vec![1, 2, 3]))).unwrap().unwrap();
        assert!(matches!(binary, WireMessage::Binary(ref b) if b.as_ref() == [1, 2, 3]));

        let close = from_tungstenite(Ok(Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "bye".into(),
        }))))
        .unwrap()
        .unwrap();
        assert!(matches!(close, WireMessage::Close(Some(1001))));

        assert!(from_tungstenite(Ok(Message::Ping(vec![]))).is_none());
        assert!(matches!(
            from_tungstenite(Err(WsError::ConnectionClosed)),
            Some(Err(NetworkError::ConnectionLost(_)))
        ));
        assert!(matches!(
            from_tungstenite(Err(WsError::Utf8)),
            Some(Err(NetworkError::ReceiveError(_)))
        ));
    }

    #[test]
    fn test_outbound_mapping() {
        let msg = to_tungstenite(WireMessage::Close(Some(1000))).unwrap();
        match msg {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1000),
            other => panic!("unexpected {:?}", other),
        }
        assert!(to_tungstenite(WireMessage::Blob(BlobHandle::new(None, async { Ok(Bytes::new()) }))).is_err());
    }

    #[tokio::test]
    async fn test_blob_materializes() {
        let blob = BlobHandle::new(Some(3), async { Ok(Bytes::from_static(b"abc")) });
        assert_eq!(blob.size_hint(), Some(3));
        assert_eq!(blob.materialize().await.unwrap(), Bytes::from_static(b"abc"));
    }
}

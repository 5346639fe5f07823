//! WebSocket forwarding: connect to a backend and pump frames both ways.
//!
//! The core is transport-agnostic on the client side, so the pump operates
//! on [`WsFrame`] streams; the embedding host adapts its own WebSocket type
//! (axum's, in the bundled server) to frames. The backend side is a
//! tokio-tungstenite connection owned here.

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

use super::{errors::UpstreamError, forwarder::build_target_url};

/// Transport-neutral WebSocket frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl WsFrame {
    fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text),
            Self::Binary(data) => Message::Binary(data),
            Self::Ping(data) => Message::Ping(data),
            Self::Pong(data) => Message::Pong(data),
            Self::Close => Message::Close(None),
        }
    }

    fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Self::Text(text)),
            Message::Binary(data) => Some(Self::Binary(data)),
            Message::Ping(data) => Some(Self::Ping(data)),
            Message::Pong(data) => Some(Self::Pong(data)),
            Message::Close(_) => Some(Self::Close),
            // Raw frames never surface from a complete message stream.
            Message::Frame(_) => None,
        }
    }
}

/// Rewrites an HTTP backend base URL into its WebSocket equivalent and joins
/// the request path and query.
#[must_use]
pub fn backend_ws_url(base_url: &str, path: &str, query: &str) -> String {
    let target = build_target_url(base_url, path, query);
    if let Some(rest) = target.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = target.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        target
    }
}

/// Connects to a backend WebSocket endpoint.
///
/// # Errors
///
/// Returns [`UpstreamError::WebSocket`] if the handshake fails.
pub async fn connect(
    url: &str,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    UpstreamError,
> {
    let (stream, response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|error| UpstreamError::WebSocket(format!("handshake with {url}: {error}")))?;
    tracing::debug!(url, status = response.status().as_u16(), "backend websocket connected");
    Ok(stream)
}

/// Pumps frames between the client connection and a backend connection until
/// either side closes or errors.
///
/// The client side arrives as separate stream and sink halves so hosts can
/// adapt their own WebSocket type with plain combinators. The pump is
/// symmetric: a close (or failure) on one side tears down the other. Errors
/// are logged, not propagated, since by that point there is no response left
/// to influence.
pub async fn pump<CS, CK, B>(client_stream: CS, client_sink: CK, backend: B)
where
    CS: Stream<Item = Result<WsFrame, String>> + Send + 'static,
    CK: Sink<WsFrame, Error = String> + Send + 'static,
    B: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
{
    let mut client_rx = std::pin::pin!(client_stream);
    let mut client_tx = std::pin::pin!(client_sink);
    let (mut backend_tx, mut backend_rx) = backend.split();

    let client_to_backend = async {
        while let Some(frame) = client_rx.next().await {
            match frame {
                Ok(frame) => {
                    let closing = frame == WsFrame::Close;
                    if backend_tx.send(frame.into_message()).await.is_err() || closing {
                        break;
                    }
                }
                Err(error) => {
                    tracing::debug!(error = %error, "client websocket read failed");
                    break;
                }
            }
        }
        let _ = backend_tx.send(Message::Close(None)).await;
    };

    let backend_to_client = async {
        while let Some(message) = backend_rx.next().await {
            match message {
                Ok(message) => {
                    let Some(frame) = WsFrame::from_message(message) else { continue };
                    let closing = frame == WsFrame::Close;
                    if client_tx.send(frame).await.is_err() || closing {
                        break;
                    }
                }
                Err(error) => {
                    tracing::debug!(%error, "backend websocket read failed");
                    break;
                }
            }
        }
        let _ = client_tx.send(WsFrame::Close).await;
    };

    // Either direction finishing ends the session.
    tokio::select! {
        () = client_to_backend => {}
        () = backend_to_client => {}
    }
}

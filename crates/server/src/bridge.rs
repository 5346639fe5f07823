//! Conversions between axum's wire types and the core's transport types.

use axum::{
    body::Body,
    extract::ws::{Message as AxumMessage, WebSocket},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use portico_core::{
    types::{GatewayRequest, GatewayResponse},
    upstream::{self, WsFrame},
};

/// Converts an incoming axum request into the core's request type.
///
/// The body is buffered: the gateway needs it whole for forwarding and the
/// policy features never stream.
pub async fn into_gateway_request(
    request: http::Request<Body>,
    remote_addr: Option<String>,
) -> Result<GatewayRequest, Response> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, 16 * 1024 * 1024).await.map_err(|_| {
        Response::builder()
            .status(http::StatusCode::PAYLOAD_TOO_LARGE)
            .body(Body::from("request body too large"))
            .expect("static response")
    })?;

    Ok(GatewayRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or("").to_string(),
        headers: parts.headers,
        body,
        remote_addr,
    })
}

/// Converts the core's response into an axum response.
pub fn into_axum_response(response: GatewayResponse) -> Response {
    let mut builder = Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = response.headers;
    }
    builder.body(Body::from(response.body)).unwrap_or_else(|_| {
        Response::builder()
            .status(http::StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .expect("static response")
    })
}

fn axum_message_to_frame(message: AxumMessage) -> Option<WsFrame> {
    match message {
        AxumMessage::Text(text) => Some(WsFrame::Text(text)),
        AxumMessage::Binary(data) => Some(WsFrame::Binary(data)),
        AxumMessage::Ping(data) => Some(WsFrame::Ping(data)),
        AxumMessage::Pong(data) => Some(WsFrame::Pong(data)),
        AxumMessage::Close(_) => Some(WsFrame::Close),
    }
}

fn frame_to_axum_message(frame: WsFrame) -> AxumMessage {
    match frame {
        WsFrame::Text(text) => AxumMessage::Text(text),
        WsFrame::Binary(data) => AxumMessage::Binary(data),
        WsFrame::Ping(data) => AxumMessage::Ping(data),
        WsFrame::Pong(data) => AxumMessage::Pong(data),
        WsFrame::Close => AxumMessage::Close(None),
    }
}

/// Connects to the backend target and pumps the client socket against it
/// until either side closes.
pub async fn run_ws_proxy(client: WebSocket, target_url: String) {
    let backend = match upstream::websocket::connect(&target_url).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::warn!(%error, target = %target_url, "backend websocket connect failed");
            // Dropping the client socket closes it; nothing else to send.
            return;
        }
    };

    let (client_sink, client_stream) = client.split();
    let client_stream = client_stream.filter_map(|item| async move {
        match item {
            Ok(message) => axum_message_to_frame(message).map(Ok),
            Err(error) => Some(Err(error.to_string())),
        }
    });
    let client_sink = client_sink
        .with(|frame: WsFrame| async move { Ok::<_, axum::Error>(frame_to_axum_message(frame)) })
        .sink_map_err(|error| error.to_string());

    upstream::websocket::pump(client_stream, client_sink, backend).await;
}

/// Bounds request body buffering.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

//! Websocket transport for the real-time stream.
//!
//! Thin I/O layer: opens the websocket, authenticates the handshake,
//! subscribes to one discussion topic, and turns inbound text frames into
//! decoded [`ServerEvent`]s. Lifecycle decisions (retry, timeout, status)
//! stay in the sans-IO connection machine; this layer only reports what the
//! socket did.

use futures::{SinkExt, StreamExt};
use parley_proto::{ClientFrame, DiscussionId, ServerEvent};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderValue, header},
        protocol::Message,
    },
};
use tracing::warn;

/// Transport errors. All of them are non-fatal to the session: the driver
/// reports them to the connection machine, which schedules a retry.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The handshake failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The live socket failed.
    #[error("stream error: {0}")]
    Stream(String),
}

/// Inbound traffic relevant to the driver.
#[derive(Debug)]
pub(crate) enum LinkFrame {
    /// A decoded push event for the subscribed topic.
    Event(ServerEvent),
    /// A keepalive pong.
    Pong,
}

/// One live, subscribed websocket.
pub(crate) struct WsLink {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    topic: DiscussionId,
}

/// Open the websocket and subscribe to one discussion topic.
///
/// The bearer credential goes into the handshake as an `Authorization`
/// header, or as an `access_token` query parameter when the transport cannot
/// carry headers. `token` may be `None` when the credential could not be
/// obtained; the connect still proceeds so the server rejects it uniformly.
pub(crate) async fn open(
    ws_url: &str,
    auth_in_query: bool,
    token: Option<&str>,
    topic: &DiscussionId,
) -> Result<WsLink, TransportError> {
    let mut url = ws_url.to_owned();
    if auth_in_query && let Some(token) = token {
        let separator = if url.contains('?') { '&' } else { '?' };
        url = format!("{url}{separator}access_token={token}");
    }

    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::Connection(format!("invalid endpoint: {e}")))?;

    if !auth_in_query && let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::Connection(format!("invalid credential: {e}")))?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }

    let (socket, _response) = connect_async(request)
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    let mut link = WsLink { socket, topic: topic.clone() };
    link.subscribe().await?;
    Ok(link)
}

impl WsLink {
    /// Send the subscription frame for the link's topic.
    async fn subscribe(&mut self) -> Result<(), TransportError> {
        let frame = ClientFrame::Subscribe { discussion_id: self.topic.clone() }
            .encode()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        self.socket
            .send(Message::text(frame))
            .await
            .map_err(|e| TransportError::Connection(format!("subscribe failed: {e}")))
    }

    /// Next relevant inbound frame.
    ///
    /// Malformed frames and frames for other discussions are dropped with a
    /// warning and reading continues. `Ok(None)` means the peer closed the
    /// socket.
    pub(crate) async fn next_frame(&mut self) -> Result<Option<LinkFrame>, TransportError> {
        loop {
            let Some(message) = self.socket.next().await else {
                return Ok(None);
            };
            let message = message.map_err(|e| TransportError::Stream(e.to_string()))?;

            match message {
                Message::Text(text) => match ServerEvent::decode(text.as_str()) {
                    Ok(mut event) => {
                        if let Some(id) = event.discussion_id()
                            && *id != self.topic
                        {
                            warn!(topic = %self.topic, other = %id, "dropping event for another discussion");
                            continue;
                        }
                        event.assume_discussion(&self.topic);
                        return Ok(Some(LinkFrame::Event(event)));
                    },
                    Err(e) => {
                        // One malformed frame never kills the stream.
                        warn!(error = %e, "dropping malformed push frame");
                    },
                },
                Message::Ping(payload) => {
                    self.socket
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| TransportError::Stream(e.to_string()))?;
                },
                Message::Pong(_) => return Ok(Some(LinkFrame::Pong)),
                Message::Close(_) => return Ok(None),
                Message::Binary(_) | Message::Frame(_) => {
                    warn!("ignoring unexpected non-text frame");
                },
            }
        }
    }

    /// Send a keepalive ping.
    pub(crate) async fn ping(&mut self) -> Result<(), TransportError> {
        self.socket
            .send(Message::Ping(bytes::Bytes::new()))
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))
    }

    /// Close the socket. Best effort; errors during teardown are discarded.
    pub(crate) async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

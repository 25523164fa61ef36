//! Gateway socket abstraction.
//!
//! A shard talks to the gateway through [`GatewayTransport`] and the
//! [`GatewaySocket`] it opens. [`WsTransport`] is the real implementation
//! over `tokio-tungstenite`; tests substitute a scripted server.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::trace;

use crate::close::CloseCode;
use crate::error::{GatewayError, Result};

/// An inbound socket message.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketMessage {
    /// A text frame.
    Text(String),
    /// The peer closed the socket.
    Closed {
        /// Close code, if the peer sent one.
        code: Option<CloseCode>,
        /// Close reason, possibly empty.
        reason: String,
    },
}

/// An open gateway socket.
#[async_trait]
pub trait GatewaySocket: Send {
    /// Sends one text frame.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Receives the next message. Must be cancel-safe.
    async fn recv(&mut self) -> Result<SocketMessage>;

    /// Closes the socket with `code`.
    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<()>;
}

/// Opens gateway sockets.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    /// Connects to `url`, failing after `timeout`.
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Box<dyn GatewaySocket>>;
}

/// [`GatewayTransport`] over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl GatewayTransport for WsTransport {
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Box<dyn GatewaySocket>> {
        let connecting = connect_async(url);
        let (stream, _) = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| GatewayError::Connection {
                reason: format!("timed out after {:?} connecting to {}", timeout, url),
            })?
            .map_err(connection_error)?;
        Ok(Box::new(WsSocket { stream }))
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

fn connection_error(error: tokio_tungstenite::tungstenite::Error) -> GatewayError {
    GatewayError::Connection {
        reason: error.to_string(),
    }
}

#[async_trait]
impl GatewaySocket for WsSocket {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(connection_error)
    }

    async fn recv(&mut self) -> Result<SocketMessage> {
        loop {
            let message = match self.stream.next().await {
                Some(message) => message.map_err(connection_error)?,
                None => {
                    return Ok(SocketMessage::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    })
                }
            };
            match message {
                Message::Text(text) => return Ok(SocketMessage::Text(text.as_str().to_owned())),
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (
                            Some(CloseCode(u16::from(frame.code))),
                            frame.reason.as_str().to_owned(),
                        ),
                        None => (None, String::new()),
                    };
                    return Ok(SocketMessage::Closed { code, reason });
                }
                Message::Binary(_) => {
                    return Err(GatewayError::Protocol {
                        reason: "unexpected binary frame".to_string(),
                    })
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("control frame");
                }
            }
        }
    }

    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: WsCloseCode::from(code.0),
            reason: reason.to_string().into(),
        };
        self.stream
            .close(Some(frame))
            .await
            .map_err(connection_error)
    }
}

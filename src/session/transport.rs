//! WebSocket transport for SIP frames.
//!
//! One SIP message per text frame (RFC 7118). Some stacks put SIP in
//! binary frames; those are accepted when they decode as UTF-8.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use url::Url;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct SignalSocket {
    stream: WsStream,
}

impl SignalSocket {
    /// Open the WebSocket. Returns the raw handshake error so callers can
    /// classify TLS failures; the transport probe depends on that.
    pub async fn connect(url: &Url) -> Result<Self, tungstenite::Error> {
        tracing::info!("Connecting WebSocket to {}", url);

        let (stream, response) = connect_async(url.as_str()).await?;

        tracing::info!("WebSocket connected (status={})", response.status());

        Ok(Self { stream })
    }

    /// Send one SIP message as a text frame.
    pub async fn send_text(&mut self, msg: &str) -> Result<()> {
        tracing::debug!("WS send:\n{}", msg);
        self.stream
            .send(Message::Text(msg.to_string()))
            .await
            .context("Failed to send WebSocket message")
    }

    /// Keep-alive ping.
    pub async fn ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .context("Failed to send keep-alive ping")
    }

    /// Receive the next SIP frame, answering pings along the way.
    /// Returns None once the peer closes.
    pub async fn recv_frame(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv:\n{}", text);
                    return Ok(Some(text));
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        tracing::debug!("WS recv (binary):\n{}", text);
                        return Ok(Some(text));
                    }
                    Err(_) => {
                        tracing::debug!("Non-UTF-8 binary frame ignored");
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

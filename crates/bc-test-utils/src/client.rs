//! WebSocket signaling client for end-to-end tests.

use anyhow::{anyhow, bail, Context, Result};
use broadcast_controller::backend::IceCandidate;
use broadcast_controller::signaling::protocol::{HandshakeResponse, ServerMessage};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long a receive waits before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected signaling client.
pub struct SignalingTestClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Local candidates received while waiting for something else.
    candidates: Vec<IceCandidate>,
}

impl SignalingTestClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _) = connect_async(url)
            .await
            .with_context(|| format!("connect to {url}"))?;
        Ok(Self {
            stream,
            candidates: Vec::new(),
        })
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    pub async fn send_json(&mut self, value: &Value) -> Result<()> {
        self.send_text(value.to_string()).await
    }

    pub async fn presenter(&mut self, room_id: &str, sdp_offer: &str) -> Result<()> {
        self.send_json(&json!({"id": "presenter", "roomId": room_id, "sdpOffer": sdp_offer}))
            .await
    }

    pub async fn viewer(&mut self, room_id: &str, sdp_offer: &str) -> Result<()> {
        self.send_json(&json!({"id": "viewer", "roomId": room_id, "sdpOffer": sdp_offer}))
            .await
    }

    pub async fn stop(&mut self, room_id: &str) -> Result<()> {
        self.send_json(&json!({"id": "stop", "roomId": room_id}))
            .await
    }

    pub async fn ice_candidate(&mut self, room_id: &str, candidate: &IceCandidate) -> Result<()> {
        self.send_json(&json!({
            "id": "onIceCandidate",
            "roomId": room_id,
            "candidate": serde_json::to_value(candidate)?,
        }))
        .await
    }

    /// Next raw JSON frame from the server.
    pub async fn recv_value(&mut self) -> Result<Value> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .map_err(|_| anyhow!("timed out waiting for a server message"))?;
            match frame {
                Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Binary(_))) => bail!("unexpected binary frame"),
                Some(Ok(Message::Close(_))) | None => bail!("connection closed"),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Next server message.
    pub async fn recv(&mut self) -> Result<ServerMessage> {
        Ok(serde_json::from_value(self.recv_value().await?)?)
    }

    /// Next message that is not a local ICE candidate. Candidates seen on the
    /// way are kept for [`take_candidates`](Self::take_candidates).
    pub async fn recv_non_candidate(&mut self) -> Result<ServerMessage> {
        loop {
            match self.recv().await? {
                ServerMessage::IceCandidate { candidate } => self.candidates.push(candidate),
                other => return Ok(other),
            }
        }
    }

    /// Next presenter or viewer response.
    pub async fn recv_handshake_response(&mut self) -> Result<HandshakeResponse> {
        match self.recv_non_candidate().await? {
            ServerMessage::PresenterResponse(response) | ServerMessage::ViewerResponse(response) => {
                Ok(response)
            }
            other => bail!("expected a handshake response, got {other:?}"),
        }
    }

    /// Wait until at least one local candidate has arrived.
    pub async fn recv_candidate(&mut self) -> Result<IceCandidate> {
        if !self.candidates.is_empty() {
            return Ok(self.candidates.remove(0));
        }
        match self.recv().await? {
            ServerMessage::IceCandidate { candidate } => Ok(candidate),
            other => bail!("expected an iceCandidate, got {other:?}"),
        }
    }

    /// Local candidates buffered by [`recv_non_candidate`](Self::recv_non_candidate).
    pub fn take_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.candidates)
    }

    /// Wait up to `wait` for a message. `None` if nothing arrives.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<ServerMessage> {
        let frame = tokio::time::timeout(wait, self.stream.next()).await.ok()??;
        match frame {
            Ok(Message::Text(text)) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }

    /// Wait for the server to close the connection.
    pub async fn expect_closed(&mut self) -> Result<()> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .map_err(|_| anyhow!("connection still open"))?;
            match frame {
                Some(Ok(Message::Close(_)) | Err(_)) | None => return Ok(()),
                Some(Ok(_)) => {}
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

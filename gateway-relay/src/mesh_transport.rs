//! Reference [`PeerTransport`] implementation over plain WebSocket dials
//! (spec §6's "Peer RPC calls"). The peer mesh's actual wire protocol is an
//! external collaborator (spec §1); this module exists so the gateway
//! binary has something concrete to dial rather than leaving `main` unable
//! to start. It treats each `PeerId` as a directly-dialable WebSocket URL
//! and speaks a minimal JSON-envelope protocol of our own choosing —
//! production deployments that join a real peer mesh are expected to swap
//! in their own [`PeerTransport`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use gateway_proto::ClientFrame;

use crate::error::{ErrorKind, GatewayError};
use crate::peer_pool::PeerTransport;

type PeerSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Envelope<'a> {
    Ping,
    Forward {
        relay_key: &'a str,
        connection_key: &'a str,
        relay_auth_token: &'a str,
        /// The client frame re-rendered to its wire JSON-array shape via
        /// [`ClientFrame::to_text`] (the enum itself carries no `Serialize`
        /// impl, since its wire shape is a variable-arity array rather than
        /// a struct serde can derive for).
        frame: serde_json::Value,
    },
    Poll {
        relay_key: &'a str,
        connection_key: &'a str,
        relay_auth_token: &'a str,
    },
    FetchBlob {
        drive_identifier: &'a str,
        file_hash: &'a str,
    },
    Post {
        path: &'a str,
        body: &'a [u8],
    },
}

#[derive(Debug, Deserialize, Default)]
struct Reply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    frames: Vec<String>,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    body: Vec<u8>,
    #[serde(default)]
    error: Option<String>,
}

/// Dials peers by WebSocket URL and speaks a small request/reply JSON
/// envelope protocol. One socket is kept per peer and reused across calls;
/// [`PeerPool`](crate::peer_pool::PeerPool) is the sole owner of *logical*
/// connection lifecycle, this struct just owns the raw sockets.
pub struct WsMeshTransport {
    sockets: Mutex<HashMap<String, PeerSocket>>,
}

impl WsMeshTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sockets: Mutex::new(HashMap::new()),
        }
    }

    async fn ensure_socket<'a>(
        &self,
        sockets: &'a mut HashMap<String, PeerSocket>,
        peer_id: &str,
    ) -> Result<&'a mut PeerSocket, GatewayError> {
        if let std::collections::hash_map::Entry::Vacant(entry) = sockets.entry(peer_id.to_string()) {
            let (socket, _response) = timeout(DIAL_TIMEOUT, connect_async(peer_id))
                .await
                .map_err(|_| GatewayError::new(ErrorKind::PeerTimeout, format!("dial to {peer_id} timed out")))?
                .map_err(|e| GatewayError::new(ErrorKind::PeerUnreachable, format!("dial to {peer_id} failed: {e}")))?;
            entry.insert(socket);
        }
        Ok(sockets
            .get_mut(peer_id)
            .unwrap_or_else(|| unreachable!("socket for {peer_id} was just inserted")))
    }

    async fn call(&self, peer_id: &str, envelope: &Envelope<'_>) -> Result<Reply, GatewayError> {
        let text = serde_json::to_string(envelope)
            .map_err(|e| GatewayError::new(ErrorKind::Internal, format!("failed to encode peer envelope: {e}")))?;

        let mut sockets = self.sockets.lock().await;
        let outcome = async {
            let socket = self.ensure_socket(&mut sockets, peer_id).await?;
            socket
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| GatewayError::new(ErrorKind::PeerUnreachable, format!("send to {peer_id} failed: {e}")))?;
            let message = socket
                .next()
                .await
                .ok_or_else(|| GatewayError::new(ErrorKind::PeerUnreachable, format!("peer {peer_id} closed the connection")))?
                .map_err(|e| GatewayError::new(ErrorKind::PeerUnreachable, format!("read from {peer_id} failed: {e}")))?;
            let Message::Text(body) = message else {
                return Err(GatewayError::new(ErrorKind::PeerUnreachable, format!("peer {peer_id} sent a non-text reply")));
            };
            serde_json::from_str::<Reply>(&body)
                .map_err(|e| GatewayError::new(ErrorKind::PeerUnreachable, format!("malformed reply from {peer_id}: {e}")))
        };

        match timeout(CALL_TIMEOUT, outcome).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                sockets.remove(peer_id);
                Err(e)
            }
            Err(_) => {
                sockets.remove(peer_id);
                Err(GatewayError::new(ErrorKind::PeerTimeout, format!("call to {peer_id} timed out")))
            }
        }
    }
}

impl Default for WsMeshTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerTransport for WsMeshTransport {
    async fn dial(&self, peer_id: &str) -> Result<(), GatewayError> {
        let mut sockets = self.sockets.lock().await;
        self.ensure_socket(&mut sockets, peer_id).await.map(|_| ())
    }

    async fn ping(&self, peer_id: &str) -> Result<(), GatewayError> {
        let reply = self.call(peer_id, &Envelope::Ping).await?;
        if reply.ok {
            Ok(())
        } else {
            Err(GatewayError::new(ErrorKind::PeerUnreachable, reply.error.unwrap_or_else(|| "ping rejected".to_string())))
        }
    }

    async fn forward(
        &self,
        peer_id: &str,
        relay_key: &str,
        frame: &ClientFrame,
        connection_key: &str,
        relay_auth_token: &str,
    ) -> Result<Vec<String>, GatewayError> {
        let frame_json: serde_json::Value = serde_json::from_str(&frame.to_text())
            .map_err(|e| GatewayError::new(ErrorKind::Internal, format!("failed to re-encode frame: {e}")))?;
        let reply = self
            .call(
                peer_id,
                &Envelope::Forward {
                    relay_key,
                    connection_key,
                    relay_auth_token,
                    frame: frame_json,
                },
            )
            .await?;
        if reply.ok {
            Ok(reply.frames)
        } else {
            Err(GatewayError::new(ErrorKind::PeerUnreachable, reply.error.unwrap_or_else(|| "forward rejected".to_string())))
        }
    }

    async fn poll_events(
        &self,
        peer_id: &str,
        relay_key: &str,
        connection_key: &str,
        relay_auth_token: &str,
    ) -> Result<Vec<String>, GatewayError> {
        let reply = self
            .call(
                peer_id,
                &Envelope::Poll {
                    relay_key,
                    connection_key,
                    relay_auth_token,
                },
            )
            .await?;
        if reply.ok {
            Ok(reply.frames)
        } else {
            Err(GatewayError::new(ErrorKind::PeerUnreachable, reply.error.unwrap_or_else(|| "poll rejected".to_string())))
        }
    }

    async fn fetch_blob(&self, peer_id: &str, drive_identifier: &str, file_hash: &str) -> Result<(u16, Vec<u8>), GatewayError> {
        let reply = self
            .call(
                peer_id,
                &Envelope::FetchBlob {
                    drive_identifier,
                    file_hash,
                },
            )
            .await?;
        Ok((reply.status, reply.body))
    }

    async fn post_request(&self, peer_id: &str, path: &str, body: &[u8]) -> Result<(u16, Vec<u8>), GatewayError> {
        let reply = self.call(peer_id, &Envelope::Post { path, body }).await?;
        Ok((reply.status, reply.body))
    }

    async fn close(&self, peer_id: &str) {
        if let Some(mut socket) = self.sockets.lock().await.remove(peer_id) {
            let _ = socket.close(None).await;
        }
    }
}

//! Stream transports: direct TCP and TCP through the onion bridge's SOCKS5
//! proxy. Both carry the same length-prefixed JSON frames.
//!
//! ```text
//! sender -> receiver   u32-BE length | {"type":"deliver", id, convId, fromDeviceId, payload}
//! receiver -> sender   u32-BE length | {"type":"ack", id}
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bridge::OnionBridge;
use crate::config::TransportKind;
use crate::error::TransportError;
use crate::transport::{OutgoingMessage, Transport};

pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryFrame {
    #[serde(rename_all = "camelCase")]
    Deliver {
        id: String,
        conv_id: String,
        from_device_id: String,
        payload: String,
    },
    Ack {
        id: String,
    },
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &DeliveryFrame) -> Result<(), TransportError> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::Frame("frame too large"));
    }
    w.write_u32(body.len() as u32).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<DeliveryFrame, TransportError> {
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Frame("frame too large"));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|_| TransportError::Frame("malformed frame"))
}

async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    kind: TransportKind,
    from_device_id: &str,
    msg: &OutgoingMessage,
) -> Result<(), TransportError> {
    write_frame(
        stream,
        &DeliveryFrame::Deliver {
            id: msg.id.clone(),
            conv_id: msg.conv_id.clone(),
            from_device_id: from_device_id.to_string(),
            payload: msg.ciphertext.clone(),
        },
    )
    .await?;
    match read_frame(stream).await? {
        DeliveryFrame::Ack { id } if id == msg.id => Ok(()),
        _ => Err(TransportError::Failed {
            kind,
            reason: "peer did not acknowledge".into(),
        }),
    }
}

pub struct DirectTcpTransport {
    local_device_id: String,
}

impl DirectTcpTransport {
    pub fn new(local_device_id: &str) -> Self {
        Self {
            local_device_id: local_device_id.to_string(),
        }
    }
}

#[async_trait]
impl Transport for DirectTcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::DirectP2P
    }

    async fn send(&self, msg: &OutgoingMessage, cancel: CancellationToken) -> Result<(), TransportError> {
        let addr = msg.routing.direct_addr.as_deref().ok_or(TransportError::Failed {
            kind: TransportKind::DirectP2P,
            reason: "no direct address".into(),
        })?;
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            r = async {
                let mut stream = TcpStream::connect(addr).await?;
                exchange(&mut stream, TransportKind::DirectP2P, &self.local_device_id, msg).await
            } => r,
        }
    }
}

pub struct Socks5Transport {
    bridge: Arc<dyn OnionBridge>,
    local_device_id: String,
}

impl Socks5Transport {
    pub fn new(bridge: Arc<dyn OnionBridge>, local_device_id: &str) -> Self {
        Self {
            bridge,
            local_device_id: local_device_id.to_string(),
        }
    }
}

#[async_trait]
impl Transport for Socks5Transport {
    fn kind(&self) -> TransportKind {
        TransportKind::OnionRouter
    }

    async fn send(&self, msg: &OutgoingMessage, cancel: CancellationToken) -> Result<(), TransportError> {
        let kind = TransportKind::OnionRouter;
        let target = msg.routing.onion_addr.as_deref().ok_or(TransportError::Failed {
            kind,
            reason: "no onion address".into(),
        })?;
        let (host, port) = target
            .rsplit_once(':')
            .and_then(|(h, p)| Some((h, p.parse::<u16>().ok()?)))
            .ok_or(TransportError::Failed {
                kind,
                reason: "invalid onion address".into(),
            })?;
        let proxy = self.bridge.status().await.socks_addr()?;

        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            r = async {
                let mut stream = TcpStream::connect(&proxy).await?;
                socks5_connect(&mut stream, host, port).await?;
                exchange(&mut stream, kind, &self.local_device_id, msg).await
            } => r,
        }
    }
}

/// SOCKS5 CONNECT by domain name, no authentication. The proxy resolves the
/// host, so `.onion` names never touch local DNS.
async fn socks5_connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    port: u16,
) -> Result<(), TransportError> {
    let host_len = u8::try_from(host.len()).map_err(|_| TransportError::Frame("hostname too long"))?;

    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [0x05, 0x00] {
        return Err(TransportError::Bridge("proxy requires authentication".into()));
    }

    let mut req = Vec::with_capacity(7 + host.len());
    req.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host_len]);
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != 0x05 {
        return Err(TransportError::Frame("bad proxy reply"));
    }
    if head[1] != 0x00 {
        return Err(TransportError::Bridge(format!("proxy connect failed (code {})", head[1])));
    }
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => stream.read_u8().await? as usize,
        _ => return Err(TransportError::Frame("bad proxy reply")),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

/// Receiving side for delivered frames.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn deliver(
        &self,
        id: &str,
        conv_id: &str,
        from_device_id: &str,
        payload: &str,
    ) -> Result<(), TransportError>;
}

/// Accept connections until `cancel` fires. Each connection may carry any
/// number of frames; each is acknowledged after the sink accepted it.
pub async fn serve(
    listener: TcpListener,
    sink: Arc<dyn InboundSink>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = listener.accept() => r?,
        };
        let sink = sink.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                r = handle_connection(stream, sink) => {
                    if let Err(err) = r {
                        debug!(%peer, error = %err, "inbound connection closed");
                    }
                }
            }
        });
    }
}

async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    sink: Arc<dyn InboundSink>,
) -> Result<(), TransportError> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match frame {
            DeliveryFrame::Deliver {
                id,
                conv_id,
                from_device_id,
                payload,
            } => {
                sink.deliver(&id, &conv_id, &from_device_id, &payload).await?;
                write_frame(&mut stream, &DeliveryFrame::Ack { id }).await?;
            }
            DeliveryFrame::Ack { .. } => return Err(TransportError::Frame("unexpected ack")),
        }
    }
}

//! Discovery protocol listener.
//!
//! One task per accepted socket. The read half turns bytes into frames and
//! hands them to the hub; a writer task drains the connection's outbound
//! queue. Either half ending closes the connection and releases its claims.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{Buf, Bytes, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use beacon_core::policy::normalize_ip;
use beacon_core::wire::{self, Scanned};
use beacon_services::{ConnectionId, HubHandle};

pub struct DiscoveryServer {
    listener: TcpListener,
    hub: HubHandle,
    keepalive: Option<Duration>,
    shutdown: broadcast::Receiver<()>,
}

impl DiscoveryServer {
    pub async fn bind(
        addr: SocketAddr,
        hub: HubHandle,
        keepalive: Option<Duration>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind discovery listener on {addr}"))?;
        Ok(Self {
            listener,
            hub,
            keepalive,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "discovery server listening");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("discovery server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let remote = match normalize_ip(peer.ip()) {
                        Some(ip) => ip,
                        None => {
                            tracing::warn!(peer = %peer, "rejecting non-IPv4 peer");
                            continue;
                        }
                    };
                    if let Some(idle) = self.keepalive {
                        if let Err(e) = set_keepalive(&stream, idle) {
                            tracing::debug!(peer = %peer, error = %e, "failed to enable keepalive");
                        }
                    }
                    tokio::spawn(serve_connection(
                        stream,
                        remote,
                        self.hub.clone(),
                        self.shutdown.resubscribe(),
                    ));
                }
            }
        }
    }
}

fn set_keepalive(stream: &TcpStream, idle: Duration) -> io::Result<()> {
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))
}

/// Reset, broken pipe and friends mean the peer went away.
pub(crate) fn is_peer_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

async fn serve_connection(
    stream: TcpStream,
    remote: Ipv4Addr,
    hub: HubHandle,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let id = hub.connect(remote, tx);
    let mut writer_task = tokio::spawn(write_loop(writer, rx));

    let mut buf = BytesMut::with_capacity(4096);
    let outcome: io::Result<()> = loop {
        tokio::select! {
            _ = shutdown.recv() => break Ok(()),
            written = &mut writer_task => {
                break written.unwrap_or_else(|e| Err(io::Error::other(e)));
            }
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(_) => drain_frames(&mut buf, id, &hub),
                Err(e) => break Err(e),
            },
        }
    };
    writer_task.abort();

    match outcome {
        Ok(()) => {}
        Err(e) if is_peer_disconnect(&e) => {
            tracing::debug!(conn = %id, peer = %remote, error = %e, "peer disconnected");
        }
        Err(e) => tracing::warn!(conn = %id, peer = %remote, error = %e, "connection error"),
    }
    hub.disconnect(id);
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    while let Some(frame) = rx.recv().await {
        writer.write_all(&frame).await?;
    }
    Ok(())
}

/// Feed every complete frame at the front of `buf` to the hub.
fn drain_frames(buf: &mut BytesMut, id: ConnectionId, hub: &HubHandle) {
    loop {
        match wire::scan_inbound(buf) {
            Scanned::Incomplete => return,
            Scanned::Skip(n) => buf.advance(n),
            Scanned::Frame(n, frame) => {
                buf.advance(n);
                tracing::debug!(conn = %id, ?frame, "frame received");
                hub.frame(id, frame);
            }
            Scanned::Malformed(n, e) => {
                buf.advance(n);
                tracing::warn!(conn = %id, error = %e, discarded = n, "malformed frame");
            }
        }
    }
}

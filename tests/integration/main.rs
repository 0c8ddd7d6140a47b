//! Beacon integration test harness.
//!
//! Tests run the real discovery server and relay on loopback. Distinct
//! peers are simulated by binding client sockets to different 127.0.0.x
//! addresses, which Linux routes over `lo` without configuration.
//!
//!   cargo test --test integration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};

use beacon_core::config::Ownership;
use beacon_core::policy::PolicySet;
use beacon_services::{Hub, HubHandle, HubSettings};
use beacond::relay::RelayVisibility;
use beacond::{DiscoveryServer, RelayServer, RelaySettings};

mod discovery;
mod relay;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long a test waits for something that should happen.
pub const PATIENCE: Duration = Duration::from_secs(3);

/// A running discovery server. Dropping it shuts the server down.
pub struct Discovery {
    pub addr: SocketAddr,
    pub hub: HubHandle,
    _shutdown: broadcast::Sender<()>,
}

pub async fn start_discovery(policy: PolicySet, grace: Duration) -> Result<Discovery> {
    let (shutdown, _) = broadcast::channel(1);
    let (hub, _task) = Hub::spawn(
        Arc::new(policy),
        HubSettings {
            grace_period: grace,
            ownership: Ownership::Connection,
        },
    );
    let server = DiscoveryServer::bind(
        "127.0.0.1:0".parse()?,
        hub.clone(),
        None,
        shutdown.subscribe(),
    )
    .await?;
    let addr = server.local_addr()?;
    tokio::spawn(server.run());
    Ok(Discovery {
        addr,
        hub,
        _shutdown: shutdown,
    })
}

pub struct Relay {
    pub addr: SocketAddr,
    _shutdown: broadcast::Sender<()>,
}

pub async fn start_relay(
    upstream: SocketAddr,
    visibility: RelayVisibility,
    flush_timeout: Duration,
) -> Result<Relay> {
    let (shutdown, _) = broadcast::channel(1);
    let server = RelayServer::bind(
        "127.0.0.1:0".parse()?,
        RelaySettings {
            upstream: upstream.to_string(),
            flush_timeout,
            visibility,
        },
        shutdown.subscribe(),
    )
    .await?;
    let addr = server.local_addr()?;
    tokio::spawn(server.run());
    Ok(Relay {
        addr,
        _shutdown: shutdown,
    })
}

/// Connect from a specific loopback address, e.g. `127.0.0.20`.
pub async fn connect_from(local: &str, server: SocketAddr) -> Result<TcpStream> {
    let ip: Ipv4Addr = local.parse()?;
    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::new(IpAddr::V4(ip), 0))?;
    socket
        .connect(server)
        .await
        .with_context(|| format!("connect from {local} to {server}"))
}

pub async fn send(stream: &mut TcpStream, message: &str) -> Result<()> {
    stream.write_all(message.as_bytes()).await?;
    Ok(())
}

/// Read one NUL-terminated frame.
pub async fn read_frame(stream: &mut TcpStream) -> Result<String> {
    let mut out = Vec::new();
    let read = tokio::time::timeout(PATIENCE, async {
        loop {
            let b = stream.read_u8().await?;
            if b == 0 {
                return Ok::<_, std::io::Error>(());
            }
            out.push(b);
        }
    })
    .await;
    match read {
        Ok(Ok(())) => Ok(String::from_utf8(out)?),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => bail!("no frame within {PATIENCE:?}"),
    }
}

/// Fail if any byte arrives within `window`.
pub async fn expect_silence(stream: &mut TcpStream, window: Duration) -> Result<()> {
    let mut buf = [0u8; 256];
    match tokio::time::timeout(window, stream.read(&mut buf)).await {
        Err(_) => Ok(()),
        Ok(Ok(0)) => bail!("connection closed"),
        Ok(Ok(n)) => bail!("unexpected bytes: {:?}", String::from_utf8_lossy(&buf[..n])),
        Ok(Err(e)) => Err(e.into()),
    }
}

/// Poll `check` until it returns true.
pub async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while tokio::time::Instant::now() < deadline {
        if check().await? {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {what}")
}

/// A stand-in discovery server: accepts one client and sends `reply` once
/// the client has written anything, then holds the socket open.
pub async fn fake_upstream(reply: Vec<u8>) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await?;
        let mut buf = [0u8; 256];
        let _ = socket.read(&mut buf).await?;
        socket.write_all(&reply).await?;
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, std::io::Error>(())
    });
    Ok(addr)
}

/// A stand-in discovery server that reports what it reads.
pub struct RecordingUpstream {
    pub addr: SocketAddr,
    /// Every chunk read from the relay. Closes when the relay hangs up.
    pub received: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Fire to close the upstream side of the connection.
    pub close: oneshot::Sender<()>,
}

pub async fn recording_upstream() -> Result<RecordingUpstream> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, received) = mpsc::unbounded_channel();
    let (close, mut closed) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await?;
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                _ = &mut closed => break,
                read = socket.read(&mut buf) => match read? {
                    0 => break,
                    n => {
                        let _ = tx.send(buf[..n].to_vec());
                    }
                },
            }
        }
        Ok::<_, std::io::Error>(())
    });
    Ok(RecordingUpstream {
        addr,
        received,
        close,
    })
}

/// Collect `len` bytes from a [`RecordingUpstream`].
pub async fn upstream_bytes(
    received: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    len: usize,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while out.len() < len {
        match tokio::time::timeout(PATIENCE, received.recv()).await {
            Ok(Some(chunk)) => out.extend_from_slice(&chunk),
            Ok(None) => bail!("upstream closed after {} of {len} bytes", out.len()),
            Err(_) => bail!("only {} of {len} bytes reached upstream", out.len()),
        }
    }
    Ok(out)
}

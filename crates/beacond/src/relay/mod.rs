//! Filtering relay in front of an unmodified discovery server.
//!
//! Each client gets its own upstream connection. Client bytes go upstream
//! untouched; upstream bytes pass through a [`SourcesFilter`] so the client
//! only learns about sources it may see. Either side closing tears down both.

mod filter;

pub use filter::{Relayed, RelayVisibility, SourcesFilter, MAX_RELAY_BUFFER};

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};

use beacon_core::policy::normalize_ip;

use crate::discovery::is_peer_disconnect;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// `host:port` of the discovery server.
    pub upstream: String,
    /// Raw flush after this long without a complete source list.
    pub flush_timeout: Duration,
    pub visibility: RelayVisibility,
}

pub struct RelayServer {
    listener: TcpListener,
    settings: Arc<RelaySettings>,
    shutdown: broadcast::Receiver<()>,
}

impl RelayServer {
    pub async fn bind(
        addr: SocketAddr,
        settings: RelaySettings,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind relay listener on {addr}"))?;
        Ok(Self {
            listener,
            settings: Arc::new(settings),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            addr = %self.local_addr()?,
            upstream = %self.settings.upstream,
            "relay listening"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("relay shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (client, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "relay accept failed");
                            continue;
                        }
                    };
                    let client_ip = match normalize_ip(peer.ip()) {
                        Some(ip) => ip,
                        None => {
                            tracing::warn!(peer = %peer, "rejecting non-IPv4 relay client");
                            continue;
                        }
                    };
                    let settings = self.settings.clone();
                    let mut shutdown = self.shutdown.resubscribe();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown.recv() => {}
                            result = relay_client(client, client_ip, &settings) => match result {
                                Ok(()) => tracing::debug!(client = %client_ip, "relay pair closed"),
                                Err(e) if is_peer_disconnect(&e) => {
                                    tracing::debug!(client = %client_ip, error = %e, "relay peer disconnected");
                                }
                                Err(e) => tracing::warn!(client = %client_ip, error = %e, "relay pair failed"),
                            },
                        }
                    });
                }
            }
        }
    }
}

async fn relay_client(
    client: TcpStream,
    client_ip: Ipv4Addr,
    settings: &RelaySettings,
) -> io::Result<()> {
    let upstream = TcpStream::connect(&settings.upstream).await?;
    tracing::info!(client = %client_ip, upstream = %settings.upstream, "relay pair opened");

    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();
    let mut filter = SourcesFilter::new(client_ip, settings.visibility.clone());

    let mut from_client = vec![0u8; 8192];
    let mut from_upstream = vec![0u8; 8192];
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            read = client_rd.read(&mut from_client) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                upstream_wr.write_all(&from_client[..n]).await?;
            }
            read = upstream_rd.read(&mut from_upstream) => {
                let n = read?;
                if n == 0 {
                    if let Some(rest) = filter.flush() {
                        client_wr.write_all(&rest).await?;
                    }
                    return Ok(());
                }
                match filter.push(&from_upstream[..n]) {
                    Relayed::Pending => {
                        deadline = Some(Instant::now() + settings.flush_timeout);
                    }
                    Relayed::Filtered(parts) => {
                        for part in parts {
                            client_wr.write_all(&part).await?;
                        }
                        deadline = None;
                    }
                    Relayed::Passthrough(raw) => {
                        client_wr.write_all(&raw).await?;
                        deadline = None;
                    }
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                if let Some(raw) = filter.flush() {
                    tracing::debug!(
                        client = %client_ip,
                        bytes = raw.len(),
                        "no source list within flush window, relaying raw"
                    );
                    client_wr.write_all(&raw).await?;
                }
            }
        }
    }
}

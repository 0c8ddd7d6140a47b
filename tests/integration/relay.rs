//! Relay end-to-end against a fake upstream.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use beacon_core::policy::{FilterRule, PolicySet, ShareDefault};
use beacon_core::wire::{self, SourceDescriptor};
use beacond::relay::RelayVisibility;

use crate::{
    expect_silence, fake_upstream, recording_upstream, send, start_relay, upstream_bytes,
    RecordingUpstream, PATIENCE,
};

fn source(name: &str, address: Ipv4Addr) -> SourceDescriptor {
    SourceDescriptor {
        name: name.to_string(),
        metadata: String::new(),
        address,
        port: 5961,
        groups: vec!["public".to_string()],
    }
}

/// Sources in 10.64.0.0/16 are visible; 192.168.0.0/16 is private to itself.
fn lab_visibility() -> RelayVisibility {
    RelayVisibility::Rules(Arc::new(PolicySet::new(vec![
        FilterRule {
            name: "lab".into(),
            range: "10.64.0.0/16".parse().unwrap(),
            default: ShareDefault::Share,
            authorized: vec![],
        },
        FilterRule {
            name: "office".into(),
            range: "192.168.0.0/16".parse().unwrap(),
            default: ShareDefault::Block,
            authorized: vec![],
        },
    ])))
}

#[tokio::test]
async fn filters_source_list_and_preserves_surroundings() -> Result<()> {
    let lab = source("lab-cam", Ipv4Addr::new(10, 64, 1, 2));
    let office = source("office-cam", Ipv4Addr::new(192, 168, 1, 7));

    let upstream_reply = format!(
        "PRE{}\0POST",
        wire::encode_sources(&[lab.clone(), office])
    );
    let upstream = fake_upstream(upstream_reply.into_bytes()).await?;
    let relay = start_relay(upstream, lab_visibility(), Duration::from_secs(3)).await?;

    let mut client = tokio::net::TcpStream::connect(relay.addr).await?;
    send(&mut client, "<query/>").await?;

    let expected = format!("PRE{}\0POST", wire::encode_sources(&[lab]));
    let mut got = vec![0u8; expected.len()];
    tokio::time::timeout(PATIENCE, client.read_exact(&mut got)).await??;
    assert_eq!(String::from_utf8(got)?, expected);

    expect_silence(&mut client, Duration::from_millis(200)).await?;
    Ok(())
}

#[tokio::test]
async fn partial_buffer_flushes_once_after_window() -> Result<()> {
    let partial = b"<sources><source><name>half".to_vec();
    let upstream = fake_upstream(partial.clone()).await?;
    let relay = start_relay(upstream, lab_visibility(), Duration::from_millis(200)).await?;

    let mut client = tokio::net::TcpStream::connect(relay.addr).await?;
    send(&mut client, "<query/>").await?;

    expect_silence(&mut client, Duration::from_millis(100)).await?;

    let mut got = vec![0u8; partial.len()];
    tokio::time::timeout(PATIENCE, client.read_exact(&mut got)).await??;
    assert_eq!(got, partial);

    expect_silence(&mut client, Duration::from_millis(600)).await?;
    Ok(())
}

#[tokio::test]
async fn client_bytes_reach_upstream_verbatim() -> Result<()> {
    let RecordingUpstream {
        addr,
        mut received,
        close: _close,
    } = recording_upstream().await?;
    let relay = start_relay(addr, lab_visibility(), Duration::from_secs(3)).await?;

    let mut client = tokio::net::TcpStream::connect(relay.addr).await?;
    // Not all of it is well-formed; the relay never looks at client bytes.
    let outbound: &[u8] = b"<query/>\0<source><name>x</name></source>\0\x01\xfe<sources>\0";
    client.write_all(outbound).await?;

    assert_eq!(upstream_bytes(&mut received, outbound.len()).await?, outbound);
    Ok(())
}

#[tokio::test]
async fn upstream_close_ends_client_stream() -> Result<()> {
    let RecordingUpstream {
        addr,
        mut received,
        close,
    } = recording_upstream().await?;
    let relay = start_relay(addr, lab_visibility(), Duration::from_secs(3)).await?;

    let mut client = tokio::net::TcpStream::connect(relay.addr).await?;
    send(&mut client, "<query/>").await?;
    upstream_bytes(&mut received, "<query/>".len()).await?;

    let _ = close.send(());
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(PATIENCE, client.read(&mut buf)).await??;
    assert_eq!(n, 0, "client should see end of stream");
    Ok(())
}

#[tokio::test]
async fn client_close_ends_upstream_stream() -> Result<()> {
    let RecordingUpstream {
        addr,
        mut received,
        close: _close,
    } = recording_upstream().await?;
    let relay = start_relay(addr, lab_visibility(), Duration::from_secs(3)).await?;

    let mut client = tokio::net::TcpStream::connect(relay.addr).await?;
    send(&mut client, "<query/>").await?;
    upstream_bytes(&mut received, "<query/>".len()).await?;

    drop(client);
    let next = tokio::time::timeout(PATIENCE, received.recv()).await?;
    assert!(next.is_none(), "upstream should see end of stream");
    Ok(())
}

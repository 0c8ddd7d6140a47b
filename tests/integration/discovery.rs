//! Discovery server end-to-end: fan-out, query filtering, grace removal.

use std::time::Duration;

use anyhow::Result;

use beacon_core::policy::{FilterRule, PolicySet, ShareDefault};

use crate::{connect_from, eventually, expect_silence, read_frame, send, start_discovery};

const SENDER: &str = "127.0.0.10";
const ALLOWED: &str = "127.0.0.20";
const DENIED: &str = "127.0.0.30";

const ANNOUNCE: &str =
    "<source><name>cam</name><address>0.0.0.0</address><port>5961</port></source>";

fn sender_blocked() -> PolicySet {
    PolicySet::new(vec![FilterRule {
        name: "stage".into(),
        range: "127.0.0.10/32".parse().unwrap(),
        default: ShareDefault::Block,
        authorized: vec!["127.0.0.20/32".parse().unwrap()],
    }])
}

#[tokio::test]
async fn add_reaches_only_authorized_watchers() -> Result<()> {
    let server = start_discovery(sender_blocked(), Duration::from_secs(60)).await?;

    let mut allowed = connect_from(ALLOWED, server.addr).await?;
    let mut denied = connect_from(DENIED, server.addr).await?;
    send(&mut allowed, "<query/>").await?;
    send(&mut denied, "<query/>").await?;
    assert_eq!(read_frame(&mut allowed).await?, "<sources/>");
    assert_eq!(read_frame(&mut denied).await?, "<sources/>");

    let mut sender = connect_from(SENDER, server.addr).await?;
    send(&mut sender, ANNOUNCE).await?;

    let added = read_frame(&mut allowed).await?;
    assert!(added.starts_with("<add_source><source><name>cam</name>"), "{added}");
    assert!(added.contains("<address>127.0.0.10</address>"), "{added}");

    // Anything sent to the denied watcher would arrive before this reply.
    send(&mut denied, "<query/>").await?;
    assert_eq!(read_frame(&mut denied).await?, "<sources/>");

    send(&mut allowed, "<query/>").await?;
    let list = read_frame(&mut allowed).await?;
    assert!(list.starts_with("<sources><source><name>cam</name>"), "{list}");

    expect_silence(&mut sender, Duration::from_millis(100)).await?;
    Ok(())
}

#[tokio::test]
async fn malformed_frame_keeps_connection_open() -> Result<()> {
    let server = start_discovery(PolicySet::empty(), Duration::from_secs(60)).await?;
    let mut client = connect_from(ALLOWED, server.addr).await?;

    send(&mut client, "<source><name>x</name><port>not-a-port</port></source>").await?;
    send(&mut client, "<query/>").await?;
    assert_eq!(read_frame(&mut client).await?, "<sources/>");
    Ok(())
}

#[tokio::test]
async fn last_owner_leaving_removes_after_grace() -> Result<()> {
    let server = start_discovery(PolicySet::empty(), Duration::from_millis(300)).await?;
    let hub = &server.hub;

    let mut watcher = connect_from(ALLOWED, server.addr).await?;
    send(&mut watcher, "<query/>").await?;
    read_frame(&mut watcher).await?;

    let mut first = connect_from(SENDER, server.addr).await?;
    let mut second = connect_from(SENDER, server.addr).await?;
    send(&mut first, ANNOUNCE).await?;
    send(&mut second, ANNOUNCE).await?;
    eventually("two owners", || async move {
        let views = hub.list_all().await?;
        Ok::<_, anyhow::Error>(views.first().map(|v| v.record.owners.len()) == Some(2))
    })
    .await?;
    assert!(read_frame(&mut watcher).await?.starts_with("<add_source>"));

    drop(first);
    eventually("first disconnect", || async move {
        Ok::<_, anyhow::Error>(hub.stats().await?.connections == 2)
    })
    .await?;
    let stats = hub.stats().await?;
    assert_eq!((stats.sources, stats.pending_removals), (1, 0));

    drop(second);
    eventually("grace timer armed", || async move {
        Ok::<_, anyhow::Error>(hub.stats().await?.pending_removals == 1)
    })
    .await?;

    let removed = read_frame(&mut watcher).await?;
    assert!(removed.starts_with("<remove_source><source><name>cam</name>"), "{removed}");
    assert_eq!(hub.stats().await?.sources, 0);
    expect_silence(&mut watcher, Duration::from_millis(400)).await?;
    Ok(())
}

#[tokio::test]
async fn reannounce_within_grace_cancels_removal() -> Result<()> {
    let server = start_discovery(PolicySet::empty(), Duration::from_millis(300)).await?;
    let hub = &server.hub;

    let mut watcher = connect_from(ALLOWED, server.addr).await?;
    send(&mut watcher, "<query/>").await?;
    read_frame(&mut watcher).await?;

    let sender = {
        let mut s = connect_from(SENDER, server.addr).await?;
        send(&mut s, ANNOUNCE).await?;
        s
    };
    assert!(read_frame(&mut watcher).await?.starts_with("<add_source>"));

    drop(sender);
    eventually("grace timer armed", || async move {
        Ok::<_, anyhow::Error>(hub.stats().await?.pending_removals == 1)
    })
    .await?;

    let mut again = connect_from(SENDER, server.addr).await?;
    send(&mut again, ANNOUNCE).await?;
    eventually("timer cancelled", || async move {
        Ok::<_, anyhow::Error>(hub.stats().await?.pending_removals == 0)
    })
    .await?;

    expect_silence(&mut watcher, Duration::from_millis(600)).await?;
    assert_eq!(hub.stats().await?.sources, 1);
    Ok(())
}

#[tokio::test]
async fn grace_removal_skips_denied_watchers() -> Result<()> {
    let server = start_discovery(sender_blocked(), Duration::from_millis(300)).await?;
    let hub = &server.hub;

    let mut allowed = connect_from(ALLOWED, server.addr).await?;
    let mut denied = connect_from(DENIED, server.addr).await?;
    send(&mut allowed, "<query/>").await?;
    send(&mut denied, "<query/>").await?;
    read_frame(&mut allowed).await?;
    read_frame(&mut denied).await?;

    let sender = {
        let mut s = connect_from(SENDER, server.addr).await?;
        send(&mut s, ANNOUNCE).await?;
        s
    };
    assert!(read_frame(&mut allowed).await?.starts_with("<add_source>"));

    drop(sender);
    let removed = read_frame(&mut allowed).await?;
    assert!(removed.starts_with("<remove_source><source><name>cam</name>"), "{removed}");
    assert_eq!(hub.stats().await?.sources, 0);

    // Anything queued for the denied watcher would arrive before this reply.
    send(&mut denied, "<query/>").await?;
    assert_eq!(read_frame(&mut denied).await?, "<sources/>");
    expect_silence(&mut denied, Duration::from_millis(100)).await?;
    Ok(())
}

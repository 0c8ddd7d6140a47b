//! beacond — source discovery server and filtering relay.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use beacon_core::config::{BeaconConfig, RelayVisibilityMode};
use beacon_core::policy::PolicySet;
use beacon_services::{Hub, HubSettings};
use beacond::relay::RelayVisibility;
use beacond::{DiscoveryServer, RelayServer, RelaySettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = BeaconConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = BeaconConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BeaconConfig::default()
    });

    let policy = Arc::new(config.policy().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "invalid filter config, sharing every source with everyone");
        PolicySet::empty()
    }));
    for rule in policy.rules() {
        tracing::info!(
            name = %rule.name,
            range = %rule.range,
            default = ?rule.default,
            authorized = rule.authorized.len(),
            "filter rule loaded"
        );
    }

    let bind: IpAddr = config
        .network
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.network.bind))?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let (hub, hub_task) = Hub::spawn(
        policy.clone(),
        HubSettings {
            grace_period: Duration::from_secs(config.registry.grace_period_secs),
            ownership: config.registry.ownership,
        },
    );

    let keepalive = match config.network.keepalive_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let discovery = DiscoveryServer::bind(
        SocketAddr::new(bind, config.network.discovery_port),
        hub.clone(),
        keepalive,
        shutdown_tx.subscribe(),
    )
    .await?;
    let discovery_task = tokio::spawn(discovery.run());

    let relay_task = if config.relay.enabled {
        let relay_bind: IpAddr = config
            .relay
            .bind
            .parse()
            .with_context(|| format!("invalid relay bind address {:?}", config.relay.bind))?;
        let visibility = match config.relay.visibility {
            RelayVisibilityMode::Rules => RelayVisibility::Rules(policy.clone()),
            RelayVisibilityMode::Subnet => RelayVisibility::SameSubnet {
                prefix: config.relay.subnet_prefix,
            },
        };
        let relay = RelayServer::bind(
            SocketAddr::new(relay_bind, config.relay.port),
            RelaySettings {
                upstream: config.relay.upstream.clone(),
                flush_timeout: Duration::from_millis(config.relay.flush_timeout_ms),
                visibility,
            },
            shutdown_tx.subscribe(),
        )
        .await?;
        Some(tokio::spawn(relay.run()))
    } else {
        None
    };

    // Status HTTP endpoint
    if config.api.enabled {
        let state = beacon_api::ApiState::new(hub.clone());
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = beacon_api::serve(state, port).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let relay_exit = async {
        match relay_task {
            Some(task) => task.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = discovery_task     => tracing::error!("discovery server exited: {:?}", r),
        r = relay_exit         => tracing::error!("relay exited: {:?}", r),
        r = hub_task           => tracing::error!("discovery hub exited: {:?}", r),
    }

    Ok(())
}

//! stonemeshd — Stonemesh smart-switch node daemon.

use std::time::{Duration, Instant};

use anyhow::Result;

use stonemesh_core::config::StonemeshConfig;
use stonemesh_services::{
    Clock, DefaultPermissions, LocalServices, MemoryStateStore, MeshNode, OwnState,
};

mod host;
mod link;

use host::{LoggingBus, SwitchExecutor, SwitchState, SystemClock};
use link::{Link, MAX_DATAGRAM};

/// Interval between broadcasts of this node's state and time.
const STATE_BROADCAST_SECS: u64 = 60;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = StonemeshConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = StonemeshConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        StonemeshConfig::default()
    });
    if let Some(interface) = std::env::args().nth(1) {
        config.network.interface = interface;
    }
    tracing::info!(
        stone_id = config.node.stone_id,
        interface = %config.network.interface,
        "stonemeshd starting"
    );

    let (link, transport) = Link::open(&config.network, &config.reliable, config.node.stone_id)?;

    let switch = SwitchState::default();
    let services = LocalServices {
        bus: Box::new(LoggingBus {
            switch: switch.clone(),
        }),
        store: Box::new(MemoryStateStore::new()),
        executor: Box::new(SwitchExecutor {
            switch: switch.clone(),
        }),
        clock: Box::new(SystemClock),
        permissions: Box::new(DefaultPermissions::from_config(&config)),
    };
    let mut node = MeshNode::new(&config, Box::new(transport), services);

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // ── Run loop ─────────────────────────────────────────────────────────────
    let mut tick = tokio::time::interval(Duration::from_millis(config.queue.process_interval_ms));
    let mut state_broadcast = tokio::time::interval(Duration::from_secs(STATE_BROADCAST_SECS));
    // One spare byte so oversized datagrams are detected, not truncated.
    let mut buf = [0u8; MAX_DATAGRAM + 1];

    loop {
        tokio::select! {
            _ = tick.tick() => {
                node.tick();
                link.poll(Instant::now(), &mut node);
            }
            _ = state_broadcast.tick() => broadcast_state(&mut node, &switch),
            received = link.recv(&mut buf) => match received {
                Ok(len) => link.on_datagram(&buf[..len], &mut node),
                Err(e) => tracing::warn!(error = %e, "recv_from failed"),
            },
            _ = shutdown_rx.recv() => {
                link.cancel_pending(&mut node);
                break;
            }
        }
    }

    tracing::info!(
        pending = node.sender().queue().pending(),
        test_received = node.test_stats().received,
        test_dropped = node.test_stats().dropped,
        "stonemeshd stopped"
    );
    Ok(())
}

fn broadcast_state(node: &mut MeshNode, switch: &SwitchState) {
    let now = SystemClock.now_posix();
    if now != 0 {
        if let Err(e) = node.sender_mut().send_time(now) {
            tracing::warn!(error = %e, "time broadcast not queued");
        }
    }
    let state = OwnState {
        switch_state: switch.level(),
        ..OwnState::default()
    };
    match node.send_own_state(state) {
        Ok(partial_timestamp) => tracing::debug!(partial_timestamp, "state broadcast queued"),
        Err(e) => tracing::warn!(error = %e, "state broadcast not queued"),
    }
}

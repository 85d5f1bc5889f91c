//! sdnd — minimal OpenFlow controller daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use sdn_core::config::ControllerConfig;
use sdn_services::{
    ControlPlane, Fanout, JsonlAudit, SessionSettings, SessionState, SharedAudit, SwitchingParams,
    TracingAudit,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = ControllerConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ControllerConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ControllerConfig::default()
    });

    let port = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<u16>()
            .with_context(|| format!("invalid port {arg:?}"))?,
        None => config.network.port,
    };
    tracing::info!(listen_addr = %config.network.listen_addr, port, "sdnd starting");

    let policy = config
        .policy
        .build()
        .context("invalid authorization policy")?;
    if policy.is_empty() {
        tracing::warn!("authorization policy is empty, every datapath will be rejected");
    }

    // Audit sinks
    let mut fanout = Fanout::new().with(Arc::new(TracingAudit));
    let mut audit_writer = None;
    if let Some(path) = &config.audit.log_path {
        let (sink, writer) = JsonlAudit::open(path)
            .await
            .with_context(|| format!("failed to open audit log {}", path.display()))?;
        tracing::info!(path = %path.display(), "audit log enabled");
        fanout = fanout.with(Arc::new(sink));
        audit_writer = Some(writer);
    }
    let audit: SharedAudit = Arc::new(fanout);

    // ── Control plane ────────────────────────────────────────────────────────
    let mut control_plane = ControlPlane::new(
        config.network.listen_addr,
        SessionSettings::from(&config.session),
        audit,
    );
    control_plane.setup(policy);
    control_plane.setup_layer2_switching(SwitchingParams::from(&config.switching));
    let local_addr = control_plane
        .start(port)
        .await
        .context("failed to start control plane")?;
    tracing::info!(%local_addr, "accepting datapaths");

    let session_printer = {
        let sessions = control_plane.sessions().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                tracing::info!(
                    count = sessions.len(),
                    active = sdn_services::count_in_state(&sessions, SessionState::Active),
                    "session table snapshot"
                );
                for s in sessions.iter() {
                    tracing::info!(
                        session = *s.key(),
                        peer = %s.peer_addr,
                        identity = %s.identity.map(|i| i.to_string()).unwrap_or_default(),
                        state = %s.state,
                        uptime_secs = s.connected_at.elapsed().as_secs(),
                        "  session"
                    );
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
    session_printer.abort();
    control_plane.shutdown().await?;

    // Dropping the control plane releases the last audit sender; the
    // writer then drains its queue and exits.
    drop(control_plane);
    if let Some(writer) = audit_writer {
        if let Err(e) = writer.await {
            tracing::warn!(error = %e, "audit log writer failed");
        }
    }

    Ok(())
}

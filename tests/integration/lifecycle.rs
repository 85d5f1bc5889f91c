use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::*;

const WAIT: Duration = Duration::from_secs(3);

/// Connect/reject cycles leave nothing behind in the registry.
#[tokio::test]
async fn test_reject_cycles_leak_nothing() -> Result<()> {
    let mut ctl = Controller::default_with(&[id(ALLOWED_A)]).await?;

    for _ in 0..50 {
        let mut switch = FakeSwitch::connect(ctl.addr).await?;
        switch.announce(id(STRANGER)).await?;
        switch.expect_closed(WAIT).await?;
    }

    wait_until(WAIT, || ctl.plane.sessions().is_empty()).await?;
    let events = ctl.audits(50, WAIT).await?;
    assert!(events.iter().all(|e| e.outcome == AuditOutcome::Denied));
    ctl.stop().await
}

/// A peer that never announces itself is cut off after the timeout.
#[tokio::test]
async fn test_silent_peer_is_released() -> Result<()> {
    let settings = SessionSettings {
        handshake_timeout: Duration::from_millis(300),
        ..quick_settings()
    };
    let mut ctl = start_controller(&[id(ALLOWED_A)], settings, quick_switching()).await?;

    let mut switch = FakeSwitch::connect(ctl.addr).await?;
    assert_eq!(switch.recv(WAIT).await?, Message::Hello);
    wait_until(WAIT, || ctl.count(SessionState::Connecting) == 1).await?;

    // Stay silent.
    switch.expect_closed(WAIT).await?;
    wait_until(WAIT, || ctl.plane.sessions().is_empty()).await?;

    let event = ctl.next_audit(WAIT).await?;
    assert_eq!(event.outcome, AuditOutcome::HandshakeTimeout);
    assert_eq!(event.identity, None);
    assert!(event.detail.is_some());
    ctl.stop().await
}

/// A stalled peer does not hold up anyone else's admission.
#[tokio::test]
async fn test_stalled_peer_does_not_block_others() -> Result<()> {
    let mut ctl = Controller::default_with(&[id(ALLOWED_A)]).await?;

    let _stalled = FakeSwitch::connect(ctl.addr).await?;
    let (_switch, rules) = FakeSwitch::join(ctl.addr, id(ALLOWED_A)).await?;
    assert!(has_normal_rule(&rules));
    wait_until(WAIT, || ctl.count(SessionState::Connecting) == 1).await?;
    assert_eq!(ctl.next_audit(WAIT).await?.outcome, AuditOutcome::Admitted);
    ctl.stop().await
}

/// No barrier acknowledgement: one retry, then the session is closed and
/// the fault reported.
#[tokio::test]
async fn test_unacknowledged_rules_close_session() -> Result<()> {
    let switching = SwitchingParams {
        ack_timeout: Duration::from_millis(200),
        ..quick_switching()
    };
    let mut ctl = start_controller(&[id(ALLOWED_A)], quick_settings(), switching).await?;

    let mut switch = FakeSwitch::connect(ctl.addr).await?;
    switch.announce(id(ALLOWED_A)).await?;

    let mut barriers = 0;
    loop {
        match switch.recv_or_closed(WAIT).await? {
            Some(Message::BarrierRequest) => barriers += 1,
            Some(_) => {}
            None => break,
        }
    }
    assert_eq!(barriers, 2, "expected the push and exactly one retry");

    assert_eq!(ctl.next_audit(WAIT).await?.outcome, AuditOutcome::Admitted);
    let fault = ctl.next_audit(WAIT).await?;
    assert_eq!(fault.outcome, AuditOutcome::RuleInstallFault);
    assert_eq!(fault.identity, Some(id(ALLOWED_A)));
    wait_until(WAIT, || ctl.plane.sessions().is_empty()).await?;
    ctl.stop().await
}

/// A switch rejecting the rule is treated like a failed push.
#[tokio::test]
async fn test_rejected_rule_closes_session() -> Result<()> {
    let switching = SwitchingParams {
        retry: false,
        ..quick_switching()
    };
    let mut ctl = start_controller(&[id(ALLOWED_A)], quick_settings(), switching).await?;

    let mut switch = FakeSwitch::connect(ctl.addr).await?;
    switch.announce(id(ALLOWED_A)).await?;
    switch.reject_rules().await?;
    switch.expect_closed(WAIT).await?;

    ctl.next_audit(WAIT).await?;
    let fault = ctl.next_audit(WAIT).await?;
    assert_eq!(fault.outcome, AuditOutcome::RuleInstallFault);
    assert!(fault.detail.unwrap_or_default().contains("1 attempt"));
    ctl.stop().await
}

/// Shutdown closes every session, whatever its state, and empties the
/// registry before returning.
#[tokio::test]
async fn test_shutdown_drains_all_sessions() -> Result<()> {
    let ctl = Controller::default_with(&[id(ALLOWED_A), id(ALLOWED_B)]).await?;

    let (mut a, _) = FakeSwitch::join(ctl.addr, id(ALLOWED_A)).await?;
    let (mut b, _) = FakeSwitch::join(ctl.addr, id(ALLOWED_B)).await?;
    let mut pending = FakeSwitch::connect(ctl.addr).await?;
    wait_until(WAIT, || ctl.plane.sessions().len() == 3).await?;

    let sessions = ctl.plane.sessions().clone();
    ctl.stop().await?;
    assert!(sessions.is_empty(), "sessions outlived the control plane");

    a.expect_closed(WAIT).await?;
    b.expect_closed(WAIT).await?;
    pending.expect_closed(WAIT).await?;
    Ok(())
}

/// Connections accepted by someone else can be handed over.
#[tokio::test]
async fn test_attached_connection_is_served() -> Result<()> {
    let mut ctl = Controller::default_with(&[id(ALLOWED_A)]).await?;

    let external = TcpListener::bind("127.0.0.1:0").await?;
    let external_addr = external.local_addr()?;
    let (client, accepted) = tokio::join!(
        tokio::net::TcpStream::connect(external_addr),
        external.accept()
    );
    let (server_side, peer) = accepted?;
    ctl.plane.attach(server_side, peer)?;

    let mut switch = FakeSwitch::from_stream(client?);
    switch.announce(id(ALLOWED_A)).await?;
    let rules = switch.accept_rules().await?;
    assert!(has_normal_rule(&rules));
    wait_until(WAIT, || ctl.count(SessionState::Active) == 1).await?;
    assert_eq!(ctl.next_audit(WAIT).await?.peer, peer);
    ctl.stop().await
}

/// Bind failure surfaces to the caller.
#[tokio::test]
async fn test_bind_fault_is_reported() -> Result<()> {
    let held = TcpListener::bind("127.0.0.1:0").await?;
    let port = held.local_addr()?.port();

    let (tx, _rx) = mpsc::unbounded_channel::<AuditEvent>();
    let mut plane = ControlPlane::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        quick_settings(),
        Arc::new(tx),
    );
    plane.setup(AuthorizationPolicy::default());
    let err = plane.start(port).await.expect_err("port is taken");
    assert!(err.to_string().contains(&port.to_string()), "{err}");
    assert!(plane.local_addr().is_none());
    Ok(())
}

/// An active datapath that stops answering echo probes is dropped.
#[tokio::test]
async fn test_keepalive_expiry_closes_session() -> Result<()> {
    let settings = SessionSettings {
        echo_interval: Duration::from_millis(150),
        ..quick_settings()
    };
    let mut ctl = start_controller(&[id(ALLOWED_A)], settings, quick_switching()).await?;

    let (mut switch, _) = FakeSwitch::join(ctl.addr, id(ALLOWED_A)).await?;
    assert!(matches!(switch.recv(WAIT).await?, Message::EchoRequest(_)));
    switch.expect_closed(WAIT).await?;

    ctl.next_audit(WAIT).await?;
    assert_eq!(ctl.next_audit(WAIT).await?.outcome, AuditOutcome::TransportFault);
    ctl.stop().await
}

/// Admissions and rejections land in the JSON-lines audit log, one object
/// per line, by the time the control plane is gone.
#[tokio::test]
async fn test_audit_log_records_decisions() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("sdncore-it-audit-{}", std::process::id()));
    let path = dir.join("audit.jsonl");
    let _ = std::fs::remove_file(&path);

    let (jsonl, writer) = JsonlAudit::open(&path).await?;
    let (tx, mut events) = mpsc::unbounded_channel::<AuditEvent>();
    let audit: SharedAudit = Arc::new(Fanout::new().with(Arc::new(tx)).with(Arc::new(jsonl)));

    let mut plane = ControlPlane::new(IpAddr::V4(Ipv4Addr::LOCALHOST), quick_settings(), audit);
    plane.setup(AuthorizationPolicy::new([id(ALLOWED_A)]));
    plane.setup_layer2_switching(quick_switching());
    let addr = plane.start(0).await?;

    let (_switch, _) = FakeSwitch::join(addr, id(ALLOWED_A)).await?;
    let mut stranger = FakeSwitch::connect(addr).await?;
    stranger.announce(id(STRANGER)).await?;
    stranger.expect_closed(WAIT).await?;
    for _ in 0..2 {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .context("audit event missing")?;
    }

    plane.shutdown().await?;
    drop(plane);
    tokio::time::timeout(WAIT, writer)
        .await
        .context("audit writer did not finish")??;

    let text = tokio::fs::read_to_string(&path).await?;
    let records: Vec<serde_json::Value> = text
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(records.len(), 2, "{text}");

    let outcome_of = |who: &str| {
        records
            .iter()
            .find(|r| r["identity"] == who)
            .map(|r| r["outcome"].clone())
    };
    assert_eq!(outcome_of(ALLOWED_A), Some(serde_json::json!("admitted")));
    assert_eq!(outcome_of(STRANGER), Some(serde_json::json!("denied")));
    assert!(records.iter().all(|r| r["timestamp_ms"].as_u64().is_some()));

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;

use crate::*;

const WAIT: Duration = Duration::from_secs(3);

/// Listed datapath: admitted, NORMAL rule pushed, session active.
#[tokio::test]
async fn test_listed_datapath_becomes_active() -> Result<()> {
    let mut ctl = Controller::default_with(&[id(ALLOWED_A)]).await?;

    let (switch, rules) = FakeSwitch::join(ctl.addr, id(ALLOWED_A)).await?;
    assert!(has_normal_rule(&rules), "no flood-and-learn rule in {rules:?}");
    assert_eq!(rules[0], FlowMod::delete_all(), "existing flows should be flushed first");

    wait_until(WAIT, || ctl.count(SessionState::Active) == 1).await?;
    let entry = ctl.plane.sessions().iter().next().map(|e| e.value().clone());
    assert_eq!(entry.and_then(|e| e.identity), Some(id(ALLOWED_A)));

    let event = ctl.next_audit(WAIT).await?;
    assert_eq!(event.outcome, AuditOutcome::Admitted);
    assert_eq!(event.identity, Some(id(ALLOWED_A)));

    switch.close().await;
    wait_until(WAIT, || ctl.plane.sessions().is_empty()).await?;
    ctl.stop().await
}

/// Unlisted datapath: rejected, disconnected, never sees a rule.
#[tokio::test]
async fn test_unlisted_datapath_is_rejected() -> Result<()> {
    let mut ctl = Controller::default_with(&[id(ALLOWED_A)]).await?;

    let mut switch = FakeSwitch::connect(ctl.addr).await?;
    switch.announce(id(STRANGER)).await?;
    switch.expect_closed(WAIT).await?;

    let event = ctl.next_audit(WAIT).await?;
    assert_eq!(event.outcome, AuditOutcome::Denied);
    assert_eq!(event.identity, Some(id(STRANGER)));

    wait_until(WAIT, || ctl.plane.sessions().is_empty()).await?;
    assert_eq!(ctl.count(SessionState::Active), 0);
    ctl.stop().await
}

/// Two listed datapaths connect together; both go active and closing one
/// leaves the other alone.
#[tokio::test]
async fn test_two_datapaths_are_independent() -> Result<()> {
    let mut ctl = Controller::default_with(&[id(ALLOWED_A), id(ALLOWED_B)]).await?;

    let (a, b) = tokio::join!(
        FakeSwitch::join(ctl.addr, id(ALLOWED_A)),
        FakeSwitch::join(ctl.addr, id(ALLOWED_B)),
    );
    let (a, rules_a) = a?;
    let (mut b, rules_b) = b?;
    assert!(has_normal_rule(&rules_a));
    assert!(has_normal_rule(&rules_b));
    wait_until(WAIT, || ctl.count(SessionState::Active) == 2).await?;

    a.close().await;
    wait_until(WAIT, || ctl.plane.sessions().len() == 1).await?;
    assert_eq!(ctl.count(SessionState::Active), 1);

    // B still answers keepalive traffic.
    b.send(&Message::EchoRequest(bytes::Bytes::from_static(b"still here")))
        .await?;
    assert_eq!(
        b.recv(WAIT).await?,
        Message::EchoReply(bytes::Bytes::from_static(b"still here"))
    );
    let remaining = ctl.plane.sessions().iter().next().and_then(|e| e.identity);
    assert_eq!(remaining, Some(id(ALLOWED_B)));

    let events = ctl.audits(2, WAIT).await?;
    assert!(events.iter().all(|e| e.outcome == AuditOutcome::Admitted));
    ctl.stop().await
}

/// K datapaths, M listed, all at once: exactly M active and K-M rejected.
#[tokio::test]
async fn test_concurrent_admission_matches_policy() -> Result<()> {
    const K: u16 = 24;
    const M: u16 = 10;
    let listed: Vec<Identity> = (0..M).map(nth_identity).collect();
    let mut ctl = Controller::default_with(&listed).await?;

    let mut tasks = Vec::new();
    for n in 0..K {
        let addr = ctl.addr;
        tasks.push(tokio::spawn(async move {
            let mut switch = FakeSwitch::connect(addr).await?;
            switch.announce(nth_identity(n)).await?;
            if n < M {
                let rules = switch.accept_rules().await?;
                anyhow::ensure!(has_normal_rule(&rules), "no rule for listed datapath {n}");
            } else {
                switch.expect_closed(Duration::from_secs(3)).await?;
            }
            anyhow::Ok(switch)
        }));
    }
    let mut switches = Vec::new();
    for task in tasks {
        switches.push(task.await??);
    }

    wait_until(WAIT, || ctl.count(SessionState::Active) == M as usize).await?;
    assert_eq!(ctl.plane.sessions().len(), M as usize, "rejected sessions must leave the registry");

    let events = ctl.audits(K as usize, WAIT).await?;
    let admitted: HashSet<Identity> = events
        .iter()
        .filter(|e| e.outcome == AuditOutcome::Admitted)
        .filter_map(|e| e.identity)
        .collect();
    let denied = events.iter().filter(|e| e.outcome == AuditOutcome::Denied).count();
    assert_eq!(admitted, listed.iter().copied().collect::<HashSet<_>>());
    assert_eq!(denied, (K - M) as usize);

    drop(switches);
    ctl.stop().await
}

/// Re-announcing on an admitted connection never yields a second decision.
#[tokio::test]
async fn test_single_decision_per_connection() -> Result<()> {
    let mut ctl = Controller::default_with(&[id(ALLOWED_A)]).await?;

    let (mut switch, _) = FakeSwitch::join(ctl.addr, id(ALLOWED_A)).await?;
    let spoof = Features {
        datapath_id: id(STRANGER).to_datapath_id(),
        n_buffers: 0,
        n_tables: 1,
        capabilities: 0,
    };
    switch.send(&Message::FeaturesReply(spoof)).await?;
    switch.send(&Message::FeaturesReply(spoof)).await?;

    // Round-trip an echo so the controller has processed both replies.
    switch.send(&Message::EchoRequest(bytes::Bytes::new())).await?;
    assert!(matches!(switch.recv(WAIT).await?, Message::EchoReply(_)));

    assert_eq!(ctl.next_audit(WAIT).await?.outcome, AuditOutcome::Admitted);
    assert!(ctl.audit.try_recv().is_err(), "second decision recorded");
    assert_eq!(ctl.count(SessionState::Active), 1);

    switch.close().await;
    ctl.stop().await
}

/// Policy swaps affect later connections only.
#[tokio::test]
async fn test_policy_replacement_applies_to_new_connections() -> Result<()> {
    let ctl = Controller::default_with(&[id(ALLOWED_A)]).await?;

    let (switch_a, _) = FakeSwitch::join(ctl.addr, id(ALLOWED_A)).await?;
    ctl.plane
        .policy()
        .replace(AuthorizationPolicy::new([id(ALLOWED_B)]));

    let (_switch_b, rules) = FakeSwitch::join(ctl.addr, id(ALLOWED_B)).await?;
    assert!(has_normal_rule(&rules));

    let mut again = FakeSwitch::connect(ctl.addr).await?;
    again.announce(id(ALLOWED_A)).await?;
    again.expect_closed(WAIT).await?;

    // The already admitted session keeps running.
    wait_until(WAIT, || ctl.count(SessionState::Active) == 2).await?;
    drop(switch_a);
    ctl.stop().await
}

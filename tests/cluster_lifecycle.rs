//! End-to-end cluster lifecycle over the in-process fabric: joins, crash
//! detection and removal, coordinator succession, concurrent admissions and
//! partition handling.

use std::sync::Arc;
use std::time::Duration;

use membership::{
    DefaultIdentifierFactory, DetectorConfig, HealthMonitor, InProcessNetwork, JoinConfig,
    Locator, LossAction, MajorityOfLastView, MemberData, MemberIdentifierFactory,
    MembershipConfig, MembershipService, MembershipView, QuorumPolicy, ViewDiscovery, ViewId,
    ViewStamp,
};

fn fast_config() -> MembershipConfig {
    MembershipConfig {
        detector: DetectorConfig {
            probe_interval: Duration::from_millis(30),
            probe_timeout: Duration::from_millis(20),
            missed_probe_threshold: 2,
            final_check_window: Duration::from_millis(50),
            final_check_attempts: 1,
            final_check_timeout: Duration::from_millis(100),
            ..DetectorConfig::default()
        },
        join: JoinConfig {
            join_timeout: Duration::from_secs(1),
            join_attempts: 5,
            retry_backoff: Duration::from_millis(50),
            ..JoinConfig::default()
        },
        ..MembershipConfig::default()
    }
}

fn spawn_member(
    network: &InProcessNetwork,
    locator: &Arc<Locator>,
    host: &str,
    health: HealthMonitor,
) -> Arc<MembershipService> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let identity = DefaultIdentifierFactory.create(MemberData::new(host, 7000));
    let view_stamp = ViewStamp::new();
    let config = fast_config();
    let (messenger, inbound) = network.register(
        identity.clone(),
        Arc::clone(&view_stamp),
        config.stale_view_tolerance,
        config.transport.inbound_buffer,
    );
    let (service, escalations) = MembershipService::new(
        identity,
        config,
        DefaultIdentifierFactory.comparator(),
        messenger,
        Arc::clone(locator) as Arc<dyn ViewDiscovery>,
        view_stamp,
        health,
    );
    service.start(inbound, escalations);
    service
}

async fn await_view<F>(service: &Arc<MembershipService>, what: &str, mut predicate: F)
where
    F: FnMut(&MembershipView) -> bool,
{
    for _ in 0..500 {
        if let Some(view) = service.current_view() {
            if predicate(&view) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for {what}; current view: {:?}",
        service.current_view()
    );
}

#[tokio::test]
async fn test_sequential_joins_advance_view_id() {
    let network = InProcessNetwork::new();
    let locator = Locator::new();

    let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
    let v0 = a.bootstrap().await.unwrap();
    assert_eq!(v0.view_id(), ViewId(0));
    assert_eq!(v0.members(), &[a.local_identity().clone()]);
    assert!(a.is_coordinator());

    let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
    let v1 = b.join().await.unwrap();
    assert_eq!(v1.view_id(), ViewId(1));

    let c = spawn_member(&network, &locator, "c", HealthMonitor::permissive());
    let v2 = c.join().await.unwrap();
    assert_eq!(v2.view_id(), ViewId(2));
    assert_eq!(v2.members().len(), 3);

    // All members converge on the same view and name the same coordinator
    for member in [&a, &b, &c] {
        await_view(member, "view v2 everywhere", |v| v.view_id() == ViewId(2)).await;
        assert_eq!(
            member.current_coordinator().as_ref(),
            Some(a.local_identity())
        );
    }
    assert!(a.is_coordinator());
    assert!(!b.is_coordinator());
}

#[tokio::test]
async fn test_crashed_member_is_removed_and_shunned() {
    let network = InProcessNetwork::new();
    let locator = Locator::new();

    let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
    a.bootstrap().await.unwrap();
    let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
    b.join().await.unwrap();
    let c = spawn_member(&network, &locator, "c", HealthMonitor::permissive());
    c.join().await.unwrap();
    await_view(&a, "full cluster", |v| v.members().len() == 3).await;

    let b_id = b.local_identity().clone();
    network.disconnect(&b_id);

    // Probing misses, suspicion, failed final check, removal
    await_view(&a, "view without b", |v| !v.contains(&b_id)).await;
    await_view(&c, "c learns of b's removal", |v| !v.contains(&b_id)).await;

    let view = a.current_view().unwrap();
    assert!(view.is_shunned(&b_id, 100));
    assert_eq!(view.members().len(), 2);
    assert!(view.view_id() > ViewId(2));
}

#[tokio::test]
async fn test_shunned_identity_stays_out_but_fresh_identity_rejoins() {
    let network = InProcessNetwork::new();
    let locator = Locator::new();

    let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
    a.bootstrap().await.unwrap();
    let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
    b.join().await.unwrap();
    await_view(&a, "two members", |v| v.members().len() == 2).await;

    let b_id = b.local_identity().clone();
    network.disconnect(&b_id);
    await_view(&a, "b removed", |v| !v.contains(&b_id)).await;

    // The same host restarts with a fresh incarnation token; it is a
    // different identity and admission succeeds
    let b2 = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
    assert_ne!(b2.local_identity(), &b_id);
    let view = b2.join().await.unwrap();
    assert!(view.contains(b2.local_identity()));
    assert!(view.is_shunned(&b_id, 100));
}

#[tokio::test]
async fn test_coordinator_departure_promotes_next_ranked() {
    let network = InProcessNetwork::new();
    let locator = Locator::new();

    let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
    a.bootstrap().await.unwrap();
    let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
    b.join().await.unwrap();
    let c = spawn_member(&network, &locator, "c", HealthMonitor::permissive());
    c.join().await.unwrap();
    await_view(&a, "full cluster", |v| v.members().len() == 3).await;

    let a_id = a.local_identity().clone();
    a.leave().await.unwrap();

    // b is comparator-next; it takes over and the lineage continues with
    // the same monotonically increasing view ids
    await_view(&b, "view without a", |v| !v.contains(&a_id)).await;
    await_view(&c, "c learns of a's departure", |v| !v.contains(&a_id)).await;
    assert!(b.is_coordinator());
    assert_eq!(
        c.current_coordinator().as_ref(),
        Some(b.local_identity())
    );
    let view = b.current_view().unwrap();
    assert_eq!(view.view_id(), ViewId(3));
    // Voluntary departure carries no shun record
    assert!(!view.is_shunned(&a_id, 100));

    // The successor serves new admissions
    let d = spawn_member(&network, &locator, "d", HealthMonitor::permissive());
    let v4 = d.join().await.unwrap();
    assert_eq!(v4.view_id(), ViewId(4));
    assert!(v4.contains(d.local_identity()));
}

#[tokio::test]
async fn test_crashed_coordinator_is_replaced() {
    let network = InProcessNetwork::new();
    let locator = Locator::new();

    let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
    a.bootstrap().await.unwrap();
    let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
    b.join().await.unwrap();
    let c = spawn_member(&network, &locator, "c", HealthMonitor::permissive());
    c.join().await.unwrap();
    await_view(&c, "full cluster", |v| v.members().len() == 3).await;

    let a_id = a.local_identity().clone();
    network.disconnect(&a_id);

    // b suspects a, cannot reach the dead coordinator, and once it learns
    // (through its own escalation path) that it is next in line it drives
    // the removal itself after taking over
    await_view(&b, "b expels a", |v| !v.contains(&a_id)).await;
    assert!(b.is_coordinator());
    await_view(&c, "c follows the new lineage", |v| !v.contains(&a_id)).await;
    assert_eq!(
        c.current_coordinator().as_ref(),
        Some(b.local_identity())
    );
}

#[tokio::test]
async fn test_concurrent_joins_are_serialized() {
    let network = InProcessNetwork::new();
    let locator = Locator::new();

    let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
    a.bootstrap().await.unwrap();

    let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
    let c = spawn_member(&network, &locator, "c", HealthMonitor::permissive());
    let (vb, vc) = tokio::join!(b.join(), c.join());
    let vb = vb.unwrap();
    let vc = vc.unwrap();

    // One admission lands in v1, the other in v2; order is not guaranteed
    let mut ids = [vb.view_id(), vc.view_id()];
    ids.sort();
    assert_eq!(ids, [ViewId(1), ViewId(2)]);

    await_view(&a, "both admitted", |v| v.members().len() == 3).await;
    let view = a.current_view().unwrap();
    assert!(view.contains(b.local_identity()));
    assert!(view.contains(c.local_identity()));
}

#[tokio::test]
async fn test_minority_side_of_partition_shuts_down() {
    let network = InProcessNetwork::new();
    let locator = Locator::new();

    // a applies majority quorum with a shutdown response
    let a = spawn_member(
        &network,
        &locator,
        "a",
        HealthMonitor::new(
            Arc::new(MajorityOfLastView::new()) as Arc<dyn QuorumPolicy>,
            LossAction::Shutdown,
        ),
    );
    a.bootstrap().await.unwrap();
    let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
    b.join().await.unwrap();
    let c = spawn_member(&network, &locator, "c", HealthMonitor::permissive());
    c.join().await.unwrap();
    await_view(&a, "full cluster", |v| v.members().len() == 3).await;

    // Partition a away from b and c
    network.sever(a.local_identity(), b.local_identity());
    network.sever(a.local_identity(), c.local_identity());

    // As coordinator, a expels the unreachable majority one by one until
    // its own side drops below quorum, and the shutdown policy fires
    for _ in 0..500 {
        if a.is_stopped() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(a.is_stopped());
}

#[tokio::test]
async fn test_collaborators_see_ordered_view_events() {
    let network = InProcessNetwork::new();
    let locator = Locator::new();

    let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
    a.bootstrap().await.unwrap();
    let mut events = a.subscribe();

    let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
    b.join().await.unwrap();
    let c = spawn_member(&network, &locator, "c", HealthMonitor::permissive());
    c.join().await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();

    // Events arrive in install order with contiguous deltas
    assert_eq!(first.new.view_id(), ViewId(1));
    assert_eq!(first.delta.added, vec![b.local_identity().clone()]);
    assert_eq!(second.new.view_id(), ViewId(2));
    assert_eq!(second.delta.added, vec![c.local_identity().clone()]);
    assert_eq!(
        second.old.as_ref().map(|v| v.view_id()),
        Some(ViewId(1))
    );
}

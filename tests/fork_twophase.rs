//! Tests for point-in-time forking and post-fork isolation.
//!
//! Modeled on branching a database with transactions left in prepared
//! state: the fork must reconstruct exactly the prepared-transaction set
//! valid at the fork position, and the two branches must evolve
//! independently afterwards.

use lineage::{
    Lsn, RetentionPolicy, ServiceConfig, StoreError, TimelineService,
};
use tempfile::TempDir;

fn test_service(dir: &TempDir) -> TimelineService {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    TimelineService::create(ServiceConfig {
        path: dir.path().join("service"),
        ..Default::default()
    })
    .unwrap()
}

fn pending_ids(service: &TimelineService, tenant: lineage::TenantId, tl: lineage::TimelineId) -> Vec<String> {
    service
        .pending_artifacts(tenant, tl)
        .unwrap()
        .into_iter()
        .map(|a| a.id)
        .collect()
}

#[test]
fn test_fork_copies_exactly_the_snapshot_at_position() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let tenant = service.create_tenant().unwrap();
    let main = service.create_timeline(tenant, "main").unwrap();

    // A: created before P, still pending at P.
    service.put_artifact(tenant, main, "a", Lsn(2), b"a-state").unwrap();
    // B: created before P, retired before P.
    service.put_artifact(tenant, main, "b", Lsn(3), b"b-state").unwrap();
    service.retire_artifact(tenant, main, "b", Lsn(5)).unwrap();
    // C: created after P.
    service.put_artifact(tenant, main, "c", Lsn(9), b"c-state").unwrap();

    let fork_point = Lsn(7);
    let snapshot = service.snapshot_as_of(tenant, main, fork_point).unwrap();
    let ids: Vec<&str> = snapshot.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["a"]);

    let branch = service
        .fork_timeline(tenant, main, fork_point, "branch")
        .unwrap();

    // The child contains exactly A, with its creation position and payload
    // preserved, pending again.
    let artifacts = service.pending_artifacts(tenant, branch).unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].id, "a");
    assert_eq!(artifacts[0].created_at, Lsn(2));
    assert_eq!(artifacts[0].payload, b"a-state");
    assert!(artifacts[0].retired_at.is_none());

    let detail = service.timeline_detail(tenant, branch).unwrap();
    assert_eq!(detail.parent, Some(main));
    assert_eq!(detail.fork_lsn, Some(fork_point));
    assert_eq!(detail.head, fork_point);
}

#[test]
fn test_branches_evolve_independently() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let tenant = service.create_tenant().unwrap();
    let main = service.create_timeline(tenant, "main").unwrap();

    service.put_artifact(tenant, main, "a", Lsn(1), b"a").unwrap();
    service.put_artifact(tenant, main, "b", Lsn(2), b"b").unwrap();

    let branch = service.fork_timeline(tenant, main, Lsn(2), "branch").unwrap();

    // Retiring A on the child does not retire it on the parent.
    service.retire_artifact(tenant, branch, "a", Lsn(3)).unwrap();
    assert_eq!(pending_ids(&service, tenant, branch), vec!["b"]);
    assert_eq!(pending_ids(&service, tenant, main), vec!["a", "b"]);

    // And vice versa.
    service.retire_artifact(tenant, main, "b", Lsn(3)).unwrap();
    assert_eq!(pending_ids(&service, tenant, main), vec!["a"]);
    assert_eq!(pending_ids(&service, tenant, branch), vec!["b"]);

    // New artifacts stay local to their branch too.
    service.put_artifact(tenant, branch, "c", Lsn(4), b"c").unwrap();
    assert_eq!(pending_ids(&service, tenant, branch), vec!["b", "c"]);
    assert_eq!(pending_ids(&service, tenant, main), vec!["a"]);
}

#[test]
fn test_fork_with_prepared_transactions() {
    // The two-phase-commit scenario: prepare four transactions, resolve
    // two, fork at the current position, resolve the rest independently.
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let tenant = service.create_tenant().unwrap();
    let main = service.create_timeline(tenant, "twophase").unwrap();

    service.put_artifact(tenant, main, "insert_one", Lsn(1), b"one").unwrap();
    service.put_artifact(tenant, main, "insert_two", Lsn(2), b"two").unwrap();
    service.put_artifact(tenant, main, "insert_three", Lsn(3), b"three").unwrap();
    service.put_artifact(tenant, main, "insert_four", Lsn(4), b"four").unwrap();
    assert_eq!(service.pending_artifacts(tenant, main).unwrap().len(), 4);

    // COMMIT PREPARED / ROLLBACK PREPARED both just retire the artifact.
    service.retire_artifact(tenant, main, "insert_three", Lsn(5)).unwrap();
    service.retire_artifact(tenant, main, "insert_four", Lsn(6)).unwrap();
    assert_eq!(
        pending_ids(&service, tenant, main),
        vec!["insert_one", "insert_two"]
    );

    // Fork at the current position: only the still-prepared transactions
    // are restored on the new branch.
    let head = service.timeline_detail(tenant, main).unwrap().head;
    let branch = service
        .fork_timeline(tenant, main, head, "twophase_prepared")
        .unwrap();
    assert_eq!(
        pending_ids(&service, tenant, branch),
        vec!["insert_one", "insert_two"]
    );

    // Resolve them on the new branch; the original branch is unaffected.
    service.retire_artifact(tenant, branch, "insert_one", Lsn(7)).unwrap();
    service.retire_artifact(tenant, branch, "insert_two", Lsn(8)).unwrap();
    assert!(pending_ids(&service, tenant, branch).is_empty());
    assert_eq!(
        pending_ids(&service, tenant, main),
        vec!["insert_one", "insert_two"]
    );
}

#[test]
fn test_fork_before_retirement_keeps_all_pending() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let tenant = service.create_tenant().unwrap();
    let t0 = service.create_timeline(tenant, "t0").unwrap();

    let positions = [Lsn(1), Lsn(2), Lsn(3), Lsn(4)];
    for (i, lsn) in positions.iter().enumerate() {
        let id = format!("p{}", i + 1);
        service.put_artifact(tenant, t0, &id, *lsn, b"pending").unwrap();
    }

    // Fork after all four prepares, then retire two on the original.
    let t1 = service.fork_timeline(tenant, t0, Lsn(4), "t1").unwrap();
    service.retire_artifact(tenant, t0, "p3", Lsn(5)).unwrap();
    service.retire_artifact(tenant, t0, "p4", Lsn(6)).unwrap();

    // The snapshot was taken before the retirements.
    assert_eq!(
        pending_ids(&service, tenant, t1),
        vec!["p1", "p2", "p3", "p4"]
    );
    assert_eq!(pending_ids(&service, tenant, t0), vec!["p1", "p2"]);
}

#[test]
fn test_fork_at_position_before_id_reuse() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let tenant = service.create_tenant().unwrap();
    let main = service.create_timeline(tenant, "main").unwrap();

    // The same transaction name prepared, resolved, and prepared again.
    service.put_artifact(tenant, main, "tx", Lsn(1), b"first").unwrap();
    service.retire_artifact(tenant, main, "tx", Lsn(3)).unwrap();
    service.put_artifact(tenant, main, "tx", Lsn(5), b"second").unwrap();

    // A fork before the retirement restores the first incarnation.
    let early = service.fork_timeline(tenant, main, Lsn(2), "early").unwrap();
    let artifacts = service.pending_artifacts(tenant, early).unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].created_at, Lsn(1));
    assert_eq!(artifacts[0].payload, b"first");

    // A fork after the re-creation restores the second.
    let late = service.fork_timeline(tenant, main, Lsn(5), "late").unwrap();
    let artifacts = service.pending_artifacts(tenant, late).unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].created_at, Lsn(5));
    assert_eq!(artifacts[0].payload, b"second");
}

#[test]
fn test_fork_point_must_be_within_retained_window() {
    let dir = TempDir::new().unwrap();
    let service = TimelineService::create(ServiceConfig {
        path: dir.path().join("service"),
        retention: RetentionPolicy::WindowBehindHead(10),
        ..Default::default()
    })
    .unwrap();
    let tenant = service.create_tenant().unwrap();
    let main = service.create_timeline(tenant, "main").unwrap();

    // Beyond the head.
    service.advance(tenant, main, Lsn(5)).unwrap();
    let err = service.fork_timeline(tenant, main, Lsn(6), "late").unwrap_err();
    assert!(matches!(err, StoreError::InvalidForkPoint { .. }));

    // Build retired history, then let maintenance raise the horizon.
    service.put_artifact(tenant, main, "old", Lsn(5), b"x").unwrap();
    service.retire_artifact(tenant, main, "old", Lsn(8)).unwrap();
    service.advance(tenant, main, Lsn(30)).unwrap();
    service.run_maintenance_pass();

    // Horizon is now head - window = 20.
    assert_eq!(service.timeline_detail(tenant, main).unwrap().horizon, Lsn(20));
    assert!(matches!(
        service.fork_timeline(tenant, main, Lsn(8), "too_old"),
        Err(StoreError::InvalidForkPoint { .. })
    ));
    service.fork_timeline(tenant, main, Lsn(20), "at_horizon").unwrap();
}

#[test]
fn test_fork_names_are_unique_per_tenant() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let tenant = service.create_tenant().unwrap();
    let main = service.create_timeline(tenant, "main").unwrap();

    let branch = service.fork_timeline(tenant, main, Lsn(0), "branch").unwrap();
    assert_eq!(
        service.timeline_by_name(tenant, "branch").unwrap(),
        Some(branch)
    );
    assert!(matches!(
        service.fork_timeline(tenant, main, Lsn(0), "branch"),
        Err(StoreError::TimelineExists(_))
    ));

    // Another tenant may reuse the name.
    let other = service.create_tenant().unwrap();
    let other_main = service.create_timeline(other, "main").unwrap();
    service.fork_timeline(other, other_main, Lsn(0), "branch").unwrap();
}

#[test]
fn test_fork_from_unknown_parent() {
    let dir = TempDir::new().unwrap();
    let service = test_service(&dir);
    let tenant = service.create_tenant().unwrap();

    assert!(matches!(
        service.fork_timeline(tenant, lineage::TimelineId(77), Lsn(0), "b"),
        Err(StoreError::TimelineNotFound { .. })
    ));
    assert!(matches!(
        service.fork_timeline(lineage::TenantId(77), lineage::TimelineId(1), Lsn(0), "b"),
        Err(StoreError::TenantNotFound(_))
    ));
}

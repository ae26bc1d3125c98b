//! Tests for service restart: the ancestry graph and artifact state are
//! rebuilt from the persisted tree.

use lineage::{
    Lsn, RetentionPolicy, ServiceConfig, StoreError, TimelineService, TimelineState,
};
use tempfile::TempDir;

fn config(dir: &TempDir) -> ServiceConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    ServiceConfig {
        path: dir.path().join("service"),
        ..Default::default()
    }
}

#[test]
fn test_ancestry_and_artifacts_survive_reopen() {
    let dir = TempDir::new().unwrap();

    let (tenant, main, branch) = {
        let service = TimelineService::create(config(&dir)).unwrap();
        let tenant = service.create_tenant().unwrap();
        let main = service.create_timeline(tenant, "main").unwrap();

        service.put_artifact(tenant, main, "a", Lsn(1), b"a-state").unwrap();
        service.put_artifact(tenant, main, "b", Lsn(2), b"b-state").unwrap();
        service.retire_artifact(tenant, main, "a", Lsn(3)).unwrap();

        let branch = service.fork_timeline(tenant, main, Lsn(2), "branch").unwrap();
        service.close().unwrap();
        (tenant, main, branch)
    };

    let service = TimelineService::open(config(&dir)).unwrap();
    assert!(service.tenant_exists(tenant));
    assert_eq!(service.list_timelines(tenant).unwrap(), vec![main, branch]);

    let detail = service.timeline_detail(tenant, main).unwrap();
    assert_eq!(detail.name, "main");
    assert_eq!(detail.state, TimelineState::Active);
    // Head recovered from the artifact log.
    assert_eq!(detail.head, Lsn(3));
    assert_eq!(detail.pending_artifacts, 1);

    let branch_detail = service.timeline_detail(tenant, branch).unwrap();
    assert_eq!(branch_detail.parent, Some(main));
    assert_eq!(branch_detail.fork_lsn, Some(Lsn(2)));

    // The child index came back too: the parent is still protected.
    assert!(matches!(
        service.delete_timeline(tenant, main),
        Err(StoreError::HasChildren(_))
    ));

    // Both "a" and "b" were pending at the fork point.
    let pending: Vec<String> = service
        .pending_artifacts(tenant, branch)
        .unwrap()
        .into_iter()
        .map(|a| a.id)
        .collect();
    assert_eq!(pending, vec!["a", "b"]);
}

#[test]
fn test_ids_keep_increasing_across_reopen() {
    let dir = TempDir::new().unwrap();

    let (tenant, first) = {
        let service = TimelineService::create(config(&dir)).unwrap();
        let tenant = service.create_tenant().unwrap();
        let first = service.create_timeline(tenant, "first").unwrap();
        service.close().unwrap();
        (tenant, first)
    };

    let service = TimelineService::open(config(&dir)).unwrap();
    let second = service.create_timeline(tenant, "second").unwrap();
    assert!(second > first);

    // Even after deleting, ids are never reused.
    service.delete_timeline(tenant, second).unwrap();
    let third = service.create_timeline(tenant, "third").unwrap();
    assert!(third > second);
}

#[test]
fn test_deleted_timeline_stays_deleted_after_reopen() {
    let dir = TempDir::new().unwrap();

    let (tenant, main, branch) = {
        let service = TimelineService::create(config(&dir)).unwrap();
        let tenant = service.create_tenant().unwrap();
        let main = service.create_timeline(tenant, "main").unwrap();
        let branch = service.fork_timeline(tenant, main, Lsn(0), "branch").unwrap();
        service.delete_timeline(tenant, branch).unwrap();
        service.close().unwrap();
        (tenant, main, branch)
    };

    let service = TimelineService::open(config(&dir)).unwrap();
    assert!(matches!(
        service.timeline_detail(tenant, branch),
        Err(StoreError::TimelineNotFound { .. })
    ));
    assert!(!service.timeline_path(tenant, branch).exists());

    // The parent became deletable by the branch's removal.
    service.delete_timeline(tenant, main).unwrap();
}

#[test]
fn test_compaction_horizon_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let cfg = ServiceConfig {
        retention: RetentionPolicy::WindowBehindHead(5),
        ..config(&dir)
    };

    let (tenant, main) = {
        let service = TimelineService::create(cfg.clone()).unwrap();
        let tenant = service.create_tenant().unwrap();
        let main = service.create_timeline(tenant, "main").unwrap();
        service.put_artifact(tenant, main, "old", Lsn(1), b"x").unwrap();
        service.retire_artifact(tenant, main, "old", Lsn(2)).unwrap();
        service.put_artifact(tenant, main, "live", Lsn(3), b"y").unwrap();
        service.advance(tenant, main, Lsn(20)).unwrap();
        service.run_maintenance_pass();
        assert_eq!(service.timeline_detail(tenant, main).unwrap().horizon, Lsn(15));
        service.close().unwrap();
        (tenant, main)
    };

    let service = TimelineService::open(cfg).unwrap();
    let detail = service.timeline_detail(tenant, main).unwrap();
    assert_eq!(detail.horizon, Lsn(15));
    assert_eq!(detail.pending_artifacts, 1);
    assert!(matches!(
        service.snapshot_as_of(tenant, main, Lsn(10)),
        Err(StoreError::InvalidForkPoint { .. })
    ));
}

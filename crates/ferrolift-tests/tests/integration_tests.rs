//! Integration tests for FerroLift
//!
//! These tests run whole transfers through the engine, from submission through staging and
//! copying to the final roll-up, against in-memory and local filesystem storage.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use ferrolift_engine::scheduler::fair_interleave;
use ferrolift_engine::{Dispatcher, SchedulerConfig, TransferEngine, TransferRequest, WorkQueues};
use ferrolift_io::{MemoryAdapter, ReadOnlyAdapter};
use ferrolift_store::{InMemoryTaskStore, TaskStore};
use ferrolift_tests::test_utils::{
    create_test_file, fast_config, local_uri, mem_uri, wait_until, EngineFixture, MEM_SYSTEM,
    SETTLE_TIMEOUT,
};
use ferrolift_types::{
    ErrorKind, ParentTask, TaskId, TaskKind, TaskStatus, TopTask, WorkerId, WorkerRecord,
};
use futures::future::join_all;
use proptest::prelude::*;
use rstest::rstest;
use tempfile::TempDir;

async fn register_worker(store: &InMemoryTaskStore) -> WorkerId {
    let id = WorkerId::new();
    store
        .register_worker(WorkerRecord::new(id, "test-host"))
        .await
        .unwrap();
    id
}

async fn accept(store: &InMemoryTaskStore, tenant: &str, elements: usize) -> TopTask {
    let top = TopTask::new(tenant, "alice");
    let parents: Vec<ParentTask> = (0..elements)
        .map(|i| ParentTask::new(&top, mem_uri(&format!("/{tenant}/{i}")), mem_uri("/out"), false))
        .collect();
    store.create_transfer(top, parents).await.unwrap()
}

#[rstest]
#[case(0)]
#[case(10_240)]
#[case(300_000)]
#[tokio::test]
async fn test_single_file_transfer(#[case] size: usize) {
    let fixture = EngineFixture::new(1).await;
    fixture.put("/in/report.bin", size);

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/in/report.bin"), mem_uri("/out/report.bin"));
    let top = fixture.run(request).await;

    assert_eq!(top.status, TaskStatus::Completed);
    let parents = fixture.engine.parents_of(top.id).await.unwrap();
    assert_eq!(parents.len(), 1);
    assert_eq!(parents[0].status, TaskStatus::Completed);
    assert_eq!(parents[0].total_bytes, Some(size as u64));

    let children = fixture.children(top.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, TaskStatus::Completed);
    assert_eq!(children[0].bytes_transferred, size as u64);
    assert_eq!(
        fixture.memory.get("/out/report.bin"),
        fixture.memory.get("/in/report.bin")
    );

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_directory_transfer_creates_one_child_per_file() {
    let fixture = EngineFixture::new(2).await;
    fixture.put("/in/a.bin", 10_240);
    fixture.put("/in/sub/b.bin", 10_240);

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/in"), mem_uri("/out"));
    let top = fixture.run(request).await;

    assert_eq!(top.status, TaskStatus::Completed);
    let parent = &fixture.engine.parents_of(top.id).await.unwrap()[0];
    assert_eq!(parent.total_bytes, Some(20_480));
    assert_eq!(parent.child_count, 2);

    let children = fixture.children(top.id).await.unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.status == TaskStatus::Completed));
    assert_eq!(fixture.memory.get("/out/sub/b.bin").map(|b| b.len()), Some(10_240));

    let stats = fixture.engine.statistics().await;
    assert_eq!(stats.children_completed, 2);
    assert_eq!(stats.bytes_transferred, 20_480);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_local_directory_transfer() {
    let temp_dir = TempDir::new().unwrap();
    create_test_file(temp_dir.path(), "src/a.txt", 10_240);
    create_test_file(temp_dir.path(), "src/nested/b.txt", 10_240);

    let fixture = EngineFixture::new(2).await.with_local_root(temp_dir.path()).await;
    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(local_uri("src"), local_uri("dst"));
    let top = fixture.run(request).await;

    assert_eq!(top.status, TaskStatus::Completed);
    let copied = fs::read(temp_dir.path().join("dst/nested/b.txt")).unwrap();
    assert_eq!(copied, fs::read(temp_dir.path().join("src/nested/b.txt")).unwrap());
    assert_eq!(fs::metadata(temp_dir.path().join("dst/a.txt")).unwrap().len(), 10_240);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_missing_required_source_fails_transfer() {
    let fixture = EngineFixture::new(1).await;

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/missing"), mem_uri("/out"));
    let top = fixture.run(request).await;

    assert_eq!(top.status, TaskStatus::Failed);
    let parent = &fixture.engine.parents_of(top.id).await.unwrap()[0];
    assert_eq!(parent.status, TaskStatus::Failed);
    assert_eq!(parent.child_count, 0);
    assert!(parent.error.as_deref().unwrap_or_default().contains("/missing"));

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_missing_optional_source_completes_empty() {
    let fixture = EngineFixture::new(1).await;

    let request = TransferRequest::new("tenant-a", "alice")
        .with_optional_element(mem_uri("/missing"), mem_uri("/out"));
    let top = fixture.run(request).await;

    assert_eq!(top.status, TaskStatus::Completed);
    let parent = &fixture.engine.parents_of(top.id).await.unwrap()[0];
    assert_eq!(parent.status, TaskStatus::Completed);
    assert!(fixture.children(top.id).await.unwrap().is_empty());

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_optional_failure_does_not_fail_transfer() {
    let fixture = EngineFixture::new(2).await;
    fixture.put("/in/required.bin", 4096);
    fixture.put("/extra/ok.bin", 4096);
    fixture.put("/extra/locked.bin", 4096);
    fixture.memory.deny("/extra/locked.bin").unwrap();

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/in/required.bin"), mem_uri("/out/required.bin"))
        .with_optional_element(mem_uri("/extra"), mem_uri("/out/extra"));
    let top = fixture.run(request).await;

    assert_eq!(top.status, TaskStatus::Completed);
    let parents = fixture.engine.parents_of(top.id).await.unwrap();
    let optional = parents.iter().find(|p| p.optional).unwrap();
    assert_eq!(optional.status, TaskStatus::Completed);
    assert!(optional.error.as_deref().unwrap_or_default().contains("1 of 2 files failed"));

    let children = fixture.engine.children_of(optional.id).await.unwrap();
    let locked = children.iter().find(|c| c.source.ends_with("locked.bin")).unwrap();
    assert_eq!(locked.status, TaskStatus::Failed);
    assert_eq!(locked.retry_count, 1);
    assert!(fixture.memory.get("/out/extra/ok.bin").is_some());

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_disabled_system_fails_transfer() {
    let fixture = EngineFixture::new(1).await;
    fixture.put("/in/a.bin", 1024);
    fixture.engine.registry().set_enabled(MEM_SYSTEM, false).await.unwrap();

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/in/a.bin"), mem_uri("/out/a.bin"));
    let top = fixture.run(request).await;

    assert_eq!(top.status, TaskStatus::Failed);
    assert!(fixture.children(top.id).await.unwrap().is_empty());

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_read_only_system_serves_sources_only() {
    let fixture = EngineFixture::new(1).await;
    let site = MemoryAdapter::new();
    site.insert("/index.html", vec![b'x'; 2048]).unwrap();
    fixture
        .engine
        .registry()
        .register("web", Arc::new(ReadOnlyAdapter::new(Arc::new(site), "http")))
        .await;
    fixture.put("/in/upload.bin", 1024);

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element("http://web/index.html", mem_uri("/mirror/index.html"));
    let top = fixture.run(request).await;
    assert_eq!(top.status, TaskStatus::Completed);
    assert_eq!(fixture.memory.get("/mirror/index.html").map(|b| b.len()), Some(2048));

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/in/upload.bin"), "http://web/upload.bin");
    let top = fixture.run(request).await;
    assert_eq!(top.status, TaskStatus::Failed);
    let child = &fixture.children(top.id).await.unwrap()[0];
    assert_eq!(child.status, TaskStatus::Failed);
    assert_eq!(child.retry_count, 1);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_success() {
    let fixture = EngineFixture::new(1).await;
    fixture.put("/in/flaky.bin", 8192);
    fixture.memory.inject_read_faults("/in/flaky.bin", 2).unwrap();

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/in/flaky.bin"), mem_uri("/out/flaky.bin"));
    let top = fixture.run(request).await;

    assert_eq!(top.status, TaskStatus::Completed);
    let child = &fixture.children(top.id).await.unwrap()[0];
    assert_eq!(child.retry_count, 3);
    assert_eq!(child.bytes_transferred, 8192);
    assert_eq!(fixture.memory.read_opens("/in/flaky.bin"), 3);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let fixture = EngineFixture::new(1).await;
    fixture.put("/in/broken.bin", 8192);
    fixture.memory.inject_read_faults("/in/broken.bin", 100).unwrap();

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/in/broken.bin"), mem_uri("/out/broken.bin"));
    let top = fixture.run(request).await;

    assert_eq!(top.status, TaskStatus::Failed);
    let child = &fixture.children(top.id).await.unwrap()[0];
    assert_eq!(child.status, TaskStatus::Failed);
    assert_eq!(child.retry_count, 5);
    assert_eq!(fixture.memory.read_opens("/in/broken.bin"), 5);
    assert!(child.error.is_some());

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_cancel_stops_in_flight_children() {
    let mut config = fast_config();
    config.worker.max_concurrent_tasks = 8;
    config.dispatch.backlog_threshold = 10;
    let memory = MemoryAdapter::new().with_read_throttle(4096, Duration::from_millis(10));
    let fixture = EngineFixture::with_config(config, 1, memory).await;
    for i in 0..5 {
        fixture.put(&format!("/big/{i}.bin"), 256 * 1024);
    }

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/big"), mem_uri("/out"));
    let top = fixture.engine.submit(request).await.unwrap();
    fixture.wait_for_children(top.id, TaskStatus::InProgress, 5).await;

    let outcome = fixture.engine.cancel(top.id).await.unwrap();
    assert!(outcome.accepted);
    assert_eq!(outcome.in_flight.len(), 5);

    let top = fixture.engine.wait_for_top(top.id, SETTLE_TIMEOUT).await.unwrap();
    assert_eq!(top.status, TaskStatus::Cancelled);
    let children = fixture.children(top.id).await.unwrap();
    assert_eq!(children.len(), 5);
    assert!(children.iter().all(|c| c.status == TaskStatus::Cancelled));
    let parent = &fixture.engine.parents_of(top.id).await.unwrap()[0];
    assert_eq!(parent.status, TaskStatus::Cancelled);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_cancel_of_one_child_leaves_siblings_running() {
    let mut config = fast_config();
    config.worker.max_concurrent_tasks = 4;
    let memory = MemoryAdapter::new().with_read_throttle(4096, Duration::from_millis(5));
    let fixture = EngineFixture::with_config(config, 1, memory).await;
    fixture.put("/pair/a.bin", 256 * 1024);
    fixture.put("/pair/b.bin", 256 * 1024);

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/pair"), mem_uri("/out"));
    let top = fixture.engine.submit(request).await.unwrap();
    fixture.wait_for_children(top.id, TaskStatus::InProgress, 2).await;

    let children = fixture.children(top.id).await.unwrap();
    let target = children.iter().find(|c| c.source.ends_with("a.bin")).unwrap();
    assert!(fixture.engine.cancel(target.id).await.unwrap().accepted);

    let top = fixture.engine.wait_for_top(top.id, SETTLE_TIMEOUT).await.unwrap();
    let children = fixture.children(top.id).await.unwrap();
    let status_of = |name: &str| {
        children
            .iter()
            .find(|c| c.source.ends_with(name))
            .map(|c| c.status)
    };
    assert_eq!(status_of("a.bin"), Some(TaskStatus::Cancelled));
    assert_eq!(status_of("b.bin"), Some(TaskStatus::Completed));
    assert_eq!(top.status, TaskStatus::Cancelled);
    assert!(!top.cancel_requested);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_cancel_of_finished_transfer_is_noop() {
    let fixture = EngineFixture::new(1).await;
    fixture.put("/in/a.bin", 1024);

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/in/a.bin"), mem_uri("/out/a.bin"));
    let top = fixture.run(request).await;
    assert_eq!(top.status, TaskStatus::Completed);

    let outcome = fixture.engine.cancel(top.id).await.unwrap();
    assert!(!outcome.accepted);
    let again = fixture.engine.get_top(top.id).await.unwrap();
    assert_eq!(again.status, TaskStatus::Completed);
    assert_eq!(again.ended_at, top.ended_at);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_dead_worker_tasks_are_reclaimed() {
    let mut config = fast_config();
    config.dispatch.heartbeat_timeout_ms = 200;
    let memory = MemoryAdapter::new().with_read_throttle(4096, Duration::from_millis(20));
    let fixture = EngineFixture::with_config(config, 1, memory).await;
    fixture.put("/in/slow.bin", 128 * 1024);

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/in/slow.bin"), mem_uri("/out/slow.bin"));
    let top = fixture.engine.submit(request).await.unwrap();
    fixture.wait_for_children(top.id, TaskStatus::InProgress, 1).await;

    let zombie = fixture.engine.worker_ids().await[0];
    fixture.engine.kill_worker(zombie).await.unwrap();
    fixture.engine.spawn_worker().await.unwrap();

    let top = fixture.engine.wait_for_top(top.id, SETTLE_TIMEOUT).await.unwrap();
    assert_eq!(top.status, TaskStatus::Completed);
    let child = &fixture.children(top.id).await.unwrap()[0];
    assert_eq!(child.retry_count, 2);
    assert_eq!(child.bytes_transferred, 128 * 1024);

    let workers = fixture.engine.store().workers().await.unwrap();
    assert!(workers.iter().all(|w| w.id != zombie));

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_stopped_worker_hands_back_its_tasks() {
    let memory = MemoryAdapter::new().with_read_throttle(4096, Duration::from_millis(10));
    let fixture = EngineFixture::with_config(fast_config(), 1, memory).await;
    fixture.put("/in/slow.bin", 64 * 1024);

    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/in/slow.bin"), mem_uri("/out/slow.bin"));
    let top = fixture.engine.submit(request).await.unwrap();
    fixture.wait_for_children(top.id, TaskStatus::InProgress, 1).await;

    let first = fixture.engine.worker_ids().await[0];
    fixture.engine.stop_worker(first).await.unwrap();
    fixture.engine.spawn_worker().await.unwrap();

    let top = fixture.engine.wait_for_top(top.id, SETTLE_TIMEOUT).await.unwrap();
    assert_eq!(top.status, TaskStatus::Completed);
    assert_eq!(fixture.children(top.id).await.unwrap()[0].retry_count, 2);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_is_fair_across_tenants() {
    let store = Arc::new(InMemoryTaskStore::new());
    accept(&store, "tenant-a", 10).await;
    let small = accept(&store, "tenant-b", 1).await;
    let workers = [register_worker(&store).await, register_worker(&store).await];

    let config = SchedulerConfig {
        backlog_threshold: 1,
        ..SchedulerConfig::default()
    };
    let dispatcher = Dispatcher::new(store.clone(), WorkQueues::new(), config);
    let report = dispatcher.run_cycle(TaskKind::Parent).await.unwrap();
    assert_eq!(report.needy_workers, 2);
    assert_eq!(report.assigned, 2);

    let mut assigned = Vec::new();
    for worker in workers {
        assigned.extend(store.assigned_to(TaskKind::Parent, worker).await.unwrap());
    }
    assert!(assigned.contains(&small.parent_ids[0]));

    // Every worker is at its threshold now
    let report = dispatcher.run_cycle(TaskKind::Parent).await.unwrap();
    assert_eq!(report.assigned, 0);
}

#[tokio::test]
async fn test_concurrent_assignment_is_exclusive() {
    let store = Arc::new(InMemoryTaskStore::new());
    let top = accept(&store, "tenant-a", 1).await;
    let parent_id = top.parent_ids[0];
    let mut workers = Vec::new();
    for _ in 0..16 {
        workers.push(register_worker(&store).await);
    }

    let attempts = workers.iter().map(|worker| {
        let store = Arc::clone(&store);
        let worker = *worker;
        tokio::spawn(async move { store.assign(TaskKind::Parent, parent_id, worker).await })
    });
    let won = join_all(attempts)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Ok(true))))
        .count();

    assert_eq!(won, 1);
    let owner = store.get_parent(parent_id).await.unwrap().assigned_worker;
    assert!(owner.is_some_and(|w| workers.contains(&w)));
}

#[tokio::test]
async fn test_invalid_transition_leaves_record_unchanged() {
    let store = InMemoryTaskStore::new();
    let top = accept(&store, "tenant-a", 1).await;
    let parent_id = top.parent_ids[0];
    let worker = register_worker(&store).await;
    assert!(store.assign(TaskKind::Parent, parent_id, worker).await.unwrap());

    let before = store.get_parent(parent_id).await.unwrap();
    let err = store.start_parent(parent_id, worker).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    let after = store.get_parent(parent_id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Accepted);
    assert_eq!(after.started_at, before.started_at);
    assert_eq!(after.assigned_worker, Some(worker));
}

#[tokio::test]
async fn test_snapshot_preserves_finished_transfers() {
    let temp_dir = TempDir::new().unwrap();
    let snapshot_path = temp_dir.path().join("state/tasks.json");
    let store = Arc::new(InMemoryTaskStore::new());
    let memory = MemoryAdapter::new();
    memory.insert("/in/a.bin", vec![7u8; 2048]).unwrap();

    let engine = TransferEngine::builder()
        .with_config(fast_config())
        .with_store(store.clone())
        .build()
        .await
        .unwrap();
    engine.registry().register(MEM_SYSTEM, Arc::new(memory)).await;
    engine.start().await.unwrap();
    let request = TransferRequest::new("tenant-a", "alice")
        .with_element(mem_uri("/in/a.bin"), mem_uri("/out/a.bin"));
    let top = engine.submit(request).await.unwrap();
    let top = engine.wait_for_top(top.id, SETTLE_TIMEOUT).await.unwrap();
    engine.shutdown().await.unwrap();

    store.save_snapshot(&snapshot_path).await.unwrap();
    let restored = InMemoryTaskStore::load_snapshot(&snapshot_path).await.unwrap();

    assert_eq!(restored.get_top(top.id).await.unwrap(), top);
    let parents = restored.parents_of(top.id).await.unwrap();
    let children = restored.children_of(parents[0].id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, TaskStatus::Completed);
    assert!(restored.workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_tenants_all_complete() {
    let fixture = EngineFixture::new(3).await;
    let mut tops: Vec<TaskId> = Vec::new();
    for tenant in ["tenant-a", "tenant-b", "tenant-c"] {
        for i in 0..4 {
            let source = format!("/{tenant}/{i}.bin");
            fixture.put(&source, 4096 + i * 512);
            let request = TransferRequest::new(tenant, "alice")
                .with_element(mem_uri(&source), mem_uri(&format!("/out/{tenant}/{i}.bin")));
            tops.push(fixture.engine.submit(request).await.unwrap().id);
        }
    }

    let (engine, ids) = (&fixture.engine, &tops);
    wait_until(SETTLE_TIMEOUT, move || async move {
        let mut done = 0;
        for id in ids {
            if engine.get_top(*id).await.is_ok_and(|t| t.status.is_terminal()) {
                done += 1;
            }
        }
        done == ids.len()
    })
    .await;

    for id in &tops {
        assert_eq!(fixture.engine.get_top(*id).await.unwrap().status, TaskStatus::Completed);
    }
    assert_eq!(fixture.engine.list_tops("tenant-b", None, 10).await.unwrap().len(), 4);

    fixture.shutdown().await;
}

proptest! {
    #[test]
    fn test_fair_interleave_takes_each_tenant_before_repeating(
        counts in prop::collection::vec(1usize..6, 1..5),
        limit in 0usize..30,
    ) {
        let mut ready = Vec::new();
        for (tenant, count) in counts.iter().enumerate() {
            for _ in 0..*count {
                ready.push((format!("tenant-{tenant}"), TaskId::new()));
            }
        }
        let owner: std::collections::HashMap<TaskId, String> =
            ready.iter().map(|(tenant, id)| (*id, tenant.clone())).collect();

        let batch = fair_interleave(ready.clone(), limit);
        prop_assert_eq!(batch.len(), limit.min(ready.len()));
        prop_assert_eq!(batch.iter().collect::<HashSet<_>>().len(), batch.len());

        let first_round: HashSet<&String> =
            batch.iter().take(counts.len()).map(|id| &owner[id]).collect();
        prop_assert_eq!(first_round.len(), batch.len().min(counts.len()));
    }
}

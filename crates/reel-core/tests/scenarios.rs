//! End-to-end scheduling scenarios against the in-memory adapters.
//!
//! Loops are ticked by hand and time only moves through `FixedClock`.

use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reel_core::app::{App, SchedulerBuilder, SchedulerConfig};
use reel_core::domain::{
    EncodeConfig, HlsConfig, LoadSnapshot, NewTask, RenditionSpec, TaskId, TaskRecord, TaskStatus,
    WorkerId,
};
use reel_core::impls::{ChannelNotifier, InMemoryTaskStore, InMemoryWorkerStore};
use reel_core::ports::{FixedClock, TaskQuery, TaskRepository, WorkerRepository};

struct Harness {
    app: App,
    store: Arc<InMemoryTaskStore>,
    clock: Arc<FixedClock>,
    notifier: Arc<ChannelNotifier>,
}

fn harness() -> Harness {
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    ));
    let store = Arc::new(InMemoryTaskStore::new());
    let notifier = Arc::new(ChannelNotifier::new());
    let app = SchedulerBuilder::new()
        .config(SchedulerConfig::default())
        .task_store(store.clone())
        .worker_store(Arc::new(InMemoryWorkerStore::new()))
        .notifier(notifier.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
    Harness {
        app,
        store,
        clock,
        notifier,
    }
}

fn input(priority: u8) -> NewTask {
    NewTask {
        user_id: "user-42".into(),
        source: "s3://ingest/trailer.mov".into(),
        output: "s3://vod/trailer/".into(),
        encode: EncodeConfig {
            resolution: "1080p".into(),
            bitrate: "6000k".into(),
            codec: "h264".into(),
            preset: Some("fast".into()),
            container: "mp4".into(),
        },
        priority,
        max_retries: None,
        hls: None,
        estimated_duration_secs: None,
    }
}

fn hls_input() -> NewTask {
    let mut input = input(5);
    input.hls = Some(HlsConfig::new(vec![
        RenditionSpec::new("1080p", "5000k"),
        RenditionSpec::new("720p", "2800k"),
        RenditionSpec::new("480p", "1400k"),
    ]));
    input
}

async fn status_of(h: &Harness, id: TaskId) -> TaskRecord {
    h.app.scheduler.get_task(id).await.unwrap().task
}

/// Holds for every task, at every step.
async fn assert_invariants(h: &Harness) {
    let all = h.store.list_tasks(&TaskQuery::default()).await.unwrap();
    for task in all {
        assert!(
            task.retry_count <= task.max_retries,
            "{}: retry_count {} > max {}",
            task.id,
            task.retry_count,
            task.max_retries
        );
        assert_eq!(
            task.assigned_worker.is_some(),
            task.status.is_in_flight(),
            "{} is {} with worker {:?}",
            task.id,
            task.status,
            task.assigned_worker
        );
        assert_eq!(
            task.completed_at.is_some(),
            task.is_terminal(),
            "{} completed_at vs terminal",
            task.id
        );
    }
}

#[tokio::test]
async fn scenario_a_pending_task_goes_to_the_only_worker() {
    let h = harness();
    let worker = WorkerId::new("enc-1");
    h.app
        .scheduler
        .register_worker(worker.clone(), "encoder", 1)
        .await
        .unwrap();
    let mut rx = h.notifier.subscribe(worker.clone());
    let task = h.app.scheduler.create_task(input(5)).await.unwrap();

    let report = h.app.assigner.tick().await.unwrap();
    assert_eq!(report.assigned, 1);

    let stored = status_of(&h, task.id).await;
    assert_eq!(stored.status, TaskStatus::Assigned);
    assert_eq!(stored.assigned_worker, Some(worker.clone()));
    assert_eq!(rx.recv().await.unwrap().task_id, task.id);
    assert_invariants(&h).await;
}

#[tokio::test]
async fn scenario_b_silent_worker_task_reverts_to_pending() {
    let h = harness();
    let worker = WorkerId::new("enc-1");
    h.app
        .scheduler
        .register_worker(worker.clone(), "encoder", 1)
        .await
        .unwrap();
    let task = h.app.scheduler.create_task(input(5)).await.unwrap();
    h.app.assigner.tick().await.unwrap();

    // one heartbeat, then silence past the 90s window
    h.clock.advance(Duration::from_secs(30));
    h.app
        .scheduler
        .heartbeat(&worker, LoadSnapshot { current_tasks: 1 })
        .await
        .unwrap();
    h.clock.advance(Duration::from_secs(91));

    let report = h.app.reaper.tick().await.unwrap();
    assert_eq!(report.reclaimed, 1);

    let stored = status_of(&h, task.id).await;
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert!(stored.assigned_worker.is_none());
    assert_invariants(&h).await;
}

#[tokio::test]
async fn scenario_c_exhausted_task_fails_terminally() {
    let h = harness();
    let worker = WorkerId::new("enc-1");
    h.app
        .scheduler
        .register_worker(worker.clone(), "encoder", 1)
        .await
        .unwrap();
    let mut spec = input(5);
    spec.max_retries = Some(1);
    let task = h.app.scheduler.create_task(spec).await.unwrap();

    // first attempt fails, is retried after the 30s backoff
    h.app.assigner.tick().await.unwrap();
    h.app.scheduler.report_started(task.id, &worker).await.unwrap();
    h.app
        .scheduler
        .report_failed(task.id, &worker, "corrupt input")
        .await
        .unwrap();
    h.app.retrier.tick().await.unwrap();
    assert_eq!(status_of(&h, task.id).await.status, TaskStatus::Retrying);
    h.clock.advance(Duration::from_secs(30));
    h.app.retrier.tick().await.unwrap();
    assert_eq!(status_of(&h, task.id).await.status, TaskStatus::Pending);

    // second attempt has retry_count == max_retries
    h.app.assigner.tick().await.unwrap();
    h.app.scheduler.report_started(task.id, &worker).await.unwrap();
    let failed = h
        .app
        .scheduler
        .report_failed(task.id, &worker, "corrupt input")
        .await
        .unwrap();
    assert_eq!(failed.retry_count, failed.max_retries);
    assert!(failed.is_terminal());

    h.clock.advance(Duration::from_secs(3600));
    h.app.retrier.tick().await.unwrap();
    h.app.reaper.tick().await.unwrap();
    let stored = status_of(&h, task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.version, failed.version);
    assert_invariants(&h).await;
}

async fn start_hls(h: &Harness) -> (TaskId, WorkerId) {
    let worker = WorkerId::new("packager");
    h.app
        .scheduler
        .register_worker(worker.clone(), "packager", 2)
        .await
        .unwrap();
    let task = h.app.scheduler.create_task(hls_input()).await.unwrap();
    h.app.assigner.tick().await.unwrap();
    h.app.scheduler.report_started(task.id, &worker).await.unwrap();
    (task.id, worker)
}

#[tokio::test]
async fn scenario_d_all_renditions_complete_the_parent() {
    let h = harness();
    let (task_id, worker) = start_hls(&h).await;
    let subs = h.app.scheduler.list_sub_tasks(task_id).await.unwrap();
    assert_eq!(subs.len(), 3);

    for sub in &subs {
        h.app
            .scheduler
            .report_subtask_started(sub.id, &worker)
            .await
            .unwrap();
        h.app
            .scheduler
            .report_subtask_progress(sub.id, 50)
            .await
            .unwrap();
    }
    assert_eq!(status_of(&h, task_id).await.progress, 50);

    for sub in &subs {
        h.app
            .scheduler
            .report_subtask_completed(sub.id, format!("{}/index.m3u8", sub.rendition.label))
            .await
            .unwrap();
    }

    let view = h.app.scheduler.get_task(task_id).await.unwrap();
    assert_eq!(view.task.status, TaskStatus::Completed);
    assert_eq!(view.task.progress, 100);
    let master = view.master_playlist.expect("master playlist");
    assert!(master.content.contains("RESOLUTION=1280x720\n720p/index.m3u8"));
    assert!(master.content.contains("BANDWIDTH=1400000"));
    assert_invariants(&h).await;
}

#[tokio::test]
async fn scenario_d_one_failed_rendition_fails_the_parent() {
    let h = harness();
    let (task_id, worker) = start_hls(&h).await;
    let subs = h.app.scheduler.list_sub_tasks(task_id).await.unwrap();

    h.app
        .scheduler
        .report_subtask_started(subs[0].id, &worker)
        .await
        .unwrap();
    h.app
        .scheduler
        .report_subtask_completed(subs[0].id, "1080p/index.m3u8")
        .await
        .unwrap();
    h.app
        .scheduler
        .report_subtask_started(subs[2].id, &worker)
        .await
        .unwrap();
    h.app
        .scheduler
        .report_subtask_failed(subs[2].id, "encoder segfault")
        .await
        .unwrap();

    let view = h.app.scheduler.get_task(task_id).await.unwrap();
    assert_eq!(view.task.status, TaskStatus::Failed);
    assert!(view.master_playlist.is_none());
    assert!(h.app.scheduler.get_master_playlist(task_id).await.is_err());
    assert_invariants(&h).await;

    // the whole task is retried and re-expanded from scratch
    h.app.retrier.tick().await.unwrap();
    h.clock.advance(Duration::from_secs(30));
    h.app.retrier.tick().await.unwrap();
    h.app.assigner.tick().await.unwrap();
    h.app.scheduler.report_started(task_id, &worker).await.unwrap();

    let fresh = h.app.scheduler.list_sub_tasks(task_id).await.unwrap();
    assert_eq!(fresh.len(), 3);
    assert!(fresh.iter().all(|s| !subs.iter().any(|old| old.id == s.id)));
    assert_eq!(status_of(&h, task_id).await.progress, 0);
}

#[tokio::test]
async fn scenario_e_least_loaded_worker_wins() {
    let h = harness();
    for (id, load) in [("light", 2), ("heavy", 8)] {
        let worker = WorkerId::new(id);
        h.app
            .scheduler
            .register_worker(worker.clone(), id, 10)
            .await
            .unwrap();
        h.app
            .scheduler
            .heartbeat(&worker, LoadSnapshot { current_tasks: load })
            .await
            .unwrap();
    }
    let task = h.app.scheduler.create_task(input(5)).await.unwrap();

    h.app.assigner.tick().await.unwrap();
    assert_eq!(
        status_of(&h, task.id).await.assigned_worker,
        Some(WorkerId::new("light"))
    );
}

#[tokio::test]
async fn assignment_tick_is_idempotent_without_capacity() {
    let h = harness();
    h.app
        .scheduler
        .register_worker("enc-1".into(), "encoder", 1)
        .await
        .unwrap();
    for _ in 0..3 {
        h.app.scheduler.create_task(input(5)).await.unwrap();
    }

    assert_eq!(h.app.assigner.tick().await.unwrap().assigned, 1);
    let before = h.store.list_tasks(&TaskQuery::default()).await.unwrap();
    let report = h.app.assigner.tick().await.unwrap();
    let after = h.store.list_tasks(&TaskQuery::default()).await.unwrap();

    assert_eq!(report.assigned, 0);
    assert_eq!(before, after);
    assert_invariants(&h).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_schedulers_never_double_assign() {
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    ));
    let store = Arc::new(InMemoryTaskStore::new());
    store.set_latency(Duration::from_millis(1));
    let workers: Arc<dyn WorkerRepository> = Arc::new(InMemoryWorkerStore::new());
    let notifier = Arc::new(ChannelNotifier::new());

    let build = || {
        SchedulerBuilder::new()
            .task_store(store.clone())
            .worker_store(workers.clone())
            .notifier(notifier.clone())
            .clock(clock.clone())
            .build()
            .unwrap()
    };
    let first = build();
    let second = build();

    let mut inboxes = Vec::new();
    for id in ["a", "b", "c", "d"] {
        first
            .scheduler
            .register_worker(id.into(), id, 8)
            .await
            .unwrap();
        inboxes.push(notifier.subscribe(id.into()));
    }
    for i in 0..20 {
        first
            .scheduler
            .create_task(input(1 + (i % 10) as u8))
            .await
            .unwrap();
    }

    let (r1, r2) = tokio::join!(first.assigner.tick(), second.assigner.tick());
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    let assigned: Vec<_> = store
        .list_tasks(&TaskQuery {
            status: Some(TaskStatus::Assigned),
            ..TaskQuery::default()
        })
        .await
        .unwrap();
    // every successful write is a distinct task
    assert_eq!(r1.assigned + r2.assigned, assigned.len());
    assert_eq!(assigned.len(), 20);

    let mut notified: HashMap<TaskId, WorkerId> = HashMap::new();
    for rx in &mut inboxes {
        while let Ok(assignment) = rx.try_recv() {
            let previous = notified.insert(assignment.task_id, assignment.worker_id.clone());
            assert!(previous.is_none(), "{} notified twice", assignment.task_id);
        }
    }
    for task in &assigned {
        assert_eq!(notified.get(&task.id), task.assigned_worker.as_ref());
    }
}

#[tokio::test]
async fn cancelled_task_is_never_reassigned() {
    let h = harness();
    let worker = WorkerId::new("enc-1");
    h.app
        .scheduler
        .register_worker(worker.clone(), "encoder", 1)
        .await
        .unwrap();
    let task = h.app.scheduler.create_task(input(5)).await.unwrap();
    h.app.assigner.tick().await.unwrap();
    h.app.scheduler.cancel_task(task.id).await.unwrap();

    // capacity is back, but nothing pending
    let report = h.app.assigner.tick().await.unwrap();
    assert_eq!(report.considered, 0);
    h.clock.advance(Duration::from_secs(4000));
    h.app.reaper.tick().await.unwrap();

    let stored = status_of(&h, task.id).await;
    assert_eq!(stored.status, TaskStatus::Cancelled);
    assert!(h.app.scheduler.report_started(task.id, &worker).await.is_err());
    assert_invariants(&h).await;
}

#[tokio::test]
async fn store_outage_is_transient_for_the_loops() {
    let h = harness();
    h.app
        .scheduler
        .register_worker("enc-1".into(), "encoder", 1)
        .await
        .unwrap();
    let task = h.app.scheduler.create_task(input(5)).await.unwrap();

    h.store.set_unavailable(true);
    assert!(h.app.assigner.tick().await.is_err());
    assert!(h.app.retrier.tick().await.is_err());

    h.store.set_unavailable(false);
    assert_eq!(h.app.assigner.tick().await.unwrap().assigned, 1);
    assert_eq!(status_of(&h, task.id).await.status, TaskStatus::Assigned);
}

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use matchfan_coordinator::{
    AggregateOutcome, DispatchOutcome, DispatchRequest, RemoteError, TaskOutcome,
};
use matchfan_status::{JobStatus, StatusSubscriber};
use matchfan_queue::TaskQueue;

async fn collect_until_terminal(sub: &impl StatusSubscriber) -> Vec<JobStatus> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("no terminal status within 5s")
            .unwrap();
        let terminal = event.status.is_terminal();
        seen.push(event.status);
        if terminal {
            return seen;
        }
    }
}

async fn no_more_events(sub: &impl StatusSubscriber) -> bool {
    tokio::time::timeout(Duration::from_millis(100), sub.recv()).await.is_err()
}

#[tokio::test]
async fn all_items_succeed_and_complete_once() {
    let h = harness(FakeRemote::with_items(5));
    let sub = h.hub.subscribe(Some(faker_subject()));

    let outcome = h
        .coordinator
        .dispatcher
        .dispatch(&DispatchRequest::new(faker()))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Started {
            subject: faker_subject(),
            total: 5
        }
    );

    let outcomes = h.drain().await;
    assert_eq!(outcomes.len(), 5);
    assert_eq!(outcomes.iter().filter(|o| **o == TaskOutcome::Finalized).count(), 1);

    let statuses = collect_until_terminal(&sub).await;
    assert_eq!(statuses.first(), Some(&JobStatus::Progress { processed: 0, total: 5 }));
    assert_eq!(statuses.last(), Some(&JobStatus::Completed));
    assert!(no_more_events(&sub).await);

    let artifact = h
        .coordinator
        .state
        .cached_artifact(&faker_subject())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.len(), 5);
    assert!(artifact.matches.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    assert_eq!(artifact.matches[0].match_id, "KR_5");

    assert!(h.coordinator.state.load_job(&faker_subject()).await.unwrap().is_none());
    assert!(!h.coordinator.state.lock_held(&faker_subject()).await.unwrap());
    assert_eq!(h.coordinator.metrics.snapshot().aggregated, 1);
}

#[tokio::test]
async fn fatal_item_is_tombstoned_and_still_counted() {
    let remote = FakeRemote::with_items(5);
    remote.script("KR_3", vec![Err(RemoteError::Fatal("participant missing".into()))]);
    let h = harness(remote);
    let sub = h.hub.subscribe(Some(faker_subject()));

    h.coordinator
        .dispatcher
        .dispatch(&DispatchRequest::new(faker()))
        .await
        .unwrap();
    h.drain().await;

    let statuses = collect_until_terminal(&sub).await;
    assert!(statuses.contains(&JobStatus::Progress { processed: 5, total: 5 }));
    assert_eq!(statuses.last(), Some(&JobStatus::Completed));

    let artifact = h
        .coordinator
        .state
        .cached_artifact(&faker_subject())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.matches.len(), 4);
    assert_eq!(artifact.tombstones.len(), 1);
    assert_eq!(artifact.tombstones[0].item_id, "KR_3");
    assert_eq!(artifact.total, 5);
    assert_eq!(h.remote.calls_for("KR_3"), 1);
}

#[tokio::test]
async fn concurrent_dispatches_have_one_winner() {
    let h = harness(FakeRemote::with_items(5));
    let request = DispatchRequest::new(faker());

    let (a, b) = tokio::join!(
        h.coordinator.dispatcher.dispatch(&request),
        h.coordinator.dispatcher.dispatch(&request)
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(
        outcomes.iter().filter(|o| matches!(o, DispatchOutcome::Started { .. })).count(),
        1
    );
    assert_eq!(
        outcomes.iter().filter(|o| matches!(o, DispatchOutcome::JobInProgress)).count(),
        1
    );
    assert_eq!(h.queue.len(), 5);
}

#[tokio::test]
async fn crashed_job_resumes_only_the_gap() {
    let h = harness(FakeRemote::with_items(5));
    let sub = h.hub.subscribe(Some(faker_subject()));
    h.coordinator
        .dispatcher
        .dispatch(&DispatchRequest::new(faker()))
        .await
        .unwrap();

    // Three items land, then the process holding the rest dies.
    h.handle(3).await;
    assert_eq!(h.discard_queue().await, 2);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = h.coordinator.reconciler.sweep_once().await.unwrap();
    assert_eq!(report.stale, 1);
    assert_eq!(report.resumed, 1);
    assert_eq!(report.requeued, 2);

    let agg = h.coordinator.state.load_job(&faker_subject()).await.unwrap().unwrap();
    assert_eq!(agg.processed, 3);
    assert_eq!(agg.resumes, 1);

    let outcomes = h.drain().await;
    assert_eq!(outcomes.len(), 2);

    let statuses = collect_until_terminal(&sub).await;
    assert_eq!(statuses.last(), Some(&JobStatus::Completed));
    assert!(no_more_events(&sub).await);

    for i in 1..=5 {
        assert_eq!(h.remote.calls_for(&format!("KR_{i}")), 1);
    }
    let artifact = h
        .coordinator
        .state
        .cached_artifact(&faker_subject())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.len(), 5);
    assert_eq!(h.coordinator.metrics.snapshot().aggregated, 1);
}

#[tokio::test]
async fn rate_limit_delays_every_later_call() {
    let remote = FakeRemote::with_items(4);
    remote.script(
        "KR_1",
        vec![Err(RemoteError::RateLimited {
            retry_after: Some(Duration::from_millis(200)),
        })],
    );
    let h = harness(remote);
    h.coordinator
        .dispatcher
        .dispatch(&DispatchRequest::new(faker()))
        .await
        .unwrap();

    let first = h.handle(1).await;
    assert_eq!(first, vec![TaskOutcome::Retried { attempt: 1 }]);
    h.drain().await;

    let calls = h.remote.calls();
    let (_, limited_at) = calls[0];
    for (item, at) in &calls[1..] {
        assert!(
            at.duration_since(limited_at) >= Duration::from_millis(190),
            "{item} called {:?} after the 429",
            at.duration_since(limited_at)
        );
    }
    assert_eq!(h.remote.calls_for("KR_1"), 2);
    assert_eq!(h.coordinator.metrics.snapshot().rate_limited, 1);
    assert!(h
        .coordinator
        .state
        .cached_artifact(&faker_subject())
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn rate_limit_on_one_job_delays_another() {
    let remote = FakeRemote::with_items(2).with_player("chovy", "kr2", "puuid-chovy", "CH", 2);
    remote.script(
        "KR_1",
        vec![Err(RemoteError::RateLimited {
            retry_after: Some(Duration::from_millis(200)),
        })],
    );
    let h = harness(remote);
    for handle in [faker(), chovy()] {
        h.coordinator
            .dispatcher
            .dispatch(&DispatchRequest::new(handle))
            .await
            .unwrap();
    }

    assert_eq!(h.handle(1).await, vec![TaskOutcome::Retried { attempt: 1 }]);
    h.drain().await;

    let calls = h.remote.calls();
    let (_, limited_at) = calls[0];
    let other_job: Vec<_> = calls.iter().filter(|(id, _)| id.starts_with("CH_")).collect();
    assert_eq!(other_job.len(), 2);
    for (item, at) in other_job {
        assert!(
            at.duration_since(limited_at) >= Duration::from_millis(190),
            "{item} called {:?} after the 429",
            at.duration_since(limited_at)
        );
    }
    for subject in [faker_subject(), chovy_subject()] {
        let artifact = h.coordinator.state.cached_artifact(&subject).await.unwrap();
        assert_eq!(artifact.map(|a| a.len()), Some(2));
    }
}

#[tokio::test]
async fn job_queued_behind_another_is_not_resumed_or_failed() {
    let mut config = test_config();
    config.workers.count = 1;
    config.rate.min_interval_ms = 20;
    let remote = FakeRemote::with_items(30).with_player("chovy", "kr2", "puuid-chovy", "CH", 2);
    let h = harness_with(remote, config);
    let sub = h.hub.subscribe(Some(chovy_subject()));
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let pool = h.coordinator.worker_pool();
    let pool_shutdown = shutdown.clone();
    let running = tokio::spawn(async move { pool.run(pool_shutdown).await });

    for handle in [faker(), chovy()] {
        h.coordinator
            .dispatcher
            .dispatch(&DispatchRequest::new(handle))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The second job's tasks are still behind the first job's backlog.
    assert_eq!(h.remote.calls().iter().filter(|(id, _)| id.starts_with("CH_")).count(), 0);
    let report = h.coordinator.reconciler.sweep_once().await.unwrap();
    assert_eq!(report.resumed, 0);
    assert_eq!(report.failed, 0);
    assert!(report.deferred >= 1);
    assert!(h.coordinator.state.lock_held(&chovy_subject()).await.unwrap());

    let statuses = collect_until_terminal(&sub).await;
    assert_eq!(statuses.last(), Some(&JobStatus::Completed));
    assert_eq!(h.remote.calls_for("CH_1"), 1);
    assert_eq!(h.remote.calls_for("CH_2"), 1);

    shutdown.notify_waiters();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn concurrent_workers_aggregate_exactly_once() {
    let h = harness(FakeRemote::with_items(12));
    h.coordinator
        .dispatcher
        .dispatch(&DispatchRequest::new(faker()))
        .await
        .unwrap();

    let mut handles = Vec::new();
    while let Some(task) = h.queue.poll(Duration::from_millis(10)).await.unwrap() {
        let worker = h.coordinator.worker.clone();
        handles.push(tokio::spawn(async move { worker.handle(task).await.unwrap() }));
    }
    let mut finalized = 0;
    for handle in handles {
        if handle.await.unwrap() == TaskOutcome::Finalized {
            finalized += 1;
        }
    }
    assert_eq!(finalized, 1);
    assert_eq!(h.coordinator.metrics.snapshot().aggregated, 1);
    let artifact = h
        .coordinator
        .state
        .cached_artifact(&faker_subject())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.len(), 12);
}

#[tokio::test]
async fn worker_pool_runs_a_job_to_completion() {
    let h = harness(FakeRemote::with_items(6));
    let sub = h.hub.subscribe(Some(faker_subject()));
    let shutdown = Arc::new(tokio::sync::Notify::new());

    let pool = h.coordinator.worker_pool();
    let pool_shutdown = shutdown.clone();
    let running = tokio::spawn(async move { pool.run(pool_shutdown).await });

    h.coordinator
        .dispatcher
        .dispatch(&DispatchRequest::new(faker()))
        .await
        .unwrap();
    let statuses = collect_until_terminal(&sub).await;
    assert_eq!(statuses.last(), Some(&JobStatus::Completed));

    let heartbeat = h
        .coordinator
        .state
        .last_heartbeat(&h.coordinator.config.workers.pool_name)
        .await
        .unwrap();
    assert!(heartbeat.is_some());

    let started = Instant::now();
    shutdown.notify_waiters();
    running.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn finalize_is_guarded_against_a_second_trigger() {
    let h = harness(FakeRemote::with_items(2));
    h.coordinator
        .dispatcher
        .dispatch(&DispatchRequest::new(faker()))
        .await
        .unwrap();
    h.handle(2).await;

    // The job is gone; a reconciliation-path trigger finds nothing.
    assert_eq!(
        h.coordinator.aggregator.finalize(&faker_subject()).await.unwrap(),
        AggregateOutcome::Missing
    );
    assert_eq!(h.coordinator.metrics.snapshot().aggregated, 1);
}

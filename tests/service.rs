//! Service lifecycle: the supervisor owning the job -> checkers map.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;

use common::*;
use fluxmon::models::{FluxMonitorParams, Initiator, InitiatorType, JobId, JobSpec, Millis};
use fluxmon::monitor::ServiceError;
use fluxmon::store::{LocalKeyStore, SqliteStore};
use fluxmon::{CheckerFactory, FluxMonitorService, MonitorConfig};

fn flux_job(id: &str, polling_interval: Millis) -> JobSpec {
    JobSpec {
        id: Some(JobId::from(id)),
        name: format!("flux job {}", id),
        initiators: vec![Initiator {
            id: 1,
            job_spec_id: JobId::from(id),
            kind: InitiatorType::FluxMonitor,
            params: FluxMonitorParams {
                address: contract_address(),
                feeds: json!(["https://feed.example/price"]),
                threshold: 0.5,
                precision: 2,
                polling_interval,
                idle_threshold: Millis(0),
                ..Default::default()
            },
        }],
    }
}

fn web_job(id: &str) -> JobSpec {
    JobSpec {
        id: Some(JobId::from(id)),
        name: format!("web job {}", id),
        initiators: vec![Initiator {
            id: 1,
            job_spec_id: JobId::from(id),
            kind: InitiatorType::Web,
            params: FluxMonitorParams::default(),
        }],
    }
}

struct Harness {
    aggregator: Arc<MockAggregator>,
    broadcaster: Arc<NoopBroadcaster>,
    service: FluxMonitorService,
}

fn harness(persisted: Vec<JobSpec>) -> Harness {
    let aggregator = MockAggregator::new(eligible_state(1, 10000));
    // Keep checkers quiescent: a disconnected checker polls nothing
    aggregator.connected.store(false, Ordering::SeqCst);

    let factory = CheckerFactory::new(
        RecordingRunManager::new(),
        Arc::new(LocalKeyStore::new(oracle_address())),
        Arc::new(SqliteStore::in_memory().unwrap()),
        Arc::new(SingleAggregatorFactory(aggregator.clone())),
        MonitorConfig::default(),
    );

    let broadcaster = NoopBroadcaster::new();
    let service = FluxMonitorService::new(
        factory,
        StaticJobStore::new(persisted),
        broadcaster.clone(),
    );

    Harness {
        aggregator,
        broadcaster,
        service,
    }
}

#[tokio::test]
async fn start_adds_persisted_flux_jobs_only() {
    init_logging();
    let mut h = harness(vec![
        flux_job("job-1", Millis::from_secs(5)),
        web_job("job-2"),
    ]);

    h.service.start().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(h.broadcaster.started.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.aggregator.listener_count(),
        1,
        "only the flux-monitor job gets a checker"
    );

    h.service.stop().await;
    assert_eq!(h.broadcaster.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.aggregator.unsubscribes.load(Ordering::SeqCst),
        1,
        "stop returns only after every checker released its subscription"
    );
}

#[tokio::test]
async fn duplicate_add_is_rejected_and_supervisor_survives() {
    init_logging();
    let mut h = harness(Vec::new());
    h.service.start().await.unwrap();

    h.service
        .add_job(flux_job("job-1", Millis::from_secs(5)))
        .await
        .unwrap();
    sleep(Duration::from_millis(80)).await;
    assert_eq!(h.aggregator.listener_count(), 1);

    // Same job id again: rejected without double-starting checkers
    h.service
        .add_job(flux_job("job-1", Millis::from_secs(5)))
        .await
        .unwrap();
    sleep(Duration::from_millis(80)).await;
    assert_eq!(h.aggregator.listener_count(), 1, "no double start");

    // The supervisor is still alive and accepts new jobs
    h.service
        .add_job(flux_job("job-2", Millis::from_secs(5)))
        .await
        .unwrap();
    sleep(Duration::from_millis(80)).await;
    assert_eq!(h.aggregator.listener_count(), 2);

    h.service.stop().await;
    assert_eq!(h.aggregator.unsubscribes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn remove_job_stops_its_checkers() {
    init_logging();
    let mut h = harness(Vec::new());
    h.service.start().await.unwrap();

    h.service
        .add_job(flux_job("job-1", Millis::from_secs(5)))
        .await
        .unwrap();
    sleep(Duration::from_millis(80)).await;
    assert_eq!(h.aggregator.listener_count(), 1);

    h.service.remove_job(Some(JobId::from("job-1"))).await;
    sleep(Duration::from_millis(80)).await;
    assert_eq!(h.aggregator.unsubscribes.load(Ordering::SeqCst), 1);

    // Unknown ids and nil ids are ignored with a warning
    h.service.remove_job(Some(JobId::from("ghost"))).await;
    h.service.remove_job(None).await;

    h.service.stop().await;
}

#[tokio::test]
async fn add_job_with_nil_id_fails() {
    init_logging();
    let mut h = harness(Vec::new());
    h.service.start().await.unwrap();

    let mut job = flux_job("job-1", Millis::from_secs(5));
    job.id = None;
    let err = h.service.add_job(job).await.unwrap_err();
    assert!(matches!(err, ServiceError::NilJobId));

    h.service.stop().await;
}

#[tokio::test]
async fn add_job_with_invalid_interval_fails_whole_add() {
    init_logging();
    let mut h = harness(Vec::new());
    h.service.start().await.unwrap();

    // Below the 5-second minimum polling interval
    let err = h
        .service
        .add_job(flux_job("job-1", Millis::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Checker(_)));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(h.aggregator.listener_count(), 0, "nothing was started");

    h.service.stop().await;
}

#[tokio::test]
async fn start_aggregates_add_errors_but_keeps_valid_jobs() {
    init_logging();
    let mut h = harness(vec![
        flux_job("bad-job", Millis::from_secs(1)), // invalid interval
        flux_job("good-job", Millis::from_secs(5)),
    ]);

    let result = h.service.start().await;
    assert!(matches!(result, Err(ServiceError::Checker(_))));
    sleep(Duration::from_millis(80)).await;
    assert_eq!(h.aggregator.listener_count(), 1, "the valid job still runs");

    h.service.stop().await;
}

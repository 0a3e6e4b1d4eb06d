//! Flux monitor service
//!
//! Owns the dynamic set of per-job checkers. Exactly one supervisor task
//! holds the `JobId -> checkers` map and performs every checker start/stop;
//! add, remove, and stop arrive as messages, so mutations of the set can
//! never race a checker's shutdown. The map is never shared with another
//! task.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::contracts::LogBroadcaster;
use crate::models::{InitiatorType, JobId, JobSpec};
use crate::monitor::checker::{CheckerError, CheckerFactory, DeviationChecker};
use crate::store::{JobStore, StoreError};

#[derive(Debug)]
pub enum ServiceError {
    /// A job arrived without an id
    NilJobId,
    /// Checker construction failed; the whole add is rejected
    Checker(CheckerError),
    /// The supervisor is not running
    NotRunning,
    Store(StoreError),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::NilJobId => write!(f, "received job with nil ID"),
            ServiceError::Checker(err) => write!(f, "factory unable to create checker: {}", err),
            ServiceError::NotRunning => write!(f, "flux monitor service is not running"),
            ServiceError::Store(err) => write!(f, "job store error: {}", err),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<CheckerError> for ServiceError {
    fn from(err: CheckerError) -> Self {
        ServiceError::Checker(err)
    }
}

struct AddEntry {
    job_id: JobId,
    checkers: Vec<DeviationChecker>,
}

type Channels = (
    mpsc::Receiver<AddEntry>,
    mpsc::Receiver<JobId>,
    watch::Receiver<bool>,
);

/// Manages a collection of deviation checkers, one per flux-monitor
/// initiator of every added job.
pub struct FluxMonitorService {
    factory: CheckerFactory,
    jobs: Arc<dyn JobStore>,
    broadcaster: Arc<dyn LogBroadcaster>,
    add_tx: mpsc::Sender<AddEntry>,
    remove_tx: mpsc::Sender<JobId>,
    stop_tx: watch::Sender<bool>,
    channels: Option<Channels>,
    supervisor: Option<JoinHandle<()>>,
}

impl FluxMonitorService {
    pub fn new(
        factory: CheckerFactory,
        jobs: Arc<dyn JobStore>,
        broadcaster: Arc<dyn LogBroadcaster>,
    ) -> Self {
        let (add_tx, add_rx) = mpsc::channel(16);
        let (remove_tx, remove_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        Self {
            factory,
            jobs,
            broadcaster,
            add_tx,
            remove_tx,
            stop_tx,
            channels: Some((add_rx, remove_rx, stop_rx)),
            supervisor: None,
        }
    }

    /// Start the log-broadcast transport and the supervisor, then add every
    /// persisted flux-monitor job. All adds run concurrently and are joined
    /// before returning; the first failure becomes the aggregate error.
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        self.broadcaster.start();

        if let Some((add_rx, remove_rx, stop_rx)) = self.channels.take() {
            self.supervisor = Some(tokio::spawn(supervise(add_rx, remove_rx, stop_rx)));
        }

        let jobs = self.jobs.flux_monitor_jobs().map_err(ServiceError::Store)?;
        let results = join_all(jobs.into_iter().map(|job| self.add_job(job))).await;

        let mut first_err = None;
        for result in results {
            if let Err(err) = result {
                log::error!("error adding flux monitor job: {}", err);
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop the transport, then the supervisor. Blocks until every running
    /// checker has been stopped.
    pub async fn stop(&mut self) {
        self.broadcaster.stop();
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.supervisor.take() {
            if let Err(err) = handle.await {
                log::error!("flux monitor supervisor ended abnormally: {}", err);
            }
        }
    }

    /// Build checkers for every flux-monitor initiator on the job and hand
    /// them to the supervisor as one unit. Any construction failure fails
    /// the whole add; jobs without flux-monitor initiators are a no-op.
    pub async fn add_job(&self, job: JobSpec) -> Result<(), ServiceError> {
        let job_id = match job.id.clone() {
            Some(id) => id,
            None => {
                log::error!("received job with nil ID");
                return Err(ServiceError::NilJobId);
            }
        };

        let mut checkers = Vec::new();
        for initiator in job.initiators_for(InitiatorType::FluxMonitor) {
            log::debug!(
                "adding job {} initiator {} to flux monitor",
                job_id,
                initiator.id
            );
            checkers.push(self.factory.new_checker(&initiator)?);
        }
        if checkers.is_empty() {
            return Ok(());
        }

        self.add_tx
            .send(AddEntry { job_id, checkers })
            .await
            .map_err(|_| ServiceError::NotRunning)
    }

    /// Stop and remove all checkers belonging to the job. A `None` id is
    /// ignored with a warning.
    pub async fn remove_job(&self, id: Option<JobId>) {
        let id = match id {
            Some(id) => id,
            None => {
                log::warn!("nil job ID passed to flux monitor remove_job");
                return;
            }
        };
        if self.remove_tx.send(id).await.is_err() {
            log::warn!("flux monitor supervisor is not running, remove ignored");
        }
    }
}

/// The supervisor loop. Sole owner of the job map; all checker lifecycle
/// calls happen here.
async fn supervise(
    mut add_rx: mpsc::Receiver<AddEntry>,
    mut remove_rx: mpsc::Receiver<JobId>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut jobs: HashMap<JobId, Vec<DeviationChecker>> = HashMap::new();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,

            Some(mut entry) = add_rx.recv() => {
                if jobs.contains_key(&entry.job_id) {
                    // Reject the duplicate but keep supervising; one bad add
                    // must not take down every other job's checkers.
                    log::error!(
                        "job {} has already been added to the flux monitor",
                        entry.job_id
                    );
                    continue;
                }
                for checker in entry.checkers.iter_mut() {
                    checker.start();
                }
                jobs.insert(entry.job_id, entry.checkers);
            }

            Some(job_id) = remove_rx.recv() => {
                match jobs.remove(&job_id) {
                    Some(mut checkers) => {
                        for checker in checkers.iter_mut() {
                            checker.stop().await;
                        }
                    }
                    None => log::warn!("remove requested for unknown job {}", job_id),
                }
            }
        }
    }

    // Every checker is fully stopped before shutdown is confirmed
    for (_, mut checkers) in jobs.drain() {
        for checker in checkers.iter_mut() {
            checker.stop().await;
        }
    }
    log::debug!("flux monitor supervisor stopped");
}

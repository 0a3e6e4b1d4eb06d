//! Per-job deviation checker
//!
//! One checker per flux-monitor initiator. Each checker is a single tokio
//! task fusing four event sources into one decision loop: the aggregator log
//! stream, the pauseable poll ticker, the one-shot idle deadline, and the
//! one-shot round-timeout deadline. All observable state is mutated only by
//! that task; external inputs arrive as messages.
//!
//! Failure policy: every fetch, RPC, and store error on the hot path is
//! logged and swallowed. Only a stop signal terminates the loop.

use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ethers_core::types::{Address, U256};
use ethers_core::utils::to_checksum;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{MonitorConfig, MINIMUM_POLLING_INTERVAL};
use crate::contracts::{
    AggregatorError, AggregatorFactory, AggregatorLog, FluxAggregator, LogAnswerUpdated,
    LogListener, LogNewRound, RoundState, UPDATE_ANSWER_FUNCTION,
};
use crate::fetch::{FetchError, Fetcher, MedianFetcher};
use crate::models::{Initiator, JobId, RunRequest};
use crate::monitor::deviation::outside_deviation;
use crate::monitor::feeds::{resolve_feed_urls, FeedError};
use crate::monitor::ticker::PollTicker;
use crate::runs::{JobRunRequest, RunManager, RunManagerError};
use crate::store::{BridgeStore, KeyStore, StoreError};

/// Capacity of the per-checker log queue. Enqueues beyond this are dropped;
/// the next tick re-queries round state anyway.
const LOG_QUEUE_CAPACITY: usize = 100;

/// Construction-time errors. These surface synchronously from the factory
/// and fail the whole job add.
#[derive(Debug)]
pub enum CheckerError {
    Config(String),
    Feed(FeedError),
    Fetch(FetchError),
    Aggregator(AggregatorError),
}

impl std::fmt::Display for CheckerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckerError::Config(msg) => write!(f, "invalid initiator: {}", msg),
            CheckerError::Feed(err) => write!(f, "feed resolution failed: {}", err),
            CheckerError::Fetch(err) => write!(f, "fetcher construction failed: {}", err),
            CheckerError::Aggregator(err) => write!(f, "aggregator binding failed: {}", err),
        }
    }
}

impl std::error::Error for CheckerError {}

impl From<FeedError> for CheckerError {
    fn from(err: FeedError) -> Self {
        CheckerError::Feed(err)
    }
}

impl From<FetchError> for CheckerError {
    fn from(err: FetchError) -> Self {
        CheckerError::Fetch(err)
    }
}

impl From<AggregatorError> for CheckerError {
    fn from(err: AggregatorError) -> Self {
        CheckerError::Aggregator(err)
    }
}

/// Hot-path errors inside the loop. Logged and swallowed, never escalated.
#[derive(Debug)]
enum PollError {
    Store(StoreError),
    Aggregator(AggregatorError),
    Fetch(FetchError),
    Run(RunManagerError),
    Encode(serde_json::Error),
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Store(e) => write!(f, "{}", e),
            PollError::Aggregator(e) => write!(f, "{}", e),
            PollError::Fetch(e) => write!(f, "{}", e),
            PollError::Run(e) => write!(f, "{}", e),
            PollError::Encode(e) => write!(f, "unable to encode run request: {}", e),
        }
    }
}

impl From<StoreError> for PollError {
    fn from(e: StoreError) -> Self {
        PollError::Store(e)
    }
}

impl From<AggregatorError> for PollError {
    fn from(e: AggregatorError) -> Self {
        PollError::Aggregator(e)
    }
}

impl From<FetchError> for PollError {
    fn from(e: FetchError) -> Self {
        PollError::Fetch(e)
    }
}

impl From<RunManagerError> for PollError {
    fn from(e: RunManagerError) -> Self {
        PollError::Run(e)
    }
}

impl From<serde_json::Error> for PollError {
    fn from(e: serde_json::Error) -> Self {
        PollError::Encode(e)
    }
}

/// State shared between the checker task and the log-subscription side.
/// `handle_log` may be called from any thread.
struct CheckerShared {
    job_spec_id: JobId,
    connected: AtomicBool,
    stopping: AtomicBool,
    log_tx: mpsc::Sender<Result<AggregatorLog, AggregatorError>>,
}

impl LogListener for CheckerShared {
    fn on_connect(&self) {
        log::debug!("checker connected to chain node (job {})", self.job_spec_id);
        self.connected.store(true, Ordering::SeqCst);
    }

    fn on_disconnect(&self) {
        log::debug!(
            "checker disconnected from chain node (job {})",
            self.job_spec_id
        );
        self.connected.store(false, Ordering::SeqCst);
    }

    fn handle_log(&self, log: Result<AggregatorLog, AggregatorError>) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        match self.log_tx.try_send(log) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The next tick re-queries round state; never stall the
                // broadcaster on a slow checker.
                log::debug!("log queue full, dropping log (job {})", self.job_spec_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Handle to one running (or startable) checker. Start spawns the event
/// loop; stop signals it and waits for it to fully wind down, releasing the
/// log subscription.
pub struct DeviationChecker {
    shared: Arc<CheckerShared>,
    stop_tx: watch::Sender<bool>,
    task: Option<CheckerTask>,
    handle: Option<JoinHandle<()>>,
}

impl DeviationChecker {
    pub fn new(
        initiator: Initiator,
        aggregator: Arc<dyn FluxAggregator>,
        run_manager: Arc<dyn RunManager>,
        key_store: Arc<dyn KeyStore>,
        fetcher: Box<dyn Fetcher>,
        minimum_contract_payment: U256,
    ) -> Result<Self, CheckerError> {
        let params = &initiator.params;

        if !params.threshold.is_finite() || params.threshold < 0.0 {
            return Err(CheckerError::Config(format!(
                "threshold must be a nonnegative number, got {}",
                params.threshold
            )));
        }
        let threshold = Decimal::from_f64_retain(params.threshold).ok_or_else(|| {
            CheckerError::Config(format!("threshold {} is out of range", params.threshold))
        })?;

        if params.precision > 28 {
            return Err(CheckerError::Config(format!(
                "precision must be at most 28, got {}",
                params.precision
            )));
        }

        let (log_tx, log_rx) = mpsc::channel(LOG_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        let shared = Arc::new(CheckerShared {
            job_spec_id: initiator.job_spec_id.clone(),
            connected: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            log_tx,
        });

        let task = CheckerTask {
            job_spec_id: initiator.job_spec_id.clone(),
            address: params.address,
            threshold,
            precision: params.precision,
            idle_threshold: params.idle_threshold.to_duration(),
            poll_ticker: PollTicker::new(params.polling_interval.to_duration()),
            minimum_contract_payment,
            initiator,
            aggregator,
            run_manager,
            key_store,
            fetcher,
            shared: shared.clone(),
            stop_rx,
            log_rx,
            reportable_round_id: None,
            idle_deadline: None,
            round_timeout: None,
        };

        Ok(Self {
            shared,
            stop_tx,
            task: Some(task),
            handle: None,
        })
    }

    pub fn job_spec_id(&self) -> &JobId {
        &self.shared.job_spec_id
    }

    /// Spawn the event loop. Idempotent within one instance; a second call
    /// is a no-op.
    pub fn start(&mut self) {
        if let Some(task) = self.task.take() {
            log::debug!("starting checker for job {}", task.job_spec_id);
            self.handle = Some(tokio::spawn(task.run()));
        }
    }

    /// Signal shutdown and wait until the loop has fully exited.
    pub async fn stop(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
        self.task = None;
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                log::error!(
                    "checker task for job {} ended abnormally: {}",
                    self.shared.job_spec_id,
                    err
                );
            }
        }
    }

    /// The listener side handed to the aggregator's log subscription.
    pub fn listener(&self) -> Arc<dyn LogListener> {
        self.shared.clone()
    }

    pub fn on_connect(&self) {
        self.shared.on_connect();
    }

    pub fn on_disconnect(&self) {
        self.shared.on_disconnect();
    }

    pub fn handle_log(&self, log: Result<AggregatorLog, AggregatorError>) {
        self.shared.handle_log(log);
    }
}

/// Sleep until the deadline, or forever when there is none.
async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => future::pending().await,
    }
}

/// The loop half of a checker. Owned by exactly one tokio task; nothing in
/// here is shared.
struct CheckerTask {
    initiator: Initiator,
    job_spec_id: JobId,
    address: Address,
    threshold: Decimal,
    precision: u32,
    idle_threshold: Duration,
    minimum_contract_payment: U256,

    aggregator: Arc<dyn FluxAggregator>,
    run_manager: Arc<dyn RunManager>,
    key_store: Arc<dyn KeyStore>,
    fetcher: Box<dyn Fetcher>,

    shared: Arc<CheckerShared>,
    stop_rx: watch::Receiver<bool>,
    log_rx: mpsc::Receiver<Result<AggregatorLog, AggregatorError>>,

    poll_ticker: PollTicker,
    reportable_round_id: Option<u64>,
    idle_deadline: Option<Instant>,
    round_timeout: Option<Instant>,
}

impl CheckerTask {
    async fn run(mut self) {
        let (connected, unsubscribe) = self.aggregator.subscribe_logs(self.shared.clone()).await;
        self.shared.connected.store(connected, Ordering::SeqCst);

        // Opportunistic first poll. If it submitted, polling stays paused
        // until the round closes; otherwise start the tick train.
        let threshold = self.threshold;
        if !self.poll_if_eligible(threshold).await {
            self.poll_ticker.resume();
        }

        if !self.idle_threshold.is_zero() {
            self.idle_deadline = Some(Instant::now() + self.idle_threshold);
        }

        loop {
            tokio::select! {
                _ = self.stop_rx.changed() => break,

                maybe_log = self.log_rx.recv() => match maybe_log {
                    Some(Ok(log)) => self.respond_to_log(log).await,
                    Some(Err(err)) => {
                        log::error!(
                            "error received from log broadcaster: {} (job {})",
                            err,
                            self.job_spec_id
                        );
                    }
                    None => break,
                },

                _ = self.poll_ticker.tick() => {
                    let threshold = self.threshold;
                    self.poll_if_eligible(threshold).await;
                }

                _ = deadline(self.idle_deadline) => {
                    // Forced refresh: any movement counts as deviation
                    self.idle_deadline = None;
                    self.poll_if_eligible(Decimal::ZERO).await;
                }

                _ = deadline(self.round_timeout) => {
                    self.round_timeout = None;
                    let threshold = self.threshold;
                    self.poll_if_eligible(threshold).await;
                }
            }
        }

        unsubscribe();
        log::debug!("checker for job {} stopped", self.job_spec_id);
    }

    async fn respond_to_log(&mut self, log: AggregatorLog) {
        match log {
            AggregatorLog::NewRound(log) => {
                log::debug!(
                    "NewRound log: round {} started by {:?} on {:?} (job {})",
                    log.round_id,
                    log.started_by,
                    log.address,
                    self.job_spec_id
                );
                self.respond_to_new_round(log).await;
            }
            AggregatorLog::AnswerUpdated(log) => {
                log::debug!(
                    "AnswerUpdated log: round {} answer {} (job {})",
                    log.round_id,
                    log.current,
                    self.job_spec_id
                );
                self.respond_to_answer_updated(log);
            }
            AggregatorLog::Unknown => {}
        }
    }

    /// Another oracle opened a round: poll and submit regardless of
    /// deviation, if the contract says we are eligible.
    async fn respond_to_new_round(&mut self, log: LogNewRound) {
        if let Some(current) = self.reportable_round_id {
            if log.round_id < current {
                log::info!(
                    "ignoring stale NewRound log: round {} < current {} (job {})",
                    log.round_id,
                    current,
                    self.job_spec_id
                );
                return;
            }
        }

        // The idle clock restarts whenever a new round opens
        if !self.idle_threshold.is_zero() {
            self.idle_deadline = Some(Instant::now() + self.idle_threshold);
        }

        let own_address = match self.key_store.oracle_address() {
            Ok(address) => address,
            Err(err) => {
                log::error!(
                    "error fetching oracle address from keystore: {} (job {})",
                    err,
                    self.job_spec_id
                );
                return;
            }
        };
        if log.started_by == own_address {
            log::debug!(
                "ignoring NewRound log for round {} we started ourselves (job {})",
                log.round_id,
                self.job_spec_id
            );
            return;
        }

        // A burst of delayed logs can arrive out of order. The contract is
        // authoritative about which round we should answer, so trust
        // round state over the log.
        let state = match self.round_state().await {
            Ok(state) => state,
            Err(err) => {
                log::error!(
                    "ignoring new round request: error fetching round state: {} (job {})",
                    err,
                    self.job_spec_id
                );
                return;
            }
        };
        self.apply_round_state(&state);

        if !state.eligible_to_submit {
            log::info!(
                "ignoring new round request: not eligible to submit (job {})",
                self.job_spec_id
            );
            return;
        }

        log::info!(
            "responding to new round request for round {} (job {})",
            state.reportable_round_id,
            self.job_spec_id
        );

        let polled_answer = match self.fetcher.fetch().await {
            Ok(answer) => answer,
            Err(err) => {
                log::error!(
                    "unable to fetch median price: {} (job {})",
                    err,
                    self.job_spec_id
                );
                return;
            }
        };

        if let Err(err) = self
            .create_job_run(polled_answer, state.reportable_round_id)
            .await
        {
            log::error!("can't create job run: {} (job {})", err, self.job_spec_id);
        }
    }

    /// The round closed with a new answer: polling may resume.
    fn respond_to_answer_updated(&mut self, log: LogAnswerUpdated) {
        if let Some(current) = self.reportable_round_id {
            if log.round_id < current {
                log::debug!(
                    "ignoring stale AnswerUpdated log: round {} < current {} (job {})",
                    log.round_id,
                    current,
                    self.job_spec_id
                );
                return;
            }
        }
        self.poll_ticker.resume();
    }

    /// The eligibility funnel. Returns whether a job run was created.
    async fn poll_if_eligible(&mut self, threshold: Decimal) -> bool {
        if !self.shared.connected.load(Ordering::SeqCst) {
            log::warn!(
                "not connected to chain node, skipping poll (job {})",
                self.job_spec_id
            );
            return false;
        }

        let state = match self.round_state().await {
            Ok(state) => state,
            Err(err) => {
                log::error!(
                    "unable to determine eligibility to submit: {} (job {})",
                    err,
                    self.job_spec_id
                );
                return false;
            }
        };
        self.apply_round_state(&state);

        if !state.eligible_to_submit {
            log::info!(
                "not eligible to submit for round {}, skipping poll (job {})",
                state.reportable_round_id,
                self.job_spec_id
            );
            return false;
        }

        let available = match self.aggregator.available_funds().await {
            Ok(funds) => funds,
            Err(err) => {
                log::error!(
                    "unable to determine available aggregator funds: {} (job {})",
                    err,
                    self.job_spec_id
                );
                return false;
            }
        };
        if available < self.minimum_contract_payment {
            log::info!(
                "aggregator funds {} do not cover the minimum contract payment, skipping poll (job {})",
                available,
                self.job_spec_id
            );
            return false;
        }

        let polled_answer = match self.fetcher.fetch().await {
            Ok(answer) => answer,
            Err(err) => {
                log::error!("can't fetch answer: {} (job {})", err, self.job_spec_id);
                return false;
            }
        };

        let latest_answer =
            match Decimal::try_from_i128_with_scale(state.latest_answer, self.precision) {
                Ok(answer) => answer,
                Err(err) => {
                    log::error!(
                        "latest answer {} is out of decimal range: {} (job {})",
                        state.latest_answer,
                        err,
                        self.job_spec_id
                    );
                    return false;
                }
            };
        if !outside_deviation(latest_answer, polled_answer, threshold) {
            return false;
        }

        log::info!(
            "deviation reached threshold, submitting for round {} (job {})",
            state.reportable_round_id,
            self.job_spec_id
        );
        if let Err(err) = self
            .create_job_run(polled_answer, state.reportable_round_id)
            .await
        {
            log::error!("can't create job run: {} (job {})", err, self.job_spec_id);
            return false;
        }
        true
    }

    async fn round_state(&self) -> Result<RoundState, PollError> {
        let oracle = self.key_store.oracle_address()?;
        Ok(self.aggregator.round_state(oracle).await?)
    }

    /// Adopt a fresh round state: the contract's reportable round becomes
    /// ours, and its expiry rearms or clears the round-timeout deadline.
    fn apply_round_state(&mut self, state: &RoundState) {
        self.reportable_round_id = Some(state.reportable_round_id);

        if state.times_out_at == 0 {
            self.round_timeout = None;
        } else {
            let now = chrono::Utc::now().timestamp().max(0) as u64;
            let remaining = state.times_out_at.saturating_sub(now);
            self.round_timeout = Some(Instant::now() + Duration::from_secs(remaining));
        }
    }

    async fn create_job_run(
        &mut self,
        polled_answer: Decimal,
        round: u64,
    ) -> Result<(), PollError> {
        let method_id = self.aggregator.method_id(UPDATE_ANSWER_FUNCTION)?;

        let payload = JobRunRequest {
            result: polled_answer,
            address: to_checksum(&self.address, None),
            function_selector: format!("0x{}", hex::encode(method_id)),
            data_prefix: format!("0x{}", hex::encode(crate::contracts::evm_word(round))),
        };
        let request_params = serde_json::to_value(&payload)?;

        self.run_manager
            .create(
                &self.job_spec_id,
                &self.initiator,
                None,
                RunRequest::new(request_params),
            )
            .await?;

        // A submission is pending for this round. Silence polling until
        // AnswerUpdated closes the round or the round times out, and give
        // the idle clock a fresh start.
        self.poll_ticker.stop();
        if !self.idle_threshold.is_zero() {
            self.idle_deadline = Some(Instant::now() + self.idle_threshold);
        }
        Ok(())
    }
}

/// Builds a checker from a flux-monitor initiator: validates the polling
/// interval, resolves feeds eagerly, constructs the median fetcher, and
/// binds the aggregator client to the initiator's contract address.
pub struct CheckerFactory {
    run_manager: Arc<dyn RunManager>,
    key_store: Arc<dyn KeyStore>,
    bridges: Arc<dyn BridgeStore>,
    aggregators: Arc<dyn AggregatorFactory>,
    config: MonitorConfig,
}

impl CheckerFactory {
    pub fn new(
        run_manager: Arc<dyn RunManager>,
        key_store: Arc<dyn KeyStore>,
        bridges: Arc<dyn BridgeStore>,
        aggregators: Arc<dyn AggregatorFactory>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            run_manager,
            key_store,
            bridges,
            aggregators,
            config,
        }
    }

    pub fn new_checker(&self, initiator: &Initiator) -> Result<DeviationChecker, CheckerError> {
        let params = &initiator.params;

        if params.polling_interval.to_duration() < MINIMUM_POLLING_INTERVAL {
            return Err(CheckerError::Config(format!(
                "pollingInterval must be equal or greater than {:?}",
                MINIMUM_POLLING_INTERVAL
            )));
        }

        let urls = resolve_feed_urls(&params.feeds, self.bridges.as_ref())?;
        let fetcher = MedianFetcher::from_urls(&urls, &params.request_data, self.config.http_timeout)?;
        let aggregator = self.aggregators.aggregator_at(params.address)?;

        DeviationChecker::new(
            initiator.clone(),
            aggregator,
            self.run_manager.clone(),
            self.key_store.clone(),
            Box::new(fetcher),
            self.config.minimum_contract_payment,
        )
    }
}

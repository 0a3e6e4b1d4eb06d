//! Shared mock collaborators for integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ethers_core::types::{Address, U256};
use rust_decimal::Decimal;
use serde_json::Value;

use fluxmon::contracts::{
    selector, AggregatorError, AggregatorFactory, AggregatorLog, FluxAggregator, LogBroadcaster,
    LogListener, RoundState, Unsubscribe,
};
use fluxmon::fetch::{FetchError, Fetcher};
use fluxmon::models::{Initiator, JobId, JobRun, JobSpec, RunRequest};
use fluxmon::runs::{RunManager, RunManagerError};
use fluxmon::store::{JobStore, StoreError};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn oracle_address() -> Address {
    Address::from_low_u64_be(0xff)
}

pub fn other_oracle() -> Address {
    Address::from_low_u64_be(0xbb)
}

pub fn contract_address() -> Address {
    Address::from_low_u64_be(0xaa)
}

pub fn eligible_state(round: u64, latest_answer: i128) -> RoundState {
    RoundState {
        reportable_round_id: round,
        eligible_to_submit: true,
        latest_answer,
        times_out_at: 0,
        available_funds: U256::from(1_000u64),
        payment_amount: U256::from(10u64),
    }
}

/// Aggregator double: scripted round state and funds, plus a broadcast
/// fan-out to every subscribed listener.
pub struct MockAggregator {
    state: Mutex<RoundState>,
    funds: Mutex<U256>,
    pub connected: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn LogListener>>>,
    pub unsubscribes: Arc<AtomicUsize>,
    pub round_state_calls: AtomicUsize,
}

impl MockAggregator {
    pub fn new(state: RoundState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            funds: Mutex::new(U256::from(1_000u64)),
            connected: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
            unsubscribes: Arc::new(AtomicUsize::new(0)),
            round_state_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_state(&self, state: RoundState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn set_funds(&self, funds: U256) {
        *self.funds.lock().unwrap() = funds;
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn broadcast(&self, log: AggregatorLog) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener.handle_log(Ok(log.clone()));
        }
    }

    pub fn broadcast_error(&self, message: &str) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener.handle_log(Err(AggregatorError::Subscription(message.to_string())));
        }
    }
}

#[async_trait]
impl FluxAggregator for MockAggregator {
    async fn round_state(&self, _oracle: Address) -> Result<RoundState, AggregatorError> {
        self.round_state_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().clone())
    }

    async fn available_funds(&self) -> Result<U256, AggregatorError> {
        Ok(*self.funds.lock().unwrap())
    }

    fn method_id(&self, signature: &str) -> Result<[u8; 4], AggregatorError> {
        Ok(selector(signature))
    }

    async fn subscribe_logs(&self, listener: Arc<dyn LogListener>) -> (bool, Unsubscribe) {
        self.listeners.lock().unwrap().push(listener);
        let unsubscribes = self.unsubscribes.clone();
        (
            self.connected.load(Ordering::SeqCst),
            Box::new(move || {
                unsubscribes.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }
}

/// Hands out the same mock aggregator regardless of contract address.
pub struct SingleAggregatorFactory(pub Arc<MockAggregator>);

impl AggregatorFactory for SingleAggregatorFactory {
    fn aggregator_at(&self, _address: Address) -> Result<Arc<dyn FluxAggregator>, AggregatorError> {
        Ok(self.0.clone())
    }
}

/// Fetcher double whose answer can be swapped mid-test.
pub struct SettableFetcher {
    answer: Mutex<Decimal>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl SettableFetcher {
    pub fn new(answer: Decimal) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(answer),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, answer: Decimal) {
        *self.answer.lock().unwrap() = answer;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Box-able handle so tests can keep the shared side for assertions.
pub struct FetcherHandle(pub Arc<SettableFetcher>);

#[async_trait]
impl Fetcher for FetcherHandle {
    async fn fetch(&self) -> Result<Decimal, FetchError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        if self.0.fail.load(Ordering::SeqCst) {
            return Err(FetchError::NoAnswers);
        }
        Ok(*self.0.answer.lock().unwrap())
    }
}

/// Run manager double recording every request payload.
pub struct RecordingRunManager {
    pub requests: Mutex<Vec<Value>>,
    pub fail: AtomicBool,
}

impl RecordingRunManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn run_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> Value {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl RunManager for RecordingRunManager {
    async fn create(
        &self,
        job_spec_id: &JobId,
        _initiator: &Initiator,
        _creation_height: Option<u64>,
        run_request: RunRequest,
    ) -> Result<JobRun, RunManagerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RunManagerError("pipeline rejected run".to_string()));
        }
        let mut requests = self.requests.lock().unwrap();
        requests.push(run_request.request_params);
        Ok(JobRun {
            id: format!("run-{}", requests.len()),
            job_spec_id: job_spec_id.clone(),
        })
    }
}

/// Log-broadcast transport double counting lifecycle calls.
pub struct NoopBroadcaster {
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
}

impl NoopBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        })
    }
}

impl LogBroadcaster for NoopBroadcaster {
    fn start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Job store double serving a fixed job list.
pub struct StaticJobStore {
    pub jobs: Mutex<Vec<JobSpec>>,
}

impl StaticJobStore {
    pub fn new(jobs: Vec<JobSpec>) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(jobs),
        })
    }
}

impl JobStore for StaticJobStore {
    fn flux_monitor_jobs(&self) -> Result<Vec<JobSpec>, StoreError> {
        Ok(self.jobs.lock().unwrap().clone())
    }
}

//! Aggregator contract surface
//!
//! The monitor never talks to a chain directly. Everything it needs from the
//! aggregator contract is behind the [`FluxAggregator`] trait: the per-oracle
//! round state RPC, the available-funds query, method-id lookup, and the log
//! subscription. Log delivery and connection supervision flow back through
//! [`LogListener`].

use std::sync::Arc;

use async_trait::async_trait;
use ethers_core::types::{Address, U256};
use ethers_core::utils::keccak256;

/// Signature of the contract method a submission ultimately calls.
pub const UPDATE_ANSWER_FUNCTION: &str = "updateAnswer(uint256,int256)";

#[derive(Debug)]
pub enum AggregatorError {
    Rpc(String),
    MethodNotFound(String),
    Subscription(String),
}

impl std::fmt::Display for AggregatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregatorError::Rpc(msg) => write!(f, "aggregator RPC error: {}", msg),
            AggregatorError::MethodNotFound(sig) => {
                write!(f, "aggregator ABI has no method {:?}", sig)
            }
            AggregatorError::Subscription(msg) => {
                write!(f, "log subscription error: {}", msg)
            }
        }
    }
}

impl std::error::Error for AggregatorError {}

/// First four bytes of the keccak-256 hash of a method signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// A value encoded as a 32-byte big-endian EVM word.
pub fn evm_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    U256::from(value).to_big_endian(&mut word);
    word
}

/// Contract round state relative to one oracle address.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoundState {
    /// The round the contract currently expects this oracle to answer
    pub reportable_round_id: u64,
    pub eligible_to_submit: bool,
    /// Latest on-chain answer, scaled by 10^precision
    pub latest_answer: i128,
    /// Unix timestamp at which the current round expires, 0 for none
    pub times_out_at: u64,
    pub available_funds: U256,
    pub payment_amount: U256,
}

/// An oracle opened a new reporting round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogNewRound {
    pub round_id: u64,
    pub started_by: Address,
    pub started_at: u64,
    pub address: Address,
}

/// A round closed with a new consensus answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogAnswerUpdated {
    pub round_id: u64,
    pub current: i128,
    pub timestamp: u64,
    pub address: Address,
}

/// Tagged log variants delivered by the aggregator subscription. Unknown
/// variants are dropped by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorLog {
    NewRound(LogNewRound),
    AnswerUpdated(LogAnswerUpdated),
    Unknown,
}

/// Receiver side of a log subscription. `handle_log` may be called from any
/// thread; implementations must enqueue without blocking the broadcaster.
pub trait LogListener: Send + Sync {
    fn on_connect(&self);
    fn on_disconnect(&self);
    fn handle_log(&self, log: Result<AggregatorLog, AggregatorError>);
}

/// Thunk releasing a log subscription.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Client for one deployed aggregator contract.
#[async_trait]
pub trait FluxAggregator: Send + Sync {
    /// Round state for the given oracle address. The contract is
    /// authoritative about which round the oracle should answer.
    async fn round_state(&self, oracle: Address) -> Result<RoundState, AggregatorError>;

    /// Funds the aggregator currently holds for paying oracles.
    async fn available_funds(&self) -> Result<U256, AggregatorError>;

    /// ABI method id for the given signature.
    fn method_id(&self, signature: &str) -> Result<[u8; 4], AggregatorError>;

    /// Register a listener for this contract's logs. Returns whether the
    /// underlying node connection is currently up, plus an unsubscribe thunk.
    async fn subscribe_logs(&self, listener: Arc<dyn LogListener>) -> (bool, Unsubscribe);
}

/// Builds aggregator clients bound to a contract address. The checker
/// factory uses this to attach each initiator to its contract.
pub trait AggregatorFactory: Send + Sync {
    fn aggregator_at(&self, address: Address) -> Result<Arc<dyn FluxAggregator>, AggregatorError>;
}

/// The shared log-broadcast transport behind every aggregator subscription.
/// Started and stopped by the service, once per process.
pub trait LogBroadcaster: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

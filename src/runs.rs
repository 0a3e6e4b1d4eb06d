//! Run creation
//!
//! The checker never executes a computation pipeline or signs a transaction
//! itself; it hands a structured run request to the node's run manager and
//! moves on.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Initiator, JobId, JobRun, RunRequest};

#[derive(Debug)]
pub struct RunManagerError(pub String);

impl std::fmt::Display for RunManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run manager error: {}", self.0)
    }
}

impl std::error::Error for RunManagerError {}

/// Executes job runs: the computation pipeline plus the eventual signed
/// on-chain transaction.
#[async_trait]
pub trait RunManager: Send + Sync {
    async fn create(
        &self,
        job_spec_id: &JobId,
        initiator: &Initiator,
        creation_height: Option<u64>,
        run_request: RunRequest,
    ) -> Result<JobRun, RunManagerError>;
}

/// The request params a flux-monitor run carries.
///
/// `data_prefix` is the reportable round id as a 32-byte EVM word, so the
/// submission pipeline can splice it in front of the answer when building
/// the `updateAnswer(uint256,int256)` calldata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunRequest {
    pub result: Decimal,
    pub address: String,
    pub function_selector: String,
    pub data_prefix: String,
}

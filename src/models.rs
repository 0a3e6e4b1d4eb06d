//! Data model for jobs, initiators, and bridges
//!
//! Job specs arrive as JSON from the job-lifecycle layer. Only initiators of
//! type `fluxmonitor` are consumed by this crate; everything else is carried
//! opaquely and ignored.

use std::fmt;
use std::time::Duration;

use ethers_core::types::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Unique identifier of a job spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Duration in milliseconds.
///
/// Durations in job JSON are plain millisecond integers. Zero disables the
/// timer the field configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Millis(pub u64);

impl Millis {
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub const fn to_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl From<Duration> for Millis {
    fn from(d: Duration) -> Self {
        Self(d.as_millis() as u64)
    }
}

impl From<Millis> for Duration {
    fn from(m: Millis) -> Self {
        Duration::from_millis(m.0)
    }
}

/// Initiator type tag. Unrecognized tags deserialize to `Other` and are
/// skipped by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitiatorType {
    #[serde(rename = "fluxmonitor")]
    FluxMonitor,
    #[serde(rename = "runlog")]
    RunLog,
    #[serde(rename = "web")]
    Web,
    #[serde(rename = "cron")]
    Cron,
    #[serde(other, rename = "other")]
    Other,
}

/// Parameters carried by a flux-monitor initiator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FluxMonitorParams {
    /// Aggregator contract address this initiator monitors
    pub address: Address,
    /// Heterogeneous feed list: URL strings and `{"bridge": name}` objects
    pub feeds: Value,
    /// Opaque payload passed through into the run request
    pub request_data: Value,
    /// Deviation threshold as a percentage (0.5 means 0.5%)
    pub threshold: f64,
    /// The contract's latest answer is an integer scaled by 10^precision
    pub precision: u32,
    pub polling_interval: Millis,
    /// Zero disables idle-driven polling
    pub idle_threshold: Millis,
}

/// One initiator of a job spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Initiator {
    #[serde(default)]
    pub id: i64,
    pub job_spec_id: JobId,
    #[serde(rename = "type")]
    pub kind: InitiatorType,
    #[serde(default)]
    pub params: FluxMonitorParams,
}

/// A job spec as persisted by the job-lifecycle layer. Opaque to the monitor
/// except for its id and its initiators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: Option<JobId>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub initiators: Vec<Initiator>,
}

impl JobSpec {
    /// All initiators of the given type, in spec order.
    pub fn initiators_for(&self, kind: InitiatorType) -> Vec<Initiator> {
        self.initiators
            .iter()
            .filter(|i| i.kind == kind)
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
pub enum ModelError {
    InvalidBridgeName(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidBridgeName(name) => {
                write!(f, "invalid bridge name: {:?}", name)
            }
        }
    }
}

impl std::error::Error for ModelError {}

/// Validated bridge name: lowercase alphanumerics, dashes, and underscores.
/// Names are lowercased on construction so lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BridgeName(String);

impl BridgeName {
    pub fn new(name: &str) -> Result<Self, ModelError> {
        let lowered = name.to_lowercase();
        if lowered.is_empty()
            || !lowered
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ModelError::InvalidBridgeName(name.to_string()));
        }
        Ok(Self(lowered))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BridgeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered external adapter the feed list can reference by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bridge {
    pub name: BridgeName,
    pub url: Url,
    #[serde(default)]
    pub confirmations: u32,
}

/// The structured message handed to the run manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub request_params: Value,
}

impl RunRequest {
    pub fn new(request_params: Value) -> Self {
        Self { request_params }
    }
}

/// A created job run, as reported back by the run manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub job_spec_id: JobId,
}

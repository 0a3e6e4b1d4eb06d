//! # fluxmon
//!
//! Off-chain control loop of a decentralized price oracle. For each
//! configured feed job the monitor watches an on-chain aggregator contract
//! and a set of off-chain price sources, and decides on behalf of a single
//! oracle identity whether and when to submit a fresh price report.
//!
//! Three orthogonal triggers drive a submission:
//! - the off-chain aggregate price moved beyond a fractional threshold
//!   relative to the last on-chain answer,
//! - another oracle opened a reporting round this oracle may answer,
//! - an idle timer elapsed, forcing a refresh regardless of deviation.
//!
//! The crate never signs or broadcasts transactions itself. Run execution,
//! the aggregator contract client, and the log-subscription transport are
//! trait seams ([`runs::RunManager`], [`contracts::FluxAggregator`],
//! [`contracts::LogBroadcaster`]) the surrounding node implements.

pub mod config;
pub mod contracts;
pub mod fetch;
pub mod models;
pub mod monitor;
pub mod runs;
pub mod store;

pub use config::{MonitorConfig, DEFAULT_HTTP_TIMEOUT, MINIMUM_POLLING_INTERVAL};
pub use monitor::{
    outside_deviation, CheckerFactory, DeviationChecker, FluxMonitorService, PollTicker,
};

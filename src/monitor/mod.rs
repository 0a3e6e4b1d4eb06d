//! The flux monitor core: per-job deviation checkers and the supervisor
//! that owns them.

pub mod checker;
pub mod deviation;
pub mod feeds;
pub mod service;
pub mod ticker;

pub use checker::{CheckerError, CheckerFactory, DeviationChecker};
pub use deviation::outside_deviation;
pub use feeds::{resolve_feed_urls, FeedError};
pub use service::{FluxMonitorService, ServiceError};
pub use ticker::PollTicker;

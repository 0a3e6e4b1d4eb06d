//! Feed resolution
//!
//! A job's `feeds` parameter is a JSON array mixing absolute URL strings and
//! `{"bridge": name}` references to registered bridges. Resolution happens
//! once, at checker construction, so the per-poll hot path never touches the
//! bridge store.

use serde_json::Value;
use url::Url;

use crate::models::BridgeName;
use crate::store::{BridgeStore, StoreError};

#[derive(Debug)]
pub enum FeedError {
    /// The feeds parameter is not a JSON array
    NotAnArray,
    /// A feed entry is neither a URL string nor a bridge object
    UnknownShape(String),
    InvalidUrl(String),
    InvalidBridgeName(String),
    Bridge(StoreError),
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::NotAnArray => write!(f, "feeds parameter is not a JSON array"),
            FeedError::UnknownShape(entry) => {
                write!(f, "unable to extract a feed URL from {}", entry)
            }
            FeedError::InvalidUrl(url) => write!(f, "feed URL {:?} is not an absolute URL", url),
            FeedError::InvalidBridgeName(name) => write!(f, "invalid bridge name {:?}", name),
            FeedError::Bridge(err) => write!(f, "bridge lookup failed: {}", err),
        }
    }
}

impl std::error::Error for FeedError {}

impl From<StoreError> for FeedError {
    fn from(err: StoreError) -> Self {
        FeedError::Bridge(err)
    }
}

/// Resolve a feeds array into absolute URLs, in spec order.
pub fn resolve_feed_urls(feeds: &Value, bridges: &dyn BridgeStore) -> Result<Vec<Url>, FeedError> {
    let entries = feeds.as_array().ok_or(FeedError::NotAnArray)?;

    let mut urls = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Value::String(raw) => {
                let url =
                    Url::parse(raw).map_err(|_| FeedError::InvalidUrl(raw.to_string()))?;
                urls.push(url);
            }
            Value::Object(fields) => {
                let raw_name = fields
                    .get("bridge")
                    .and_then(|b| b.as_str())
                    .ok_or_else(|| FeedError::UnknownShape(entry.to_string()))?;
                let name = BridgeName::new(raw_name)
                    .map_err(|_| FeedError::InvalidBridgeName(raw_name.to_string()))?;
                let bridge = bridges.find_bridge(&name)?;
                urls.push(bridge.url);
            }
            other => return Err(FeedError::UnknownShape(other.to_string())),
        }
    }

    Ok(urls)
}

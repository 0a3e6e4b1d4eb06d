//! Price fetching
//!
//! The checker only ever sees the [`Fetcher`] trait. The default wiring is a
//! [`MedianFetcher`] over one [`HttpFetcher`] per resolved feed URL: each
//! source is an external price adapter that answers a POST of the job's
//! request data with a JSON body carrying the price under `data.result`.
//! Individual source failures are tolerated as long as a median is defined.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde_json::Value;
use url::Url;

#[derive(Debug)]
pub enum FetchError {
    /// A median fetcher needs at least one source
    NoSources,
    /// Every source failed this round
    NoAnswers,
    /// The aggregate fetch deadline elapsed
    Timeout,
    Http(String),
    Parse(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::NoSources => write!(f, "no price sources configured"),
            FetchError::NoAnswers => write!(f, "no price source returned an answer"),
            FetchError::Timeout => write!(f, "price fetch timed out"),
            FetchError::Http(msg) => write!(f, "HTTP error: {}", msg),
            FetchError::Parse(msg) => write!(f, "price parse error: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(err.to_string())
    }
}

/// A source of the current off-chain price.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> Result<Decimal, FetchError>;
}

/// Fetches all sources concurrently and answers with their median.
pub struct MedianFetcher {
    sources: Vec<Box<dyn Fetcher>>,
    timeout: Duration,
}

impl MedianFetcher {
    pub fn new(sources: Vec<Box<dyn Fetcher>>, timeout: Duration) -> Result<Self, FetchError> {
        if sources.is_empty() {
            return Err(FetchError::NoSources);
        }
        Ok(Self { sources, timeout })
    }

    /// Build the standard HTTP median fetcher over the given adapter URLs.
    pub fn from_urls(
        urls: &[Url],
        request_data: &Value,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let mut sources: Vec<Box<dyn Fetcher>> = Vec::with_capacity(urls.len());
        for url in urls {
            sources.push(Box::new(HttpFetcher::new(
                url.clone(),
                request_data.clone(),
                timeout,
            )?));
        }
        Self::new(sources, timeout)
    }
}

#[async_trait]
impl Fetcher for MedianFetcher {
    async fn fetch(&self) -> Result<Decimal, FetchError> {
        let fetches = join_all(self.sources.iter().map(|s| s.fetch()));
        let results = tokio::time::timeout(self.timeout, fetches)
            .await
            .map_err(|_| FetchError::Timeout)?;

        let mut answers: Vec<Decimal> = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(answer) => answers.push(answer),
                Err(err) => log::warn!("price source failed: {}", err),
            }
        }

        if answers.is_empty() {
            return Err(FetchError::NoAnswers);
        }

        answers.sort();
        let mid = answers.len() / 2;
        if answers.len() % 2 == 1 {
            Ok(answers[mid])
        } else {
            Ok((answers[mid - 1] + answers[mid]) / Decimal::from(2))
        }
    }
}

/// One external price adapter reached over HTTP.
pub struct HttpFetcher {
    client: reqwest::Client,
    url: Url,
    request_data: Value,
}

impl HttpFetcher {
    pub fn new(url: Url, request_data: Value, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(FetchError::from)?;

        let request_data = if request_data.is_null() {
            Value::Object(Default::default())
        } else {
            request_data
        };

        Ok(Self {
            client,
            url,
            request_data,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self) -> Result<Decimal, FetchError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&self.request_data)
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        extract_price(&body)
    }
}

/// Pull the price out of an adapter response. Adapters answer
/// `{"data": {"result": ...}}`; a bare `{"result": ...}` is accepted too.
/// The result may be a JSON number or a numeric string.
fn extract_price(body: &Value) -> Result<Decimal, FetchError> {
    let result = body
        .pointer("/data/result")
        .or_else(|| body.pointer("/result"))
        .ok_or_else(|| FetchError::Parse(format!("no result field in response: {}", body)))?;

    match result {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .map_err(|e| FetchError::Parse(format!("bad numeric result {}: {}", n, e))),
        Value::String(s) => Decimal::from_str(s)
            .map_err(|e| FetchError::Parse(format!("bad string result {:?}: {}", s, e))),
        other => Err(FetchError::Parse(format!(
            "result is neither number nor string: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticFetcher(Result<Decimal, ()>);

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self) -> Result<Decimal, FetchError> {
            match &self.0 {
                Ok(d) => Ok(*d),
                Err(_) => Err(FetchError::Http("source down".to_string())),
            }
        }
    }

    fn sources(prices: &[Result<i64, ()>]) -> Vec<Box<dyn Fetcher>> {
        prices
            .iter()
            .copied()
            .map(|p| Box::new(StaticFetcher(p.map(Decimal::from))) as Box<dyn Fetcher>)
            .collect()
    }

    #[tokio::test]
    async fn test_median_odd_count() {
        let fetcher =
            MedianFetcher::new(sources(&[Ok(102), Ok(100), Ok(101)]), Duration::from_secs(1))
                .unwrap();
        assert_eq!(fetcher.fetch().await.unwrap(), Decimal::from(101));
    }

    #[tokio::test]
    async fn test_median_even_count_averages_middles() {
        let fetcher = MedianFetcher::new(
            sources(&[Ok(100), Ok(102), Ok(104), Ok(101)]),
            Duration::from_secs(1),
        )
        .unwrap();
        // sorted: 100 101 102 104 -> (101 + 102) / 2
        assert_eq!(fetcher.fetch().await.unwrap(), Decimal::new(1015, 1));
    }

    #[tokio::test]
    async fn test_median_tolerates_failed_sources() {
        let fetcher = MedianFetcher::new(
            sources(&[Err(()), Ok(100), Err(())]),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(fetcher.fetch().await.unwrap(), Decimal::from(100));
    }

    #[tokio::test]
    async fn test_median_all_failed_is_error() {
        let fetcher =
            MedianFetcher::new(sources(&[Err(()), Err(())]), Duration::from_secs(1)).unwrap();
        assert!(matches!(
            fetcher.fetch().await,
            Err(FetchError::NoAnswers)
        ));
    }

    #[test]
    fn test_median_requires_sources() {
        assert!(matches!(
            MedianFetcher::new(Vec::new(), Duration::from_secs(1)),
            Err(FetchError::NoSources)
        ));
    }

    #[test]
    fn test_extract_price_shapes() {
        // Standard adapter envelope
        let body = json!({"data": {"result": "123.45"}});
        assert_eq!(extract_price(&body).unwrap(), Decimal::new(12345, 2));

        // Bare result, numeric
        let body = json!({"result": 100.5});
        assert_eq!(extract_price(&body).unwrap(), Decimal::new(1005, 1));

        // Missing result
        let body = json!({"data": {"price": 1}});
        assert!(matches!(extract_price(&body), Err(FetchError::Parse(_))));

        // Non-numeric result
        let body = json!({"result": [1, 2]});
        assert!(matches!(extract_price(&body), Err(FetchError::Parse(_))));
    }
}

use std::time::Duration;

use bytes::Bytes;
use url::Url;

/// Body and content type of one successful fetch
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("http status {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Request(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    /// Client errors other than timeouts and rate limiting will not get
    ///  better by asking again.
    pub fn is_permanent(&self) -> bool {
        match self {
            FetchError::Status(status) => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            FetchError::Request(_) | FetchError::Timeout(_) => false,
        }
    }
}

/// One attempt at retrieving a URL. Retries, timeouts and concurrency are
///  the caller's business.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Fetched, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(FetchError::Status(404).is_permanent());
        assert!(FetchError::Status(400).is_permanent());
        assert!(!FetchError::Status(429).is_permanent());
        assert!(!FetchError::Status(408).is_permanent());
        assert!(!FetchError::Status(503).is_permanent());
        assert!(!FetchError::Timeout(Duration::from_secs(1)).is_permanent());
        assert!(!FetchError::Request("reset".into()).is_permanent());
    }
}

use async_trait::async_trait;
use thiserror::Error;

use crate::db::models::OddsQuote;

/// Classified failure of one upstream fetch.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("missing odds API key")]
    MissingApiKey,
    #[error("[{sport}] auth error {status}: {detail}")]
    Auth {
        sport: String,
        status: u16,
        detail: String,
    },
    #[error("[{sport}] rate limited (remaining={remaining:?}, used={used:?})")]
    RateLimited {
        sport: String,
        remaining: Option<String>,
        used: Option<String>,
    },
    #[error("[{sport}] HTTP {status}: {detail}")]
    Http {
        sport: String,
        status: u16,
        detail: String,
    },
    #[error("[{sport}] request failed: {source}")]
    Transport {
        sport: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("[{sport}] malformed response: {detail}")]
    Parse { sport: String, detail: String },
    #[error("[{sport}] timed out after {secs}s")]
    Timeout { sport: String, secs: u64 },
}

impl ProviderError {
    /// Failures the next scheduled cycle may reasonably recover from.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Transport { .. }
            | ProviderError::Timeout { .. } => true,
            ProviderError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Trait that every odds source must implement.
#[async_trait]
pub trait OddsProvider: Send + Sync {
    /// Flattened quotes for every upcoming event of one sport/league key.
    async fn fetch_sport(&self, sport_key: &str) -> Result<Vec<OddsQuote>, ProviderError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

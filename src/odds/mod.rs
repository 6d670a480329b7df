pub mod provider;
pub mod the_odds_api;

pub use provider::{OddsProvider, ProviderError};
pub use the_odds_api::TheOddsApi;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::db::models::OddsQuote;

/// Outcome of fetching one sport key.
#[derive(Debug)]
pub struct FetchAttempt {
    pub provider: String,
    pub sport_key: String,
    /// Number of quotes on success
    pub result: Result<usize, ProviderError>,
}

/// Serializable view of a [`FetchAttempt`] for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct FetchStatus {
    pub provider: String,
    pub sport_key: String,
    pub ok: bool,
    pub quotes: usize,
    pub error: Option<String>,
    pub transient: bool,
}

impl From<&FetchAttempt> for FetchStatus {
    fn from(a: &FetchAttempt) -> Self {
        FetchStatus {
            provider: a.provider.clone(),
            sport_key: a.sport_key.clone(),
            ok: a.result.is_ok(),
            quotes: *a.result.as_ref().unwrap_or(&0),
            error: a.result.as_ref().err().map(|e| e.to_string()),
            transient: a.result.as_ref().err().map(|e| e.is_transient()).unwrap_or(false),
        }
    }
}

#[derive(Debug, Default)]
pub struct FetchReport {
    pub quotes: Vec<OddsQuote>,
    pub attempts: Vec<FetchAttempt>,
}

impl FetchReport {
    pub fn failures(&self) -> usize {
        self.attempts.iter().filter(|a| a.result.is_err()).count()
    }
}

/// Fetch every sport key concurrently, each under its own timeout.
///
/// A failed or slow key contributes nothing; the rest of the cycle proceeds
/// with whatever did arrive. No retries: the next cycle re-fetches.
pub async fn collect_quotes(
    provider: Arc<dyn OddsProvider>,
    sport_keys: &[String],
    timeout: Duration,
) -> FetchReport {
    let fetch_futures: Vec<_> = sport_keys
        .iter()
        .map(|key| {
            let p = Arc::clone(&provider);
            let key = key.clone();
            async move {
                let res = tokio::time::timeout(timeout, p.fetch_sport(&key)).await;
                let out = match res {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout {
                        sport: key.clone(),
                        secs: timeout.as_secs(),
                    }),
                };
                (key, out)
            }
        })
        .collect();

    let results = futures_util::future::join_all(fetch_futures).await;

    let mut report = FetchReport::default();
    for (sport_key, result) in results {
        let result = match result {
            Ok(quotes) => {
                let n = quotes.len();
                report.quotes.extend(quotes);
                Ok(n)
            }
            Err(e) => {
                warn!("Odds fetch failed for {} via {}: {}", sport_key, provider.name(), e);
                Err(e)
            }
        };
        report.attempts.push(FetchAttempt {
            provider: provider.name().to_string(),
            sport_key,
            result,
        });
    }

    info!(
        "Fetched {} quotes from {} sport key(s) ({} failed)",
        report.quotes.len(),
        report.attempts.len(),
        report.failures()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Fixture, Outcome, Side};
    use async_trait::async_trait;
    use chrono::Utc;

    struct MockProvider;

    fn quote(sport_key: &str) -> OddsQuote {
        OddsQuote {
            fixture: Fixture {
                match_id: format!("{}-1", sport_key),
                sport: "football".into(),
                league: sport_key.into(),
                home_team: "A".into(),
                away_team: "B".into(),
                start_time: Utc::now(),
            },
            book: "book".into(),
            price: 2.0,
            outcome: Outcome::h2h(Side::Home),
        }
    }

    #[async_trait]
    impl OddsProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn fetch_sport(&self, sport_key: &str) -> Result<Vec<OddsQuote>, ProviderError> {
            match sport_key {
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(vec![quote(sport_key)])
                }
                "denied" => Err(ProviderError::Auth {
                    sport: sport_key.into(),
                    status: 401,
                    detail: "bad key".into(),
                }),
                _ => Ok(vec![quote(sport_key), quote(sport_key)]),
            }
        }
    }

    #[tokio::test]
    async fn failures_are_isolated_per_sport() {
        let keys: Vec<String> = ["soccer_epl", "denied", "slow", "soccer_italy_serie_a"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let report = collect_quotes(Arc::new(MockProvider), &keys, Duration::from_millis(50)).await;
        assert_eq!(report.quotes.len(), 4);
        assert_eq!(report.attempts.len(), 4);
        assert_eq!(report.failures(), 2);
        assert!(matches!(
            report.attempts[1].result,
            Err(ProviderError::Auth { .. })
        ));
        assert!(matches!(
            report.attempts[2].result,
            Err(ProviderError::Timeout { .. })
        ));
        let status = FetchStatus::from(&report.attempts[0]);
        assert!(status.ok);
        assert_eq!(status.quotes, 2);
    }
}

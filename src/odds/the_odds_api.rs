use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::provider::{OddsProvider, ProviderError};
use crate::db::models::{Fixture, OddsQuote, Outcome, Side, TotalSide};

/// Pre-match odds from The Odds API v4.
/// Docs: <https://the-odds-api.com/liveapi/guides/v4/>
pub struct TheOddsApi {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    regions: String,
    timeout: Duration,
}

impl TheOddsApi {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        regions: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(TheOddsApi {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            regions: regions.to_string(),
            timeout,
        })
    }

    fn transport_error(&self, sport: &str, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout {
                sport: sport.to_string(),
                secs: self.timeout.as_secs(),
            }
        } else {
            ProviderError::Transport {
                sport: sport.to_string(),
                source: e,
            }
        }
    }
}

#[async_trait]
impl OddsProvider for TheOddsApi {
    fn name(&self) -> &str {
        "TheOddsAPI"
    }

    async fn fetch_sport(&self, sport_key: &str) -> Result<Vec<OddsQuote>, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or(ProviderError::MissingApiKey)?;
        let url = format!("{}/sports/{}/odds", self.base_url, sport_key);
        debug!("Fetching odds for {} from {}", sport_key, url);

        let resp = self
            .http
            .get(&url)
            .query(&[
                ("apiKey", api_key),
                ("regions", self.regions.as_str()),
                ("markets", "h2h,totals"),
                ("oddsFormat", "decimal"),
                ("dateFormat", "iso"),
            ])
            .send()
            .await
            .map_err(|e| self.transport_error(sport_key, e))?;

        let status = resp.status();
        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let remaining = header("x-requests-remaining");
        let used = header("x-requests-used");
        if let Some(left) = &remaining {
            debug!("{}: {} API requests remaining", sport_key, left);
        }

        let body = resp
            .text()
            .await
            .map_err(|e| self.transport_error(sport_key, e))?;

        if !status.is_success() {
            let detail: String = body.chars().take(400).collect();
            return Err(classify_status(sport_key, status.as_u16(), remaining, used, detail));
        }

        let raw: Value = serde_json::from_str(&body).map_err(|e| ProviderError::Parse {
            sport: sport_key.to_string(),
            detail: e.to_string(),
        })?;
        parse_events(&raw, sport_key)
    }
}

/// Map a non-2xx response to its error class.
pub fn classify_status(
    sport: &str,
    status: u16,
    remaining: Option<String>,
    used: Option<String>,
    detail: String,
) -> ProviderError {
    let sport = sport.to_string();
    match status {
        401 | 403 => ProviderError::Auth {
            sport,
            status,
            detail,
        },
        429 => ProviderError::RateLimited {
            sport,
            remaining,
            used,
        },
        _ => ProviderError::Http {
            sport,
            status,
            detail,
        },
    }
}

/// Sport family from a provider key: `soccer_epl` → `football`.
pub fn sport_family(sport_key: &str) -> String {
    let prefix = sport_key.split('_').next().unwrap_or(sport_key);
    match prefix {
        "soccer" => "football".to_string(),
        other => other.to_lowercase(),
    }
}

fn h2h_side(name: &str, home: &str, away: &str) -> Option<Side> {
    let name = name.trim().to_lowercase();
    let home = home.trim().to_lowercase();
    let away = away.trim().to_lowercase();
    if name == home || name == "home" || name == "1" {
        Some(Side::Home)
    } else if name == away || name == "away" || name == "2" {
        Some(Side::Away)
    } else if name == "draw" || name == "x" || name == "tie" {
        Some(Side::Draw)
    } else if !home.is_empty() && name.contains(&home) {
        Some(Side::Home)
    } else if !away.is_empty() && name.contains(&away) {
        Some(Side::Away)
    } else {
        None
    }
}

fn totals_side(name: &str) -> Option<TotalSide> {
    match name.trim().to_lowercase().as_str() {
        "over" => Some(TotalSide::Over),
        "under" => Some(TotalSide::Under),
        _ => None,
    }
}

/// Flatten events → bookmakers → markets → outcomes into quote rows.
///
/// Events without an id, teams or a parseable start time are skipped, as are
/// outcomes without a numeric price or a recognisable name.
pub fn parse_events(raw: &Value, sport_key: &str) -> Result<Vec<OddsQuote>, ProviderError> {
    let events = raw.as_array().ok_or_else(|| ProviderError::Parse {
        sport: sport_key.to_string(),
        detail: "expected an array of events".to_string(),
    })?;

    let mut quotes = Vec::new();
    for ev in events {
        let Some(fixture) = parse_fixture(ev, sport_key) else {
            continue;
        };
        let Some(bookmakers) = ev["bookmakers"].as_array() else {
            continue;
        };
        for book in bookmakers {
            let Some(book_key) = book["key"].as_str() else {
                continue;
            };
            for market in book["markets"].as_array().into_iter().flatten() {
                let kind = market["key"].as_str().unwrap_or_default();
                for oc in market["outcomes"].as_array().into_iter().flatten() {
                    let Some(price) = oc["price"].as_f64() else {
                        continue;
                    };
                    let name = oc["name"].as_str().unwrap_or_default();
                    let outcome = match kind {
                        "h2h" => h2h_side(name, &fixture.home_team, &fixture.away_team)
                            .map(Outcome::h2h),
                        "totals" => match (totals_side(name), oc["point"].as_f64()) {
                            (Some(side), Some(line)) => Some(Outcome::Totals { side, line }),
                            _ => None,
                        },
                        _ => None,
                    };
                    if let Some(outcome) = outcome {
                        quotes.push(OddsQuote {
                            fixture: fixture.clone(),
                            book: book_key.to_string(),
                            price,
                            outcome,
                        });
                    }
                }
            }
        }
    }
    Ok(quotes)
}

fn parse_fixture(ev: &Value, sport_key: &str) -> Option<Fixture> {
    let match_id = ev["id"].as_str()?.to_string();
    let home_team = ev["home_team"].as_str()?.to_string();
    let away_team = ev["away_team"].as_str()?.to_string();
    let start_time = DateTime::parse_from_rfc3339(ev["commence_time"].as_str()?)
        .ok()?
        .with_timezone(&Utc);
    let league = ev["sport_key"].as_str().unwrap_or(sport_key).to_string();
    Some(Fixture {
        match_id,
        sport: sport_family(&league),
        league,
        home_team,
        away_team,
        start_time,
    })
}

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::bot::score_model::ScoreModelConfig;
use crate::bot::selection::{Guardrails, SelectionPolicy};
use crate::bot::signals::SignalTable;
use crate::bot::EngineSettings;
use crate::db::models::{BetResult, Outcome};

/// Value-bet finder: consensus odds, score model, tiered selection, Kelly staking
#[derive(Parser, Debug, Clone)]
#[command(name = "valuebet-bot", version, about)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "valuebet.db")]
    pub database_path: String,

    /// Bankroll seeded on first run (never overwrites an existing bankroll)
    #[arg(long, env = "INITIAL_BALANCE", default_value = "100.0")]
    pub initial_balance: f64,

    /// The Odds API base URL
    #[arg(long, env = "ODDS_API_URL", default_value = "https://api.the-odds-api.com/v4")]
    pub odds_api_url: String,

    /// The Odds API key (required for `picks`)
    #[arg(long, env = "ODDS_API_KEY")]
    pub odds_api_key: Option<String>,

    /// Bookmaker regions
    #[arg(long, env = "ODDS_REGIONS", default_value = "eu,uk")]
    pub odds_regions: String,

    /// Sport/league keys to fetch, comma-separated
    #[arg(
        long,
        env = "ODDS_SPORTS",
        value_delimiter = ',',
        default_value = "soccer_france_ligue_1,soccer_epl,soccer_spain_la_liga,soccer_italy_serie_a,soccer_germany_bundesliga"
    )]
    pub odds_sports: Vec<String>,

    /// Per-sport fetch timeout in seconds
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value = "25")]
    pub fetch_timeout_secs: u64,

    /// Kelly multiplier applied to the full-Kelly fraction (0.0–1.0)
    #[arg(long, env = "KELLY_FRACTION", default_value = "0.25")]
    pub kelly_fraction: f64,

    /// Maximum picks per cycle
    #[arg(long, env = "MAX_PICKS", default_value = "3")]
    pub max_picks: usize,

    /// Global edge floor applied on top of every tier
    #[arg(long, env = "MIN_EDGE", default_value = "0.0")]
    pub min_edge: f64,

    /// Minimum decimal price in every tier
    #[arg(long, env = "MIN_ODDS", default_value = "1.30")]
    pub min_odds: f64,

    /// Strict tier: earliest start, in minutes from now
    #[arg(long, env = "MIN_START_MINUTES", default_value = "60")]
    pub min_start_minutes: i64,

    /// Strict tier: latest start, in hours from now
    #[arg(long, env = "MAX_START_HOURS", default_value = "36")]
    pub max_start_hours: i64,

    /// Reject strict-tier prices that have not drifted above their rolling median
    #[arg(long, env = "DRIFT_GUARD", action = ArgAction::Set, default_value_t = true)]
    pub drift_guard: bool,

    /// Required rise over the rolling median for the drift guard
    #[arg(long, env = "DRIFT_EPSILON", default_value = "0.01")]
    pub drift_epsilon: f64,

    /// Odds-history look-back for the drift guard, in hours
    #[arg(long, env = "DRIFT_WINDOW_HOURS", default_value = "36")]
    pub drift_window_hours: i64,

    /// Strict tier: adjusted edge must beat consensus edge by this much (unset = off)
    #[arg(long, env = "MIN_SIGNAL_DELTA")]
    pub min_signal_delta: Option<f64>,

    /// Strict tier: reject underdogs priced against watch-listed opponents
    #[arg(long, env = "ELITE_GUARD", action = ArgAction::Set, default_value_t = true)]
    pub elite_guard: bool,

    /// Exclude draw outcomes in every tier
    #[arg(long, env = "EXCLUDE_DRAWS", action = ArgAction::Set, default_value_t = true)]
    pub exclude_draws: bool,

    /// Low-score correlation of the score model
    #[arg(long, env = "DC_RHO", default_value = "0.12")]
    pub dc_rho: f64,

    /// Totals lines to price, comma-separated
    #[arg(long, env = "TOTALS_LINES", value_delimiter = ',', default_value = "2.5")]
    pub totals_lines: Vec<f64>,

    /// Most likely exact scores reported per fixture
    #[arg(long, env = "TOP_SCORES", default_value = "3")]
    pub top_scores: usize,

    /// JSON selection policy; replaces every built-in threshold when given
    #[arg(long, env = "POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    /// JSON per-team signals (form / injury / sentiment)
    #[arg(long, env = "SIGNALS_FILE")]
    pub signals_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fetch odds, select and stake picks, journal them
    Picks {
        /// Report picks without writing journal entries
        #[arg(long)]
        no_journal: bool,
        /// Emit JSON lines on stdout instead of log lines
        #[arg(long)]
        json: bool,
    },
    /// Settle the latest open entry for a match and outcome
    Settle {
        match_id: String,
        /// home | draw | away | over_2.5 | under_2.5
        outcome: Outcome,
        /// win | loss | push
        result: BetResult,
        /// Decimal price the bet settled at
        price: f64,
    },
    /// Bankroll, results and open entries
    Status {
        /// Recent journal entries to list
        #[arg(long, default_value = "20")]
        limit: i64,
        #[arg(long)]
        json: bool,
    },
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Command::Picks { .. } = self.command {
            if self.odds_api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
                anyhow::bail!("ODDS_API_KEY is required to fetch odds for `picks`.");
            }
            if self.odds_sports.is_empty() {
                anyhow::bail!("ODDS_SPORTS must name at least one sport key");
            }
        }
        if !(0.0..=1.0).contains(&self.kelly_fraction) {
            anyhow::bail!("kelly_fraction must be between 0.0 and 1.0");
        }
        if self.max_picks == 0 {
            anyhow::bail!("max_picks must be at least 1");
        }
        if !(0.0..1.0).contains(&self.dc_rho) {
            anyhow::bail!("dc_rho must be in [0.0, 1.0)");
        }
        if self.initial_balance <= 0.0 {
            anyhow::bail!("initial_balance must be positive");
        }
        if self.min_odds <= 1.0 {
            anyhow::bail!("min_odds must be above 1.0");
        }
        if self.min_start_minutes < 0 || self.max_start_hours * 60 <= self.min_start_minutes {
            anyhow::bail!("start window is empty: min_start_minutes must be below max_start_hours");
        }
        if self.drift_epsilon < 0.0 || self.drift_window_hours <= 0 {
            anyhow::bail!("drift_epsilon must be >= 0 and drift_window_hours positive");
        }
        if self.fetch_timeout_secs == 0 {
            anyhow::bail!("fetch_timeout_secs must be positive");
        }
        if self.totals_lines.iter().any(|l| !(l.is_finite() && *l > 0.0)) {
            anyhow::bail!("totals_lines must be positive numbers");
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Built-in three-tier policy overlaid with flags, or the policy file verbatim.
    pub fn selection_policy(&self) -> Result<SelectionPolicy> {
        if let Some(path) = &self.policy_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read policy file {}", path.display()))?;
            return serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse policy file {}", path.display()));
        }

        let mut policy = SelectionPolicy {
            max_picks: self.max_picks,
            exclude_draws: self.exclude_draws,
            ..SelectionPolicy::default()
        };
        for profile in policy.tiers_mut() {
            profile.min_edge = profile.min_edge.max(self.min_edge);
            profile.min_odds = profile.min_odds.max(self.min_odds);
        }
        policy.strict.min_lead_minutes = self.min_start_minutes;
        policy.strict.max_lead_hours = self.max_start_hours;
        policy.strict.guardrails = Guardrails {
            min_signal_delta: self.min_signal_delta,
            drift_epsilon: self.drift_guard.then_some(self.drift_epsilon),
            elite_watchlist: self.elite_guard,
        };
        Ok(policy)
    }

    pub fn engine_settings(&self) -> Result<EngineSettings> {
        let signals = match &self.signals_file {
            Some(path) => SignalTable::from_json_file(path)?,
            None => SignalTable::default(),
        };
        Ok(EngineSettings {
            policy: self.selection_policy()?,
            model: ScoreModelConfig {
                rho: self.dc_rho,
                totals_lines: self.totals_lines.clone(),
                top_k: self.top_scores,
                ..ScoreModelConfig::default()
            },
            signals,
            kelly_fraction: self.kelly_fraction,
            drift_window_hours: self.drift_window_hours,
        })
    }
}

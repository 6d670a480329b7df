//! Exogenous per-team signals blended into a base probability in logit space.
//!
//! Each team's form, injury and sentiment readings combine into one bounded
//! score `tanh(0.6·sentiment + 0.3·form + 0.1·injury)`. The outcome's logit is
//! then shifted by a market-dependent delta and mapped back through the
//! sigmoid, so the adjusted probability never leaves (0, 1).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::db::models::{Fixture, Outcome, Side, TotalSide};

const EPS: f64 = 1e-6;

fn clamp_prob(p: f64) -> f64 {
    p.clamp(EPS, 1.0 - EPS)
}

fn logit(p: f64) -> f64 {
    let p = clamp_prob(p);
    (p / (1.0 - p)).ln()
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

/// Shift `p` by `delta` in logit space. Result lies in [1e-6, 1 − 1e-6].
pub fn adjust_probability(p: f64, delta: f64) -> f64 {
    clamp_prob(sigmoid(logit(p) + delta))
}

/// Raw readings for one team, each expected in [-1, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamSignal {
    #[serde(default)]
    pub form: f64,
    #[serde(default)]
    pub injury: f64,
    #[serde(default)]
    pub sentiment: f64,
}

impl TeamSignal {
    pub fn score(&self) -> f64 {
        (0.6 * self.sentiment + 0.3 * self.form + 0.1 * self.injury).tanh()
    }
}

/// Logit-shift sensitivities per market kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalWeights {
    /// Per unit of (selected − opponent) score on a win outcome
    pub side: f64,
    /// Per unit of |home − away| score, subtracted on a draw
    pub draw: f64,
    /// Per unit of (home + away) score on over; negated on under
    pub totals: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        SignalWeights {
            side: 0.30,
            draw: 0.20,
            totals: 0.15,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignalFile {
    #[serde(default)]
    weights: Option<SignalWeights>,
    #[serde(default)]
    teams: Vec<SignalFileRow>,
}

#[derive(Debug, Deserialize)]
struct SignalFileRow {
    sport: String,
    team: String,
    #[serde(flatten)]
    signal: TeamSignal,
}

/// Per-(sport, team) signal table. Empty means identity adjustment.
#[derive(Debug, Clone, Default)]
pub struct SignalTable {
    weights: SignalWeights,
    teams: HashMap<(String, String), TeamSignal>,
}

fn normalize_key(s: &str) -> String {
    s.trim().to_lowercase()
}

impl SignalTable {
    pub fn new(weights: SignalWeights) -> Self {
        SignalTable {
            weights,
            teams: HashMap::new(),
        }
    }

    /// Load `{ "weights": {..}, "teams": [{"sport", "team", "form", "injury", "sentiment"}] }`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read signals file {}", path.display()))?;
        let file: SignalFile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse signals file {}", path.display()))?;
        let mut table = SignalTable::new(file.weights.unwrap_or_default());
        for row in file.teams {
            table.insert(&row.sport, &row.team, row.signal);
        }
        Ok(table)
    }

    pub fn insert(&mut self, sport: &str, team: &str, signal: TeamSignal) {
        self.teams
            .insert((normalize_key(sport), normalize_key(team)), signal);
    }

    pub fn get(&self, sport: &str, team: &str) -> Option<&TeamSignal> {
        self.teams.get(&(normalize_key(sport), normalize_key(team)))
    }

    pub fn len(&self) -> usize {
        self.teams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }

    /// Logit delta for `outcome`; `None` when neither team has a signal.
    pub fn logit_delta(&self, fixture: &Fixture, outcome: &Outcome) -> Option<f64> {
        let home = self.get(&fixture.sport, &fixture.home_team);
        let away = self.get(&fixture.sport, &fixture.away_team);
        if home.is_none() && away.is_none() {
            return None;
        }
        let sh = home.map(TeamSignal::score).unwrap_or(0.0);
        let sa = away.map(TeamSignal::score).unwrap_or(0.0);
        let w = &self.weights;
        let delta = match outcome {
            Outcome::HeadToHead { side: Side::Home } => w.side * (sh - sa),
            Outcome::HeadToHead { side: Side::Away } => w.side * (sa - sh),
            Outcome::HeadToHead { side: Side::Draw } => -w.draw * (sh - sa).abs(),
            Outcome::Totals {
                side: TotalSide::Over,
                ..
            } => w.totals * (sh + sa),
            Outcome::Totals {
                side: TotalSide::Under,
                ..
            } => -w.totals * (sh + sa),
        };
        Some(delta)
    }

    /// Signal-adjusted probability; returns `p` unchanged when no signal applies.
    pub fn adjust(&self, fixture: &Fixture, outcome: &Outcome, p: f64) -> f64 {
        match self.logit_delta(fixture, outcome) {
            Some(delta) => adjust_probability(p, delta),
            None => p,
        }
    }
}

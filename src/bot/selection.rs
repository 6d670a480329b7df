//! Three-tier short-circuiting selection.
//!
//! Every tier runs the same [`check`] against its own [`StrictnessProfile`].
//! Tiers are evaluated strictly in order (strict → relaxed → basic); once the
//! accepted list reaches `max_picks` the remaining tiers are never evaluated,
//! so a looser tier can only fill slots a stricter tier left empty.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::db::models::Candidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Strict,
    Relaxed,
    Basic,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Strict => "strict",
            Tier::Relaxed => "relaxed",
            Tier::Basic => "basic",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prices strictly below `below_odds` need at least `min_edge`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeBand {
    pub below_odds: f64,
    pub min_edge: f64,
}

/// Ascending odds bands; shorter prices demand more edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeBands {
    pub bands: Vec<EdgeBand>,
    /// Requirement for prices at or above the last band
    pub otherwise: f64,
}

impl EdgeBands {
    pub fn new(bands: &[(f64, f64)], otherwise: f64) -> Self {
        EdgeBands {
            bands: bands
                .iter()
                .map(|&(below_odds, min_edge)| EdgeBand { below_odds, min_edge })
                .collect(),
            otherwise,
        }
    }

    pub fn required(&self, odds: f64) -> f64 {
        self.bands
            .iter()
            .find(|b| odds < b.below_odds)
            .map(|b| b.min_edge)
            .unwrap_or(self.otherwise)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SportCap {
    pub max_odds: f64,
    pub min_prob: f64,
}

/// Optional guards. `None`/`false` disables each one.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Guardrails {
    /// Adjusted edge must beat the consensus edge by at least this much
    #[serde(default)]
    pub min_signal_delta: Option<f64>,
    /// Best price must sit at least this fraction above its rolling median
    #[serde(default)]
    pub drift_epsilon: Option<f64>,
    /// Reject underdogs priced against a watch-listed opponent
    #[serde(default)]
    pub elite_watchlist: bool,
}

/// Thresholds for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrictnessProfile {
    pub tier: Tier,
    pub min_books: usize,
    /// Minimum best/median price ratio for sports without an override
    pub min_price_ratio: f64,
    #[serde(default)]
    pub min_price_ratio_by_sport: BTreeMap<String, f64>,
    /// `None` drops the per-band logic entirely
    #[serde(default)]
    pub edge_bands: Option<EdgeBands>,
    /// Global edge floor, applied on top of the bands
    pub min_edge: f64,
    pub min_odds: f64,
    pub max_odds: f64,
    pub min_prob: f64,
    /// Per-sport overrides of `max_odds` / `min_prob`
    #[serde(default)]
    pub sport_caps: BTreeMap<String, SportCap>,
    #[serde(default)]
    pub min_ev: Option<f64>,
    pub min_lead_minutes: i64,
    pub max_lead_hours: i64,
    #[serde(default)]
    pub guardrails: Guardrails,
}

impl StrictnessProfile {
    pub fn strict() -> Self {
        let mut sport_caps = BTreeMap::new();
        sport_caps.insert("tennis".to_string(), SportCap { max_odds: 2.20, min_prob: 0.50 });
        sport_caps.insert("football".to_string(), SportCap { max_odds: 2.40, min_prob: 0.45 });
        sport_caps.insert("basketball".to_string(), SportCap { max_odds: 2.20, min_prob: 0.52 });
        let mut ratios = BTreeMap::new();
        ratios.insert("tennis".to_string(), 1.02);
        StrictnessProfile {
            tier: Tier::Strict,
            min_books: 3,
            min_price_ratio: 1.01,
            min_price_ratio_by_sport: ratios,
            edge_bands: Some(EdgeBands::new(&[(1.45, 0.040), (1.60, 0.030), (2.00, 0.025)], 0.020)),
            min_edge: 0.0,
            min_odds: 1.30,
            max_odds: 2.40,
            min_prob: 0.0,
            sport_caps,
            min_ev: None,
            min_lead_minutes: 60,
            max_lead_hours: 36,
            guardrails: Guardrails {
                min_signal_delta: None,
                drift_epsilon: Some(0.01),
                elite_watchlist: true,
            },
        }
    }

    pub fn relaxed() -> Self {
        let mut ratios = BTreeMap::new();
        ratios.insert("tennis".to_string(), 1.00);
        StrictnessProfile {
            tier: Tier::Relaxed,
            min_books: 2,
            min_price_ratio: 0.995,
            min_price_ratio_by_sport: ratios,
            edge_bands: Some(EdgeBands::new(&[(1.45, 0.025), (1.60, 0.020), (2.00, 0.018)], 0.015)),
            min_edge: 0.015,
            min_odds: 1.30,
            max_odds: 2.60,
            min_prob: 0.42,
            sport_caps: BTreeMap::new(),
            min_ev: None,
            min_lead_minutes: 20,
            max_lead_hours: 72,
            guardrails: Guardrails::default(),
        }
    }

    pub fn basic() -> Self {
        StrictnessProfile {
            tier: Tier::Basic,
            min_books: 1,
            min_price_ratio: 0.98,
            min_price_ratio_by_sport: BTreeMap::new(),
            edge_bands: None,
            min_edge: 0.0,
            min_odds: 1.30,
            max_odds: 3.00,
            min_prob: 0.0,
            sport_caps: BTreeMap::new(),
            min_ev: Some(0.0),
            min_lead_minutes: 20,
            max_lead_hours: 72,
            guardrails: Guardrails::default(),
        }
    }

    /// Edge a candidate at `odds` must reach in this tier.
    pub fn required_edge(&self, odds: f64) -> f64 {
        match &self.edge_bands {
            Some(bands) => bands.required(odds).max(self.min_edge),
            None => self.min_edge,
        }
    }

    fn price_ratio_floor(&self, sport: &str) -> f64 {
        self.min_price_ratio_by_sport
            .get(sport)
            .copied()
            .unwrap_or(self.min_price_ratio)
    }

    fn caps(&self, sport: &str) -> SportCap {
        self.sport_caps.get(sport).copied().unwrap_or(SportCap {
            max_odds: self.max_odds,
            min_prob: self.min_prob,
        })
    }
}

fn default_elites() -> BTreeMap<String, Vec<String>> {
    let mut elites = BTreeMap::new();
    elites.insert(
        "tennis".to_string(),
        ["novak djokovic", "jannik sinner", "carlos alcaraz", "daniil medvedev", "alexander zverev"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    elites.insert(
        "football".to_string(),
        [
            "manchester city",
            "liverpool",
            "arsenal",
            "real madrid",
            "barcelona",
            "fc barcelona",
            "bayern munich",
            "psg",
            "paris saint-germain",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    );
    elites
}

/// Full selection policy: three profiles plus cross-tier settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    pub max_picks: usize,
    pub exclude_draws: bool,
    pub strict: StrictnessProfile,
    pub relaxed: StrictnessProfile,
    pub basic: StrictnessProfile,
    /// Watch-listed teams per sport, matched case-insensitively
    #[serde(default = "default_elites")]
    pub elites: BTreeMap<String, Vec<String>>,
    /// Consensus probability at or below which a side counts as an underdog
    pub underdog_threshold: f64,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy {
            max_picks: 3,
            exclude_draws: true,
            strict: StrictnessProfile::strict(),
            relaxed: StrictnessProfile::relaxed(),
            basic: StrictnessProfile::basic(),
            elites: default_elites(),
            underdog_threshold: 0.40,
        }
    }
}

impl SelectionPolicy {
    pub fn tiers(&self) -> [&StrictnessProfile; 3] {
        [&self.strict, &self.relaxed, &self.basic]
    }

    pub fn tiers_mut(&mut self) -> [&mut StrictnessProfile; 3] {
        [&mut self.strict, &mut self.relaxed, &mut self.basic]
    }

    fn is_elite(&self, sport: &str, team: &str) -> bool {
        let team = team.trim().to_lowercase();
        self.elites
            .get(sport)
            .map(|list| list.iter().any(|e| e.trim().to_lowercase() == team))
            .unwrap_or(false)
    }
}

/// First failed check for a candidate in one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    Draw,
    StartWindow,
    TooFewBooks,
    OddsRange,
    PriceQuality,
    ProbabilityCap,
    EdgeBelowBand,
    NegativeEv,
    SignalNoValue,
    StaleLine,
    EliteOpponent,
}

/// Run every check of `profile` against `c`.
pub fn check(
    c: &Candidate,
    profile: &StrictnessProfile,
    policy: &SelectionPolicy,
    now: DateTime<Utc>,
) -> Result<(), Rejection> {
    if policy.exclude_draws && c.outcome.is_draw() {
        return Err(Rejection::Draw);
    }

    let lead = c.fixture.start_time - now;
    if lead < Duration::minutes(profile.min_lead_minutes)
        || lead > Duration::hours(profile.max_lead_hours)
    {
        return Err(Rejection::StartWindow);
    }

    if c.n_books < profile.min_books {
        return Err(Rejection::TooFewBooks);
    }

    let caps = profile.caps(&c.fixture.sport);
    if c.price < profile.min_odds || c.price > caps.max_odds {
        return Err(Rejection::OddsRange);
    }

    if c.price_ratio() < profile.price_ratio_floor(&c.fixture.sport) {
        return Err(Rejection::PriceQuality);
    }

    if c.prob < caps.min_prob {
        return Err(Rejection::ProbabilityCap);
    }

    if c.edge < profile.required_edge(c.price) {
        return Err(Rejection::EdgeBelowBand);
    }

    if let Some(min_ev) = profile.min_ev {
        if c.ev < min_ev {
            return Err(Rejection::NegativeEv);
        }
    }

    let guards = &profile.guardrails;
    if let Some(delta) = guards.min_signal_delta {
        if c.edge - c.consensus_edge < delta {
            return Err(Rejection::SignalNoValue);
        }
    }

    if let (Some(eps), Some(median)) = (guards.drift_epsilon, c.drift_median) {
        if c.price < median * (1.0 + eps) {
            return Err(Rejection::StaleLine);
        }
    }

    if guards.elite_watchlist && c.consensus_prob <= policy.underdog_threshold {
        if let Some(opponent) = c.opponent() {
            if policy.is_elite(&c.fixture.sport, opponent) {
                return Err(Rejection::EliteOpponent);
            }
        }
    }

    Ok(())
}

pub fn passes(
    c: &Candidate,
    profile: &StrictnessProfile,
    policy: &SelectionPolicy,
    now: DateTime<Utc>,
) -> bool {
    check(c, profile, policy, now).is_ok()
}

/// EV desc, edge desc, price desc, then candidate order.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.ev.total_cmp(&a.ev)
        .then_with(|| b.edge.total_cmp(&a.edge))
        .then_with(|| b.price.total_cmp(&a.price))
        .then_with(|| a.index.cmp(&b.index))
}

#[derive(Debug, Clone, Serialize)]
pub struct Pick {
    pub candidate: Candidate,
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierSummary {
    pub tier: Tier,
    pub passed: usize,
    pub accepted: usize,
    pub rejected: BTreeMap<Rejection, usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Selection {
    pub picks: Vec<Pick>,
    /// Only the tiers that were actually evaluated
    pub tiers: Vec<TierSummary>,
}

pub fn select(candidates: &[Candidate], policy: &SelectionPolicy, now: DateTime<Utc>) -> Selection {
    let mut selection = Selection::default();
    let mut seen: HashSet<(String, String, String)> = HashSet::new();

    for profile in policy.tiers() {
        if selection.picks.len() >= policy.max_picks {
            break;
        }

        let mut rejected: BTreeMap<Rejection, usize> = BTreeMap::new();
        let mut passed: Vec<&Candidate> = Vec::new();
        for c in candidates {
            match check(c, profile, policy, now) {
                Ok(()) => passed.push(c),
                Err(reason) => *rejected.entry(reason).or_insert(0) += 1,
            }
        }
        passed.sort_by(|a, b| rank(a, b));

        let mut accepted = 0;
        for c in &passed {
            if selection.picks.len() >= policy.max_picks {
                break;
            }
            let key = (c.fixture.match_id.clone(), c.outcome.label(), c.book.clone());
            if seen.insert(key) {
                selection.picks.push(Pick {
                    candidate: (*c).clone(),
                    tier: profile.tier,
                });
                accepted += 1;
            }
        }

        selection.tiers.push(TierSummary {
            tier: profile.tier,
            passed: passed.len(),
            accepted,
            rejected,
        });
    }

    // Tiers decide who gets a slot; the final order is by rank across tiers
    selection.picks.sort_by(|a, b| rank(&a.candidate, &b.candidate));
    selection.picks.truncate(policy.max_picks);
    selection
}

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A sporting fixture as identified by the odds provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    /// Provider event ID
    pub match_id: String,
    /// Sport family, e.g. "football", "tennis", "basketball"
    pub sport: String,
    /// Provider league key, e.g. "soccer_epl"
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
}

impl Fixture {
    pub fn teams(&self) -> String {
        format!("{} vs {}", self.home_team, self.away_team)
    }
}

/// Side of a head-to-head market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Home,
    Draw,
    Away,
}

impl Side {
    pub const ALL: [Side; 3] = [Side::Home, Side::Draw, Side::Away];

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Home => "home",
            Side::Draw => "draw",
            Side::Away => "away",
        }
    }
}

/// Side of a totals (over/under) market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TotalSide {
    Over,
    Under,
}

/// What a quote (or a bet) is on. Totals carry their goal line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "market", rename_all = "snake_case")]
pub enum Outcome {
    HeadToHead { side: Side },
    Totals { side: TotalSide, line: f64 },
}

impl Outcome {
    pub fn h2h(side: Side) -> Self {
        Outcome::HeadToHead { side }
    }

    /// Market key as the provider names it: "h2h" | "totals"
    pub fn market(&self) -> &'static str {
        match self {
            Outcome::HeadToHead { .. } => "h2h",
            Outcome::Totals { .. } => "totals",
        }
    }

    pub fn is_draw(&self) -> bool {
        matches!(self, Outcome::HeadToHead { side: Side::Draw })
    }

    /// Stable textual key used for journal rows and odds history.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::HeadToHead { side } => f.write_str(side.as_str()),
            Outcome::Totals {
                side: TotalSide::Over,
                line,
            } => write!(f, "over {}", line),
            Outcome::Totals {
                side: TotalSide::Under,
                line,
            } => write!(f, "under {}", line),
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    /// Accepts "home", "draw", "away", "over 2.5", "under_2.5", "over2.5".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "home" | "1" => return Ok(Outcome::h2h(Side::Home)),
            "draw" | "x" => return Ok(Outcome::h2h(Side::Draw)),
            "away" | "2" => return Ok(Outcome::h2h(Side::Away)),
            _ => {}
        }
        let (side, rest) = if let Some(rest) = s.strip_prefix("over") {
            (TotalSide::Over, rest)
        } else if let Some(rest) = s.strip_prefix("under") {
            (TotalSide::Under, rest)
        } else {
            return Err(format!("unknown outcome '{}'", s));
        };
        let line: f64 = rest
            .trim_start_matches(|c| c == ' ' || c == '_')
            .parse()
            .map_err(|_| format!("invalid totals line in '{}'", s))?;
        Ok(Outcome::Totals { side, line })
    }
}

/// One bookmaker's decimal price for one outcome of one fixture.
/// Ephemeral: produced per fetch cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsQuote {
    pub fixture: Fixture,
    /// Bookmaker key, e.g. "pinnacle"
    pub book: String,
    /// Decimal price
    pub price: f64,
    pub outcome: Outcome,
}

/// Home/draw/away probability triple. Two-way fixtures carry `draw == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ThreeWay {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
}

impl ThreeWay {
    pub fn new(home: f64, draw: f64, away: f64) -> Self {
        ThreeWay { home, draw, away }
    }

    pub fn get(&self, side: Side) -> f64 {
        match side {
            Side::Home => self.home,
            Side::Draw => self.draw,
            Side::Away => self.away,
        }
    }

    pub fn sum(&self) -> f64 {
        self.home + self.draw + self.away
    }

    pub fn squared_error(&self, other: &ThreeWay) -> f64 {
        (self.home - other.home).powi(2)
            + (self.draw - other.draw).powi(2)
            + (self.away - other.away).powi(2)
    }
}

/// One qualifying (fixture, outcome) pair priced at its best available book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Position in the cycle's candidate list (fixture order, then outcome order).
    pub index: usize,
    pub fixture: Fixture,
    pub outcome: Outcome,
    /// Probability from the score model (or consensus for two-way fixtures)
    pub model_prob: f64,
    /// Cross-book consensus probability for this outcome
    pub consensus_prob: f64,
    /// Probability used for pricing: model probability after signal adjustment
    pub prob: f64,
    /// Best decimal price across books
    pub price: f64,
    pub book: String,
    /// Cross-book median price for this outcome in the current snapshot
    pub median_price: f64,
    pub n_books: usize,
    pub edge: f64,
    /// Edge of the consensus probability at the same price
    pub consensus_edge: f64,
    pub ev: f64,
    /// Rolling historical median of the cross-book median price, if any history exists
    pub drift_median: Option<f64>,
}

impl Candidate {
    /// Best price relative to the cross-book median. 1.0 when no median is known.
    pub fn price_ratio(&self) -> f64 {
        if self.median_price > 0.0 {
            self.price / self.median_price
        } else {
            1.0
        }
    }

    /// Opponent of the selected side for head-to-head outcomes.
    pub fn opponent(&self) -> Option<&str> {
        match self.outcome {
            Outcome::HeadToHead { side: Side::Home } => Some(&self.fixture.away_team),
            Outcome::HeadToHead { side: Side::Away } => Some(&self.fixture.home_team),
            _ => None,
        }
    }
}

/// Journal entry status: open → settled (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Open,
    Settled,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Open => "open",
            EntryStatus::Settled => "settled",
        }
    }
}

/// Declared result of a settled bet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetResult {
    Win,
    Loss,
    Push,
}

impl BetResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetResult::Win => "win",
            BetResult::Loss => "loss",
            BetResult::Push => "push",
        }
    }

    /// Profit (or loss) of a `stake` settled at decimal `price`.
    pub fn profit(&self, stake: f64, price: f64) -> f64 {
        match self {
            BetResult::Win => stake * (price - 1.0),
            BetResult::Loss => -stake,
            BetResult::Push => 0.0,
        }
    }
}

impl FromStr for BetResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "win" | "won" | "w" => Ok(BetResult::Win),
            "loss" | "lost" | "lose" | "l" => Ok(BetResult::Loss),
            "push" | "void" | "p" => Ok(BetResult::Push),
            other => Err(format!("unknown result '{}' (expected win|loss|push)", other)),
        }
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(EntryStatus::Open),
            "settled" => Ok(EntryStatus::Settled),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

sql_text_enum!(EntryStatus);
sql_text_enum!(BetResult);

/// A journaled bet. Created open at selection time, settled exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Option<i64>,
    pub match_id: String,
    pub sport: String,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
    /// "h2h" | "totals"
    pub market: String,
    /// Outcome label, e.g. "home" or "over 2.5"
    pub outcome: String,
    pub book: String,
    /// Price taken at selection time
    pub price: f64,
    pub probability: f64,
    pub edge: f64,
    pub ev: f64,
    pub stake: f64,
    /// Selection tier that accepted the bet
    pub tier: String,
    pub status: EntryStatus,
    pub result: Option<BetResult>,
    pub settle_price: Option<f64>,
    pub pnl: Option<f64>,
    pub bankroll_before: Option<f64>,
    pub bankroll_after: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Cross-book median price of one outcome at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub match_id: String,
    pub outcome: String,
    pub median_odds: f64,
    pub n_books: usize,
    pub recorded_at: DateTime<Utc>,
}

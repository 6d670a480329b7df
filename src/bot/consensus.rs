//! Cross-book consensus probabilities.
//!
//! Each book's decimal price is turned into an implied probability, the
//! median is taken per outcome (robust to a single off-market line) and the
//! per-side medians are renormalised to sum to one.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::db::models::{Fixture, OddsQuote, Outcome, Side, ThreeWay, TotalSide};

/// Why a fixture produced no consensus row
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConsensusError {
    #[error("no usable head-to-head prices")]
    DataUnavailable,

    #[error("only {sides} priced side(s) from {books} book(s)")]
    InsufficientConsensus { sides: usize, books: usize },
}

/// Price summary of one outcome across books
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeMarket {
    pub outcome: Outcome,
    pub best_price: f64,
    pub best_book: String,
    pub median_price: f64,
    /// Distinct books quoting this outcome
    pub n_books: usize,
    /// Normalised consensus probability within this outcome's market
    pub consensus_prob: Option<f64>,
}

/// Consensus view of one fixture
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusRow {
    pub fixture: Fixture,
    /// Normalised head-to-head probabilities (sum to 1)
    pub probs: ThreeWay,
    /// Distinct books quoting the head-to-head market
    pub n_books: usize,
    /// Head-to-head outcomes first, then totals in line order
    pub markets: Vec<OutcomeMarket>,
}

impl ConsensusRow {
    /// True when the fixture has a priced draw, i.e. the score model applies.
    pub fn is_three_way(&self) -> bool {
        self.probs.draw > 0.0
    }
}

#[derive(Debug, Default)]
pub struct ConsensusBuild {
    pub rows: Vec<ConsensusRow>,
    pub skipped: Vec<(String, ConsensusError)>,
}

/// Implied probability of a decimal price. Prices at or below even money
/// with certainty pricing (≤ 1.0) imply certainty.
pub fn implied_probability(decimal_odds: f64) -> f64 {
    if decimal_odds > 1.0 {
        1.0 / decimal_odds
    } else {
        1.0
    }
}

/// Median of a slice; `None` when empty. Even-length slices average the two middle values.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some(0.5 * (sorted[mid - 1] + sorted[mid]))
    }
}

fn usable(price: f64) -> bool {
    price.is_finite() && price > 1.0
}

/// Median implied probability of the usable prices, 0.0 when there are none.
fn consensus_from_prices(prices: &[f64]) -> f64 {
    let implied: Vec<f64> = prices
        .iter()
        .copied()
        .filter(|p| usable(*p))
        .map(implied_probability)
        .collect();
    median(&implied).unwrap_or(0.0)
}

fn summarize_outcome(outcome: Outcome, quotes: &[&OddsQuote]) -> Option<OutcomeMarket> {
    let priced: Vec<&OddsQuote> = quotes.iter().copied().filter(|q| usable(q.price)).collect();
    // First book wins ties on the best price.
    let mut best: Option<&OddsQuote> = None;
    for q in &priced {
        if best.map_or(true, |b| q.price > b.price) {
            best = Some(*q);
        }
    }
    let best = best?;
    let prices: Vec<f64> = priced.iter().map(|q| q.price).collect();
    let books: HashSet<&str> = priced.iter().map(|q| q.book.as_str()).collect();
    Some(OutcomeMarket {
        outcome,
        best_price: best.price,
        best_book: best.book.clone(),
        median_price: median(&prices).unwrap_or(best.price),
        n_books: books.len(),
        consensus_prob: None,
    })
}

fn same_line(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.005
}

/// Build the consensus for one fixture's quotes.
fn fixture_consensus(quotes: &[&OddsQuote]) -> Result<ConsensusRow, ConsensusError> {
    let fixture = quotes[0].fixture.clone();

    let h2h_prices = |side: Side| -> Vec<f64> {
        quotes
            .iter()
            .filter(|q| q.outcome == Outcome::h2h(side))
            .map(|q| q.price)
            .collect()
    };
    let raw = ThreeWay::new(
        consensus_from_prices(&h2h_prices(Side::Home)),
        consensus_from_prices(&h2h_prices(Side::Draw)),
        consensus_from_prices(&h2h_prices(Side::Away)),
    );
    let total = raw.sum();
    if total <= 0.0 {
        return Err(ConsensusError::DataUnavailable);
    }

    let h2h_books: HashSet<&str> = quotes
        .iter()
        .filter(|q| matches!(q.outcome, Outcome::HeadToHead { .. }))
        .map(|q| q.book.as_str())
        .collect();
    let priced_sides = [raw.home, raw.draw, raw.away]
        .iter()
        .filter(|p| **p > 0.0)
        .count();
    if priced_sides < 2 {
        return Err(ConsensusError::InsufficientConsensus {
            sides: priced_sides,
            books: h2h_books.len(),
        });
    }

    let probs = ThreeWay::new(raw.home / total, raw.draw / total, raw.away / total);

    let mut markets = Vec::new();
    for side in Side::ALL {
        let outcome = Outcome::h2h(side);
        let side_quotes: Vec<&OddsQuote> = quotes
            .iter()
            .copied()
            .filter(|q| q.outcome == outcome)
            .collect();
        if let Some(mut m) = summarize_outcome(outcome, &side_quotes) {
            m.consensus_prob = Some(probs.get(side));
            markets.push(m);
        }
    }

    // Totals: group by line, normalise over/under medians within each line.
    let mut lines: Vec<f64> = Vec::new();
    for q in quotes {
        if let Outcome::Totals { line, .. } = q.outcome {
            if !lines.iter().any(|l| same_line(*l, line)) {
                lines.push(line);
            }
        }
    }
    lines.sort_by(|a, b| a.total_cmp(b));
    for line in lines {
        let side_quotes = |side: TotalSide| -> Vec<&OddsQuote> {
            quotes
                .iter()
                .copied()
                .filter(|q| {
                    matches!(q.outcome, Outcome::Totals { side: s, line: l } if s == side && same_line(l, line))
                })
                .collect()
        };
        let over_quotes = side_quotes(TotalSide::Over);
        let under_quotes = side_quotes(TotalSide::Under);
        let p_over = consensus_from_prices(&over_quotes.iter().map(|q| q.price).collect::<Vec<_>>());
        let p_under =
            consensus_from_prices(&under_quotes.iter().map(|q| q.price).collect::<Vec<_>>());
        let pair_total = p_over + p_under;

        for (side, side_q, raw_p) in [
            (TotalSide::Over, &over_quotes, p_over),
            (TotalSide::Under, &under_quotes, p_under),
        ] {
            if let Some(mut m) = summarize_outcome(Outcome::Totals { side, line }, side_q) {
                if p_over > 0.0 && p_under > 0.0 {
                    m.consensus_prob = Some(raw_p / pair_total);
                }
                markets.push(m);
            }
        }
    }

    Ok(ConsensusRow {
        fixture,
        probs,
        n_books: h2h_books.len(),
        markets,
    })
}

/// Aggregate one cycle's quotes into per-fixture consensus rows.
///
/// Fixture order follows first appearance in `quotes`, which later serves as
/// the deterministic tie-break in selection.
pub fn build_consensus(quotes: &[OddsQuote]) -> ConsensusBuild {
    let mut order: Vec<&str> = Vec::new();
    let mut by_fixture: HashMap<&str, Vec<&OddsQuote>> = HashMap::new();
    for q in quotes {
        let key = q.fixture.match_id.as_str();
        by_fixture
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(q);
    }

    let mut build = ConsensusBuild::default();
    for match_id in order {
        let group = &by_fixture[match_id];
        match fixture_consensus(group) {
            Ok(row) => build.rows.push(row),
            Err(e) => build.skipped.push((match_id.to_string(), e)),
        }
    }
    build
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};

    fn fixture(id: &str) -> Fixture {
        Fixture {
            match_id: id.into(),
            sport: "football".into(),
            league: "soccer_epl".into(),
            home_team: "Arsenal".into(),
            away_team: "Chelsea".into(),
            start_time: Utc.with_ymd_and_hms(2026, 10, 20, 19, 0, 0).unwrap(),
        }
    }

    fn quote(id: &str, book: &str, outcome: Outcome, price: f64) -> OddsQuote {
        OddsQuote {
            fixture: fixture(id),
            book: book.into(),
            price,
            outcome,
        }
    }

    fn h2h(id: &str, book: &str, home: f64, draw: f64, away: f64) -> Vec<OddsQuote> {
        vec![
            quote(id, book, Outcome::h2h(Side::Home), home),
            quote(id, book, Outcome::h2h(Side::Draw), draw),
            quote(id, book, Outcome::h2h(Side::Away), away),
        ]
    }

    #[test]
    fn implied_probability_handles_degenerate_prices() {
        assert_relative_eq!(implied_probability(2.0), 0.5, epsilon = 1e-12);
        assert_relative_eq!(implied_probability(1.0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(implied_probability(0.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn median_odd_and_even() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn consensus_is_normalised_and_counts_books() {
        let mut quotes = h2h("m1", "b1", 2.0, 3.4, 4.0);
        quotes.extend(h2h("m1", "b2", 2.1, 3.3, 3.8));
        quotes.extend(h2h("m1", "b3", 1.95, 3.5, 4.2));
        let build = build_consensus(&quotes);
        assert!(build.skipped.is_empty());
        let row = &build.rows[0];
        assert_eq!(row.n_books, 3);
        assert_relative_eq!(row.probs.sum(), 1.0, epsilon = 1e-9);
        assert!(row.probs.home > row.probs.away);
        assert!(row.is_three_way());

        let home = &row.markets[0];
        assert_eq!(home.outcome, Outcome::h2h(Side::Home));
        assert_relative_eq!(home.best_price, 2.1, epsilon = 1e-12);
        assert_eq!(home.best_book, "b2");
        assert_relative_eq!(home.median_price, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn median_resists_outlier_book() {
        let mut quotes = h2h("m1", "b1", 2.0, 3.4, 4.0);
        quotes.extend(h2h("m1", "b2", 2.0, 3.4, 4.0));
        quotes.extend(h2h("m1", "b3", 9.0, 3.4, 4.0));
        let row = &build_consensus(&quotes).rows[0];
        let mut clean = h2h("m2", "b1", 2.0, 3.4, 4.0);
        clean.extend(h2h("m2", "b2", 2.0, 3.4, 4.0));
        let clean_row = &build_consensus(&clean).rows[0];
        assert_relative_eq!(row.probs.home, clean_row.probs.home, epsilon = 1e-12);
    }

    #[test]
    fn fixture_without_usable_prices_is_dropped() {
        let quotes = h2h("m1", "b1", 1.0, 0.0, f64::NAN);
        let build = build_consensus(&quotes);
        assert!(build.rows.is_empty());
        assert_eq!(build.skipped[0].1, ConsensusError::DataUnavailable);
    }

    #[test]
    fn single_priced_side_is_insufficient() {
        let quotes = vec![quote("m1", "b1", Outcome::h2h(Side::Home), 1.8)];
        let build = build_consensus(&quotes);
        assert!(matches!(
            build.skipped[0].1,
            ConsensusError::InsufficientConsensus { sides: 1, books: 1 }
        ));
    }

    #[test]
    fn two_way_fixture_has_zero_draw() {
        let quotes = vec![
            quote("t1", "b1", Outcome::h2h(Side::Home), 1.5),
            quote("t1", "b1", Outcome::h2h(Side::Away), 2.6),
        ];
        let row = &build_consensus(&quotes).rows[0];
        assert!(!row.is_three_way());
        assert_relative_eq!(row.probs.sum(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn totals_markets_are_grouped_by_line() {
        let mut quotes = h2h("m1", "b1", 2.0, 3.4, 4.0);
        let over = |line| Outcome::Totals {
            side: TotalSide::Over,
            line,
        };
        let under = |line| Outcome::Totals {
            side: TotalSide::Under,
            line,
        };
        quotes.push(quote("m1", "b1", over(2.5), 1.9));
        quotes.push(quote("m1", "b1", under(2.5), 1.9));
        quotes.push(quote("m1", "b2", over(2.5), 2.0));
        quotes.push(quote("m1", "b1", over(3.5), 3.0));
        let row = &build_consensus(&quotes).rows[0];
        let totals: Vec<&OutcomeMarket> = row
            .markets
            .iter()
            .filter(|m| m.outcome.market() == "totals")
            .collect();
        assert_eq!(totals.len(), 3);
        assert_eq!(totals[0].outcome, over(2.5));
        assert_relative_eq!(totals[0].best_price, 2.0, epsilon = 1e-12);
        assert_eq!(totals[0].n_books, 2);
        let pair: f64 = totals[..2].iter().filter_map(|m| m.consensus_prob).sum();
        assert_relative_eq!(pair, 1.0, epsilon = 1e-9);
        // 3.5 has no under side, so no normalised consensus
        assert_eq!(totals[2].consensus_prob, None);
    }

    #[test]
    fn fixture_order_follows_first_appearance() {
        let mut quotes = h2h("b", "b1", 2.0, 3.4, 4.0);
        quotes.extend(h2h("a", "b1", 2.0, 3.4, 4.0));
        quotes.extend(h2h("b", "b2", 2.0, 3.4, 4.0));
        let ids: Vec<String> = build_consensus(&quotes)
            .rows
            .into_iter()
            .map(|r| r.fixture.match_id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::db::models::{
    BetResult, Candidate, EntryStatus, Fixture, JournalEntry, OddsQuote, OddsSnapshot, Outcome,
    ThreeWay, TotalSide,
};
use crate::db::{Ledger, LedgerError};

use super::consensus::{build_consensus, ConsensusRow, OutcomeMarket};
use super::kelly::{edge, expected_value, stake_amount};
use super::score_model::{summarize, ScoreModelConfig, ScoreModelResult};
use super::selection::{select, Pick, SelectionPolicy, TierSummary};
use super::signals::SignalTable;

/// Everything a cycle needs besides the ledger.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: SelectionPolicy,
    pub model: ScoreModelConfig,
    pub signals: SignalTable,
    pub kelly_fraction: f64,
    /// Look-back of the odds-history median used by the drift guard
    pub drift_window_hours: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            policy: SelectionPolicy::default(),
            model: ScoreModelConfig::default(),
            signals: SignalTable::default(),
            kelly_fraction: 0.25,
            drift_window_hours: 36,
        }
    }
}

/// Per-fixture model output, reported even when nothing is picked.
#[derive(Debug, Clone, Serialize)]
pub struct FixtureDiagnostic {
    pub fixture: Fixture,
    pub consensus: ThreeWay,
    pub n_books: usize,
    /// `None` for two-way fixtures
    pub model: Option<ScoreModelResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StakedPick {
    pub pick: Pick,
    pub stake: f64,
    /// Journal row id, when the pick was journaled
    pub journal_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFixture {
    pub match_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub at: DateTime<Utc>,
    pub fixtures: usize,
    pub candidates: usize,
    pub picks: Vec<StakedPick>,
    pub diagnostics: Vec<FixtureDiagnostic>,
    pub skipped: Vec<SkippedFixture>,
    /// Tiers actually evaluated, in order
    pub tiers: Vec<TierSummary>,
    /// Bankroll the stakes were sized against
    pub bankroll: f64,
}

/// Runs the forward pipeline: quotes → consensus → model + signals →
/// edge/EV → tiered selection → stakes → journal.
pub struct PickEngine {
    settings: EngineSettings,
    ledger: Ledger,
}

impl PickEngine {
    pub fn new(settings: EngineSettings, ledger: Ledger) -> Self {
        if !settings.signals.is_empty() {
            info!("Loaded signals for {} team(s)", settings.signals.len());
        }
        PickEngine { settings, ledger }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Turn consensus rows into priced candidates plus per-fixture diagnostics.
    ///
    /// `history` maps `(match_id, outcome label)` to the rolling median price.
    pub fn build_candidates(
        &self,
        rows: &[ConsensusRow],
        history: &HashMap<(String, String), f64>,
    ) -> (Vec<Candidate>, Vec<FixtureDiagnostic>) {
        let mut candidates = Vec::new();
        let mut diagnostics = Vec::with_capacity(rows.len());

        for row in rows {
            let model = if row.is_three_way() {
                let result = summarize(row.probs, &self.settings.model);
                if result.degenerate {
                    warn!(
                        "Degenerate calibration for {} ({}): loss={:.5} at rates ({:.2}, {:.2})",
                        row.fixture.match_id,
                        row.fixture.teams(),
                        result.calibration.loss,
                        result.calibration.home_rate,
                        result.calibration.away_rate
                    );
                }
                Some(result)
            } else {
                None
            };

            for market in &row.markets {
                let Some(model_prob) = self.model_probability(row, model.as_ref(), market) else {
                    continue;
                };
                let c = self.price_candidate(candidates.len(), row, market, model_prob, history);
                debug!(
                    "{} {} @ {:.2} ({}): p={:.3} edge={:+.3} ev={:+.3}",
                    c.fixture.teams(),
                    c.outcome,
                    c.price,
                    c.book,
                    c.prob,
                    c.edge,
                    c.ev
                );
                candidates.push(c);
            }

            diagnostics.push(FixtureDiagnostic {
                fixture: row.fixture.clone(),
                consensus: row.probs,
                n_books: row.n_books,
                model,
            });
        }

        (candidates, diagnostics)
    }

    fn model_probability(
        &self,
        row: &ConsensusRow,
        model: Option<&ScoreModelResult>,
        market: &OutcomeMarket,
    ) -> Option<f64> {
        match market.outcome {
            Outcome::HeadToHead { side } => Some(match model {
                Some(m) => m.hda.get(side),
                None => row.probs.get(side),
            }),
            Outcome::Totals { side, line } => {
                let p_over = model?.over(line)?;
                Some(match side {
                    TotalSide::Over => p_over,
                    TotalSide::Under => 1.0 - p_over,
                })
            }
        }
    }

    fn price_candidate(
        &self,
        index: usize,
        row: &ConsensusRow,
        market: &OutcomeMarket,
        model_prob: f64,
        history: &HashMap<(String, String), f64>,
    ) -> Candidate {
        let fixture = &row.fixture;
        let price = market.best_price;
        let consensus_prob = market.consensus_prob.unwrap_or(model_prob);
        let prob = self.settings.signals.adjust(fixture, &market.outcome, model_prob);
        Candidate {
            index,
            fixture: fixture.clone(),
            outcome: market.outcome,
            model_prob,
            consensus_prob,
            prob,
            price,
            book: market.best_book.clone(),
            median_price: market.median_price,
            n_books: market.n_books,
            edge: edge(prob, price),
            consensus_edge: edge(consensus_prob, price),
            ev: expected_value(prob, price),
            drift_median: history
                .get(&(fixture.match_id.clone(), market.outcome.label()))
                .copied(),
        }
    }

    /// One full cycle over already-fetched quotes.
    ///
    /// History is read before this cycle's snapshot is appended, so the drift
    /// guard never compares a price against itself. With `journal == false`
    /// nothing is written except the odds snapshot.
    pub fn run_cycle(
        &mut self,
        quotes: &[OddsQuote],
        now: DateTime<Utc>,
        journal: bool,
    ) -> Result<CycleReport> {
        let build = build_consensus(quotes);
        for (match_id, reason) in &build.skipped {
            debug!("Skipping fixture {}: {}", match_id, reason);
        }

        let window = Duration::hours(self.settings.drift_window_hours);
        let history = self.ledger.recent_medians(window, now)?;
        let (candidates, diagnostics) = self.build_candidates(&build.rows, &history);
        let selection = select(&candidates, &self.settings.policy, now);

        let bankroll = self.ledger.bankroll()?;
        let mut picks: Vec<StakedPick> = selection
            .picks
            .into_iter()
            .map(|pick| {
                let c = &pick.candidate;
                let stake = stake_amount(bankroll, c.prob, c.price, self.settings.kelly_fraction);
                StakedPick {
                    pick,
                    stake,
                    journal_id: None,
                }
            })
            .collect();

        let snapshots: Vec<OddsSnapshot> = build
            .rows
            .iter()
            .flat_map(|row| {
                row.markets.iter().map(move |m| OddsSnapshot {
                    match_id: row.fixture.match_id.clone(),
                    outcome: m.outcome.label(),
                    median_odds: m.median_price,
                    n_books: m.n_books,
                    recorded_at: now,
                })
            })
            .collect();

        // Journal rows and the snapshot land together or not at all
        let to_journal: Vec<usize> = if journal {
            (0..picks.len()).filter(|&i| picks[i].stake > 0.0).collect()
        } else {
            Vec::new()
        };
        let entries: Vec<JournalEntry> = to_journal
            .iter()
            .map(|&i| journal_entry(&picks[i].pick, picks[i].stake, now))
            .collect();
        let ids = self.ledger.record_cycle(&entries, &snapshots)?;
        for (&i, id) in to_journal.iter().zip(ids) {
            picks[i].journal_id = Some(id);
        }

        for p in &picks {
            let c = &p.pick.candidate;
            info!(
                "Pick [{}] {} | {} @ {:.2} ({}) p={:.3} edge={:+.3} ev={:+.3} stake={:.2}",
                p.pick.tier,
                c.fixture.teams(),
                c.outcome,
                c.price,
                c.book,
                c.prob,
                c.edge,
                c.ev,
                p.stake
            );
        }

        info!(
            "Cycle: {} quotes, {} fixtures ({} skipped), {} candidates, {} pick(s) across {} tier(s), bankroll {:.2}",
            quotes.len(),
            build.rows.len(),
            build.skipped.len(),
            candidates.len(),
            picks.len(),
            selection.tiers.len(),
            bankroll
        );

        Ok(CycleReport {
            at: now,
            fixtures: build.rows.len(),
            candidates: candidates.len(),
            picks,
            diagnostics,
            skipped: build
                .skipped
                .into_iter()
                .map(|(match_id, e)| SkippedFixture {
                    match_id,
                    reason: e.to_string(),
                })
                .collect(),
            tiers: selection.tiers,
            bankroll,
        })
    }

    pub fn settle(
        &mut self,
        match_id: &str,
        outcome: &Outcome,
        result: BetResult,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<JournalEntry, LedgerError> {
        let entry = self.ledger.settle(match_id, outcome, result, price, now)?;
        info!(
            "Settled {} {} as {} @ {:.2}: pnl {:+.2}, bankroll {:.2} → {:.2}",
            entry.match_id,
            entry.outcome,
            result.as_str(),
            price,
            entry.pnl.unwrap_or(0.0),
            entry.bankroll_before.unwrap_or(0.0),
            entry.bankroll_after.unwrap_or(0.0)
        );
        Ok(entry)
    }
}

fn journal_entry(pick: &Pick, stake: f64, now: DateTime<Utc>) -> JournalEntry {
    let c = &pick.candidate;
    JournalEntry {
        id: None,
        match_id: c.fixture.match_id.clone(),
        sport: c.fixture.sport.clone(),
        league: c.fixture.league.clone(),
        home_team: c.fixture.home_team.clone(),
        away_team: c.fixture.away_team.clone(),
        start_time: c.fixture.start_time,
        market: c.outcome.market().to_string(),
        outcome: c.outcome.label(),
        book: c.book.clone(),
        price: c.price,
        probability: c.prob,
        edge: c.edge,
        ev: c.ev,
        stake,
        tier: pick.tier.as_str().to_string(),
        status: EntryStatus::Open,
        result: None,
        settle_price: None,
        pnl: None,
        bankroll_before: None,
        bankroll_after: None,
        created_at: now,
        settled_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::selection::Tier;
    use crate::db::models::Side;
    use approx::assert_relative_eq;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn fixture(match_id: &str, sport: &str) -> Fixture {
        Fixture {
            match_id: match_id.into(),
            sport: sport.into(),
            league: "test_league".into(),
            home_team: "Home FC".into(),
            away_team: "Away FC".into(),
            start_time: now() + Duration::hours(6),
        }
    }

    fn quote(f: &Fixture, book: &str, outcome: Outcome, price: f64) -> OddsQuote {
        OddsQuote {
            fixture: f.clone(),
            book: book.into(),
            price,
            outcome,
        }
    }

    /// Four books; "b4" is long on the home side.
    fn football_quotes() -> Vec<OddsQuote> {
        let f = fixture("m1", "football");
        let mut quotes = Vec::new();
        for (book, home) in [("b1", 2.0), ("b2", 2.0), ("b3", 2.0), ("b4", 2.35)] {
            quotes.push(quote(&f, book, Outcome::h2h(Side::Home), home));
            quotes.push(quote(&f, book, Outcome::h2h(Side::Draw), 3.5));
            quotes.push(quote(&f, book, Outcome::h2h(Side::Away), 4.0));
            for side in [TotalSide::Over, TotalSide::Under] {
                quotes.push(quote(&f, book, Outcome::Totals { side, line: 2.5 }, 1.9));
            }
        }
        quotes
    }

    fn engine(max_picks: usize) -> PickEngine {
        let mut ledger = Ledger::open(":memory:").unwrap();
        ledger.seed_bankroll(100.0).unwrap();
        let mut settings = EngineSettings::default();
        settings.policy.max_picks = max_picks;
        PickEngine::new(settings, ledger)
    }

    #[test]
    fn cycle_picks_stakes_and_journals() {
        let mut engine = engine(1);
        let report = engine.run_cycle(&football_quotes(), now(), true).unwrap();
        assert_eq!(report.fixtures, 1);
        assert_eq!(report.candidates, 5);
        assert_eq!(report.picks.len(), 1);
        assert_eq!(report.tiers.len(), 1);

        let staked = &report.picks[0];
        assert_eq!(staked.pick.tier, Tier::Strict);
        assert_eq!(staked.pick.candidate.outcome, Outcome::h2h(Side::Home));
        assert_eq!(staked.pick.candidate.book, "b4");
        assert!(staked.stake > 0.0 && staked.stake <= 100.0 * 0.25);
        assert!(staked.journal_id.is_some());

        let open = engine.ledger().open_entries().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].outcome, "home");
        assert_eq!(open[0].tier, "strict");
        assert_eq!(open[0].id, staked.journal_id);
        assert_relative_eq!(open[0].stake, staked.stake, epsilon = 1e-9);

        let history = engine
            .ledger()
            .recent_medians(Duration::hours(36), now())
            .unwrap();
        assert_relative_eq!(
            history[&("m1".to_string(), "home".to_string())],
            2.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn diagnostics_carry_score_model() {
        let engine = engine(3);
        let build = build_consensus(&football_quotes());
        let (candidates, diagnostics) = engine.build_candidates(&build.rows, &HashMap::new());
        assert_eq!(diagnostics.len(), 1);
        let model = diagnostics[0].model.as_ref().unwrap();
        assert_eq!(model.top_scores.len(), 3);
        assert!(model.over(2.5).is_some());
        let over = candidates
            .iter()
            .find(|c| matches!(c.outcome, Outcome::Totals { side: TotalSide::Over, .. }))
            .unwrap();
        let under = candidates
            .iter()
            .find(|c| matches!(c.outcome, Outcome::Totals { side: TotalSide::Under, .. }))
            .unwrap();
        assert_relative_eq!(over.model_prob + under.model_prob, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn dry_cycle_writes_no_journal() {
        let mut engine = engine(3);
        let report = engine.run_cycle(&football_quotes(), now(), false).unwrap();
        assert!(!report.picks.is_empty());
        assert!(report.picks.iter().all(|p| p.journal_id.is_none()));
        assert!(engine.ledger().open_entries().unwrap().is_empty());
        // The odds snapshot is still kept for later drift checks
        let history = engine
            .ledger()
            .recent_medians(Duration::hours(36), now())
            .unwrap();
        assert!(history.contains_key(&("m1".to_string(), "home".to_string())));
    }

    #[test]
    fn two_way_fixture_uses_consensus() {
        let engine = engine(3);
        let f = fixture("t1", "tennis");
        let quotes = vec![
            quote(&f, "b1", Outcome::h2h(Side::Home), 1.8),
            quote(&f, "b1", Outcome::h2h(Side::Away), 2.1),
            quote(&f, "b2", Outcome::h2h(Side::Home), 1.85),
            quote(&f, "b2", Outcome::h2h(Side::Away), 2.0),
        ];
        let build = build_consensus(&quotes);
        let (candidates, diagnostics) = engine.build_candidates(&build.rows, &HashMap::new());
        assert!(diagnostics[0].model.is_none());
        assert_eq!(candidates.len(), 2);
        let home = &candidates[0];
        assert_relative_eq!(home.model_prob, build.rows[0].probs.home, epsilon = 1e-12);
        assert_relative_eq!(home.prob, home.model_prob, epsilon = 1e-12);
    }

    #[test]
    fn history_feeds_drift_median() {
        let engine = engine(3);
        let build = build_consensus(&football_quotes());
        let mut history = HashMap::new();
        history.insert(("m1".to_string(), "home".to_string()), 2.4);
        let (candidates, _) = engine.build_candidates(&build.rows, &history);
        let home = candidates
            .iter()
            .find(|c| c.outcome == Outcome::h2h(Side::Home))
            .unwrap();
        assert_eq!(home.drift_median, Some(2.4));
    }

    #[test]
    fn engine_settles_through_ledger() {
        let mut engine = engine(1);
        engine.run_cycle(&football_quotes(), now(), true).unwrap();
        let entry = engine
            .settle("m1", &Outcome::h2h(Side::Home), BetResult::Loss, 2.35, now())
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Settled);
        let after = engine.ledger().bankroll().unwrap();
        assert_relative_eq!(after, 100.0 - entry.stake, epsilon = 1e-9);
        assert!(engine
            .settle("m1", &Outcome::h2h(Side::Home), BetResult::Loss, 2.35, now())
            .is_err());
    }
}

//! Structured records for whatever delivers picks downstream.
//!
//! Formatting for a chat channel or a dashboard lives outside this crate; the
//! sinks here either write JSON lines or log through `tracing`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use tracing::{info, warn};

use super::strategy::{CycleReport, FixtureDiagnostic, StakedPick};
use crate::odds::{FetchReport, FetchStatus};

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub fixtures: usize,
    pub candidates: usize,
    pub picks: usize,
    pub total_stake: f64,
    pub tiers_evaluated: Vec<String>,
    pub skipped: usize,
    pub bankroll: f64,
}

impl From<&CycleReport> for CycleSummary {
    fn from(r: &CycleReport) -> Self {
        CycleSummary {
            fixtures: r.fixtures,
            candidates: r.candidates,
            picks: r.picks.len(),
            total_stake: r.picks.iter().map(|p| p.stake).sum(),
            tiers_evaluated: r.tiers.iter().map(|t| t.tier.to_string()).collect(),
            skipped: r.skipped.len(),
            bankroll: r.bankroll,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record<'a> {
    Fetch(FetchStatus),
    Diagnostic(&'a FixtureDiagnostic),
    Pick(&'a StakedPick),
    Summary(CycleSummary),
}

pub trait ReportSink {
    fn emit(&mut self, record: &Record<'_>) -> Result<()>;
}

/// One JSON object per line.
pub struct JsonLinesSink<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        JsonLinesSink { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ReportSink for JsonLinesSink<W> {
    fn emit(&mut self, record: &Record<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.out, record).context("Failed to serialize record")?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Human-readable lines through `tracing`.
pub struct LogSink;

impl ReportSink for LogSink {
    fn emit(&mut self, record: &Record<'_>) -> Result<()> {
        match record {
            Record::Fetch(s) if !s.ok => warn!(
                "Fetch {} via {} failed: {}",
                s.sport_key,
                s.provider,
                s.error.as_deref().unwrap_or("unknown error")
            ),
            Record::Fetch(_) => {}
            Record::Diagnostic(d) => match &d.model {
                Some(m) => {
                    let scores: Vec<String> = m
                        .top_scores
                        .iter()
                        .map(|s| format!("{}-{} ({:.1}%)", s.home_goals, s.away_goals, s.probability * 100.0))
                        .collect();
                    let totals: Vec<String> = m
                        .totals_over
                        .iter()
                        .map(|(line, p)| format!("O{} {:.1}%", line, p * 100.0))
                        .collect();
                    info!(
                        "{} | {} | xG {} | H/D/A {:.1}/{:.1}/{:.1}% | {} | {}",
                        d.fixture.start_time.format("%Y-%m-%d %H:%M"),
                        d.fixture.teams(),
                        m.expected_score(),
                        m.hda.home * 100.0,
                        m.hda.draw * 100.0,
                        m.hda.away * 100.0,
                        scores.join(", "),
                        totals.join(", ")
                    );
                }
                None => info!(
                    "{} | {} | consensus {:.1}/{:.1}% ({} books)",
                    d.fixture.start_time.format("%Y-%m-%d %H:%M"),
                    d.fixture.teams(),
                    d.consensus.home * 100.0,
                    d.consensus.away * 100.0,
                    d.n_books
                ),
            },
            Record::Pick(p) => {
                let c = &p.pick.candidate;
                info!(
                    "✅ [{}] {} | {} @ {:.2} ({}) | p={:.1}% edge={:+.1}% EV={:+.1}% | stake {:.2}",
                    p.pick.tier,
                    c.fixture.teams(),
                    c.outcome,
                    c.price,
                    c.book,
                    c.prob * 100.0,
                    c.edge * 100.0,
                    c.ev * 100.0,
                    p.stake
                );
            }
            Record::Summary(s) => info!(
                "{} pick(s) from {} candidate(s) over {} fixture(s); tiers [{}]; staked {:.2} of {:.2}",
                s.picks,
                s.candidates,
                s.fixtures,
                s.tiers_evaluated.join(", "),
                s.total_stake,
                s.bankroll
            ),
        }
        Ok(())
    }
}

/// Emit fetch statuses, per-fixture diagnostics, picks and a summary, in that order.
pub fn emit_cycle(
    sink: &mut dyn ReportSink,
    fetch: Option<&FetchReport>,
    cycle: &CycleReport,
) -> Result<()> {
    if let Some(fetch) = fetch {
        for attempt in &fetch.attempts {
            sink.emit(&Record::Fetch(FetchStatus::from(attempt)))?;
        }
    }
    for d in &cycle.diagnostics {
        sink.emit(&Record::Diagnostic(d))?;
    }
    for p in &cycle.picks {
        sink.emit(&Record::Pick(p))?;
    }
    sink.emit(&Record::Summary(CycleSummary::from(cycle)))
}

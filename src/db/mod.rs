use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub mod models;
use models::*;

use crate::bot::consensus::median;
use crate::bot::kelly::round_cents;

const BANKROLL_KEY: &str = "main";

/// Settlement and bankroll failures. None of them leave a partial write.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no journal entry for {match_id} / {outcome}")]
    NotFound { match_id: String, outcome: String },
    #[error("journal entry for {match_id} / {outcome} is already settled")]
    AlreadySettled { match_id: String, outcome: String },
    #[error("invalid settlement price {0}")]
    InvalidPrice(f64),
    #[error("bankroll has not been seeded")]
    BankrollUnset,
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// SQLite-backed journal, odds history and bankroll.
///
/// Owns the only connection; every mutation takes `&mut self`, so one
/// process is the single writer for the bankroll read-modify-write.
pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Open (or create) the ledger at `path`. `":memory:"` gives a throwaway store.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger database {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let ledger = Ledger { conn };
        ledger.run_migrations()?;
        Ok(ledger)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_SQL)
            .context("Failed to run ledger migrations")?;
        Ok(())
    }

    // ── Bankroll ─────────────────────────────────────────────────────────────

    /// Seed the bankroll if it has never been set. Returns whether a row was written.
    pub fn seed_bankroll(&mut self, initial: f64) -> Result<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO bankroll (key, balance, updated_at) VALUES (?1, ?2, ?3)",
            params![BANKROLL_KEY, round_cents(initial), Utc::now()],
        )?;
        Ok(n > 0)
    }

    pub fn bankroll(&self) -> Result<f64, LedgerError> {
        read_bankroll(&self.conn)?.ok_or(LedgerError::BankrollUnset)
    }

    // ── Journal ──────────────────────────────────────────────────────────────

    /// Append an open journal entry and return its row id.
    #[allow(dead_code)]
    pub fn record_pick(&mut self, entry: &JournalEntry) -> Result<i64> {
        Ok(insert_entry(&self.conn, entry)?)
    }

    /// Journal a cycle's picks and append its odds snapshot in one transaction.
    /// Returns the new entry ids in input order; on any error nothing is written.
    pub fn record_cycle(
        &mut self,
        entries: &[JournalEntry],
        snapshots: &[OddsSnapshot],
    ) -> Result<Vec<i64>> {
        let tx = self.conn.transaction()?;
        let ids = entries
            .iter()
            .map(|e| insert_entry(&tx, e))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        insert_snapshots(&tx, snapshots)?;
        tx.commit()?;
        Ok(ids)
    }

    /// Settle the most recently created open entry for `(match_id, outcome)`.
    ///
    /// Profit is applied to the bankroll and both snapshots are written to the
    /// entry in one transaction. On any error nothing is written.
    pub fn settle(
        &mut self,
        match_id: &str,
        outcome: &Outcome,
        result: BetResult,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<JournalEntry, LedgerError> {
        if !price.is_finite() || price <= 0.0 || (result == BetResult::Win && price <= 1.0) {
            return Err(LedgerError::InvalidPrice(price));
        }
        let label = outcome.label();

        let tx = self.conn.transaction()?;
        let open: Option<(i64, f64)> = tx
            .query_row(
                "SELECT id, stake FROM journal
                 WHERE match_id=?1 AND outcome=?2 AND status='open'
                 ORDER BY id DESC LIMIT 1",
                params![match_id, label],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let (id, stake) = match open {
            Some(found) => found,
            None => {
                let any: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM journal WHERE match_id=?1 AND outcome=?2",
                    params![match_id, label],
                    |r| r.get(0),
                )?;
                let match_id = match_id.to_string();
                return Err(if any > 0 {
                    LedgerError::AlreadySettled { match_id, outcome: label }
                } else {
                    LedgerError::NotFound { match_id, outcome: label }
                });
            }
        };

        let before = read_bankroll(&tx)?.ok_or(LedgerError::BankrollUnset)?;
        let pnl = round_cents(result.profit(stake, price));
        let after = round_cents(before + pnl);

        tx.execute(
            "UPDATE bankroll SET balance=?1, updated_at=?2 WHERE key=?3",
            params![after, now, BANKROLL_KEY],
        )?;
        tx.execute(
            "UPDATE journal SET status=?1, result=?2, settle_price=?3, pnl=?4,
                    bankroll_before=?5, bankroll_after=?6, settled_at=?7
             WHERE id=?8",
            params![EntryStatus::Settled, result, price, pnl, before, after, now, id],
        )?;
        let entry = tx.query_row(
            &format!("SELECT {} FROM journal WHERE id=?1", JOURNAL_COLUMNS),
            params![id],
            map_entry,
        )?;
        tx.commit()?;
        Ok(entry)
    }

    /// All entries, newest first (paginated)
    pub fn list_entries(&self, limit: i64, offset: i64) -> Result<Vec<JournalEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM journal ORDER BY id DESC LIMIT ?1 OFFSET ?2",
            JOURNAL_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![limit, offset], map_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn open_entries(&self) -> Result<Vec<JournalEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM journal WHERE status='open' ORDER BY id DESC",
            JOURNAL_COLUMNS
        ))?;
        let entries = stmt
            .query_map([], map_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    // ── Odds history ─────────────────────────────────────────────────────────

    #[allow(dead_code)]
    pub fn append_odds_snapshot(&mut self, rows: &[OddsSnapshot]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        insert_snapshots(&tx, rows)?;
        tx.commit()?;
        Ok(rows.len())
    }

    /// Median of recorded medians per `(match_id, outcome)` within `window` of `now`.
    pub fn recent_medians(
        &self,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<HashMap<(String, String), f64>> {
        let cutoff = (now - window).timestamp();
        let mut stmt = self.conn.prepare(
            "SELECT match_id, outcome, median_odds FROM odds_history
             WHERE recorded_at >= ?1 AND recorded_at <= ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, now.timestamp()], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, f64>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut grouped: HashMap<(String, String), Vec<f64>> = HashMap::new();
        for (match_id, outcome, odds) in rows {
            grouped.entry((match_id, outcome)).or_default().push(odds);
        }
        Ok(grouped
            .into_iter()
            .filter_map(|(key, values)| median(&values).map(|m| (key, m)))
            .collect())
    }

    // ── Stats ────────────────────────────────────────────────────────────────

    pub fn stats(&self) -> Result<Stats> {
        let conn = &self.conn;
        let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };
        let settled = count("SELECT COUNT(*) FROM journal WHERE status='settled'")?;
        let wins = count("SELECT COUNT(*) FROM journal WHERE result='win'")?;
        let losses = count("SELECT COUNT(*) FROM journal WHERE result='loss'")?;
        let pushes = count("SELECT COUNT(*) FROM journal WHERE result='push'")?;
        let open_entries = count("SELECT COUNT(*) FROM journal WHERE status='open'")?;
        let (total_pnl, total_staked): (f64, f64) = conn.query_row(
            "SELECT COALESCE(SUM(pnl),0), COALESCE(SUM(stake),0) FROM journal WHERE status='settled'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let avg_edge: Option<f64> =
            conn.query_row("SELECT AVG(edge) FROM journal WHERE status='settled'", [], |r| {
                r.get(0)
            })?;
        Ok(Stats {
            settled,
            wins,
            losses,
            pushes,
            open_entries,
            win_rate: if settled > 0 {
                wins as f64 / settled as f64
            } else {
                0.0
            },
            total_pnl: round_cents(total_pnl),
            total_staked: round_cents(total_staked),
            roi: if total_staked > 0.0 {
                total_pnl / total_staked
            } else {
                0.0
            },
            avg_edge: avg_edge.unwrap_or(0.0),
            bankroll: read_bankroll(conn)?,
        })
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn insert_entry(conn: &Connection, entry: &JournalEntry) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO journal (
            match_id, sport, league, home_team, away_team, start_time,
            market, outcome, book, price, probability, edge, ev, stake,
            tier, status, created_at
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
        params![
            entry.match_id,
            entry.sport,
            entry.league,
            entry.home_team,
            entry.away_team,
            entry.start_time,
            entry.market,
            entry.outcome,
            entry.book,
            entry.price,
            entry.probability,
            entry.edge,
            entry.ev,
            entry.stake,
            entry.tier,
            EntryStatus::Open,
            entry.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_snapshots(conn: &Connection, rows: &[OddsSnapshot]) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO odds_history (match_id, outcome, median_odds, n_books, recorded_at)
         VALUES (?1,?2,?3,?4,?5)",
    )?;
    for row in rows {
        stmt.execute(params![
            row.match_id,
            row.outcome,
            row.median_odds,
            row.n_books as i64,
            row.recorded_at.timestamp(),
        ])?;
    }
    Ok(())
}

fn read_bankroll(conn: &Connection) -> rusqlite::Result<Option<f64>> {
    conn.query_row(
        "SELECT balance FROM bankroll WHERE key=?1",
        params![BANKROLL_KEY],
        |r| r.get(0),
    )
    .optional()
}

const JOURNAL_COLUMNS: &str = "id, match_id, sport, league, home_team, away_team, start_time,
    market, outcome, book, price, probability, edge, ev, stake, tier, status,
    result, settle_price, pnl, bankroll_before, bankroll_after, created_at, settled_at";

fn map_entry(row: &rusqlite::Row) -> rusqlite::Result<JournalEntry> {
    Ok(JournalEntry {
        id: row.get(0)?,
        match_id: row.get(1)?,
        sport: row.get(2)?,
        league: row.get(3)?,
        home_team: row.get(4)?,
        away_team: row.get(5)?,
        start_time: row.get(6)?,
        market: row.get(7)?,
        outcome: row.get(8)?,
        book: row.get(9)?,
        price: row.get(10)?,
        probability: row.get(11)?,
        edge: row.get(12)?,
        ev: row.get(13)?,
        stake: row.get(14)?,
        tier: row.get(15)?,
        status: row.get(16)?,
        result: row.get(17)?,
        settle_price: row.get(18)?,
        pnl: row.get(19)?,
        bankroll_before: row.get(20)?,
        bankroll_after: row.get(21)?,
        created_at: row.get(22)?,
        settled_at: row.get(23)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS bankroll (
    key         TEXT    PRIMARY KEY,
    balance     REAL    NOT NULL,
    updated_at  TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS journal (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    match_id         TEXT    NOT NULL,
    sport            TEXT    NOT NULL,
    league           TEXT    NOT NULL,
    home_team        TEXT    NOT NULL,
    away_team        TEXT    NOT NULL,
    start_time       TEXT    NOT NULL,
    market           TEXT    NOT NULL,
    outcome          TEXT    NOT NULL,
    book             TEXT    NOT NULL,
    price            REAL    NOT NULL,
    probability      REAL    NOT NULL,
    edge             REAL    NOT NULL,
    ev               REAL    NOT NULL,
    stake            REAL    NOT NULL,
    tier             TEXT    NOT NULL,
    status           TEXT    NOT NULL DEFAULT 'open',
    result           TEXT,
    settle_price     REAL,
    pnl              REAL,
    bankroll_before  REAL,
    bankroll_after   REAL,
    created_at       TEXT    NOT NULL,
    settled_at       TEXT
);

CREATE TABLE IF NOT EXISTS odds_history (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    match_id     TEXT    NOT NULL,
    outcome      TEXT    NOT NULL,
    median_odds  REAL    NOT NULL,
    n_books      INTEGER NOT NULL,
    recorded_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_journal_key ON journal(match_id, outcome, status);
CREATE INDEX IF NOT EXISTS idx_odds_history_time ON odds_history(recorded_at);
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub settled: i64,
    pub wins: i64,
    pub losses: i64,
    pub pushes: i64,
    pub open_entries: i64,
    /// Wins over all settled bets, pushes included
    pub win_rate: f64,
    pub total_pnl: f64,
    pub total_staked: f64,
    pub roi: f64,
    /// Mean edge of settled bets
    pub avg_edge: f64,
    pub bankroll: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ledger(balance: f64) -> Ledger {
        let mut ledger = Ledger::open(":memory:").unwrap();
        ledger.seed_bankroll(balance).unwrap();
        ledger
    }

    fn entry(match_id: &str, outcome: &str, stake: f64) -> JournalEntry {
        let now = Utc::now();
        JournalEntry {
            id: None,
            match_id: match_id.into(),
            sport: "football".into(),
            league: "soccer_epl".into(),
            home_team: "Arsenal".into(),
            away_team: "Chelsea".into(),
            start_time: now + Duration::hours(5),
            market: "h2h".into(),
            outcome: outcome.into(),
            book: "pinnacle".into(),
            price: 2.10,
            probability: 0.55,
            edge: 0.074,
            ev: 0.155,
            stake,
            tier: "strict".into(),
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

    fn home() -> Outcome {
        Outcome::h2h(Side::Home)
    }

    #[test]
    fn seeding_never_overwrites() {
        let mut l = ledger(100.0);
        assert!(!l.seed_bankroll(50.0).unwrap());
        assert_relative_eq!(l.bankroll().unwrap(), 100.0, epsilon = 1e-9);
    }

    #[test]
    fn win_settlement_applies_profit() {
        let mut l = ledger(100.0);
        l.record_pick(&entry("m1", "home", 10.0)).unwrap();
        let settled = l.settle("m1", &home(), BetResult::Win, 2.10, Utc::now()).unwrap();
        assert_eq!(settled.status, EntryStatus::Settled);
        assert_eq!(settled.result, Some(BetResult::Win));
        assert_relative_eq!(settled.pnl.unwrap(), 11.0, epsilon = 1e-9);
        assert_relative_eq!(settled.bankroll_before.unwrap(), 100.0, epsilon = 1e-9);
        assert_relative_eq!(settled.bankroll_after.unwrap(), 111.0, epsilon = 1e-9);
        assert_relative_eq!(l.bankroll().unwrap(), 111.0, epsilon = 1e-9);
    }

    #[test]
    fn second_settle_fails_and_keeps_bankroll() {
        let mut l = ledger(100.0);
        l.record_pick(&entry("m1", "home", 10.0)).unwrap();
        l.settle("m1", &home(), BetResult::Win, 2.10, Utc::now()).unwrap();
        let err = l.settle("m1", &home(), BetResult::Win, 2.10, Utc::now()).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadySettled { .. }));
        assert_relative_eq!(l.bankroll().unwrap(), 111.0, epsilon = 1e-9);
    }

    #[test]
    fn unknown_key_is_not_found() {
        let mut l = ledger(100.0);
        l.record_pick(&entry("m1", "home", 10.0)).unwrap();
        let err = l
            .settle("m1", &Outcome::h2h(Side::Away), BetResult::Loss, 1.9, Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
        assert_relative_eq!(l.bankroll().unwrap(), 100.0, epsilon = 1e-9);
        assert_eq!(l.open_entries().unwrap().len(), 1);
    }

    #[test]
    fn latest_open_duplicate_is_settled_first() {
        let mut l = ledger(100.0);
        let first = l.record_pick(&entry("m1", "home", 5.0)).unwrap();
        let second = l.record_pick(&entry("m1", "home", 8.0)).unwrap();
        let a = l.settle("m1", &home(), BetResult::Loss, 2.10, Utc::now()).unwrap();
        assert_eq!(a.id, Some(second));
        assert_relative_eq!(l.bankroll().unwrap(), 92.0, epsilon = 1e-9);
        let b = l.settle("m1", &home(), BetResult::Push, 2.10, Utc::now()).unwrap();
        assert_eq!(b.id, Some(first));
        assert_relative_eq!(b.bankroll_before.unwrap(), 92.0, epsilon = 1e-9);
        assert_relative_eq!(b.bankroll_after.unwrap(), 92.0, epsilon = 1e-9);
    }

    #[test]
    fn invalid_win_price_leaves_entry_open() {
        let mut l = ledger(100.0);
        l.record_pick(&entry("m1", "home", 10.0)).unwrap();
        for price in [1.0, 0.0, f64::NAN] {
            let err = l.settle("m1", &home(), BetResult::Win, price, Utc::now()).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidPrice(_)));
        }
        assert_eq!(l.open_entries().unwrap().len(), 1);
        assert_relative_eq!(l.bankroll().unwrap(), 100.0, epsilon = 1e-9);
    }

    #[test]
    fn settle_without_bankroll_fails() {
        let mut l = Ledger::open(":memory:").unwrap();
        l.record_pick(&entry("m1", "home", 10.0)).unwrap();
        let err = l.settle("m1", &home(), BetResult::Win, 2.0, Utc::now()).unwrap_err();
        assert!(matches!(err, LedgerError::BankrollUnset));
        assert_eq!(l.open_entries().unwrap().len(), 1);
    }

    #[test]
    fn recent_medians_respect_window() {
        let mut l = ledger(100.0);
        let now = Utc::now();
        let snap = |odds: f64, hours: i64| OddsSnapshot {
            match_id: "m1".into(),
            outcome: "home".into(),
            median_odds: odds,
            n_books: 4,
            recorded_at: now - Duration::hours(hours),
        };
        l.append_odds_snapshot(&[snap(2.0, 1), snap(2.2, 2), snap(5.0, 40)])
            .unwrap();
        let medians = l.recent_medians(Duration::hours(36), now).unwrap();
        assert_eq!(medians.len(), 1);
        let m = medians[&("m1".to_string(), "home".to_string())];
        assert_relative_eq!(m, 2.1, epsilon = 1e-9);
    }

    #[test]
    fn stats_summarise_settled_entries() {
        let mut l = ledger(100.0);
        l.record_pick(&entry("m1", "home", 10.0)).unwrap();
        l.record_pick(&entry("m2", "home", 10.0)).unwrap();
        l.record_pick(&entry("m3", "home", 10.0)).unwrap();
        let mut open = entry("m4", "home", 10.0);
        open.edge = 0.5;
        l.record_pick(&open).unwrap();
        l.settle("m1", &home(), BetResult::Win, 2.10, Utc::now()).unwrap();
        l.settle("m2", &home(), BetResult::Loss, 2.10, Utc::now()).unwrap();
        l.settle("m3", &home(), BetResult::Push, 2.10, Utc::now()).unwrap();
        let stats = l.stats().unwrap();
        assert_eq!(stats.settled, 3);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.pushes, 1);
        assert_eq!(stats.open_entries, 1);
        assert_relative_eq!(stats.total_pnl, 1.0, epsilon = 1e-9);
        assert_relative_eq!(stats.roi, 1.0 / 30.0, epsilon = 1e-9);
        // Pushes count in the denominator
        assert_relative_eq!(stats.win_rate, 1.0 / 3.0, epsilon = 1e-9);
        // The open entry's edge is left out
        assert_relative_eq!(stats.avg_edge, 0.074, epsilon = 1e-9);
        assert_relative_eq!(stats.bankroll.unwrap(), 101.0, epsilon = 1e-9);
        assert_eq!(l.list_entries(10, 0).unwrap().len(), 4);
    }

    fn snapshot(match_id: &str) -> OddsSnapshot {
        OddsSnapshot {
            match_id: match_id.into(),
            outcome: "home".into(),
            median_odds: 2.1,
            n_books: 4,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn record_cycle_writes_entries_and_snapshots() {
        let mut l = ledger(100.0);
        let ids = l
            .record_cycle(
                &[entry("m1", "home", 5.0), entry("m2", "away", 4.0)],
                &[snapshot("m1"), snapshot("m2")],
            )
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);
        assert_eq!(l.open_entries().unwrap().len(), 2);
        let medians = l.recent_medians(Duration::hours(1), Utc::now()).unwrap();
        assert_eq!(medians.len(), 2);
    }

    #[test]
    fn failed_cycle_writes_nothing() {
        let mut l = ledger(100.0);
        let mut bad = entry("m2", "home", 4.0);
        // SQLite stores NaN as NULL, which the NOT NULL column rejects
        bad.price = f64::NAN;
        let err = l.record_cycle(&[entry("m1", "home", 5.0), bad], &[snapshot("m1")]);
        assert!(err.is_err());
        assert!(l.list_entries(10, 0).unwrap().is_empty());
        let medians = l.recent_medians(Duration::hours(1), Utc::now()).unwrap();
        assert!(medians.is_empty());
        assert_relative_eq!(l.bankroll().unwrap(), 100.0, epsilon = 1e-9);
    }
}

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

mod bot;
mod config;
mod db;
mod odds;

use bot::report::{emit_cycle, JsonLinesSink, LogSink, ReportSink};
use bot::PickEngine;
use config::{Command, Config};
use db::{Ledger, LedgerError};
use odds::{collect_quotes, OddsProvider, TheOddsApi};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    config.validate()?;

    let mut ledger = Ledger::open(&config.database_path)?;
    info!("Ledger opened: {}", config.database_path);
    if ledger.seed_bankroll(config.initial_balance)? {
        info!("Initial bankroll recorded: {:.2}", config.initial_balance);
    }

    match &config.command {
        Command::Picks { no_journal, json } => {
            let provider: Arc<dyn OddsProvider> = Arc::new(TheOddsApi::new(
                &config.odds_api_url,
                config.odds_api_key.clone(),
                &config.odds_regions,
                config.fetch_timeout(),
            )?);
            let fetch =
                collect_quotes(provider, &config.odds_sports, config.fetch_timeout()).await;
            if fetch.quotes.is_empty() {
                warn!("No quotes available this cycle");
            }

            let mut engine = PickEngine::new(config.engine_settings()?, ledger);
            let report = engine.run_cycle(&fetch.quotes, Utc::now(), !no_journal)?;

            let mut sink: Box<dyn ReportSink> = if *json {
                Box::new(JsonLinesSink::new(std::io::stdout().lock()))
            } else {
                Box::new(LogSink)
            };
            emit_cycle(sink.as_mut(), Some(&fetch), &report)?;
        }
        Command::Settle {
            match_id,
            outcome,
            result,
            price,
        } => {
            let mut engine = PickEngine::new(config.engine_settings()?, ledger);
            match engine.settle(match_id, outcome, *result, *price, Utc::now()) {
                Ok(_) => {}
                Err(e @ (LedgerError::NotFound { .. } | LedgerError::AlreadySettled { .. })) => {
                    anyhow::bail!("Settlement rejected, bankroll unchanged: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Status { limit, json } => {
            let stats = ledger.stats()?;
            let entries = ledger.list_entries(*limit, 0)?;
            if *json {
                let out = serde_json::json!({ "stats": stats, "entries": entries });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                info!(
                    "Bankroll {:.2} | settled {} (W{} L{} P{}) | win rate {:.1}% | PnL {:+.2} | ROI {:+.1}% | avg edge {:.1}% | open {}",
                    stats.bankroll.unwrap_or(0.0),
                    stats.settled,
                    stats.wins,
                    stats.losses,
                    stats.pushes,
                    stats.win_rate * 100.0,
                    stats.total_pnl,
                    stats.roi * 100.0,
                    stats.avg_edge * 100.0,
                    stats.open_entries
                );
                for e in &entries {
                    info!(
                        "#{} {} {} vs {} | {} @ {:.2} ({}) stake {:.2} [{}] {}",
                        e.id.unwrap_or_default(),
                        e.start_time.format("%Y-%m-%d %H:%M"),
                        e.home_team,
                        e.away_team,
                        e.outcome,
                        e.price,
                        e.book,
                        e.stake,
                        e.tier,
                        match (e.result, e.pnl) {
                            (Some(r), Some(pnl)) => format!("{} {:+.2}", r.as_str(), pnl),
                            _ => e.status.as_str().to_string(),
                        }
                    );
                }
            }
        }
    }

    Ok(())
}

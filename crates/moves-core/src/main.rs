//! Binary entrypoint (spec C13), grounded on `trading-agent::main`'s
//! startup sequence: load env, init tracing, load+validate config, safety
//! gate for live trading, connectivity checks, then a `tokio::select!` loop
//! against the scheduler and SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::signal::unix::SignalKind;
use tokio::time;

use broker_core::Broker;
use moves_audit::AuditLog;
use moves_store::Store;
use pricing_service::{FinnhubSource, PricingService};
use risk_manager::{EarningsCalendar, RiskManager};
use scheduler::{Scheduler, Trigger};
use signal_engine::SignalEngine;
use thesis_engine::ThesisEngine;

mod config;
mod core;
mod error;

use config::{Mode, MovesConfig};
use core::CoreOrchestrator;

const DEFAULT_ACCOUNT_ID: i64 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting investment operations engine");

    let config = match MovesConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Configuration invalid: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!("Configuration loaded and validated (mode: {:?})", config.mode);

    if config.mode == Mode::Live {
        let approved = std::env::var("MOVES_LIVE_TRADING_APPROVED")
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        if !approved {
            tracing::error!(
                "MOVES_MODE=live requires MOVES_LIVE_TRADING_APPROVED=yes to confirm real money is at risk."
            );
            std::process::exit(1);
        }
        tracing::warn!("LIVE TRADING MODE — REAL MONEY AT RISK");
    } else {
        tracing::info!("Mock trading mode (simulated fills against live quotes)");
    }

    let store = Store::connect(&config.database_url()).await?;
    tracing::info!("Database connected and migrated");

    sqlx::query("SELECT 1")
        .execute(store.pool())
        .await
        .map_err(|e| anyhow::anyhow!("Database connectivity check failed: {e}"))?;

    let audit = AuditLog::new(store.clone());

    let Some(api_key) = config.finnhub_api_key.clone() else {
        bail!("MOVES_FINNHUB_API_KEY must be set; no other quote source is wired in.");
    };
    let pricing = Arc::new(PricingService::new(Arc::new(FinnhubSource::new(api_key, config.yfinance_delay))));

    let risk = RiskManager::new(store.clone(), audit.clone(), Arc::clone(&pricing), Arc::new(EarningsCalendar::default()));
    risk.seed_default_limits().await?;
    tracing::info!("Risk manager initialized with default limits");

    let broker: Arc<dyn Broker> = match config.mode {
        Mode::Mock => Arc::new(mock_broker::MockBroker::new(
            store.clone(),
            Arc::clone(&pricing),
            audit.clone(),
            DEFAULT_ACCOUNT_ID,
        )),
        Mode::Live => Arc::new(live_broker::LiveBroker::from_env()?),
    };

    match broker.get_account_balance().await {
        Ok(balance) => tracing::info!("Startup check: broker OK (cash ${})", balance.cash),
        Err(e) => tracing::warn!("Startup check: broker unreachable ({e}), continuing anyway"),
    }

    let orchestrator = Arc::new(CoreOrchestrator::new(
        store.clone(),
        audit.clone(),
        Arc::clone(&broker),
        DEFAULT_ACCOUNT_ID,
        config.mode,
        Arc::clone(&pricing),
        Arc::new(EarningsCalendar::default()),
    ));

    let report = orchestrator.startup().await?;
    tracing::info!(
        "Startup report: {} ({} pending signals, {} risk limits, kill switch {})",
        report.status,
        report.pending_signals,
        report.risk_limits_count,
        if report.kill_switch_active { "ACTIVE" } else { "off" }
    );
    for warning in &report.warnings {
        tracing::warn!("Startup warning: {warning}");
    }

    let sched = Arc::new(Scheduler::new(store.clone()));
    sched.register_default_jobs().await?;
    wire_job_bodies(&sched, store.clone(), audit.clone(), Arc::clone(&pricing), Arc::clone(&broker)).await?;
    tracing::info!("Scheduler initialized with default jobs");

    tracing::info!("Engine is now running. Tick interval 30s. Press Ctrl+C to stop.");

    let mut interval = time::interval(Duration::from_secs(30));
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match sched.run_due(Utc::now()).await {
                    Ok(fired) if !fired.is_empty() => tracing::info!("Fired jobs: {:?}", fired),
                    Ok(_) => {}
                    Err(e) => tracing::error!("Scheduler tick failed: {e}"),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, exiting gracefully...");
                break;
            }
        }
    }

    tracing::info!("Engine shut down.");
    Ok(())
}

/// Replaces the scheduler's no-op default job bodies with real closures
/// over the engines they drive, per `original_source/moves/engine/scheduler.py`'s
/// job registry mapping job names to bound methods.
async fn wire_job_bodies(
    sched: &Scheduler,
    store: Store,
    audit: AuditLog,
    pricing: Arc<PricingService>,
    broker: Arc<dyn Broker>,
) -> Result<()> {
    {
        let pricing = Arc::clone(&pricing);
        let store = store.clone();
        sched
            .add_job(
                "price_update",
                Trigger::cron(&(0..60).step_by(15).collect::<Vec<_>>(), &(9..=15).collect::<Vec<_>>(), &[], chrono_tz::America::New_York),
                std::sync::Arc::new(move || {
                    let pricing = Arc::clone(&pricing);
                    let store = store.clone();
                    Box::pin(async move {
                        let symbols: Vec<(String,)> =
                            sqlx::query_as("SELECT DISTINCT symbol FROM positions WHERE shares != 0")
                                .fetch_all(store.pool())
                                .await?;
                        let symbols: Vec<String> = symbols.into_iter().map(|(s,)| s).collect();
                        pricing.get_prices(&symbols).await;
                        Ok(())
                    })
                }),
            )
            .await?;
    }

    {
        let store = store.clone();
        let broker = Arc::clone(&broker);
        sched
            .add_job(
                "nav_snapshot",
                Trigger::cron(&[15], &[16], &[], chrono_tz::America::New_York),
                std::sync::Arc::new(move || {
                    let store = store.clone();
                    let broker = Arc::clone(&broker);
                    Box::pin(async move {
                        let balance = broker.get_account_balance().await?;
                        sqlx::query(
                            "INSERT INTO portfolio_values (date, total_value, cash) VALUES (date('now'), ?, ?)
                             ON CONFLICT(date) DO UPDATE SET total_value = excluded.total_value, cash = excluded.cash",
                        )
                        .bind(balance.total_value.to_string().parse::<f64>().unwrap_or(0.0))
                        .bind(balance.cash.to_string().parse::<f64>().unwrap_or(0.0))
                        .execute(store.pool())
                        .await?;
                        Ok(())
                    })
                }),
            )
            .await?;
    }

    {
        let store = store.clone();
        let audit = audit.clone();
        let pricing = Arc::clone(&pricing);
        sched
            .add_job(
                "signal_expiry",
                Trigger::Interval(std::time::Duration::from_secs(3600)),
                std::sync::Arc::new(move || {
                    let signals = SignalEngine::new(store.clone(), audit.clone(), Arc::clone(&pricing));
                    Box::pin(async move {
                        signals.expire_stale(72).await?;
                        Ok(())
                    })
                }),
            )
            .await?;
    }

    {
        let store = store.clone();
        let pricing = Arc::clone(&pricing);
        sched
            .add_job(
                "whatif_update",
                Trigger::cron(&[30], &[16], &[], chrono_tz::America::New_York),
                std::sync::Arc::new(move || {
                    let whatif = whatif_engine::WhatIfEngine::new(store.clone(), Arc::clone(&pricing));
                    Box::pin(async move {
                        whatif.update_all().await?;
                        Ok(())
                    })
                }),
            )
            .await?;
    }

    {
        let store = store.clone();
        let audit = audit.clone();
        let pricing = Arc::clone(&pricing);
        sched
            .add_job(
                "exposure_snapshot",
                Trigger::cron(
                    &[0],
                    &(9..=16).collect::<Vec<_>>(),
                    &[chrono::Weekday::Mon, chrono::Weekday::Tue, chrono::Weekday::Wed, chrono::Weekday::Thu, chrono::Weekday::Fri],
                    chrono_tz::America::New_York,
                ),
                std::sync::Arc::new(move || {
                    let store = store.clone();
                    let risk = RiskManager::new(
                        store.clone(),
                        audit.clone(),
                        Arc::clone(&pricing),
                        Arc::new(EarningsCalendar::default()),
                    );
                    let pricing = Arc::clone(&pricing);
                    Box::pin(async move {
                        let exposure = risk.calculate_exposure(DEFAULT_ACCOUNT_ID).await?;

                        let positions: Vec<(String, f64, f64, String)> = sqlx::query_as(
                            "SELECT symbol, shares, average_cost, side FROM positions WHERE account_id = ? AND shares != 0",
                        )
                        .bind(DEFAULT_ACCOUNT_ID)
                        .fetch_all(store.pool())
                        .await?;

                        let mut by_symbol = std::collections::HashMap::new();
                        let mut by_sector: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
                        for (symbol, shares, average_cost, side) in &positions {
                            let quote = pricing.get_price(symbol).await;
                            let price = if quote.price > rust_decimal::Decimal::ZERO {
                                quote.price.to_string().parse::<f64>().unwrap_or(*average_cost)
                            } else {
                                *average_cost
                            };
                            let signed = if side == "short" { -shares * price } else { shares * price };
                            by_symbol.insert(symbol.clone(), signed);

                            if let Some(fundamentals) = pricing.get_fundamentals(symbol).await {
                                if let Some(sector) = fundamentals.sector {
                                    *by_sector.entry(sector).or_insert(0.0) += signed.abs();
                                }
                            }
                        }

                        sqlx::query(
                            "INSERT INTO exposure_snapshots (date, gross_value, net_value, long_value, short_value, by_sector, by_symbol)
                             VALUES (date('now'), ?, ?, ?, ?, ?, ?)
                             ON CONFLICT(date) DO UPDATE SET gross_value = excluded.gross_value, net_value = excluded.net_value,
                                 long_value = excluded.long_value, short_value = excluded.short_value,
                                 by_sector = excluded.by_sector, by_symbol = excluded.by_symbol",
                        )
                        .bind(exposure.gross_value)
                        .bind(exposure.net_value)
                        .bind(exposure.long_value)
                        .bind(exposure.short_value)
                        .bind(serde_json::to_string(&by_sector).unwrap_or_else(|_| "{}".to_string()))
                        .bind(serde_json::to_string(&by_symbol).unwrap_or_else(|_| "{}".to_string()))
                        .execute(store.pool())
                        .await?;

                        Ok(())
                    })
                }),
            )
            .await?;
    }

    {
        let store = store.clone();
        sched
            .add_job(
                "stale_thesis_check",
                Trigger::cron(&[0], &[8], &[chrono::Weekday::Mon], chrono_tz::America::New_York),
                std::sync::Arc::new(move || {
                    let thesis = ThesisEngine::new(store.clone(), AuditLog::new(store.clone()));
                    Box::pin(async move {
                        thesis.stale_active(30).await?;
                        Ok(())
                    })
                }),
            )
            .await?;
    }

    Ok(())
}

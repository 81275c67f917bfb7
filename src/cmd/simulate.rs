//! Simulation commands: tick, view, reset, state and the foreground driver.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use factory_line::config::FactoryConfig;
use factory_line::errors::FactoryError;
use factory_line::factory::clock::SystemClock;
use factory_line::factory::db::DbHandle;
use factory_line::factory::engine;
use factory_line::factory::models::{OrderStatus, StepState};
use factory_line::factory::simulator::Simulator;

use super::{open_db, print_json};

pub fn cmd_tick(config: &FactoryConfig, order: Option<&str>) -> Result<()> {
    let db = open_db(config)?;
    let report = match order {
        Some(id) => engine::tick(&db, id, Utc::now())?,
        None => engine::tick_all(&db, Utc::now())?,
    };
    print_json(&report)
}

pub fn cmd_view(config: &FactoryConfig, order: &str) -> Result<()> {
    let db = open_db(config)?;
    let view = engine::view(&db, order, Utc::now())?.ok_or_else(|| FactoryError::OrderNotFound {
        id: order.to_string(),
    })?;

    println!(
        "Order {} ({}), {} pieces",
        console::style(&view.order.order_id).bold(),
        view.order.status,
        view.order.piece_count()
    );
    for step in &view.steps {
        let state = match step.state {
            StepState::Finished => console::style("finished").green(),
            StepState::Running => console::style("running").yellow(),
            StepState::Pending => console::style("pending").dim(),
        };
        println!(
            "  {:>3}  {:<22} {:<24} {}/{} done, {} running  {}",
            step.step_id,
            step.name,
            step.station,
            step.done_count,
            step.total,
            step.running_count,
            state
        );
    }
    Ok(())
}

pub fn cmd_reset(config: &FactoryConfig, order: &str) -> Result<()> {
    let db = open_db(config)?;
    if db.get_order(order)?.is_none() {
        return Err(FactoryError::OrderNotFound {
            id: order.to_string(),
        }
        .into());
    }
    let summary = engine::reset(&db, order, Utc::now())?;
    println!(
        "Reset order {}: {} stations released, {} progress rows cleared",
        summary.order_id, summary.stations_released, summary.rows_cleared
    );
    Ok(())
}

pub fn cmd_state(config: &FactoryConfig) -> Result<()> {
    let db = open_db(config)?;
    print_json(&db.debug_state()?)
}

/// Tick `order` in the foreground until it leaves `active`, the tick limit
/// is hit, or Ctrl+C.
pub async fn cmd_run(
    config: &FactoryConfig,
    order: &str,
    interval_ms: Option<u64>,
    max_ticks: Option<u64>,
) -> Result<()> {
    let db = open_db(config)?;
    if db.get_order(order)?.is_none() {
        return Err(FactoryError::OrderNotFound {
            id: order.to_string(),
        }
        .into());
    }

    let (tx, _rx) = broadcast::channel(64);
    let sim = Simulator::new(DbHandle::new(db), Arc::new(SystemClock), tx);
    let interval = Duration::from_millis(
        interval_ms
            .unwrap_or(config.simulation.poll_interval_ms)
            .max(1),
    );
    let mut ticker = tokio::time::interval(interval);
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted after {} ticks", ticks);
                return Ok(());
            }
        }

        let report = sim.tick(order).await?;
        ticks += 1;
        for job in &report.completed {
            println!(
                "[{}] done     {:<24} piece {} step {}",
                report.now, job.station, job.piece_no, job.step_id
            );
        }
        for job in &report.dispatched {
            println!(
                "[{}] dispatch {:<24} piece {} step {} until {}",
                report.now, job.station, job.piece_no, job.step_id, job.busy_until
            );
        }

        if report.order_status != Some(OrderStatus::Active) {
            let status = report
                .order_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "missing".to_string());
            println!("Order {} is {} after {} ticks", order, status, ticks);
            return Ok(());
        }
        if max_ticks.is_some_and(|max| ticks >= max) {
            println!("Stopped after {} ticks; order still active", ticks);
            return Ok(());
        }
    }
}

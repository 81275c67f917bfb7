use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::models::OrderStatus;
use super::simulator::Simulator;
use super::ws::{WsMessage, broadcast_message};
use crate::errors::FactoryError;

/// Periodic per-order tick loops.
///
/// Nothing advances the simulation in the background unless a driver is
/// started for an order. Each driver is one tokio task that ticks on a fixed
/// interval and exits on its own once the order is no longer active.
#[derive(Clone)]
pub struct SimulationDriver {
    sim: Simulator,
    running: Arc<tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl SimulationDriver {
    pub fn new(sim: Simulator) -> Self {
        Self {
            sim,
            running: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a tick loop for `order_id`. Fails if one is already running.
    pub async fn start(&self, order_id: &str, interval: Duration) -> Result<()> {
        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.is_finished());
        if running.contains_key(order_id) {
            return Err(FactoryError::DriverAlreadyRunning {
                id: order_id.to_string(),
            }
            .into());
        }

        let sim = self.sim.clone();
        let id = order_id.to_string();
        let interval = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match sim.tick(&id).await {
                    Ok(report) if report.order_status == Some(OrderStatus::Active) => {}
                    Ok(report) => {
                        tracing::info!(order_id = %id, status = ?report.order_status, "driver finished");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(order_id = %id, error = %e, "driver tick failed");
                        break;
                    }
                }
            }
            broadcast_message(sim.events(), &WsMessage::DriverStopped { order_id: id });
        });
        running.insert(order_id.to_string(), handle);

        tracing::info!(order_id, interval_ms = interval.as_millis() as u64, "driver started");
        broadcast_message(
            self.sim.events(),
            &WsMessage::DriverStarted {
                order_id: order_id.to_string(),
                interval_ms: interval.as_millis() as u64,
            },
        );
        Ok(())
    }

    /// Abort the driver for `order_id`. Returns false if none was running.
    pub async fn stop(&self, order_id: &str) -> bool {
        let handle = self.running.lock().await.remove(order_id);
        match handle {
            Some(h) if !h.is_finished() => {
                h.abort();
                tracing::info!(order_id, "driver stopped");
                broadcast_message(
                    self.sim.events(),
                    &WsMessage::DriverStopped {
                        order_id: order_id.to_string(),
                    },
                );
                true
            }
            _ => false,
        }
    }

    pub async fn is_running(&self, order_id: &str) -> bool {
        self.running
            .lock()
            .await
            .get(order_id)
            .is_some_and(|h| !h.is_finished())
    }

    /// Order ids with a live driver, sorted. Finished drivers are dropped.
    pub async fn running_orders(&self) -> Vec<String> {
        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.is_finished());
        let mut ids: Vec<String> = running.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.running.lock().await.len()
    }

    pub async fn stop_all(&self) {
        let mut running = self.running.lock().await;
        for (_, handle) in running.drain() {
            handle.abort();
        }
    }
}

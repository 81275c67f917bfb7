//! Async facade over the dispatch engine.
//!
//! `Simulator` owns the pieces every caller needs (database handle, time
//! source, event channel) and runs engine calls on the blocking pool via
//! [`DbHandle::call`]. Tick results are fanned out as [`WsMessage`] events.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;

use super::clock::Clock;
use super::db::DbHandle;
use super::engine;
use super::models::*;
use super::ws::{WsMessage, broadcast_message};

#[derive(Clone)]
pub struct Simulator {
    db: DbHandle,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<String>,
}

impl Simulator {
    pub fn new(db: DbHandle, clock: Arc<dyn Clock>, events: broadcast::Sender<String>) -> Self {
        Self { db, clock, events }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn events(&self) -> &broadcast::Sender<String> {
        &self.events
    }

    pub async fn tick(&self, order_id: &str) -> Result<TickReport> {
        let now = self.clock.now();
        let order_id = order_id.to_string();
        let report = self
            .db
            .call(move |db| engine::tick(db, &order_id, now))
            .await?;
        self.publish(&report);
        Ok(report)
    }

    pub async fn tick_all(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let report = self.db.call(move |db| engine::tick_all(db, now)).await?;
        self.publish(&report);
        Ok(report)
    }

    pub async fn init(&self, order_id: &str) -> Result<Option<InitSummary>> {
        let order_id = order_id.to_string();
        self.db.call(move |db| engine::init_order(db, &order_id)).await
    }

    pub async fn view(&self, order_id: &str) -> Result<Option<OrderView>> {
        let now = self.clock.now();
        let order_id = order_id.to_string();
        let view = self
            .db
            .call(move |db| engine::view(db, &order_id, now))
            .await?;
        if let Some(v) = &view {
            self.publish(&v.tick);
        }
        Ok(view)
    }

    pub async fn reset(&self, order_id: &str) -> Result<ResetSummary> {
        let now = self.clock.now();
        let order_id = order_id.to_string();
        let summary = self
            .db
            .call(move |db| engine::reset(db, &order_id, now))
            .await?;
        broadcast_message(
            &self.events,
            &WsMessage::OrderReset {
                summary: summary.clone(),
            },
        );
        Ok(summary)
    }

    pub async fn debug_state(&self) -> Result<DebugState> {
        self.db.call(|db| db.debug_state()).await
    }

    fn publish(&self, report: &TickReport) {
        for msg in WsMessage::from_tick(report) {
            broadcast_message(&self.events, &msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::clock::ManualClock;
    use crate::factory::db::FactoryDb;
    use chrono::{TimeZone, Utc};

    fn simulator() -> (Simulator, Arc<ManualClock>, broadcast::Receiver<String>) {
        let db = FactoryDb::new_in_memory().unwrap();
        db.upsert_process_step(&ProcessStep {
            step_id: 1,
            name: "Cut".into(),
            station: "Saw".into(),
            estimated_seconds: 4,
            description: String::new(),
        })
        .unwrap();
        db.create_order(&NewOrder {
            order_id: Some("o".into()),
            step_chain: vec![1],
            amount: 1,
            ..Default::default()
        })
        .unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let (tx, rx) = broadcast::channel(64);
        let sim = Simulator::new(DbHandle::new(db), clock.clone(), tx);
        (sim, clock, rx)
    }

    #[tokio::test]
    async fn test_tick_uses_injected_clock() {
        let (sim, clock, _rx) = simulator();
        let first = sim.tick("o").await.unwrap();
        assert_eq!(first.dispatched.len(), 1);

        clock.advance_secs(3);
        assert!(sim.tick("o").await.unwrap().completed.is_empty());

        clock.advance_secs(1);
        let done = sim.tick("o").await.unwrap();
        assert_eq!(done.completed.len(), 1);
        assert!(done.order_completed);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let (sim, clock, mut rx) = simulator();
        sim.tick("o").await.unwrap();
        let msg: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "JobsDispatched");

        clock.advance_secs(10);
        sim.view("o").await.unwrap().unwrap();
        let kinds: Vec<String> = (0..2)
            .map(|_| {
                let raw = rx.try_recv().unwrap();
                let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
                v["type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(kinds, vec!["JobsCompleted", "OrderCompleted"]);
    }

    #[tokio::test]
    async fn test_reset_broadcasts_summary() {
        let (sim, _clock, mut rx) = simulator();
        sim.tick("o").await.unwrap();
        let _ = rx.recv().await.unwrap();
        let summary = sim.reset("o").await.unwrap();
        assert_eq!(summary.stations_released, 1);
        let msg: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "OrderReset");
        assert!(sim.debug_state().await.unwrap().running.is_empty());
    }
}

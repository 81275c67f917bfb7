//! Station dispatch engine.
//!
//! One call to [`tick`] advances the simulation for a single order:
//!
//! 1. **Completion sweep** over *all* stations: any job whose `busy_until`
//!    is at or before `now` is marked finished and its station freed.
//! 2. **Dispatch sweep** for the focused order: idle stations, in name
//!    order, each take at most one eligible `(piece, step)`.
//! 3. **Completion check**: the order becomes `completed` once every piece
//!    has finished the last chain step.
//!
//! The whole tick runs inside one `BEGIN IMMEDIATE` transaction, which is
//! what keeps "one job per station" true when several ticks race on the
//! same database file.
//!
//! Selection itself is the pure [`plan_dispatch`] so that tie-breaks are
//! testable without a database.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use super::catalog::Catalog;
use super::db::FactoryDb;
use super::models::*;

/// In-memory view of one order's progress rows, keyed by `(piece_no, step_id)`.
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    states: HashMap<(i64, i64), PieceState>,
    /// piece_no -> number of its steps currently running.
    running: HashMap<i64, usize>,
}

impl ProgressSnapshot {
    pub fn from_rows(rows: &[PieceStepProgress]) -> Self {
        let mut snapshot = Self::default();
        for r in rows {
            snapshot.set(r.piece_no, r.step_id, r.state);
        }
        snapshot
    }

    pub fn state(&self, piece_no: i64, step_id: i64) -> Option<PieceState> {
        self.states.get(&(piece_no, step_id)).copied()
    }

    pub fn set(&mut self, piece_no: i64, step_id: i64, state: PieceState) {
        let previous = self.states.insert((piece_no, step_id), state);
        if previous == Some(PieceState::Running) {
            if let Some(n) = self.running.get_mut(&piece_no) {
                *n -= 1;
                if *n == 0 {
                    self.running.remove(&piece_no);
                }
            }
        }
        if state == PieceState::Running {
            *self.running.entry(piece_no).or_default() += 1;
        }
    }

    /// True when any step of `piece_no` is running.
    pub fn piece_in_flight(&self, piece_no: i64) -> bool {
        self.running.contains_key(&piece_no)
    }

    pub fn count(&self, step_id: i64, state: PieceState) -> i64 {
        self.states
            .iter()
            .filter(|((_, s), st)| *s == step_id && **st == state)
            .count() as i64
    }
}

/// A station/piece/step pairing chosen by [`plan_dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedJob {
    pub station: String,
    pub piece_no: i64,
    pub step_id: i64,
}

/// Choose work for `idle_stations`. Stations are visited in name order
/// regardless of the order they are passed in.
///
/// For each station, candidate steps are the ones it can run that appear in
/// `chain`, taken in chain order. For each candidate step, pieces are
/// scanned ascending for one whose row is pending, whose previous chain
/// step is finished, and which is not running anywhere else. The first hit
/// is taken and the station is done for this tick. `snapshot` is updated in
/// place so later stations see the claim.
pub fn plan_dispatch(
    idle_stations: &[String],
    catalog: &Catalog,
    chain: &[i64],
    amount: i64,
    snapshot: &mut ProgressSnapshot,
) -> Vec<PlannedJob> {
    let amount = normalize_amount(amount);
    let mut stations: Vec<&String> = idle_stations.iter().collect();
    stations.sort();
    stations.dedup();

    let mut planned = Vec::new();
    for station in stations {
        let capable = catalog.steps_for_station(station);
        if capable.is_empty() {
            continue;
        }
        let candidates = chain.iter().copied().filter(|s| capable.contains(s));

        'steps: for step_id in candidates {
            let prev = previous_step(chain, step_id);
            for piece_no in 1..=amount {
                if snapshot.state(piece_no, step_id) != Some(PieceState::Pending) {
                    continue;
                }
                let ready = match prev {
                    None => true,
                    Some(p) => snapshot.state(piece_no, p) == Some(PieceState::Finished),
                };
                if !ready || snapshot.piece_in_flight(piece_no) {
                    continue;
                }
                snapshot.set(piece_no, step_id, PieceState::Running);
                planned.push(PlannedJob {
                    station: station.clone(),
                    piece_no,
                    step_id,
                });
                break 'steps;
            }
        }
    }
    planned
}

/// Mark every elapsed job finished and free its station. Runs across all
/// orders. A station whose `busy_until` cannot be parsed is freed and its
/// job goes back to pending so the piece can be dispatched again.
pub fn complete_due_jobs(db: &FactoryDb, now: DateTime<Utc>) -> Result<Vec<CompletedJob>> {
    let now_str = format_timestamp(now);
    let mut completed = Vec::new();

    for station in db.occupied_stations()? {
        let Some(raw) = station.busy_until.as_deref() else {
            continue;
        };
        let Some(end) = parse_timestamp(raw) else {
            tracing::warn!(station = %station.station, busy_until = raw, "unparseable busy_until, releasing station");
            if let (Some(order_id), Some(piece_no), Some(step_id)) = (
                station.current_order_id.as_deref(),
                station.current_piece_no,
                station.current_step_id,
            ) {
                db.requeue_running(order_id, piece_no, step_id)?;
            }
            db.release_station(&station.station, &now_str)?;
            continue;
        };
        if now < end {
            continue;
        }

        if let (Some(order_id), Some(piece_no), Some(step_id)) = (
            station.current_order_id.clone(),
            station.current_piece_no,
            station.current_step_id,
        ) {
            let finished = db.mark_finished(&order_id, piece_no, step_id, &now_str)?;
            if finished {
                tracing::debug!(
                    station = %station.station,
                    order_id = %order_id,
                    piece_no,
                    step_id,
                    "job finished"
                );
                completed.push(CompletedJob {
                    station: station.station.clone(),
                    order_id,
                    piece_no,
                    step_id,
                    finished_at: now_str.clone(),
                });
            } else {
                tracing::warn!(
                    station = %station.station,
                    order_id = %order_id,
                    piece_no,
                    step_id,
                    "station held a job with no running progress row; releasing"
                );
            }
        }
        db.release_station(&station.station, &now_str)?;
    }

    Ok(completed)
}

/// Assign idle stations to the order's eligible work and persist the result.
fn dispatch_for_order(
    db: &FactoryDb,
    catalog: &Catalog,
    order: &Order,
    now: DateTime<Utc>,
) -> Result<Vec<Assignment>> {
    let chain = &order.step_chain;
    let amount = order.piece_count();
    db.ensure_piece_rows(&order.order_id, chain, amount)?;

    let idle = db.idle_stations()?;
    if idle.is_empty() {
        return Ok(Vec::new());
    }
    let mut snapshot = ProgressSnapshot::from_rows(&db.progress_for_order(&order.order_id)?);
    let plan = plan_dispatch(&idle, catalog, chain, amount, &mut snapshot);

    let now_str = format_timestamp(now);
    let mut dispatched = Vec::with_capacity(plan.len());
    for job in plan {
        let busy_until = now + Duration::seconds(catalog.estimated_seconds(job.step_id));
        let assignment = Assignment {
            station: job.station,
            order_id: order.order_id.clone(),
            piece_no: job.piece_no,
            step_id: job.step_id,
            busy_until: format_timestamp(busy_until),
        };
        if !db.occupy_station(&assignment, &now_str)? {
            tracing::debug!(station = %assignment.station, "station claimed elsewhere, skipping");
            continue;
        }
        if !db.mark_running(&order.order_id, job.piece_no, job.step_id, &now_str)? {
            // Roll the station back; the row moved on since the snapshot.
            db.release_station(&assignment.station, &now_str)?;
            continue;
        }
        tracing::info!(
            station = %assignment.station,
            order_id = %assignment.order_id,
            piece_no = assignment.piece_no,
            step_id = assignment.step_id,
            busy_until = %assignment.busy_until,
            "dispatched"
        );
        dispatched.push(assignment);
    }
    Ok(dispatched)
}

/// Promote an active order to `completed` once every piece finished the
/// last chain step. Returns the resulting status.
fn check_completion(db: &FactoryDb, order: &Order) -> Result<OrderStatus> {
    if !order.status.is_dispatchable() {
        return Ok(order.status);
    }
    let Some(last) = order.last_step() else {
        return Ok(order.status);
    };
    let done = db.count_in_state(&order.order_id, last, PieceState::Finished)?;
    if done >= order.piece_count() {
        db.set_order_status(&order.order_id, OrderStatus::Completed)?;
        tracing::info!(order_id = %order.order_id, pieces = done, "order completed");
        return Ok(OrderStatus::Completed);
    }
    Ok(order.status)
}

/// Advance the simulation by one tick for `order_id`.
///
/// Missing orders, non-active orders and empty chains get the completion
/// sweep only; none of them is an error.
pub fn tick(db: &FactoryDb, order_id: &str, now: DateTime<Utc>) -> Result<TickReport> {
    let tx = db.begin_immediate()?;

    let catalog = db.load_catalog()?;
    db.ensure_station_rows(&catalog)?;
    let completed = complete_due_jobs(db, now)?;

    let mut report = TickReport {
        order_id: Some(order_id.to_string()),
        now: format_timestamp(now),
        completed,
        dispatched: Vec::new(),
        order_status: None,
        order_completed: false,
    };

    let Some(order) = db.get_order(order_id)? else {
        tx.commit()?;
        return Ok(report);
    };
    report.order_status = Some(order.status);

    if order.status.is_dispatchable() && !order.step_chain.is_empty() {
        report.dispatched = dispatch_for_order(db, &catalog, &order, now)?;
        let status = check_completion(db, &order)?;
        report.order_completed = status == OrderStatus::Completed;
        report.order_status = Some(status);
    }

    tx.commit()?;
    Ok(report)
}

/// Completion sweep without any dispatch.
pub fn tick_all(db: &FactoryDb, now: DateTime<Utc>) -> Result<TickReport> {
    let tx = db.begin_immediate()?;
    let catalog = db.load_catalog()?;
    db.ensure_station_rows(&catalog)?;
    let completed = complete_due_jobs(db, now)?;
    tx.commit()?;
    Ok(TickReport {
        order_id: None,
        now: format_timestamp(now),
        completed,
        dispatched: Vec::new(),
        order_status: None,
        order_completed: false,
    })
}

/// Materialize station rows and this order's progress rows.
pub fn init_order(db: &FactoryDb, order_id: &str) -> Result<Option<InitSummary>> {
    let tx = db.begin_immediate()?;
    let catalog = db.load_catalog()?;
    db.ensure_station_rows(&catalog)?;
    let Some(order) = db.get_order(order_id)? else {
        return Ok(None);
    };
    let amount = order.piece_count();
    db.ensure_piece_rows(&order.order_id, &order.step_chain, amount)?;
    tx.commit()?;
    Ok(Some(InitSummary {
        order_id: order.order_id,
        amount,
        steps: order.step_chain,
    }))
}

/// Per-step fold over the order's progress. Steps missing from the catalog
/// are left out; missing rows count as zero.
pub fn project(order: &Order, catalog: &Catalog, rows: &[PieceStepProgress]) -> Vec<StepProgressView> {
    let snapshot = ProgressSnapshot::from_rows(rows);
    let total = order.piece_count();
    catalog
        .resolve_chain(&order.step_chain)
        .into_iter()
        .map(|step| {
            let done_count = snapshot.count(step.step_id, PieceState::Finished);
            let running_count = snapshot.count(step.step_id, PieceState::Running);
            let state = if done_count >= total {
                StepState::Finished
            } else if running_count > 0 {
                StepState::Running
            } else {
                StepState::Pending
            };
            StepProgressView {
                estimated_seconds: catalog.estimated_seconds(step.step_id),
                step_id: step.step_id,
                name: step.name,
                station: step.station,
                done_count,
                running_count,
                total,
                state,
            }
        })
        .collect()
}

/// Tick once, then project. Viewing always advances the simulation by
/// exactly one tick; callers that need a side-effect-free read use
/// [`project`] directly.
pub fn view(db: &FactoryDb, order_id: &str, now: DateTime<Utc>) -> Result<Option<OrderView>> {
    let report = tick(db, order_id, now)?;
    let Some(order) = db.get_order(order_id)? else {
        return Ok(None);
    };
    let catalog = db.load_catalog()?;
    let rows = db.progress_for_order(order_id)?;
    let steps = project(&order, &catalog, &rows);
    Ok(Some(OrderView {
        order,
        steps,
        tick: report,
    }))
}

/// Drop all progress for `order_id` and free any station it occupies.
pub fn reset(db: &FactoryDb, order_id: &str, now: DateTime<Utc>) -> Result<ResetSummary> {
    let tx = db.begin_immediate()?;
    let stations_released = db.release_stations_for_order(order_id, &format_timestamp(now))?;
    let rows_cleared = db.delete_progress_for_order(order_id)?;
    tx.commit()?;
    tracing::info!(order_id, stations_released, rows_cleared, "order simulation reset");
    Ok(ResetSummary {
        order_id: order_id.to_string(),
        stations_released,
        rows_cleared,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn step(id: i64, station: &str, secs: i64) -> ProcessStep {
        ProcessStep {
            step_id: id,
            name: format!("step-{}", id),
            station: station.to_string(),
            estimated_seconds: secs,
            description: String::new(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(secs)
    }

    fn setup(steps: &[ProcessStep], order_id: &str, chain: &[i64], amount: i64) -> Result<FactoryDb> {
        let db = FactoryDb::new_in_memory()?;
        for s in steps {
            db.upsert_process_step(s)?;
        }
        db.create_order(&NewOrder {
            order_id: Some(order_id.to_string()),
            step_chain: chain.to_vec(),
            amount,
            ..Default::default()
        })?;
        Ok(db)
    }

    fn pending_snapshot(chain: &[i64], amount: i64) -> ProgressSnapshot {
        let mut snap = ProgressSnapshot::default();
        for p in 1..=amount {
            for s in chain {
                snap.set(p, *s, PieceState::Pending);
            }
        }
        snap
    }

    // ── plan_dispatch ────────────────────────────────────────────────

    #[test]
    fn test_plan_one_job_per_station_first_piece_first() {
        let catalog = Catalog::new(vec![step(1, "A", 2), step(2, "B", 3)]);
        let mut snap = pending_snapshot(&[1, 2], 2);
        let plan = plan_dispatch(
            &["A".into(), "B".into()],
            &catalog,
            &[1, 2],
            2,
            &mut snap,
        );
        assert_eq!(
            plan,
            vec![PlannedJob {
                station: "A".into(),
                piece_no: 1,
                step_id: 1
            }]
        );
        assert_eq!(snap.state(1, 1), Some(PieceState::Running));
    }

    #[test]
    fn test_plan_earliest_chain_step_wins_for_shared_station() {
        // Station A serves steps 1 and 3; chain order is [3, 2, 1].
        let catalog = Catalog::new(vec![step(1, "A", 1), step(2, "B", 1), step(3, "A", 1)]);
        let mut snap = pending_snapshot(&[3, 2, 1], 1);
        let plan = plan_dispatch(&["A".into()], &catalog, &[3, 2, 1], 1, &mut snap);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].step_id, 3);
    }

    #[test]
    fn test_plan_never_double_dispatches_a_piece() {
        // Piece 1 is finished with step 1 and (inconsistently) already
        // running step 3; step 2 must wait until it is no longer in flight.
        let catalog = Catalog::new(vec![step(1, "A", 1), step(2, "B", 1), step(3, "C", 1)]);
        let mut snap = pending_snapshot(&[1, 2, 3], 1);
        snap.set(1, 1, PieceState::Finished);
        snap.set(1, 3, PieceState::Running);
        let plan = plan_dispatch(&["B".into()], &catalog, &[1, 2, 3], 1, &mut snap);
        assert!(plan.is_empty());

        snap.set(1, 3, PieceState::Pending);
        let plan = plan_dispatch(&["B".into(), "C".into()], &catalog, &[1, 2, 3], 1, &mut snap);
        assert_eq!(plan.len(), 1, "C must not run piece 1 while B holds it");
        assert_eq!(plan[0].station, "B");
    }

    #[test]
    fn test_plan_respects_precedence_and_in_flight_pieces() {
        let catalog = Catalog::new(vec![step(1, "A", 1), step(2, "B", 1)]);
        let mut snap = pending_snapshot(&[1, 2], 2);
        snap.set(1, 1, PieceState::Finished);
        snap.set(2, 1, PieceState::Running);
        let plan = plan_dispatch(&["B".into()], &catalog, &[1, 2], 2, &mut snap);
        assert_eq!(
            plan,
            vec![PlannedJob {
                station: "B".into(),
                piece_no: 1,
                step_id: 2
            }]
        );

        // Piece 2 has not finished step 1, so B has nothing else to do.
        let plan = plan_dispatch(&["B".into()], &catalog, &[1, 2], 2, &mut snap);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_snapshot_tracks_in_flight_pieces() {
        let mut snap = pending_snapshot(&[1, 2], 3);
        assert!(!snap.piece_in_flight(2));

        snap.set(2, 1, PieceState::Running);
        assert!(snap.piece_in_flight(2));
        assert!(!snap.piece_in_flight(1));

        // Re-setting the same running row must not double count.
        snap.set(2, 1, PieceState::Running);
        snap.set(2, 1, PieceState::Finished);
        assert!(!snap.piece_in_flight(2));

        let rows = vec![PieceStepProgress {
            order_id: "o".into(),
            piece_no: 3,
            step_id: 2,
            state: PieceState::Running,
            started_at: None,
            finished_at: None,
        }];
        let snap = ProgressSnapshot::from_rows(&rows);
        assert!(snap.piece_in_flight(3));
        assert_eq!(snap.count(2, PieceState::Running), 1);
    }

    #[test]
    fn test_plan_large_order_picks_lowest_ready_piece() {
        let catalog = Catalog::new(vec![step(1, "A", 1), step(2, "B", 1)]);
        let amount = 5_000;
        let mut snap = pending_snapshot(&[1, 2], amount);
        for p in 1..=amount - 1 {
            snap.set(p, 1, PieceState::Finished);
        }
        for p in 1..=amount - 2 {
            snap.set(p, 2, PieceState::Finished);
        }
        let plan = plan_dispatch(&["A".into(), "B".into()], &catalog, &[1, 2], amount, &mut snap);
        assert_eq!(
            plan,
            vec![
                PlannedJob {
                    station: "A".into(),
                    piece_no: amount,
                    step_id: 1
                },
                PlannedJob {
                    station: "B".into(),
                    piece_no: amount - 1,
                    step_id: 2
                },
            ]
        );
    }

    #[test]
    fn test_plan_stations_visited_in_name_order() {
        let catalog = Catalog::new(vec![step(1, "Zeta", 1), step(2, "Alpha", 1)]);
        let mut snap = pending_snapshot(&[1, 2], 3);
        snap.set(1, 1, PieceState::Finished);
        let plan = plan_dispatch(&["Zeta".into(), "Alpha".into()], &catalog, &[1, 2], 3, &mut snap);
        let stations: Vec<&str> = plan.iter().map(|j| j.station.as_str()).collect();
        assert_eq!(stations, vec!["Alpha", "Zeta"]);
        // Alpha took piece 1 for step 2, so Zeta must move to piece 2.
        assert_eq!(plan[1].piece_no, 2);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let catalog = Catalog::new(vec![step(1, "A", 1), step(2, "B", 1), step(3, "C", 1)]);
        let mut s1 = pending_snapshot(&[1, 2, 3], 4);
        s1.set(1, 1, PieceState::Finished);
        s1.set(2, 1, PieceState::Finished);
        let mut s2 = s1.clone();
        let idle: Vec<String> = vec!["C".into(), "A".into(), "B".into()];
        let a = plan_dispatch(&idle, &catalog, &[1, 2, 3], 4, &mut s1);
        let b = plan_dispatch(&idle, &catalog, &[1, 2, 3], 4, &mut s2);
        assert_eq!(a, b);
    }

    // ── tick ─────────────────────────────────────────────────────────

    #[test]
    fn test_two_station_scenario() -> Result<()> {
        let db = setup(&[step(1, "A", 2), step(2, "B", 3)], "o", &[1, 2], 2)?;

        // t=0: A takes piece 1 / step 1; B has nothing eligible.
        let r = tick(&db, "o", at(0))?;
        assert_eq!(r.dispatched.len(), 1);
        assert_eq!(r.dispatched[0].station, "A");
        assert_eq!(r.dispatched[0].piece_no, 1);
        assert_eq!(r.dispatched[0].step_id, 1);
        assert_eq!(r.dispatched[0].busy_until, format_timestamp(at(2)));

        // t=1: nothing elapsed, nothing new.
        let r = tick(&db, "o", at(1))?;
        assert!(r.completed.is_empty());
        assert!(r.dispatched.is_empty());

        // t=2: piece 1 step 1 done; A takes piece 2, B takes piece 1 step 2.
        let r = tick(&db, "o", at(2))?;
        assert_eq!(r.completed.len(), 1);
        let mut got: Vec<(String, i64, i64)> = r
            .dispatched
            .iter()
            .map(|a| (a.station.clone(), a.piece_no, a.step_id))
            .collect();
        got.sort();
        assert_eq!(got, vec![("A".into(), 2, 1), ("B".into(), 1, 2)]);

        // t=4: piece 2 step 1 done; B still busy until t=5.
        let r = tick(&db, "o", at(4))?;
        assert_eq!(r.completed.len(), 1);
        assert!(r.dispatched.is_empty());
        assert_eq!(r.order_status, Some(OrderStatus::Active));

        // t=5: piece 1 step 2 done; B takes piece 2 step 2.
        let r = tick(&db, "o", at(5))?;
        assert_eq!(r.completed[0].piece_no, 1);
        assert_eq!(r.dispatched.len(), 1);
        assert_eq!(r.dispatched[0].piece_no, 2);
        assert_eq!(r.order_status, Some(OrderStatus::Active));

        // t=8: last piece done, order completes.
        let r = tick(&db, "o", at(8))?;
        assert_eq!(r.completed.len(), 1);
        assert_eq!(r.order_status, Some(OrderStatus::Completed));
        assert!(r.order_completed);
        assert_eq!(db.get_order("o")?.unwrap().status, OrderStatus::Completed);
        assert!(db.occupied_stations()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_unknown_step_in_chain_does_not_fail() -> Result<()> {
        let db = setup(&[step(1, "A", 2), step(2, "B", 2)], "o", &[1, 2], 1)?;
        // The step disappears from the catalog after the order was placed.
        db.delete_process_step(2)?;

        for secs in [0, 2, 4, 6] {
            let r = tick(&db, "o", at(secs))?;
            assert!(r.dispatched.iter().all(|a| a.step_id != 2));
        }
        assert_eq!(db.count_in_state("o", 2, PieceState::Pending)?, 1);
        assert_eq!(db.get_order("o")?.unwrap().status, OrderStatus::Active);
        Ok(())
    }

    #[test]
    fn test_tick_missing_order_only_sweeps() -> Result<()> {
        let db = setup(&[step(1, "A", 1)], "o", &[1], 1)?;
        tick(&db, "o", at(0))?;
        let r = tick(&db, "nope", at(5))?;
        assert_eq!(r.completed.len(), 1);
        assert!(r.dispatched.is_empty());
        assert_eq!(r.order_status, None);
        Ok(())
    }

    #[test]
    fn test_cancelled_order_lets_in_flight_job_finish() -> Result<()> {
        let db = setup(&[step(1, "A", 2)], "o", &[1], 2)?;
        tick(&db, "o", at(0))?;
        db.set_order_status("o", OrderStatus::Cancelled)?;

        let r = tick(&db, "o", at(2))?;
        assert_eq!(r.completed.len(), 1);
        assert!(r.dispatched.is_empty());
        assert_eq!(r.order_status, Some(OrderStatus::Cancelled));
        assert_eq!(db.count_in_state("o", 1, PieceState::Finished)?, 1);
        assert!(db.occupied_stations()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_completion_sweep_is_global() -> Result<()> {
        let db = setup(&[step(1, "A", 2), step(2, "B", 2)], "o1", &[1], 1)?;
        db.create_order(&NewOrder {
            order_id: Some("o2".into()),
            step_chain: vec![2],
            amount: 1,
            ..Default::default()
        })?;
        tick(&db, "o1", at(0))?;
        tick(&db, "o2", at(0))?;
        assert_eq!(db.occupied_stations()?.len(), 2);

        // Ticking o1 finishes o2's job too.
        let r = tick(&db, "o1", at(3))?;
        let orders: Vec<&str> = r.completed.iter().map(|c| c.order_id.as_str()).collect();
        assert!(orders.contains(&"o2"));
        assert_eq!(db.count_in_state("o2", 2, PieceState::Finished)?, 1);
        Ok(())
    }

    #[test]
    fn test_orders_share_station_pool() -> Result<()> {
        let db = setup(&[step(1, "A", 10)], "o1", &[1], 1)?;
        db.create_order(&NewOrder {
            order_id: Some("o2".into()),
            step_chain: vec![1],
            amount: 1,
            ..Default::default()
        })?;
        assert_eq!(tick(&db, "o1", at(0))?.dispatched.len(), 1);
        assert!(tick(&db, "o2", at(1))?.dispatched.is_empty());
        assert_eq!(tick(&db, "o2", at(10))?.dispatched.len(), 1);
        Ok(())
    }

    #[test]
    fn test_unparseable_busy_until_frees_station_and_requeues() -> Result<()> {
        let db = setup(&[step(1, "A", 2)], "o", &[1], 1)?;
        tick(&db, "o", at(0))?;
        db.release_station("A", "x")?;
        let bogus = Assignment {
            station: "A".into(),
            order_id: "o".into(),
            piece_no: 1,
            step_id: 1,
            busy_until: "garbage".into(),
        };
        assert!(db.occupy_station(&bogus, "x")?);

        // The broken job is abandoned and the piece goes straight back out.
        let r = tick(&db, "o", at(100))?;
        assert!(r.completed.is_empty());
        assert_eq!(r.dispatched.len(), 1);
        assert_eq!(r.dispatched[0].piece_no, 1);
        assert_eq!(r.dispatched[0].busy_until, format_timestamp(at(102)));

        let r = tick(&db, "o", at(102))?;
        assert_eq!(r.completed.len(), 1);
        assert_eq!(r.order_status, Some(OrderStatus::Completed));
        Ok(())
    }

    #[test]
    fn test_malformed_order_row_does_not_fail_tick() -> Result<()> {
        let db = setup(&[step(1, "A", 2), step(2, "B", 2)], "o", &[1], 1)?;
        db.create_order(&NewOrder {
            order_id: Some("bad".into()),
            step_chain: vec![2],
            amount: 2,
            ..Default::default()
        })?;
        tick(&db, "o", at(0))?;
        db.execute_raw("UPDATE orders SET status = 'Processing', amount = 'abc' WHERE order_id = 'bad'")?;

        // The sweep still commits for every order, and the unknown status
        // gets no new work.
        let r = tick(&db, "bad", at(2))?;
        assert_eq!(r.completed.len(), 1);
        assert!(r.dispatched.is_empty());
        assert_eq!(r.order_status, Some(OrderStatus::Rejected));
        assert_eq!(db.count_in_state("o", 1, PieceState::Finished)?, 1);

        let view = view(&db, "bad", at(3))?.unwrap();
        assert_eq!(view.order.amount, 1);
        assert_eq!(view.steps[0].total, 1);
        Ok(())
    }

    #[test]
    fn test_tick_all_does_not_dispatch() -> Result<()> {
        let db = setup(&[step(1, "A", 1)], "o", &[1], 2)?;
        tick(&db, "o", at(0))?;
        let r = tick_all(&db, at(1))?;
        assert_eq!(r.completed.len(), 1);
        assert!(r.dispatched.is_empty());
        assert!(db.occupied_stations()?.is_empty());
        Ok(())
    }

    // ── init / view / reset ──────────────────────────────────────────

    #[test]
    fn test_init_order_is_idempotent() -> Result<()> {
        let db = setup(&[step(1, "A", 1), step(2, "B", 1)], "o", &[1, 2], 3)?;
        let first = init_order(&db, "o")?.expect("order exists");
        assert_eq!(first.amount, 3);
        assert_eq!(first.steps, vec![1, 2]);
        let rows = db.progress_for_order("o")?;
        assert_eq!(rows.len(), 6);
        init_order(&db, "o")?;
        assert_eq!(db.progress_for_order("o")?, rows);
        assert!(init_order(&db, "missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_project_states() {
        let catalog = Catalog::new(vec![step(1, "A", 1), step(2, "B", 1), step(3, "C", 0)]);
        let order = Order {
            order_id: "o".into(),
            step_chain: vec![1, 2, 3, 42],
            amount: 2,
            status: OrderStatus::Active,
            customer: String::new(),
            note: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        let row = |piece, step, state| PieceStepProgress {
            order_id: "o".into(),
            piece_no: piece,
            step_id: step,
            state,
            started_at: None,
            finished_at: None,
        };
        let rows = vec![
            row(1, 1, PieceState::Finished),
            row(2, 1, PieceState::Finished),
            row(1, 2, PieceState::Running),
            row(2, 2, PieceState::Pending),
        ];
        let view = project(&order, &catalog, &rows);
        assert_eq!(view.len(), 3, "unknown step 42 is not projected");
        assert_eq!(view[0].state, StepState::Finished);
        assert_eq!(view[0].done_count, 2);
        assert_eq!(view[1].state, StepState::Running);
        assert_eq!(view[1].running_count, 1);
        assert_eq!(view[2].state, StepState::Pending);
        assert_eq!(view[2].total, 2);
        assert_eq!(view[2].estimated_seconds, DEFAULT_STEP_SECONDS);

        // Pure: same input, same output.
        assert_eq!(project(&order, &catalog, &rows), view);
    }

    #[test]
    fn test_view_ticks_exactly_once() -> Result<()> {
        let db = setup(&[step(1, "A", 2), step(2, "B", 3)], "o", &[1, 2], 2)?;
        let v = view(&db, "o", at(0))?.expect("order exists");
        assert_eq!(v.tick.dispatched.len(), 1);
        assert_eq!(v.steps[0].state, StepState::Running);
        assert_eq!(v.steps[0].running_count, 1);
        assert_eq!(v.steps[1].state, StepState::Pending);

        // Same instant: the tick is a no-op, projection unchanged.
        let again = view(&db, "o", at(0))?.unwrap();
        assert!(again.tick.dispatched.is_empty());
        assert_eq!(again.steps, v.steps);
        assert!(view(&db, "missing", at(0))?.is_none());
        Ok(())
    }

    #[test]
    fn test_reset_clears_progress_and_frees_stations() -> Result<()> {
        let db = setup(&[step(1, "A", 5)], "o", &[1], 2)?;
        tick(&db, "o", at(0))?;
        let summary = reset(&db, "o", at(1))?;
        assert_eq!(summary.stations_released, 1);
        assert_eq!(summary.rows_cleared, 2);
        assert!(db.progress_for_order("o")?.is_empty());
        assert!(db.occupied_stations()?.is_empty());

        // The order can run again from scratch.
        let r = tick(&db, "o", at(2))?;
        assert_eq!(r.dispatched[0].piece_no, 1);
        Ok(())
    }
}

//! Process catalog lookups.
//!
//! The catalog is loaded once per tick from `process_steps` and answers the
//! two questions the dispatcher asks: which definition a chain step resolves
//! to, and which steps a given station can run.

use std::collections::{BTreeMap, HashMap};

use super::models::{DEFAULT_STEP_SECONDS, ProcessStep};

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    steps: HashMap<i64, ProcessStep>,
    /// station -> step ids, ascending. Keyed by a BTreeMap so station
    /// iteration is name-ordered.
    by_station: BTreeMap<String, Vec<i64>>,
}

impl Catalog {
    pub fn new(steps: Vec<ProcessStep>) -> Self {
        let mut by_id = HashMap::with_capacity(steps.len());
        let mut by_station: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for step in steps {
            let station = step.station.trim();
            if !station.is_empty() {
                by_station
                    .entry(station.to_string())
                    .or_default()
                    .push(step.step_id);
            }
            by_id.insert(step.step_id, step);
        }
        for ids in by_station.values_mut() {
            ids.sort_unstable();
            ids.dedup();
        }
        Self {
            steps: by_id,
            by_station,
        }
    }

    pub fn get(&self, step_id: i64) -> Option<&ProcessStep> {
        self.steps.get(&step_id)
    }

    pub fn contains(&self, step_id: i64) -> bool {
        self.steps.contains_key(&step_id)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Definitions for `chain` in chain order. Unknown ids are skipped.
    pub fn resolve_chain(&self, chain: &[i64]) -> Vec<ProcessStep> {
        chain
            .iter()
            .filter_map(|id| self.steps.get(id).cloned())
            .collect()
    }

    /// Step ids `station` can perform, ascending.
    pub fn steps_for_station(&self, station: &str) -> Vec<i64> {
        self.by_station
            .get(station.trim())
            .cloned()
            .unwrap_or_default()
    }

    /// Distinct station names, ascending.
    pub fn stations(&self) -> Vec<String> {
        self.by_station.keys().cloned().collect()
    }

    pub fn station_for(&self, step_id: i64) -> Option<&str> {
        self.steps
            .get(&step_id)
            .map(|s| s.station.trim())
            .filter(|s| !s.is_empty())
    }

    /// Estimated duration for a step, falling back to [`DEFAULT_STEP_SECONDS`]
    /// when the step is unknown or its estimate is not positive.
    pub fn estimated_seconds(&self, step_id: i64) -> i64 {
        match self.steps.get(&step_id) {
            Some(step) if step.estimated_seconds > 0 => step.estimated_seconds,
            _ => DEFAULT_STEP_SECONDS,
        }
    }
}

/// The fuse-box assembly line the demo ships with.
pub fn default_catalog() -> Vec<ProcessStep> {
    let rows: [(i64, &str, &str, &str, i64); 9] = [
        (
            1,
            "Order & Dispensing",
            "A1 ASRS (Stopper 1)",
            "ASRS pulls a tray carrying the upper cover and releases it onto the conveyor.",
            5,
        ),
        (
            2,
            "Measuring",
            "B Measuring Module",
            "Laser distance sensor checks the upper cover dimensions.",
            5,
        ),
        (
            3,
            "Drilling",
            "C Drilling CPS",
            "Dual spindles drill two pairs of holes in the upper cover.",
            8,
        ),
        (
            4,
            "Robot Assembly",
            "D Robot Assembly",
            "Six-axis robot mounts the PCB and inserts the fuses.",
            10,
        ),
        (
            5,
            "Camera Inspection",
            "E Camera Inspection",
            "Industrial camera verifies fuse presence and placement.",
            6,
        ),
        (
            6,
            "Place Lower Cover",
            "F Stacking Magazine",
            "Stacking module separates a lower cover and places it on the tray.",
            5,
        ),
        (
            7,
            "Pressing",
            "G Muscle Press",
            "Fluidic muscle presses upper and lower covers together.",
            6,
        ),
        (
            8,
            "Heating",
            "H Heating Oven",
            "Tunnel oven cures the housing along a controlled profile.",
            12,
        ),
        (
            9,
            "Storage",
            "A2 ASRS (Stopper 2)",
            "Finished goods return to the ASRS rack.",
            5,
        ),
    ];
    rows.iter()
        .map(|(id, name, station, description, secs)| ProcessStep {
            step_id: *id,
            name: name.to_string(),
            station: station.to_string(),
            estimated_seconds: *secs,
            description: description.to_string(),
        })
        .collect()
}

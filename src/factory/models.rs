use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Fallback duration for a step whose catalog entry has no usable estimate.
pub const DEFAULT_STEP_SECONDS: i64 = 5;

/// Largest piece count accepted for a new order.
pub const MAX_ORDER_AMOUNT: i64 = 10_000;

/// Separator used when a step chain is persisted as text (`"1->2->3"`).
pub const STEP_CHAIN_SEPARATOR: &str = "->";

// ── Process catalog ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessStep {
    pub step_id: i64,
    pub name: String,
    pub station: String,
    pub estimated_seconds: i64,
    #[serde(default)]
    pub description: String,
}

// ── Orders ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Active,
    Completed,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    /// Only active orders receive new station assignments.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid order status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub step_chain: Vec<i64>,
    pub amount: i64,
    pub status: OrderStatus,
    pub customer: String,
    pub note: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Order {
    /// Number of pieces to produce, floored at one.
    pub fn piece_count(&self) -> i64 {
        normalize_amount(self.amount)
    }

    pub fn last_step(&self) -> Option<i64> {
        self.step_chain.last().copied()
    }
}

/// Input for order submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewOrder {
    #[serde(default)]
    pub order_id: Option<String>,
    pub step_chain: Vec<i64>,
    pub amount: i64,
    #[serde(default)]
    pub customer: String,
    #[serde(default)]
    pub note: String,
}

/// Raw order row as stored; the chain and status are still text.
pub(crate) struct OrderRow {
    pub order_id: String,
    pub step_chain: String,
    pub amount: i64,
    pub status: String,
    pub customer: String,
    pub note: String,
    pub created_at: String,
    pub updated_at: String,
}

impl OrderRow {
    /// Rows written outside this crate may carry a status we do not know.
    /// Those orders are read back as `rejected` so they never receive work.
    pub fn into_order(self) -> Order {
        let status = self.status.parse::<OrderStatus>().unwrap_or_else(|e| {
            tracing::warn!(order_id = %self.order_id, error = %e, "unknown order status, treating as rejected");
            OrderStatus::Rejected
        });
        Order {
            step_chain: parse_step_chain(&self.step_chain),
            order_id: self.order_id,
            amount: normalize_amount(self.amount),
            status,
            customer: self.customer,
            note: self.note,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Parse `"1->2->3"` into step ids. Fragments that are not non-negative
/// integers are ignored and repeated ids keep their first position.
pub fn parse_step_chain(s: &str) -> Vec<i64> {
    let mut out: Vec<i64> = Vec::new();
    for part in s.split(STEP_CHAIN_SEPARATOR) {
        let part = part.trim();
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Ok(id) = part.parse::<i64>() {
            if !out.contains(&id) {
                out.push(id);
            }
        }
    }
    out
}

pub fn format_step_chain(chain: &[i64]) -> String {
    chain
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(STEP_CHAIN_SEPARATOR)
}

pub fn normalize_amount(amount: i64) -> i64 {
    amount.max(1)
}

/// Step that precedes `step_id` in `chain`, if any.
pub fn previous_step(chain: &[i64], step_id: i64) -> Option<i64> {
    let idx = chain.iter().position(|s| *s == step_id)?;
    if idx == 0 { None } else { Some(chain[idx - 1]) }
}

// ── Piece progress ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PieceState {
    Pending,
    Running,
    Finished,
}

impl PieceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for PieceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PieceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            _ => Err(format!("Invalid piece state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PieceStepProgress {
    pub order_id: String,
    pub piece_no: i64,
    pub step_id: i64,
    pub state: PieceState,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

// ── Stations ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StationState {
    pub station: String,
    pub current_order_id: Option<String>,
    pub current_piece_no: Option<i64>,
    pub current_step_id: Option<i64>,
    pub busy_until: Option<String>,
    pub updated_at: Option<String>,
}

impl StationState {
    pub fn is_idle(&self) -> bool {
        self.current_order_id.is_none() && self.busy_until.is_none()
    }
}

/// A job handed to a station during a tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub station: String,
    pub order_id: String,
    pub piece_no: i64,
    pub step_id: i64,
    pub busy_until: String,
}

/// A job whose `busy_until` elapsed and was marked finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletedJob {
    pub station: String,
    pub order_id: String,
    pub piece_no: i64,
    pub step_id: i64,
    pub finished_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    pub order_id: Option<String>,
    pub now: String,
    pub completed: Vec<CompletedJob>,
    pub dispatched: Vec<Assignment>,
    /// Status after the tick; `None` when the order does not exist.
    pub order_status: Option<OrderStatus>,
    /// Set when this tick promoted the order to `completed`.
    #[serde(default)]
    pub order_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitSummary {
    pub order_id: String,
    pub amount: i64,
    pub steps: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResetSummary {
    pub order_id: String,
    pub stations_released: usize,
    pub rows_cleared: usize,
}

// ── View projection ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepProgressView {
    pub step_id: i64,
    pub name: String,
    pub station: String,
    pub estimated_seconds: i64,
    pub done_count: i64,
    pub running_count: i64,
    pub total: i64,
    pub state: StepState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderView {
    pub order: Order,
    pub steps: Vec<StepProgressView>,
    pub tick: TickReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugState {
    pub stations: Vec<StationState>,
    pub running: Vec<PieceStepProgress>,
}

// ── Timestamps ───────────────────────────────────────────────────────

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

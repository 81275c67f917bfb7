//! Typed error hierarchy for the factory simulator.
//!
//! `FactoryError` covers catalog, order and simulation failures. Storage
//! code returns `anyhow::Result`; these variants ride inside the
//! `anyhow::Error` and are recovered with `downcast_ref` at the HTTP and CLI
//! boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("Order {id} not found")]
    OrderNotFound { id: String },

    #[error("Order {id} already exists")]
    OrderExists { id: String },

    #[error("Process step {id} not found")]
    StepNotFound { id: i64 },

    #[error("Invalid step chain: {0}")]
    InvalidStepChain(String),

    #[error(
        "Invalid amount {amount}: must be between 1 and {max}",
        max = crate::factory::models::MAX_ORDER_AMOUNT
    )]
    InvalidAmount { amount: i64 },

    #[error("Invalid order status '{status}'")]
    InvalidStatus { status: String },

    #[error("Simulation driver already running for order {id}")]
    DriverAlreadyRunning { id: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FactoryError {
    /// True for errors caused by the caller's input rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidStepChain(_)
                | Self::InvalidAmount { .. }
                | Self::InvalidStatus { .. }
                | Self::BadRequest(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::OrderNotFound { .. } | Self::StepNotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::OrderExists { .. } | Self::DriverAlreadyRunning { .. })
    }
}

//! Factory line simulation back-end.
//!
//! ## Overview
//!
//! Orders move a batch of pieces through a chain of process steps. Every
//! step is performed at a named station, and a station works on one piece at
//! a time. The simulation is advanced in discrete ticks against a SQLite
//! database, so several processes can share one line.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ Simulator::tick() / view() / reset()   │
//!                       │         v                                        │
//!                       │  simulator.rs (clock + DbHandle + events)        │
//!                       │         │            ^                           │
//!                       │         │            └── driver.rs (interval)    │
//!                       │         v                                        │
//!                       │  engine.rs  (completion sweep, dispatch)         │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  db.rs  (FactoryDb, BEGIN IMMEDIATE per tick)    │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                          |
//! |-----------|---------------------------------------------------------|
//! | `models`  | Shared types: `Order`, `ProcessStep`, `TickReport`      |
//! | `catalog` | Step lookups by id and by station; default catalog      |
//! | `clock`   | `Clock` trait, `SystemClock`, `ManualClock`             |
//! | `ws`      | `WsMessage` enum + `broadcast_message()` helper         |

pub mod api;
pub mod catalog;
pub mod clock;
pub mod db;
pub mod driver;
pub mod engine;
pub mod models;
pub mod server;
pub mod simulator;
pub mod ws;

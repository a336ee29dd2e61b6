//! Sandbox pool, task orchestration and trace archival for the computer-use
//! agent backend.

pub mod agent;
pub mod archival;
pub mod config;
pub mod connection;
pub mod error;
pub mod orchestrator;
pub mod sandbox;
pub mod session;
pub mod state;

pub use state::AppState;

//! SQLite persistence for consent, execution audit, the simulated backend
//! catalog and database-sourced backend descriptors.

pub mod database;
pub mod errors;
pub mod types;

pub use database::{BridgeDatabase, SharedDatabase};
pub use errors::StoreError;
pub use types::{ConsentRecord, ExecutionRecord, ExecutionStatus, SimulatedCall, SimulatedTool};

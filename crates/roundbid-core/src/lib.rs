// Library crate for the round-based auction allocation engine.
// Exposes the component modules for the server binary and integration tests.

pub mod allocation;
pub mod audit;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod finalize;
pub mod ledger;
pub mod locks;
pub mod model;
pub mod tiebreaker;
pub mod ties;

pub use engine::{Engine, RoundCompilation};
pub use error::{EngineError, EngineResult, ErrorKind};

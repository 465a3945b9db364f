// Library root. Exposes the engine for the binary and for integration
// tests in `tests/`. Production entry point remains `src/main.rs`.

pub mod alerts;
pub mod api;
pub mod audit;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod mocks;
pub mod records;
pub mod registry;
pub mod repository;
pub mod scheduler;
pub mod store;
pub mod sync;

// Binary plumbing. Public so integration tests can reach them, but they
// hold no engine logic.
pub mod cli;
pub mod config;
pub mod logging;

pub use engine::{EdgeEngine, EngineConfig};
pub use error::EngineError;

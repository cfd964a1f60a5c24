#![deny(unsafe_code)]

//! Shared test utilities for the sigpost workspace.
//!
//! Provides reusable fixtures, config builders, and tracing helpers so that
//! individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! sigpost-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod pair;
pub mod store;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use pair::{InteractionOutcome, run_interaction};
pub use store::TestStore;
pub use tracing_setup::init_test_tracing;

//! Worker runtime library.
//!
//! Exposes the runtime and the per-session driver for integration tests.
//! The binary `main.rs` depends on this library target.

pub mod driver;
pub mod runtime;

pub use driver::{drive_session, DriverConfig, SlotGuard};
pub use runtime::{hostname, WorkerConfig, WorkerRuntime};

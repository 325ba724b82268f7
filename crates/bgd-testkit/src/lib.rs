//! Test support for BrowserGrid: a deterministic, in-memory provisioner.
//!
//! No network, no child processes, no randomness. Scenario tests script the
//! driver's behaviour (start failures, health decay) and assert against its
//! call journal afterwards.

pub mod fake_provisioner;

pub use fake_provisioner::FakeProvisioner;

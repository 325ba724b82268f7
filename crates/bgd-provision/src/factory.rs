//! Provisioner factory — catalogue of available drivers.
//!
//! Drivers register by their type string; consumers look up by string, which
//! keeps the driver set closed over pluggable keys without inheritance.
//! Insertion order is preserved in `list_types()` output so registration
//! order is observable and deterministic.

use std::sync::{Arc, OnceLock, RwLock};

use crate::Provisioner;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by [`ProvisionerFactory`] operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FactoryError {
    /// A driver with the given kind is already registered.
    DuplicateKind { kind: String },
    /// No driver with the given kind is registered.
    UnknownKind { kind: String, available: Vec<String> },
    /// The driver kind is empty or contains only whitespace.
    EmptyKind,
}

impl std::fmt::Display for FactoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateKind { kind } => {
                write!(f, "provisioner '{kind}' is already registered")
            }
            Self::UnknownKind { kind, available } => write!(
                f,
                "no provisioner named '{kind}' is registered (available: {})",
                available.join(", ")
            ),
            Self::EmptyKind => write!(f, "provisioner kind must not be empty"),
        }
    }
}

impl std::error::Error for FactoryError {}

// ---------------------------------------------------------------------------
// ProvisionerFactory
// ---------------------------------------------------------------------------

/// Catalogue of available provisioner drivers, keyed by kind string.
///
/// Kinds are compared case-sensitively. Entries are shared `Arc`s: the same
/// driver instance serves every session driver in the process.
#[derive(Default)]
pub struct ProvisionerFactory {
    /// Entries in insertion order.
    entries: Vec<Arc<dyn Provisioner>>,
}

impl ProvisionerFactory {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a driver under its `kind()`.
    ///
    /// # Errors
    /// - [`FactoryError::EmptyKind`] if the driver reports an empty kind.
    /// - [`FactoryError::DuplicateKind`] if the kind is already taken.
    pub fn register(&mut self, driver: Arc<dyn Provisioner>) -> Result<(), FactoryError> {
        let kind = driver.kind().to_string();
        if kind.trim().is_empty() {
            return Err(FactoryError::EmptyKind);
        }
        if self.contains(&kind) {
            return Err(FactoryError::DuplicateKind { kind });
        }
        self.entries.push(driver);
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.iter().any(|e| e.kind() == kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered kinds in insertion order.
    pub fn list_types(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.kind().to_string()).collect()
    }

    /// Look up a driver by kind.
    ///
    /// # Errors
    /// [`FactoryError::UnknownKind`] if the kind is not registered.
    pub fn get(&self, kind: &str) -> Result<Arc<dyn Provisioner>, FactoryError> {
        self.entries
            .iter()
            .find(|e| e.kind() == kind)
            .cloned()
            .ok_or_else(|| FactoryError::UnknownKind {
                kind: kind.to_string(),
                available: self.list_types(),
            })
    }
}

// ---------------------------------------------------------------------------
// Process-wide factory
// ---------------------------------------------------------------------------

fn global_factory() -> &'static RwLock<ProvisionerFactory> {
    static GLOBAL: OnceLock<RwLock<ProvisionerFactory>> = OnceLock::new();
    GLOBAL.get_or_init(|| RwLock::new(ProvisionerFactory::new()))
}

/// Register a driver into the process-wide factory. Call at init, before
/// any worker loop starts.
pub fn register_global(driver: Arc<dyn Provisioner>) -> Result<(), FactoryError> {
    global_factory()
        .write()
        .expect("provisioner factory lock poisoned")
        .register(driver)
}

/// Look up a driver in the process-wide factory.
pub fn global_get(kind: &str) -> Result<Arc<dyn Provisioner>, FactoryError> {
    global_factory()
        .read()
        .expect("provisioner factory lock poisoned")
        .get(kind)
}

/// Kinds registered in the process-wide factory, in registration order.
pub fn global_types() -> Vec<String> {
    global_factory()
        .read()
        .expect("provisioner factory lock poisoned")
        .list_types()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use bgd_schemas::{NewSessionMetrics, Session};

    use crate::Endpoints;

    struct NullDriver {
        kind: &'static str,
    }

    #[async_trait]
    impl Provisioner for NullDriver {
        async fn start(&self, _session: &mut Session) -> Result<Endpoints> {
            Err(anyhow!("null driver cannot start sessions"))
        }

        async fn stop(&self, _session: &Session) -> Result<()> {
            Ok(())
        }

        async fn health_check(&self, _session: &Session) -> Result<()> {
            Ok(())
        }

        async fn get_metrics(&self, session: &Session) -> Result<NewSessionMetrics> {
            Ok(NewSessionMetrics::zeroed(session.id))
        }

        fn kind(&self) -> &str {
            self.kind
        }
    }

    fn null(kind: &'static str) -> Arc<dyn Provisioner> {
        Arc::new(NullDriver { kind })
    }

    #[test]
    fn register_single_driver_succeeds() {
        let mut f = ProvisionerFactory::new();
        assert!(f.register(null("docker")).is_ok());
        assert_eq!(f.len(), 1);
        assert!(f.contains("docker"));
    }

    #[test]
    fn register_duplicate_kind_errors() {
        let mut f = ProvisionerFactory::new();
        f.register(null("docker")).unwrap();
        let err = f.register(null("docker"));
        assert_eq!(
            err,
            Err(FactoryError::DuplicateKind {
                kind: "docker".to_string()
            })
        );
    }

    #[test]
    fn register_empty_kind_errors() {
        let mut f = ProvisionerFactory::new();
        assert_eq!(f.register(null("")), Err(FactoryError::EmptyKind));
        assert_eq!(f.register(null("   ")), Err(FactoryError::EmptyKind));
    }

    #[test]
    fn list_types_preserves_insertion_order() {
        let mut f = ProvisionerFactory::new();
        f.register(null("docker")).unwrap();
        f.register(null("local")).unwrap();
        f.register(null("firecracker")).unwrap();
        assert_eq!(f.list_types(), ["docker", "local", "firecracker"]);
    }

    #[test]
    fn get_known_kind_returns_driver() {
        let mut f = ProvisionerFactory::new();
        f.register(null("local")).unwrap();
        let d = f.get("local").unwrap();
        assert_eq!(d.kind(), "local");
    }

    #[test]
    fn get_unknown_kind_errors_with_available_list() {
        let mut f = ProvisionerFactory::new();
        f.register(null("local")).unwrap();
        let err = f.get("docker");
        assert_eq!(
            err.err(),
            Some(FactoryError::UnknownKind {
                kind: "docker".to_string(),
                available: vec!["local".to_string()],
            })
        );
    }

    #[test]
    fn new_factory_is_empty() {
        let f = ProvisionerFactory::new();
        assert!(f.is_empty());
        assert_eq!(f.len(), 0);
        assert!(f.list_types().is_empty());
    }

    #[test]
    fn global_registration_round_trip() {
        // The global factory is shared across tests in this binary; use a
        // kind no other test registers.
        register_global(null("null-global")).unwrap();
        assert!(global_types().contains(&"null-global".to_string()));
        assert_eq!(global_get("null-global").unwrap().kind(), "null-global");

        let dup = register_global(null("null-global"));
        assert_eq!(
            dup,
            Err(FactoryError::DuplicateKind {
                kind: "null-global".to_string()
            })
        );
    }
}

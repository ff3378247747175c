//! Persistence environment helpers.

use crate::shop::shop_schema;
use relmap_core::{Persistence, Session};
use relmap_storage::{MemoryBackend, StorageBackend};
use std::sync::Arc;

/// An in-memory shop persistence environment.
///
/// Keeps the backend handle exposed so tests can inject faults or open a
/// second session over the same store.
pub struct ShopEnv {
    /// The persistence handle over the shop schema.
    pub persistence: Persistence,
    /// The shared in-memory backend.
    pub backend: Arc<MemoryBackend>,
}

impl ShopEnv {
    /// Creates an environment with caller-generated ids.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()))
    }

    /// Creates an environment whose backend assigns ids.
    #[must_use]
    pub fn storage_assigned() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::storage_assigned()))
    }

    fn with_backend(backend: Arc<MemoryBackend>) -> Self {
        let shared: Arc<dyn StorageBackend> = backend.clone();
        Self {
            persistence: Persistence::new(shop_schema(), shared),
            backend,
        }
    }

    /// Opens a session.
    #[must_use]
    pub fn session(&self) -> Session {
        self.persistence.session()
    }
}

impl Default for ShopEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a test body with a fresh shop session.
///
/// # Example
///
/// ```rust,ignore
/// use relmap_testkit::with_session;
///
/// #[test]
/// fn my_test() {
///     with_session(|session| {
///         // ... session operations
///     });
/// }
/// ```
pub fn with_session<F, R>(f: F) -> R
where
    F: FnOnce(&mut Session) -> R,
{
    let env = ShopEnv::new();
    let mut session = env.session();
    f(&mut session)
}

//! The schema catalog boundary.
//!
//! The client only needs to know whether the catalog is cached, which version
//! it is at, and how to turn space/index names into ids. The real catalog
//! (fetched from the server's meta spaces) plugs in behind [`SchemaMeta`];
//! [`StaticSchema`] is a self-contained in-memory implementation.

use crate::error::ClientError;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("space '{0}' does not exist")]
    SpaceNotFound(String),
    #[error("index '{index}' does not exist in space '{space}'")]
    IndexNotFound { space: String, index: String },
}

impl std::fmt::Debug for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// A pluggable, internally synchronized schema cache.
///
/// `refresh` is invoked from the client's work executor; implementations
/// usually fetch the catalog through the very client that holds them, which
/// is why it returns a boxed future instead of borrowing generics.
pub trait SchemaMeta: Send + Sync + 'static {
    /// Whether the catalog has been loaded at least once.
    fn is_initialized(&self) -> bool;

    /// The cached schema version.
    fn version(&self) -> u64;

    fn resolve_space(&self, space: &str) -> Result<u64, SchemaError>;

    fn resolve_index(&self, space: &str, index: &str) -> Result<u64, SchemaError>;

    /// Reload the catalog from the server.
    fn refresh(&self) -> BoxFuture<'_, Result<(), ClientError>>;
}

struct SpaceEntry {
    id: u64,
    indexes: FxHashMap<String, u64>,
}

/// In-memory [`SchemaMeta`] with a staged version that `refresh` adopts.
/// Used by the test suite and by deployments with a fixed, known schema.
pub struct StaticSchema {
    initialized: AtomicBool,
    version: AtomicU64,
    staged_version: AtomicU64,
    refresh_count: AtomicU64,
    spaces: RwLock<FxHashMap<String, SpaceEntry>>,
}

impl Default for StaticSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticSchema {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            version: AtomicU64::new(0),
            staged_version: AtomicU64::new(0),
            refresh_count: AtomicU64::new(0),
            spaces: RwLock::new(FxHashMap::default()),
        }
    }

    /// An already-initialized cache at the given version.
    pub fn initialized_at(version: u64) -> Self {
        let s = Self::new();
        s.initialized.store(true, Ordering::Release);
        s.version.store(version, Ordering::Release);
        s.staged_version.store(version, Ordering::Release);
        s
    }

    pub fn add_space(&self, name: &str, id: u64) {
        let mut spaces = self.spaces.write().unwrap();
        spaces.insert(name.to_string(), SpaceEntry { id, indexes: FxHashMap::default() });
    }

    pub fn add_index(&self, space: &str, index: &str, id: u64) {
        let mut spaces = self.spaces.write().unwrap();
        if let Some(entry) = spaces.get_mut(space) {
            entry.indexes.insert(index.to_string(), id);
        }
    }

    /// The version the next `refresh` call will report.
    pub fn stage_version(&self, version: u64) {
        self.staged_version.store(version, Ordering::Release);
    }

    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::Acquire)
    }
}

impl SchemaMeta for StaticSchema {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn resolve_space(&self, space: &str) -> Result<u64, SchemaError> {
        let spaces = self.spaces.read().unwrap();
        spaces.get(space).map(|s| s.id).ok_or_else(|| SchemaError::SpaceNotFound(space.to_string()))
    }

    fn resolve_index(&self, space: &str, index: &str) -> Result<u64, SchemaError> {
        let spaces = self.spaces.read().unwrap();
        let entry =
            spaces.get(space).ok_or_else(|| SchemaError::SpaceNotFound(space.to_string()))?;
        entry.indexes.get(index).copied().ok_or_else(|| SchemaError::IndexNotFound {
            space: space.to_string(),
            index: index.to_string(),
        })
    }

    fn refresh(&self) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            self.refresh_count.fetch_add(1, Ordering::AcqRel);
            self.initialized.store(true, Ordering::Release);
            let staged = self.staged_version.load(Ordering::Acquire);
            self.version.fetch_max(staged, Ordering::AcqRel);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_schema_refresh_adopts_staged_version() {
        let schema = StaticSchema::new();
        assert!(!schema.is_initialized());
        schema.stage_version(10);
        schema.refresh().await.expect("refresh");
        assert!(schema.is_initialized());
        assert_eq!(schema.version(), 10);
        assert_eq!(schema.refresh_count(), 1);
        // a stale staged version never rolls the cache back
        schema.stage_version(4);
        schema.refresh().await.expect("refresh");
        assert_eq!(schema.version(), 10);
    }

    #[test]
    fn test_name_resolution() {
        let schema = StaticSchema::initialized_at(1);
        schema.add_space("users", 512);
        schema.add_index("users", "primary", 0);
        assert_eq!(schema.resolve_space("users").unwrap(), 512);
        assert_eq!(schema.resolve_index("users", "primary").unwrap(), 0);
        assert_eq!(
            schema.resolve_space("ghost"),
            Err(SchemaError::SpaceNotFound("ghost".into()))
        );
        assert!(matches!(
            schema.resolve_index("users", "ghost"),
            Err(SchemaError::IndexNotFound { .. })
        ));
    }
}

//! The blockstore transport interface and the `kind -> constructor` registry.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Free-form options handed to a driver factory at registration time.
pub type DriverOptions = BTreeMap<String, String>;

/// The file-like namespace every blockstore transport must provide.
///
/// Paths are `/`-joined logical strings relative to the store root; drivers
/// map them onto their own namespace. A driver holds connection and
/// credential material in its persisted config file and is otherwise
/// stateless with respect to the engine.
#[async_trait]
pub trait BlockStoreDriver: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> &str;

    /// True iff the object at that logical path is fully written.
    async fn file_exists(&self, dir: &str, name: &str) -> bool;

    /// Exact byte length of the object, or `None` if it is absent.
    async fn file_size(&self, dir: &str, name: &str) -> Result<Option<u64>>;

    /// Idempotent directory creation.
    async fn mkdir_all(&self, dir: &str) -> Result<()>;

    /// Idempotent removal of a file or directory subtree.
    async fn remove_all(&self, path: &str) -> Result<()>;

    /// Fill `buf` with the object's contents. Fails unless `buf.len()`
    /// equals the stored size.
    async fn read(&self, dir: &str, name: &str, buf: &mut [u8]) -> Result<()>;

    /// Store an object. Atomic from a reader's perspective: the object is
    /// either absent or fully present with these bytes.
    async fn write(&self, data: &[u8], dir: &str, name: &str) -> Result<()>;

    /// Upload a local file into the logical directory `dest`, keeping its
    /// file name.
    async fn copy_to_path(&self, src: &Path, dest: &str) -> Result<()>;
}

/// Constructor for one transport kind.
///
/// Called with `Some(opts)` the factory persists its own config under
/// `config_file`; called with `None` it reloads a previously persisted
/// config from the same path.
#[async_trait]
pub trait BlockStoreDriverFactory: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn create(
        &self,
        config_file: &Path,
        id: &str,
        opts: Option<&DriverOptions>,
    ) -> Result<Box<dyn BlockStoreDriver>>;
}

/// Explicit `kind -> factory` table.
///
/// Built once at startup and handed to the manager, so test suites can
/// assemble isolated registries instead of sharing process-global state.
#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<&'static str, Arc<dyn BlockStoreDriverFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn BlockStoreDriverFactory>) -> Result<()> {
        let kind = factory.kind();
        if self.factories.contains_key(kind) {
            return Err(Error::AlreadyExists(format!("blockstore driver {kind}")));
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    pub async fn create(
        &self,
        kind: &str,
        config_file: &Path,
        id: &str,
        opts: Option<&DriverOptions>,
    ) -> Result<Box<dyn BlockStoreDriver>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| Error::NotFound(format!("blockstore driver {kind}")))?;
        factory.create(config_file, id, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::VfsDriverFactory;

    #[tokio::test]
    async fn double_registration_of_a_kind_fails() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(VfsDriverFactory)).unwrap();
        let err = registry.register(Arc::new(VfsDriverFactory)).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn unknown_kind_is_not_found() {
        let registry = DriverRegistry::new();
        let err = registry
            .create("s3", Path::new("/tmp/none.cfg"), "bs", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

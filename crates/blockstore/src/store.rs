//! Blockstore and volume registries, persisted records, and the remote
//! object layout.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::codec;
use crate::driver::{BlockStoreDriver, DriverOptions, DriverRegistry};
use crate::error::{Error, Result};

/// Well-known prefix every remote object lives under.
pub const BLOCKSTORE_BASE: &str = "rancher-blockstore";

/// Block size chosen at registration when none is given: 2 MiB.
pub const DEFAULT_BLOCK_SIZE: u32 = 2_097_152;

const VOLUME_DIRECTORY: &str = "volume";
const VOLUME_CONFIG_FILE: &str = "volume.cfg";
const SNAPSHOTS_DIRECTORY: &str = "snapshots";
const SNAPSHOT_CONFIG_PREFIX: &str = "snapshot-";
const BLOCKS_DIRECTORY: &str = "blocks";
const BLOCK_SEPARATE_LAYER1: usize = 2;
const BLOCK_SEPARATE_LAYER2: usize = 4;
const BLOCK_FILE_SUFFIX: &str = ".blk";
const CONFIG_SUFFIX: &str = ".cfg";

/// One tracked volume inside a blockstore record. Only `last_snapshot_id`
/// ever changes after the volume is added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Logical size in bytes of the source volume at registration.
    pub size: u64,
    /// Upstream image this volume derives from; opaque to the engine.
    pub base: String,
    /// Most recent successfully backed-up snapshot, empty before the first
    /// backup.
    pub last_snapshot_id: String,
}

/// Locally persisted, logically authoritative record of one registered
/// blockstore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockStore {
    pub kind: String,
    /// Immutable after registration.
    pub block_size: u32,
    pub volumes: BTreeMap<String, Volume>,
}

/// One `offset -> digest` entry of a snapshot manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapping {
    pub offset: u64,
    pub block: String,
}

/// Offset-sorted manifest describing every live block of one snapshot.
/// Offsets it does not name read as zeros.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMap {
    pub id: String,
    pub blocks: Vec<BlockMapping>,
}

pub(crate) fn volume_path(volume_id: &str) -> String {
    format!("{BLOCKSTORE_BASE}/{VOLUME_DIRECTORY}/{volume_id}")
}

pub(crate) fn snapshots_path(volume_id: &str) -> String {
    format!("{}/{SNAPSHOTS_DIRECTORY}", volume_path(volume_id))
}

pub(crate) fn snapshot_config_name(snapshot_id: &str) -> String {
    format!("{SNAPSHOT_CONFIG_PREFIX}{snapshot_id}{CONFIG_SUFFIX}")
}

/// Remote directory and file name of the block object for `checksum`,
/// fanned out over two digest-prefix layers.
pub(crate) fn block_location(volume_id: &str, checksum: &str) -> (String, String) {
    let layer1 = &checksum[..BLOCK_SEPARATE_LAYER1];
    let layer2 = &checksum[BLOCK_SEPARATE_LAYER1..BLOCK_SEPARATE_LAYER2];
    let dir = format!(
        "{}/{BLOCKS_DIRECTORY}/{layer1}/{layer2}",
        volume_path(volume_id)
    );
    (dir, format!("{checksum}{BLOCK_FILE_SUFFIX}"))
}

/// Identifiers are opaque non-empty strings without path separators.
pub(crate) fn check_id(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Internal(format!("empty {what} identifier")));
    }
    if value.chars().any(|c| c == '/' || c == '\\') {
        return Err(Error::Internal(format!(
            "{what} identifier {value:?} contains a path separator"
        )));
    }
    Ok(())
}

/// Entry point of the engine.
///
/// Owns the local config root and the transport registry, and hands out a
/// per-`(blockstore, volume)` lock so backups of one volume serialize. The
/// local records it writes are the authoritative state; remote objects only
/// become visible once the matching record update lands.
pub struct BlockStoreManager {
    root: PathBuf,
    drivers: DriverRegistry,
    backup_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl BlockStoreManager {
    /// `root` is the local directory holding blockstore and driver config
    /// files. It must already exist.
    pub fn new(root: impl Into<PathBuf>, drivers: DriverRegistry) -> Self {
        Self {
            root: root.into(),
            drivers,
            backup_locks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn config_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}{CONFIG_SUFFIX}"))
    }

    pub(crate) fn driver_config_path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(format!("{id}-{kind}{CONFIG_SUFFIX}"))
    }

    /// Reinstantiate the transport of a registered blockstore from its
    /// persisted driver config.
    pub(crate) async fn instantiate_driver(
        &self,
        kind: &str,
        id: &str,
    ) -> Result<Box<dyn BlockStoreDriver>> {
        let config_file = self.driver_config_path(kind, id);
        self.drivers.create(kind, &config_file, id, None).await
    }

    pub(crate) async fn volume_lock(
        &self,
        blockstore_id: &str,
        volume_id: &str,
    ) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.backup_locks.lock().await;
            locks
                .entry((blockstore_id.to_owned(), volume_id.to_owned()))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Register a new blockstore `id` backed by the transport `kind`.
    ///
    /// The driver persists its own config under the local root, the remote
    /// volume base directory is created, and the blockstore record is
    /// written locally. Fails with [`Error::AlreadyExists`] if `id` is
    /// already registered under this root. `block_size` defaults to
    /// [`DEFAULT_BLOCK_SIZE`] and is immutable afterwards.
    pub async fn register(
        &self,
        kind: &str,
        id: &str,
        block_size: Option<u32>,
        opts: &DriverOptions,
    ) -> Result<()> {
        check_id("blockstore", id)?;
        check_id("driver kind", kind)?;
        let block_size = block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        if block_size == 0 {
            return Err(Error::Internal("block size must be positive".into()));
        }

        let driver_config = self.driver_config_path(kind, id);
        if codec::config_exists(&driver_config).await?
            || codec::config_exists(&self.config_path(id)).await?
        {
            return Err(Error::AlreadyExists(format!("blockstore {id}")));
        }
        let driver = self.drivers.create(kind, &driver_config, id, Some(opts)).await?;
        debug!("Created driver config {}", driver_config.display());

        let base = format!("{BLOCKSTORE_BASE}/{VOLUME_DIRECTORY}");
        if let Err(err) = driver.mkdir_all(&base).await {
            // Best-effort rollback of the driver config file.
            if let Err(remove_err) = codec::remove_config(&driver_config).await {
                warn!(
                    "Leaking driver config {}: {remove_err}",
                    driver_config.display()
                );
            }
            return Err(err);
        }
        debug!("Created base directory of blockstore at {base}");

        let record = BlockStore {
            kind: kind.to_owned(),
            block_size,
            volumes: BTreeMap::new(),
        };
        codec::save_config(&self.config_path(id), &record).await?;
        info!("Registered blockstore {id} (kind {kind}, block size {block_size})");
        Ok(())
    }

    /// Remove the local config files of blockstore `id`. Remote state is
    /// left intact.
    pub async fn deregister(&self, kind: &str, id: &str) -> Result<()> {
        check_id("blockstore", id)?;
        check_id("driver kind", kind)?;
        codec::remove_config(&self.driver_config_path(kind, id)).await?;
        codec::remove_config(&self.config_path(id)).await?;
        info!("Deregistered blockstore {id}");
        Ok(())
    }

    /// The persisted record of blockstore `id`.
    pub async fn blockstore(&self, id: &str) -> Result<BlockStore> {
        check_id("blockstore", id)?;
        codec::load_config(&self.config_path(id)).await
    }

    /// Start tracking `volume_id` inside blockstore `id`.
    ///
    /// Creates the remote per-volume directory and writes the volume record
    /// both into the local blockstore record and remotely as `volume.cfg`.
    /// A pre-existing remote volume config means another backup stream
    /// already targets the same prefix and fails the call before anything
    /// is recorded locally.
    pub async fn add_volume(
        &self,
        id: &str,
        volume_id: &str,
        base: &str,
        size: u64,
    ) -> Result<()> {
        check_id("blockstore", id)?;
        check_id("volume", volume_id)?;

        let config_file = self.config_path(id);
        let mut record: BlockStore = codec::load_config(&config_file).await?;
        if record.volumes.contains_key(volume_id) {
            return Err(Error::AlreadyExists(format!(
                "volume {volume_id} in blockstore {id}"
            )));
        }

        let driver = self.instantiate_driver(&record.kind, id).await?;
        let volume_dir = volume_path(volume_id);
        // An existing remote volume config means an independent backup
        // stream already owns this prefix; refuse before the local record
        // is touched, so the collision surfaces without any mutation.
        if driver.file_exists(&volume_dir, VOLUME_CONFIG_FILE).await {
            return Err(Error::AlreadyExists(format!(
                "volume config file in blockstore for volume {volume_id}"
            )));
        }
        driver.mkdir_all(&volume_dir).await?;
        debug!("Created volume directory {volume_dir}");

        let volume = Volume {
            size,
            base: base.to_owned(),
            last_snapshot_id: String::new(),
        };
        record.volumes.insert(volume_id.to_owned(), volume.clone());
        codec::save_config(&config_file, &record).await?;

        let data = serde_json::to_vec_pretty(&volume)?;
        driver.write(&data, &volume_dir, VOLUME_CONFIG_FILE).await?;
        debug!("Created volume config file {volume_dir}/{VOLUME_CONFIG_FILE}");
        Ok(())
    }

    /// Drop `volume_id` from blockstore `id`, removing its whole remote
    /// subtree. Blocks are scoped per volume, so nothing shared is lost.
    pub async fn remove_volume(&self, id: &str, volume_id: &str) -> Result<()> {
        check_id("blockstore", id)?;
        check_id("volume", volume_id)?;

        let config_file = self.config_path(id);
        let mut record: BlockStore = codec::load_config(&config_file).await?;
        if !record.volumes.contains_key(volume_id) {
            return Err(Error::NotFound(format!(
                "volume {volume_id} in blockstore {id}"
            )));
        }

        let driver = self.instantiate_driver(&record.kind, id).await?;
        let volume_dir = volume_path(volume_id);
        driver.remove_all(&volume_dir).await?;
        debug!("Removed volume directory {volume_dir}");

        record.volumes.remove(volume_id);
        codec::save_config(&config_file, &record).await?;
        info!("Removed volume {volume_id} from blockstore {id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::BlockStoreDriverFactory;
    use crate::vfs::{VfsDriverFactory, VFS_DRIVER_KIND, VFS_PATH_OPTION};
    use async_trait::async_trait;
    use std::path::Path;

    /// Second transport kind backed by the same vfs implementation, so the
    /// registry holds more than one factory.
    struct AltVfsFactory;

    #[async_trait]
    impl BlockStoreDriverFactory for AltVfsFactory {
        fn kind(&self) -> &'static str {
            "vfs-alt"
        }

        async fn create(
            &self,
            config_file: &Path,
            id: &str,
            opts: Option<&DriverOptions>,
        ) -> Result<Box<dyn BlockStoreDriver>> {
            VfsDriverFactory.create(config_file, id, opts).await
        }
    }

    fn test_manager(tmp: &tempfile::TempDir) -> (BlockStoreManager, DriverOptions) {
        let config_root = tmp.path().join("config");
        std::fs::create_dir_all(&config_root).unwrap();
        let mut drivers = DriverRegistry::new();
        drivers.register(Arc::new(VfsDriverFactory)).unwrap();
        drivers.register(Arc::new(AltVfsFactory)).unwrap();
        let mut opts = DriverOptions::new();
        opts.insert(
            VFS_PATH_OPTION.to_owned(),
            tmp.path().join("store").to_string_lossy().into_owned(),
        );
        (BlockStoreManager::new(config_root, drivers), opts)
    }

    #[test]
    fn block_location_fans_out_by_digest_prefix() {
        let checksum = "ab12cd0000000000000000000000000000000000000000000000000000000000";
        let (dir, name) = block_location("vol1", checksum);
        assert_eq!(dir, "rancher-blockstore/volume/vol1/blocks/ab/12");
        assert_eq!(name, format!("{checksum}.blk"));
    }

    #[test]
    fn snapshot_manifest_naming() {
        assert_eq!(snapshot_config_name("snap1"), "snapshot-snap1.cfg");
        assert_eq!(
            snapshots_path("vol1"),
            "rancher-blockstore/volume/vol1/snapshots"
        );
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(check_id("volume", "vol1").is_ok());
        assert!(matches!(
            check_id("volume", "").unwrap_err(),
            Error::Internal(_)
        ));
        assert!(matches!(
            check_id("volume", "a/b").unwrap_err(),
            Error::Internal(_)
        ));
    }

    #[tokio::test]
    async fn register_is_exclusive_per_root() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, opts) = test_manager(&tmp);

        manager
            .register(VFS_DRIVER_KIND, "bs1", None, &opts)
            .await
            .unwrap();
        let record = manager.blockstore("bs1").await.unwrap();
        assert_eq!(record.kind, VFS_DRIVER_KIND);
        assert_eq!(record.block_size, DEFAULT_BLOCK_SIZE);
        assert!(record.volumes.is_empty());

        let err = manager
            .register(VFS_DRIVER_KIND, "bs1", None, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn register_same_id_under_other_kind_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, opts) = test_manager(&tmp);

        manager
            .register(VFS_DRIVER_KIND, "bs1", None, &opts)
            .await
            .unwrap();

        // A different kind means a different driver config file, so only
        // the record check can catch the id collision.
        let err = manager
            .register("vfs-alt", "bs1", None, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(manager.blockstore("bs1").await.unwrap().kind, VFS_DRIVER_KIND);
    }

    #[tokio::test]
    async fn deregister_allows_reregistration() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, opts) = test_manager(&tmp);

        manager
            .register(VFS_DRIVER_KIND, "bs1", Some(4096), &opts)
            .await
            .unwrap();
        manager.deregister(VFS_DRIVER_KIND, "bs1").await.unwrap();
        assert!(matches!(
            manager.blockstore("bs1").await.unwrap_err(),
            Error::NotFound(_)
        ));

        manager
            .register(VFS_DRIVER_KIND, "bs1", Some(4096), &opts)
            .await
            .unwrap();
        assert_eq!(manager.blockstore("bs1").await.unwrap().block_size, 4096);
    }

    #[tokio::test]
    async fn register_rejects_zero_block_size() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, opts) = test_manager(&tmp);
        let err = manager
            .register(VFS_DRIVER_KIND, "bs1", Some(0), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}

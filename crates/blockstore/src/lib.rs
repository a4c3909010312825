//! Content-addressed incremental snapshot backups for block volumes.
//!
//! Given a source driver that can diff two snapshots into dirty extents and
//! read blocks at offsets, the engine copies only the blocks that changed
//! since the previous backup into a remote blockstore, deduplicating them by
//! a digest of their contents. Each backed-up snapshot is described by a
//! manifest mapping block-aligned offsets to block digests; any offset a
//! manifest does not name reads as zeros.
//!
//! All remote I/O goes through the [`BlockStoreDriver`] transport trait, so
//! the same engine works against a local directory, an object store, or
//! anything else that can satisfy the file-like contract. A filesystem
//! implementation ships as [`VfsBlockStoreDriver`].
//!
//! [`BlockStoreManager`] is the entry point: it owns the local config root
//! and a [`DriverRegistry`] of transport factories, and exposes blockstore
//! registration, volume tracking, and [`backup_snapshot`] itself.
//!
//! [`backup_snapshot`]: BlockStoreManager::backup_snapshot

mod backup;
mod codec;
mod driver;
mod error;
mod source;
mod store;
mod vfs;

pub use backup::merge_snapshot_map;
pub use codec::{block_digest, PRESERVED_CHECKSUM_LENGTH};
pub use driver::{BlockStoreDriver, BlockStoreDriverFactory, DriverOptions, DriverRegistry};
pub use error::{Error, Result};
pub use source::{Delta, Extent, SourceDriver};
pub use store::{
    BlockMapping, BlockStore, BlockStoreManager, SnapshotMap, Volume, BLOCKSTORE_BASE,
    DEFAULT_BLOCK_SIZE,
};
pub use vfs::{VfsBlockStoreDriver, VfsDriverFactory, VFS_DRIVER_KIND, VFS_PATH_OPTION};

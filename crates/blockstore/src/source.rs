//! Contract of the local snapshot source.

use async_trait::async_trait;

use crate::error::Result;

/// One contiguous dirty range of a volume. Offset and size are both
/// multiples of the delta's block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub size: u64,
}

/// Difference between two snapshots of one volume as reported by the source
/// driver. Extents are ascending by offset and non-overlapping.
#[derive(Debug, Clone)]
pub struct Delta {
    pub block_size: u32,
    pub mappings: Vec<Extent>,
}

/// A block-device driver able to diff snapshots and read blocks at offsets.
#[async_trait]
pub trait SourceDriver: Send + Sync {
    /// Dirty extents of `snapshot_id` relative to `last_snapshot_id`. An
    /// empty `last_snapshot_id` means the delta covers every live block of
    /// the snapshot.
    async fn compare_snapshot(
        &self,
        snapshot_id: &str,
        last_snapshot_id: &str,
        volume_id: &str,
    ) -> Result<Delta>;

    /// Read `buf.len()` bytes from the snapshot at `offset`.
    async fn read_snapshot(
        &self,
        snapshot_id: &str,
        volume_id: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()>;
}

//! The incremental snapshot backup pipeline and the manifest merge.

use std::cmp::Ordering;

use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::source::{Delta, SourceDriver};
use crate::store::{
    block_location, check_id, snapshot_config_name, snapshots_path, BlockMapping, BlockStore,
    BlockStoreManager, SnapshotMap, Volume,
};

impl BlockStoreManager {
    /// Back up `snapshot_id` of `volume_id` into blockstore `blockstore_id`.
    ///
    /// Walks the dirty extents `source` reports against the volume's last
    /// backed-up snapshot, uploads only blocks whose digest is not yet in
    /// the store, writes the merged snapshot manifest, and finally advances
    /// the last-snapshot pointer in the local record. That pointer advance
    /// is the commit point: a failure anywhere before it leaves at most
    /// orphan block objects, with the previous snapshot chain intact and
    /// the call safe to retry.
    pub async fn backup_snapshot(
        &self,
        source: &dyn SourceDriver,
        snapshot_id: &str,
        volume_id: &str,
        blockstore_id: &str,
    ) -> Result<()> {
        check_id("snapshot", snapshot_id)?;
        check_id("volume", volume_id)?;
        check_id("blockstore", blockstore_id)?;
        let _guard = self.volume_lock(blockstore_id, volume_id).await;

        let config_file = self.config_path(blockstore_id);
        let mut record: BlockStore = codec::load_config(&config_file).await?;
        let volume = record.volumes.get(volume_id).cloned().ok_or_else(|| {
            Error::NotFound(format!("volume {volume_id} in blockstore {blockstore_id}"))
        })?;
        let driver = self.instantiate_driver(&record.kind, blockstore_id).await?;

        let last_snapshot_id = volume.last_snapshot_id.clone();
        let mut last_map = SnapshotMap::default();
        // Check the last manifest before any block is uploaded: a broken
        // chain must refuse the whole backup.
        if !last_snapshot_id.is_empty() {
            let dir = snapshots_path(volume_id);
            let name = snapshot_config_name(&last_snapshot_id);
            let size = driver.file_size(&dir, &name).await?.ok_or_else(|| {
                Error::NotFound(format!(
                    "last snapshot {last_snapshot_id} of volume {volume_id} in blockstore"
                ))
            })?;
            let mut data = vec![0u8; size as usize];
            driver.read(&dir, &name, &mut data).await?;
            last_map = serde_json::from_slice(&data)?;
            debug!("Loaded last snapshot {last_snapshot_id}");
        }

        let delta = source
            .compare_snapshot(snapshot_id, &last_snapshot_id, volume_id)
            .await?;
        if delta.block_size != record.block_size {
            return Err(Error::ConfigMismatch(format!(
                "driver block size {} differs from blockstore block size {}",
                delta.block_size, record.block_size
            )));
        }
        let block_size = u64::from(record.block_size);
        validate_delta(&delta, block_size)?;

        let mut delta_map = SnapshotMap::default();
        let mut block = vec![0u8; record.block_size as usize];
        for extent in &delta.mappings {
            for i in 0..extent.size / block_size {
                let offset = extent.offset + i * block_size;
                source
                    .read_snapshot(snapshot_id, volume_id, offset, &mut block)
                    .await?;
                let checksum = codec::block_digest(&block);
                let (dir, name) = block_location(volume_id, &checksum);
                if driver.file_size(&dir, &name).await?.is_some() {
                    debug!("Found existing block match at {dir}/{name}");
                } else {
                    driver.mkdir_all(&dir).await?;
                    driver.write(&block, &dir, &name).await?;
                    debug!("Created new block file at {dir}/{name}");
                }
                delta_map.blocks.push(BlockMapping {
                    offset,
                    block: checksum,
                });
            }
        }

        let snapshot_map = merge_snapshot_map(snapshot_id, delta_map, &last_map);
        let dir = snapshots_path(volume_id);
        let name = snapshot_config_name(snapshot_id);
        if driver.file_exists(&dir, &name).await {
            warn!("Snapshot manifest {dir}/{name} already exists, replacing it");
            driver.remove_all(&format!("{dir}/{name}")).await?;
        }
        let data = serde_json::to_vec_pretty(&snapshot_map)?;
        driver.write(&data, &dir, &name).await?;

        // Commit point.
        record.volumes.insert(
            volume_id.to_owned(),
            Volume {
                last_snapshot_id: snapshot_id.to_owned(),
                ..volume
            },
        );
        codec::save_config(&config_file, &record).await?;
        info!("Backed up snapshot {snapshot_id} of volume {volume_id} to {blockstore_id}");
        Ok(())
    }
}

/// The source driver must hand over block-aligned extents, ascending by
/// offset and non-overlapping.
fn validate_delta(delta: &Delta, block_size: u64) -> Result<()> {
    let mut next_offset = 0u64;
    for extent in &delta.mappings {
        if extent.offset % block_size != 0 || extent.size % block_size != 0 {
            return Err(Error::BadExtent(format!(
                "extent {{offset {}, size {}}} is not aligned to block size {block_size}",
                extent.offset, extent.size
            )));
        }
        if extent.offset < next_offset {
            return Err(Error::BadExtent(format!(
                "extent at offset {} overlaps or precedes the previous extent",
                extent.offset
            )));
        }
        next_offset = extent.offset + extent.size;
    }
    Ok(())
}

/// Fold the delta manifest over the previous snapshot's manifest into the
/// self-contained manifest for `id`.
///
/// Both inputs are ascending by offset; on a shared offset the delta entry
/// shadows the old one. The result covers every offset either side covers.
pub fn merge_snapshot_map(id: &str, mut delta: SnapshotMap, last: &SnapshotMap) -> SnapshotMap {
    if last.blocks.is_empty() {
        delta.id = id.to_owned();
        return delta;
    }

    let mut blocks = Vec::with_capacity(delta.blocks.len().max(last.blocks.len()));
    let (mut d, mut l) = (0, 0);
    while d < delta.blocks.len() && l < last.blocks.len() {
        match delta.blocks[d].offset.cmp(&last.blocks[l].offset) {
            Ordering::Equal => {
                blocks.push(delta.blocks[d].clone());
                d += 1;
                l += 1;
            }
            Ordering::Less => {
                blocks.push(delta.blocks[d].clone());
                d += 1;
            }
            Ordering::Greater => {
                blocks.push(last.blocks[l].clone());
                l += 1;
            }
        }
    }
    // Whichever side outlives the other still belongs to the snapshot.
    blocks.extend_from_slice(&delta.blocks[d..]);
    blocks.extend_from_slice(&last.blocks[l..]);

    SnapshotMap {
        id: id.to_owned(),
        blocks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Extent;

    fn map(entries: &[(u64, &str)]) -> SnapshotMap {
        SnapshotMap {
            id: String::new(),
            blocks: entries
                .iter()
                .map(|&(offset, block)| BlockMapping {
                    offset,
                    block: block.to_owned(),
                })
                .collect(),
        }
    }

    fn offsets_and_blocks(merged: &SnapshotMap) -> Vec<(u64, &str)> {
        merged
            .blocks
            .iter()
            .map(|b| (b.offset, b.block.as_str()))
            .collect()
    }

    #[test]
    fn merge_with_empty_last_keeps_delta() {
        let merged = merge_snapshot_map("s1", map(&[(0, "a"), (4096, "b")]), &map(&[]));
        assert_eq!(merged.id, "s1");
        assert_eq!(offsets_and_blocks(&merged), vec![(0, "a"), (4096, "b")]);
    }

    #[test]
    fn merge_delta_shadows_shared_offsets() {
        let last = map(&[(0, "z"), (4096, "z"), (8192, "z")]);
        let delta = map(&[(4096, "x")]);
        let merged = merge_snapshot_map("s2", delta, &last);
        assert_eq!(
            offsets_and_blocks(&merged),
            vec![(0, "z"), (4096, "x"), (8192, "z")]
        );
    }

    #[test]
    fn merge_appends_last_tail() {
        let last = map(&[(0, "a"), (4096, "b"), (8192, "c")]);
        let delta = map(&[(0, "d")]);
        let merged = merge_snapshot_map("s2", delta, &last);
        assert_eq!(
            offsets_and_blocks(&merged),
            vec![(0, "d"), (4096, "b"), (8192, "c")]
        );
    }

    #[test]
    fn merge_appends_delta_tail_past_last_end() {
        let last = map(&[(0, "a"), (4096, "b"), (8192, "c")]);
        let delta = map(&[(12288, "d")]);
        let merged = merge_snapshot_map("s2", delta, &last);
        assert_eq!(
            offsets_and_blocks(&merged),
            vec![(0, "a"), (4096, "b"), (8192, "c"), (12288, "d")]
        );
    }

    #[test]
    fn merge_interleaves_strictly_ascending() {
        let last = map(&[(4096, "b"), (12288, "d")]);
        let delta = map(&[(0, "a"), (8192, "c"), (16384, "e")]);
        let merged = merge_snapshot_map("s3", delta, &last);
        assert_eq!(
            offsets_and_blocks(&merged),
            vec![(0, "a"), (4096, "b"), (8192, "c"), (12288, "d"), (16384, "e")]
        );
        let offsets: Vec<u64> = merged.blocks.iter().map(|b| b.offset).collect();
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(offsets, sorted);
    }

    #[test]
    fn delta_validation_catches_misalignment_and_order() {
        let aligned = Delta {
            block_size: 4096,
            mappings: vec![
                Extent {
                    offset: 0,
                    size: 8192,
                },
                Extent {
                    offset: 8192,
                    size: 4096,
                },
            ],
        };
        assert!(validate_delta(&aligned, 4096).is_ok());

        let unaligned = Delta {
            block_size: 4096,
            mappings: vec![Extent {
                offset: 0,
                size: 100,
            }],
        };
        assert!(matches!(
            validate_delta(&unaligned, 4096).unwrap_err(),
            Error::BadExtent(_)
        ));

        let overlapping = Delta {
            block_size: 4096,
            mappings: vec![
                Extent {
                    offset: 0,
                    size: 8192,
                },
                Extent {
                    offset: 4096,
                    size: 4096,
                },
            ],
        };
        assert!(matches!(
            validate_delta(&overlapping, 4096).unwrap_err(),
            Error::BadExtent(_)
        ));

        let out_of_order = Delta {
            block_size: 4096,
            mappings: vec![
                Extent {
                    offset: 8192,
                    size: 4096,
                },
                Extent {
                    offset: 0,
                    size: 4096,
                },
            ],
        };
        assert!(matches!(
            validate_delta(&out_of_order, 4096).unwrap_err(),
            Error::BadExtent(_)
        ));
    }
}

//! Config (de)serialization and the block content digest.

use std::io::ErrorKind;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha512};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};

/// Hex characters of the SHA-512 prefix used as a block digest. Part of the
/// on-disk contract: changing it orphans every block already stored.
pub const PRESERVED_CHECKSUM_LENGTH: usize = 64;

/// Digest of a block's contents, which doubles as its object key.
pub fn block_digest(data: &[u8]) -> String {
    let mut checksum = format!("{:x}", Sha512::digest(data));
    checksum.truncate(PRESERVED_CHECKSUM_LENGTH);
    checksum
}

/// Serialize `value` to `path` as JSON, committing via temp file + rename so
/// a reader never observes a partial record.
pub async fn save_config<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&data).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    debug!("Wrote config file {}", path.display());
    Ok(())
}

pub async fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("config file {}", path.display())));
        }
        Err(err) => return Err(err.into()),
    };
    Ok(serde_json::from_slice(&data)?)
}

pub async fn config_exists(path: &Path) -> Result<bool> {
    Ok(fs::try_exists(path).await?)
}

/// Idempotent unlink.
pub async fn remove_config(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed config file {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

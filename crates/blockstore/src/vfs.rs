//! Local-filesystem blockstore transport.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::codec;
use crate::driver::{BlockStoreDriver, BlockStoreDriverFactory, DriverOptions};
use crate::error::{Error, Result};

pub const VFS_DRIVER_KIND: &str = "vfs";

/// Registration option naming the directory that backs the logical store.
pub const VFS_PATH_OPTION: &str = "vfs.path";

#[derive(Debug, Serialize, Deserialize)]
struct VfsConfig {
    path: PathBuf,
}

/// Blockstore driver that maps the logical remote namespace onto a local
/// directory. Mostly useful for NFS-style mounts and for tests.
#[derive(Debug)]
pub struct VfsBlockStoreDriver {
    root: PathBuf,
}

pub struct VfsDriverFactory;

#[async_trait]
impl BlockStoreDriverFactory for VfsDriverFactory {
    fn kind(&self) -> &'static str {
        VFS_DRIVER_KIND
    }

    async fn create(
        &self,
        config_file: &Path,
        id: &str,
        opts: Option<&DriverOptions>,
    ) -> Result<Box<dyn BlockStoreDriver>> {
        let config = match opts {
            Some(opts) => {
                let path = opts
                    .get(VFS_PATH_OPTION)
                    .filter(|path| !path.is_empty())
                    .ok_or_else(|| {
                        Error::Internal(format!(
                            "vfs driver base path unspecified (option {VFS_PATH_OPTION})"
                        ))
                    })?;
                let config = VfsConfig {
                    path: PathBuf::from(path),
                };
                fs::create_dir_all(&config.path).await?;
                codec::save_config(config_file, &config).await?;
                config
            }
            None => codec::load_config(config_file).await?,
        };
        debug!(
            "Initialized vfs driver for blockstore {id} at {}",
            config.path.display()
        );
        Ok(Box::new(VfsBlockStoreDriver { root: config.path }))
    }
}

impl VfsBlockStoreDriver {
    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl BlockStoreDriver for VfsBlockStoreDriver {
    fn kind(&self) -> &str {
        VFS_DRIVER_KIND
    }

    async fn file_exists(&self, dir: &str, name: &str) -> bool {
        fs::metadata(self.resolve(dir).join(name))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    async fn file_size(&self, dir: &str, name: &str) -> Result<Option<u64>> {
        match fs::metadata(self.resolve(dir).join(name)).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn mkdir_all(&self, dir: &str) -> Result<()> {
        fs::create_dir_all(self.resolve(dir)).await?;
        Ok(())
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let target = self.resolve(path);
        match fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target).await?,
            Ok(_) => fs::remove_file(&target).await?,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        debug!("Removed {}", target.display());
        Ok(())
    }

    async fn read(&self, dir: &str, name: &str, buf: &mut [u8]) -> Result<()> {
        let path = self.resolve(dir).join(name);
        let data = fs::read(&path).await?;
        if data.len() != buf.len() {
            return Err(Error::Internal(format!(
                "read buffer of {} bytes does not match size of {} ({} bytes)",
                buf.len(),
                path.display(),
                data.len()
            )));
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    async fn write(&self, data: &[u8], dir: &str, name: &str) -> Result<()> {
        let dir = self.resolve(dir);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(name);
        // Temp file + rename so a reader sees the object absent or whole.
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn copy_to_path(&self, src: &Path, dest: &str) -> Result<()> {
        let dest_dir = self.resolve(dest);
        fs::create_dir_all(&dest_dir).await?;
        let name = src
            .file_name()
            .ok_or_else(|| Error::Internal(format!("source {} has no file name", src.display())))?;
        fs::copy(src, dest_dir.join(name)).await?;
        Ok(())
    }
}

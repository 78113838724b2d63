//! Local durable cache of the committed topology
//!
//! Each successful store read is written to `<dir>/<name>.<version>` and the
//! link `<dir>/<name>` is swapped to point at it. Only the current and the
//! previous version are kept. Writers hold an exclusive advisory lock on
//! `<dir>/<name>.lck` and skip the write when another process holds it;
//! readers take a shared lock, retrying a few times.

use crate::common::{ClusterConfig, Error, Result};
use crate::placement::validate_zones;
use crate::topology::{Cluster, Zone};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCK_ATTEMPTS: u32 = 3;
const LOCK_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    version: u32,
    /// Written while a redistribution adds nodes; zones may not validate
    #[serde(default)]
    for_redist: bool,
    config: ClusterConfig,
    zones: Vec<Zone>,
}

#[derive(Debug, Clone)]
pub struct ClusterCache {
    dir: PathBuf,
    name: String,
}

impl ClusterCache {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    /// The link to the newest cached version.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    pub fn version_path(&self, version: u32) -> PathBuf {
        self.dir.join(format!("{}.{}", self.name, version))
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lck", self.name))
    }

    fn open_lock(&self) -> Result<File> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?)
    }

    /// Cache `cluster` as `version`.
    ///
    /// Returns without writing when another writer holds the lock.
    pub fn write(&self, cluster: &Cluster, version: u32, for_redist: bool) -> Result<()> {
        let lock = self.open_lock()?;
        if fs2::FileExt::try_lock_exclusive(&lock).is_err() {
            tracing::debug!("cache {} is locked, skipping write", self.path().display());
            return Ok(());
        }
        let result = self.write_locked(cluster, version, for_redist);
        let _ = fs2::FileExt::unlock(&lock);
        result
    }

    fn write_locked(&self, cluster: &Cluster, version: u32, for_redist: bool) -> Result<()> {
        let record = CacheRecord {
            version,
            for_redist,
            config: cluster.config.clone(),
            zones: cluster.zones.clone(),
        };

        let target = self.version_path(version);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, &record)?;
        tmp.as_file_mut().flush()?;
        tmp.persist(&target).map_err(|e| Error::Io(e.error))?;

        if version > 2 {
            let old = self.version_path(version - 2);
            if let Err(e) = std::fs::remove_file(&old) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("{}: {}", old.display(), e);
                }
            }
        }

        self.swap_link(&target)?;
        tracing::debug!("cached topology version {} at {}", version, target.display());
        Ok(())
    }

    #[cfg(unix)]
    fn swap_link(&self, target: &Path) -> Result<()> {
        let link = self.path();
        let staging = self.dir.join(format!(".{}.link", self.name));
        let _ = std::fs::remove_file(&staging);
        let relative = target.file_name().map(PathBuf::from).unwrap_or_else(|| target.into());
        std::os::unix::fs::symlink(&relative, &staging)?;
        std::fs::rename(&staging, &link)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn swap_link(&self, target: &Path) -> Result<()> {
        std::fs::copy(target, self.path())?;
        Ok(())
    }

    /// Newest cached topology and its version.
    pub async fn read(&self) -> Result<(Cluster, u32)> {
        let lock = self
            .open_lock()
            .map_err(|e| Error::Cache(format!("{}: {}", self.lock_path().display(), e)))?;

        let mut attempt = 1;
        while fs2::FileExt::try_lock_shared(&lock).is_err() {
            if attempt == LOCK_ATTEMPTS {
                return Err(Error::Cache(format!(
                    "{}: locked out",
                    self.lock_path().display()
                )));
            }
            attempt += 1;
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }

        let result = self.read_locked();
        let _ = fs2::FileExt::unlock(&lock);
        result
    }

    fn read_locked(&self) -> Result<(Cluster, u32)> {
        let path = self.path();
        let bytes = std::fs::read(&path)
            .map_err(|e| Error::Cache(format!("{}: {}", path.display(), e)))?;
        let mut record: CacheRecord = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Cache(format!("{}: {}", path.display(), e)))?;

        if record.config.alg_version == 0 {
            record.config.alg_version = 1;
        }
        record
            .config
            .validate()
            .map_err(|e| Error::Cache(format!("bad cluster config: {}", e)))?;

        if !record.for_redist {
            let alg = record.config.mapping_alg()?;
            validate_zones(&record.zones, record.config.num_shards, alg)
                .map_err(|e| Error::Cache(format!("zone validation failed: {}", e)))?;
        }

        tracing::info!("read topology version {} from cache {}", record.version, path.display());
        let mut cluster = Cluster::new(record.config);
        cluster.zones = record.zones;
        Ok((cluster, record.version))
    }
}

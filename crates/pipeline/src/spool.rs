//! Durable queue of aggregated reports awaiting delivery.
//!
//! The aggregator is the only writer; the sender is the only reader and
//! remover. Units are independent: removing one never affects another, and
//! [`Spooler::files`] returns a snapshot in write order.

use crate::{Error, Result, report::Report};
use async_trait::async_trait;
use mockall::automock;
use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const UNIT_EXT: &str = "json";
const TMP_EXT: &str = "tmp";

#[automock]
#[async_trait]
pub trait Spooler: Send + Sync {
    /// Persist one report as a new unit.
    async fn write(&self, report: &Report) -> Result<()>;

    /// Names of the pending units, oldest first.
    async fn files(&self) -> Result<Vec<String>>;

    async fn read(&self, name: &str) -> Result<Vec<u8>>;

    /// Remove a unit. Removing a unit that no longer exists succeeds.
    async fn remove(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpoolUsage {
    pub files: u64,
    pub bytes: u64,
}

/// Counter of reports accepted by a spooler since it was created.
#[derive(Debug, Default)]
struct WriteCounter(AtomicU64);

impl WriteCounter {
    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Unit name for the `seq`-th report written since startup. Names sort in
/// write order within a run and by window across restarts.
fn unit_name(report: &Report, seq: u64) -> String {
    format!(
        "{:020}_{:06}.{UNIT_EXT}",
        report.ts.timestamp().max(0),
        seq % 1_000_000
    )
}

/// One JSON file per report under `dir`.
#[derive(Debug)]
pub struct DiskSpooler {
    dir: PathBuf,
    max_files: usize,
    written: WriteCounter,
}

impl DiskSpooler {
    /// Open (creating if needed) a spool directory holding at most
    /// `max_files` units.
    pub fn new(dir: impl Into<PathBuf>, max_files: usize) -> Result<Self> {
        if max_files == 0 {
            return Err(Error::InvalidConfig("spool max_files must be > 0".into()));
        }
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            max_files,
            written: WriteCounter::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reports written since this spooler was opened.
    pub fn reports_written(&self) -> u64 {
        self.written.get()
    }

    pub async fn usage(&self) -> Result<SpoolUsage> {
        let mut usage = SpoolUsage::default();
        for name in self.files().await? {
            match tokio::fs::metadata(self.unit_path(&name)?).await {
                Ok(meta) => {
                    usage.files += 1;
                    usage.bytes += meta.len();
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(usage)
    }

    fn unit_path(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name)
            && Path::new(name).extension().and_then(|e| e.to_str()) == Some(UNIT_EXT);
        if !valid {
            return Err(Error::Spool(format!("invalid unit name: {name}")));
        }
        Ok(self.dir.join(name))
    }

    /// Drop the oldest units until at most `max_files` remain.
    async fn enforce_limit(&self) -> Result<()> {
        let files = self.files().await?;
        if files.len() <= self.max_files {
            return Ok(());
        }

        let excess = files.len() - self.max_files;
        for name in &files[..excess] {
            warn!(file = %name, max_files = self.max_files, "spool full, dropping oldest report");
            self.remove(name).await?;
        }
        metrics::counter!("dbagent_spool_dropped").increment(excess as u64);
        Ok(())
    }
}

async fn write_atomic(tmp: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp, path).await
}

#[async_trait]
impl Spooler for DiskSpooler {
    async fn write(&self, report: &Report) -> Result<()> {
        let data = serde_json::to_vec(report)?;
        let name = unit_name(report, self.written.next());
        let path = self.dir.join(&name);
        let tmp = path.with_extension(TMP_EXT);

        if let Err(err) = write_atomic(&tmp, &path, &data).await {
            match tokio::fs::remove_file(&tmp).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(file = %tmp.display(), %e, "cannot remove temp file"),
            }
            return Err(err.into());
        }

        debug!(file = %name, bytes = data.len(), "spooled report");
        self.enforce_limit().await
    }

    async fn files(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(UNIT_EXT) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.unit_path(name)?).await?)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.unit_path(name)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(file = %name, "already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process spooler with the same contract as [`DiskSpooler`]. Units do
/// not survive a restart.
#[derive(Debug, Default)]
pub struct MemorySpooler {
    units: Mutex<BTreeMap<String, Vec<u8>>>,
    max_files: Option<usize>,
    written: WriteCounter,
}

impl MemorySpooler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_files(max_files: usize) -> Self {
        Self {
            max_files: Some(max_files),
            ..Self::default()
        }
    }

    /// Store raw bytes under `name`, bypassing report serialization.
    pub fn insert(&self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.units().insert(name.into(), data.into());
    }

    pub fn len(&self) -> usize {
        self.units().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units().is_empty()
    }

    pub fn reports_written(&self) -> u64 {
        self.written.get()
    }

    pub fn usage(&self) -> SpoolUsage {
        let units = self.units();
        SpoolUsage {
            files: units.len() as u64,
            bytes: units.values().map(|d| d.len() as u64).sum(),
        }
    }

    fn units(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.units
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Spooler for MemorySpooler {
    async fn write(&self, report: &Report) -> Result<()> {
        let data = serde_json::to_vec(report)?;
        let name = unit_name(report, self.written.next());

        let mut units = self.units();
        units.insert(name, data);
        if let Some(max) = self.max_files {
            let mut dropped = 0u64;
            while units.len() > max {
                if let Some((name, _)) = units.pop_first() {
                    warn!(file = %name, max_files = max, "spool full, dropping oldest report");
                    dropped += 1;
                }
            }
            if dropped > 0 {
                metrics::counter!("dbagent_spool_dropped").increment(dropped);
            }
        }
        Ok(())
    }

    async fn files(&self) -> Result<Vec<String>> {
        Ok(self.units().keys().cloned().collect())
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.units()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Spool(format!("no such unit: {name}")))
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.units().remove(name);
        Ok(())
    }
}

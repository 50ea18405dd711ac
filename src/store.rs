//! Rotating append-only JSONL store.
//!
//! A single writer thread owns the active file, its size and the backup
//! chain. Workers serialize their record and send the line over a channel
//! together with a one-shot reply; nothing else ever touches the file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use fs2::FileExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::OutputConfig;
use crate::record::DialogRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("store writer closed")]
    Closed,
    #[error("output is locked by another process: {0}")]
    Locked(PathBuf),
    #[error("store writer failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub max_file_bytes: u64,
    pub backup_count: usize,
    pub fsync: bool,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_file_bytes: 100 * 1024 * 1024,
            backup_count: 5,
            fsync: true,
        }
    }

    pub fn from_output(output: &OutputConfig) -> Self {
        Self {
            path: output.filename.clone(),
            max_file_bytes: output.max_file_bytes(),
            backup_count: output.backup_count,
            fsync: output.fsync,
        }
    }

    pub fn max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn backup_count(mut self, count: usize) -> Self {
        self.backup_count = count;
        self
    }

    pub fn fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }
}

// =============================================================================
// BACKUP CHAIN
// =============================================================================

/// Backups of `<stem>.<ext>` are `<stem>.1.<ext>` (newest) to `<stem>.N.<ext>`.
#[derive(Debug, Clone)]
pub struct BackupChain {
    active: PathBuf,
    capacity: usize,
}

impl BackupChain {
    pub fn new(active: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            active: active.into(),
            capacity,
        }
    }

    pub fn active(&self) -> &Path {
        &self.active
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Path of backup `index` (1-based).
    pub fn path(&self, index: usize) -> PathBuf {
        let stem = self
            .active
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match self.active.extension() {
            Some(ext) => format!("{stem}.{index}.{}", ext.to_string_lossy()),
            None => format!("{stem}.{index}"),
        };
        self.active.with_file_name(name)
    }

    /// Backups currently on disk, newest first.
    pub fn existing(&self) -> Vec<PathBuf> {
        (1..=self.capacity)
            .map(|i| self.path(i))
            .filter(|p| p.exists())
            .collect()
    }

    /// Move the active file to backup 1, shifting older backups up by one and
    /// deleting whatever falls off the end. With capacity 0 the active file is
    /// simply removed.
    pub fn shift(&self) -> std::io::Result<()> {
        if self.capacity == 0 {
            return remove_if_exists(&self.active);
        }
        remove_if_exists(&self.path(self.capacity))?;
        for index in (1..self.capacity).rev() {
            let from = self.path(index);
            if from.exists() {
                std::fs::rename(&from, self.path(index + 1))?;
            }
        }
        if self.active.exists() {
            std::fs::rename(&self.active, self.path(1))?;
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// =============================================================================
// STORE HANDLE
// =============================================================================

/// Outcome of one append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReceipt {
    /// The active file was rotated before this record was written.
    pub rotated: bool,
    /// Size of the active file after the append.
    pub active_bytes: u64,
}

/// Totals reported when the writer shuts down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub records_written: u64,
    pub bytes_written: u64,
    pub rotations: u64,
    pub failed_appends: u64,
    /// Bytes of an incomplete trailing line dropped at open.
    pub truncated_bytes: u64,
}

struct AppendRequest {
    line: String,
    reply: oneshot::Sender<Result<AppendReceipt, StoreError>>,
}

/// Cloneable handle for submitting records. The writer stops once every
/// handle has been dropped.
#[derive(Clone)]
pub struct DialogStore {
    sender: mpsc::Sender<AppendRequest>,
    path: PathBuf,
}

pub struct StoreWorker {
    handle: Option<std::thread::JoinHandle<Result<StoreSummary, StoreError>>>,
}

impl StoreWorker {
    /// Wait for the writer to drain and close. Blocks; call it after dropping
    /// every [`DialogStore`] handle.
    pub fn join(mut self) -> Result<StoreSummary, StoreError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(StoreError::Join("store writer panicked".to_string())),
            },
            None => Ok(StoreSummary::default()),
        }
    }
}

impl DialogStore {
    /// Lock the output, repair an interrupted tail and start the writer thread.
    pub fn open(config: StoreConfig) -> Result<(Self, StoreWorker), StoreError> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let lock = acquire_lock(&lock_path(&config.path))?;

        let truncated_bytes = truncate_partial_tail(&config.path)?;
        if truncated_bytes > 0 {
            warn!(
                path = %config.path.display(),
                truncated_bytes,
                "Dropped incomplete trailing line from previous run"
            );
        }

        let file = open_active(&config.path)?;
        let size = file.metadata()?.len();

        let path = config.path.clone();
        let state = WriterState {
            chain: BackupChain::new(config.path.clone(), config.backup_count),
            file: Some(file),
            size,
            config,
            summary: StoreSummary {
                truncated_bytes,
                ..StoreSummary::default()
            },
            _lock: lock,
        };

        let (sender, receiver) = mpsc::channel::<AppendRequest>();
        let handle = std::thread::Builder::new()
            .name("dialog-store".to_string())
            .spawn(move || write_loop(state, receiver))?;

        Ok((
            Self { sender, path },
            StoreWorker {
                handle: Some(handle),
            },
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single JSON line. Resolves once the line is
    /// written (and synced, if enabled) or has failed as a whole.
    pub async fn append(&self, record: &DialogRecord) -> Result<AppendReceipt, StoreError> {
        let mut line =
            serde_json::to_string(record).map_err(|e| StoreError::Serde(e.to_string()))?;
        line.push('\n');

        let (reply, response) = oneshot::channel();
        self.sender
            .send(AppendRequest { line, reply })
            .map_err(|_| StoreError::Closed)?;
        response.await.map_err(|_| StoreError::Closed)?
    }
}

/// `<output>.lock` next to the dataset.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

fn acquire_lock(path: &Path) -> Result<File, StoreError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    file.try_lock_exclusive()
        .map_err(|_| StoreError::Locked(path.to_path_buf()))?;
    Ok(file)
}

fn open_active(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Cut the file back to its last newline. Returns the number of bytes removed.
fn truncate_partial_tail(path: &Path) -> std::io::Result<u64> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }

    const CHUNK: u64 = 8 * 1024;
    let mut buf = vec![0u8; CHUNK as usize];
    let mut end = len;
    let mut keep = 0u64;
    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let n = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf[..n])?;
        if let Some(pos) = buf[..n].iter().rposition(|b| *b == b'\n') {
            keep = start + pos as u64 + 1;
            break;
        }
        end = start;
    }

    if keep == len {
        return Ok(0);
    }
    file.set_len(keep)?;
    file.sync_all()?;
    Ok(len - keep)
}

// =============================================================================
// WRITER THREAD
// =============================================================================

struct WriterState {
    chain: BackupChain,
    file: Option<File>,
    size: u64,
    config: StoreConfig,
    summary: StoreSummary,
    _lock: File,
}

impl WriterState {
    fn append(&mut self, line: &[u8]) -> Result<AppendReceipt, StoreError> {
        let len = line.len() as u64;
        let mut rotated = false;
        // An oversized record still goes in, alone in its own file.
        if self.size > 0 && self.size + len > self.config.max_file_bytes {
            self.rotate()?;
            rotated = true;
        }

        let fsync = self.config.fsync;
        let size = self.size;
        let file = self.active_file()?;
        if let Err(err) = write_line(file, line, fsync) {
            // Roll back whatever part of the line reached the file.
            if let Err(rollback) = file.set_len(size) {
                warn!(error = %rollback, "Failed to roll back partial append");
            }
            return Err(err.into());
        }

        self.size += len;
        self.summary.records_written += 1;
        self.summary.bytes_written += len;
        Ok(AppendReceipt {
            rotated,
            active_bytes: self.size,
        })
    }

    fn active_file(&mut self) -> std::io::Result<&mut File> {
        if self.file.is_none() {
            let file = open_active(self.chain.active())?;
            self.size = file.metadata()?.len();
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(std::io::Error::other("active file unavailable")),
        }
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        if let Some(file) = self.file.take() {
            if self.config.fsync {
                file.sync_all()?;
            }
        }
        self.chain.shift()?;
        if self.config.fsync {
            sync_parent_dir(self.chain.active());
        }
        let file = open_active(self.chain.active())?;
        self.size = file.metadata()?.len();
        self.file = Some(file);
        self.summary.rotations += 1;
        info!(
            path = %self.chain.active().display(),
            backups = self.chain.existing().len(),
            "Rotated output file"
        );
        Ok(())
    }

    fn close(mut self) -> Result<StoreSummary, StoreError> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(self.summary)
    }
}

fn write_line(file: &mut File, line: &[u8], fsync: bool) -> std::io::Result<()> {
    file.write_all(line)?;
    file.flush()?;
    if fsync {
        file.sync_data()?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir,
        None => Path::new("."),
    };
    if let Err(err) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(error = %err, "Directory sync after rotation failed");
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

fn write_loop(
    mut state: WriterState,
    receiver: mpsc::Receiver<AppendRequest>,
) -> Result<StoreSummary, StoreError> {
    for request in receiver {
        let result = state.append(request.line.as_bytes());
        if let Err(err) = &result {
            state.summary.failed_appends += 1;
            warn!(error = %err, "Store append failed");
        }
        // The submitter may have gone away; the outcome is already counted.
        let _ = request.reply.send(result);
    }
    state.close()
}

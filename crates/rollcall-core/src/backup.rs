//! Point-in-time copies of the ledger file, plus a per-person summary.

use crate::ledger::{text_row, AttendanceRecord};
use chrono::{DateTime, Local, NaiveDateTime};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const BACKUP_PREFIX: &str = "Attendance_backup_";
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("no ledger found at {0}")]
    LedgerMissing(PathBuf),
    #[error("backup not found: {0}")]
    NotFound(String),
    #[error("invalid backup name {0:?}")]
    InvalidName(String),
    #[error("I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed ledger: {0}")]
    Csv(#[from] csv::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A backup file on disk.
#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Local>>,
}

/// Row counts per person.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub counts: BTreeMap<String, usize>,
    pub total: usize,
}

impl Summary {
    /// True when the ledger holds no data rows.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Backup, restore and summarize one ledger file.
pub struct BackupStore {
    ledger_path: PathBuf,
    backup_dir: PathBuf,
}

impl BackupStore {
    pub fn new(ledger_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            ledger_path: ledger_path.into(),
            backup_dir: backup_dir.into(),
        }
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Copy the ledger to a backup named after the current local time.
    pub fn backup(&self) -> Result<BackupEntry, BackupError> {
        self.backup_at(Local::now().naive_local())
    }

    /// Copy the ledger to `Attendance_backup_<now>.csv`.
    pub fn backup_at(&self, now: NaiveDateTime) -> Result<BackupEntry, BackupError> {
        if !self.ledger_path.is_file() {
            return Err(BackupError::LedgerMissing(self.ledger_path.clone()));
        }
        fs::create_dir_all(&self.backup_dir).map_err(io_error(&self.backup_dir))?;

        let stamp = now.format(BACKUP_TIMESTAMP_FORMAT).to_string();
        let mut source = File::open(&self.ledger_path).map_err(io_error(&self.ledger_path))?;

        // Snapshots are never overwritten; a second backup in the same
        // second gets a numeric suffix.
        let mut attempt = 0u32;
        loop {
            let name = match attempt {
                0 => format!("{BACKUP_PREFIX}{stamp}.csv"),
                n => format!("{BACKUP_PREFIX}{stamp}_{n}.csv"),
            };
            let path = self.backup_dir.join(&name);
            let mut target = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(io_error(&path)(e)),
            };
            std::io::copy(&mut source, &mut target).map_err(io_error(&path))?;
            target.sync_all().map_err(io_error(&path))?;
            tracing::info!(backup = %path.display(), "ledger backed up");
            return entry_for(name, path);
        }
    }

    /// Backups in the backup directory, oldest first.
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>, BackupError> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.backup_dir)(e)),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error(&self.backup_dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(BACKUP_PREFIX) && entry.path().is_file() {
                backups.push(entry_for(name, entry.path())?);
            }
        }
        backups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(backups)
    }

    /// Overwrite the ledger with the named backup.
    ///
    /// `name` must be a bare file name inside the backup directory.
    pub fn restore(&self, name: &str) -> Result<BackupEntry, BackupError> {
        let is_bare = Path::new(name)
            .file_name()
            .is_some_and(|f| f.to_string_lossy() == name);
        if !is_bare {
            return Err(BackupError::InvalidName(name.to_string()));
        }

        let path = self.backup_dir.join(name);
        if !path.is_file() {
            return Err(BackupError::NotFound(name.to_string()));
        }
        if let Some(parent) = self.ledger_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        fs::copy(&path, &self.ledger_path).map_err(io_error(&self.ledger_path))?;
        tracing::info!(backup = %path.display(), ledger = %self.ledger_path.display(), "ledger restored");

        entry_for(name.to_string(), path)
    }

    /// Count ledger rows per person, skipping the header row.
    pub fn summarize(&self) -> Result<Summary, BackupError> {
        let contents = match fs::read(&self.ledger_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::LedgerMissing(self.ledger_path.clone()))
            }
            Err(e) => return Err(io_error(&self.ledger_path)(e)),
        };
        summarize_rows(&contents)
    }
}

fn entry_for(name: String, path: PathBuf) -> Result<BackupEntry, BackupError> {
    let meta = fs::metadata(&path).map_err(io_error(&path))?;
    Ok(BackupEntry {
        name,
        size: meta.len(),
        modified: meta.modified().ok().map(DateTime::<Local>::from),
        path,
    })
}

/// The first row is a header unless it parses as a record.
fn summarize_rows(contents: &[u8]) -> Result<Summary, BackupError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(contents);

    let mut summary = Summary::default();
    for (i, row) in reader.byte_records().enumerate() {
        let Some(row) = text_row(row?) else {
            continue;
        };
        if i == 0 && AttendanceRecord::from_row(&row).is_none() {
            continue;
        }
        let Some(name) = row.get(0).map(str::trim).filter(|n| !n.is_empty()) else {
            continue;
        };
        *summary.counts.entry(name.to_string()).or_default() += 1;
        summary.total += 1;
    }
    Ok(summary)
}

//! Append-only CSV attendance ledger.
//!
//! Each row is `name,YYYY-MM-DD,In|Out,HH:MM:SS`. Per person and calendar
//! day the statuses alternate In, Out, In, ... and a repeat trigger within
//! the grace period after the last row is answered without writing.
//!
//! The read-decide-append sequence runs under an in-process mutex and an
//! advisory `flock` on `<ledger>.lock`, so concurrent requests (or a second
//! process) cannot both act on the same "last record".

use chrono::{Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

pub const GRACE_PERIOD_MINUTES: i64 = 5;
pub const HEADER: [&str; 4] = ["Name", "Date", "Status", "Time"];
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed ledger: {0}")]
    Csv(#[from] csv::Error),
    #[error("could not lock {path}: {errno}")]
    Lock {
        path: PathBuf,
        errno: nix::errno::Errno,
    },
    #[error("attendance name must not be empty")]
    EmptyName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    In,
    Out,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::In => "In",
            Status::Out => "Out",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in" => Ok(Status::In),
            "out" => Ok(Status::Out),
            other => Err(format!("unknown status {other:?}")),
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub name: String,
    pub date: NaiveDate,
    pub status: Status,
    pub time: NaiveTime,
}

impl AttendanceRecord {
    /// Parse a CSV row; `None` for the header and anything malformed.
    pub fn from_row(row: &csv::StringRecord) -> Option<Self> {
        let name = row.get(0)?.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            date: NaiveDate::parse_from_str(row.get(1)?.trim(), DATE_FORMAT).ok()?,
            status: row.get(2)?.parse().ok()?,
            time: NaiveTime::parse_from_str(row.get(3)?.trim(), TIME_FORMAT).ok()?,
        })
    }

    pub fn to_row(&self) -> [String; 4] {
        [
            self.name.clone(),
            self.date.format(DATE_FORMAT).to_string(),
            self.status.to_string(),
            self.time.format(TIME_FORMAT).to_string(),
        ]
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }
}

/// Result of a `mark_attendance` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    CheckedIn { name: String, time: NaiveTime },
    CheckedOut { name: String, time: NaiveTime },
    /// Inside the grace period; nothing was written.
    Grace {
        name: String,
        status: Status,
        time: NaiveTime,
    },
}

impl MarkOutcome {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            MarkOutcome::CheckedIn { .. } => "checked_in",
            MarkOutcome::CheckedOut { .. } => "checked_out",
            MarkOutcome::Grace { .. } => "grace",
        }
    }

    /// Whether a row was appended.
    pub fn recorded(&self) -> bool {
        !matches!(self, MarkOutcome::Grace { .. })
    }

    pub fn message(&self) -> String {
        match self {
            MarkOutcome::CheckedIn { name, time } => format!(
                "Welcome {name}, you are checked IN at {}. Have a productive day!",
                time.format(TIME_FORMAT)
            ),
            MarkOutcome::CheckedOut { name, time } => {
                format!("Goodbye {name}, you checked OUT at {}.", time.format(TIME_FORMAT))
            }
            MarkOutcome::Grace { name, status, time } => format!(
                "{name}, you already clocked {status} at {}.",
                time.format(TIME_FORMAT)
            ),
        }
    }
}

impl fmt::Display for MarkOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

enum Decision {
    Grace(AttendanceRecord),
    Append(Status),
}

/// Apply the state machine to the full history.
fn decide(history: &[AttendanceRecord], name: &str, now: NaiveDateTime) -> Decision {
    let today = now.date();
    let last = history
        .iter()
        .rev()
        .find(|r| r.name == name && r.date == today);

    match last {
        Some(last) if now - last.timestamp() < Duration::minutes(GRACE_PERIOD_MINUTES) => {
            Decision::Grace(last.clone())
        }
        Some(last) if last.status == Status::In => Decision::Append(Status::Out),
        _ => Decision::Append(Status::In),
    }
}

/// Parse every well-formed record, in file order.
pub fn parse_records(contents: &[u8]) -> Result<Vec<AttendanceRecord>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(contents);

    let mut records = Vec::new();
    for row in reader.byte_records() {
        let row = row?;
        let Some(row) = text_row(row) else {
            continue;
        };
        if let Some(record) = AttendanceRecord::from_row(&row) {
            records.push(record);
        }
    }
    Ok(records)
}

/// Decode a raw row as UTF-8; a row in another encoding is skipped with a warning.
pub(crate) fn text_row(row: csv::ByteRecord) -> Option<csv::StringRecord> {
    let line = row.position().map(|p| p.line());
    match csv::StringRecord::from_byte_record(row) {
        Ok(row) => Some(row),
        Err(e) => {
            tracing::warn!(line, error = %e.utf8_error(), "skipping ledger row that is not UTF-8");
            None
        }
    }
}

/// Handle to one ledger file.
pub struct Ledger {
    path: PathBuf,
    guard: Mutex<()>,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Raw ledger bytes; a missing file reads as empty.
    fn read_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Every record in the ledger, in file order.
    pub fn records(&self) -> Result<Vec<AttendanceRecord>, LedgerError> {
        Ok(parse_records(&self.read_bytes()?)?)
    }

    /// Records for one person on one day, in file order.
    pub fn records_for(&self, name: &str, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.name == name && r.date == date)
            .collect())
    }

    /// Record a check-in or check-out for `name` at the current local time.
    pub fn mark_attendance(&self, name: &str) -> Result<MarkOutcome, LedgerError> {
        self.mark_attendance_at(name, Local::now().naive_local())
    }

    /// Record a check-in or check-out for `name` at `now`.
    pub fn mark_attendance_at(&self, name: &str, now: NaiveDateTime) -> Result<MarkOutcome, LedgerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::EmptyName);
        }
        // The ledger stores whole seconds.
        let now = now.with_nanosecond(0).unwrap_or(now);

        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = self.lock()?;

        let contents = self.read_bytes()?;
        let history = parse_records(&contents)?;

        match decide(&history, name, now) {
            Decision::Grace(last) => {
                tracing::info!(name, last_status = %last.status, last_time = %last.time, "within grace period, not recorded");
                Ok(MarkOutcome::Grace {
                    name: name.to_string(),
                    status: last.status,
                    time: last.time,
                })
            }
            Decision::Append(status) => {
                let record = AttendanceRecord {
                    name: name.to_string(),
                    date: now.date(),
                    status,
                    time: now.time(),
                };
                self.append(&contents, &record)?;
                tracing::info!(name, %status, date = %record.date, time = %record.time, "attendance recorded");

                let (name, time) = (record.name, record.time);
                Ok(match status {
                    Status::In => MarkOutcome::CheckedIn { name, time },
                    Status::Out => MarkOutcome::CheckedOut { name, time },
                })
            }
        }
    }

    /// Append one record with a single write, adding the header to a new
    /// file and repairing a missing final newline.
    fn append(&self, existing: &[u8], record: &AttendanceRecord) -> Result<(), LedgerError> {
        let mut buf = Vec::new();
        if !existing.is_empty() && !existing.ends_with(b"\n") {
            buf.push(b'\n');
        }
        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .terminator(csv::Terminator::Any(b'\n'))
                .from_writer(&mut buf);
            if existing.is_empty() {
                writer.write_record(HEADER)?;
            }
            writer.write_record(&record.to_row())?;
            writer.flush().map_err(|e| self.io_error(e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.write_all(&buf).map_err(|e| self.io_error(e))?;
        file.sync_data().map_err(|e| self.io_error(e))
    }

    fn lock_path(&self) -> PathBuf {
        let mut path = self.path.as_os_str().to_owned();
        path.push(".lock");
        PathBuf::from(path)
    }

    /// Take the cross-process exclusive lock; released on drop.
    fn lock(&self) -> Result<Flock<File>, LedgerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| LedgerError::Lock { path, errno })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn at(date: (i32, u32, u32), h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    const DAY: (i32, u32, u32) = (2024, 3, 4);

    fn ledger_in(dir: &tempfile::TempDir) -> Ledger {
        Ledger::new(dir.path().join("Attendance.csv"))
    }

    #[test]
    fn test_alice_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        let first = ledger.mark_attendance_at("Alice", at(DAY, 9, 0, 0)).unwrap();
        assert_eq!(first.code(), "checked_in");
        assert!(first.message().contains("09:00:00"));

        let second = ledger.mark_attendance_at("Alice", at(DAY, 9, 2, 0)).unwrap();
        assert_eq!(
            second,
            MarkOutcome::Grace {
                name: "Alice".into(),
                status: Status::In,
                time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            }
        );
        assert!(second.message().contains("09:00:00"));

        let third = ledger.mark_attendance_at("Alice", at(DAY, 9, 10, 0)).unwrap();
        assert_eq!(third.code(), "checked_out");

        let contents = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(
            contents,
            "Name,Date,Status,Time\nAlice,2024-03-04,In,09:00:00\nAlice,2024-03-04,Out,09:10:00\n"
        );
    }

    #[test]
    fn test_statuses_alternate_outside_grace() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        for i in 0..6 {
            ledger.mark_attendance_at("Bob", at(DAY, 8, i * 5, 0)).unwrap();
        }
        let statuses: Vec<Status> = ledger.records().unwrap().iter().map(|r| r.status).collect();
        use Status::{In, Out};
        assert_eq!(statuses, vec![In, Out, In, Out, In, Out]);
    }

    #[test]
    fn test_grace_call_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        ledger.mark_attendance_at("Carol", at(DAY, 12, 0, 0)).unwrap();
        let before = fs::read(ledger.path()).unwrap();
        let outcome = ledger.mark_attendance_at("Carol", at(DAY, 12, 4, 59)).unwrap();
        assert!(!outcome.recorded());
        assert_eq!(fs::read(ledger.path()).unwrap(), before);
    }

    #[test]
    fn test_grace_boundary_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        ledger.mark_attendance_at("Dan", at(DAY, 12, 0, 0)).unwrap();
        let outcome = ledger.mark_attendance_at("Dan", at(DAY, 12, 5, 0)).unwrap();
        assert_eq!(outcome.code(), "checked_out");
    }

    #[test]
    fn test_clock_moving_backwards_counts_as_grace() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        ledger.mark_attendance_at("Eve", at(DAY, 12, 0, 0)).unwrap();
        let outcome = ledger.mark_attendance_at("Eve", at(DAY, 11, 0, 0)).unwrap();
        assert_eq!(outcome.code(), "grace");
    }

    #[test]
    fn test_new_day_starts_with_in() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        ledger.mark_attendance_at("Frank", at(DAY, 17, 0, 0)).unwrap();
        let next = ledger.mark_attendance_at("Frank", at((2024, 3, 5), 8, 0, 0)).unwrap();
        assert_eq!(next.code(), "checked_in");
    }

    #[test]
    fn test_people_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        ledger.mark_attendance_at("Gina", at(DAY, 9, 0, 0)).unwrap();
        let other = ledger.mark_attendance_at("Hank", at(DAY, 9, 1, 0)).unwrap();
        assert_eq!(other.code(), "checked_in");
        assert_eq!(ledger.records_for("Gina", at(DAY, 0, 0, 0).date()).unwrap().len(), 1);
    }

    #[test]
    fn test_existing_file_without_header_or_newline() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);
        fs::write(ledger.path(), "Ivy,2024-03-04,In,07:00:00").unwrap();

        let outcome = ledger.mark_attendance_at("Ivy", at(DAY, 16, 0, 0)).unwrap();
        assert_eq!(outcome.code(), "checked_out");
        assert_eq!(
            fs::read_to_string(ledger.path()).unwrap(),
            "Ivy,2024-03-04,In,07:00:00\nIvy,2024-03-04,Out,16:00:00\n"
        );
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let records = parse_records(b"Name,Date,Status,Time\n\nbad,row\nJo,2024-03-04,Sideways,10:00:00\nJo,2024-03-04,out,10:00:00\n").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Status::Out);
    }

    #[test]
    fn test_non_utf8_row_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);
        let mut contents = b"Name,Date,Status,Time\n".to_vec();
        contents.extend_from_slice(b"Jos\xe9,2024-03-04,In,08:00:00\n");
        fs::write(ledger.path(), &contents).unwrap();

        let outcome = ledger.mark_attendance_at("Alice", at(DAY, 9, 0, 0)).unwrap();
        assert_eq!(outcome.code(), "checked_in");

        let records = ledger.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Alice");
        assert!(fs::read(ledger.path()).unwrap().starts_with(&contents));
    }

    #[test]
    fn test_names_with_commas_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);

        ledger.mark_attendance_at("Doe, Jane", at(DAY, 9, 0, 0)).unwrap();
        let records = ledger.records().unwrap();
        assert_eq!(records[0].name, "Doe, Jane");
    }

    #[test]
    fn test_empty_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(&dir);
        assert!(matches!(
            ledger.mark_attendance_at("   ", at(DAY, 9, 0, 0)),
            Err(LedgerError::EmptyName)
        ));
        assert!(!ledger.path().exists());
    }

    #[test]
    fn test_concurrent_marks_append_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Attendance.csv");
        let shared = Arc::new(Ledger::new(&path));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                // Half the threads use their own handle, as a second process would.
                let ledger = if i % 2 == 0 {
                    Arc::clone(&shared)
                } else {
                    Arc::new(Ledger::new(&path))
                };
                std::thread::spawn(move || ledger.mark_attendance_at("Kim", at(DAY, 9, 0, 0)).unwrap())
            })
            .collect();

        let outcomes: Vec<MarkOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|o| o.recorded()).count(), 1);
        assert_eq!(shared.records().unwrap().len(), 1);
    }
}

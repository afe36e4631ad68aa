//! Append-only CSV log for a recording session.
//!
//! Each session gets its own file. The header row is written when the file
//! is created. Every row goes to the file in a single unbuffered write; a
//! failed write is truncated back to the last complete row, so the file
//! only ever holds the rows that were counted.

use chrono::{DateTime, Local, SecondsFormat, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::sample::Sample;

/// Header row of every session log.
pub const CSV_HEADER: &str = "timestamp,left_sensor,right_sensor,esp32_time_ms";

/// Name collisions tolerated before giving up on a session file name.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The data directory could not be created.
    #[error("Failed to create data directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The session log could not be created.
    #[error("Failed to create session log {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A row could not be written.
    #[error("Failed to write to session log {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PersistenceError {
    fn name_taken(&self) -> bool {
        matches!(
            self,
            PersistenceError::Open { source, .. } if source.kind() == io::ErrorKind::AlreadyExists
        )
    }
}

/// Destination of a session log that can undo a partial write.
pub(crate) trait LogSink: Write + Send {
    /// Discard everything past `len` bytes and continue writing there.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogSink for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len)).map(|_| ())
    }
}

/// Writer for one session's CSV log.
pub struct PersistenceWriter {
    path: PathBuf,
    out: Box<dyn LogSink>,
    /// Length of the log up to the last complete row.
    committed: u64,
    rows: u64,
}

impl PersistenceWriter {
    /// Create a new log at `path` and write the header row.
    ///
    /// # Errors
    ///
    /// Returns an error if the file already exists or cannot be written.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| PersistenceError::Open {
                path: path.clone(),
                source,
            })?;

        let mut writer = Self::from_sink(path, file);
        writer
            .write_line(CSV_HEADER)
            .map_err(|source| PersistenceError::Open {
                path: writer.path.clone(),
                source,
            })?;

        info!(path = %writer.path.display(), "Created session log");
        Ok(writer)
    }

    /// Create a uniquely named log inside `dir`.
    ///
    /// The name is `<prefix>_<YYYYMMDD_HHMMSS>.csv`, with `_<n>` appended if
    /// a log with that name already exists. `dir` is created if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn create_in(
        dir: impl AsRef<Path>,
        prefix: &str,
        started: DateTime<Local>,
    ) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|source| PersistenceError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
            info!(path = %dir.display(), "Created data directory");
        }

        let stem = format!("{}_{}", prefix, started.format("%Y%m%d_%H%M%S"));
        let mut last_err = None;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{stem}.csv")
            } else {
                format!("{stem}_{attempt}.csv")
            };

            match Self::open(dir.join(&name)) {
                Err(e) if e.name_taken() => {
                    debug!(file = %name, "Session log name taken");
                    last_err = Some(e);
                }
                other => return other,
            }
        }

        Err(last_err.unwrap_or_else(|| PersistenceError::Open {
            path: dir.join(format!("{stem}.csv")),
            source: io::Error::from(io::ErrorKind::AlreadyExists),
        }))
    }

    pub(crate) fn from_sink(path: PathBuf, out: impl LogSink + 'static) -> Self {
        Self {
            path,
            out: Box::new(out),
            committed: 0,
            rows: 0,
        }
    }

    /// Append one row for `sample`, stamped with the current UTC time.
    ///
    /// A failed write is logged and reported. Whatever part of the row
    /// reached the file is cut off again; the row is lost but the log stays
    /// usable.
    pub fn append(&mut self, sample: &Sample) -> Result<(), PersistenceError> {
        let line = format!(
            "{},{},{},{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            sample.left,
            sample.right,
            sample.device_time
        );

        match self.write_line(&line) {
            Ok(()) => {
                self.rows += 1;
                Ok(())
            }
            Err(source) => {
                warn!(path = %self.path.display(), error = %source, "Dropped sample: write failed");
                Err(PersistenceError::Write {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut row = Vec::with_capacity(line.len() + 1);
        row.extend_from_slice(line.as_bytes());
        row.push(b'\n');

        match self.out.write_all(&row).and_then(|()| self.out.flush()) {
            Ok(()) => {
                self.committed += row.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.out.truncate(self.committed) {
                    error!(
                        path = %self.path.display(),
                        error = %rollback,
                        "Failed to roll back partial row"
                    );
                }
                Err(e)
            }
        }
    }

    /// Path of the log.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the log.
    #[must_use]
    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }

    /// Data rows written so far, excluding the header.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Release the file handle. Returns the log's path.
    pub fn close(self) -> PathBuf {
        debug!(path = %self.path.display(), rows = self.rows, "Closed session log");
        self.path
    }
}

/// Final path component as a string, for responses.
#[must_use]
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl std::fmt::Debug for PersistenceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWriter")
            .field("path", &self.path)
            .field("rows", &self.rows)
            .finish()
    }
}

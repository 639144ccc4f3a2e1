use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, TryLockError};

/// Result of a non-blocking log attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogWrite {
    Written,
    /// Another task held the log; the row was skipped.
    Contended,
    /// The log was closed or never opened.
    Closed,
}

/// Append-only CSV log private to one driver. Each row is prefixed with
/// an ISO-8601 UTC timestamp and flushed immediately.
pub struct DataLog {
    path: Option<PathBuf>,
    file: Mutex<Option<BufWriter<File>>>,
}

impl DataLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    /// A log that accepts nothing. Used when a driver runs without an
    /// output directory.
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn log(&self, fields: &[&str]) -> io::Result<LogWrite> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        write_row(&mut guard, fields)
    }

    pub fn try_log(&self, fields: &[&str]) -> io::Result<LogWrite> {
        let mut guard = match self.file.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(LogWrite::Contended),
        };
        write_row(&mut guard, fields)
    }

    /// Flushes and closes. Later writes report [`LogWrite::Closed`].
    pub fn close(&self) -> io::Result<()> {
        let taken = self.file.lock().unwrap_or_else(PoisonError::into_inner).take();
        match taken {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

fn write_row(file: &mut Option<BufWriter<File>>, fields: &[&str]) -> io::Result<LogWrite> {
    let Some(writer) = file.as_mut() else {
        return Ok(LogWrite::Closed);
    };
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let mut row = timestamp;
    for field in fields {
        row.push(',');
        row.push_str(field);
    }
    row.push('\n');
    writer.write_all(row.as_bytes())?;
    writer.flush()?;
    Ok(LogWrite::Written)
}

//! Attendance sink backends: append-only CSV file and SQLite table.

use crate::config::Config;
use rollcall_core::{AttendanceRecord, AttendanceSink, PersistError};
use rusqlite::{params, Connection};
use serde::Deserialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Csv,
    Sqlite,
}

impl SinkKind {
    pub fn default_file_name(&self) -> &'static str {
        match self {
            SinkKind::Csv => "attendance.csv",
            SinkKind::Sqlite => "attendance.db",
        }
    }
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(SinkKind::Csv),
            "sqlite" => Ok(SinkKind::Sqlite),
            other => Err(format!("unknown sink {other:?} (expected csv or sqlite)")),
        }
    }
}

/// Open the configured backend, failing fast if it is not writable.
pub fn open(config: &Config) -> Result<Box<dyn AttendanceSink + Send>, PersistError> {
    let path = config.attendance_path();
    let sink: Box<dyn AttendanceSink + Send> = match config.sink {
        SinkKind::Csv => Box::new(CsvSink::open(&path)?),
        SinkKind::Sqlite => Box::new(SqliteSink::open(&path)?),
    };
    tracing::info!(kind = ?config.sink, path = %path.display(), "attendance sink ready");
    Ok(sink)
}

fn ensure_parent(path: &Path) -> Result<(), PersistError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Appends `YYYY-MM-DD HH:MM:SS,label,token_id` rows to a local file.
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let path = path.into();
        ensure_parent(&path)?;
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn row(record: &AttendanceRecord) -> String {
        format!(
            "{} {},{},{}\n",
            record.date(),
            record.time(),
            csv_field(&record.label),
            record.token_id
        )
    }
}

impl AttendanceSink for CsvSink {
    fn record(&mut self, record: AttendanceRecord) -> Result<(), PersistError> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(Self::row(&record).as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Appends rows to an `attendance` table.
pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self, PersistError> {
        ensure_parent(path)?;
        let conn = Connection::open(path).map_err(backend)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attendance (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT    NOT NULL,
                date        TEXT    NOT NULL,
                time        TEXT    NOT NULL,
                label       TEXT    NOT NULL,
                token_id    INTEGER NOT NULL
            );",
        )
        .map_err(backend)?;
        Ok(Self { conn })
    }
}

impl AttendanceSink for SqliteSink {
    fn record(&mut self, record: AttendanceRecord) -> Result<(), PersistError> {
        let token_id = i64::try_from(record.token_id.0).map_err(|_| {
            PersistError::Backend(format!("token id {} exceeds INTEGER range", record.token_id))
        })?;
        self.conn
            .execute(
                "INSERT INTO attendance (recorded_at, date, time, label, token_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.timestamp.to_rfc3339(),
                    record.date(),
                    record.time(),
                    record.label,
                    token_id
                ],
            )
            .map_err(backend)?;
        Ok(())
    }
}

fn backend(e: rusqlite::Error) -> PersistError {
    PersistError::Backend(e.to_string())
}

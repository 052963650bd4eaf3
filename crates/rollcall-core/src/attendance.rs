use crate::verifier::TokenId;
use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("attendance write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("attendance backend error: {0}")]
    Backend(String),
}

/// An accepted attendance event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub label: String,
    pub token_id: TokenId,
    pub timestamp: DateTime<Local>,
}

impl AttendanceRecord {
    pub fn new(label: impl Into<String>, token_id: TokenId, timestamp: DateTime<Local>) -> Self {
        Self {
            label: label.into(),
            token_id,
            timestamp,
        }
    }

    /// `YYYY-MM-DD`
    pub fn date(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }

    /// `HH:MM:SS`
    pub fn time(&self) -> String {
        self.timestamp.format("%H:%M:%S").to_string()
    }
}

/// Durable, append-only destination for accepted attendance.
///
/// Records are never updated or deleted through this interface.
pub trait AttendanceSink {
    fn record(&mut self, record: AttendanceRecord) -> Result<(), PersistError>;
}

impl<S: AttendanceSink + ?Sized> AttendanceSink for Box<S> {
    fn record(&mut self, record: AttendanceRecord) -> Result<(), PersistError> {
        (**self).record(record)
    }
}

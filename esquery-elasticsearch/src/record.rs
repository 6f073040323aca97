use std::{collections::BTreeMap, io::Write};

use color_eyre::Report;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Count(u64),
    Float(f64),
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Count(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

pub fn serialize_timestamp<S>(
    timestamp: &OffsetDateTime,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let formatted = timestamp
        .format(&Rfc3339)
        .map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&formatted)
}

/// One flat time-series point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputRecord {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: OffsetDateTime,
}

/// Replaces every character that isn't alphanumeric or `_` with `_`, so `beat.hostname` becomes
/// `beat_hostname`.
pub fn normalize_tag_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Destination of everything a cycle produces.
pub trait RecordSink: Send + Sync {
    fn add_record(&self, record: OutputRecord);

    /// Reports a failed pipeline, without stopping the cycle.
    fn add_error(&self, measurement: &str, error: &Report);
}

/// Keeps everything in memory, mostly useful for tests and for inspecting the last cycle.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<OutputRecord>>,
    errors: Mutex<Vec<(String, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<OutputRecord> {
        self.records.lock().clone()
    }

    /// `(measurement, message)` pairs.
    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().clone()
    }
}

impl RecordSink for MemorySink {
    fn add_record(&self, record: OutputRecord) {
        self.records.lock().push(record);
    }

    fn add_error(&self, measurement: &str, error: &Report) {
        self.errors
            .lock()
            .push((measurement.to_string(), format!("{error:#}")));
    }
}

/// Writes every record as a JSON line, errors are logged.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    fn add_record(&self, record: OutputRecord) {
        let mut writer = self.writer.lock();
        let result = serde_json::to_writer(&mut *writer, &record)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(e) = result {
            error!(measurement = %record.measurement, "Failed to write record: {e}");
        }
    }

    fn add_error(&self, measurement: &str, error: &Report) {
        error!(%measurement, "Aggregation failed: {error:#}");
    }
}

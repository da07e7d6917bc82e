use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use prost_types::Timestamp as ProstTimestamp;
use std::path::Path;

pub fn prost_timestamp_to_datetime(prost_timestamp: &ProstTimestamp) -> DateTime<Utc> {
    let nanos = prost_timestamp.nanos.clamp(0, 999_999_999) as u32;
    DateTime::<Utc>::from_timestamp(prost_timestamp.seconds, nanos)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn datetime_to_prost_timestamp(datetime: &DateTime<Utc>) -> ProstTimestamp {
    ProstTimestamp {
        seconds: datetime.timestamp(),
        nanos: datetime.timestamp_subsec_nanos() as i32,
    }
}

pub fn read_file_to_bytes(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read file {}", path))
}

/// Resolves `path` against the repository directory unless it is absolute or a URL.
pub fn resolve_path(cwd: Option<&str>, path: &str) -> String {
    if path.contains("://") || path == ":memory:" || Path::new(path).is_absolute() {
        return path.to_string();
    }
    match cwd {
        Some(prefix) => Path::new(prefix).join(path).to_string_lossy().into_owned(),
        None => path.to_string(),
    }
}

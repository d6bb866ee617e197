//! Atomic JSON persistence for sidecar records.
//!
//! Writes go to a temp file with a PID-unique suffix, are fsynced, then
//! renamed over the target so a crash mid-write never leaves a torn record.

use crate::{HangarError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;

/// Read and parse a JSON file. Returns `None` if it doesn't exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path).map_err(|e| HangarError::io_with_path(e, path))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| HangarError::io_with_path(e, path))?;

    let data: T = serde_json::from_str(&contents).map_err(|e| HangarError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Write data to a JSON file atomically (temp file + fsync + rename).
pub fn write_json_atomic<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| HangarError::io_with_path(e, parent))?;
        }
    }

    let temp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));

    let serialized = serde_json::to_string_pretty(data).map_err(|e| HangarError::Json {
        message: format!("Failed to serialize record: {}", e),
        source: Some(e),
    })?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| HangarError::io_with_path(e, &temp_path))?;

        file.write_all(serialized.as_bytes())
            .map_err(|e| HangarError::io_with_path(e, &temp_path))?;
        file.sync_all()
            .map_err(|e| HangarError::io_with_path(e, &temp_path))?;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        HangarError::io_with_path(e, path)
    })?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestRecord {
        name: String,
        value: i32,
    }

    #[test]
    fn test_write_and_read_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("record.json");

        let data = TestRecord {
            name: "sidecar".to_string(),
            value: 42,
        };

        write_json_atomic(&path, &data).unwrap();
        assert!(path.exists());

        let read_back: Option<TestRecord> = read_json(&path).unwrap();
        assert_eq!(read_back, Some(data));
    }

    #[test]
    fn test_read_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.json");

        let result: Option<TestRecord> = read_json(&path).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_write_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a").join("b").join("record.json");

        let data = TestRecord {
            name: "nested".to_string(),
            value: 7,
        };

        write_json_atomic(&path, &data).unwrap();
        assert!(path.exists());
    }
}

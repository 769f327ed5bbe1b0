//! Atomic file I/O: write-via-temp-then-rename for small JSON
//! documents, append-only JSONL logs, and offset-cursor reads.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::SlotFsError;

/// Serialize `value` and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SlotFsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value).expect("value must be serializable");
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json.as_bytes())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and parse `path`, returning `None` on `ENOENT` or any parse
/// failure. Never partially parses.
pub fn read_json_tolerant<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Append one JSON object as a single `\n`-terminated line.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(record).expect("record must be serializable");
    writeln!(file, "{line}")?;
    file.flush()
}

/// Ensure a file exists (touch), without truncating an existing one.
pub fn touch(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// Read the decimal integer stored in an offset file, defaulting to 0 if
/// absent or malformed.
pub fn read_offset(path: &Path) -> u64 {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Atomically write a decimal offset value.
pub fn write_offset(path: &Path, value: u64) -> Result<(), SlotFsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("offset.tmp");
    fs::write(&tmp, value.to_string())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Yield each line of a JSONL file from `offset` (inclusive), returning
/// `(index, raw_line)` pairs so callers can advance the offset precisely
/// even across blank or malformed lines.
pub fn read_lines_from_offset(path: &Path, offset: u64) -> std::io::Result<Vec<(u64, String)>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .enumerate()
        .skip(offset as usize)
        .map(|(idx, line)| (idx as u64, line.to_string()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        a: i32,
        b: String,
    }

    #[test]
    fn write_then_read_json_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Doc {
            a: 1,
            b: "hi".into(),
        };
        write_json_atomic(&path, &doc).unwrap();
        let read: Doc = read_json_tolerant(&path).unwrap();
        assert_eq!(doc, read);
    }

    #[test]
    fn read_json_tolerant_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let read: Option<Doc> = read_json_tolerant(&path);
        assert!(read.is_none());
    }

    #[test]
    fn read_json_tolerant_malformed_is_none_not_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, b"{not json").unwrap();
        let read: Option<Doc> = read_json_tolerant(&path);
        assert!(read.is_none());
    }

    #[test]
    fn append_jsonl_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        append_jsonl(&path, &Doc { a: 1, b: "x".into() }).unwrap();
        append_jsonl(&path, &Doc { a: 2, b: "y".into() }).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn offset_defaults_to_zero_and_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.offset");
        assert_eq!(read_offset(&path), 0);
        write_offset(&path, 7).unwrap();
        assert_eq!(read_offset(&path), 7);
    }

    #[test]
    fn read_lines_from_offset_skips_processed_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.jsonl");
        for i in 0..5 {
            append_jsonl(&path, &Doc { a: i, b: "x".into() }).unwrap();
        }
        let lines = read_lines_from_offset(&path, 3).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, 3);
    }
}

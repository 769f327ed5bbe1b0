//! Slot directory discovery, path validation, and snapshot reads.
//! Listing is deterministic and lexicographic; readers tolerate missing
//! or malformed documents by returning "absent" rather than partially
//! parsing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::atomic_io::read_json_tolerant;
use crate::errors::SlotFsError;
use crate::model::{SlotConfig, SlotPaths, SlotSnapshot, SlotState};

fn slot_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap())
}

pub fn ensure_slots_root(slots_root: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(slots_root)?;
    fs::canonicalize(slots_root)
}

pub fn validate_slot_id(slot_id: &str) -> Result<(), SlotFsError> {
    if slot_id.is_empty() || !slot_id_pattern().is_match(slot_id) {
        return Err(SlotFsError::InvalidSlotId);
    }
    Ok(())
}

pub fn slot_paths(slots_root: &Path, slot_id: &str) -> Result<SlotPaths, SlotFsError> {
    validate_slot_id(slot_id)?;
    let root_parent = slots_root
        .canonicalize()
        .unwrap_or_else(|_| slots_root.to_path_buf());
    let root = root_parent.join(slot_id);
    // `slot_id` is already restricted to a safe character class above, so a
    // simple parent-prefix check here is sufficient: no `..` component can
    // ever appear in `root`, and joining a plain filename under a directory
    // cannot escape it.
    if root.parent() != Some(root_parent.as_path()) {
        return Err(SlotFsError::PathEscape);
    }
    Ok(SlotPaths {
        slot_id: slot_id.to_string(),
        root: root.clone(),
        config_path: root.join("slot_config.yml"),
        state_path: root.join("slot_state.json"),
        status_path: root.join("status.json"),
        pid_path: root.join("slot_state.pid"),
        run_meta_path: root.join("run_meta.json"),
        leads_path: root.join("leads.jsonl"),
    })
}

pub fn list_slot_paths(slots_root: &Path) -> std::io::Result<Vec<SlotPaths>> {
    let root = ensure_slots_root(slots_root)?;
    let mut entries: Vec<_> = fs::read_dir(&root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    entries.sort_by_key(|e| e.file_name());
    let mut results = Vec::new();
    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Ok(paths) = slot_paths(&root, &name) {
            results.push(paths);
        }
    }
    Ok(results)
}

fn read_yaml_config(path: &Path) -> Option<SlotConfig> {
    let text = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&text).ok()
}

fn count_lines(path: &Path) -> Option<u64> {
    let text = fs::read_to_string(path).ok()?;
    Some(text.lines().count() as u64)
}

pub fn read_slot_snapshot(paths: &SlotPaths) -> SlotSnapshot {
    let config = read_yaml_config(&paths.config_path);
    let state: Option<SlotState> = read_json_tolerant(&paths.state_path);
    let status: Option<SlotState> = read_json_tolerant(&paths.status_path);
    let leads_count = count_lines(&paths.leads_path);

    let heartbeat_ts = state
        .as_ref()
        .map(|s| s.heartbeat_ts)
        .or_else(|| status.as_ref().map(|s| s.heartbeat_ts));
    let pid = state
        .as_ref()
        .map(|s| s.pid)
        .or_else(|| status.as_ref().map(|s| s.pid));
    let phase = state
        .as_ref()
        .map(|s| s.phase)
        .or_else(|| status.as_ref().map(|s| s.phase));

    let heartbeat_age_seconds = heartbeat_ts.map(|ts| {
        let now: DateTime<Utc> = Utc::now();
        (now - ts).num_milliseconds().max(0) as f64 / 1000.0
    });

    SlotSnapshot {
        slot_id: paths.slot_id.clone(),
        config,
        state,
        status,
        leads_count,
        heartbeat_ts,
        heartbeat_age_seconds,
        pid,
        phase,
        paths: paths.clone(),
    }
}

pub fn pid_is_alive(pid: u32) -> bool {
    let system = sysinfo::System::new_all();
    system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn validate_slot_id_rejects_path_escape() {
        assert!(validate_slot_id("../etc").is_err());
        assert!(validate_slot_id("a/b").is_err());
        assert!(validate_slot_id("").is_err());
    }

    #[test]
    fn validate_slot_id_accepts_safe_names() {
        assert!(validate_slot_id("s1").is_ok());
        assert!(validate_slot_id("my.slot-1_a").is_ok());
    }

    #[test]
    fn slot_paths_escape_rejected_without_touching_fs() {
        let dir = tempdir().unwrap();
        let err = slot_paths(dir.path(), "../escape");
        assert!(err.is_err());
    }

    #[test]
    fn list_slot_paths_is_lexicographic() {
        let dir = tempdir().unwrap();
        for name in ["zzz", "aaa", "mmm"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        let listed = list_slot_paths(dir.path()).unwrap();
        let ids: Vec<_> = listed.iter().map(|p| p.slot_id.clone()).collect();
        assert_eq!(ids, vec!["aaa", "mmm", "zzz"]);
    }

    #[test]
    fn snapshot_of_missing_slot_is_absent_not_error() {
        let dir = tempdir().unwrap();
        let paths = slot_paths(dir.path(), "ghost").unwrap();
        let snap = read_slot_snapshot(&paths);
        assert!(snap.state.is_none());
        assert!(snap.status.is_none());
        assert!(snap.leads_count.is_none());
        assert!(snap.heartbeat_ts.is_none());
    }

    #[test]
    fn snapshot_tolerates_malformed_state_json() {
        let dir = tempdir().unwrap();
        let paths = slot_paths(dir.path(), "s1").unwrap();
        fs::create_dir_all(&paths.root).unwrap();
        fs::write(&paths.state_path, b"{ not json").unwrap();
        let snap = read_slot_snapshot(&paths);
        assert!(snap.state.is_none());
    }
}

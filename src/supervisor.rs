//! Supervisor: slot discovery, spawn/restart/stop, heartbeat TTL
//! enforcement, alert throttling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tracing::{info, warn};
use uuid::Uuid;

use crate::atomic_io::write_json_atomic;
use crate::errors::RestartReason;
use crate::model::RunMeta;
use crate::slot_fs::{list_slot_paths, pid_is_alive, read_slot_snapshot};

pub const HEARTBEAT_TTL_SECONDS_DEFAULT: u64 = 30;
pub const SCAN_INTERVAL_SECONDS_DEFAULT: u64 = 3;
pub const MIN_RESTART_INTERVAL_SECONDS: i64 = 5;
pub const ALERTS_MIN_SECONDS_DEFAULT: i64 = 300;

pub struct SupervisorConfig {
    pub slots_root: PathBuf,
    pub worker_exe: PathBuf,
    pub api_base: String,
    pub worker_secret: String,
    pub heartbeat_interval_seconds: f64,
    pub heartbeat_ttl_seconds: u64,
    pub scan_interval_seconds: u64,
    pub alerts_min_seconds: i64,
    pub alert_webhook_url: Option<String>,
    pub profile_root: PathBuf,
}

pub struct ManagedSlot {
    pub slot_id: String,
    child: Option<Child>,
    last_start_ts: Option<DateTime<Utc>>,
    last_stop_ts: Option<DateTime<Utc>>,
    pid_alive: Option<bool>,
    disabled: bool,
    run_id: Option<String>,
    last_alert_ts: Option<DateTime<Utc>>,
    last_alert_reason: Option<String>,
}

impl ManagedSlot {
    fn new(slot_id: String) -> Self {
        ManagedSlot {
            slot_id,
            child: None,
            last_start_ts: None,
            last_stop_ts: None,
            pid_alive: None,
            disabled: false,
            run_id: None,
            last_alert_ts: None,
            last_alert_reason: None,
        }
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    slots: Mutex<HashMap<String, ManagedSlot>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Supervisor {
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn scan_slots(&self) {
        let Ok(paths) = list_slot_paths(&self.config.slots_root) else {
            return;
        };
        let mut slots = self.slots.lock().unwrap();
        for p in paths {
            slots
                .entry(p.slot_id.clone())
                .or_insert_with(|| ManagedSlot::new(p.slot_id));
        }
    }

    async fn start_slot(&self, slot_id: &str) {
        let worker_cmd = {
            let mut slots = self.slots.lock().unwrap();
            let managed = slots
                .entry(slot_id.to_string())
                .or_insert_with(|| ManagedSlot::new(slot_id.to_string()));
            managed.disabled = false;

            let now = Utc::now();
            if let Some(last_start) = managed.last_start_ts {
                if (now - last_start).num_seconds() < MIN_RESTART_INTERVAL_SECONDS {
                    return;
                }
            }
            if managed.is_alive() {
                return;
            }

            let run_id = Uuid::new_v4().to_string();
            managed.run_id = Some(run_id.clone());
            managed.last_start_ts = Some(now);
            Some(run_id)
        };

        let Some(run_id) = worker_cmd else { return };

        let slot_dir = self.config.slots_root.join(slot_id);
        if let Err(err) = std::fs::create_dir_all(&slot_dir) {
            warn!(%err, slot_id, "failed to create slot directory");
            return;
        }
        let meta = RunMeta {
            slot_id: slot_id.to_string(),
            run_id: run_id.clone(),
            started_at: Utc::now(),
        };
        if let Err(err) = write_json_atomic(&slot_dir.join("run_meta.json"), &meta) {
            warn!(%err, slot_id, "failed to write run_meta.json");
        }

        let profile_path = self.config.profile_root.join(slot_id);
        let _ = std::fs::create_dir_all(&profile_path);

        let spawn_result = Command::new(&self.config.worker_exe)
            .arg("worker")
            .arg(&self.config.slots_root)
            .arg(slot_id)
            .arg(&run_id)
            .arg(&self.config.api_base)
            .arg(&self.config.worker_secret)
            .arg(&profile_path)
            .arg(self.config.heartbeat_interval_seconds.to_string())
            .kill_on_drop(true)
            .spawn();

        let mut slots = self.slots.lock().unwrap();
        let managed = slots.get_mut(slot_id).unwrap();
        match spawn_result {
            Ok(child) => {
                managed.child = Some(child);
                info!(slot_id, run_id, "worker started");
            }
            Err(err) => {
                warn!(%err, slot_id, "failed to spawn worker");
            }
        }
    }

    pub async fn stop_slot(&self, slot_id: &str, force: bool) {
        let child = {
            let mut slots = self.slots.lock().unwrap();
            let Some(managed) = slots.get_mut(slot_id) else {
                return;
            };
            managed.disabled = true;
            managed.child.take()
        };
        if let Some(mut child) = child {
            if let Some(pid) = child.id() {
                #[cfg(unix)]
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
                #[cfg(not(unix))]
                let _ = pid;
            }
            let waited = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            if waited.is_err() && force {
                let _ = child.start_kill();
                let _ = tokio::time::timeout(Duration::from_secs(3), child.wait()).await;
            }
        }
        let mut slots = self.slots.lock().unwrap();
        if let Some(managed) = slots.get_mut(slot_id) {
            managed.last_stop_ts = Some(Utc::now());
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.slots.lock().unwrap().keys().cloned().collect();
        for id in ids {
            self.stop_slot(&id, true).await;
        }
    }

    fn compute_restart_reasons(&self, slot_id: &str) -> Vec<RestartReason> {
        let snapshot = {
            let paths = match crate::slot_fs::slot_paths(&self.config.slots_root, slot_id) {
                Ok(p) => p,
                Err(_) => return Vec::new(),
            };
            read_slot_snapshot(&paths)
        };

        let mut slots = self.slots.lock().unwrap();
        let Some(managed) = slots.get_mut(slot_id) else {
            return Vec::new();
        };
        if managed.disabled {
            return Vec::new();
        }
        managed.pid_alive = snapshot.pid.map(pid_is_alive);

        let mut reasons = Vec::new();
        match snapshot.heartbeat_age_seconds {
            None => reasons.push(RestartReason::HeartbeatMissing),
            Some(age) if age > self.config.heartbeat_ttl_seconds as f64 => {
                reasons.push(RestartReason::HeartbeatStale {
                    age_seconds: age as u64,
                })
            }
            _ => {}
        }
        if !managed.is_alive() {
            reasons.push(RestartReason::ProcessExited);
        }
        if managed.pid_alive == Some(false) {
            reasons.push(RestartReason::PidNotAlive);
        }
        reasons
    }

    fn maybe_alert(&self, slot_id: &str, reason_text: &str) -> bool {
        let mut slots = self.slots.lock().unwrap();
        let Some(managed) = slots.get_mut(slot_id) else {
            return false;
        };
        let now = Utc::now();
        let changed = managed.last_alert_reason.as_deref() != Some(reason_text);
        let elapsed_enough = managed
            .last_alert_ts
            .map(|ts| (now - ts).num_seconds() >= self.config.alerts_min_seconds)
            .unwrap_or(true);
        let should_alert = changed || elapsed_enough;
        if should_alert {
            managed.last_alert_ts = Some(now);
            managed.last_alert_reason = Some(reason_text.to_string());
        }
        should_alert
    }

    async fn send_alert(&self, slot_id: &str, reason_text: &str) {
        let Some(url) = &self.config.alert_webhook_url else {
            return;
        };
        let client = reqwest::Client::new();
        let body = serde_json::json!({
            "text": format!("engyne slot restart: slot={slot_id} reason={reason_text}"),
        });
        if let Err(err) = client
            .post(url)
            .json(&body)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            warn!(%err, "alert webhook failed");
        }
    }

    /// One supervisor tick: scan, refresh, enforce.
    pub async fn tick(&self) {
        self.scan_slots();
        let slot_ids: Vec<String> = self.slots.lock().unwrap().keys().cloned().collect();
        for slot_id in slot_ids {
            let reasons = self.compute_restart_reasons(&slot_id);
            if reasons.is_empty() {
                continue;
            }
            let reason_text = reasons
                .iter()
                .map(|r| r.describe())
                .collect::<Vec<_>>()
                .join(", ");
            if self.maybe_alert(&slot_id, &reason_text) {
                self.send_alert(&slot_id, &reason_text).await;
            }
            self.start_slot(&slot_id).await;
        }
    }

    pub async fn run(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.scan_interval_seconds));
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_config(root: PathBuf) -> SupervisorConfig {
        SupervisorConfig {
            slots_root: root.clone(),
            worker_exe: PathBuf::from("/bin/true"),
            api_base: String::new(),
            worker_secret: String::new(),
            heartbeat_interval_seconds: 2.0,
            heartbeat_ttl_seconds: 30,
            scan_interval_seconds: 3,
            alerts_min_seconds: 300,
            alert_webhook_url: None,
            profile_root: root.join("profiles"),
        }
    }

    #[tokio::test]
    async fn scan_registers_existing_slot_directories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("s1")).unwrap();
        let sup = Supervisor::new(make_config(dir.path().to_path_buf()));
        sup.scan_slots();
        assert!(sup.slots.lock().unwrap().contains_key("s1"));
    }

    #[tokio::test]
    async fn missing_heartbeat_produces_restart_reason() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("s1")).unwrap();
        let sup = Supervisor::new(make_config(dir.path().to_path_buf()));
        sup.scan_slots();
        let reasons = sup.compute_restart_reasons("s1");
        assert!(reasons.contains(&RestartReason::HeartbeatMissing));
    }

    #[tokio::test]
    async fn alert_throttles_on_unchanged_reason() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("s1")).unwrap();
        let mut cfg = make_config(dir.path().to_path_buf());
        cfg.alerts_min_seconds = 300;
        let sup = Supervisor::new(cfg);
        sup.scan_slots();
        assert!(sup.maybe_alert("s1", "heartbeat missing"));
        assert!(!sup.maybe_alert("s1", "heartbeat missing"));
        assert!(sup.maybe_alert("s1", "process exited"));
    }
}

//! Shared data model for slots, leads, and queue records.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed filenames inside a slot directory, and the resolved, validated
/// paths that back them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPaths {
    pub slot_id: String,
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub status_path: PathBuf,
    pub pid_path: PathBuf,
    pub run_meta_path: PathBuf,
    pub leads_path: PathBuf,
}

/// Worker phase, written into `SlotState`/`status.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotPhase {
    Boot,
    Init,
    ParseLeads,
    LoginRequired,
    Cooldown,
    Stopping,
    Error,
}

/// `slot_config.yml`, authored externally and read fresh at the top of
/// every worker cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    #[serde(default)]
    pub quality_level: i64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub auto_buy: bool,
    #[serde(default)]
    pub max_leads_per_cycle: Option<u32>,
    #[serde(default)]
    pub max_clicks_per_cycle: Option<u32>,
    #[serde(default)]
    pub max_run_minutes: Option<u32>,
    #[serde(default)]
    pub allowed_countries: BTreeSet<String>,
    #[serde(default)]
    pub blocked_countries: BTreeSet<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub keywords_exclude: Vec<String>,
    #[serde(default)]
    pub keyword_fuzzy: bool,
    #[serde(default = "default_fuzzy_threshold")]
    pub keyword_fuzzy_threshold: f64,
    #[serde(default)]
    pub required_contact_methods: BTreeSet<String>,
    #[serde(default)]
    pub channels: BTreeMap<String, bool>,
    #[serde(default)]
    pub version: i64,
    /// Floor for the inter-cycle sleep.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: f64,
    /// `"stub"` (synthetic candidates, no real browser) or `"playwright"`.
    #[serde(default = "default_worker_mode")]
    pub worker_mode: String,
}

fn default_fuzzy_threshold() -> f64 {
    0.82
}

fn default_cooldown_seconds() -> f64 {
    5.0
}

fn default_worker_mode() -> String {
    "stub".to_string()
}

impl Default for SlotConfig {
    fn default() -> Self {
        SlotConfig {
            quality_level: 0,
            dry_run: false,
            auto_buy: false,
            max_leads_per_cycle: None,
            max_clicks_per_cycle: None,
            max_run_minutes: None,
            allowed_countries: BTreeSet::new(),
            blocked_countries: BTreeSet::new(),
            keywords: Vec::new(),
            keywords_exclude: Vec::new(),
            keyword_fuzzy: false,
            keyword_fuzzy_threshold: default_fuzzy_threshold(),
            required_contact_methods: BTreeSet::new(),
            channels: BTreeMap::new(),
            version: 0,
            cooldown_seconds: default_cooldown_seconds(),
            worker_mode: default_worker_mode(),
        }
    }
}

/// Cycle counters reported in heartbeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleCounters {
    #[serde(default)]
    pub leads_found: u64,
    #[serde(default)]
    pub leads_kept: u64,
    #[serde(default)]
    pub clicks_sent: u64,
    #[serde(default)]
    pub verified: u64,
}

/// `slot_state.json` / `status.json` — written by the worker, read by the
/// supervisor and external readers. Two separate files carrying the same
/// shape so a reader can get a self-consistent snapshot of either even
/// while the other is mid-replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotState {
    pub slot_id: String,
    pub phase: SlotPhase,
    pub run_id: String,
    pub pid: u32,
    pub heartbeat_ts: DateTime<Utc>,
    #[serde(default)]
    pub counters: CycleCounters,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// `run_meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub slot_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
}

/// Computed view combining config, state, status, leads count, and OS
/// liveness probe — never itself persisted.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub slot_id: String,
    pub config: Option<SlotConfig>,
    pub state: Option<SlotState>,
    pub status: Option<SlotState>,
    pub leads_count: Option<u64>,
    pub heartbeat_ts: Option<DateTime<Utc>>,
    pub heartbeat_age_seconds: Option<f64>,
    pub pid: Option<u32>,
    pub phase: Option<SlotPhase>,
    pub paths: SlotPaths,
}

/// Structured key/value rows extracted from a raw lead's free text body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredFields {
    #[serde(default)]
    pub quantity_text: Option<String>,
    #[serde(default)]
    pub strength_text: Option<String>,
    #[serde(default)]
    pub packaging_text: Option<String>,
    #[serde(default)]
    pub intent_text: Option<String>,
    #[serde(default)]
    pub buys_text: Option<String>,
    #[serde(default)]
    pub engagement_requirements: Option<i64>,
    #[serde(default)]
    pub engagement_calls: Option<i64>,
    #[serde(default)]
    pub engagement_replies: Option<i64>,
    #[serde(default)]
    pub retail_hint: bool,
}

/// A raw lead candidate as scraped (or synthesized by the stub worker
/// mode), before filtering. Field names follow the original contact
/// "channel availability" shape: `contact` is a free-form preferred
/// method, `channel_availability` lists which methods the listing itself
/// exposes (used to satisfy `required_contact_methods` even without an
/// extracted contact value).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawLead {
    pub lead_id: String,
    pub title: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub time_text: Option<String>,
    #[serde(default)]
    pub member_since_text: Option<String>,
    #[serde(default)]
    pub category_text: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub availability: BTreeSet<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub channel_availability: BTreeSet<String>,
}

/// Outcome of running the lead filter over a `RawLead`.
#[derive(Debug, Clone)]
pub enum FilterOutcome {
    Keep,
    Reject { reason: String },
}

/// A normalized, append-only line in `leads.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadRecord {
    pub slot_id: String,
    pub run_id: String,
    pub lead_id: String,
    pub observed_at: DateTime<Utc>,
    pub title: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub time_text: Option<String>,
    #[serde(default)]
    pub age_hours: Option<f64>,
    #[serde(default)]
    pub member_months: Option<i64>,
    #[serde(default)]
    pub member_since_text: Option<String>,
    #[serde(default)]
    pub category_text: Option<String>,
    #[serde(default)]
    pub availability: BTreeSet<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub structured: StructuredFields,
    pub quality_level: i64,
    pub policy: String,
    pub auto_buy: bool,
    pub dry_run: bool,
    pub clicked: bool,
    pub verified: bool,
    #[serde(default)]
    pub verification_source: Option<String>,
    #[serde(default)]
    pub reject_reason: Option<String>,
    /// Free-form lead body, truncated to at most 2 KiB.
    pub text: String,
}

pub const MAX_LEAD_TEXT_BYTES: usize = 2048;

pub fn truncate_text(text: &str) -> String {
    if text.len() <= MAX_LEAD_TEXT_BYTES {
        return text.to_string();
    }
    let mut end = MAX_LEAD_TEXT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Wire type posted by a worker to the verified-event sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedEvent {
    pub slot_id: String,
    pub lead_id: String,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A `VerifiedEvent` augmented with sink-side fields, the line shape of
/// every `{channel}_queue.jsonl` / `verified_queue.jsonl` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub slot_id: String,
    pub lead_id: String,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// Per-lead delivery status for one channel (`{channel}_queue.contact_state.json`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Held,
    Skipped,
    Blocked,
    Sent,
    Failed,
}

impl ContactStatus {
    /// Sent, skipped, and failed never auto-transition again; a
    /// re-encountered line in one of these statuses advances the offset
    /// silently without being reprocessed or re-journaled.
    pub fn is_terminal(self) -> bool {
        matches!(self, ContactStatus::Sent | ContactStatus::Skipped | ContactStatus::Failed)
    }

    /// Blocked and held leads are not retried automatically; a
    /// re-encountered line in one of these statuses pauses the pass in
    /// place (the offset does not advance past it).
    pub fn is_paused(self) -> bool {
        matches!(self, ContactStatus::Blocked | ContactStatus::Held)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactStateEntry {
    pub status: ContactStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-slot sliding-window rate state (`{channel}_queue.rate.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateWindow {
    pub window_start_epoch_secs: f64,
    pub sent: u32,
}

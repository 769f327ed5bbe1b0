//! Channel dispatcher: one long-running process per delivery
//! channel — read the channel's JSONL queue from its monotonic offset,
//! enforce a per-slot sliding-window rate limit, track per-lead contact
//! state, deliver, and dual-journal every outcome.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::atomic_io::{append_jsonl, read_json_tolerant, read_lines_from_offset, read_offset, write_json_atomic, write_offset};
use crate::channel::{extract_contact, Channel, ChannelTransport};
use crate::model::{ContactStateEntry, ContactStatus, QueueRecord, RateWindow};

const RATE_WINDOW_SECONDS: f64 = 60.0;

pub struct DispatcherConfig {
    pub channel: Channel,
    pub runtime_root: PathBuf,
    pub poll_seconds: u64,
    pub rate_per_minute: u32,
    pub dry_run: bool,
    pub dry_run_advance: bool,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub waha_base_url: Option<String>,
    pub waha_session: Option<String>,
    pub waha_session_prefix: String,
    pub waha_token: Option<String>,
    pub waha_auth_header: String,
    pub waha_auth_prefix: String,
}

impl DispatcherConfig {
    fn queue_path(&self) -> PathBuf {
        self.runtime_root
            .join(format!("{}_queue.jsonl", self.channel.as_str()))
    }
    fn offset_path(&self) -> PathBuf {
        self.runtime_root
            .join(format!("{}_queue.offset", self.channel.as_str()))
    }
    fn contact_state_path(&self) -> PathBuf {
        self.runtime_root
            .join(format!("{}_queue.contact_state.json", self.channel.as_str()))
    }
    fn rate_path(&self) -> PathBuf {
        self.runtime_root
            .join(format!("{}_queue.rate.json", self.channel.as_str()))
    }
    fn sent_path(&self) -> PathBuf {
        self.runtime_root
            .join(format!("{}_queue.sent.jsonl", self.channel.as_str()))
    }
    fn proofs_path(&self) -> PathBuf {
        self.runtime_root
            .join(format!("{}_queue.proofs.jsonl", self.channel.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessOutcome {
    Sent,
    Skipped,
    Blocked,
    Held,
    Failed,
    Invalid,
    /// Already resolved by a prior decision; advance past it silently.
    AlreadyResolved,
    /// Paused on an earlier, still-open decision; stop the pass without
    /// advancing past it.
    Paused,
}

fn normalize_waha_chat_id(contact: &str, suffix: &str) -> String {
    if contact.contains("@c.us") || contact.contains("@g.us") {
        return contact.to_string();
    }
    let digits: String = contact.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
    format!("{digits}{suffix}")
}

fn resolve_waha_session(config: &DispatcherConfig, slot_id: &str) -> String {
    config
        .waha_session
        .clone()
        .unwrap_or_else(|| format!("{}{}", config.waha_session_prefix, slot_id))
}

fn build_message(payload: &serde_json::Value) -> String {
    let title = payload
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or("lead");
    let mut lines = vec![format!("ENGYNE lead: {title}")];
    if let Some(country) = payload.get("country").and_then(|v| v.as_str()) {
        lines.push(format!("Country: {country}"));
    }
    if let Some(age) = payload.get("age_hours").and_then(|v| v.as_f64()) {
        lines.push(format!("Age (hrs): {age:.1}"));
    }
    if let Some(months) = payload.get("member_months").and_then(|v| v.as_i64()) {
        lines.push(format!("Member months: {months}"));
    }
    if let Some(lead_id) = payload.get("lead_id").and_then(|v| v.as_str()) {
        lines.push(format!("Lead ID: {lead_id}"));
    }
    lines.join("\n")
}

/// Seam for substituting the plain template with a generated message
/// (e.g. an LLM composer) without touching dispatcher control flow.
pub trait MessageComposer: Send + Sync {
    fn compose(&self, payload: &serde_json::Value) -> String;
}

pub struct TemplateComposer;

impl MessageComposer for TemplateComposer {
    fn compose(&self, payload: &serde_json::Value) -> String {
        build_message(payload)
    }
}

pub struct WebhookTransport {
    pub client: reqwest::Client,
    pub url: String,
    pub secret: Option<String>,
}

#[async_trait]
impl ChannelTransport for WebhookTransport {
    async fn deliver(&self, contact: &str, message: &str) -> Result<(), String> {
        let mut req = self.client.post(&self.url).json(&serde_json::json!({
            "contact": contact,
            "message": message,
        }));
        if let Some(secret) = &self.secret {
            req = req.header("x-engyne-webhook-secret", secret);
        }
        let resp = req
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook status {}", resp.status()))
        }
    }
}

pub struct WahaTransport {
    pub client: reqwest::Client,
    pub base_url: String,
    pub session: String,
    pub token: Option<String>,
    pub auth_header: String,
    pub auth_prefix: String,
}

#[async_trait]
impl ChannelTransport for WahaTransport {
    async fn deliver(&self, contact: &str, message: &str) -> Result<(), String> {
        let chat_id = normalize_waha_chat_id(contact, "@c.us");
        let url = format!("{}/api/sendText", self.base_url.trim_end_matches('/'));
        let mut req = self.client.post(url).json(&serde_json::json!({
            "session": self.session,
            "chatId": chat_id,
            "text": message,
        }));
        if let Some(token) = &self.token {
            req = req.header(self.auth_header.clone(), format!("{}{}", self.auth_prefix, token));
        }
        let resp = req
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("waha status {}", resp.status()))
        }
    }
}

fn resolve_transport(config: &DispatcherConfig, slot_id: &str) -> Option<Box<dyn ChannelTransport>> {
    if config.channel == Channel::Whatsapp {
        if let Some(base_url) = &config.waha_base_url {
            return Some(Box::new(WahaTransport {
                client: reqwest::Client::new(),
                base_url: base_url.clone(),
                session: resolve_waha_session(config, slot_id),
                token: config.waha_token.clone(),
                auth_header: config.waha_auth_header.clone(),
                auth_prefix: config.waha_auth_prefix.clone(),
            }));
        }
    }
    config.webhook_url.as_ref().map(|url| {
        Box::new(WebhookTransport {
            client: reqwest::Client::new(),
            url: url.clone(),
            secret: config.webhook_secret.clone(),
        }) as Box<dyn ChannelTransport>
    })
}

fn rate_allows(rate_windows: &mut HashMap<String, RateWindow>, slot_id: &str, limit: u32) -> bool {
    let now = Utc::now().timestamp() as f64;
    let window = rate_windows.entry(slot_id.to_string()).or_insert(RateWindow {
        window_start_epoch_secs: now,
        sent: 0,
    });
    if now - window.window_start_epoch_secs >= RATE_WINDOW_SECONDS {
        window.window_start_epoch_secs = now;
        window.sent = 0;
    }
    window.sent < limit
}

fn rate_record_send(rate_windows: &mut HashMap<String, RateWindow>, slot_id: &str) {
    if let Some(window) = rate_windows.get_mut(slot_id) {
        window.sent += 1;
    }
}

/// Resolves one queue line's outcome per the per-lead state machine:
/// already-resolved and already-paused re-encounters short-circuit before
/// any network call; a fresh decision runs the dry-run fork, then the
/// missing-contact / missing-webhook / rate gates, then delivery.
async fn process_record(
    config: &DispatcherConfig,
    composer: &dyn MessageComposer,
    record: &QueueRecord,
    contact_state: &mut HashMap<String, ContactStateEntry>,
    rate_windows: &mut HashMap<String, RateWindow>,
) -> ProcessOutcome {
    if let Some(entry) = contact_state.get(&record.lead_id) {
        if entry.status.is_terminal() {
            return ProcessOutcome::AlreadyResolved;
        }
        if entry.status.is_paused() {
            return ProcessOutcome::Paused;
        }
    }

    let contact = extract_contact(&record.payload, config.channel);

    if config.dry_run {
        if config.dry_run_advance {
            contact_state.insert(
                record.lead_id.clone(),
                ContactStateEntry {
                    status: ContactStatus::Skipped,
                    updated_at: Utc::now(),
                    detail: Some("dry_run".to_string()),
                },
            );
            return ProcessOutcome::Skipped;
        }
        // Held, but not persisted: the offset stays put and this exact
        // line is re-evaluated fresh next cycle, e.g. once dry-run clears.
        return ProcessOutcome::Held;
    }

    if config.channel.requires_contact() && contact.is_none() {
        contact_state.insert(
            record.lead_id.clone(),
            ContactStateEntry {
                status: ContactStatus::Blocked,
                updated_at: Utc::now(),
                detail: Some("missing_contact".to_string()),
            },
        );
        return ProcessOutcome::Blocked;
    }

    let Some(transport) = resolve_transport(config, &record.slot_id) else {
        contact_state.insert(
            record.lead_id.clone(),
            ContactStateEntry {
                status: ContactStatus::Blocked,
                updated_at: Utc::now(),
                detail: Some("missing_webhook".to_string()),
            },
        );
        return ProcessOutcome::Blocked;
    };

    if !rate_allows(rate_windows, &record.slot_id, config.rate_per_minute) {
        // Held, not persisted: the sliding window may have room again by
        // the next poll, so this line is retried fresh rather than stuck.
        return ProcessOutcome::Held;
    }

    let message = composer.compose(&record.payload);
    let contact = contact.unwrap_or_default();

    match transport.deliver(&contact, &message).await {
        Ok(()) => {
            contact_state.insert(
                record.lead_id.clone(),
                ContactStateEntry {
                    status: ContactStatus::Sent,
                    updated_at: Utc::now(),
                    detail: None,
                },
            );
            rate_record_send(rate_windows, &record.slot_id);
            ProcessOutcome::Sent
        }
        Err(detail) => {
            contact_state.insert(
                record.lead_id.clone(),
                ContactStateEntry {
                    status: ContactStatus::Failed,
                    updated_at: Utc::now(),
                    detail: Some(detail),
                },
            );
            ProcessOutcome::Failed
        }
    }
}

fn journal_outcome(config: &DispatcherConfig, record: &QueueRecord, outcome: ProcessOutcome) {
    let outcome_text = match outcome {
        ProcessOutcome::Sent => "sent",
        ProcessOutcome::Skipped => "skipped",
        ProcessOutcome::Blocked => "blocked",
        ProcessOutcome::Held => "held",
        ProcessOutcome::Failed => "failed",
        ProcessOutcome::Invalid => "invalid",
        ProcessOutcome::AlreadyResolved | ProcessOutcome::Paused => return,
    };
    let proof = serde_json::json!({
        "slot_id": record.slot_id,
        "lead_id": record.lead_id,
        "channel": config.channel.as_str(),
        "outcome": outcome_text,
        "at": Utc::now(),
    });
    if let Err(err) = append_jsonl(&config.proofs_path(), &proof) {
        warn!(%err, "failed to append proofs journal");
    }
    if outcome == ProcessOutcome::Sent {
        if let Err(err) = append_jsonl(&config.sent_path(), &proof) {
            warn!(%err, "failed to append sent journal");
        }
    }
}

/// Journals a malformed queue line as an `invalid` proof. There is no
/// parsed `QueueRecord` to carry through `journal_outcome`, so this writes
/// the proof directly.
fn journal_invalid(config: &DispatcherConfig, raw_line: &str, index: u64) {
    let proof = serde_json::json!({
        "channel": config.channel.as_str(),
        "line_index": index,
        "outcome": "invalid",
        "reason": "queue_parse_error",
        "raw": raw_line,
        "at": Utc::now(),
    });
    if let Err(err) = append_jsonl(&config.proofs_path(), &proof) {
        warn!(%err, "failed to append proofs journal for invalid line");
    }
}

/// One poll cycle: consume new queue lines from the channel's offset. The
/// offset advances only past lines resolved to a terminal decision (sent,
/// skipped, blocked, invalid) or an already-resolved re-encounter; a held
/// or paused line stops the pass in place so it is retried next cycle.
/// Failed leads are terminal — there is no retry mechanism for them.
pub async fn process_queue(config: &DispatcherConfig, composer: &dyn MessageComposer) {
    let mut contact_state: HashMap<String, ContactStateEntry> =
        read_json_tolerant(&config.contact_state_path()).unwrap_or_default();
    let mut rate_windows: HashMap<String, RateWindow> =
        read_json_tolerant(&config.rate_path()).unwrap_or_default();

    let offset = read_offset(&config.offset_path());
    let queue_path = config.queue_path();
    let lines = match read_lines_from_offset(&queue_path, offset) {
        Ok(lines) => lines,
        Err(_) => Vec::new(),
    };

    let mut new_offset = offset;
    for (idx, line) in &lines {
        if line.trim().is_empty() {
            new_offset = idx + 1;
            continue;
        }

        let record = match serde_json::from_str::<QueueRecord>(line) {
            Ok(record) => record,
            Err(err) => {
                warn!(channel = config.channel.as_str(), %err, "malformed queue line");
                journal_invalid(config, line, *idx);
                new_offset = idx + 1;
                continue;
            }
        };

        let outcome =
            process_record(config, composer, &record, &mut contact_state, &mut rate_windows).await;
        match outcome {
            ProcessOutcome::Paused => break,
            ProcessOutcome::Held => {
                journal_outcome(config, &record, outcome);
                break;
            }
            ProcessOutcome::AlreadyResolved => {
                new_offset = idx + 1;
            }
            ProcessOutcome::Sent
            | ProcessOutcome::Skipped
            | ProcessOutcome::Blocked
            | ProcessOutcome::Failed
            | ProcessOutcome::Invalid => {
                journal_outcome(config, &record, outcome);
                new_offset = idx + 1;
            }
        }
    }

    if let Err(err) = write_offset(&config.offset_path(), new_offset) {
        warn!(%err, "failed to persist offset");
    }
    if let Err(err) = write_json_atomic(&config.contact_state_path(), &contact_state) {
        warn!(%err, "failed to persist contact state");
    }
    if let Err(err) = write_json_atomic(&config.rate_path(), &rate_windows) {
        warn!(%err, "failed to persist rate windows");
    }
}

pub async fn run_dispatcher(config: DispatcherConfig, composer: impl MessageComposer) {
    std::fs::create_dir_all(&config.runtime_root).ok();
    info!(channel = config.channel.as_str(), "dispatcher starting");
    let mut interval = tokio::time::interval(Duration::from_secs(config.poll_seconds));
    loop {
        interval.tick().await;
        process_queue(&config, &composer).await;
    }
}

pub fn ensure_channel_files(config: &DispatcherConfig) -> std::io::Result<()> {
    crate::atomic_io::touch(&config.queue_path())?;
    crate::atomic_io::touch(&config.sent_path())?;
    crate::atomic_io::touch(&config.proofs_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(root: PathBuf) -> DispatcherConfig {
        DispatcherConfig {
            channel: Channel::Email,
            runtime_root: root,
            poll_seconds: 5,
            rate_per_minute: 2,
            dry_run: false,
            dry_run_advance: false,
            webhook_url: None,
            webhook_secret: None,
            waha_base_url: None,
            waha_session: None,
            waha_session_prefix: "slot-".to_string(),
            waha_token: None,
            waha_auth_header: "Authorization".to_string(),
            waha_auth_prefix: "Bearer ".to_string(),
        }
    }

    fn record(lead_id: &str, slot_id: &str) -> QueueRecord {
        QueueRecord {
            kind: "verified".to_string(),
            slot_id: slot_id.to_string(),
            lead_id: lead_id.to_string(),
            observed_at: None,
            received_at: Utc::now(),
            payload: serde_json::json!({"title": "Valve order", "email": "buyer@example.com"}),
            channel: Some("email".to_string()),
        }
    }

    #[tokio::test]
    async fn dry_run_without_advance_holds_without_persisting_state() {
        let mut cfg = config(tempdir().unwrap().path().to_path_buf());
        cfg.dry_run = true;
        cfg.dry_run_advance = false;
        let mut state = HashMap::new();
        let mut rates = HashMap::new();
        let outcome = process_record(&cfg, &TemplateComposer, &record("l1", "s1"), &mut state, &mut rates).await;
        assert_eq!(outcome, ProcessOutcome::Held);
        assert!(state.get("l1").is_none());
    }

    #[tokio::test]
    async fn dry_run_with_advance_marks_skipped() {
        let mut cfg = config(tempdir().unwrap().path().to_path_buf());
        cfg.dry_run = true;
        cfg.dry_run_advance = true;
        let mut state = HashMap::new();
        let mut rates = HashMap::new();
        let outcome = process_record(&cfg, &TemplateComposer, &record("l1", "s1"), &mut state, &mut rates).await;
        assert_eq!(outcome, ProcessOutcome::Skipped);
        assert_eq!(state.get("l1").unwrap().status, ContactStatus::Skipped);
    }

    #[tokio::test]
    async fn missing_contact_blocks() {
        let cfg = config(tempdir().unwrap().path().to_path_buf());
        let mut state = HashMap::new();
        let mut rates = HashMap::new();
        let mut rec = record("l2", "s1");
        rec.payload = serde_json::json!({"title": "no contact"});
        let outcome = process_record(&cfg, &TemplateComposer, &rec, &mut state, &mut rates).await;
        assert_eq!(outcome, ProcessOutcome::Blocked);
        assert_eq!(state.get("l2").unwrap().detail.as_deref(), Some("missing_contact"));
    }

    #[tokio::test]
    async fn missing_webhook_blocks_without_network() {
        let cfg = config(tempdir().unwrap().path().to_path_buf());
        let mut state = HashMap::new();
        let mut rates = HashMap::new();
        let outcome = process_record(&cfg, &TemplateComposer, &record("l3", "s1"), &mut state, &mut rates).await;
        assert_eq!(outcome, ProcessOutcome::Blocked);
        assert_eq!(state.get("l3").unwrap().detail.as_deref(), Some("missing_webhook"));
    }

    #[test]
    fn rate_allows_resets_after_window() {
        let mut rates = HashMap::new();
        for _ in 0..2 {
            assert!(rate_allows(&mut rates, "s1", 2));
            rate_record_send(&mut rates, "s1");
        }
        assert!(!rate_allows(&mut rates, "s1", 2));
        rates.get_mut("s1").unwrap().window_start_epoch_secs -= RATE_WINDOW_SECONDS + 1.0;
        assert!(rate_allows(&mut rates, "s1", 2));
    }

    #[tokio::test]
    async fn terminal_state_advances_silently() {
        let cfg = config(tempdir().unwrap().path().to_path_buf());
        let mut state = HashMap::new();
        state.insert(
            "l1".to_string(),
            ContactStateEntry {
                status: ContactStatus::Sent,
                updated_at: Utc::now(),
                detail: None,
            },
        );
        let mut rates = HashMap::new();
        let outcome = process_record(&cfg, &TemplateComposer, &record("l1", "s1"), &mut state, &mut rates).await;
        assert_eq!(outcome, ProcessOutcome::AlreadyResolved);
    }

    #[tokio::test]
    async fn paused_state_stops_without_reprocessing() {
        let cfg = config(tempdir().unwrap().path().to_path_buf());
        let mut state = HashMap::new();
        state.insert(
            "l1".to_string(),
            ContactStateEntry {
                status: ContactStatus::Blocked,
                updated_at: Utc::now(),
                detail: Some("missing_webhook".to_string()),
            },
        );
        let mut rates = HashMap::new();
        let outcome = process_record(&cfg, &TemplateComposer, &record("l1", "s1"), &mut state, &mut rates).await;
        assert_eq!(outcome, ProcessOutcome::Paused);
    }

    #[test]
    fn waha_chat_id_normalizes_digits() {
        assert_eq!(normalize_waha_chat_id("+91 98765 43210", "@c.us"), "+919876543210@c.us");
        assert_eq!(normalize_waha_chat_id("1234@g.us", "@c.us"), "1234@g.us");
    }

    #[test]
    fn ensure_channel_files_creates_queue_and_journals() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path().to_path_buf());
        ensure_channel_files(&cfg).unwrap();
        assert!(cfg.queue_path().exists());
        assert!(cfg.sent_path().exists());
        assert!(cfg.proofs_path().exists());
    }
}

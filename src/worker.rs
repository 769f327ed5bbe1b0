//! Worker loop: one process per slot — scrape, filter, append,
//! verify, heartbeat.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::atomic_io::{append_jsonl, touch, write_json_atomic};
use crate::lead_filter::filter_lead;
use crate::model::{
    truncate_text, CycleCounters, FilterOutcome, LeadRecord, RawLead, SlotConfig, SlotPhase,
    SlotState, VerifiedEvent,
};
use crate::slot_fs::slot_paths;

/// Produces raw candidate leads for a cycle. The real implementation
/// drives browser automation; [`StubSource`] stands in for local/dev
/// operation per the `worker_mode = "stub"` config field.
pub trait LeadSource: Send + Sync {
    /// Returns `Ok(leads)` or `Err(())` to signal the simulated
    /// "landing page isn't the authenticated host" condition that drives
    /// the worker into `LOGIN_REQUIRED`.
    fn scrape(&mut self, max_leads: u32) -> Result<Vec<RawLead>, ()>;
}

/// A `LeadSource` that yields nothing — used when no real browser
/// automation is wired in. Exercises the full cycle machinery without
/// ever producing a lead.
#[derive(Default)]
pub struct StubSource;

impl LeadSource for StubSource {
    fn scrape(&mut self, _max_leads: u32) -> Result<Vec<RawLead>, ()> {
        Ok(Vec::new())
    }
}

pub struct WorkerArgs {
    pub slots_root: PathBuf,
    pub slot_id: String,
    pub run_id: String,
    pub api_base: String,
    pub worker_secret: String,
    pub heartbeat_interval: Duration,
}

/// Shared flag a signal handler flips; polled at each suspension point.
pub fn shutdown_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

fn read_config(config_path: &std::path::Path) -> SlotConfig {
    std::fs::read_to_string(config_path)
        .ok()
        .and_then(|text| serde_yaml::from_str(&text).ok())
        .unwrap_or_default()
}

fn content_signature(lead: &RawLead) -> String {
    format!(
        "{}|{}|{}",
        lead.title,
        lead.country.as_deref().unwrap_or(""),
        lead.time_text.as_deref().unwrap_or("")
    )
}

async fn post_verified_event(
    client: &reqwest::Client,
    api_base: &str,
    worker_secret: &str,
    event: &VerifiedEvent,
) {
    if api_base.is_empty() {
        return;
    }
    let url = format!("{}/events/verified", api_base.trim_end_matches('/'));
    let result = client
        .post(url)
        .header("X-Engyne-Worker-Secret", worker_secret)
        .json(event)
        .timeout(Duration::from_secs(5))
        .send()
        .await;
    // Failures are swallowed: the leads log is the source of truth, and
    // retry is the sink's own idempotent-consumer responsibility. This is
    // a documented limitation, not an oversight.
    match result {
        Ok(resp) if resp.status().is_success() => {}
        Ok(resp) => debug!(status = %resp.status(), "verified event sink rejected event"),
        Err(err) => debug!(%err, "verified event sink unreachable"),
    }
}

/// Run the worker loop until `shutdown` is set. `source` drives the
/// scrape step; callers inject a real browser-backed source or
/// [`StubSource`].
pub async fn run_worker(
    args: WorkerArgs,
    mut source: impl LeadSource,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let paths = slot_paths(&args.slots_root, &args.slot_id)?;
    std::fs::create_dir_all(&paths.root)?;
    touch(&paths.leads_path)?;

    let client = reqwest::Client::new();
    let pid = std::process::id();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_signatures: HashSet<String> = HashSet::new();

    write_heartbeat(&paths, &args, pid, SlotPhase::Boot, CycleCounters::default(), None)?;
    write_heartbeat(&paths, &args, pid, SlotPhase::Init, CycleCounters::default(), None)?;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!(slot_id = %args.slot_id, "stopping");
            write_heartbeat(&paths, &args, pid, SlotPhase::Stopping, CycleCounters::default(), None)?;
            return Ok(());
        }

        let config = read_config(&paths.config_path);
        let max_leads = config.max_leads_per_cycle.unwrap_or(20);

        let raw_leads = match source.scrape(max_leads) {
            Ok(leads) => leads,
            Err(()) => {
                write_heartbeat(
                    &paths,
                    &args,
                    pid,
                    SlotPhase::LoginRequired,
                    CycleCounters::default(),
                    None,
                )?;
                tokio::time::sleep(args.heartbeat_interval).await;
                continue;
            }
        };

        match run_cycle(&paths, &args, &client, &config, raw_leads, &mut seen_ids, &mut seen_signatures).await {
            Ok(counters) => {
                if let Err(err) =
                    write_heartbeat(&paths, &args, pid, SlotPhase::ParseLeads, counters, None)
                {
                    error!(%err, "failed to write heartbeat");
                }
            }
            Err(err) => {
                error!(slot_id = %args.slot_id, error = %err, "worker cycle failed");
                if let Err(herr) =
                    write_error_heartbeat(&paths, &args, pid, CycleCounters::default(), err.to_string())
                {
                    error!(%herr, "failed to write error heartbeat");
                }
            }
        }

        let cooldown = Duration::from_secs_f64(
            config
                .cooldown_seconds
                .max(args.heartbeat_interval.as_secs_f64()),
        );
        tokio::time::sleep(cooldown).await;
    }
}

/// Filters, journals, and verifies one cycle's raw leads. Returns the
/// cycle's counters, or an error if any lead could not be journaled — the
/// caller transitions to `ERROR` and continues rather than propagating.
async fn run_cycle(
    paths: &crate::model::SlotPaths,
    args: &WorkerArgs,
    client: &reqwest::Client,
    config: &crate::model::SlotConfig,
    raw_leads: Vec<RawLead>,
    seen_ids: &mut HashSet<String>,
    seen_signatures: &mut HashSet<String>,
) -> anyhow::Result<CycleCounters> {
    let mut counters = CycleCounters::default();

    for raw in raw_leads {
        counters.leads_found += 1;
        if !seen_ids.insert(raw.lead_id.clone()) {
            continue;
        }
        let signature = content_signature(&raw);
        if !seen_signatures.insert(signature) {
            continue;
        }

        let result = filter_lead(&raw, config);
        let kept = matches!(result.outcome, FilterOutcome::Keep);
        let mut verified = false;
        let mut verification_source = None;
        let mut clicked = false;

        if kept {
            counters.leads_kept += 1;
            if config.auto_buy && !config.dry_run {
                clicked = true;
                counters.clicks_sent += 1;
                verified = true;
                verification_source = Some("inline".to_string());
                counters.verified += 1;
            }
        }

        let reject_reason = match &result.outcome {
            FilterOutcome::Reject { reason } => Some(reason.clone()),
            FilterOutcome::Keep => None,
        };

        let record = LeadRecord {
            slot_id: args.slot_id.clone(),
            run_id: args.run_id.clone(),
            lead_id: raw.lead_id.clone(),
            observed_at: Utc::now(),
            title: raw.title.clone(),
            country: raw.country.clone(),
            time_text: raw.time_text.clone(),
            age_hours: result.age_hours,
            member_months: result.member_months,
            member_since_text: raw.member_since_text.clone(),
            category_text: raw.category_text.clone(),
            availability: raw.availability.clone(),
            email: raw.email.clone(),
            phone: raw.phone.clone(),
            contact: raw.contact.clone(),
            structured: result.structured,
            quality_level: config.quality_level,
            policy: format!("q{}", config.quality_level.clamp(0, 100)),
            auto_buy: config.auto_buy,
            dry_run: config.dry_run,
            clicked,
            verified,
            verification_source,
            reject_reason,
            text: truncate_text(raw.body.as_deref().unwrap_or("")),
        };
        append_jsonl(&paths.leads_path, &record)?;

        if verified {
            let event = VerifiedEvent {
                slot_id: args.slot_id.clone(),
                lead_id: raw.lead_id.clone(),
                observed_at: Some(record.observed_at),
                payload: serde_json::to_value(&record).unwrap_or(serde_json::Value::Null),
            };
            post_verified_event(client, &args.api_base, &args.worker_secret, &event).await;
        }
    }

    Ok(counters)
}

fn write_heartbeat(
    paths: &crate::model::SlotPaths,
    args: &WorkerArgs,
    pid: u32,
    phase: SlotPhase,
    counters: CycleCounters,
    last_error: Option<String>,
) -> anyhow::Result<()> {
    let state = SlotState {
        slot_id: args.slot_id.clone(),
        phase,
        run_id: args.run_id.clone(),
        pid,
        heartbeat_ts: Utc::now(),
        counters,
        last_error,
    };
    write_json_atomic(&paths.state_path, &state)?;
    write_json_atomic(&paths.status_path, &state)?;
    std::fs::write(&paths.pid_path, pid.to_string())?;
    Ok(())
}

/// Transition into `ERROR`, recording `last_error`, without stopping the
/// loop — the supervisor restarts the process if heartbeats halt.
pub fn write_error_heartbeat(
    paths: &crate::model::SlotPaths,
    args: &WorkerArgs,
    pid: u32,
    counters: CycleCounters,
    message: String,
) -> anyhow::Result<()> {
    warn!(slot_id = %args.slot_id, error = %message, "worker entering ERROR phase");
    write_heartbeat(paths, args, pid, SlotPhase::Error, counters, Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct OneLeadSource {
        yielded: bool,
    }

    impl LeadSource for OneLeadSource {
        fn scrape(&mut self, _max_leads: u32) -> Result<Vec<RawLead>, ()> {
            if self.yielded {
                return Ok(Vec::new());
            }
            self.yielded = true;
            Ok(vec![RawLead {
                lead_id: "l1".into(),
                title: "Industrial valve".into(),
                country: Some("India".into()),
                time_text: Some("1 hour ago".into()),
                member_since_text: Some("member since 36 months".into()),
                ..Default::default()
            }])
        }
    }

    #[tokio::test]
    async fn one_cycle_appends_lead_and_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("s1")).unwrap();
        std::fs::write(
            dir.path().join("s1").join("slot_config.yml"),
            "cooldown_seconds: 0.01\nquality_level: 90\nallowed_countries: [india]\n",
        )
        .unwrap();
        let args = WorkerArgs {
            slots_root: dir.path().to_path_buf(),
            slot_id: "s1".into(),
            run_id: "r1".into(),
            api_base: String::new(),
            worker_secret: String::new(),
            heartbeat_interval: Duration::from_millis(10),
        };
        let shutdown = shutdown_flag();
        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown_clone.store(true, Ordering::SeqCst);
        });
        run_worker(args, OneLeadSource { yielded: false }, shutdown)
            .await
            .unwrap();

        let leads_path = dir.path().join("s1").join("leads.jsonl");
        let text = std::fs::read_to_string(leads_path).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("\"lead_id\":\"l1\""));
    }
}

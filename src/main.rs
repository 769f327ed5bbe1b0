//! # Main — CLI Entry Point
//!
//! Routes CLI subcommands to the supervisor, a worker, a channel
//! dispatcher, or the verified-event sink. Handles shared concerns:
//! `.env` loading and structured logging setup.

use anyhow::Result;
use clap::Parser;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use engyne::cli::{self, Cli, Commands};

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_target(false).init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let parsed = Cli::parse();

    match parsed.command {
        Commands::Supervisor {
            slots_root,
            profile_root,
            api_base,
            worker_secret,
            heartbeat_interval_seconds,
            heartbeat_ttl_seconds,
            scan_interval_seconds,
            alerts_min_seconds,
            alert_webhook_url,
        } => cli::run_supervisor(
            slots_root,
            profile_root,
            api_base,
            worker_secret,
            heartbeat_interval_seconds,
            heartbeat_ttl_seconds,
            scan_interval_seconds,
            alerts_min_seconds,
            alert_webhook_url,
        ),
        Commands::Worker {
            slots_root,
            slot_id,
            run_id,
            api_base,
            worker_secret,
            profile_path,
            heartbeat_interval_seconds,
        } => cli::run_worker_cmd(
            slots_root,
            slot_id,
            run_id,
            api_base,
            worker_secret,
            profile_path,
            heartbeat_interval_seconds,
        ),
        Commands::Dispatcher {
            channel,
            runtime_root,
            poll_seconds,
            rate_per_minute,
            dry_run,
            dry_run_advance,
            webhook_url,
            webhook_secret,
            waha_base_url,
            waha_session,
            waha_session_prefix,
            waha_token,
        } => cli::run_dispatcher_cmd(
            channel,
            runtime_root,
            poll_seconds,
            rate_per_minute,
            dry_run,
            dry_run_advance,
            webhook_url,
            webhook_secret,
            waha_base_url,
            waha_session,
            waha_session_prefix,
            waha_token,
        ),
        Commands::Sink {
            runtime_root,
            worker_secret,
            outbound_webhook_url,
            port,
        } => cli::run_sink_cmd(runtime_root, worker_secret, outbound_webhook_url, port),
    }
}

//! CLI subcommand definitions and their run functions, covering the four
//! process roles this binary can run as.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::channel::Channel;
use crate::dispatcher::{run_dispatcher, DispatcherConfig, TemplateComposer};
use crate::metrics::Metrics;
use crate::sink::{router, SinkState};
use crate::supervisor::{Supervisor, SupervisorConfig};
use crate::worker::{run_worker, shutdown_flag, StubSource, WorkerArgs};

#[derive(Parser)]
#[command(name = "engyne", about = "Per-node slot supervisor and lead dispatch pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the slot supervisor: scan, spawn, restart, enforce heartbeats.
    Supervisor {
        #[arg(long, env = "ENGYNE_SLOTS_ROOT")]
        slots_root: PathBuf,
        #[arg(long, env = "ENGYNE_PROFILE_ROOT", default_value = "./profiles")]
        profile_root: PathBuf,
        #[arg(long, env = "ENGYNE_API_BASE", default_value = "")]
        api_base: String,
        #[arg(long, env = "ENGYNE_WORKER_SECRET", default_value = "")]
        worker_secret: String,
        #[arg(long, env = "HEARTBEAT_INTERVAL_SECONDS", default_value_t = 5.0)]
        heartbeat_interval_seconds: f64,
        #[arg(long, env = "HEARTBEAT_TTL_SECONDS", default_value_t = 30)]
        heartbeat_ttl_seconds: u64,
        #[arg(long, env = "SCAN_INTERVAL_SECONDS", default_value_t = 3)]
        scan_interval_seconds: u64,
        #[arg(long, env = "ALERTS_MIN_SECONDS", default_value_t = 300)]
        alerts_min_seconds: i64,
        #[arg(long, env = "ALERTS_SLACK_WEBHOOK_URL")]
        alert_webhook_url: Option<String>,
    },

    /// Run one worker process for a single slot. Positional, matching the
    /// exact contract the supervisor spawns with.
    Worker {
        slots_root: PathBuf,
        slot_id: String,
        run_id: String,
        api_base: String,
        worker_secret: String,
        profile_path: PathBuf,
        heartbeat_interval_seconds: f64,
    },

    /// Run one channel dispatcher process.
    Dispatcher {
        channel: String,
        #[arg(long, env = "ENGYNE_RUNTIME_ROOT")]
        runtime_root: PathBuf,
        #[arg(long, env = "DISPATCHER_POLL_SECONDS", default_value_t = 5)]
        poll_seconds: u64,
        #[arg(long, env = "DISPATCHER_RATE_PER_MINUTE", default_value_t = 20)]
        rate_per_minute: u32,
        #[arg(long, env = "DISPATCHER_DRY_RUN")]
        dry_run: bool,
        #[arg(long, env = "DISPATCHER_DRY_RUN_ADVANCE")]
        dry_run_advance: bool,
        #[arg(long, env = "CHANNEL_WEBHOOK_URL")]
        webhook_url: Option<String>,
        #[arg(long, env = "CHANNEL_WEBHOOK_SECRET")]
        webhook_secret: Option<String>,
        #[arg(long, env = "WAHA_BASE_URL")]
        waha_base_url: Option<String>,
        #[arg(long, env = "WAHA_SESSION")]
        waha_session: Option<String>,
        #[arg(long, env = "WAHA_SESSION_PREFIX", default_value = "slot-")]
        waha_session_prefix: String,
        #[arg(long, env = "WAHA_TOKEN")]
        waha_token: Option<String>,
    },

    /// Run the verified-event HTTP sink.
    Sink {
        #[arg(long, env = "ENGYNE_RUNTIME_ROOT")]
        runtime_root: PathBuf,
        #[arg(long, env = "ENGYNE_WORKER_SECRET")]
        worker_secret: String,
        #[arg(long, env = "ENGYNE_SINK_WEBHOOK_URL")]
        outbound_webhook_url: Option<String>,
        #[arg(long, env = "ENGYNE_SINK_PORT", default_value_t = 8088)]
        port: u16,
    },
}

pub fn run_supervisor(
    slots_root: PathBuf,
    profile_root: PathBuf,
    api_base: String,
    worker_secret: String,
    heartbeat_interval_seconds: f64,
    heartbeat_ttl_seconds: u64,
    scan_interval_seconds: u64,
    alerts_min_seconds: i64,
    alert_webhook_url: Option<String>,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let worker_exe = std::env::current_exe()?;
        let supervisor = Supervisor::new(SupervisorConfig {
            slots_root,
            worker_exe,
            api_base,
            worker_secret,
            heartbeat_interval_seconds,
            heartbeat_ttl_seconds,
            scan_interval_seconds,
            alerts_min_seconds,
            alert_webhook_url,
            profile_root,
        });
        let shutdown = tokio::signal::ctrl_c();
        tokio::select! {
            _ = supervisor.run() => {}
            _ = shutdown => {
                tracing::info!("supervisor received shutdown signal");
                supervisor.stop_all().await;
            }
        }
        Ok(())
    })
}

pub fn run_worker_cmd(
    slots_root: PathBuf,
    slot_id: String,
    run_id: String,
    api_base: String,
    worker_secret: String,
    _profile_path: PathBuf,
    heartbeat_interval_seconds: f64,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let args = WorkerArgs {
            slots_root,
            slot_id,
            run_id,
            api_base,
            worker_secret,
            heartbeat_interval: Duration::from_secs_f64(heartbeat_interval_seconds),
        };
        let shutdown = shutdown_flag();
        let signal_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            signal_shutdown.store(true, Ordering::SeqCst);
        });
        run_worker(args, StubSource, shutdown).await
    })
}

pub fn run_dispatcher_cmd(
    channel: String,
    runtime_root: PathBuf,
    poll_seconds: u64,
    rate_per_minute: u32,
    dry_run: bool,
    dry_run_advance: bool,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
    waha_base_url: Option<String>,
    waha_session: Option<String>,
    waha_session_prefix: String,
    waha_token: Option<String>,
) -> Result<()> {
    let channel = Channel::parse(&channel)
        .ok_or_else(|| anyhow::anyhow!("unknown channel '{channel}'"))?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let config = DispatcherConfig {
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
            waha_auth_header: "Authorization".to_string(),
            waha_auth_prefix: "Bearer ".to_string(),
        };
        crate::dispatcher::ensure_channel_files(&config)?;
        run_dispatcher(config, TemplateComposer).await;
        Ok(())
    })
}

pub fn run_sink_cmd(
    runtime_root: PathBuf,
    worker_secret: String,
    outbound_webhook_url: Option<String>,
    port: u16,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        std::fs::create_dir_all(&runtime_root)?;
        let state = Arc::new(SinkState {
            runtime_root,
            worker_secret,
            outbound_webhook_url,
            http: reqwest::Client::new(),
            metrics: Metrics::new(),
        });
        let app = router(state);
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "verified event sink listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        Ok(())
    })
}

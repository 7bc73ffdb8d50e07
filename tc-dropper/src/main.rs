//! tc-dropper: adaptive probabilistic packet dropper.
//!
//! Attaches a TC eBPF classifier to the ingress and egress of one interface.
//! The classifier drops each packet with a probability that this process
//! controls, either fixed or scaled with the observed packet rate:
//!   - fixed:   constant probability, written once at startup
//!   - dynamic: probability interpolated between --min-rate and --max-rate
//!
//! The classifiers stay attached for as long as this process runs and are
//! detached on SIGINT, SIGTERM, SIGHUP or SIGQUIT.

mod config;
mod controller;
mod metrics;
mod rate;
mod session;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::Mutex;
use tracing::{error, info};

use config::{Config, ConfigArgs};
use controller::{ControllerState, Lifecycle, ModeController, UPDATE_INTERVAL};
use metrics::MetricsState;
use session::{EbpfHooks, Session};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "tc-dropper",
    about = "Adaptive probabilistic packet dropper built on a TC eBPF classifier",
    version
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Path to the compiled eBPF program ELF binary.
    #[arg(long, default_value = "tc-dropper-ebpf")]
    ebpf_program: PathBuf,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tc-dropper");

    let config = Config::resolve(&cli.config).context("loading configuration")?;
    info!(
        interface = %config.interface,
        mode = config.mode.name(),
        "configuration loaded"
    );

    // Installed before anything is attached so a signal that arrives during
    // setup is queued instead of killing the process.
    let mut signals = ShutdownSignals::install()?;
    let mut lifecycle = Lifecycle::new();

    // --- Load eBPF object and attach ---
    let ifindex = session::interface_index(&config.interface).context("resolving interface")?;

    let ebpf_bytes = std::fs::read(&cli.ebpf_program).with_context(|| {
        format!(
            "reading eBPF program from {}. Build it with: cargo xtask build-ebpf",
            cli.ebpf_program.display()
        )
    })?;

    let (hooks, maps) = EbpfHooks::load(&ebpf_bytes).context("loading eBPF program")?;

    let mut session = Session::attach(hooks, &config.interface)
        .with_context(|| format!("attaching TC classifiers to {}", config.interface))?;
    info!(interface = session.interface(), ifindex, "classifiers attached");
    lifecycle.transition(ControllerState::Attached);

    let maps = Arc::new(Mutex::new(maps));

    // --- Start metrics server ---
    let metrics_handle = if config.metrics.enabled {
        let state = MetricsState {
            maps: maps.clone(),
            interface: Arc::from(config.interface.as_str()),
            mode: config.mode.name(),
        };

        let metrics_config = config.metrics;
        Some(tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(&metrics_config, state).await {
                error!(error = %e, "metrics server error");
            }
        }))
    } else {
        None
    };

    // --- Run the mode controller until a signal arrives ---
    let controller = ModeController::new(config.mode, maps, UPDATE_INTERVAL);
    let result =
        controller::run_until_shutdown(&mut session, &controller, &mut lifecycle, signals.recv())
            .await;

    if let Some(handle) = metrics_handle {
        handle.abort();
    }
    result?;

    info!(state = %lifecycle.state(), "tc-dropper stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Signal Handling
// ---------------------------------------------------------------------------

struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
    quit: Signal,
}

impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("installing SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("installing SIGTERM handler")?,
            hangup: signal(SignalKind::hangup()).context("installing SIGHUP handler")?,
            quit: signal(SignalKind::quit()).context("installing SIGQUIT handler")?,
        })
    }

    /// Wait for the first termination signal and return its name.
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.hangup.recv() => "SIGHUP",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}

//! Mode controller: decides what goes into `drop_probability`.
//!
//! Fixed mode writes the configured value once and then idles; the process
//! staying alive is what keeps the classifiers attached. Dynamic mode samples
//! the packet counter every [`UPDATE_INTERVAL`] and maps the measured rate to
//! a probability.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{DropMode, DynamicParams};
use crate::rate::RateEstimator;
use crate::session::{Session, TcHooks};
use crate::state::StateStore;

/// Sampling interval for dynamic mode.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Init,
    Attached,
    Running { dynamic: bool },
    ShuttingDown,
    Terminated,
}

impl ControllerState {
    /// Whether `next` may follow `self`. A shutdown may start from any live
    /// state; everything else moves strictly forward.
    pub fn can_transition_to(self, next: ControllerState) -> bool {
        use ControllerState::*;
        matches!(
            (self, next),
            (Init, Attached)
                | (Attached, Running { .. })
                | (Init | Attached | Running { .. }, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Init => f.write_str("init"),
            ControllerState::Attached => f.write_str("attached"),
            ControllerState::Running { dynamic: false } => f.write_str("running(fixed)"),
            ControllerState::Running { dynamic: true } => f.write_str("running(dynamic)"),
            ControllerState::ShuttingDown => f.write_str("shutting_down"),
            ControllerState::Terminated => f.write_str("terminated"),
        }
    }
}

/// Tracks and logs the process lifecycle.
#[derive(Debug)]
pub struct Lifecycle {
    state: ControllerState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: ControllerState::Init,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn transition(&mut self, next: ControllerState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        info!(from = %self.state, to = %next, "controller state");
        self.state = next;
    }
}

// ---------------------------------------------------------------------------
// Mode Controller
// ---------------------------------------------------------------------------

pub struct ModeController<S> {
    mode: DropMode,
    store: Arc<Mutex<S>>,
    interval: Duration,
}

impl<S: StateStore> ModeController<S> {
    pub fn new(mode: DropMode, store: Arc<Mutex<S>>, interval: Duration) -> Self {
        Self {
            mode,
            store,
            interval,
        }
    }

    pub fn running_state(&self) -> ControllerState {
        ControllerState::Running {
            dynamic: matches!(self.mode, DropMode::Dynamic(_)),
        }
    }

    /// One-time setup. In fixed mode this writes the probability; a failure
    /// here is fatal.
    pub async fn start(&self) -> Result<()> {
        if let DropMode::Fixed { probability } = self.mode {
            self.store
                .lock()
                .await
                .set_probability(probability)
                .context("setting fixed drop probability")?;
            info!(probability, "fixed drop probability set");
        }
        Ok(())
    }

    /// Run until cancelled. Never returns on its own.
    pub async fn run(&self) {
        match self.mode {
            DropMode::Fixed { .. } => std::future::pending::<()>().await,
            DropMode::Dynamic(params) => self.run_dynamic(params).await,
        }
    }

    async fn run_dynamic(&self, params: DynamicParams) {
        info!(
            max_probability = params.max_probability,
            min_rate_pps = params.min_rate_pps,
            max_rate_pps = params.max_rate_pps,
            interval = ?self.interval,
            "dynamic drop probability control started"
        );

        let mut estimator = RateEstimator::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.tick(&params, &mut estimator, Instant::now()).await;
        }
    }

    /// One sampling tick. Returns the probability written, if any.
    async fn tick(
        &self,
        params: &DynamicParams,
        estimator: &mut RateEstimator,
        now: Instant,
    ) -> Option<u32> {
        let mut store = self.store.lock().await;

        let snapshot = match store.read() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to read shared state, skipping tick");
                return None;
            }
        };

        let pps = estimator.sample(snapshot.packet_count, now)?;
        let probability = params.probability_for_rate(pps);

        if let Err(e) = store.set_probability(probability) {
            warn!(error = %e, "failed to update drop probability, retrying next tick");
            return None;
        }

        debug!(
            pps = pps as u64,
            probability,
            packets = snapshot.packet_count,
            dropped = snapshot.dropped_count,
            "updated drop probability"
        );

        Some(probability)
    }
}

// ---------------------------------------------------------------------------
// Session Driver
// ---------------------------------------------------------------------------

/// Start `controller` on an attached `session`, run it until `shutdown`
/// resolves, then detach.
///
/// Walks `lifecycle` from `Attached` to `Terminated` on every path, including
/// a failed start, whose error is returned after the classifiers are gone.
pub async fn run_until_shutdown<H, S, F>(
    session: &mut Session<H>,
    controller: &ModeController<S>,
    lifecycle: &mut Lifecycle,
    shutdown: F,
) -> Result<()>
where
    H: TcHooks,
    S: StateStore,
    F: Future<Output = &'static str>,
{
    let started = controller.start().await;

    match &started {
        Ok(()) => {
            lifecycle.transition(controller.running_state());
            info!("tc-dropper is running. Press Ctrl+C to stop.");

            tokio::select! {
                _ = controller.run() => {}
                name = shutdown => info!(signal = name, "shutdown signal received, cleaning up..."),
            }
        }
        Err(e) => warn!(error = %e, "controller failed to start, cleaning up..."),
    }

    lifecycle.transition(ControllerState::ShuttingDown);
    session.detach();
    lifecycle.transition(ControllerState::Terminated);

    started
}

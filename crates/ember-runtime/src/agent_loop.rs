//! [`AgentLoop`] – the tick scheduler.
//!
//! Every tick walks the same pipeline, strictly in order:
//!
//! | Stage     | Component                                  |
//! |-----------|--------------------------------------------|
//! | Fuse      | [`Fuser::fuse`] → `DecisionContext`        |
//! | Prompt    | [`PromptBuilder::build`] → `Prompt`        |
//! | Infer     | [`InferenceGateway::infer`]                |
//! | Parse     | [`ActionParser::parse`] → `ActionCommand`s |
//! | Dispatch  | [`ActionRouter::dispatch_all`]             |
//! | Record    | [`TelemetrySink::record`]                  |
//!
//! Each tick owns a deadline (`started + tick_deadline`).  If inference
//! times out, fails, or returns after the deadline the tick is **aborted**:
//! nothing is dispatched, the record says why, and the next tick starts on
//! schedule.  A committed tick dispatches whatever survived validation, so
//! `dispatch results ≤ commands ≤ candidates` always holds.
//!
//! At most one tick is in flight.  When a tick overruns the interval the
//! missed ticks are not queued; the next one starts as soon as the slow one
//! ends.
//!
//! # Operator control
//!
//! [`ControlCommand`]s arriving on the bus (see [`AgentLoop::with_control`])
//! are applied between ticks.  While paused, or while the emergency stop is
//! engaged, ticks are recorded as `Skipped` and no model call is made.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ember_runtime::agent_loop::{AgentLoop, LoopTiming};
//! # fn parts() -> (ember_perception::Fuser, ember_runtime::InferenceGateway,
//! #     ember_kernel::ActionParser, ember_runtime::ActionRouter) { unimplemented!() }
//!
//! # async fn demo() {
//! let (fuser, gateway, parser, router) = parts();
//! let mut agent = AgentLoop::new(fuser, gateway, parser, router, LoopTiming::default());
//! let record = agent.tick().await;
//! println!("tick {} → {:?}", record.tick_id, record.outcome);
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ember_hal::PluginRegistry;
use ember_kernel::{ActionParser, HaltInterlock};
use ember_middleware::TopicReceiver;
use ember_perception::Fuser;
use ember_types::{
    AbortReason, ControlCommand, DecisionContext, EventPayload, SourceHealth, SourceSummary,
    TickOutcome, TickRecord,
};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::TimingConfig;
use crate::inference::{InferenceError, InferenceGateway};
use crate::prompt::{Prompt, PromptBuilder};
use crate::router::ActionRouter;
use crate::sink::TelemetrySink;

// ─────────────────────────────────────────────────────────────────────────────
// Timing
// ─────────────────────────────────────────────────────────────────────────────

/// The three durations the scheduler enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTiming {
    /// Period between tick starts.
    pub interval: Duration,
    /// Budget for one tick, from fusion to the last dispatch.
    pub deadline: Duration,
    /// Budget for the model call, further capped by what remains of the
    /// deadline.
    pub inference_timeout: Duration,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for LoopTiming {
    fn from(t: &TimingConfig) -> Self {
        Self {
            interval: t.tick_interval(),
            deadline: t.tick_deadline(),
            inference_timeout: t.inference_timeout(),
        }
    }
}

/// Where the loop is in its tick lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Ticking,
    Committed,
    Aborted,
}

// ─────────────────────────────────────────────────────────────────────────────
// AgentLoop
// ─────────────────────────────────────────────────────────────────────────────

/// Owns one instance of every pipeline stage and drives them tick by tick.
pub struct AgentLoop {
    fuser: Fuser,
    prompts: PromptBuilder,
    gateway: InferenceGateway,
    parser: ActionParser,
    router: ActionRouter,
    timing: LoopTiming,
    sinks: Vec<Arc<dyn TelemetrySink>>,
    control: Option<TopicReceiver>,
    halt: HaltInterlock,
    paused: bool,
    state: LoopState,
    next_tick_id: u64,
    /// Degraded flag per source as of the previous tick.
    last_health: HashMap<String, bool>,
}

impl AgentLoop {
    pub fn new(
        fuser: Fuser,
        gateway: InferenceGateway,
        parser: ActionParser,
        router: ActionRouter,
        timing: LoopTiming,
    ) -> Self {
        Self {
            fuser,
            prompts: PromptBuilder::default(),
            gateway,
            parser,
            router,
            timing,
            sinks: Vec::new(),
            control: None,
            halt: HaltInterlock::new(),
            paused: false,
            state: LoopState::Idle,
            next_tick_id: 1,
            last_health: HashMap::new(),
        }
    }

    pub fn with_prompt_builder(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    /// Add a telemetry sink.  Every tick record goes to every sink.
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Listen for [`ControlCommand`] events, typically from
    /// `bus.subscribe_to(Topic::Control)`.
    pub fn with_control(mut self, control: TopicReceiver) -> Self {
        self.control = Some(control);
        self
    }

    /// Share the emergency-stop interlock.  Pass the same handle that was
    /// registered on the parser's `SafetyVerifier` so in-flight replies are
    /// rejected the moment it engages.
    pub fn with_halt(mut self, halt: HaltInterlock) -> Self {
        self.halt = halt;
        self
    }

    pub fn timing(&self) -> LoopTiming {
        self.timing
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// The action plugins commands are dispatched to.
    pub fn registry(&self) -> &PluginRegistry {
        self.router.registry()
    }

    pub fn halt_handle(&self) -> HaltInterlock {
        self.halt.clone()
    }

    pub fn pause(&mut self) {
        if !self.paused {
            info!("agent loop paused");
        }
        self.paused = true;
    }

    pub fn resume(&mut self) {
        if self.paused {
            info!("agent loop resumed");
        }
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Engage the emergency stop.  Replies still being parsed are rejected
    /// and no further tick runs until [`release`](Self::release).
    pub fn halt(&self) {
        warn!("emergency stop engaged");
        self.halt.engage();
    }

    pub fn release(&self) {
        info!("emergency stop released");
        self.halt.release();
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_engaged()
    }

    // -------------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------------

    /// Run one tick to completion and return its record.  The record has
    /// already been handed to every telemetry sink.
    #[instrument(name = "tick", skip_all, fields(tick_id = self.next_tick_id))]
    pub async fn tick(&mut self) -> TickRecord {
        let tick_id = self.next_tick_id;
        self.next_tick_id += 1;
        self.apply_control();

        let skipped = if self.halt.is_engaged() {
            Some("emergency stop engaged")
        } else if self.paused {
            Some("paused")
        } else {
            None
        };
        if let Some(reason) = skipped {
            debug!(reason, "tick skipped");
            let record = TickRecord::new(
                tick_id,
                TickOutcome::Skipped {
                    reason: reason.to_string(),
                },
            );
            self.emit(&record);
            return record;
        }

        self.transition(LoopState::Ticking);
        let record = self.run_pipeline(tick_id).await;
        self.transition(if record.is_committed() {
            LoopState::Committed
        } else {
            LoopState::Aborted
        });
        self.emit(&record);
        self.transition(LoopState::Idle);
        record
    }

    async fn run_pipeline(&mut self, tick_id: u64) -> TickRecord {
        let started = Instant::now();
        let deadline = started + self.timing.deadline;
        let mut record = TickRecord::new(tick_id, TickOutcome::Committed);

        // ── Fuse ──────────────────────────────────────────────────────────────
        let context = self.fuser.fuse(tick_id).await;
        self.report_health_changes(&context);
        record.latencies.fuse = started.elapsed();

        // ── Prompt ────────────────────────────────────────────────────────────
        let stage = Instant::now();
        let prompt = self.prompts.build(&context);
        record.sources = summarize(&context, &prompt);
        record.prompt_chars = prompt.char_len();
        record.latencies.prompt = stage.elapsed();

        // ── Infer ─────────────────────────────────────────────────────────────
        let stage = Instant::now();
        let remaining = deadline.saturating_duration_since(stage);
        let budget = self.timing.inference_timeout.min(remaining);
        let inferred = if budget.is_zero() {
            Err(None)
        } else {
            self.gateway
                .infer(tick_id, &prompt, budget)
                .await
                .map_err(Some)
        };
        record.latencies.inference = stage.elapsed();

        let raw = match inferred {
            Ok(raw) => raw,
            Err(err) => {
                let reason = match err {
                    None => AbortReason::DeadlineExceeded,
                    Some(InferenceError::Timeout(_)) => AbortReason::InferenceTimeout,
                    Some(e) => AbortReason::InferenceFailure(e.to_string()),
                };
                warn!(?reason, "tick aborted");
                return abort(record, reason, started);
            }
        };
        record.raw_response = Some(raw.text.clone());
        if Instant::now() >= deadline {
            warn!("reply arrived after the tick deadline");
            return abort(record, AbortReason::DeadlineExceeded, started);
        }

        // ── Parse ─────────────────────────────────────────────────────────────
        let stage = Instant::now();
        let parsed = self.parser.parse(&raw, self.router.registry());
        record.candidates = parsed.candidates;
        record.commands = parsed.commands.iter().map(|c| c.summary()).collect();
        record.rejections = parsed.rejections;
        record.latencies.parse = stage.elapsed();
        for rejection in &record.rejections {
            info!(candidate = rejection.candidate_index, reason = %rejection.reason, "candidate rejected");
        }

        // ── Dispatch ──────────────────────────────────────────────────────────
        let stage = Instant::now();
        record.dispatch = self.router.dispatch_all(&parsed.commands, deadline).await;
        record.latencies.dispatch = stage.elapsed();
        record.latencies.total = started.elapsed();

        info!(
            candidates = record.candidates,
            commands = record.commands.len(),
            succeeded = record.dispatch.iter().filter(|r| r.succeeded()).count(),
            total_ms = record.latencies.total.as_millis() as u64,
            "tick committed"
        );
        record
    }

    /// Tick on the configured interval until `shutdown` flips to `true` (or
    /// its sender is dropped).  A running tick is always finished first.
    /// Returns the number of ticks run.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut interval = tokio::time::interval(self.timing.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0;
        info!(interval_ms = self.timing.interval.as_millis() as u64, "agent loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.tick().await;
                    ticks += 1;
                }
            }
        }
        info!(ticks, "agent loop stopped");
        ticks
    }

    // -------------------------------------------------------------------------
    // Private helpers
    // -------------------------------------------------------------------------

    fn apply_control(&mut self) {
        let Some(control) = self.control.as_mut() else {
            return;
        };
        let commands: Vec<ControlCommand> = control
            .drain()
            .into_iter()
            .filter_map(|event| match event.payload {
                EventPayload::Control(command) => Some(command),
                _ => None,
            })
            .collect();
        for command in commands {
            debug!(?command, "control command");
            match command {
                ControlCommand::Pause => self.pause(),
                ControlCommand::Resume => self.resume(),
                ControlCommand::EmergencyStop => self.halt(),
                ControlCommand::ReleaseStop => self.release(),
            }
        }
    }

    fn report_health_changes(&mut self, context: &DecisionContext) {
        for (id, source) in &context.snapshot {
            let degraded = source.health.is_degraded();
            let previous = self.last_health.insert(id.clone(), degraded);
            if previous.is_some_and(|p| p != degraded) || (previous.is_none() && degraded) {
                self.notify_health(id, &source.health);
            }
        }
    }

    fn notify_health(&self, source_id: &str, health: &SourceHealth) {
        match health {
            SourceHealth::Healthy => info!(source_id, "input recovered"),
            SourceHealth::Degraded { reason, .. } => warn!(source_id, reason, "input degraded"),
        }
        for sink in &self.sinks {
            sink.health_changed(source_id, health);
        }
    }

    fn emit(&self, record: &TickRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }

    fn transition(&mut self, to: LoopState) {
        debug!(from = ?self.state, ?to, "loop state");
        self.state = to;
    }
}

fn abort(mut record: TickRecord, reason: AbortReason, started: Instant) -> TickRecord {
    record.outcome = TickOutcome::Aborted { reason };
    record.latencies.total = started.elapsed();
    record
}

fn summarize(context: &DecisionContext, prompt: &Prompt) -> Vec<SourceSummary> {
    context
        .snapshot
        .iter()
        .map(|(id, source)| SourceSummary {
            source_id: id.clone(),
            state: source.state,
            health: source.health.clone(),
            age_ms: source
                .observation
                .as_ref()
                .map(|o| o.age(context.fused_at).as_millis() as u64),
            truncated: prompt.truncated().iter().any(|t| t == id),
        })
        .collect()
}

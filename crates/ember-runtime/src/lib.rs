//! `ember-runtime` – the decision loop.
//!
//! Ties perception, inference, validation, and actuation together into one
//! deadline-bounded tick, repeated on a fixed interval.
//!
//! # Modules
//!
//! - [`agent_loop`] – [`AgentLoop`]: the tick scheduler.  Fuse → prompt →
//!   infer → parse → dispatch → record, with pause / emergency-stop control.
//! - [`config`] – [`AgentConfig`]: the TOML-backed description of one agent
//!   (timing, inputs, plugins, vocabulary, safety limits) and its validation.
//! - [`prompt`] – [`PromptBuilder`]: deterministic, budgeted rendering of a
//!   `DecisionContext`.
//! - [`inference`] – [`InferenceGateway`] over any [`InferenceEndpoint`], with
//!   a hard timeout and bounded retry of transient failures.
//! - [`llm_driver`] – [`LlmDriver`]: an OpenAI-compatible endpoint (Ollama,
//!   vLLM, hosted providers).
//! - [`router`] – [`ActionRouter`]: per-target ordered, cross-target
//!   concurrent dispatch with per-command timeouts.
//! - [`sink`] – [`TelemetrySink`] and the bus-backed [`EventBusSink`].
//! - [`telemetry`] – [`init_tracing`]: subscriber and OTLP exporter setup.

pub mod agent_loop;
pub mod config;
pub mod inference;
pub mod llm_driver;
pub mod prompt;
pub mod router;
pub mod sink;
pub mod telemetry;

pub use agent_loop::{AgentLoop, LoopState, LoopTiming};
pub use config::AgentConfig;
pub use inference::{
    ChatMessage, InferenceEndpoint, InferenceError, InferenceGateway, RetryConfig, Role,
    ScriptedEndpoint,
};
pub use llm_driver::LlmDriver;
pub use prompt::{Prompt, PromptBuilder};
pub use router::ActionRouter;
pub use sink::{EventBusSink, TelemetrySink};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};

//! Shared data model for the Ember agent runtime.
//!
//! Every other crate in the workspace speaks these types: observations flow
//! in from input plugins, a [`DecisionContext`] is fused per tick, the model's
//! reply is bound against an [`ActionVocabulary`] into [`ActionCommand`]s, and
//! each tick ends as a [`TickRecord`].

pub mod dispatch;
pub mod error;
pub mod observation;
pub mod telemetry;
pub mod vocabulary;

pub use dispatch::{DispatchResult, DispatchStatus, RawInferenceResponse};
pub use error::EmberError;
pub use observation::{
    DecisionContext, Detection, ImageFrame, LaserScan, Observation, ObservationPayload,
    SnapshotState, SourceHealth, SourceId, SourceSnapshot,
};
pub use telemetry::{
    AbortReason, ControlCommand, Event, EventPayload, SourceSummary, StageLatencies, TickOutcome,
    TickRecord,
};
pub use vocabulary::{
    ActionCommand, ActionDefinition, ActionVocabulary, CandidateArg, CommandSummary, ParamKind,
    ParamSpec, ParamValue, PluginId, RejectReason, Rejection,
};

//! Plugin capabilities for the Ember runtime.
//!
//! - [`input`]: the Input Plugin capability and the sink it publishes into.
//! - [`runner`]: one task per input source, with pacing and backoff.
//! - [`action`] / [`registry`]: the Action Plugin capability and its registry.
//! - [`sim`]: simulated inputs and actions for headless runs.

pub mod action;
pub mod backoff;
pub mod camera;
pub mod channel;
pub mod input;
pub mod registry;
pub mod runner;
pub mod sim;

pub use action::ActionPlugin;
pub use backoff::{Backoff, BackoffConfig};
pub use camera::{Camera, CameraInput};
pub use channel::{ChannelInput, InputFeed, channel_input};
pub use input::{InputPlugin, ObservationSink};
pub use registry::PluginRegistry;
pub use runner::InputRunner;

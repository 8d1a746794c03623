//! `ember-perception` – sensor fusion for the decision loop.
//!
//! Turns many asynchronous, variable-latency input streams into one
//! consistent per-tick view.
//!
//! # Modules
//!
//! - [`table`] – [`ObservationTable`]: concurrency-safe latest-value slot per
//!   source, written by input runners.
//! - [`fuser`] – [`Fuser`]: reads every slot in one step and assembles the
//!   tick's [`DecisionContext`][ember_types::DecisionContext].

pub mod fuser;
pub mod table;

pub use fuser::{Fuser, MissingPolicy, SourcePolicy};
pub use table::{ObservationTable, SlotView};

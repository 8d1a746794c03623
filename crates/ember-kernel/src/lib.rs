//! `ember-kernel` – Validation & Safety
//!
//! Nothing the model says reaches an actuator without passing through here.
//! The kernel does not think; it decodes, checks, and refuses.
//!
//! # Modules
//!
//! - [`grammar`] – the documented `ember-actions/1` wire grammar and its
//!   tokenizer, plus the JSON form and its schema.
//! - [`parser`] – [`ActionParser`][parser::ActionParser]: binds every
//!   candidate to the [`ActionVocabulary`][ember_types::ActionVocabulary],
//!   checks target availability, and applies safety rules, rejecting
//!   candidates individually.
//! - [`state_verifier`] – [`SafetyVerifier`][state_verifier::SafetyVerifier]:
//!   a rule engine with the built-in [`ParamRangeRule`] and
//!   [`HaltInterlock`].

pub mod grammar;
pub mod parser;
pub mod state_verifier;

pub use grammar::{Candidate, CandidateCall, GRAMMAR_VERSION, WireAction, WireReply, tokenize};
pub use parser::{ActionParser, ParseOutcome, ParseStage, TargetAvailability};
pub use state_verifier::{HaltInterlock, ParamRangeRule, Rule, SafetyVerifier, Violation};

//! [`ActionParser`] – decodes a raw model reply into validated commands.
//!
//! Each reply moves through `Received → Tokenized → (Valid | Rejected)`.
//! Every candidate is checked on its own, in order:
//!
//! 1. it follows the wire grammar ([`grammar::tokenize`]);
//! 2. its name is declared in the [`ActionVocabulary`];
//! 3. its arguments bind to the declared parameter schema;
//! 4. its target plugin is registered and healthy;
//! 5. every safety [`Rule`](crate::state_verifier::Rule) passes.
//!
//! A failing candidate becomes a [`Rejection`]; its siblings are unaffected.
//! Zero commands is a legal outcome.

use std::sync::Arc;

use ember_hal::PluginRegistry;
use ember_types::{ActionCommand, ActionVocabulary, RawInferenceResponse, RejectReason, Rejection};
use tracing::{debug, info};

use crate::grammar;
use crate::state_verifier::SafetyVerifier;

/// Name of the explicit no-op an agent may emit when it chooses to do
/// nothing.  Only meaningful when not declared in the vocabulary.
pub const NO_ACTION: &str = "none";

/// Whether a command's target can accept it right now.
pub trait TargetAvailability {
    fn is_available(&self, target: &str, action_name: &str) -> bool;
}

impl TargetAvailability for PluginRegistry {
    fn is_available(&self, target: &str, action_name: &str) -> bool {
        PluginRegistry::is_available(self, target, action_name)
    }
}

/// Per-reply parse state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStage {
    Received,
    Tokenized,
    /// At least one command, or nothing was asked for.
    Valid,
    /// Every candidate was rejected.
    Rejected,
}

/// Everything the parser produced for one reply.
#[derive(Debug)]
pub struct ParseOutcome {
    pub stage: ParseStage,
    /// Candidates found in the reply (explicit no-ops excluded).
    pub candidates: usize,
    pub commands: Vec<ActionCommand>,
    pub rejections: Vec<Rejection>,
}

/// Validates replies against one vocabulary and rule set.
pub struct ActionParser {
    vocabulary: Arc<ActionVocabulary>,
    verifier: Arc<SafetyVerifier>,
}

impl ActionParser {
    pub fn new(vocabulary: Arc<ActionVocabulary>, verifier: Arc<SafetyVerifier>) -> Self {
        Self {
            vocabulary,
            verifier,
        }
    }

    pub fn vocabulary(&self) -> &Arc<ActionVocabulary> {
        &self.vocabulary
    }

    /// Decode and validate `response`.
    pub fn parse(
        &self,
        response: &RawInferenceResponse,
        targets: &dyn TargetAvailability,
    ) -> ParseOutcome {
        let tick_id = response.tick_id;
        let mut stage = ParseStage::Received;
        debug!(tick_id, ?stage, bytes = response.text.len(), "parsing reply");

        let tokens = grammar::tokenize(&response.text);
        stage = ParseStage::Tokenized;
        debug!(tick_id, ?stage, candidates = tokens.len());

        let mut candidates = 0;
        let mut commands = Vec::new();
        let mut rejections = Vec::new();
        for token in tokens {
            let reject = |reason: RejectReason| Rejection {
                candidate_index: token.index,
                raw: token.raw.clone(),
                reason,
            };
            let call = match &token.call {
                Ok(call) => call.clone(),
                Err(detail) => {
                    candidates += 1;
                    rejections.push(reject(RejectReason::Malformed(detail.clone())));
                    continue;
                }
            };
            if call.name == NO_ACTION && call.args.is_empty() && !self.vocabulary.contains(NO_ACTION) {
                continue;
            }
            candidates += 1;

            let command = match self.vocabulary.bind(tick_id, &call.name, call.args) {
                Ok(c) => c,
                Err(reason) => {
                    rejections.push(reject(reason));
                    continue;
                }
            };
            if !targets.is_available(command.target_plugin_id(), command.action_name()) {
                rejections.push(reject(RejectReason::TargetUnavailable(
                    command.target_plugin_id().to_string(),
                )));
                continue;
            }
            if let Err(violation) = self.verifier.verify(&command) {
                rejections.push(reject(RejectReason::SafetyRule {
                    rule: violation.rule,
                    detail: violation.error.to_string(),
                }));
                continue;
            }
            commands.push(command);
        }

        stage = if !commands.is_empty() || rejections.is_empty() {
            ParseStage::Valid
        } else {
            ParseStage::Rejected
        };
        for r in &rejections {
            info!(tick_id, index = r.candidate_index, raw = %r.raw, reason = %r.reason, "candidate rejected");
        }
        debug!(tick_id, ?stage, accepted = commands.len(), rejected = rejections.len());

        ParseOutcome {
            stage,
            candidates,
            commands,
            rejections,
        }
    }
}

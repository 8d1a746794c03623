//! [`SafetyVerifier`] – physical safety interlock / rule engine.
//!
//! Every [`ActionCommand`] that binds to the vocabulary is passed through
//! [`SafetyVerifier::verify`] before it may be dispatched.  Each registered
//! [`Rule`] is evaluated in order; the first violation rejects the command.
//!
//! Two built-in rules are provided:
//! - [`ParamRangeRule`] – caps the magnitude of one numeric parameter of one
//!   action (e.g. `move.x` within ±0.5 m/s), independently of the schema.
//! - [`HaltInterlock`] – rejects every command while an emergency stop is
//!   engaged.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ember_types::{ActionCommand, EmberError};
use serde::{Deserialize, Serialize};
use tracing::warn;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single physical invariant that a command must satisfy.
///
/// Implement this trait to create custom safety rules and add them to a
/// [`SafetyVerifier`] via [`SafetyVerifier::add_rule`].
pub trait Rule: Send + Sync {
    /// Human-readable name used in rejections.
    fn name(&self) -> &str;

    /// Return `Ok(())` when the command satisfies the invariant.
    ///
    /// # Errors
    ///
    /// [`EmberError::ParseRejected`] or [`EmberError::Halted`] describing the
    /// violation.
    fn check(&self, command: &ActionCommand) -> Result<(), EmberError>;
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyVerifier
// ────────────────────────────────────────────────────────────────────────────

/// Rule engine that validates an [`ActionCommand`] against all registered
/// [`Rule`]s before it is dispatched.
#[derive(Default)]
pub struct SafetyVerifier {
    rules: Vec<Box<dyn Rule>>,
}

/// A rule violation: which rule, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub rule: String,
    pub error: EmberError,
}

impl SafetyVerifier {
    /// Create an empty verifier with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new [`Rule`].  Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Validate `command` against every registered rule.
    ///
    /// Returns the first violation encountered, or `Ok(())` when all rules
    /// pass.
    pub fn verify(&self, command: &ActionCommand) -> Result<(), Violation> {
        for rule in &self.rules {
            if let Err(error) = rule.check(command) {
                warn!(rule = rule.name(), command = %command, error = %error, "safety rule violated");
                return Err(Violation {
                    rule: rule.name().to_string(),
                    error,
                });
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Rejects commands for `action` whose numeric `param` magnitude exceeds
/// `max_abs`.  Commands for other actions, or without the parameter, pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamRangeRule {
    pub action: String,
    pub param: String,
    pub max_abs: f64,
}

impl Rule for ParamRangeRule {
    fn name(&self) -> &str {
        "param_range"
    }

    fn check(&self, command: &ActionCommand) -> Result<(), EmberError> {
        if command.action_name() != self.action {
            return Ok(());
        }
        if let Some(v) = command.param_f64(&self.param) {
            if v.abs() > self.max_abs {
                return Err(EmberError::ParseRejected(format!(
                    "{}.{} = {v} exceeds cap {}",
                    self.action, self.param, self.max_abs
                )));
            }
        }
        Ok(())
    }
}

/// Emergency-stop interlock.  While engaged, every command is rejected.
///
/// Clones share the same flag, so the CLI's Ctrl-C handler and the agent
/// loop's control-event handler can both hold one.
#[derive(Debug, Clone, Default)]
pub struct HaltInterlock {
    engaged: Arc<AtomicBool>,
}

impl HaltInterlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self) {
        if !self.engaged.swap(true, Ordering::SeqCst) {
            warn!("emergency stop engaged");
        }
    }

    pub fn release(&self) {
        if self.engaged.swap(false, Ordering::SeqCst) {
            warn!("emergency stop released");
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }
}

impl Rule for HaltInterlock {
    fn name(&self) -> &str {
        "halt_interlock"
    }

    fn check(&self, _command: &ActionCommand) -> Result<(), EmberError> {
        if self.is_engaged() {
            return Err(EmberError::Halted("emergency stop engaged".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ember_types::{
        ActionDefinition, ActionVocabulary, CandidateArg, ParamKind, ParamSpec, ParamValue,
    };

    use super::*;

    // ------------------------------------------------------------------ helpers
    fn move_command(x: f64) -> ActionCommand {
        let vocab = ActionVocabulary::new(vec![ActionDefinition {
            name: "move".into(),
            description: String::new(),
            params: vec![ParamSpec {
                name: "x".into(),
                kind: ParamKind::Number { min: None, max: None },
                required: true,
                description: None,
            }],
            target: "base".into(),
            idempotent: false,
        }])
        .unwrap();
        vocab
            .bind(
                1,
                "move",
                vec![CandidateArg {
                    name: None,
                    value: ParamValue::Number(x),
                }],
            )
            .unwrap()
    }

    fn range_verifier(max_abs: f64) -> SafetyVerifier {
        let mut v = SafetyVerifier::new();
        v.add_rule(Box::new(ParamRangeRule {
            action: "move".into(),
            param: "x".into(),
            max_abs,
        }));
        v
    }

    // ------------------------------------------------------------------ ParamRangeRule

    #[test]
    fn within_cap_passes() {
        assert!(range_verifier(0.5).verify(&move_command(0.4)).is_ok());
        assert!(range_verifier(0.5).verify(&move_command(-0.5)).is_ok());
    }

    #[test]
    fn over_cap_is_rejected_with_rule_name() {
        let violation = range_verifier(0.5).verify(&move_command(-0.9)).unwrap_err();
        assert_eq!(violation.rule, "param_range");
        assert!(violation.error.to_string().contains("exceeds cap"));
    }

    #[test]
    fn other_actions_are_ignored() {
        let mut v = SafetyVerifier::new();
        v.add_rule(Box::new(ParamRangeRule {
            action: "turn".into(),
            param: "x".into(),
            max_abs: 0.0,
        }));
        assert!(v.verify(&move_command(10.0)).is_ok());
    }

    // ------------------------------------------------------------------ HaltInterlock

    #[test]
    fn halt_interlock_blocks_everything_until_released() {
        let halt = HaltInterlock::new();
        let mut v = SafetyVerifier::new();
        v.add_rule(Box::new(halt.clone()));

        assert!(v.verify(&move_command(0.1)).is_ok());
        halt.engage();
        let violation = v.verify(&move_command(0.1)).unwrap_err();
        assert_eq!(violation.rule, "halt_interlock");
        assert!(matches!(violation.error, EmberError::Halted(_)));

        halt.release();
        assert!(v.verify(&move_command(0.1)).is_ok());
    }

    #[test]
    fn rules_evaluate_in_insertion_order() {
        let halt = HaltInterlock::new();
        halt.engage();
        let mut v = range_verifier(0.5);
        v.add_rule(Box::new(halt));
        assert_eq!(v.rule_names(), vec!["param_range", "halt_interlock"]);
        let violation = v.verify(&move_command(2.0)).unwrap_err();
        assert_eq!(violation.rule, "param_range");
    }
}

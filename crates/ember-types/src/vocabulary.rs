//! The closed action vocabulary and the only constructor of
//! [`ActionCommand`].
//!
//! An [`ActionCommand`] cannot be built from outside this module except by
//! [`ActionVocabulary::bind`], so every command in the system has parsed
//! against a declared action and its parameter schema.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EmberError;

/// Identifier of a registered action plugin, e.g. `"speaker"` or `"base"`.
pub type PluginId = String;

// ────────────────────────────────────────────────────────────────────────────
// Parameter schema
// ────────────────────────────────────────────────────────────────────────────

/// Declared type (and constraints) of one action parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    String {
        #[serde(default)]
        max_len: Option<usize>,
    },
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Integer {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Bool,
    Enum {
        values: Vec<String>,
    },
}

/// One declared parameter of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_required() -> bool {
    true
}

/// A literal argument value produced by the grammar tokenizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Integer(_) => "integer",
            ParamValue::Number(_) => "number",
            ParamValue::String(_) => "string",
        }
    }

    /// Numeric view of integer and number values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Integer(i) => Some(*i as f64),
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Integer(i) => write!(f, "{i}"),
            ParamValue::Number(n) => write!(f, "{n}"),
            ParamValue::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl ParamKind {
    /// Check `value` against this kind, returning the normalised value.
    ///
    /// Integers are accepted for `number` parameters.  Fractional numbers are
    /// never truncated into `integer` parameters.
    pub fn check(&self, param: &str, value: ParamValue) -> Result<ParamValue, RejectReason> {
        let mismatch = |expected: &'static str, got: &ParamValue| RejectReason::TypeMismatch {
            param: param.to_string(),
            expected: expected.to_string(),
            got: got.type_name().to_string(),
        };
        match self {
            ParamKind::String { max_len } => match value {
                ParamValue::String(s) => {
                    if let Some(max) = max_len {
                        let len = s.chars().count();
                        if len > *max {
                            return Err(RejectReason::OutOfRange {
                                param: param.to_string(),
                                detail: format!("length {len} exceeds {max}"),
                            });
                        }
                    }
                    Ok(ParamValue::String(s))
                }
                other => Err(mismatch("string", &other)),
            },
            ParamKind::Number { min, max } => {
                let n = match &value {
                    ParamValue::Integer(i) => *i as f64,
                    ParamValue::Number(n) => *n,
                    other => return Err(mismatch("number", other)),
                };
                if !n.is_finite() {
                    return Err(RejectReason::OutOfRange {
                        param: param.to_string(),
                        detail: "value is not finite".to_string(),
                    });
                }
                if min.is_some_and(|lo| n < lo) || max.is_some_and(|hi| n > hi) {
                    return Err(RejectReason::OutOfRange {
                        param: param.to_string(),
                        detail: format!("{n} outside [{}, {}]", fmt_bound(*min), fmt_bound(*max)),
                    });
                }
                Ok(ParamValue::Number(n))
            }
            ParamKind::Integer { min, max } => match value {
                ParamValue::Integer(i) => {
                    if min.is_some_and(|lo| i < lo) || max.is_some_and(|hi| i > hi) {
                        return Err(RejectReason::OutOfRange {
                            param: param.to_string(),
                            detail: format!("{i} outside [{}, {}]", fmt_bound(*min), fmt_bound(*max)),
                        });
                    }
                    Ok(ParamValue::Integer(i))
                }
                other => Err(mismatch("integer", &other)),
            },
            ParamKind::Bool => match value {
                ParamValue::Bool(b) => Ok(ParamValue::Bool(b)),
                other => Err(mismatch("bool", &other)),
            },
            ParamKind::Enum { values } => match value {
                ParamValue::String(s) if values.iter().any(|v| v == &s) => Ok(ParamValue::String(s)),
                ParamValue::String(s) => Err(RejectReason::NotInEnum {
                    param: param.to_string(),
                    value: s,
                }),
                other => Err(mismatch("enum", &other)),
            },
        }
    }

    /// Compact type annotation used in action signatures.
    pub fn describe(&self) -> String {
        match self {
            ParamKind::String { max_len: Some(max) } => format!("string<={max}"),
            ParamKind::String { max_len: None } => "string".to_string(),
            ParamKind::Number { min: None, max: None } => "number".to_string(),
            ParamKind::Number { min, max } => {
                format!("number[{}..{}]", fmt_bound(*min), fmt_bound(*max))
            }
            ParamKind::Integer { min: None, max: None } => "integer".to_string(),
            ParamKind::Integer { min, max } => {
                format!("integer[{}..{}]", fmt_bound(*min), fmt_bound(*max))
            }
            ParamKind::Bool => "bool".to_string(),
            ParamKind::Enum { values } => values.join("|"),
        }
    }
}

fn fmt_bound<T: fmt::Display>(b: Option<T>) -> String {
    b.map(|v| v.to_string()).unwrap_or_default()
}

// ────────────────────────────────────────────────────────────────────────────
// Action definitions & vocabulary
// ────────────────────────────────────────────────────────────────────────────

/// One declared action: name, parameter schema, and target plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Action plugin that executes this action.
    pub target: PluginId,
    /// Safe to re-attempt after a failed or timed-out dispatch.
    #[serde(default)]
    pub idempotent: bool,
}

impl ActionDefinition {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// `name(param: type, param?: type)` rendering used in prompts.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                format!(
                    "{}{}: {}",
                    p.name,
                    if p.required { "" } else { "?" },
                    p.kind.describe()
                )
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }
}

/// The closed set of legal action names/schemas an agent may invoke.
///
/// Read-only once constructed; share it with `Arc`.
#[derive(Debug, Clone, Default)]
pub struct ActionVocabulary {
    actions: BTreeMap<String, ActionDefinition>,
}

/// Valid grammar identifier: `(letter | _) { letter | digit | _ | . }`.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

impl ActionVocabulary {
    /// Build and validate a vocabulary.
    ///
    /// # Errors
    ///
    /// [`EmberError::Configuration`] for duplicate or malformed action names,
    /// duplicate parameter names, inverted numeric ranges, empty enums, or a
    /// missing target plugin id.
    pub fn new(definitions: Vec<ActionDefinition>) -> Result<Self, EmberError> {
        let mut actions = BTreeMap::new();
        for def in definitions {
            if !is_identifier(&def.name) {
                return Err(EmberError::Configuration(format!(
                    "action name '{}' is not a valid identifier",
                    def.name
                )));
            }
            if def.target.trim().is_empty() {
                return Err(EmberError::Configuration(format!(
                    "action '{}' has no target plugin",
                    def.name
                )));
            }
            let mut seen = BTreeSet::new();
            for p in &def.params {
                if !is_identifier(&p.name) {
                    return Err(EmberError::Configuration(format!(
                        "parameter '{}' of action '{}' is not a valid identifier",
                        p.name, def.name
                    )));
                }
                if !seen.insert(p.name.as_str()) {
                    return Err(EmberError::Configuration(format!(
                        "action '{}' declares parameter '{}' twice",
                        def.name, p.name
                    )));
                }
                validate_kind(&def.name, p)?;
            }
            let name = def.name.clone();
            if actions.insert(name.clone(), def).is_some() {
                return Err(EmberError::Configuration(format!(
                    "action '{name}' declared twice"
                )));
            }
        }
        Ok(Self { actions })
    }

    pub fn get(&self, name: &str) -> Option<&ActionDefinition> {
        self.actions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Definitions in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ActionDefinition> {
        self.actions.values()
    }

    /// Every plugin id referenced by at least one action.
    pub fn targets(&self) -> BTreeSet<&str> {
        self.actions.values().map(|d| d.target.as_str()).collect()
    }

    /// Bind a tokenized candidate to its declared schema.
    ///
    /// Positional arguments bind in declaration order; named arguments bind
    /// by name and must follow all positional ones.
    pub fn bind(
        &self,
        tick_id: u64,
        name: &str,
        args: Vec<CandidateArg>,
    ) -> Result<ActionCommand, RejectReason> {
        let def = self
            .actions
            .get(name)
            .ok_or_else(|| RejectReason::UnknownAction(name.to_string()))?;

        let mut bound: BTreeMap<String, ParamValue> = BTreeMap::new();
        let mut positional = 0usize;
        let mut seen_named = false;
        for arg in args {
            let spec = match &arg.name {
                None => {
                    if seen_named {
                        return Err(RejectReason::Malformed(
                            "positional argument after named argument".to_string(),
                        ));
                    }
                    let spec = def.params.get(positional).ok_or(RejectReason::TooManyArguments {
                        action: def.name.clone(),
                        expected: def.params.len(),
                    })?;
                    positional += 1;
                    spec
                }
                Some(param) => {
                    seen_named = true;
                    def.param(param).ok_or_else(|| RejectReason::UnknownParameter {
                        action: def.name.clone(),
                        param: param.clone(),
                    })?
                }
            };
            let value = spec.kind.check(&spec.name, arg.value)?;
            if bound.insert(spec.name.clone(), value).is_some() {
                return Err(RejectReason::DuplicateParameter(spec.name.clone()));
            }
        }
        if let Some(missing) = def
            .params
            .iter()
            .find(|p| p.required && !bound.contains_key(&p.name))
        {
            return Err(RejectReason::MissingParameter(missing.name.clone()));
        }

        Ok(ActionCommand {
            tick_id,
            action_name: def.name.clone(),
            parameters: bound,
            target_plugin_id: def.target.clone(),
            idempotent: def.idempotent,
        })
    }
}

fn validate_kind(action: &str, p: &ParamSpec) -> Result<(), EmberError> {
    let inverted = match &p.kind {
        ParamKind::Number { min: Some(lo), max: Some(hi) } => lo > hi,
        ParamKind::Integer { min: Some(lo), max: Some(hi) } => lo > hi,
        ParamKind::Enum { values } if values.is_empty() => {
            return Err(EmberError::Configuration(format!(
                "enum parameter '{}' of action '{action}' has no values",
                p.name
            )));
        }
        _ => false,
    };
    if inverted {
        return Err(EmberError::Configuration(format!(
            "parameter '{}' of action '{action}' has min > max",
            p.name
        )));
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Candidates & rejections
// ────────────────────────────────────────────────────────────────────────────

/// One argument of a tokenized candidate: positional when `name` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateArg {
    pub name: Option<String>,
    pub value: ParamValue,
}

/// Why a single candidate action was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    /// Does not follow the wire grammar.
    Malformed(String),
    UnknownAction(String),
    UnknownParameter { action: String, param: String },
    MissingParameter(String),
    DuplicateParameter(String),
    TooManyArguments { action: String, expected: usize },
    TypeMismatch {
        param: String,
        expected: String,
        got: String,
    },
    OutOfRange { param: String, detail: String },
    NotInEnum { param: String, value: String },
    /// Target plugin not registered or not healthy.
    TargetUnavailable(String),
    /// A safety rule refused the command.
    SafetyRule { rule: String, detail: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Malformed(d) => write!(f, "malformed candidate: {d}"),
            RejectReason::UnknownAction(a) => write!(f, "action '{a}' is not in the vocabulary"),
            RejectReason::UnknownParameter { action, param } => {
                write!(f, "action '{action}' has no parameter '{param}'")
            }
            RejectReason::MissingParameter(p) => write!(f, "missing required parameter '{p}'"),
            RejectReason::DuplicateParameter(p) => write!(f, "parameter '{p}' given twice"),
            RejectReason::TooManyArguments { action, expected } => {
                write!(f, "action '{action}' takes at most {expected} argument(s)")
            }
            RejectReason::TypeMismatch { param, expected, got } => {
                write!(f, "parameter '{param}' expects {expected}, got {got}")
            }
            RejectReason::OutOfRange { param, detail } => {
                write!(f, "parameter '{param}' out of range: {detail}")
            }
            RejectReason::NotInEnum { param, value } => {
                write!(f, "parameter '{param}' does not allow '{value}'")
            }
            RejectReason::TargetUnavailable(t) => write!(f, "target plugin '{t}' unavailable"),
            RejectReason::SafetyRule { rule, detail } => write!(f, "safety rule '{rule}': {detail}"),
        }
    }
}

/// A rejected candidate, kept for telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Position of the candidate in the raw response.
    pub candidate_index: usize,
    /// Candidate source text (or JSON) as it appeared in the response.
    pub raw: String,
    pub reason: RejectReason,
}

// ────────────────────────────────────────────────────────────────────────────
// ActionCommand
// ────────────────────────────────────────────────────────────────────────────

/// A validated action invocation.
///
/// Only [`ActionVocabulary::bind`] constructs this type.  It is neither
/// `Clone` nor `Deserialize`: ownership moves to the router, which executes
/// it exactly once (or re-attempts it only when `is_idempotent`).
#[derive(Debug, PartialEq, Serialize)]
pub struct ActionCommand {
    tick_id: u64,
    action_name: String,
    parameters: BTreeMap<String, ParamValue>,
    target_plugin_id: PluginId,
    idempotent: bool,
}

impl ActionCommand {
    pub fn tick_id(&self) -> u64 {
        self.tick_id
    }

    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    pub fn parameters(&self) -> &BTreeMap<String, ParamValue> {
        &self.parameters
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.parameters.get(name)
    }

    pub fn param_f64(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).and_then(ParamValue::as_f64)
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(ParamValue::as_str)
    }

    pub fn target_plugin_id(&self) -> &str {
        &self.target_plugin_id
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// Telemetry copy of this command.
    pub fn summary(&self) -> CommandSummary {
        CommandSummary {
            action_name: self.action_name.clone(),
            target_plugin_id: self.target_plugin_id.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

impl fmt::Display for ActionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self
            .parameters
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        write!(f, "{}({})", self.action_name, args.join(", "))
    }
}

/// Serializable, non-executable record of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSummary {
    pub action_name: String,
    pub target_plugin_id: PluginId,
    pub parameters: BTreeMap<String, ParamValue>,
}

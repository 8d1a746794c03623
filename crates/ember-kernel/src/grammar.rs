//! Action wire grammar `ember-actions/1`.
//!
//! The model replies with a sequence of *candidates* separated by `;` or a
//! newline at nesting depth 0:
//!
//! ```text
//! candidate  := IDENT "(" [ arg { "," arg } ] ")"
//! arg        := value | IDENT "=" value
//! value      := STRING | NUMBER | "true" | "false"
//! STRING     := '"' { char | '\"' | '\\' | '\n' | '\t' } '"'
//! NUMBER     := ["-"] digits ["." digits] [("e"|"E") ["+"|"-"] digits]
//! IDENT      := (letter | "_") { letter | digit | "_" | "." }
//! ```
//!
//! Blank segments and lines starting with `#` are not candidates.  Code
//! fences around the reply are stripped.  A reply whose trimmed text starts
//! with `{` or `[` is read as JSON instead:
//! `{"actions":[{"name":"speak","args":{"text":"hi"}}]}` or a bare array of
//! such objects.
//!
//! [`tokenize`] only checks syntax.  Binding against the vocabulary happens
//! in [`ActionParser`](crate::parser::ActionParser).
//!
//! # Example
//!
//! ```rust
//! use ember_kernel::grammar::tokenize;
//!
//! let candidates = tokenize("speak(\"hello\") ; jump()");
//! assert_eq!(candidates.len(), 2);
//! assert_eq!(candidates[0].call.as_ref().unwrap().name, "speak");
//! assert_eq!(candidates[1].raw, "jump()");
//! ```

use std::collections::BTreeMap;
use std::iter::Peekable;
use std::str::CharIndices;

use ember_types::{CandidateArg, ParamValue};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Identifier of the grammar understood by [`tokenize`].
pub const GRAMMAR_VERSION: &str = "ember-actions/1";

/// A syntactically decoded action invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateCall {
    pub name: String,
    pub args: Vec<CandidateArg>,
}

/// One candidate from the reply, decoded or not.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Position among the reply's candidates.
    pub index: usize,
    /// Source text of the candidate.
    pub raw: String,
    /// The decoded call, or why it does not follow the grammar.
    pub call: Result<CandidateCall, String>,
}

// ────────────────────────────────────────────────────────────────────────────
// JSON form
// ────────────────────────────────────────────────────────────────────────────

/// JSON form of a reply.  Also used to derive the structured-output schema
/// handed to endpoints that support it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WireReply {
    pub actions: Vec<WireAction>,
}

/// JSON form of one candidate.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WireAction {
    /// Declared action name.
    pub name: String,
    /// Arguments by parameter name.
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
}

/// JSON Schema of [`WireReply`].
pub fn reply_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(WireReply)).unwrap_or(serde_json::Value::Null)
}

// ────────────────────────────────────────────────────────────────────────────
// Entry point
// ────────────────────────────────────────────────────────────────────────────

/// Split a raw model reply into candidates.
pub fn tokenize(reply: &str) -> Vec<Candidate> {
    let trimmed = strip_code_fences(reply).trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return tokenize_json(trimmed);
    }
    split_segments(trimmed)
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(index, raw)| Candidate {
            index,
            raw: raw.to_string(),
            call: parse_call(raw),
        })
        .collect()
}

/// Unwrap a reply that is one fenced block.  Fences anywhere else are left
/// in place and surface as malformed candidates.
fn strip_code_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // The opening line may carry an info string such as `json`.
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body)
}

fn tokenize_json(text: &str) -> Vec<Candidate> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return vec![Candidate {
                index: 0,
                raw: text.to_string(),
                call: Err(format!("invalid JSON: {e}")),
            }];
        }
    };
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("actions") {
            Some(serde_json::Value::Array(items)) => items,
            _ => {
                return vec![Candidate {
                    index: 0,
                    raw: text.to_string(),
                    call: Err("expected an \"actions\" array".to_string()),
                }];
            }
        },
        _ => {
            return vec![Candidate {
                index: 0,
                raw: text.to_string(),
                call: Err("expected a JSON object or array".to_string()),
            }];
        }
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let raw = item.to_string();
            let call = serde_json::from_value::<WireAction>(item)
                .map_err(|e| format!("invalid action object: {e}"))
                .and_then(call_from_wire);
            Candidate { index, raw, call }
        })
        .collect()
}

fn call_from_wire(action: WireAction) -> Result<CandidateCall, String> {
    if !ember_types::vocabulary::is_identifier(&action.name) {
        return Err(format!("'{}' is not an identifier", action.name));
    }
    let mut args = Vec::with_capacity(action.args.len());
    for (name, value) in action.args {
        let value = match value {
            serde_json::Value::Bool(b) => ParamValue::Bool(b),
            serde_json::Value::String(s) => ParamValue::String(s),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ParamValue::Integer(i),
                None => ParamValue::Number(
                    n.as_f64()
                        .ok_or_else(|| format!("argument '{name}' is not representable"))?,
                ),
            },
            other => {
                return Err(format!(
                    "argument '{name}' must be a string, number or boolean, got {other}"
                ));
            }
        };
        args.push(CandidateArg {
            name: Some(name),
            value,
        });
    }
    Ok(CandidateCall {
        name: action.name,
        args,
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Text form
// ────────────────────────────────────────────────────────────────────────────

/// Split on `;` / newline outside string literals and parentheses.
///
/// A `#` that opens a segment comments out the rest of its line.  Quotes and
/// parentheses inside the comment are not counted.
fn split_segments(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut in_comment = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
                start = i + 1;
            }
            continue;
        }
        if in_string {
            match (escaped, c) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '#' if depth == 0 && text[start..i].trim().is_empty() => {
                in_comment = true;
                start = i;
            }
            '"' => in_string = true,
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ';' | '\n' if depth == 0 => {
                segments.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if !in_comment {
        segments.push(&text[start..]);
    }
    segments
}

struct Cursor<'a> {
    src: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn bump(&mut self) -> Option<char> {
        self.chars.next().map(|(_, c)| c)
    }

    fn pos(&mut self) -> usize {
        self.chars.peek().map(|(i, _)| *i).unwrap_or(self.src.len())
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn expect(&mut self, want: char) -> Result<(), String> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(format!("expected '{want}', found '{c}'")),
            None => Err(format!("expected '{want}', found end of input")),
        }
    }

    fn ident(&mut self) -> Result<&'a str, String> {
        let start = self.pos();
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                self.bump();
            }
            Some(c) => return Err(format!("expected identifier, found '{c}'")),
            None => return Err("expected identifier, found end of input".to_string()),
        }
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            self.bump();
        }
        let end = self.pos();
        Ok(&self.src[start..end])
    }

    fn string(&mut self) -> Result<String, String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err("unterminated string".to_string()),
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => return Err(format!("unknown escape '\\{c}'")),
                    None => return Err("unterminated string".to_string()),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn digits(&mut self) -> usize {
        let mut n = 0;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
            n += 1;
        }
        n
    }

    fn number(&mut self) -> Result<ParamValue, String> {
        let start = self.pos();
        let mut fractional = false;
        if self.peek() == Some('-') {
            self.bump();
        }
        if self.digits() == 0 {
            return Err("expected digits".to_string());
        }
        if self.peek() == Some('.') {
            self.bump();
            fractional = true;
            if self.digits() == 0 {
                return Err("expected digits after '.'".to_string());
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.bump();
            fractional = true;
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            if self.digits() == 0 {
                return Err("expected exponent digits".to_string());
            }
        }
        let end = self.pos();
        let text = &self.src[start..end];
        if fractional {
            text.parse::<f64>()
                .map(ParamValue::Number)
                .map_err(|e| format!("bad number '{text}': {e}"))
        } else {
            text.parse::<i64>()
                .map(ParamValue::Integer)
                .map_err(|e| format!("bad integer '{text}': {e}"))
        }
    }

    fn value(&mut self) -> Result<ParamValue, String> {
        match self.peek() {
            Some('"') => self.string().map(ParamValue::String),
            Some(c) if c == '-' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() => match self.ident()? {
                "true" => Ok(ParamValue::Bool(true)),
                "false" => Ok(ParamValue::Bool(false)),
                other => Err(format!("bare identifier '{other}' is not a value")),
            },
            Some(c) => Err(format!("unexpected '{c}'")),
            None => Err("expected a value, found end of input".to_string()),
        }
    }

    fn arg(&mut self) -> Result<CandidateArg, String> {
        let is_ident_start = self
            .peek()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if is_ident_start {
            let ident = self.ident()?;
            self.skip_ws();
            if self.peek() == Some('=') {
                self.bump();
                self.skip_ws();
                let value = self.value()?;
                return Ok(CandidateArg {
                    name: Some(ident.to_string()),
                    value,
                });
            }
            return match ident {
                "true" => Ok(CandidateArg {
                    name: None,
                    value: ParamValue::Bool(true),
                }),
                "false" => Ok(CandidateArg {
                    name: None,
                    value: ParamValue::Bool(false),
                }),
                other => Err(format!("bare identifier '{other}' is not a value")),
            };
        }
        Ok(CandidateArg {
            name: None,
            value: self.value()?,
        })
    }
}

fn parse_call(segment: &str) -> Result<CandidateCall, String> {
    let mut cur = Cursor::new(segment);
    let name = cur.ident()?.to_string();
    cur.skip_ws();
    cur.expect('(')?;
    cur.skip_ws();

    let mut args = Vec::new();
    if cur.peek() == Some(')') {
        cur.bump();
    } else {
        loop {
            cur.skip_ws();
            args.push(cur.arg()?);
            cur.skip_ws();
            match cur.bump() {
                Some(',') => continue,
                Some(')') => break,
                Some(c) => return Err(format!("expected ',' or ')', found '{c}'")),
                None => return Err("missing ')'".to_string()),
            }
        }
    }
    cur.skip_ws();
    if let Some(c) = cur.peek() {
        return Err(format!("unexpected '{c}' after ')'"));
    }
    Ok(CandidateCall { name, args })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(c: &Candidate) -> &CandidateCall {
        c.call.as_ref().unwrap()
    }

    #[test]
    fn splits_on_semicolons_and_newlines() {
        let c = tokenize("speak(\"hello\") ; jump()\nmove(0.5, 0, theta=-1)");
        assert_eq!(c.len(), 3);
        assert_eq!(call(&c[0]).name, "speak");
        assert_eq!(call(&c[0]).args[0].value, ParamValue::String("hello".into()));
        assert_eq!(call(&c[1]).name, "jump");
        assert!(call(&c[1]).args.is_empty());
        let m = call(&c[2]);
        assert_eq!(m.args[0].value, ParamValue::Number(0.5));
        assert_eq!(m.args[1].value, ParamValue::Integer(0));
        assert_eq!(m.args[2].name.as_deref(), Some("theta"));
        assert_eq!(m.args[2].value, ParamValue::Integer(-1));
        assert_eq!(c[2].index, 2);
    }

    #[test]
    fn separators_inside_strings_and_parens_do_not_split() {
        let c = tokenize("speak(\"a; b\\nc (d)\")");
        assert_eq!(c.len(), 1);
        assert_eq!(
            call(&c[0]).args[0].value,
            ParamValue::String("a; b\nc (d)".into())
        );
        let c = tokenize("move(\n  x = 1,\n  y = 2\n)");
        assert_eq!(c.len(), 1);
        assert_eq!(call(&c[0]).args.len(), 2);
    }

    #[test]
    fn blank_and_comment_lines_are_ignored() {
        let c = tokenize("# thinking about it\n\n;  ;\nwave()\n");
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].index, 0);
        assert!(tokenize("").is_empty());
        assert!(tokenize("   \n").is_empty());
    }

    #[test]
    fn comments_with_open_parens_or_quotes_end_at_the_newline() {
        let c = tokenize("# I will move (carefully\nspeak(\"hi\")");
        assert_eq!(c.len(), 1);
        assert_eq!(call(&c[0]).name, "speak");

        let c = tokenize("# user said \"hi\nspeak(\"hello\")\nwave()");
        assert_eq!(c.len(), 2);
        assert_eq!(call(&c[0]).name, "speak");
        assert_eq!(call(&c[1]).name, "wave");

        let c = tokenize("stop(); # then (maybe \"later\nwave()\n# trailing (");
        assert_eq!(c.len(), 2);
        assert_eq!(call(&c[1]).name, "wave");
    }

    #[test]
    fn hash_inside_a_call_is_not_a_comment() {
        let c = tokenize("speak(\"#1 fan\")\nmove(\n# not a comment\n)");
        assert_eq!(c.len(), 2);
        assert_eq!(call(&c[0]).args[0].value, ParamValue::String("#1 fan".into()));
        assert!(c[1].call.is_err());
    }

    #[test]
    fn code_fences_are_stripped() {
        let c = tokenize("```text\nspeak(\"hi\")\n```");
        assert_eq!(c.len(), 1);
        assert_eq!(call(&c[0]).name, "speak");
        let c = tokenize("```wave()```");
        assert_eq!(c.len(), 1);
        assert_eq!(call(&c[0]).name, "wave");
    }

    #[test]
    fn fences_inside_the_reply_are_kept() {
        let c = tokenize("speak(\"a\")\n```\nwave()");
        assert_eq!(c.len(), 3);
        assert!(c[0].call.is_ok());
        assert_eq!(c[1].raw, "```");
        assert!(c[1].call.is_err());
        assert_eq!(call(&c[2]).name, "wave");
    }

    #[test]
    fn malformed_candidates_do_not_affect_siblings() {
        let c = tokenize("speak(hello) ; speak(\"ok\") ; move(1,,2) ; I will now wave");
        assert_eq!(c.len(), 4);
        assert!(c[0].call.is_err());
        assert!(c[1].call.is_ok());
        assert!(c[2].call.is_err());
        assert!(c[3].call.is_err());
        assert_eq!(c[3].raw, "I will now wave");
    }

    #[test]
    fn string_escapes() {
        let c = tokenize(r#"speak("say \"hi\"\tthen \\ leave")"#);
        assert_eq!(
            call(&c[0]).args[0].value,
            ParamValue::String("say \"hi\"\tthen \\ leave".into())
        );
        assert!(tokenize(r#"speak("bad \q")"#)[0].call.is_err());
        assert!(tokenize(r#"speak("open)"#)[0].call.is_err());
    }

    #[test]
    fn numbers_follow_the_grammar() {
        let args = |s: &str| call(&tokenize(s)[0]).args.clone();
        assert_eq!(args("f(1e3)")[0].value, ParamValue::Number(1000.0));
        assert_eq!(args("f(-2.5E-1)")[0].value, ParamValue::Number(-0.25));
        assert_eq!(args("f(42)")[0].value, ParamValue::Integer(42));
        assert_eq!(args("f(true, false)")[1].value, ParamValue::Bool(false));
        assert!(tokenize("f(.5)")[0].call.is_err());
        assert!(tokenize("f(1.)")[0].call.is_err());
        assert!(tokenize("f(99999999999999999999)")[0].call.is_err());
    }

    #[test]
    fn trailing_text_after_call_is_malformed() {
        assert!(tokenize("speak(\"hi\") please")[0].call.is_err());
        assert!(tokenize("speak \"hi\"")[0].call.is_err());
    }

    #[test]
    fn dotted_identifiers_are_allowed() {
        let c = tokenize("arm.grip(force=0.3)");
        assert_eq!(call(&c[0]).name, "arm.grip");
    }

    #[test]
    fn json_object_form() {
        let c = tokenize(
            r#"{"actions":[{"name":"speak","args":{"text":"hi"}},{"name":"move","args":{"x":1,"y":0.5}},{"oops":1}]}"#,
        );
        assert_eq!(c.len(), 3);
        assert_eq!(call(&c[0]).args[0].name.as_deref(), Some("text"));
        let m = call(&c[1]);
        assert!(m.args.iter().any(|a| a.value == ParamValue::Integer(1)));
        assert!(m.args.iter().any(|a| a.value == ParamValue::Number(0.5)));
        assert!(c[2].call.is_err());
    }

    #[test]
    fn json_array_form_and_errors() {
        let c = tokenize(r#"[{"name":"wave"}]"#);
        assert_eq!(c.len(), 1);
        assert!(call(&c[0]).args.is_empty());

        let c = tokenize(r#"[{"name":"speak","args":{"text":["nested"]}}]"#);
        assert!(c[0].call.is_err());

        let c = tokenize("{not json");
        assert_eq!(c.len(), 1);
        assert!(c[0].call.is_err());

        let c = tokenize(r#"{"action":"speak"}"#);
        assert!(c[0].call.is_err());
    }

    #[test]
    fn json_inside_code_fence() {
        let c = tokenize("```json\n{\"actions\":[]}\n```");
        assert!(c.is_empty());
    }

    #[test]
    fn reply_schema_describes_actions() {
        let schema = reply_schema();
        let text = schema.to_string();
        assert!(text.contains("actions"));
        assert!(text.contains("WireAction"));
    }
}

//! Prompt Builder: a pure function from [`DecisionContext`] to [`Prompt`].
//!
//! Identical contexts render byte-identical prompts.  Sources are rendered in
//! source-id order; nothing time-of-day dependent is included.  Payloads are
//! summarised rather than inlined (an image becomes its metadata and
//! description, a scan becomes its nearest return), and every source that
//! had to be shortened or dropped to respect the character budgets is listed
//! in [`Prompt::truncated`] so telemetry can report it.

use std::fmt::Write as _;

use ember_kernel::GRAMMAR_VERSION;
use ember_types::{
    ActionVocabulary, DecisionContext, ObservationPayload, SnapshotState, SourceHealth, SourceId,
    SourceSnapshot,
};

use crate::config::PromptConfig;
use crate::inference::ChatMessage;

const TRUNCATION_MARK: &str = " [truncated]";
const OMITTED: &str = "[omitted: prompt budget exhausted]";

/// A rendered request for the inference endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    system: String,
    user: String,
    truncated: Vec<SourceId>,
}

impl Prompt {
    pub fn new(system: String, user: String, truncated: Vec<SourceId>) -> Self {
        Self {
            system,
            user,
            truncated,
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Sources shortened or omitted by the budget.
    pub fn truncated(&self) -> &[SourceId] {
        &self.truncated
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(self.system.clone()),
            ChatMessage::user(self.user.clone()),
        ]
    }

    /// Total characters sent.
    pub fn char_len(&self) -> usize {
        self.system.chars().count() + self.user.chars().count()
    }
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_chars: usize,
    source_chars: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(&PromptConfig::default())
    }
}

impl PromptBuilder {
    pub fn new(config: &PromptConfig) -> Self {
        Self {
            budget_chars: config.budget_chars,
            source_chars: config.source_chars,
        }
    }

    pub fn build(&self, context: &DecisionContext) -> Prompt {
        let system = render_system(&context.persona, &context.vocabulary);

        let mut user = String::new();
        let _ = writeln!(user, "# Tick {}", context.tick_id);
        user.push_str("## Observations\n");
        if context.snapshot.is_empty() {
            user.push_str("(no input sources)\n");
        }

        let mut remaining = self.budget_chars;
        let mut truncated = Vec::new();
        for (id, source) in &context.snapshot {
            let header = render_header(id, source, context);
            let body = render_body(source);

            let (body, cut) = clip(&body, self.source_chars.min(remaining));
            let body = if body.is_empty() && cut {
                OMITTED.to_string()
            } else if cut {
                format!("{body}{TRUNCATION_MARK}")
            } else {
                body
            };
            if cut {
                truncated.push(id.clone());
            }
            remaining = remaining.saturating_sub(body.chars().count());

            user.push_str(&header);
            user.push('\n');
            user.push_str(&body);
            user.push('\n');
        }

        user.push_str("\nWhat do you do next?");
        Prompt {
            system,
            user,
            truncated,
        }
    }
}

fn render_system(persona: &str, vocabulary: &ActionVocabulary) -> String {
    let mut s = String::new();
    if !persona.trim().is_empty() {
        s.push_str(persona.trim());
        s.push_str("\n\n");
    }
    let _ = writeln!(s, "## Actions ({GRAMMAR_VERSION})");
    for def in vocabulary.iter() {
        if def.description.is_empty() {
            let _ = writeln!(s, "- {}", def.signature());
        } else {
            let _ = writeln!(s, "- {}: {}", def.signature(), def.description);
        }
    }
    s.push_str(
        "\n## Reply format\n\
         Reply with one action call per line, for example `speak(\"hello\")`.\n\
         Arguments go in declaration order or as name=value pairs.\n\
         Strings use double quotes. Numbers and true/false are bare.\n\
         Optional parameters are marked with `?`.\n\
         Reply `none()` to do nothing. Anything not listed above is rejected.",
    );
    s
}

fn render_header(id: &str, source: &SourceSnapshot, context: &DecisionContext) -> String {
    let state = match source.state {
        SnapshotState::Present => "present",
        SnapshotState::Stale => "stale",
        SnapshotState::Missing => "missing",
    };
    let mut header = format!("### {id} [{state}");
    if source.required {
        header.push_str(", required");
    }
    header.push(']');
    if let Some(obs) = &source.observation {
        let age = obs.age(context.fused_at).as_millis();
        let _ = write!(header, " {} age={age}ms", obs.payload.kind());
    }
    if let SourceHealth::Degraded {
        reason,
        consecutive_failures,
    } = &source.health
    {
        let _ = write!(
            header,
            " (degraded after {consecutive_failures} failures: {reason})"
        );
    }
    header
}

fn render_body(source: &SourceSnapshot) -> String {
    let Some(obs) = &source.observation else {
        return "(no observation yet)".to_string();
    };
    match &obs.payload {
        ObservationPayload::Text { text } => text.trim().to_string(),
        ObservationPayload::Image(frame) => format!(
            "image {}x{} {}: {}",
            frame.width,
            frame.height,
            frame.encoding,
            frame.description.as_deref().unwrap_or("(no description)")
        ),
        ObservationPayload::Scan(scan) => match scan.nearest() {
            Some((range, bearing)) => format!(
                "laser scan: {}/{} valid returns, nearest {range:.2} m at {:.0} deg",
                scan.valid_count(),
                scan.ranges.len(),
                bearing.to_degrees()
            ),
            None => format!("laser scan: 0/{} valid returns", scan.ranges.len()),
        },
        ObservationPayload::Detections { items } if items.is_empty() => {
            "detections: none".to_string()
        }
        ObservationPayload::Detections { items } => {
            let parts: Vec<String> = items
                .iter()
                .map(|d| {
                    let mut s = format!("{} ({:.2})", d.label, d.confidence);
                    if let Some(m) = d.distance_m {
                        let _ = write!(s, " at {m:.1} m");
                    }
                    if let Some(b) = d.bearing_rad {
                        let _ = write!(s, " bearing {:.0} deg", b.to_degrees());
                    }
                    s
                })
                .collect();
            format!("detections: {}", parts.join("; "))
        }
        ObservationPayload::Structured { value } => value.to_string(),
    }
}

/// Cut `s` to at most `max` characters.  Returns the (possibly shortened)
/// text and whether anything was removed.
fn clip(s: &str, max: usize) -> (String, bool) {
    match s.char_indices().nth(max) {
        None => (s.to_string(), false),
        Some((byte, _)) => (s[..byte].to_string(), true),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use ember_types::{
        ActionDefinition, Detection, ImageFrame, LaserScan, Observation, ParamKind, ParamSpec,
    };
    use tokio::time::Instant;

    use super::*;

    fn vocabulary() -> Arc<ActionVocabulary> {
        Arc::new(
            ActionVocabulary::new(vec![ActionDefinition {
                name: "speak".into(),
                description: "Say something".into(),
                params: vec![ParamSpec {
                    name: "text".into(),
                    kind: ParamKind::String { max_len: None },
                    required: true,
                    description: None,
                }],
                target: "speaker".into(),
                idempotent: false,
            }])
            .unwrap(),
        )
    }

    fn snapshot(payload: Option<ObservationPayload>, at: Instant, id: &str) -> SourceSnapshot {
        let observation = payload.map(|payload| {
            Arc::new(Observation {
                source_id: id.into(),
                captured_at: at,
                sequence: 1,
                payload,
            })
        });
        SourceSnapshot {
            state: if observation.is_some() {
                SnapshotState::Present
            } else {
                SnapshotState::Missing
            },
            observation,
            health: SourceHealth::Healthy,
            required: false,
        }
    }

    fn context(entries: Vec<(&str, SourceSnapshot)>, fused_at: Instant) -> DecisionContext {
        DecisionContext {
            tick_id: 9,
            fused_at,
            snapshot: entries
                .into_iter()
                .map(|(id, s)| (id.to_string(), s))
                .collect::<BTreeMap<_, _>>(),
            persona: Arc::from("You are a lobby robot."),
            vocabulary: vocabulary(),
        }
    }

    #[test]
    fn identical_contexts_render_identical_prompts() {
        let now = Instant::now();
        let at = now - Duration::from_millis(120);
        let make = || {
            context(
                vec![
                    (
                        "camera",
                        snapshot(
                            Some(ObservationPayload::Image(ImageFrame {
                                width: 640,
                                height: 480,
                                encoding: "rgb8".into(),
                                description: Some("a person waving".into()),
                                data: vec![0; 16],
                            })),
                            at,
                            "camera",
                        ),
                    ),
                    (
                        "asr",
                        snapshot(Some(ObservationPayload::Text { text: "hi robot".into() }), at, "asr"),
                    ),
                ],
                now,
            )
        };
        let builder = PromptBuilder::default();
        let a = builder.build(&make());
        let b = builder.build(&make());
        assert_eq!(a, b);
        assert!(a.truncated().is_empty());

        // Sources appear in id order.
        let asr = a.user().find("### asr").unwrap();
        let camera = a.user().find("### camera").unwrap();
        assert!(asr < camera);
        assert!(a.user().contains("a person waving"));
        assert!(a.user().contains("age=120ms"));
        assert!(a.system().starts_with("You are a lobby robot."));
        assert!(a.system().contains("speak(text: string): Say something"));
        assert!(a.system().contains("ember-actions/1"));
    }

    #[test]
    fn missing_and_degraded_sources_are_marked() {
        let now = Instant::now();
        let mut lidar = snapshot(None, now, "lidar");
        lidar.required = true;
        lidar.health = SourceHealth::Degraded {
            reason: "serial closed".into(),
            consecutive_failures: 3,
        };
        let prompt = PromptBuilder::default().build(&context(vec![("lidar", lidar)], now));
        assert!(prompt.user().contains("### lidar [missing, required]"));
        assert!(prompt.user().contains("degraded after 3 failures: serial closed"));
        assert!(prompt.user().contains("(no observation yet)"));
    }

    #[test]
    fn oversized_sources_are_truncated_and_reported() {
        let now = Instant::now();
        let builder = PromptBuilder::new(&PromptConfig {
            budget_chars: 60,
            source_chars: 40,
        });
        let long = "x".repeat(100);
        let prompt = builder.build(&context(
            vec![
                ("a_feed", snapshot(Some(ObservationPayload::Text { text: long.clone() }), now, "a_feed")),
                ("b_feed", snapshot(Some(ObservationPayload::Text { text: long.clone() }), now, "b_feed")),
                ("c_feed", snapshot(Some(ObservationPayload::Text { text: long }), now, "c_feed")),
            ],
            now,
        ));
        assert_eq!(prompt.truncated(), ["a_feed", "b_feed", "c_feed"]);
        assert!(prompt.user().contains(&format!("{}{TRUNCATION_MARK}", "x".repeat(40))));
        assert!(prompt.user().contains(OMITTED));
    }

    #[test]
    fn scans_and_detections_are_summarised() {
        let now = Instant::now();
        let scan = ObservationPayload::Scan(LaserScan {
            ranges: vec![3.0, 1.25, f32::INFINITY],
            angle_min_rad: 0.0,
            angle_increment_rad: std::f32::consts::FRAC_PI_2,
            range_max_m: 10.0,
        });
        let detections = ObservationPayload::Detections {
            items: vec![Detection {
                label: "person".into(),
                confidence: 0.91,
                bearing_rad: None,
                distance_m: Some(2.0),
            }],
        };
        let prompt = PromptBuilder::default().build(&context(
            vec![
                ("lidar", snapshot(Some(scan), now, "lidar")),
                ("vision", snapshot(Some(detections), now, "vision")),
            ],
            now,
        ));
        assert!(prompt.user().contains("2/3 valid returns, nearest 1.25 m at 90 deg"));
        assert!(prompt.user().contains("person (0.91) at 2.0 m"));
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("héllo", 2), ("hé".to_string(), true));
        assert_eq!(clip("hi", 5), ("hi".to_string(), false));
        assert_eq!(clip("hi", 0), (String::new(), true));
    }
}

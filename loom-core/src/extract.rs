//! Chapter extraction pipeline.
//!
//! Three generator calls per chapter: chapter state, time-stamped
//! facts, and an observed character graph. Raw model output lands in
//! loosely-typed wire structs and passes a strict validation gate
//! before it becomes vocabulary-typed records. Validation failures are
//! fed back to the generator as a corrective re-prompt, up to a bounded
//! number of attempts.
//!
//! The pipeline never touches disk. It returns a candidate
//! [`ExtractedChapter`]; the caller decides which branch to commit it
//! to.

use crate::generation::{GenerateError, GenerationRequest, RetryPolicy, TextGenerator};
use crate::graph::{
    evolve, CharacterAttributes, CharacterGraph, GraphConfig, RelationEdge,
};
use crate::state::{ChapterState, Event, RelationStat};
use crate::tkg::{Fact, FactMeta, MAX_FACTS_PER_CHAPTER};
use crate::vocab::{ActionLexicon, CombatPower, RelationKind, TraitKind};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum chapter text length fed to a single extraction call.
pub const MAX_PROMPT_CHARS: usize = 20_000;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction output failed schema validation after {attempts} attempts")]
    SchemaValidation {
        attempts: u32,
        violations: Vec<SchemaViolation>,
    },

    #[error("extraction call timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("extraction backend failed: {0}")]
    Generation(#[from] GenerateError),
}

/// One field-level problem in a wire payload.
#[derive(Debug, Clone)]
pub struct SchemaViolation {
    pub field: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Extraction tunables.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub retry: RetryPolicy,
    pub max_facts: usize,
    pub max_chars: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_facts: MAX_FACTS_PER_CHAPTER,
            max_chars: MAX_PROMPT_CHARS,
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

/// Everything one chapter yields: state, fact log, evolved graph.
#[derive(Debug, Clone)]
pub struct ExtractedChapter {
    pub state: ChapterState,
    pub facts: Vec<Fact>,
    pub graph: CharacterGraph,
}

/// Runs the three extraction calls for a chapter.
#[derive(Debug, Clone, Default)]
pub struct ExtractionPipeline {
    config: ExtractConfig,
    lexicon: ActionLexicon,
    graph_config: GraphConfig,
}

impl ExtractionPipeline {
    pub fn new(config: ExtractConfig, lexicon: ActionLexicon, graph_config: GraphConfig) -> Self {
        Self {
            config,
            lexicon,
            graph_config,
        }
    }

    /// Extract one chapter. `prior` is the previous chapter's evolved
    /// snapshot, if any.
    pub async fn extract<G: TextGenerator>(
        &self,
        generator: &G,
        chapter_id: u32,
        text: &str,
        prior: Option<&CharacterGraph>,
    ) -> Result<ExtractedChapter, ExtractError> {
        let text = truncate_chars(text, self.config.max_chars);

        let state_wire: StateWire = self
            .call_validated(generator, include_str!("prompts/state.txt"), text, None, |w| {
                validate_state(w)
            })
            .await?;
        let state = state_wire.into_state(chapter_id);
        debug!(
            chapter_id,
            events = state.events.len(),
            relations = state.relations.len(),
            "chapter state extracted"
        );

        let facts_wire: FactsWire = self
            .call_validated(generator, include_str!("prompts/facts.txt"), text, None, |w| {
                validate_facts(w)
            })
            .await?;
        let mut facts = facts_wire.into_facts();
        if facts.len() > self.config.max_facts {
            warn!(
                chapter_id,
                found = facts.len(),
                cap = self.config.max_facts,
                "fact cap exceeded, truncating"
            );
            facts.truncate(self.config.max_facts);
        }
        Fact::renumber(&mut facts);

        let prior_json = prior
            .map(|g| serde_json::to_string_pretty(g).unwrap_or_default())
            .unwrap_or_else(|| "(no prior snapshot; this is the first chapter)".to_string());
        let graph_wire: GraphWire = self
            .call_validated(
                generator,
                include_str!("prompts/graph.txt"),
                text,
                Some(&prior_json),
                |w| validate_graph(w),
            )
            .await?;
        let observed = graph_wire.into_graph(chapter_id);

        let graph = evolve(
            prior,
            chapter_id,
            &state.events,
            &facts,
            &observed,
            &self.lexicon,
            &self.graph_config,
        );

        Ok(ExtractedChapter {
            state,
            facts,
            graph,
        })
    }

    /// One extraction call with timeout, backoff, and corrective
    /// re-prompting on schema violations.
    async fn call_validated<G, W, T, V>(
        &self,
        generator: &G,
        system: &str,
        text: &str,
        prior_json: Option<&str>,
        validate: V,
    ) -> Result<T, ExtractError>
    where
        G: TextGenerator,
        W: for<'de> Deserialize<'de>,
        V: Fn(W) -> Result<T, Vec<SchemaViolation>>,
    {
        let retry = &self.config.retry;
        let mut last_violations: Vec<SchemaViolation> = Vec::new();
        let mut timeouts = 0u32;

        for attempt in 0..retry.max_attempts {
            let delay = retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let prompt = build_prompt(text, prior_json, &last_violations);
            let request = GenerationRequest::new(system, prompt)
                .with_json_mode()
                .with_max_tokens(self.config.max_tokens)
                .with_temperature(self.config.temperature);

            let raw = match tokio::time::timeout(retry.deadline, generator.generate(&request)).await
            {
                Err(_) => {
                    timeouts += 1;
                    warn!(attempt, "extraction call hit deadline");
                    continue;
                }
                Ok(Err(e)) => {
                    if attempt + 1 == retry.max_attempts {
                        return Err(e.into());
                    }
                    warn!(attempt, error = %e, "extraction call failed, retrying");
                    continue;
                }
                Ok(Ok(raw)) => raw,
            };

            let wire: W = match serde_json::from_str(&raw) {
                Ok(wire) => wire,
                Err(e) => {
                    last_violations = vec![SchemaViolation {
                        field: "response".to_string(),
                        message: format!("not a valid JSON document: {e}"),
                    }];
                    continue;
                }
            };

            match validate(wire) {
                Ok(value) => return Ok(value),
                Err(violations) => {
                    debug!(attempt, count = violations.len(), "schema violations");
                    last_violations = violations;
                }
            }
        }

        if !last_violations.is_empty() {
            Err(ExtractError::SchemaValidation {
                attempts: retry.max_attempts,
                violations: last_violations,
            })
        } else {
            Err(ExtractError::Timeout { attempts: timeouts })
        }
    }
}

fn build_prompt(text: &str, prior_json: Option<&str>, violations: &[SchemaViolation]) -> String {
    let mut prompt = String::new();

    prompt.push_str("Allowed relation labels: ");
    prompt.push_str(&RelationKind::all_labels().join(", "));
    prompt.push_str(", or \"other:<short description>\".\n");
    prompt.push_str("Allowed trait labels: ");
    let traits: Vec<&str> = TraitKind::all().iter().map(|t| t.label()).collect();
    prompt.push_str(&traits.join(", "));
    prompt.push_str(".\n\n");

    if let Some(prior) = prior_json {
        prompt.push_str("Prior character snapshot:\n");
        prompt.push_str(prior);
        prompt.push_str("\n\n");
    }

    prompt.push_str("Chapter text:\n");
    prompt.push_str(text);

    if !violations.is_empty() {
        prompt.push_str("\n\nYour previous answer was rejected. Fix these problems and answer again:\n");
        for v in violations {
            prompt.push_str("- ");
            prompt.push_str(&v.to_string());
            prompt.push('\n');
        }
    }

    prompt
}

/// Truncate to at most `max_chars` characters on a char boundary.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

// ============================================================
// Wire schemas
// ============================================================

#[derive(Debug, Deserialize)]
struct StateWire {
    #[serde(default)]
    title: String,
    #[serde(default)]
    events: Vec<EventWire>,
    #[serde(default)]
    relations: Vec<RelationWire>,
    #[serde(default)]
    goals: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    objects: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct EventWire {
    #[serde(default)]
    who: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    goal: Option<String>,
    #[serde(default)]
    polarity: i64,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    precondition: Option<String>,
    #[serde(default)]
    effect: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RelationWire {
    #[serde(default)]
    a: String,
    #[serde(default)]
    b: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    score: f32,
}

#[derive(Debug, Deserialize)]
struct FactsWire {
    #[serde(default)]
    facts: Vec<FactWire>,
}

#[derive(Debug, Deserialize)]
struct FactWire {
    #[serde(default)]
    head: String,
    #[serde(default)]
    relation: String,
    #[serde(default)]
    tail: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    polarity: f32,
    #[serde(default)]
    evidence: String,
}

#[derive(Debug, Deserialize)]
struct GraphWire {
    #[serde(default)]
    characters: Vec<CharacterWire>,
    #[serde(default)]
    relations: Vec<EdgeWire>,
}

#[derive(Debug, Deserialize)]
struct CharacterWire {
    #[serde(default)]
    name: String,
    #[serde(default)]
    combat_power: Option<String>,
    #[serde(default)]
    traits: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EdgeWire {
    #[serde(default)]
    a: String,
    #[serde(default)]
    b: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    evidence: String,
}

// ============================================================
// Validation gate
// ============================================================

fn validate_state(wire: StateWire) -> Result<StateWire, Vec<SchemaViolation>> {
    let mut violations = Vec::new();

    for (i, ev) in wire.events.iter().enumerate() {
        if ev.who.trim().is_empty() {
            violations.push(violation(format!("events[{i}].who"), "must be non-empty"));
        }
        if ev.action.trim().is_empty() {
            violations.push(violation(format!("events[{i}].action"), "must be non-empty"));
        }
        if !(-1..=1).contains(&ev.polarity) {
            violations.push(violation(
                format!("events[{i}].polarity"),
                "must be -1, 0, or 1",
            ));
        }
    }
    for (i, rel) in wire.relations.iter().enumerate() {
        if rel.a.trim().is_empty() || rel.b.trim().is_empty() {
            violations.push(violation(
                format!("relations[{i}]"),
                "both endpoints must be non-empty",
            ));
        }
        if rel.kind.parse::<RelationKind>().is_err() {
            violations.push(violation(
                format!("relations[{i}].type"),
                format!("'{}' is not an allowed relation label", rel.kind),
            ));
        }
        if !(0.0..=1.0).contains(&rel.score) {
            violations.push(violation(
                format!("relations[{i}].score"),
                "must be within [0, 1]",
            ));
        }
    }

    if violations.is_empty() {
        Ok(wire)
    } else {
        Err(violations)
    }
}

fn validate_facts(wire: FactsWire) -> Result<FactsWire, Vec<SchemaViolation>> {
    let mut violations = Vec::new();

    for (i, fact) in wire.facts.iter().enumerate() {
        if fact.head.trim().is_empty() || fact.tail.trim().is_empty() {
            violations.push(violation(
                format!("facts[{i}]"),
                "head and tail must be non-empty character names",
            ));
        }
        if fact.relation.parse::<RelationKind>().is_err() {
            violations.push(violation(
                format!("facts[{i}].relation"),
                format!("'{}' is not an allowed relation label", fact.relation),
            ));
        }
        if !(-1.0..=1.0).contains(&fact.polarity) {
            violations.push(violation(
                format!("facts[{i}].polarity"),
                "must be within [-1, 1]",
            ));
        }
        if fact.evidence.trim().is_empty() {
            violations.push(violation(
                format!("facts[{i}].evidence"),
                "is mandatory and must be non-empty",
            ));
        }
    }

    if violations.is_empty() {
        Ok(wire)
    } else {
        Err(violations)
    }
}

fn validate_graph(wire: GraphWire) -> Result<GraphWire, Vec<SchemaViolation>> {
    let mut violations = Vec::new();

    for (i, ch) in wire.characters.iter().enumerate() {
        if ch.name.trim().is_empty() {
            violations.push(violation(format!("characters[{i}].name"), "must be non-empty"));
        }
        if let Some(power) = &ch.combat_power {
            if power.parse::<CombatPower>().is_err() {
                violations.push(violation(
                    format!("characters[{i}].combat_power"),
                    "must be weak, medium, strong, or unknown",
                ));
            }
        }
        for (j, t) in ch.traits.iter().enumerate() {
            if t.parse::<TraitKind>().is_err() {
                violations.push(violation(
                    format!("characters[{i}].traits[{j}]"),
                    format!("'{t}' is not an allowed trait label"),
                ));
            }
        }
    }
    for (i, edge) in wire.relations.iter().enumerate() {
        if edge.a.trim().is_empty() || edge.b.trim().is_empty() {
            violations.push(violation(
                format!("relations[{i}]"),
                "both endpoints must be non-empty",
            ));
        }
        if edge.kind.parse::<RelationKind>().is_err() {
            violations.push(violation(
                format!("relations[{i}].type"),
                format!("'{}' is not an allowed relation label", edge.kind),
            ));
        }
        if !(0.0..=1.0).contains(&edge.score) {
            violations.push(violation(
                format!("relations[{i}].score"),
                "must be within [0, 1]",
            ));
        }
        if edge.evidence.trim().is_empty() {
            violations.push(violation(
                format!("relations[{i}].evidence"),
                "is mandatory and must be non-empty",
            ));
        }
    }

    if violations.is_empty() {
        Ok(wire)
    } else {
        Err(violations)
    }
}

fn violation(field: String, message: impl Into<String>) -> SchemaViolation {
    SchemaViolation {
        field,
        message: message.into(),
    }
}

// ============================================================
// Wire -> typed conversion (post-validation, so parses cannot fail)
// ============================================================

impl StateWire {
    fn into_state(self, chapter_id: u32) -> ChapterState {
        let mut state = ChapterState::empty(chapter_id, self.title);
        state.events = self
            .events
            .into_iter()
            .map(|ev| Event {
                who: ev.who,
                action: ev.action,
                target: ev.target,
                goal: ev.goal,
                polarity: ev.polarity as i8,
                time: ev.time,
                location: ev.location,
                precondition: ev.precondition,
                effect: ev.effect,
            })
            .collect();
        state.relations = self
            .relations
            .into_iter()
            .filter_map(|rel| {
                let kind = rel.kind.parse::<RelationKind>().ok()?;
                Some(RelationStat {
                    a: rel.a,
                    b: rel.b,
                    kind,
                    score: rel.score,
                })
            })
            .collect();
        state.goals = self.goals;
        state.objects = self.objects;
        state
    }
}

impl FactsWire {
    fn into_facts(self) -> Vec<Fact> {
        self.facts
            .into_iter()
            .filter_map(|fact| {
                let relation = fact.relation.parse::<RelationKind>().ok()?;
                Some(Fact {
                    seq: 0,
                    head: fact.head,
                    relation,
                    tail: fact.tail,
                    meta: FactMeta {
                        location: fact.location,
                        polarity: fact.polarity,
                        evidence: fact.evidence,
                    },
                })
            })
            .collect()
    }
}

impl GraphWire {
    fn into_graph(self, chapter_id: u32) -> CharacterGraph {
        let mut graph = CharacterGraph::empty(chapter_id);
        for ch in self.characters {
            let combat_power = ch
                .combat_power
                .and_then(|p| p.parse::<CombatPower>().ok())
                .unwrap_or_default();
            let traits: BTreeSet<TraitKind> = ch
                .traits
                .iter()
                .filter_map(|t| t.parse::<TraitKind>().ok())
                .collect();
            graph.characters.insert(
                ch.name,
                CharacterAttributes {
                    combat_power,
                    traits,
                    ..Default::default()
                },
            );
        }
        for edge in self.relations {
            if let Ok(kind) = edge.kind.parse::<RelationKind>() {
                graph
                    .edges
                    .push(RelationEdge::new(&edge.a, &edge.b, kind, edge.score, &edge.evidence));
            }
        }
        graph
    }
}

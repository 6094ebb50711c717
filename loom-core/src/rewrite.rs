//! Tail rewriting around an accepted edit.
//!
//! The rewrite prompt carries the character graph as advisory
//! constraints, so the model knows who distrusts whom and who would
//! lose a fight. The generated tail must keep the script's speaker-tag
//! format; a failed validation gets one corrective retry.

use crate::generation::{GenerateError, GenerationRequest, RetryPolicy, TextGenerator};
use crate::graph::CharacterGraph;
use crate::playback::RewriteView;
use crate::vocab::{ActionClass, ActionLexicon};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("rewrite call timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("rewritten tail failed validation: {reason}")]
    Validation { reason: String },

    #[error("rewrite backend failed: {0}")]
    Generation(#[from] GenerateError),
}

/// Advisory inconsistency found in a rewritten tail. Never fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsistencyWarning {
    /// Two characters with a weak relation act cooperatively.
    UnlikelyCooperation { a: String, b: String, score: f32 },
    /// A weaker character engages a clearly stronger one in combat.
    PowerMismatch { weaker: String, stronger: String },
}

impl fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyWarning::UnlikelyCooperation { a, b, score } => write!(
                f,
                "{a} and {b} cooperate despite a relation score of {score:.2}"
            ),
            ConsistencyWarning::PowerMismatch { weaker, stronger } => {
                write!(f, "{weaker} engages the stronger {stronger} in combat")
            }
        }
    }
}

/// A validated rewritten tail plus any advisory warnings.
#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub tail: String,
    pub warnings: Vec<ConsistencyWarning>,
}

/// Rewrite tunables.
#[derive(Debug, Clone)]
pub struct RewriteConfig {
    pub retry: RetryPolicy,
    pub temperature: f32,
    pub max_tokens: u32,
    /// How much revealed prefix to quote as context.
    pub context_chars: usize,
    /// Relation score below which cooperation draws a warning.
    pub low_relation_cutoff: f32,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(500),
                deadline: Duration::from_secs(180),
            },
            temperature: 0.7,
            max_tokens: 8192,
            context_chars: 1200,
            low_relation_cutoff: 0.2,
        }
    }
}

/// Regenerates the chapter tail after an accepted edit.
#[derive(Debug, Clone)]
pub struct RewriteEngine {
    config: RewriteConfig,
    lexicon: ActionLexicon,
    narration_label: String,
}

impl RewriteEngine {
    pub fn new(config: RewriteConfig, lexicon: ActionLexicon, narration_label: impl Into<String>) -> Self {
        Self {
            config,
            lexicon,
            narration_label: narration_label.into(),
        }
    }

    /// Rewrite the tail for an edit, under the graph's constraints.
    pub async fn rewrite<G: TextGenerator>(
        &self,
        generator: &G,
        view: &RewriteView,
        graph: &CharacterGraph,
    ) -> Result<RewriteOutcome, RewriteError> {
        let retry = &self.config.retry;
        let mut last_reason: Option<String> = None;
        let mut timeouts = 0u32;

        for attempt in 0..retry.max_attempts {
            let delay = retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let prompt = self.build_prompt(view, graph, last_reason.as_deref());
            let request = GenerationRequest::new(include_str!("prompts/rewrite.txt"), prompt)
                .with_max_tokens(self.config.max_tokens)
                .with_temperature(self.config.temperature);

            let raw = match tokio::time::timeout(retry.deadline, generator.generate(&request)).await
            {
                Err(_) => {
                    timeouts += 1;
                    warn!(attempt, "rewrite call hit deadline");
                    continue;
                }
                Ok(Err(e)) => {
                    if attempt + 1 == retry.max_attempts {
                        return Err(e.into());
                    }
                    warn!(attempt, error = %e, "rewrite call failed, retrying");
                    continue;
                }
                Ok(Ok(raw)) => raw,
            };

            let tail = raw.trim().to_string();
            match self.validate_tail(&tail, &view.original_tail) {
                Ok(()) => {
                    let warnings = self.scan_warnings(&tail, graph);
                    for w in &warnings {
                        debug!(warning = %w, "rewrite consistency warning");
                    }
                    return Ok(RewriteOutcome { tail, warnings });
                }
                Err(reason) => {
                    warn!(attempt, %reason, "rewritten tail rejected");
                    last_reason = Some(reason);
                }
            }
        }

        match last_reason {
            Some(reason) => Err(RewriteError::Validation { reason }),
            None => Err(RewriteError::Timeout { attempts: timeouts }),
        }
    }

    fn build_prompt(
        &self,
        view: &RewriteView,
        graph: &CharacterGraph,
        rejection: Option<&str>,
    ) -> String {
        let mut prompt = String::new();

        prompt.push_str("Character sheet:\n");
        for (name, attrs) in &graph.characters {
            prompt.push_str(&format!("- {name}: combat power {}", attrs.combat_power));
            if !attrs.traits.is_empty() {
                let traits: Vec<&str> = attrs.traits.iter().map(|t| t.label()).collect();
                prompt.push_str(&format!(", traits: {}", traits.join(", ")));
            }
            if !attrs.inventory.is_empty() {
                let items: Vec<&str> = attrs.inventory.iter().map(String::as_str).collect();
                prompt.push_str(&format!(", carrying: {}", items.join(", ")));
            }
            prompt.push('\n');
        }
        prompt.push_str("\nRelations:\n");
        for edge in &graph.edges {
            prompt.push_str(&format!(
                "- {} / {}: {} (strength {:.2})\n",
                edge.a, edge.b, edge.kind, edge.score
            ));
        }

        let context = tail_chars(&view.prefix, self.config.context_chars);
        prompt.push_str("\nScene so far (excerpt):\n");
        prompt.push_str(context);
        prompt.push_str("\n\nThe reader replaced the next protagonist line with:\n");
        prompt.push_str(&view.replacement);
        prompt.push_str("\n\nOriginal continuation, which you must now rewrite:\n");
        prompt.push_str(&view.original_tail);
        prompt.push_str(&format!(
            "\n\nUse 【{}】 as the narration tag.",
            self.narration_label
        ));

        if let Some(reason) = rejection {
            prompt.push_str(&format!(
                "\n\nYour previous answer was rejected ({reason}). Rewrite it correctly."
            ));
        }

        prompt
    }

    /// Every non-empty line must carry a speaker tag, and narration
    /// must survive if the original tail had any.
    fn validate_tail(&self, tail: &str, original_tail: &str) -> Result<(), String> {
        if tail.trim().is_empty() {
            return Err("rewritten tail is empty".to_string());
        }
        for (i, line) in tail.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !line.starts_with('【') || !line.contains('】') {
                return Err(format!("line {} lacks a 【name】 speaker tag", i + 1));
            }
        }

        let narration_tag = format!("【{}】", self.narration_label);
        let original_had_narration = original_tail
            .lines()
            .any(|l| l.trim_start().starts_with(&narration_tag));
        if original_had_narration && !tail.contains(&narration_tag) {
            return Err(format!(
                "original tail had {narration_tag} narration but the rewrite has none"
            ));
        }
        Ok(())
    }

    /// Heuristic scan of a validated tail against the graph.
    fn scan_warnings(&self, tail: &str, graph: &CharacterGraph) -> Vec<ConsistencyWarning> {
        let mut warnings = Vec::new();
        let names: Vec<&String> = graph.characters.keys().collect();

        for line in tail.lines() {
            let mentioned: Vec<&str> = names
                .iter()
                .filter(|n| line.contains(n.as_str()))
                .map(|n| n.as_str())
                .collect();
            if mentioned.len() < 2 {
                continue;
            }
            let class = self.lexicon.classify(line);

            for i in 0..mentioned.len() {
                for j in i + 1..mentioned.len() {
                    let (a, b) = (mentioned[i], mentioned[j]);
                    match class {
                        Some(ActionClass::Cooperation) => {
                            if let Some(score) = graph.relation_score(a, b) {
                                if score < self.config.low_relation_cutoff {
                                    warnings.push(ConsistencyWarning::UnlikelyCooperation {
                                        a: a.to_string(),
                                        b: b.to_string(),
                                        score,
                                    });
                                }
                            }
                        }
                        Some(ActionClass::Combat) => {
                            let pa = graph.combat_power(a);
                            let pb = graph.combat_power(b);
                            if pa.outranks(pb) {
                                warnings.push(ConsistencyWarning::PowerMismatch {
                                    weaker: b.to_string(),
                                    stronger: a.to_string(),
                                });
                            } else if pb.outranks(pa) {
                                warnings.push(ConsistencyWarning::PowerMismatch {
                                    weaker: a.to_string(),
                                    stronger: b.to_string(),
                                });
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        warnings
    }
}

/// Last `max_chars` characters of a string, on a char boundary.
fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((byte_idx, _)) => &text[byte_idx..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CharacterAttributes, RelationEdge};
    use crate::vocab::{CombatPower, RelationKind};

    fn engine() -> RewriteEngine {
        RewriteEngine::new(RewriteConfig::default(), ActionLexicon::default(), "Narrator")
    }

    fn loot_house_graph() -> CharacterGraph {
        let mut graph = CharacterGraph::empty(2);
        graph.characters.insert(
            "Subaru".to_string(),
            CharacterAttributes {
                combat_power: CombatPower::Weak,
                ..Default::default()
            },
        );
        graph.characters.insert(
            "Elsa".to_string(),
            CharacterAttributes {
                combat_power: CombatPower::Strong,
                ..Default::default()
            },
        );
        graph.edges.push(RelationEdge::new(
            "Subaru",
            "Elsa",
            RelationKind::Hostility,
            0.1,
            "she gutted him once already",
        ));
        graph
    }

    #[test]
    fn test_validate_rejects_untagged_lines() {
        let engine = engine();
        let err = engine
            .validate_tail("【Subaru】Here goes.\nHe charged forward.", "【Subaru】...")
            .unwrap_err();
        assert!(err.contains("line 2"));
    }

    #[test]
    fn test_validate_requires_surviving_narration() {
        let engine = engine();
        let original = "【Narrator】The room fell silent.\n【Subaru】...";
        assert!(engine.validate_tail("【Subaru】I'm leaving.", original).is_err());
        assert!(engine
            .validate_tail("【Narrator】He left.\n【Subaru】I'm leaving.", original)
            .is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_tail() {
        let engine = engine();
        assert!(engine.validate_tail("  \n ", "【Subaru】...").is_err());
    }

    #[test]
    fn test_warning_on_weak_attacking_strong() {
        let engine = engine();
        let tail = "【Narrator】Subaru attacks Elsa head on.";
        let warnings = engine.scan_warnings(tail, &loot_house_graph());
        assert_eq!(
            warnings,
            vec![ConsistencyWarning::PowerMismatch {
                weaker: "Subaru".to_string(),
                stronger: "Elsa".to_string(),
            }]
        );
    }

    #[test]
    fn test_warning_on_low_relation_cooperation() {
        let engine = engine();
        let tail = "【Narrator】Elsa moves to protect Subaru from the blast.";
        let warnings = engine.scan_warnings(tail, &loot_house_graph());
        assert!(matches!(
            warnings[0],
            ConsistencyWarning::UnlikelyCooperation { .. }
        ));
    }

    #[test]
    fn test_prompt_carries_graph_and_guidance() {
        let engine = engine();
        let view = RewriteView {
            prefix: "【Narrator】The loot house door creaked open.".to_string(),
            original_tail: "【Elsa】My, what nice bowels you must have.".to_string(),
            replacement: "【Subaru】I brought backup this time!".to_string(),
        };
        let prompt = engine.build_prompt(&view, &loot_house_graph(), None);
        assert!(prompt.contains("combat power strong"));
        assert!(prompt.contains("Elsa / Subaru"));
        assert!(prompt.contains("I brought backup this time!"));
        assert!(prompt.contains("【Narrator】"));
    }
}

//! Event feasibility scoring.
//!
//! A cheap, fully deterministic screen over extracted events: given
//! the current graph and object table, how plausible is this event?
//! The verdict is advisory. Callers log it and surface it to the
//! reader; nothing in the engine hard-blocks on a low score.

use crate::graph::CharacterGraph;
use crate::state::Event;
use crate::vocab::{ActionClass, ActionLexicon};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scoring weights. All adjustments apply to a 0.5 baseline and the
/// result clamps to [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeasibilityConfig {
    /// Scores at or above this pass.
    pub threshold: f32,
    /// Bonus when the actor outranks the combat target (and penalty
    /// in the opposite direction).
    pub combat_edge_bonus: f32,
    /// Penalty for cooperation across a weak relation.
    pub low_relation_penalty: f32,
    /// Penalty for a precondition the object table cannot back.
    pub missing_precondition_penalty: f32,
    /// Relation score below which cooperation counts as unlikely.
    pub low_relation_cutoff: f32,
}

impl Default for FeasibilityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            combat_edge_bonus: 0.2,
            low_relation_penalty: 0.3,
            missing_precondition_penalty: 0.4,
            low_relation_cutoff: 0.2,
        }
    }
}

/// Verdict for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feasibility {
    pub ok: bool,
    pub score: f32,
    /// Human-readable adjustments that produced the score.
    pub reasons: Vec<String>,
}

/// Score one event against the graph and object table.
///
/// Deterministic: the same inputs always produce the same verdict.
pub fn evaluate(
    event: &Event,
    graph: &CharacterGraph,
    objects: &BTreeMap<String, String>,
    lexicon: &ActionLexicon,
    config: &FeasibilityConfig,
) -> Feasibility {
    let mut score = 0.5f32;
    let mut reasons = Vec::new();
    let class = lexicon.classify(&event.action);

    if let (Some(ActionClass::Combat), Some(target)) = (class, &event.target) {
        let actor_power = graph.combat_power(&event.who);
        let target_power = graph.combat_power(target);
        if actor_power.outranks(target_power) {
            score += config.combat_edge_bonus;
            reasons.push(format!(
                "{} ({actor_power}) outranks {target} ({target_power})",
                event.who
            ));
        } else if target_power.outranks(actor_power) {
            score -= config.combat_edge_bonus;
            reasons.push(format!(
                "{} ({actor_power}) is outmatched by {target} ({target_power})",
                event.who
            ));
        }
    }

    if let (Some(ActionClass::Cooperation), Some(target)) = (class, &event.target) {
        if let Some(relation) = graph.relation_score(&event.who, target) {
            if relation < config.low_relation_cutoff {
                score -= config.low_relation_penalty;
                reasons.push(format!(
                    "{} and {target} have a weak relation ({relation:.2})",
                    event.who
                ));
            }
        }
    }

    if let Some(precondition) = &event.precondition {
        let backed = objects.keys().any(|obj| precondition.contains(obj));
        if !backed {
            score -= config.missing_precondition_penalty;
            reasons.push(format!(
                "precondition '{precondition}' is not backed by any tracked object"
            ));
        }
    }

    let score = score.clamp(0.0, 1.0);
    Feasibility {
        ok: score >= config.threshold,
        score,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CharacterAttributes;
    use crate::vocab::CombatPower;

    fn graph_with_powers(pairs: &[(&str, CombatPower)]) -> CharacterGraph {
        let mut graph = CharacterGraph::empty(1);
        for (name, power) in pairs {
            graph.characters.insert(
                name.to_string(),
                CharacterAttributes {
                    combat_power: *power,
                    ..Default::default()
                },
            );
        }
        graph
    }

    #[test]
    fn test_weak_attacking_strong_fails_threshold() {
        let graph = graph_with_powers(&[
            ("Subaru", CombatPower::Weak),
            ("Elsa", CombatPower::Strong),
        ]);
        let event = Event::new("Subaru", "attack").with_target("Elsa");
        let verdict = evaluate(
            &event,
            &graph,
            &BTreeMap::new(),
            &ActionLexicon::default(),
            &FeasibilityConfig::default(),
        );
        assert!(verdict.score < 0.5);
        assert!(!verdict.ok);
        assert!(!verdict.reasons.is_empty());
    }

    #[test]
    fn test_strong_attacking_weak_gets_bonus() {
        let graph = graph_with_powers(&[
            ("Reinhard", CombatPower::Strong),
            ("Elsa", CombatPower::Medium),
        ]);
        let event = Event::new("Reinhard", "subdue").with_target("Elsa");
        let verdict = evaluate(
            &event,
            &graph,
            &BTreeMap::new(),
            &ActionLexicon::default(),
            &FeasibilityConfig::default(),
        );
        assert!(verdict.ok);
        assert!((verdict.score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_missing_precondition_penalized() {
        let graph = CharacterGraph::empty(1);
        let mut objects = BTreeMap::new();
        objects.insert("insignia".to_string(), "held by Felt".to_string());

        let backed = Event::new("Felt", "sell")
            .with_target("insignia")
            .with_precondition("holds the insignia");
        let verdict = evaluate(
            &backed,
            &graph,
            &objects,
            &ActionLexicon::default(),
            &FeasibilityConfig::default(),
        );
        assert!(verdict.ok);

        let unbacked = Event::new("Felt", "sell")
            .with_target("crown")
            .with_precondition("holds the royal crown");
        let verdict = evaluate(
            &unbacked,
            &graph,
            &objects,
            &ActionLexicon::default(),
            &FeasibilityConfig::default(),
        );
        assert!(!verdict.ok);
        assert!((verdict.score - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let graph = graph_with_powers(&[("Rom", CombatPower::Medium)]);
        let event = Event::new("Rom", "help").with_target("Felt");
        let objects = BTreeMap::new();
        let lexicon = ActionLexicon::default();
        let config = FeasibilityConfig::default();
        let a = evaluate(&event, &graph, &objects, &lexicon, &config);
        let b = evaluate(&event, &graph, &objects, &lexicon, &config);
        assert_eq!(a, b);
    }
}

//! Character graph snapshots.
//!
//! Each chapter produces one snapshot: per-character attributes plus a
//! set of undirected relation edges. Snapshots evolve by folding a new
//! chapter's events, facts, and observed graph into the prior chapter's
//! snapshot under evolution rules that only the evidence can trigger.

use crate::state::Event;
use crate::tkg::Fact;
use crate::vocab::{ActionClass, ActionLexicon, CombatPower, RelationKind, TraitKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================
// Attributes
// ============================================================

/// Per-character attributes tracked across chapters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CharacterAttributes {
    #[serde(default)]
    pub combat_power: CombatPower,
    /// Items currently held. Acquisition events add, loss events remove.
    #[serde(default)]
    pub inventory: BTreeSet<String>,
    /// Confirmed personality traits. Traits accumulate, never vanish.
    #[serde(default)]
    pub traits: BTreeSet<TraitKind>,
    /// Observation counts for traits not yet confirmed.
    #[serde(default)]
    pub trait_evidence: BTreeMap<TraitKind, u32>,
}

// ============================================================
// Edges
// ============================================================

/// One archived revision of an edge, kept when its kind changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRevision {
    #[serde(rename = "type")]
    pub kind: RelationKind,
    pub score: f32,
    pub evidence: String,
}

/// An undirected relation edge between two characters.
///
/// Endpoints are stored in canonical (lexicographic) order so that a
/// pair has exactly one edge regardless of mention order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEdge {
    pub a: String,
    pub b: String,
    #[serde(rename = "type")]
    pub kind: RelationKind,
    /// Strength within [0, 1].
    pub score: f32,
    pub evidence: String,
    /// Prior revisions, oldest first. Populated when the kind changes.
    #[serde(default)]
    pub history: Vec<EdgeRevision>,
}

impl RelationEdge {
    pub fn new(a: &str, b: &str, kind: RelationKind, score: f32, evidence: &str) -> Self {
        let (a, b) = canonical_pair(a, b);
        Self {
            a,
            b,
            kind,
            score: score.clamp(0.0, 1.0),
            evidence: evidence.to_string(),
            history: Vec::new(),
        }
    }

    pub fn involves_pair(&self, x: &str, y: &str) -> bool {
        let (x, y) = canonical_pair(x, y);
        self.a == x && self.b == y
    }

    /// Replace the kind, archiving the current revision first.
    pub fn retype(&mut self, kind: RelationKind, score: f32, evidence: &str) {
        self.history.push(EdgeRevision {
            kind: self.kind.clone(),
            score: self.score,
            evidence: std::mem::take(&mut self.evidence),
        });
        self.kind = kind;
        self.score = score.clamp(0.0, 1.0);
        self.evidence = evidence.to_string();
    }
}

fn canonical_pair(x: &str, y: &str) -> (String, String) {
    if x <= y {
        (x.to_string(), y.to_string())
    } else {
        (y.to_string(), x.to_string())
    }
}

// ============================================================
// Snapshot
// ============================================================

/// Complete character graph for one chapter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CharacterGraph {
    pub chapter_id: u32,
    pub characters: BTreeMap<String, CharacterAttributes>,
    /// Edges sorted by canonical pair.
    pub edges: Vec<RelationEdge>,
}

impl CharacterGraph {
    pub fn empty(chapter_id: u32) -> Self {
        Self {
            chapter_id,
            ..Default::default()
        }
    }

    pub fn find_edge(&self, a: &str, b: &str) -> Option<&RelationEdge> {
        self.edges.iter().find(|e| e.involves_pair(a, b))
    }

    fn find_edge_mut(&mut self, a: &str, b: &str) -> Option<&mut RelationEdge> {
        self.edges.iter_mut().find(|e| e.involves_pair(a, b))
    }

    /// Relation score between two characters, if an edge exists.
    pub fn relation_score(&self, a: &str, b: &str) -> Option<f32> {
        self.find_edge(a, b).map(|e| e.score)
    }

    pub fn combat_power(&self, name: &str) -> CombatPower {
        self.characters
            .get(name)
            .map(|c| c.combat_power)
            .unwrap_or_default()
    }

    fn attrs_mut(&mut self, name: &str) -> &mut CharacterAttributes {
        self.characters.entry(name.to_string()).or_default()
    }

    fn sort_edges(&mut self) {
        self.edges
            .sort_by(|x, y| (&x.a, &x.b).cmp(&(&y.a, &y.b)));
    }
}

// ============================================================
// Evolution
// ============================================================

/// Tunables for snapshot evolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Observations required before a trait is confirmed.
    pub trait_threshold: u32,
    /// Score delta applied per unit of fact polarity.
    pub evidence_weight: f32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            trait_threshold: 2,
            evidence_weight: 0.1,
        }
    }
}

/// Fold one chapter into the prior snapshot.
///
/// Pure and deterministic: the same inputs always yield the same
/// snapshot. Evolution rules:
///
/// - Combat power upgrades only when the observed graph reports a
///   higher rank AND a combat-class event involves that character this
///   chapter. Power never downgrades.
/// - Inventory changes only through acquisition and loss events naming
///   the item as the event target.
/// - Observed traits accumulate evidence; a trait is confirmed at the
///   threshold and never removed afterward.
/// - Edge scores move by `polarity * evidence_weight` per fact between
///   the pair, clamped to [0, 1].
/// - An observed kind that differs from the current edge kind retypes
///   the edge, archiving the prior revision.
pub fn evolve(
    prior: Option<&CharacterGraph>,
    chapter_id: u32,
    events: &[Event],
    facts: &[Fact],
    observed: &CharacterGraph,
    lexicon: &ActionLexicon,
    config: &GraphConfig,
) -> CharacterGraph {
    let mut next = prior.cloned().unwrap_or_default();
    next.chapter_id = chapter_id;

    // Everyone the observed graph mentions exists in the snapshot.
    for name in observed.characters.keys() {
        next.attrs_mut(name);
    }

    let combatants = combat_participants(events, lexicon);

    // Attribute evolution.
    for (name, seen) in &observed.characters {
        let trait_threshold = config.trait_threshold;
        let attrs = next.attrs_mut(name);

        let seen_rank = seen.combat_power.rank();
        let have_rank = attrs.combat_power.rank();
        let upgrade = match (seen_rank, have_rank) {
            (Some(s), Some(h)) => s > h,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if upgrade && combatants.contains(name.as_str()) {
            attrs.combat_power = seen.combat_power;
        }

        for t in seen.traits.iter().chain(seen.trait_evidence.keys()) {
            if attrs.traits.contains(t) {
                continue;
            }
            let count = attrs.trait_evidence.entry(t.clone()).or_insert(0);
            *count += 1;
            if *count >= trait_threshold {
                attrs.traits.insert(t.clone());
                attrs.trait_evidence.remove(t);
            }
        }
    }

    // Inventory is event-driven only.
    for event in events {
        let item = match &event.target {
            Some(t) => t,
            None => continue,
        };
        match lexicon.classify(&event.action) {
            Some(ActionClass::Acquisition) => {
                next.attrs_mut(&event.who).inventory.insert(item.clone());
            }
            Some(ActionClass::Loss) => {
                next.attrs_mut(&event.who).inventory.remove(item);
            }
            _ => {}
        }
    }

    // Edge kind and existence come from the observed graph.
    for seen in &observed.edges {
        next.attrs_mut(&seen.a);
        next.attrs_mut(&seen.b);
        match next.find_edge_mut(&seen.a, &seen.b) {
            Some(edge) => {
                if edge.kind != seen.kind {
                    edge.retype(seen.kind.clone(), seen.score, &seen.evidence);
                } else {
                    edge.evidence = seen.evidence.clone();
                }
            }
            None => next.edges.push(RelationEdge::new(
                &seen.a,
                &seen.b,
                seen.kind.clone(),
                seen.score,
                &seen.evidence,
            )),
        }
    }

    // Scores drift with fact polarity.
    for fact in facts {
        if let Some(edge) = next.find_edge_mut(&fact.head, &fact.tail) {
            edge.score =
                (edge.score + fact.meta.polarity * config.evidence_weight).clamp(0.0, 1.0);
        }
    }

    next.sort_edges();
    next
}

fn combat_participants<'a>(
    events: &'a [Event],
    lexicon: &ActionLexicon,
) -> BTreeSet<&'a str> {
    let mut out = BTreeSet::new();
    for event in events {
        if lexicon.classify(&event.action) == Some(ActionClass::Combat) {
            out.insert(event.who.as_str());
            if let Some(t) = &event.target {
                out.insert(t.as_str());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tkg::FactMeta;

    fn observed_with_power(name: &str, power: CombatPower) -> CharacterGraph {
        let mut g = CharacterGraph::empty(2);
        g.characters.insert(
            name.to_string(),
            CharacterAttributes {
                combat_power: power,
                ..Default::default()
            },
        );
        g
    }

    fn combat_event(who: &str, target: &str) -> Event {
        Event::new(who, "attack").with_target(target)
    }

    #[test]
    fn test_power_upgrade_requires_combat_event() {
        let lexicon = ActionLexicon::default();
        let config = GraphConfig::default();
        let observed = observed_with_power("Rom", CombatPower::Strong);

        // No combat event: upgrade rejected.
        let graph = evolve(None, 2, &[], &[], &observed, &lexicon, &config);
        assert_eq!(graph.combat_power("Rom"), CombatPower::Unknown);

        // Combat event involving Rom: upgrade accepted.
        let events = vec![combat_event("Rom", "Elsa")];
        let graph = evolve(None, 2, &events, &[], &observed, &lexicon, &config);
        assert_eq!(graph.combat_power("Rom"), CombatPower::Strong);
    }

    #[test]
    fn test_power_never_downgrades() {
        let lexicon = ActionLexicon::default();
        let config = GraphConfig::default();

        let mut prior = CharacterGraph::empty(1);
        prior.characters.insert(
            "Elsa".to_string(),
            CharacterAttributes {
                combat_power: CombatPower::Strong,
                ..Default::default()
            },
        );

        let observed = observed_with_power("Elsa", CombatPower::Weak);
        let events = vec![combat_event("Elsa", "Rom")];
        let graph = evolve(Some(&prior), 2, &events, &[], &observed, &lexicon, &config);
        assert_eq!(graph.combat_power("Elsa"), CombatPower::Strong);
    }

    #[test]
    fn test_inventory_is_event_driven() {
        let lexicon = ActionLexicon::default();
        let config = GraphConfig::default();
        let observed = CharacterGraph::empty(2);

        let events = vec![
            Event::new("Felt", "steal").with_target("insignia"),
            Event::new("Felt", "sell").with_target("insignia"),
            Event::new("Subaru", "obtain").with_target("appa"),
        ];
        let graph = evolve(None, 2, &events, &[], &observed, &lexicon, &config);
        assert!(!graph.characters["Felt"].inventory.contains("insignia"));
        assert!(graph.characters["Subaru"].inventory.contains("appa"));
    }

    #[test]
    fn test_traits_confirm_at_threshold_and_persist() {
        let lexicon = ActionLexicon::default();
        let config = GraphConfig::default();

        let mut observed = CharacterGraph::empty(2);
        observed.characters.insert(
            "Emilia".to_string(),
            CharacterAttributes {
                traits: BTreeSet::from([TraitKind::Kind]),
                ..Default::default()
            },
        );

        let g1 = evolve(None, 1, &[], &[], &observed, &lexicon, &config);
        assert!(!g1.characters["Emilia"].traits.contains(&TraitKind::Kind));
        assert_eq!(g1.characters["Emilia"].trait_evidence[&TraitKind::Kind], 1);

        let g2 = evolve(Some(&g1), 2, &[], &[], &observed, &lexicon, &config);
        assert!(g2.characters["Emilia"].traits.contains(&TraitKind::Kind));

        // Absent from later observations: the trait stays.
        let empty = CharacterGraph::empty(3);
        let g3 = evolve(Some(&g2), 3, &[], &[], &empty, &lexicon, &config);
        assert!(g3.characters["Emilia"].traits.contains(&TraitKind::Kind));
    }

    #[test]
    fn test_edge_scores_drift_with_polarity_and_clamp() {
        let lexicon = ActionLexicon::default();
        let config = GraphConfig::default();

        let mut observed = CharacterGraph::empty(1);
        observed.edges.push(RelationEdge::new(
            "Emilia",
            "Subaru",
            RelationKind::Trust,
            0.95,
            "he returned the insignia",
        ));

        let fact = Fact {
            seq: 1,
            head: "Subaru".to_string(),
            relation: RelationKind::Trust,
            tail: "Emilia".to_string(),
            meta: FactMeta {
                location: None,
                polarity: 1.0,
                evidence: "he took the blow for her".to_string(),
            },
        };
        let graph = evolve(None, 1, &[], &[fact], &observed, &lexicon, &config);
        // 0.95 + 1.0 * 0.1, clamped.
        assert_eq!(graph.relation_score("Subaru", "Emilia"), Some(1.0));
    }

    #[test]
    fn test_retype_archives_history() {
        let lexicon = ActionLexicon::default();
        let config = GraphConfig::default();

        let mut prior = CharacterGraph::empty(1);
        prior.edges.push(RelationEdge::new(
            "Elsa",
            "Felt",
            RelationKind::Cooperation,
            0.5,
            "she hired her for the job",
        ));

        let mut observed = CharacterGraph::empty(2);
        observed.edges.push(RelationEdge::new(
            "Elsa",
            "Felt",
            RelationKind::Hostility,
            0.8,
            "she turned her blade on her",
        ));

        let graph = evolve(Some(&prior), 2, &[], &[], &observed, &lexicon, &config);
        let edge = graph.find_edge("Felt", "Elsa").unwrap();
        assert_eq!(edge.kind, RelationKind::Hostility);
        assert_eq!(edge.history.len(), 1);
        assert_eq!(edge.history[0].kind, RelationKind::Cooperation);
    }

    #[test]
    fn test_evolve_is_deterministic() {
        let lexicon = ActionLexicon::default();
        let config = GraphConfig::default();
        let mut observed = CharacterGraph::empty(1);
        observed.edges.push(RelationEdge::new(
            "Rom",
            "Felt",
            RelationKind::Protection,
            0.9,
            "he has watched over her for years",
        ));
        let events = vec![Event::new("Felt", "steal").with_target("insignia")];

        let a = evolve(None, 1, &events, &[], &observed, &lexicon, &config);
        let b = evolve(None, 1, &events, &[], &observed, &lexicon, &config);
        assert_eq!(a, b);
    }
}

//! Chapter state data model.
//!
//! A `ChapterState` is the structured snapshot extracted from one
//! chapter of narrative text: its events, relation snapshot, character
//! goals, and key object statuses. States are immutable once committed;
//! an accepted edit produces a new state for the same chapter on the
//! derivative branch.

use crate::branch::Branch;
use crate::vocab::RelationKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single narrative event: who did what, to whom, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub who: String,
    pub action: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
    /// Emotional polarity of the event: -1, 0, or 1.
    #[serde(default)]
    pub polarity: i8,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub precondition: Option<String>,
    #[serde(default)]
    pub effect: Option<String>,
}

impl Event {
    /// Create a minimal event.
    pub fn new(who: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            who: who.into(),
            action: action.into(),
            target: None,
            goal: None,
            polarity: 0,
            time: None,
            location: None,
            precondition: None,
            effect: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_precondition(mut self, precondition: impl Into<String>) -> Self {
        self.precondition = Some(precondition.into());
        self
    }

    pub fn with_effect(mut self, effect: impl Into<String>) -> Self {
        self.effect = Some(effect.into());
        self
    }
}

/// One entry of a chapter's relation snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationStat {
    pub a: String,
    pub b: String,
    #[serde(rename = "type")]
    pub kind: RelationKind,
    /// Relation strength, always within [0, 1].
    pub score: f32,
}

impl RelationStat {
    /// Whether this entry is between the given unordered pair.
    pub fn involves_pair(&self, a: &str, b: &str) -> bool {
        (self.a == a && self.b == b) || (self.a == b && self.b == a)
    }
}

/// Provenance metadata attached to a chapter state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMeta {
    pub branch: Branch,
    /// What produced this state ("extraction", "rewrite", ...).
    pub source: String,
}

impl Default for StateMeta {
    fn default() -> Self {
        Self {
            branch: Branch::Original,
            source: "extraction".to_string(),
        }
    }
}

/// The structured state of one chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterState {
    pub chapter_id: u32,
    pub title: String,
    pub events: Vec<Event>,
    pub relations: Vec<RelationStat>,
    /// Character name -> stated goals for this chapter.
    pub goals: BTreeMap<String, Vec<String>>,
    /// Key object or setting name -> short status phrase.
    pub objects: BTreeMap<String, String>,
    pub meta: StateMeta,
}

impl ChapterState {
    /// Create an empty state for a chapter.
    pub fn empty(chapter_id: u32, title: impl Into<String>) -> Self {
        Self {
            chapter_id,
            title: title.into(),
            events: Vec::new(),
            relations: Vec::new(),
            goals: BTreeMap::new(),
            objects: BTreeMap::new(),
            meta: StateMeta::default(),
        }
    }

    /// Look up the relation entry for an unordered pair.
    pub fn relation_between(&self, a: &str, b: &str) -> Option<&RelationStat> {
        self.relations.iter().find(|r| r.involves_pair(a, b))
    }

    /// Status phrase for a named object, if tracked.
    pub fn object_status(&self, object: &str) -> Option<&str> {
        self.objects.get(object).map(String::as_str)
    }

    /// All character names appearing in events, relations, or goals.
    pub fn character_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        };

        for event in &self.events {
            push(&event.who);
            if let Some(target) = &event.target {
                push(target);
            }
        }
        for relation in &self.relations {
            push(&relation.a);
            push(&relation.b);
        }
        for who in self.goals.keys() {
            push(who);
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = Event::new("Subaru", "defeats")
            .with_target("Elsa")
            .with_precondition("badge: held by Felt");

        assert_eq!(event.who, "Subaru");
        assert_eq!(event.target.as_deref(), Some("Elsa"));
        assert_eq!(event.polarity, 0);
    }

    #[test]
    fn test_relation_lookup_is_unordered() {
        let mut state = ChapterState::empty(1, "Arrival");
        state.relations.push(RelationStat {
            a: "Subaru".to_string(),
            b: "Emilia".to_string(),
            kind: RelationKind::Trust,
            score: 0.6,
        });

        assert!(state.relation_between("Emilia", "Subaru").is_some());
        assert!(state.relation_between("Subaru", "Felt").is_none());
    }

    #[test]
    fn test_character_names_deduplicated() {
        let mut state = ChapterState::empty(1, "Arrival");
        state.events.push(Event::new("Subaru", "greets").with_target("Emilia"));
        state.events.push(Event::new("Subaru", "follows").with_target("Felt"));
        state.goals.insert("Emilia".to_string(), vec!["recover the badge".to_string()]);

        let names = state.character_names();
        assert_eq!(names, vec!["Subaru", "Emilia", "Felt"]);
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let mut state = ChapterState::empty(2, "The Loot House");
        state.objects.insert("badge".to_string(), "held by Felt".to_string());
        state.meta.branch = Branch::Derivative;

        let json = serde_json::to_string(&state).unwrap();
        let back: ChapterState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert!(json.contains("user_branch") || json.contains("derivative"));
    }
}

//! Closed vocabularies for extraction output.
//!
//! Extraction is only trusted when its labels come from these closed
//! sets. Anything outside the vocabulary is a schema violation and gets
//! re-requested from the generator rather than coerced.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Error for a label outside its closed vocabulary.
#[derive(Debug, Clone, Error)]
#[error("'{label}' is not in the {vocabulary} vocabulary")]
pub struct VocabError {
    pub label: String,
    pub vocabulary: &'static str,
}

// ============================================================================
// Relation kinds
// ============================================================================

/// Closed vocabulary of relation labels.
///
/// `Other` is the single escape hatch, serialized as `other:<text>`,
/// for relations that genuinely fit nothing else.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RelationKind {
    Trust,
    Gratitude,
    Companion,
    Opposition,
    Intimacy,
    Hatred,
    Fear,
    Suppression,
    Protection,
    Dependence,
    Rivalry,
    Cooperation,
    Mentorship,
    Kinship,
    Love,
    Friendship,
    Hostility,
    Neutral,
    Respect,
    Contempt,
    Other(String),
}

impl RelationKind {
    /// Canonical label for this relation kind.
    pub fn label(&self) -> &str {
        match self {
            RelationKind::Trust => "trust",
            RelationKind::Gratitude => "gratitude",
            RelationKind::Companion => "companion",
            RelationKind::Opposition => "opposition",
            RelationKind::Intimacy => "intimacy",
            RelationKind::Hatred => "hatred",
            RelationKind::Fear => "fear",
            RelationKind::Suppression => "suppression",
            RelationKind::Protection => "protection",
            RelationKind::Dependence => "dependence",
            RelationKind::Rivalry => "rivalry",
            RelationKind::Cooperation => "cooperation",
            RelationKind::Mentorship => "mentorship",
            RelationKind::Kinship => "kinship",
            RelationKind::Love => "love",
            RelationKind::Friendship => "friendship",
            RelationKind::Hostility => "hostility",
            RelationKind::Neutral => "neutral",
            RelationKind::Respect => "respect",
            RelationKind::Contempt => "contempt",
            RelationKind::Other(text) => text,
        }
    }

    /// All canonical labels, for prompt construction.
    pub fn all_labels() -> Vec<&'static str> {
        vec![
            "trust",
            "gratitude",
            "companion",
            "opposition",
            "intimacy",
            "hatred",
            "fear",
            "suppression",
            "protection",
            "dependence",
            "rivalry",
            "cooperation",
            "mentorship",
            "kinship",
            "love",
            "friendship",
            "hostility",
            "neutral",
            "respect",
            "contempt",
        ]
    }

    /// Check if this is a hostile relation kind.
    pub fn is_hostile(&self) -> bool {
        matches!(
            self,
            RelationKind::Opposition
                | RelationKind::Hatred
                | RelationKind::Hostility
                | RelationKind::Rivalry
                | RelationKind::Suppression
                | RelationKind::Contempt
        )
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationKind::Other(text) => write!(f, "other:{text}"),
            _ => f.write_str(self.label()),
        }
    }
}

impl FromStr for RelationKind {
    type Err = VocabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim() {
            "trust" => RelationKind::Trust,
            "gratitude" => RelationKind::Gratitude,
            "companion" => RelationKind::Companion,
            "opposition" => RelationKind::Opposition,
            "intimacy" => RelationKind::Intimacy,
            "hatred" => RelationKind::Hatred,
            "fear" => RelationKind::Fear,
            "suppression" => RelationKind::Suppression,
            "protection" => RelationKind::Protection,
            "dependence" => RelationKind::Dependence,
            "rivalry" => RelationKind::Rivalry,
            "cooperation" => RelationKind::Cooperation,
            "mentorship" => RelationKind::Mentorship,
            "kinship" => RelationKind::Kinship,
            "love" => RelationKind::Love,
            "friendship" => RelationKind::Friendship,
            "hostility" => RelationKind::Hostility,
            "neutral" => RelationKind::Neutral,
            "respect" => RelationKind::Respect,
            "contempt" => RelationKind::Contempt,
            other => {
                if let Some(text) = other.strip_prefix("other:") {
                    let text = text.trim();
                    if text.is_empty() {
                        return Err(VocabError {
                            label: s.to_string(),
                            vocabulary: "relation",
                        });
                    }
                    RelationKind::Other(text.to_string())
                } else {
                    return Err(VocabError {
                        label: s.to_string(),
                        vocabulary: "relation",
                    });
                }
            }
        };
        Ok(kind)
    }
}

impl TryFrom<String> for RelationKind {
    type Error = VocabError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RelationKind> for String {
    fn from(kind: RelationKind) -> Self {
        kind.to_string()
    }
}

// ============================================================================
// Personality traits
// ============================================================================

/// Closed vocabulary of personality traits. No escape hatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraitKind {
    Impulsive,
    Reliable,
    Disciplined,
    Brave,
    Cautious,
    Clever,
    Foolish,
    Kind,
    Cruel,
    Loyal,
    Treacherous,
    Resolute,
    Fragile,
    Optimistic,
    Pessimistic,
    Calm,
    Rash,
    Honest,
    Cunning,
    Generous,
    Stingy,
    Arrogant,
    Humble,
    Stubborn,
    Flexible,
    Curious,
    Aloof,
    Passionate,
    Rational,
    Sentimental,
}

impl TraitKind {
    /// Canonical label for this trait.
    pub fn label(&self) -> &'static str {
        match self {
            TraitKind::Impulsive => "impulsive",
            TraitKind::Reliable => "reliable",
            TraitKind::Disciplined => "disciplined",
            TraitKind::Brave => "brave",
            TraitKind::Cautious => "cautious",
            TraitKind::Clever => "clever",
            TraitKind::Foolish => "foolish",
            TraitKind::Kind => "kind",
            TraitKind::Cruel => "cruel",
            TraitKind::Loyal => "loyal",
            TraitKind::Treacherous => "treacherous",
            TraitKind::Resolute => "resolute",
            TraitKind::Fragile => "fragile",
            TraitKind::Optimistic => "optimistic",
            TraitKind::Pessimistic => "pessimistic",
            TraitKind::Calm => "calm",
            TraitKind::Rash => "rash",
            TraitKind::Honest => "honest",
            TraitKind::Cunning => "cunning",
            TraitKind::Generous => "generous",
            TraitKind::Stingy => "stingy",
            TraitKind::Arrogant => "arrogant",
            TraitKind::Humble => "humble",
            TraitKind::Stubborn => "stubborn",
            TraitKind::Flexible => "flexible",
            TraitKind::Curious => "curious",
            TraitKind::Aloof => "aloof",
            TraitKind::Passionate => "passionate",
            TraitKind::Rational => "rational",
            TraitKind::Sentimental => "sentimental",
        }
    }

    /// All trait kinds, for prompt construction.
    pub fn all() -> &'static [TraitKind] {
        use TraitKind::*;
        &[
            Impulsive,
            Reliable,
            Disciplined,
            Brave,
            Cautious,
            Clever,
            Foolish,
            Kind,
            Cruel,
            Loyal,
            Treacherous,
            Resolute,
            Fragile,
            Optimistic,
            Pessimistic,
            Calm,
            Rash,
            Honest,
            Cunning,
            Generous,
            Stingy,
            Arrogant,
            Humble,
            Stubborn,
            Flexible,
            Curious,
            Aloof,
            Passionate,
            Rational,
            Sentimental,
        ]
    }
}

impl fmt::Display for TraitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TraitKind {
    type Err = VocabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TraitKind::all()
            .iter()
            .find(|t| t.label() == s.trim())
            .copied()
            .ok_or_else(|| VocabError {
                label: s.to_string(),
                vocabulary: "trait",
            })
    }
}

// ============================================================================
// Combat power
// ============================================================================

/// Ordinal combat power level.
///
/// `Unknown` never wins an ordering comparison; only the three known
/// levels are comparable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombatPower {
    Weak,
    Medium,
    Strong,
    #[default]
    Unknown,
}

impl CombatPower {
    /// Ordinal rank, if known.
    pub fn rank(&self) -> Option<u8> {
        match self {
            CombatPower::Weak => Some(0),
            CombatPower::Medium => Some(1),
            CombatPower::Strong => Some(2),
            CombatPower::Unknown => None,
        }
    }

    /// Whether this power level is strictly above the other.
    ///
    /// Unknown on either side yields false.
    pub fn outranks(&self, other: CombatPower) -> bool {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CombatPower::Weak => "weak",
            CombatPower::Medium => "medium",
            CombatPower::Strong => "strong",
            CombatPower::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CombatPower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CombatPower {
    type Err = VocabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "weak" => Ok(CombatPower::Weak),
            "medium" => Ok(CombatPower::Medium),
            "strong" => Ok(CombatPower::Strong),
            "unknown" => Ok(CombatPower::Unknown),
            _ => Err(VocabError {
                label: s.to_string(),
                vocabulary: "combat_power",
            }),
        }
    }
}

// ============================================================================
// Action lexicon
// ============================================================================

/// Classification of an event action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    /// Gains an item (pick up, receive, loot, ...).
    Acquisition,
    /// Loses or hands off an item.
    Loss,
    /// Direct combat (attack, defeat, subdue, ...).
    Combat,
    /// Requires willing cooperation between participants.
    Cooperation,
}

/// Configurable word lists that classify event actions.
///
/// Classification is a lowercase substring match against each list, so
/// "picks up" matches the "pick up" lexeme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLexicon {
    pub acquisition: BTreeSet<String>,
    pub loss: BTreeSet<String>,
    pub combat: BTreeSet<String>,
    pub cooperation: BTreeSet<String>,
}

impl Default for ActionLexicon {
    fn default() -> Self {
        fn set(words: &[&str]) -> BTreeSet<String> {
            words.iter().map(|w| w.to_string()).collect()
        }

        Self {
            acquisition: set(&[
                "obtain", "acquire", "pick up", "take", "receive", "grab", "loot", "find",
                "steal", "buy", "claim",
            ]),
            loss: set(&[
                "lose", "drop", "give", "hand over", "surrender", "transfer", "sell",
                "discard", "relinquish",
            ]),
            combat: set(&[
                "attack", "defeat", "strike", "fight", "kill", "subdue", "wound",
                "overpower", "duel", "ambush", "repel",
            ]),
            cooperation: set(&[
                "cooperate", "help", "assist", "ally", "team up", "rescue", "protect",
                "support", "join", "aid",
            ]),
        }
    }
}

impl ActionLexicon {
    /// Load a lexicon from a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(std::io::Error::other)
    }

    /// Classify an action phrase. Combat wins over cooperation when a
    /// phrase matches both lists; acquisition wins over loss.
    pub fn classify(&self, action: &str) -> Option<ActionClass> {
        let action = action.to_lowercase();
        let hit = |set: &BTreeSet<String>| set.iter().any(|lexeme| action.contains(lexeme));

        if hit(&self.combat) {
            Some(ActionClass::Combat)
        } else if hit(&self.acquisition) {
            Some(ActionClass::Acquisition)
        } else if hit(&self.loss) {
            Some(ActionClass::Loss)
        } else if hit(&self.cooperation) {
            Some(ActionClass::Cooperation)
        } else {
            None
        }
    }
}

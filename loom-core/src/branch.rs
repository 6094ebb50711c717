//! Worldline branch management.
//!
//! Every chapter has at most two timelines: the write-once `Original`
//! branch and the editable `Derivative` branch. Which one a write
//! targets is decided purely by whether the chapter has accumulated
//! user edits.

use crate::state::{ChapterState, Event, RelationStat};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One of the two timelines a chapter can live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Branch {
    /// The untouched chapter as first extracted. Write-once.
    #[serde(rename = "canon")]
    Original,
    /// The user-edited timeline. Last-writer-wins per chapter.
    #[serde(rename = "user_branch")]
    Derivative,
}

impl Branch {
    /// On-disk directory name for this branch.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Branch::Original => "canon",
            Branch::Derivative => "user_branch",
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Original => f.write_str("original"),
            Branch::Derivative => f.write_str("derivative"),
        }
    }
}

/// Errors from branch routing and write protection.
#[derive(Debug, Error)]
pub enum BranchError {
    #[error("chapter {chapter_id} already has a committed original; the original branch is write-once")]
    ImmutableBranch { chapter_id: u32 },
}

/// Routes writes to the correct branch and protects the original.
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchManager;

impl BranchManager {
    pub fn new() -> Self {
        Self
    }

    /// Select the branch a chapter write should target.
    ///
    /// A chapter with no accumulated edits writes to the original;
    /// any edit at all moves it to the derivative.
    pub fn select(&self, edit_count: u32) -> Branch {
        if edit_count == 0 {
            Branch::Original
        } else {
            Branch::Derivative
        }
    }

    /// Enforce write-once semantics for the original branch.
    pub fn guard_write(
        &self,
        branch: Branch,
        chapter_id: u32,
        original_committed: bool,
    ) -> Result<(), BranchError> {
        if branch == Branch::Original && original_committed {
            return Err(BranchError::ImmutableBranch { chapter_id });
        }
        Ok(())
    }

    /// Compare two chapter states without mutating either.
    pub fn diff(&self, original: &ChapterState, derivative: &ChapterState) -> StateDiff {
        StateDiff::between(original, derivative)
    }
}

/// A change to a relation entry between two states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationChange {
    pub a: String,
    pub b: String,
    pub before: Option<RelationStat>,
    pub after: Option<RelationStat>,
}

/// Read-only comparison of an original and a derivative state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDiff {
    pub added_events: Vec<Event>,
    pub removed_events: Vec<Event>,
    pub relation_changes: Vec<RelationChange>,
    pub added_goals: Vec<(String, String)>,
    pub removed_goals: Vec<(String, String)>,
    pub changed_objects: Vec<(String, Option<String>, Option<String>)>,
}

impl StateDiff {
    /// Compute the diff between two states for the same chapter.
    pub fn between(original: &ChapterState, derivative: &ChapterState) -> Self {
        let mut diff = StateDiff::default();

        for event in &derivative.events {
            if !original.events.contains(event) {
                diff.added_events.push(event.clone());
            }
        }
        for event in &original.events {
            if !derivative.events.contains(event) {
                diff.removed_events.push(event.clone());
            }
        }

        // Relation entries are matched on the unordered participant pair.
        for after in &derivative.relations {
            let before = original.relation_between(&after.a, &after.b);
            if before != Some(after) {
                diff.relation_changes.push(RelationChange {
                    a: after.a.clone(),
                    b: after.b.clone(),
                    before: before.cloned(),
                    after: Some(after.clone()),
                });
            }
        }
        for before in &original.relations {
            if derivative.relation_between(&before.a, &before.b).is_none() {
                diff.relation_changes.push(RelationChange {
                    a: before.a.clone(),
                    b: before.b.clone(),
                    before: Some(before.clone()),
                    after: None,
                });
            }
        }

        for (who, goals) in &derivative.goals {
            for goal in goals {
                let had = original.goals.get(who).is_some_and(|g| g.contains(goal));
                if !had {
                    diff.added_goals.push((who.clone(), goal.clone()));
                }
            }
        }
        for (who, goals) in &original.goals {
            for goal in goals {
                let has = derivative.goals.get(who).is_some_and(|g| g.contains(goal));
                if !has {
                    diff.removed_goals.push((who.clone(), goal.clone()));
                }
            }
        }

        for (object, status) in &derivative.objects {
            match original.objects.get(object) {
                Some(old) if old == status => {}
                old => diff.changed_objects.push((
                    object.clone(),
                    old.cloned(),
                    Some(status.clone()),
                )),
            }
        }
        for (object, status) in &original.objects {
            if !derivative.objects.contains_key(object) {
                diff.changed_objects
                    .push((object.clone(), Some(status.clone()), None));
            }
        }

        diff
    }

    /// Whether the two states are identical.
    pub fn is_empty(&self) -> bool {
        self.added_events.is_empty()
            && self.removed_events.is_empty()
            && self.relation_changes.is_empty()
            && self.added_goals.is_empty()
            && self.removed_goals.is_empty()
            && self.changed_objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateMeta;
    use crate::vocab::RelationKind;

    fn state(chapter_id: u32, branch: Branch) -> ChapterState {
        ChapterState {
            chapter_id,
            title: "Chapter".to_string(),
            events: Vec::new(),
            relations: Vec::new(),
            goals: Default::default(),
            objects: Default::default(),
            meta: StateMeta {
                branch,
                source: "test".to_string(),
            },
        }
    }

    #[test]
    fn test_select_original_only_when_unedited() {
        let manager = BranchManager::new();
        assert_eq!(manager.select(0), Branch::Original);
        for edit_count in 1..=5 {
            assert_eq!(manager.select(edit_count), Branch::Derivative);
        }
        // Stable across repeated calls.
        assert_eq!(manager.select(0), Branch::Original);
        assert_eq!(manager.select(3), Branch::Derivative);
    }

    #[test]
    fn test_guard_rejects_second_original_write() {
        let manager = BranchManager::new();
        assert!(manager.guard_write(Branch::Original, 1, false).is_ok());
        assert!(matches!(
            manager.guard_write(Branch::Original, 1, true),
            Err(BranchError::ImmutableBranch { chapter_id: 1 })
        ));
        // Derivative rewrites are always allowed.
        assert!(manager.guard_write(Branch::Derivative, 1, true).is_ok());
    }

    #[test]
    fn test_diff_detects_event_and_object_changes() {
        let mut original = state(1, Branch::Original);
        original.events.push(Event::new("Subaru", "searches for the badge"));
        original
            .objects
            .insert("badge".to_string(), "missing".to_string());

        let mut derivative = state(1, Branch::Derivative);
        derivative.events.push(Event::new("Subaru", "bargains with Felt"));
        derivative
            .objects
            .insert("badge".to_string(), "held by Felt".to_string());

        let diff = BranchManager::new().diff(&original, &derivative);
        assert_eq!(diff.added_events.len(), 1);
        assert_eq!(diff.removed_events.len(), 1);
        assert_eq!(diff.changed_objects.len(), 1);
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_diff_of_identical_states_is_empty() {
        let mut a = state(1, Branch::Original);
        a.relations.push(RelationStat {
            a: "Subaru".to_string(),
            b: "Emilia".to_string(),
            kind: RelationKind::Trust,
            score: 0.6,
        });
        let mut b = a.clone();
        b.meta.branch = Branch::Derivative;

        assert!(BranchManager::new().diff(&a, &b).is_empty());
    }
}

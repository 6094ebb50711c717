//! Story session: the top-level engine surface.
//!
//! A [`StorySession`] owns the generator, the store, and one chapter's
//! playback at a time, and wires the whole loop together: play chunks,
//! accept an edit, rewrite the tail, re-extract, screen feasibility,
//! and commit to the branch the edit count selects. All mutating
//! operations take `&mut self`, so a session serializes its own
//! state changes.

use crate::branch::{Branch, BranchError, BranchManager, StateDiff};
use crate::extract::{ExtractConfig, ExtractError, ExtractedChapter, ExtractionPipeline};
use crate::feasibility::{evaluate, Feasibility, FeasibilityConfig};
use crate::generation::TextGenerator;
use crate::graph::{CharacterGraph, GraphConfig};
use crate::persist::{CommitReceipt, PersistError, WorldStore};
use crate::playback::{PlaybackEngine, PlaybackError};
use crate::rewrite::{ConsistencyWarning, RewriteConfig, RewriteEngine, RewriteError};
use crate::state::{ChapterState, Event};
use crate::tkg::Fact;
use crate::vocab::ActionLexicon;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Branch(#[from] BranchError),

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("no chapter is loaded")]
    NoChapterLoaded,

    #[error("chapter {requested} is not the loaded chapter {loaded}")]
    WrongChapter { requested: u32, loaded: u32 },
}

/// Session configuration, builder style.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub protagonist: String,
    pub narration_label: String,
    pub edit_cap: u32,
    pub store_root: PathBuf,
    pub extract: ExtractConfig,
    pub rewrite: RewriteConfig,
    pub graph: GraphConfig,
    pub feasibility: FeasibilityConfig,
    pub lexicon: ActionLexicon,
}

impl SessionConfig {
    pub fn new(protagonist: impl Into<String>, store_root: impl Into<PathBuf>) -> Self {
        Self {
            protagonist: protagonist.into(),
            narration_label: "Narrator".to_string(),
            edit_cap: crate::playback::DEFAULT_EDIT_CAP,
            store_root: store_root.into(),
            extract: ExtractConfig::default(),
            rewrite: RewriteConfig::default(),
            graph: GraphConfig::default(),
            feasibility: FeasibilityConfig::default(),
            lexicon: ActionLexicon::default(),
        }
    }

    pub fn with_narration_label(mut self, label: impl Into<String>) -> Self {
        self.narration_label = label.into();
        self
    }

    pub fn with_edit_cap(mut self, cap: u32) -> Self {
        self.edit_cap = cap;
        self
    }

    pub fn with_extract(mut self, extract: ExtractConfig) -> Self {
        self.extract = extract;
        self
    }

    pub fn with_rewrite(mut self, rewrite: RewriteConfig) -> Self {
        self.rewrite = rewrite;
        self
    }

    pub fn with_feasibility(mut self, feasibility: FeasibilityConfig) -> Self {
        self.feasibility = feasibility;
        self
    }

    pub fn with_lexicon(mut self, lexicon: ActionLexicon) -> Self {
        self.lexicon = lexicon;
        self
    }
}

/// What a commit produced: the receipt plus feasibility flags raised
/// while screening the extracted events. Flags are advisory.
#[derive(Debug, Clone)]
pub struct CommitReport {
    pub receipt: CommitReceipt,
    pub flagged: Vec<(Event, Feasibility)>,
}

/// What an accepted edit produced.
#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub warnings: Vec<ConsistencyWarning>,
    pub report: CommitReport,
}

/// One reader's interactive pass over a story.
pub struct StorySession<G: TextGenerator> {
    generator: G,
    config: SessionConfig,
    store: WorldStore,
    pipeline: ExtractionPipeline,
    rewriter: RewriteEngine,
    branches: BranchManager,
    playback: Option<PlaybackEngine>,
}

impl<G: TextGenerator> StorySession<G> {
    /// Open a session backed by a store at the configured root.
    pub async fn open(generator: G, config: SessionConfig) -> Result<Self, SessionError> {
        let store = WorldStore::open(&config.store_root).await?;
        let pipeline = ExtractionPipeline::new(
            config.extract.clone(),
            config.lexicon.clone(),
            config.graph.clone(),
        );
        let rewriter = RewriteEngine::new(
            config.rewrite.clone(),
            config.lexicon.clone(),
            config.narration_label.clone(),
        );
        Ok(Self {
            generator,
            config,
            store,
            pipeline,
            rewriter,
            branches: BranchManager::new(),
            playback: None,
        })
    }

    /// Load a chapter's script for playback. Replaces any chapter in
    /// progress and starts a fresh edit session.
    pub fn load_chapter(&mut self, chapter_id: u32, text: &str) {
        info!(chapter_id, "chapter loaded");
        self.playback = Some(
            PlaybackEngine::new(chapter_id, text, self.config.protagonist.clone())
                .with_edit_cap(self.config.edit_cap),
        );
    }

    pub fn playback(&self) -> Option<&PlaybackEngine> {
        self.playback.as_ref()
    }

    /// Reveal the next chunk of the loaded chapter.
    pub fn next(&mut self) -> Result<&str, SessionError> {
        let playback = self.playback.as_mut().ok_or(SessionError::NoChapterLoaded)?;
        Ok(playback.next()?)
    }

    /// Restore the loaded chapter's baseline text and edit quota.
    pub fn reset_chapter(&mut self) -> Result<(), SessionError> {
        let playback = self.playback.as_mut().ok_or(SessionError::NoChapterLoaded)?;
        playback.reset();
        Ok(())
    }

    /// Accept an edit of the current chunk's protagonist line.
    ///
    /// Admission, rewrite, splice, re-extraction, feasibility
    /// screening, and commit run as one operation; the playback
    /// resumes at the edited chunk on success and is restored on any
    /// failure after admission.
    pub async fn accept_edit(
        &mut self,
        chapter_id: u32,
        marker_text: &str,
        replacement: &str,
    ) -> Result<EditOutcome, SessionError> {
        {
            let playback = self.playback.as_mut().ok_or(SessionError::NoChapterLoaded)?;
            let loaded = playback.session().chapter_id;
            if loaded != chapter_id {
                return Err(SessionError::WrongChapter {
                    requested: chapter_id,
                    loaded,
                });
            }
            playback.request_edit(marker_text, replacement)?;
        }
        let graph = self.graph_for_chapter(chapter_id).await;

        let playback = self.playback.as_mut().ok_or(SessionError::NoChapterLoaded)?;
        let view = playback.confirm_edit()?;
        let outcome = match self.rewriter.rewrite(&self.generator, &view, &graph).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Roll playback back so the reader can try again.
                if let Some(p) = self.playback.as_mut() {
                    let _ = p.abort_edit();
                }
                return Err(e.into());
            }
        };

        // Snapshot so a failed extraction or commit leaves no trace of
        // the splice.
        let snapshot = self.playback.clone();
        let playback = self.playback.as_mut().ok_or(SessionError::NoChapterLoaded)?;
        playback.complete_rewrite(&outcome.tail)?;

        let report = match self.commit_current().await {
            Ok(report) => report,
            Err(e) => {
                self.playback = snapshot;
                if let Some(p) = self.playback.as_mut() {
                    let _ = p.abort_edit();
                }
                return Err(e);
            }
        };
        Ok(EditOutcome {
            warnings: outcome.warnings,
            report,
        })
    }

    /// Extract and commit the loaded chapter as it currently reads.
    ///
    /// The branch is chosen from the edit count: untouched chapters
    /// commit to the original, edited ones to the derivative.
    pub async fn commit_chapter(&mut self) -> Result<CommitReport, SessionError> {
        self.commit_current().await
    }

    async fn commit_current(&mut self) -> Result<CommitReport, SessionError> {
        let (chapter_id, edit_count, content) = {
            let playback = self.playback.as_ref().ok_or(SessionError::NoChapterLoaded)?;
            (
                playback.session().chapter_id,
                playback.session().edit_count,
                playback.content().to_string(),
            )
        };

        let prior = self.prior_graph(chapter_id).await;
        let extracted = self
            .pipeline
            .extract(&self.generator, chapter_id, &content, prior.as_ref())
            .await?;

        let flagged = self.screen_events(&extracted);
        let branch = self.branches.select(edit_count);
        let receipt = self.store.commit(branch, &extracted).await?;
        Ok(CommitReport { receipt, flagged })
    }

    /// Advisory feasibility screen over extracted events.
    fn screen_events(&self, extracted: &ExtractedChapter) -> Vec<(Event, Feasibility)> {
        let mut flagged = Vec::new();
        for event in &extracted.state.events {
            let verdict = evaluate(
                event,
                &extracted.graph,
                &extracted.state.objects,
                &self.config.lexicon,
                &self.config.feasibility,
            );
            if !verdict.ok {
                warn!(
                    who = %event.who,
                    action = %event.action,
                    score = verdict.score,
                    "implausible event flagged"
                );
                flagged.push((event.clone(), verdict));
            }
        }
        flagged
    }

    /// Best available snapshot for the chapter being played: its own
    /// committed graph if any, else the previous chapter's.
    async fn graph_for_chapter(&self, chapter_id: u32) -> CharacterGraph {
        for branch in [Branch::Derivative, Branch::Original] {
            if let Ok(graph) = self.store.load_graph(branch, chapter_id).await {
                return graph;
            }
        }
        self.prior_graph(chapter_id)
            .await
            .unwrap_or_else(|| CharacterGraph::empty(chapter_id))
    }

    /// The previous chapter's evolved snapshot, derivative preferred.
    async fn prior_graph(&self, chapter_id: u32) -> Option<CharacterGraph> {
        let prev = chapter_id.checked_sub(1).filter(|p| *p > 0)?;
        for branch in [Branch::Derivative, Branch::Original] {
            if let Ok(graph) = self.store.load_graph(branch, prev).await {
                return Some(graph);
            }
        }
        None
    }

    // ------------------------------------------------------------
    // Read-only store access
    // ------------------------------------------------------------

    pub async fn chapter_state(
        &self,
        branch: Branch,
        chapter_id: u32,
    ) -> Result<ChapterState, PersistError> {
        self.store.load_state(branch, chapter_id).await
    }

    pub async fn chapter_graph(
        &self,
        branch: Branch,
        chapter_id: u32,
    ) -> Result<CharacterGraph, PersistError> {
        self.store.load_graph(branch, chapter_id).await
    }

    /// Committed facts for a chapter, in sequence order.
    pub fn chapter_facts(
        &self,
        branch: Branch,
        chapter_id: u32,
    ) -> Result<Vec<Fact>, PersistError> {
        self.store.facts(branch, chapter_id)?.collect()
    }

    /// Diff a chapter's two committed branches.
    pub async fn diff(&self, chapter_id: u32) -> Result<StateDiff, PersistError> {
        let original = self.store.load_state(Branch::Original, chapter_id).await?;
        let derivative = self.store.load_state(Branch::Derivative, chapter_id).await?;
        Ok(self.branches.diff(&original, &derivative))
    }

    pub fn store(&self) -> &WorldStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::DEFAULT_EDIT_CAP;

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::new("Subaru", "/tmp/worldline")
            .with_edit_cap(3)
            .with_narration_label("NA");
        assert_eq!(config.protagonist, "Subaru");
        assert_eq!(config.edit_cap, 3);
        assert_eq!(config.narration_label, "NA");

        let defaults = SessionConfig::new("Subaru", "/tmp/worldline");
        assert_eq!(defaults.edit_cap, DEFAULT_EDIT_CAP);
        assert_eq!(defaults.narration_label, "Narrator");
    }

    #[tokio::test]
    async fn test_ops_without_chapter_fail() {
        let mock = crate::testing::MockGenerator::new();
        let dir = tempfile::TempDir::new().unwrap();
        let mut session = StorySession::open(mock, SessionConfig::new("Subaru", dir.path()))
            .await
            .unwrap();

        assert!(matches!(session.next(), Err(SessionError::NoChapterLoaded)));
        assert!(matches!(
            session.commit_chapter().await,
            Err(SessionError::NoChapterLoaded)
        ));
    }
}

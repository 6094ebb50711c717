//! Worldline persistence.
//!
//! On-disk layout under the store root:
//!
//! ```text
//! world_graph/<branch>/chapter_NNN.json           chapter state
//! tkg/<branch>/chapter_NNN.tkg.jsonl              fact log
//! graphs/<branch>/chapter_NNN.characters.json     graph nodes
//! graphs/<branch>/chapter_NNN.relations.json      graph edges
//! index.json                                      per-branch index
//! ```
//!
//! A commit is all-or-nothing: every file is staged to a `.tmp`
//! sibling first and only renamed into place once all writes succeed.

use crate::branch::{Branch, BranchError, BranchManager};
use crate::extract::ExtractedChapter;
use crate::graph::{CharacterAttributes, CharacterGraph, RelationEdge};
use crate::state::ChapterState;
use crate::tkg::{FactStream, TkgStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

/// Current save file version.
const SAVE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Chapter {chapter_id} has no committed data on the {branch} branch")]
    MissingChapter { branch: Branch, chapter_id: u32 },

    #[error(transparent)]
    Branch(#[from] BranchError),
}

/// Versioned chapter state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDoc {
    pub version: u32,
    pub saved_at: String,
    pub state: ChapterState,
}

/// Versioned graph-node document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CharactersDoc {
    version: u32,
    chapter_id: u32,
    saved_at: String,
    characters: BTreeMap<String, CharacterAttributes>,
}

/// Versioned graph-edge document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelationsDoc {
    version: u32,
    chapter_id: u32,
    saved_at: String,
    edges: Vec<RelationEdge>,
}

/// Per-branch summary kept in `index.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchIndex {
    pub chapters: Vec<u32>,
    pub characters: BTreeSet<String>,
    pub relation_kinds: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexDoc {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    branches: BTreeMap<String, BranchIndex>,
}

/// Proof of a committed chapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub commit_id: Uuid,
    pub branch: Branch,
    pub chapter_id: u32,
    pub saved_at: String,
}

/// Disk-backed store for chapter states, fact logs, and graphs.
#[derive(Debug)]
pub struct WorldStore {
    root: PathBuf,
    tkg: TkgStore,
    branches: BranchManager,
}

impl WorldStore {
    /// Open (or initialize) a store rooted at the given directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let root = root.into();
        for branch in [Branch::Original, Branch::Derivative] {
            fs::create_dir_all(root.join("world_graph").join(branch.dir_name())).await?;
            fs::create_dir_all(root.join("graphs").join(branch.dir_name())).await?;
        }
        let tkg = TkgStore::new(&root);
        tkg.ensure_dirs().await?;
        Ok(Self {
            root,
            tkg,
            branches: BranchManager::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, branch: Branch, chapter_id: u32) -> PathBuf {
        self.root
            .join("world_graph")
            .join(branch.dir_name())
            .join(format!("chapter_{chapter_id:03}.json"))
    }

    fn graph_path(&self, branch: Branch, chapter_id: u32, part: &str) -> PathBuf {
        self.root
            .join("graphs")
            .join(branch.dir_name())
            .join(format!("chapter_{chapter_id:03}.{part}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    /// Whether a chapter state is committed on the branch.
    pub fn has_state(&self, branch: Branch, chapter_id: u32) -> bool {
        self.state_path(branch, chapter_id).exists()
    }

    /// Commit one extracted chapter to a branch, atomically.
    ///
    /// The original branch is write-once per chapter; a second commit
    /// there fails with [`BranchError::ImmutableBranch`]. The
    /// derivative branch is last-writer-wins.
    pub async fn commit(
        &self,
        branch: Branch,
        extracted: &ExtractedChapter,
    ) -> Result<CommitReceipt, PersistError> {
        let chapter_id = extracted.state.chapter_id;
        self.branches.guard_write(
            branch,
            chapter_id,
            self.has_state(Branch::Original, chapter_id),
        )?;

        let saved_at = unix_timestamp();
        let mut state = extracted.state.clone();
        state.meta.branch = branch;

        let state_doc = StateDoc {
            version: SAVE_VERSION,
            saved_at: saved_at.clone(),
            state,
        };
        let characters_doc = CharactersDoc {
            version: SAVE_VERSION,
            chapter_id,
            saved_at: saved_at.clone(),
            characters: extracted.graph.characters.clone(),
        };
        let relations_doc = RelationsDoc {
            version: SAVE_VERSION,
            chapter_id,
            saved_at: saved_at.clone(),
            edges: extracted.graph.edges.clone(),
        };
        let index_doc = self.updated_index(branch, extracted).await?;

        let staged: Vec<(PathBuf, String)> = vec![
            (
                self.state_path(branch, chapter_id),
                serde_json::to_string_pretty(&state_doc)?,
            ),
            (
                self.tkg.chapter_path(branch, chapter_id),
                TkgStore::encode(&extracted.facts)?,
            ),
            (
                self.graph_path(branch, chapter_id, "characters"),
                serde_json::to_string_pretty(&characters_doc)?,
            ),
            (
                self.graph_path(branch, chapter_id, "relations"),
                serde_json::to_string_pretty(&relations_doc)?,
            ),
            (self.index_path(), serde_json::to_string_pretty(&index_doc)?),
        ];

        // Stage everything before renaming anything.
        for (path, content) in &staged {
            fs::write(tmp_path(path), content).await?;
        }
        for (path, _) in &staged {
            fs::rename(tmp_path(path), path).await?;
        }

        let receipt = CommitReceipt {
            commit_id: Uuid::new_v4(),
            branch,
            chapter_id,
            saved_at,
        };
        info!(
            commit_id = %receipt.commit_id,
            %branch,
            chapter_id,
            facts = extracted.facts.len(),
            "chapter committed"
        );
        Ok(receipt)
    }

    /// Load a committed chapter state.
    pub async fn load_state(
        &self,
        branch: Branch,
        chapter_id: u32,
    ) -> Result<ChapterState, PersistError> {
        let content = self
            .read_chapter_file(self.state_path(branch, chapter_id), branch, chapter_id)
            .await?;
        let doc: StateDoc = serde_json::from_str(&content)?;
        check_version(doc.version)?;
        Ok(doc.state)
    }

    /// Load a committed character graph.
    pub async fn load_graph(
        &self,
        branch: Branch,
        chapter_id: u32,
    ) -> Result<CharacterGraph, PersistError> {
        let chars = self
            .read_chapter_file(
                self.graph_path(branch, chapter_id, "characters"),
                branch,
                chapter_id,
            )
            .await?;
        let rels = self
            .read_chapter_file(
                self.graph_path(branch, chapter_id, "relations"),
                branch,
                chapter_id,
            )
            .await?;
        let characters_doc: CharactersDoc = serde_json::from_str(&chars)?;
        let relations_doc: RelationsDoc = serde_json::from_str(&rels)?;
        check_version(characters_doc.version)?;
        check_version(relations_doc.version)?;
        Ok(CharacterGraph {
            chapter_id,
            characters: characters_doc.characters,
            edges: relations_doc.edges,
        })
    }

    /// Stream a chapter's committed facts in sequence order.
    pub fn facts(&self, branch: Branch, chapter_id: u32) -> Result<FactStream, PersistError> {
        if !self.tkg.has_chapter(branch, chapter_id) {
            return Err(PersistError::MissingChapter { branch, chapter_id });
        }
        self.tkg.stream(branch, chapter_id)
    }

    /// Read the per-branch index.
    pub async fn index(&self) -> Result<BTreeMap<String, BranchIndex>, PersistError> {
        Ok(self.load_index().await?.branches)
    }

    async fn load_index(&self) -> Result<IndexDoc, PersistError> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(IndexDoc {
                version: SAVE_VERSION,
                branches: BTreeMap::new(),
            });
        }
        let content = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn updated_index(
        &self,
        branch: Branch,
        extracted: &ExtractedChapter,
    ) -> Result<IndexDoc, PersistError> {
        let mut doc = self.load_index().await?;
        doc.version = SAVE_VERSION;
        let entry = doc.branches.entry(branch.dir_name().to_string()).or_default();
        let chapter_id = extracted.state.chapter_id;
        if !entry.chapters.contains(&chapter_id) {
            entry.chapters.push(chapter_id);
            entry.chapters.sort_unstable();
        }
        entry
            .characters
            .extend(extracted.graph.characters.keys().cloned());
        entry
            .relation_kinds
            .extend(extracted.graph.edges.iter().map(|e| e.kind.to_string()));
        Ok(doc)
    }

    async fn read_chapter_file(
        &self,
        path: PathBuf,
        branch: Branch,
        chapter_id: u32,
    ) -> Result<String, PersistError> {
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PersistError::MissingChapter { branch, chapter_id })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn check_version(found: u32) -> Result<(), PersistError> {
    if found != SAVE_VERSION {
        return Err(PersistError::VersionMismatch {
            expected: SAVE_VERSION,
            found,
        });
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Current timestamp as seconds since the Unix epoch.
fn unix_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_secs())
}

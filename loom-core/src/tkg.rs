//! Time-stamped knowledge log.
//!
//! Facts are the atomic units of the worldline: (head, relation, tail)
//! statements with mandatory evidence, numbered by a per-chapter
//! monotonic sequence. The log is append-only per (branch, chapter),
//! stored as one JSONL file per key, and read back as a lazy,
//! restartable, sequence-ordered stream.

use crate::branch::Branch;
use crate::persist::PersistError;
use crate::vocab::RelationKind;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::{Path, PathBuf};

/// Cap on facts extracted per chapter.
pub const MAX_FACTS_PER_CHAPTER: usize = 60;

/// Metadata carried by every fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactMeta {
    #[serde(default)]
    pub location: Option<String>,
    /// Emotional polarity of the statement, within [-1, 1].
    pub polarity: f32,
    /// Supporting text from the chapter. Never empty.
    pub evidence: String,
}

/// A time-stamped relation fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Monotonic per-chapter sequence number, starting at 1.
    /// Sequence order is the canonical event order.
    pub seq: u64,
    pub head: String,
    pub relation: RelationKind,
    pub tail: String,
    pub meta: FactMeta,
}

impl Fact {
    /// Assign sequence numbers 1..=n in place, preserving order.
    pub fn renumber(facts: &mut [Fact]) {
        for (idx, fact) in facts.iter_mut().enumerate() {
            fact.seq = idx as u64 + 1;
        }
    }
}

/// Append-only fact log, one JSONL file per (branch, chapter).
#[derive(Debug, Clone)]
pub struct TkgStore {
    root: PathBuf,
}

impl TkgStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the fact log for a (branch, chapter) key.
    pub fn chapter_path(&self, branch: Branch, chapter_id: u32) -> PathBuf {
        self.root
            .join("tkg")
            .join(branch.dir_name())
            .join(format!("chapter_{chapter_id:03}.tkg.jsonl"))
    }

    /// Ensure the branch directories exist.
    pub async fn ensure_dirs(&self) -> Result<(), PersistError> {
        for branch in [Branch::Original, Branch::Derivative] {
            tokio::fs::create_dir_all(self.root.join("tkg").join(branch.dir_name())).await?;
        }
        Ok(())
    }

    /// Encode a fact slice as JSONL, one fact per line.
    pub fn encode(facts: &[Fact]) -> Result<String, PersistError> {
        let mut out = String::new();
        for fact in facts {
            out.push_str(&serde_json::to_string(fact)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Whether the chapter has a committed fact log on the branch.
    pub fn has_chapter(&self, branch: Branch, chapter_id: u32) -> bool {
        self.chapter_path(branch, chapter_id).exists()
    }

    /// Open a lazy, restartable stream over a chapter's facts.
    ///
    /// The stream yields facts in file order, which is sequence order:
    /// appends are sequential within a key and facts are renumbered
    /// before commit. Calling this again restarts from the beginning.
    pub fn stream(&self, branch: Branch, chapter_id: u32) -> Result<FactStream, PersistError> {
        let path = self.chapter_path(branch, chapter_id);
        FactStream::open(&path)
    }
}

/// Lazy iterator over a chapter's fact log.
pub struct FactStream {
    lines: std::io::Lines<std::io::BufReader<std::fs::File>>,
}

impl FactStream {
    fn open(path: &Path) -> Result<Self, PersistError> {
        let file = std::fs::File::open(path)?;
        Ok(Self {
            lines: std::io::BufReader::new(file).lines(),
        })
    }
}

impl Iterator for FactStream {
    type Item = Result<Fact, PersistError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(&line).map_err(PersistError::from));
                }
                Err(e) => return Some(Err(PersistError::from(e))),
            }
        }
    }
}

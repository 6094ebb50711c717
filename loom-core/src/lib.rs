//! Narrative worldline engine.
//!
//! This crate provides:
//! - LLM-backed extraction of chapter state, relation facts, and
//!   character graphs from story scripts
//! - Interactive chunk-by-chunk playback with bounded protagonist-line
//!   edits and graph-constrained tail rewriting
//! - Two-branch persistence: a write-once original timeline and a
//!   last-writer-wins derivative timeline, with diffs between them
//! - A deterministic feasibility screen over extracted events
//!
//! # Quick Start
//!
//! ```ignore
//! use loom_core::{SessionConfig, StorySession};
//! use oracle::Oracle;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let generator = Oracle::from_env()?;
//!     let config = SessionConfig::new("Subaru", "worldline");
//!     let mut session = StorySession::open(generator, config).await?;
//!
//!     session.load_chapter(1, &std::fs::read_to_string("chapter_001.txt")?);
//!     while let Ok(chunk) = session.next() {
//!         println!("{chunk}");
//!     }
//!     session.commit_chapter().await?;
//!     Ok(())
//! }
//! ```

pub mod branch;
pub mod extract;
pub mod feasibility;
pub mod generation;
pub mod graph;
pub mod persist;
pub mod playback;
pub mod rewrite;
pub mod session;
pub mod state;
pub mod testing;
pub mod tkg;
pub mod vocab;

// Primary public API
pub use branch::{Branch, BranchError, BranchManager, StateDiff};
pub use extract::{ExtractConfig, ExtractError, ExtractedChapter, ExtractionPipeline};
pub use feasibility::{evaluate, Feasibility, FeasibilityConfig};
pub use generation::{GenerateError, GenerationRequest, RetryPolicy, TextGenerator};
pub use graph::{CharacterGraph, GraphConfig};
pub use persist::{CommitReceipt, PersistError, WorldStore};
pub use playback::{PlaybackEngine, PlaybackError, PlaybackState};
pub use rewrite::{ConsistencyWarning, RewriteConfig, RewriteEngine, RewriteError};
pub use session::{CommitReport, EditOutcome, SessionConfig, SessionError, StorySession};
pub use state::{ChapterState, Event, RelationStat};
pub use testing::{MockGenerator, MockReply};
pub use tkg::{Fact, FactMeta, TkgStore};
pub use vocab::{ActionLexicon, CombatPower, RelationKind, TraitKind};

//! Chapter playback state machine.
//!
//! A chapter's script plays back chunk by chunk. Chunks split at
//! protagonist speaker-tag lines: each chunk runs up to and including
//! the next line that starts with the protagonist's `【name】` tag, so
//! playback pauses right after the protagonist acts. That marker line
//! is the one editable span of the chunk.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Default cap on edits per chapter.
pub const DEFAULT_EDIT_CAP: u32 = 5;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("current chunk has no editable line matching the marker")]
    NoEditableMarker,

    #[error("edit quota exhausted ({cap} edits per chapter)")]
    EditQuotaExceeded { cap: u32 },

    #[error("an edit is already in progress")]
    EditInProgress,

    #[error("playback has not revealed a chunk yet")]
    NotPlaying,

    #[error("chapter is fully played back")]
    ChapterExhausted,

    #[error("replacement must start with the {tag} speaker tag")]
    UnmarkedReplacement { tag: String },
}

/// Where playback currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    NotStarted,
    /// Chunk at this index is revealed and current.
    Playing(usize),
    /// An edit was admitted and awaits confirmation.
    AwaitingEdit,
    /// The tail is being rewritten around a confirmed edit.
    Rewriting,
    Completed,
}

/// One accepted edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRecord {
    pub chunk_index: usize,
    pub marker_text: String,
    pub replacement_text: String,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

/// Per-chapter edit bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditSession {
    pub chapter_id: u32,
    pub edit_count: u32,
    pub edits: Vec<EditRecord>,
}

/// What the rewrite engine needs to regenerate the tail.
#[derive(Debug, Clone)]
pub struct RewriteView {
    /// Revealed text before the edited line. Never altered.
    pub prefix: String,
    /// Original text after the edited line.
    pub original_tail: String,
    /// The replacement line, already tag-prefixed.
    pub replacement: String,
}

#[derive(Debug, Clone)]
struct PendingEdit {
    chunk_index: usize,
    /// Global line index of the edited marker line.
    line_index: usize,
    marker_text: String,
    replacement: String,
}

/// Split script text into playback chunks.
///
/// Each chunk ends with the next line starting with `【tag】`; a final
/// chunk without one holds any trailing narration.
pub fn split_chunks(text: &str, protagonist: &str) -> Vec<String> {
    let marker = format!("【{protagonist}】");
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        current.push(line);
        if line.starts_with(&marker) {
            chunks.push(current.join("\n"));
            current.clear();
        }
    }
    if !current.is_empty() {
        chunks.push(current.join("\n"));
    }
    chunks
}

/// Plays one chapter's script, chunk by chunk, with a bounded number
/// of protagonist-line edits.
#[derive(Debug, Clone)]
pub struct PlaybackEngine {
    protagonist: String,
    marker: String,
    /// Chapter baseline, restored by [`reset`](Self::reset).
    original_text: String,
    content: String,
    chunks: Vec<String>,
    state: PlaybackState,
    session: EditSession,
    edit_cap: u32,
    pending: Option<PendingEdit>,
}

impl PlaybackEngine {
    pub fn new(chapter_id: u32, text: impl Into<String>, protagonist: impl Into<String>) -> Self {
        let protagonist = protagonist.into();
        let text = text.into();
        let chunks = split_chunks(&text, &protagonist);
        Self {
            marker: format!("【{protagonist}】"),
            protagonist,
            original_text: text.clone(),
            content: text,
            chunks,
            state: PlaybackState::NotStarted,
            session: EditSession {
                chapter_id,
                ..Default::default()
            },
            edit_cap: DEFAULT_EDIT_CAP,
            pending: None,
        }
    }

    pub fn with_edit_cap(mut self, cap: u32) -> Self {
        self.edit_cap = cap;
        self
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn session(&self) -> &EditSession {
        &self.session
    }

    /// Full chapter text as currently edited.
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// The chunk currently revealed, if playback has started.
    pub fn current_chunk(&self) -> Option<&str> {
        match self.state {
            PlaybackState::Playing(i) => self.chunks.get(i).map(String::as_str),
            PlaybackState::AwaitingEdit | PlaybackState::Rewriting => self
                .pending
                .as_ref()
                .and_then(|p| self.chunks.get(p.chunk_index))
                .map(String::as_str),
            _ => None,
        }
    }

    /// Chunks revealed so far, in play order.
    pub fn revealed(&self) -> &[String] {
        match self.state {
            PlaybackState::NotStarted => &[],
            PlaybackState::Playing(i) => &self.chunks[..=i.min(self.chunks.len() - 1)],
            PlaybackState::AwaitingEdit | PlaybackState::Rewriting => match &self.pending {
                Some(p) => &self.chunks[..=p.chunk_index],
                None => &[],
            },
            PlaybackState::Completed => &self.chunks,
        }
    }

    /// Chunks not yet revealed.
    pub fn upcoming(&self) -> &[String] {
        let revealed = self.revealed().len();
        &self.chunks[revealed..]
    }

    /// Reveal the next chunk.
    pub fn next(&mut self) -> Result<&str, PlaybackError> {
        match self.state {
            PlaybackState::AwaitingEdit | PlaybackState::Rewriting => {
                Err(PlaybackError::EditInProgress)
            }
            PlaybackState::Completed => Err(PlaybackError::ChapterExhausted),
            PlaybackState::NotStarted => {
                if self.chunks.is_empty() {
                    self.state = PlaybackState::Completed;
                    return Err(PlaybackError::ChapterExhausted);
                }
                self.state = PlaybackState::Playing(0);
                Ok(&self.chunks[0])
            }
            PlaybackState::Playing(i) => {
                if i + 1 >= self.chunks.len() {
                    self.state = PlaybackState::Completed;
                    Err(PlaybackError::ChapterExhausted)
                } else {
                    self.state = PlaybackState::Playing(i + 1);
                    Ok(&self.chunks[i + 1])
                }
            }
        }
    }

    /// Admit an edit against the current chunk's marker line.
    ///
    /// `marker_text` selects the protagonist line to replace (exact
    /// substring of that line); `replacement` must start with the
    /// protagonist tag. On any rejection the playback state is
    /// unchanged.
    pub fn request_edit(
        &mut self,
        marker_text: &str,
        replacement: &str,
    ) -> Result<(), PlaybackError> {
        let chunk_index = match self.state {
            PlaybackState::Playing(i) => i,
            PlaybackState::AwaitingEdit | PlaybackState::Rewriting => {
                return Err(PlaybackError::EditInProgress)
            }
            PlaybackState::NotStarted => return Err(PlaybackError::NotPlaying),
            PlaybackState::Completed => return Err(PlaybackError::ChapterExhausted),
        };

        if self.session.edit_count >= self.edit_cap {
            return Err(PlaybackError::EditQuotaExceeded { cap: self.edit_cap });
        }
        if !replacement.starts_with(&self.marker) {
            return Err(PlaybackError::UnmarkedReplacement {
                tag: self.marker.clone(),
            });
        }

        let offset_in_chunk = self.chunks[chunk_index]
            .lines()
            .position(|line| line.starts_with(&self.marker) && line.contains(marker_text))
            .ok_or(PlaybackError::NoEditableMarker)?;
        let line_index = self.chunk_start_line(chunk_index) + offset_in_chunk;

        self.pending = Some(PendingEdit {
            chunk_index,
            line_index,
            marker_text: marker_text.to_string(),
            replacement: replacement.to_string(),
        });
        self.state = PlaybackState::AwaitingEdit;
        Ok(())
    }

    /// Confirm the admitted edit and hand back what a rewrite needs.
    pub fn confirm_edit(&mut self) -> Result<RewriteView, PlaybackError> {
        if self.state != PlaybackState::AwaitingEdit {
            return Err(PlaybackError::NotPlaying);
        }
        let pending = self.pending.as_ref().ok_or(PlaybackError::NotPlaying)?;
        let lines: Vec<&str> = self.content.lines().collect();
        let view = RewriteView {
            prefix: lines[..pending.line_index].join("\n"),
            original_tail: lines[pending.line_index + 1..].join("\n"),
            replacement: pending.replacement.clone(),
        };
        self.state = PlaybackState::Rewriting;
        Ok(view)
    }

    /// Splice the rewritten tail in and resume play at the edit chunk.
    pub fn complete_rewrite(&mut self, new_tail: &str) -> Result<(), PlaybackError> {
        if self.state != PlaybackState::Rewriting {
            return Err(PlaybackError::NotPlaying);
        }
        let pending = self.pending.take().ok_or(PlaybackError::NotPlaying)?;

        let lines: Vec<&str> = self.content.lines().collect();
        let mut new_content = String::new();
        if pending.line_index > 0 {
            new_content.push_str(&lines[..pending.line_index].join("\n"));
            new_content.push('\n');
        }
        new_content.push_str(&pending.replacement);
        if !new_tail.trim().is_empty() {
            new_content.push('\n');
            new_content.push_str(new_tail);
        }

        self.content = new_content;
        self.chunks = split_chunks(&self.content, &self.protagonist);
        self.state = PlaybackState::Playing(pending.chunk_index.min(self.chunks.len() - 1));
        self.session.edit_count += 1;
        self.session.edits.push(EditRecord {
            chunk_index: pending.chunk_index,
            marker_text: pending.marker_text,
            replacement_text: pending.replacement,
            timestamp: unix_now(),
        });
        Ok(())
    }

    /// Abandon the admitted edit and resume play.
    pub fn abort_edit(&mut self) -> Result<(), PlaybackError> {
        match (self.state, self.pending.take()) {
            (PlaybackState::AwaitingEdit | PlaybackState::Rewriting, Some(p)) => {
                self.state = PlaybackState::Playing(p.chunk_index);
                Ok(())
            }
            _ => Err(PlaybackError::NotPlaying),
        }
    }

    /// Restore the chapter baseline: original text, zero edits.
    pub fn reset(&mut self) {
        self.content = self.original_text.clone();
        self.chunks = split_chunks(&self.content, &self.protagonist);
        self.state = PlaybackState::NotStarted;
        self.session.edit_count = 0;
        self.session.edits.clear();
        self.pending = None;
    }

    fn chunk_start_line(&self, chunk_index: usize) -> usize {
        self.chunks[..chunk_index]
            .iter()
            .map(|c| c.lines().count())
            .sum()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "\
【Narrator】The capital's back alley reeked of fruit and rust.
【Subaru】Where... am I?
【Narrator】Three thugs stepped out of the shadows.
【Subaru】Hey, let's talk this over!
【Narrator】The tall one cracked his knuckles.";

    #[test]
    fn test_chunks_end_at_protagonist_lines() {
        let chunks = split_chunks(SCRIPT, "Subaru");
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].ends_with("【Subaru】Where... am I?"));
        assert!(chunks[1].ends_with("【Subaru】Hey, let's talk this over!"));
        assert_eq!(chunks[2], "【Narrator】The tall one cracked his knuckles.");
    }

    #[test]
    fn test_playback_walks_chunks_in_order() {
        let mut engine = PlaybackEngine::new(1, SCRIPT, "Subaru");
        assert_eq!(engine.state(), PlaybackState::NotStarted);
        assert!(engine.revealed().is_empty());

        engine.next().unwrap();
        assert_eq!(engine.state(), PlaybackState::Playing(0));
        assert_eq!(engine.revealed().len(), 1);
        assert_eq!(engine.upcoming().len(), 2);

        engine.next().unwrap();
        engine.next().unwrap();
        assert!(matches!(engine.next(), Err(PlaybackError::ChapterExhausted)));
        assert_eq!(engine.state(), PlaybackState::Completed);
    }

    #[test]
    fn test_rejected_edit_leaves_state_unchanged() {
        let mut engine = PlaybackEngine::new(1, SCRIPT, "Subaru");
        engine.next().unwrap();

        // Marker text not in the current chunk.
        let err = engine.request_edit("talk this over", "【Subaru】Run!");
        assert!(matches!(err, Err(PlaybackError::NoEditableMarker)));
        assert_eq!(engine.state(), PlaybackState::Playing(0));

        // Replacement without the speaker tag.
        let err = engine.request_edit("Where... am I?", "Run for it!");
        assert!(matches!(err, Err(PlaybackError::UnmarkedReplacement { .. })));
        assert_eq!(engine.state(), PlaybackState::Playing(0));
        assert_eq!(engine.session().edit_count, 0);
    }

    #[test]
    fn test_edit_splices_and_resumes_at_edit_chunk() {
        let mut engine = PlaybackEngine::new(1, SCRIPT, "Subaru");
        engine.next().unwrap();
        engine.next().unwrap();

        engine
            .request_edit("let's talk this over", "【Subaru】I grab the knife and run!")
            .unwrap();
        assert_eq!(engine.state(), PlaybackState::AwaitingEdit);
        assert!(matches!(engine.next(), Err(PlaybackError::EditInProgress)));
        assert!(matches!(
            engine.request_edit("let's talk this over", "【Subaru】Again?"),
            Err(PlaybackError::EditInProgress)
        ));

        let view = engine.confirm_edit().unwrap();
        assert!(view.prefix.contains("Three thugs"));
        assert_eq!(
            view.original_tail,
            "【Narrator】The tall one cracked his knuckles."
        );

        engine
            .complete_rewrite("【Narrator】The thugs gave chase, cursing.\n【Subaru】Faster, faster!")
            .unwrap();
        assert_eq!(engine.state(), PlaybackState::Playing(1));
        assert_eq!(engine.session().edit_count, 1);
        assert!(engine.content().contains("I grab the knife and run!"));
        assert!(!engine.content().contains("let's talk this over"));
        // Revealed prefix is untouched.
        assert!(engine.content().starts_with("【Narrator】The capital's back alley"));
    }

    #[test]
    fn test_edit_quota_enforced() {
        let mut engine = PlaybackEngine::new(1, SCRIPT, "Subaru").with_edit_cap(1);
        engine.next().unwrap();
        engine
            .request_edit("Where... am I?", "【Subaru】So this is another world.")
            .unwrap();
        engine.confirm_edit().unwrap();
        engine.complete_rewrite("【Narrator】He stood up slowly.").unwrap();

        let err = engine.request_edit("another world", "【Subaru】Time to explore.");
        assert!(matches!(err, Err(PlaybackError::EditQuotaExceeded { cap: 1 })));
    }

    #[test]
    fn test_reset_restores_baseline_and_quota() {
        let mut engine = PlaybackEngine::new(1, SCRIPT, "Subaru");
        engine.next().unwrap();
        engine
            .request_edit("Where... am I?", "【Subaru】I know this place.")
            .unwrap();
        engine.confirm_edit().unwrap();
        engine.complete_rewrite("【Narrator】He walked on.").unwrap();
        assert_eq!(engine.session().edit_count, 1);

        engine.reset();
        assert_eq!(engine.state(), PlaybackState::NotStarted);
        assert_eq!(engine.session().edit_count, 0);
        assert_eq!(engine.content(), SCRIPT);
        assert_eq!(engine.chunk_count(), 3);
    }

    #[test]
    fn test_abort_edit_resumes_play() {
        let mut engine = PlaybackEngine::new(1, SCRIPT, "Subaru");
        engine.next().unwrap();
        engine
            .request_edit("Where... am I?", "【Subaru】Never mind.")
            .unwrap();
        engine.abort_edit().unwrap();
        assert_eq!(engine.state(), PlaybackState::Playing(0));
        assert_eq!(engine.session().edit_count, 0);
        assert!(engine.next().is_ok());
    }
}

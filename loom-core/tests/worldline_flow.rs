//! End-to-end flow tests driven by the scripted mock generator.
//!
//! These cover the full loop offline: play a chapter, commit the
//! untouched original, edit a protagonist line, rewrite the tail,
//! re-extract, commit the derivative, and diff the two timelines.
//!
//! The one live-API test at the bottom is ignored by default:
//! `OPENAI_API_KEY=... cargo test -p loom-core live_extraction -- --ignored`

use loom_core::branch::Branch;
use loom_core::extract::{ExtractConfig, ExtractError, ExtractionPipeline};
use loom_core::generation::RetryPolicy;
use loom_core::session::{SessionConfig, StorySession};
use loom_core::testing::{
    canned_facts_json, canned_graph_json, canned_state_json, push_chapter_extraction,
    sample_script, MockGenerator, MockReply,
};
use std::time::Duration;
use tempfile::TempDir;

async fn session_with(
    mock: MockGenerator,
    dir: &TempDir,
) -> StorySession<MockGenerator> {
    StorySession::open(mock, SessionConfig::new("Subaru", dir.path()))
        .await
        .unwrap()
}

fn play_to_end(session: &mut StorySession<MockGenerator>) {
    while session.next().is_ok() {}
}

/// A rewritten tail that keeps every line tagged and narration alive.
const REWRITTEN_TAIL: &str = "\
【Narrator】Felt blinked at the stranger's sudden confidence.
【Felt】Big words for a broke nobody.
【Subaru】Then let me prove it. One trade, right now.
【Narrator】Old Rom set down his mug and leaned in.";

/// Derivative-branch state payload that differs from the canned one.
fn edited_state_json() -> String {
    serde_json::json!({
        "title": "The Loot House, Rewritten",
        "events": [
            {"who": "Subaru", "action": "help", "target": "Felt",
             "goal": "recover the insignia", "polarity": 1,
             "location": "loot house", "precondition": null,
             "time": null, "effect": null},
            {"who": "Subaru", "action": "obtain", "target": "insignia",
             "goal": "return it to Emilia", "polarity": 1,
             "location": "loot house", "precondition": "holds the phone",
             "time": null, "effect": "insignia changes hands"}
        ],
        "relations": [
            {"a": "Subaru", "b": "Felt", "type": "cooperation", "score": 0.6}
        ],
        "goals": {"Subaru": ["return the insignia to Emilia"]},
        "objects": {"insignia": "held by Subaru", "phone": "held by Felt"}
    })
    .to_string()
}

#[tokio::test]
async fn test_play_commit_edit_commit_diff() {
    let mock = MockGenerator::new();
    // First commit: untouched chapter -> original branch.
    push_chapter_extraction(&mock, "The Loot House");
    // The edit: one rewrite reply, then the re-extraction.
    mock.push_text(REWRITTEN_TAIL);
    mock.push_text(edited_state_json());
    mock.push_text(canned_facts_json());
    mock.push_text(canned_graph_json());

    let dir = TempDir::new().unwrap();
    let mut session = session_with(mock, &dir).await;
    session.load_chapter(1, sample_script());

    play_to_end(&mut session);
    let report = session.commit_chapter().await.unwrap();
    assert_eq!(report.receipt.branch, Branch::Original);
    assert_eq!(report.receipt.chapter_id, 1);

    // Replay the chapter and rewrite the first protagonist line.
    session.reset_chapter().unwrap();
    session.next().unwrap();
    let outcome = session
        .accept_edit(
            1,
            "Um, hi",
            "【Subaru】I'm the guy who already knows how tonight ends.",
        )
        .await
        .unwrap();
    assert_eq!(outcome.report.receipt.branch, Branch::Derivative);

    // Both timelines now exist for chapter 1; the diff sees the edit.
    let playback = session.playback().unwrap();
    assert!(playback.content().contains("already knows how tonight ends"));
    assert!(!playback.content().contains("Um, hi"));

    let diff = session.diff(1).await.unwrap();
    assert!(!diff.is_empty());
    assert!(diff.added_events.iter().any(|e| e.action == "obtain"));

    // The original branch still reads exactly as first committed.
    let original = session.chapter_state(Branch::Original, 1).await.unwrap();
    assert_eq!(original.title, "The Loot House");
}

#[tokio::test]
async fn test_committed_facts_are_sequence_ordered() {
    let mock = MockGenerator::new();
    push_chapter_extraction(&mock, "The Loot House");

    let dir = TempDir::new().unwrap();
    let mut session = session_with(mock, &dir).await;
    session.load_chapter(1, sample_script());
    play_to_end(&mut session);
    session.commit_chapter().await.unwrap();

    let facts = session.chapter_facts(Branch::Original, 1).unwrap();
    assert_eq!(facts.len(), 2);
    let seqs: Vec<u64> = facts.iter().map(|f| f.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seqs[0], 1);
}

#[tokio::test]
async fn test_identical_replies_extract_identically() {
    let pipeline = ExtractionPipeline::default();

    let run = |_: u32| async {
        let mock = MockGenerator::new();
        push_chapter_extraction(&mock, "The Loot House");
        pipeline
            .extract(&mock, 1, sample_script(), None)
            .await
            .unwrap()
    };

    let first = run(0).await;
    let second = run(1).await;
    assert_eq!(first.facts, second.facts);
    assert_eq!(first.graph, second.graph);
    assert_eq!(first.state.events, second.state.events);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_output_gets_corrective_reprompt() {
    let mock = MockGenerator::new();
    mock.push_text(canned_state_json("t"));
    // Facts payload with an empty evidence field, then a fixed one.
    mock.push_text(
        r#"{"facts": [{"head": "Subaru", "relation": "trust", "tail": "Emilia",
                       "polarity": 0.5, "evidence": ""}]}"#,
    );
    mock.push_text(canned_facts_json());
    mock.push_text(canned_graph_json());

    let pipeline = ExtractionPipeline::default();
    let extracted = pipeline
        .extract(&mock, 1, sample_script(), None)
        .await
        .unwrap();
    assert_eq!(extracted.facts.len(), 2);

    let requests = mock.requests();
    assert_eq!(requests.len(), 4);
    assert!(requests[2].prompt.contains("previous answer was rejected"));
    assert!(requests[2].prompt.contains("facts[0].evidence"));
}

#[tokio::test(start_paused = true)]
async fn test_persistently_invalid_output_fails_validation() {
    let mock = MockGenerator::new();
    mock.push_text(canned_state_json("t"));
    for _ in 0..3 {
        mock.push_text(r#"{"facts": [{"head": "", "relation": "bff", "tail": "", "polarity": 5.0, "evidence": ""}]}"#);
    }

    let pipeline = ExtractionPipeline::default();
    let err = pipeline
        .extract(&mock, 1, sample_script(), None)
        .await
        .unwrap_err();
    match err {
        ExtractError::SchemaValidation {
            attempts,
            violations,
        } => {
            assert_eq!(attempts, 3);
            assert!(!violations.is_empty());
        }
        other => panic!("expected SchemaValidation, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_generator_surfaces_timeout() {
    let mock = MockGenerator::new();
    for _ in 0..2 {
        mock.push(MockReply::Stall(
            Duration::from_secs(600),
            canned_state_json("t"),
        ));
    }

    let config = ExtractConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
            deadline: Duration::from_secs(30),
        },
        ..Default::default()
    };
    let pipeline = ExtractionPipeline::new(config, Default::default(), Default::default());
    let err = pipeline
        .extract(&mock, 1, sample_script(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::Timeout { attempts: 2 }));
}

#[tokio::test]
async fn test_rewrite_failure_rolls_playback_back() {
    let mock = MockGenerator::new();
    push_chapter_extraction(&mock, "The Loot House");
    // Two rewrite attempts, both missing speaker tags.
    mock.push_text("He just ran away without a word.");
    mock.push_text("Still no tags here.");

    let dir = TempDir::new().unwrap();
    let mut session = session_with(mock, &dir).await;
    session.load_chapter(1, sample_script());
    play_to_end(&mut session);
    session.commit_chapter().await.unwrap();

    session.reset_chapter().unwrap();
    session.next().unwrap();
    let before = session.playback().unwrap().content().to_string();

    let err = session
        .accept_edit(1, "Um, hi", "【Subaru】I'm leaving.")
        .await
        .unwrap_err();
    assert!(matches!(err, loom_core::SessionError::Rewrite(_)));

    // Chapter text and edit quota are untouched after the failure.
    let playback = session.playback().unwrap();
    assert_eq!(playback.content(), before);
    assert_eq!(playback.session().edit_count, 0);
    assert!(session.next().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_extraction_failure_after_rewrite_rolls_playback_back() {
    let mock = MockGenerator::new();
    push_chapter_extraction(&mock, "The Loot House");
    // The rewrite succeeds, then every re-extraction attempt is garbage.
    mock.push_text(REWRITTEN_TAIL);
    for _ in 0..3 {
        mock.push_text("not json at all");
    }

    let dir = TempDir::new().unwrap();
    let mut session = session_with(mock, &dir).await;
    session.load_chapter(1, sample_script());
    play_to_end(&mut session);
    session.commit_chapter().await.unwrap();

    session.reset_chapter().unwrap();
    session.next().unwrap();
    let before = session.playback().unwrap().content().to_string();

    let err = session
        .accept_edit(1, "Um, hi", "【Subaru】Tonight goes differently.")
        .await
        .unwrap_err();
    assert!(matches!(err, loom_core::SessionError::Extract(_)));

    // Nothing persisted, so nothing may stick: the spliced tail is
    // gone, the quota is untouched, and play resumes.
    let playback = session.playback().unwrap();
    assert_eq!(playback.content(), before);
    assert_eq!(playback.session().edit_count, 0);
    assert!(!session.store().has_state(Branch::Derivative, 1));
    assert!(session.next().is_ok());
}

// =============================================================================
// Live API test (requires OPENAI_API_KEY)
// =============================================================================

#[tokio::test]
#[ignore]
async fn live_extraction() {
    let _ = dotenvy::dotenv();
    let Ok(generator) = oracle::Oracle::from_env() else {
        eprintln!("Skipping test: OPENAI_API_KEY not set");
        return;
    };

    let pipeline = ExtractionPipeline::default();
    let extracted = pipeline
        .extract(&generator, 1, sample_script(), None)
        .await
        .expect("live extraction should succeed");

    assert!(!extracted.state.events.is_empty());
    for fact in &extracted.facts {
        assert!(!fact.meta.evidence.trim().is_empty());
    }
}

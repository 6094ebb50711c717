//! Test doubles for deterministic, offline testing.
//!
//! [`MockGenerator`] replays scripted replies in order, so pipelines
//! that normally call a model can be exercised byte-for-byte
//! reproducibly. Canned JSON builders produce minimal payloads that
//! pass the extraction validation gate.

use crate::generation::{GenerateError, GenerationRequest, TextGenerator};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// One scripted generator reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return this text.
    Text(String),
    /// Fail with a backend error carrying this message.
    Fail(String),
    /// Sleep for the duration, then return the text. For deadline
    /// tests.
    Stall(Duration, String),
}

/// Scripted [`TextGenerator`]: replies pop in push order.
#[derive(Debug, Default)]
pub struct MockGenerator {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: MockReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push(MockReply::Text(text.into()));
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

impl TextGenerator for MockGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerateError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fail(message)) => Err(GenerateError::Backend(message)),
            Some(MockReply::Stall(duration, text)) => {
                tokio::time::sleep(duration).await;
                Ok(text)
            }
            None => Err(GenerateError::Backend(
                "mock generator ran out of scripted replies".to_string(),
            )),
        }
    }
}

// ============================================================
// Canned payloads
// ============================================================

/// Minimal chapter-state JSON that passes validation.
pub fn canned_state_json(title: &str) -> String {
    serde_json::json!({
        "title": title,
        "events": [
            {"who": "Subaru", "action": "help", "target": "Felt",
             "goal": "recover the insignia", "polarity": 1,
             "location": "loot house", "precondition": null,
             "time": null, "effect": null}
        ],
        "relations": [
            {"a": "Subaru", "b": "Felt", "type": "cooperation", "score": 0.4}
        ],
        "goals": {"Subaru": ["recover the insignia"]},
        "objects": {"insignia": "held by Felt"}
    })
    .to_string()
}

/// Minimal fact-log JSON that passes validation.
pub fn canned_facts_json() -> String {
    serde_json::json!({
        "facts": [
            {"head": "Subaru", "relation": "cooperation", "tail": "Felt",
             "location": "loot house", "polarity": 0.4,
             "evidence": "he offered his phone for the insignia"},
            {"head": "Elsa", "relation": "hostility", "tail": "Subaru",
             "location": "loot house", "polarity": -0.8,
             "evidence": "she drew her kukri on him"}
        ]
    })
    .to_string()
}

/// Minimal observed-graph JSON that passes validation.
pub fn canned_graph_json() -> String {
    serde_json::json!({
        "characters": [
            {"name": "Subaru", "combat_power": "weak", "traits": ["impulsive"]},
            {"name": "Felt", "combat_power": "weak", "traits": []},
            {"name": "Elsa", "combat_power": "strong", "traits": ["cruel"]}
        ],
        "relations": [
            {"a": "Subaru", "b": "Felt", "type": "cooperation", "score": 0.4,
             "evidence": "he offered his phone for the insignia"},
            {"a": "Elsa", "b": "Subaru", "type": "hostility", "score": 0.9,
             "evidence": "she drew her kukri on him"}
        ]
    })
    .to_string()
}

/// Queue one complete chapter extraction: state, facts, graph.
pub fn push_chapter_extraction(mock: &MockGenerator, title: &str) {
    mock.push_text(canned_state_json(title));
    mock.push_text(canned_facts_json());
    mock.push_text(canned_graph_json());
}

/// A short script in the expected 【name】 format.
pub fn sample_script() -> &'static str {
    "\
【Narrator】The loot house door creaked open onto candlelight.
【Subaru】Um, hi. I'm here about an insignia?
【Narrator】Felt's hand drifted toward the dagger at her hip.
【Felt】And who are you supposed to be?
【Subaru】Just a broke nobody with a deal you'll like.
【Narrator】Old Rom set down his mug and listened."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_replays_in_order() {
        let mock = MockGenerator::new();
        mock.push_text("first");
        mock.push(MockReply::Fail("boom".to_string()));
        mock.push_text("second");

        let req = GenerationRequest::new("sys", "prompt");
        assert_eq!(mock.generate(&req).await.unwrap(), "first");
        assert!(mock.generate(&req).await.is_err());
        assert_eq!(mock.generate(&req).await.unwrap(), "second");
        assert!(mock.generate(&req).await.is_err());
        assert_eq!(mock.requests().len(), 4);
    }

    #[test]
    fn test_canned_payloads_are_valid_json() {
        for payload in [
            canned_state_json("t"),
            canned_facts_json(),
            canned_graph_json(),
        ] {
            serde_json::from_str::<serde_json::Value>(&payload).unwrap();
        }
    }
}

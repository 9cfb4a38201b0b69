//! Testing utilities.
//!
//! This module provides tools for integration testing:
//! - `ScriptedOracle` for deterministic replies without API calls
//! - `StaticArtist` for avatar rendering without an image service
//! - Story fixtures and assertion helpers

use crate::avatar::{AvatarArtist, AvatarRequest};
use crate::config::StoryConfig;
use crate::model::{Character, ChatMessage, Location, Story};
use async_trait::async_trait;
use oracle::{Error, Oracle, Request};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct Script {
    replies: HashMap<String, VecDeque<String>>,
    fallback: HashMap<String, String>,
    failures: HashMap<String, usize>,
    calls: HashMap<String, usize>,
    prompts: Vec<(String, String)>,
}

/// An oracle that answers from a script, keyed by the request's schema name.
///
/// Queued replies are used once each, in order. When the queue for a schema
/// is empty the sticky reply is used; with neither, the call fails.
#[derive(Default)]
pub struct ScriptedOracle {
    script: Mutex<Script>,
    delay: Option<Duration>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply, so concurrent callers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a one-shot reply for a schema.
    pub fn reply(self, schema: &str, text: impl Into<String>) -> Self {
        self.lock()
            .replies
            .entry(schema.to_string())
            .or_default()
            .push_back(text.into());
        self
    }

    /// Reply with `text` every time the queue for `schema` is empty.
    pub fn always(self, schema: &str, text: impl Into<String>) -> Self {
        self.lock().fallback.insert(schema.to_string(), text.into());
        self
    }

    /// Fail the next `times` calls for a schema.
    pub fn fail(self, schema: &str, times: usize) -> Self {
        *self.lock().failures.entry(schema.to_string()).or_default() += times;
        self
    }

    /// How many calls arrived for a schema.
    pub fn calls(&self, schema: &str) -> usize {
        self.lock().calls.get(schema).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    /// The last prompt sent for a schema.
    pub fn last_prompt(&self, schema: &str) -> Option<String> {
        self.lock()
            .prompts
            .iter()
            .rev()
            .find(|(name, _)| name == schema)
            .map(|(_, prompt)| prompt.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next(&self, request: &Request) -> Result<String, Error> {
        let name = request.schema_name().to_string();
        let mut script = self.lock();
        *script.calls.entry(name.clone()).or_default() += 1;
        script.prompts.push((name.clone(), request.prompt.clone()));

        if let Some(remaining) = script.failures.get_mut(&name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Network(format!("scripted failure for {name}")));
            }
        }

        if let Some(reply) = script.replies.get_mut(&name).and_then(VecDeque::pop_front) {
            return Ok(reply);
        }
        script
            .fallback
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::Api {
                status: 500,
                message: format!("no scripted reply for {name}"),
            })
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn generate(&self, request: Request) -> Result<String, Error> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next(&request)
    }
}

/// An artist that always returns the same image, or never returns one.
pub struct StaticArtist {
    image: Option<String>,
}

impl StaticArtist {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
        }
    }

    pub fn failing() -> Self {
        Self { image: None }
    }
}

#[async_trait]
impl AvatarArtist for StaticArtist {
    async fn render(&self, _request: AvatarRequest) -> Option<String> {
        self.image.clone()
    }
}

/// A small story with a player, one NPC and two connected places.
pub fn sample_story() -> Story {
    let mut square = Location::new("Market Square", "Stalls and gulls.");
    let mut docks = Location::new("Docks", "Tar and salt.");
    square.connect(&docks.id);
    docks.connect(&square.id);

    let mut story = Story::new(
        StoryConfig::new("Harbor Lights").with_player("Wren", "a courier"),
        Character::new("Wren", "A courier with a limp."),
        square,
    );
    story.locations.insert(docks.id.clone(), docks);

    let npc = Character::new("Bram", "A fishmonger.").at(story.current_location_id.clone());
    story.characters.insert(npc.id.clone(), npc);

    story.push_messages(vec![ChatMessage::narration("The bells ring noon.", 0)], 0);
    story
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert that no two messages share an id.
#[track_caller]
pub fn assert_unique_messages(story: &Story) {
    let mut seen = HashSet::new();
    for message in &story.messages {
        assert!(seen.insert(&message.id), "Duplicate message id {}", message.id);
    }
}

/// Assert that messages are ordered by page, then timestamp.
#[track_caller]
pub fn assert_canonical_order(story: &Story) {
    for pair in story.messages.windows(2) {
        let ordered = (pair[0].page, pair[0].timestamp) <= (pair[1].page, pair[1].timestamp);
        assert!(
            ordered,
            "Messages out of order: {} (page {}) before {} (page {})",
            pair[0].id, pair[0].page, pair[1].id, pair[1].page
        );
    }
}

/// Assert that the story's structural invariants hold.
#[track_caller]
pub fn assert_valid(story: &Story) {
    if let Err(e) = story.validate() {
        panic!("Expected a valid story, got: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_oracle_queue_then_sticky() {
        let oracle = ScriptedOracle::new()
            .reply("story_turn", "first")
            .always("story_turn", "again");
        let request = || Request::new("go").with_schema(oracle::Schema::new("story_turn", "", serde_json::json!({})));

        assert_eq!(oracle.generate(request()).await.unwrap(), "first");
        assert_eq!(oracle.generate(request()).await.unwrap(), "again");
        assert_eq!(oracle.generate(request()).await.unwrap(), "again");
        assert_eq!(oracle.calls("story_turn"), 3);
        assert!(oracle.generate(Request::new("free text")).await.is_err());
    }

    #[tokio::test]
    async fn test_scripted_failures_come_first() {
        let oracle = ScriptedOracle::new().always("text", "ok").fail("text", 1);
        assert!(oracle.generate(Request::new("a")).await.is_err());
        assert_eq!(oracle.generate(Request::new("b")).await.unwrap(), "ok");
        assert_eq!(oracle.last_prompt("text").as_deref(), Some("b"));
    }

    #[test]
    fn test_sample_story_is_valid() {
        let story = sample_story();
        assert_valid(&story);
        assert_unique_messages(&story);
        assert_eq!(story.npcs_here().len(), 1);
    }
}

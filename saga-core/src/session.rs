//! TurnEngine - the live play loop.
//!
//! Wraps the oracle, the story store and the post-turn analysts into one
//! API: play a turn, get the action menu for the current position.

use crate::config::EngineConfig;
use crate::context::ContextAnalyst;
use crate::fate::{roll_fate, ActionOption, FateOutcome, FateResult};
use crate::grid::{GridAnalyst, GridSnapshot};
use crate::model::{CharacterId, ChatMessage, Story};
use crate::normalize::{extract_json, lenient_vec, normalize_turn, NormalizeError};
use crate::options::{cache_key, OptionCache, OptionsError};
use crate::persist::{PersistError, StoryStore};
use chrono::Utc;
use oracle::{Oracle, ReplySchema, Request};
use saga_macros::PhaseSchema;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

const TURN_SYSTEM_PROMPT: &str = "You are the narrator of an interactive story. \
Continue the story in response to the player's action and report every change to the world.";

/// How many recent messages go into a turn prompt.
const PROMPT_HISTORY: usize = 12;

/// Errors from playing a turn.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Oracle error: {0}")]
    Oracle(#[from] oracle::Error),

    #[error("Turn reply unusable: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),
}

/// The oracle's reply to a player action
#[derive(Debug, Clone, Deserialize, PhaseSchema)]
#[schema(name = "story_turn")]
pub struct TurnReply {
    /// Narration and dialogue lines, each {type, text, senderId?, senderName?, tone?, newCharacter?}
    pub messages: Vec<Value>,
    /// Places discovered this turn
    #[serde(default)]
    pub new_locations: Vec<Value>,
    /// Characters introduced this turn
    #[serde(default)]
    pub new_characters: Vec<Value>,
    /// Changes to existing characters, matched by id or name
    #[serde(default)]
    pub updated_characters: Vec<Value>,
    /// Id or name of the place the player moves to
    #[serde(default)]
    pub location_change: Option<String>,
    /// One sentence for the event log
    #[serde(default)]
    pub event_summary: Option<String>,
}

/// One option as the oracle proposes it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedOption {
    pub text: String,
    #[serde(default, alias = "good_chance")]
    pub good_chance: i64,
    #[serde(default, alias = "bad_chance")]
    pub bad_chance: i64,
    #[serde(default, alias = "good_hint")]
    pub good_hint: Option<String>,
    #[serde(default, alias = "bad_hint")]
    pub bad_hint: Option<String>,
}

/// Actions the player could take next
#[derive(Debug, Clone, Deserialize, PhaseSchema)]
#[schema(name = "action_options")]
pub struct OptionMenu {
    /// Three or four options; goodChance and badChance are 0-50
    #[serde(deserialize_with = "lenient_vec")]
    pub options: Vec<ProposedOption>,
}

/// Parse an option menu reply, clamping every chance.
pub fn parse_options(text: &str) -> Result<Vec<ActionOption>, oracle::Error> {
    let menu: OptionMenu =
        serde_json::from_str(extract_json(text)).map_err(|e| oracle::Error::Parse(e.to_string()))?;
    let options: Vec<ActionOption> = menu
        .options
        .into_iter()
        .filter(|o| !o.text.trim().is_empty())
        .map(|o| {
            ActionOption::new(o.text.trim(), o.good_chance, o.bad_chance).with_hints(o.good_hint, o.bad_hint)
        })
        .collect();
    if options.is_empty() {
        return Err(oracle::Error::Empty);
    }
    Ok(options)
}

/// What a played turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// The player's line and everything the oracle added, in order.
    pub messages: Vec<ChatMessage>,
    pub fate: Option<FateResult>,
    pub context_updated: bool,
    pub snapshot: Option<GridSnapshot>,
}

fn recent_transcript(story: &Story) -> String {
    let start = story.messages.len().saturating_sub(PROMPT_HISTORY);
    story.messages[start..]
        .iter()
        .map(|m| {
            let speaker = story
                .characters
                .get(&CharacterId::from(m.sender_id.as_str()))
                .map(|c| c.name.as_str())
                .or(m.sender_name.as_deref())
                .unwrap_or(m.sender_id.as_str());
            format!("{speaker}: {}\n", m.text)
        })
        .collect()
}

fn turn_prompt(story: &Story, action: &str, fate: Option<&FateResult>) -> String {
    let location = story.current_location();
    let mut prompt = format!(
        "## Location\n{}: {}\n\n## Memory\n{}\n## Recent events\n{}\n## Player action\n{}\n",
        location.map(|l| l.name.as_str()).unwrap_or("Unknown"),
        location.map(|l| l.description.as_str()).unwrap_or(""),
        story.heavy_context.render(),
        recent_transcript(story),
        action
    );

    if let Some(fate) = fate {
        let twist = match fate.outcome {
            FateOutcome::Good => "Something unexpectedly good happens as a side effect",
            FateOutcome::Bad => "Something unexpectedly bad happens as a side effect",
            FateOutcome::Neutral => "",
        };
        if !twist.is_empty() {
            prompt.push_str(&format!("\n## Fate\n{twist}"));
            if let Some(ref hint) = fate.hint {
                prompt.push_str(&format!(": {hint}"));
            }
            prompt.push('\n');
        }
    }
    prompt
}

fn options_prompt(story: &Story) -> String {
    format!(
        "## Memory\n{}\n## Recent events\n{}\n\
         Offer the player three or four distinct next actions, each with the chance (0-50) \
         of a good and of a bad side effect.",
        story.heavy_context.render(),
        recent_transcript(story)
    )
}

/// Plays turns against a story.
pub struct TurnEngine {
    oracle: Arc<dyn Oracle>,
    store: StoryStore,
    options: OptionCache,
    context: ContextAnalyst,
    grid: GridAnalyst,
    config: EngineConfig,
}

impl TurnEngine {
    pub fn new(oracle: Arc<dyn Oracle>, store: StoryStore, config: EngineConfig) -> Self {
        Self {
            options: OptionCache::new(store.pool().clone()),
            context: ContextAnalyst::new(oracle.clone(), config.clone()),
            grid: GridAnalyst::new(oracle.clone(), config.clone()),
            oracle,
            store,
            config,
        }
    }

    pub fn option_cache(&self) -> &OptionCache {
        &self.options
    }

    pub fn store(&self) -> &StoryStore {
        &self.store
    }

    /// Play a turn, rolling fate for the chosen option if there is one.
    pub async fn play_turn(
        &self,
        story: &mut Story,
        action: &str,
        chosen: Option<&ActionOption>,
    ) -> Result<TurnOutcome, TurnError> {
        let fate = chosen.map(roll_fate);
        self.play_turn_with_fate(story, action, fate).await
    }

    /// Play a turn with an already-resolved fate.
    ///
    /// If the oracle fails or its reply cannot be normalized the story is
    /// left untouched.
    pub async fn play_turn_with_fate(
        &self,
        story: &mut Story,
        action: &str,
        fate: Option<FateResult>,
    ) -> Result<TurnOutcome, TurnError> {
        let page = story.turn + 1;
        let player_line = ChatMessage::dialogue(&story.player_character_id, action.trim(), page);

        let request = self.config.apply(
            Request::new(turn_prompt(story, action, fate.as_ref()))
                .with_system(TURN_SYSTEM_PROMPT)
                .with_schema(TurnReply::schema()),
        );
        let raw = self.oracle.generate(request).await?;
        let turn = normalize_turn(&raw).map_err(|e| {
            tracing::warn!(story_id = %story.id, error = %e, "Turn reply rejected; story unchanged");
            e
        })?;

        let first_new = story.messages.len();
        story.turn = page;
        story.last_played = Utc::now();
        story.push_messages(vec![player_line], page);
        // New characters land before their lines so speakers resolve to them.
        story.apply_delta(turn.delta);
        story.push_messages(turn.messages, page);
        let messages = story.messages[first_new..].to_vec();

        let (context, snapshot) = {
            let story: &Story = story;
            let grid = async {
                if story.config.tactical_mode {
                    self.grid.analyze(story, &messages).await
                } else {
                    None
                }
            };
            futures::join!(self.context.analyze(story, &messages), grid)
        };

        let context_updated = context.apply_to(&mut story.heavy_context);
        if let Some(ref snapshot) = snapshot {
            story.snapshots.append(snapshot.clone());
        }

        self.store.save(story).await?;
        tracing::info!(
            story_id = %story.id,
            turn = story.turn,
            messages = messages.len(),
            context_updated,
            "Turn played"
        );

        Ok(TurnOutcome {
            messages,
            fate,
            context_updated,
            snapshot,
        })
    }

    /// The action menu for the story's current position, generated at most
    /// once per position.
    pub async fn action_options(&self, story: &Story) -> Result<Vec<ActionOption>, OptionsError> {
        let key = cache_key(story);
        let message_id = story.last_message_id().map(|id| id.to_string());
        let oracle = self.oracle.clone();
        let request = self.config.apply(
            Request::new(options_prompt(story))
                .with_system(TURN_SYSTEM_PROMPT)
                .with_schema(OptionMenu::schema()),
        );

        self.options
            .resolve(&story.id, &key, message_id.as_deref(), move || async move {
                let raw = oracle.generate(request).await?;
                parse_options(&raw)
            })
            .await
    }
}

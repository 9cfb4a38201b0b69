//! Reply shapes and prompts for each initialization phase.

use crate::config::StoryConfig;
use crate::normalize::{lenient_vec, WireCharacter, WireMessage};
use saga_macros::PhaseSchema;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Seed id the blueprint uses for the player character.
pub const PLAYER_SEED: &str = "player";

/// The steps of story creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Blueprint,
    StartingLocation,
    PlayerSheet,
    SupportingNpcs,
    OpeningNarration,
    QuestHooks,
    SpatialSeed,
    AvatarArt,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Blueprint => "blueprint",
            Phase::StartingLocation => "starting_location",
            Phase::PlayerSheet => "player_sheet",
            Phase::SupportingNpcs => "supporting_npcs",
            Phase::OpeningNarration => "opening_narration",
            Phase::QuestHooks => "quest_hooks",
            Phase::SpatialSeed => "spatial_seed",
            Phase::AvatarArt => "avatar_art",
        };
        f.write_str(name)
    }
}

/// Checks a decoded reply beyond its schema.
pub trait PhaseReply {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

fn non_empty(value: &str, field: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} is empty"))
    } else {
        Ok(())
    }
}

// ============================================================================
// Blueprint
// ============================================================================

/// A character the story is built around, with a local seed id
#[derive(Debug, Clone, Deserialize)]
pub struct CastSeed {
    pub seed_id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
}

/// The skeleton of a new story
#[derive(Debug, Clone, Deserialize, PhaseSchema)]
#[schema(name = "story_blueprint")]
pub struct Blueprint {
    /// Evocative story title
    pub title: String,
    /// One paragraph describing the world and its situation
    pub setting: String,
    /// Overall tone, e.g. grim or whimsical
    #[serde(default)]
    pub tone: String,
    /// Name of the place the story opens in
    pub starting_location: String,
    /// The protagonist's overarching goal
    pub main_mission: String,
    /// Key supporting characters, each with a short seed_id such as "npc1"
    #[serde(default, deserialize_with = "lenient_vec")]
    pub cast: Vec<CastSeed>,
}

impl PhaseReply for Blueprint {
    fn validate(&self) -> Result<(), String> {
        non_empty(&self.title, "title")?;
        non_empty(&self.starting_location, "starting_location")
    }
}

impl Blueprint {
    /// Render for inclusion in later phase prompts.
    pub fn brief(&self) -> String {
        let mut out = format!(
            "Title: {}\nSetting: {}\nTone: {}\nStarting location: {}\nMain mission: {}\n",
            self.title, self.setting, self.tone, self.starting_location, self.main_mission
        );
        if !self.cast.is_empty() {
            out.push_str("Cast:\n");
            for seed in &self.cast {
                out.push_str(&format!("- [{}] {} ({})\n", seed.seed_id, seed.name, seed.role));
            }
        }
        out
    }
}

// ============================================================================
// Dependent phases
// ============================================================================

/// The place the story opens in
#[derive(Debug, Clone, Deserialize, PhaseSchema)]
#[schema(name = "starting_location")]
pub struct LocationSheet {
    pub name: String,
    /// Two or three sentences of sensory description
    pub description: String,
    /// Names of places reachable from here
    #[serde(default, deserialize_with = "lenient_vec")]
    pub nearby: Vec<String>,
}

impl PhaseReply for LocationSheet {
    fn validate(&self) -> Result<(), String> {
        non_empty(&self.name, "name")?;
        non_empty(&self.description, "description")
    }
}

/// The player character
#[derive(Debug, Clone, Deserialize, PhaseSchema)]
#[schema(name = "player_sheet")]
pub struct PlayerSheet {
    pub name: String,
    pub description: String,
    /// Stats as {"hp": 20, "maxHp": 20, "gold": 10, ...}
    #[serde(default)]
    pub stats: Value,
    /// Starting items, names or {name, category, quantity}
    #[serde(default)]
    pub inventory: Value,
    /// Visual description for a portrait
    #[serde(default)]
    pub portrait_prompt: Option<String>,
}

impl PhaseReply for PlayerSheet {
    fn validate(&self) -> Result<(), String> {
        non_empty(&self.name, "name")
    }
}

/// Supporting characters present at the start
#[derive(Debug, Clone, Deserialize, PhaseSchema)]
#[schema(name = "supporting_npcs")]
pub struct SupportingCast {
    /// Each with id set to its blueprint seed_id when it has one
    #[serde(deserialize_with = "lenient_vec")]
    pub npcs: Vec<WireCharacter>,
}

impl PhaseReply for SupportingCast {
    fn validate(&self) -> Result<(), String> {
        if self.npcs.iter().any(|n| n.name.as_deref().is_some_and(|s| !s.trim().is_empty())) {
            Ok(())
        } else {
            Err("no named npcs".to_string())
        }
    }
}

/// The first lines of the story
#[derive(Debug, Clone, Deserialize, PhaseSchema)]
#[schema(name = "opening_narration")]
pub struct OpeningScene {
    /// Narration and dialogue lines in order; dialogue senderId uses seed ids
    #[serde(deserialize_with = "lenient_vec")]
    pub messages: Vec<WireMessage>,
}

impl PhaseReply for OpeningScene {
    fn validate(&self) -> Result<(), String> {
        if self.messages.is_empty() {
            Err("no messages".to_string())
        } else {
            Ok(())
        }
    }
}

/// Initial missions and hooks
#[derive(Debug, Clone, Deserialize, PhaseSchema)]
#[schema(name = "quest_hooks")]
pub struct QuestHooks {
    pub main_mission: String,
    #[serde(default)]
    pub current_mission: Option<String>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub active_problems: Vec<String>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub important_notes: Vec<String>,
}

impl PhaseReply for QuestHooks {
    fn validate(&self) -> Result<(), String> {
        non_empty(&self.main_mission, "main_mission")
    }
}

/// A cell assignment for one seed
#[derive(Debug, Clone, Deserialize)]
pub struct SeedPosition {
    /// Seed id or name
    pub character: String,
    pub x: i64,
    pub y: i64,
}

/// Starting positions on a 10x10 grid
#[derive(Debug, Clone, Deserialize, PhaseSchema)]
#[schema(name = "spatial_seed")]
pub struct SpatialSeed {
    #[serde(deserialize_with = "lenient_vec")]
    pub positions: Vec<SeedPosition>,
}

impl PhaseReply for SpatialSeed {}

// ============================================================================
// Prompts
// ============================================================================

pub const SYSTEM_PROMPT: &str = "You are the architect of a new interactive story. \
Answer only with JSON matching the requested schema.";

fn language_line(config: &StoryConfig) -> String {
    config
        .language
        .as_deref()
        .map(|l| format!("Write all player-facing text in {l}.\n"))
        .unwrap_or_default()
}

pub fn blueprint_prompt(config: &StoryConfig) -> String {
    format!(
        "Design a {} story titled \"{}\".\nPremise: {}\nThe protagonist is {}, {}.\n{}\
         Give every supporting character a short seed_id. The protagonist's seed_id is \"{PLAYER_SEED}\".",
        config.genre,
        config.title,
        if config.premise.is_empty() { "(open)" } else { config.premise.as_str() },
        config.player_name,
        if config.player_concept.is_empty() { "an adventurer" } else { config.player_concept.as_str() },
        language_line(config)
    )
}

pub fn dependent_prompt(phase: Phase, config: &StoryConfig, blueprint: &Blueprint) -> String {
    let task = match phase {
        Phase::StartingLocation => "Describe the starting location and the places nearby.".to_string(),
        Phase::PlayerSheet => format!(
            "Create the character sheet for the protagonist {} ({}).",
            config.player_name, config.player_concept
        ),
        Phase::SupportingNpcs => "Flesh out the supporting characters present at the start.".to_string(),
        Phase::OpeningNarration => {
            "Write the opening scene: a few narration lines and at most two lines of dialogue.".to_string()
        }
        Phase::QuestHooks => "State the missions and the problems that drive the story.".to_string(),
        Phase::SpatialSeed => format!(
            "Place the protagonist (seed \"{PLAYER_SEED}\") and the cast on a 10x10 grid."
        ),
        Phase::Blueprint | Phase::AvatarArt => String::new(),
    };
    format!("## Blueprint\n{}\n{}{}", blueprint.brief(), language_line(config), task)
}

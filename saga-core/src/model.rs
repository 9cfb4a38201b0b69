//! Story aggregate types.
//!
//! Contains the root `Story` aggregate and everything it owns: characters,
//! locations, items, the message and event logs, plus the `StateDelta`
//! bundle a turn produces and the logic that folds it into a story.

use crate::config::StoryConfig;
use crate::context::HeavyContext;
use crate::grid::SnapshotHistory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Sender id used for narration lines.
pub const NARRATOR: &str = "narrator";

/// Sender id used for system lines.
pub const SYSTEM: &str = "system";

/// Default hit points for characters the oracle describes without stats.
const DEFAULT_MAX_HP: i64 = 20;

/// Relationship affinity bounds.
pub const AFFINITY_MIN: i32 = -100;
pub const AFFINITY_MAX: i32 = 100;

// ============================================================================
// ID Types
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Unique identifier for a story.
    StoryId
);
string_id!(
    /// Unique identifier for characters.
    CharacterId
);
string_id!(
    /// Unique identifier for locations.
    LocationId
);
string_id!(
    /// Unique identifier for chat messages.
    MessageId
);
string_id!(
    /// Unique identifier for event log entries.
    EventId
);
string_id!(
    /// Unique identifier for grid snapshots.
    SnapshotId
);

// ============================================================================
// Errors
// ============================================================================

/// Violations of the story aggregate's invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("Player character {0} does not exist")]
    MissingPlayer(CharacterId),

    #[error("Character {0} is referenced as the player but is not flagged as one")]
    PlayerNotFlagged(CharacterId),

    #[error("Current location {0} does not exist")]
    MissingLocation(LocationId),
}

// ============================================================================
// Items
// ============================================================================

/// Broad item classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemCategory {
    Weapon,
    Armor,
    Consumable,
    Material,
    Quest,
    Valuable,
    Currency,
    #[default]
    Misc,
}

/// Keyword table for category inference, checked in order.
const CATEGORY_KEYWORDS: &[(ItemCategory, &[&str])] = &[
    (
        ItemCategory::Currency,
        &["coin", "gold piece", "silver piece", "copper piece", "crown", "ducat"],
    ),
    (
        ItemCategory::Quest,
        &["key", "letter", "map", "seal", "relic", "sigil", "journal"],
    ),
    (
        ItemCategory::Weapon,
        &[
            "sword", "dagger", "axe", "bow", "spear", "mace", "staff", "blade", "knife", "hammer",
            "crossbow", "club", "whip", "pistol", "rifle",
        ],
    ),
    (
        ItemCategory::Armor,
        &[
            "armor", "armour", "shield", "helm", "helmet", "mail", "gauntlet", "boots", "cloak",
            "breastplate", "greaves",
        ],
    ),
    (
        ItemCategory::Consumable,
        &[
            "potion", "elixir", "tonic", "bread", "ration", "food", "herb", "scroll", "bandage",
            "antidote", "ale", "water", "apple",
        ],
    ),
    (
        ItemCategory::Material,
        &["ore", "ingot", "wood", "hide", "leather", "cloth", "thread", "stone", "bone", "pelt"],
    ),
    (
        ItemCategory::Valuable,
        &["gem", "jewel", "ruby", "emerald", "diamond", "ring", "necklace", "pearl", "crown jewel"],
    ),
];

impl ItemCategory {
    /// Guess a category from an item's name.
    pub fn infer(name: &str) -> Self {
        let lower = name.to_lowercase();
        CATEGORY_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(category, _)| *category)
            .unwrap_or_default()
    }

    /// Lenient parse of a category label; unknown labels fall back to inference.
    pub fn parse_or_infer(label: Option<&str>, name: &str) -> Self {
        match label.map(|l| l.trim().to_lowercase()).as_deref() {
            Some("weapon") => ItemCategory::Weapon,
            Some("armor") | Some("armour") => ItemCategory::Armor,
            Some("consumable") => ItemCategory::Consumable,
            Some("material") => ItemCategory::Material,
            Some("quest") => ItemCategory::Quest,
            Some("valuable") => ItemCategory::Valuable,
            Some("currency") => ItemCategory::Currency,
            Some("misc") => ItemCategory::Misc,
            _ => Self::infer(name),
        }
    }

    pub fn is_stackable(&self) -> bool {
        matches!(
            self,
            ItemCategory::Consumable | ItemCategory::Material | ItemCategory::Currency
        )
    }

    pub fn is_consumable(&self) -> bool {
        matches!(self, ItemCategory::Consumable)
    }

    pub fn is_sellable(&self) -> bool {
        !matches!(self, ItemCategory::Quest | ItemCategory::Currency)
    }
}

/// An inventory item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub name: String,
    pub category: ItemCategory,
    pub quantity: u32,
    pub stackable: bool,
    pub consumable: bool,
    pub sellable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<String>,
}

impl Item {
    /// Create an item with flags derived from its category.
    pub fn new(name: impl Into<String>, category: ItemCategory, quantity: u32) -> Self {
        Self {
            name: name.into(),
            category,
            quantity: quantity.max(1),
            stackable: category.is_stackable(),
            consumable: category.is_consumable(),
            sellable: category.is_sellable(),
            effects: Vec::new(),
        }
    }

    /// Upgrade a bare item name, inferring its category.
    pub fn from_name(name: impl Into<String>) -> Self {
        let name = name.into();
        let category = ItemCategory::infer(&name);
        Self::new(name, category, 1)
    }
}

// ============================================================================
// Characters
// ============================================================================

/// Behavioral state of a character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BehaviorState {
    #[default]
    Calm,
    Friendly,
    Hostile,
    Afraid,
    Injured,
    Dead,
}

impl BehaviorState {
    pub fn parse_lenient(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "friendly" | "allied" | "ally" => BehaviorState::Friendly,
            "hostile" | "aggressive" | "angry" => BehaviorState::Hostile,
            "afraid" | "scared" | "fleeing" => BehaviorState::Afraid,
            "injured" | "wounded" => BehaviorState::Injured,
            "dead" | "deceased" => BehaviorState::Dead,
            _ => BehaviorState::Calm,
        }
    }
}

/// A character in the story, player or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub id: CharacterId,
    pub name: String,
    pub description: String,
    pub is_player: bool,
    pub location_id: Option<LocationId>,
    pub stats: BTreeMap<String, i64>,
    pub inventory: Vec<Item>,
    pub relationships: BTreeMap<CharacterId, i32>,
    #[serde(default)]
    pub state: BehaviorState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portrait: Option<String>,
}

impl Character {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let mut stats = BTreeMap::new();
        ensure_core_stats(&mut stats);
        Self {
            id: CharacterId::new(),
            name: name.into(),
            description: description.into(),
            is_player: false,
            location_id: None,
            stats,
            inventory: Vec::new(),
            relationships: BTreeMap::new(),
            state: BehaviorState::Calm,
            portrait: None,
        }
    }

    pub fn with_id(mut self, id: CharacterId) -> Self {
        self.id = id;
        self
    }

    pub fn as_player(mut self) -> Self {
        self.is_player = true;
        self
    }

    pub fn at(mut self, location: LocationId) -> Self {
        self.location_id = Some(location);
        self
    }

    pub fn hp(&self) -> i64 {
        self.stats.get("hp").copied().unwrap_or_default()
    }

    pub fn gold(&self) -> i64 {
        self.stats.get("gold").copied().unwrap_or_default()
    }

    /// Set an affinity, clamped to the allowed range.
    pub fn set_affinity(&mut self, other: CharacterId, affinity: i32) {
        self.relationships
            .insert(other, affinity.clamp(AFFINITY_MIN, AFFINITY_MAX));
    }

    /// Fold a partial update into this character.
    pub fn apply_patch(&mut self, patch: &CharacterPatch) {
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(location) = &patch.location_id {
            self.location_id = Some(location.clone());
        }
        for (key, value) in &patch.stats {
            self.stats.insert(key.clone(), *value);
        }
        ensure_core_stats(&mut self.stats);
        if let Some(inventory) = &patch.inventory {
            self.inventory = inventory.clone();
        }
        for (other, affinity) in &patch.relationships {
            self.set_affinity(other.clone(), *affinity);
        }
        if let Some(state) = patch.state {
            self.state = state;
        }
        if let Some(portrait) = &patch.portrait {
            self.portrait = Some(portrait.clone());
        }
    }
}

/// Make sure `hp`, `maxHp` and `gold` exist, deriving missing values from
/// what is present.
pub fn ensure_core_stats(stats: &mut BTreeMap<String, i64>) {
    let max_hp = stats
        .get("maxHp")
        .copied()
        .or_else(|| stats.get("hp").copied())
        .unwrap_or(DEFAULT_MAX_HP);
    stats.entry("maxHp".to_string()).or_insert(max_hp);
    stats.entry("hp".to_string()).or_insert(max_hp);
    stats.entry("gold".to_string()).or_insert(0);
}

/// A partial character update proposed by the oracle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharacterPatch {
    pub id: Option<CharacterId>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub location_id: Option<LocationId>,
    pub stats: BTreeMap<String, i64>,
    pub inventory: Option<Vec<Item>>,
    pub relationships: BTreeMap<CharacterId, i32>,
    pub state: Option<BehaviorState>,
    pub portrait: Option<String>,
}

// ============================================================================
// Locations
// ============================================================================

/// A place in the story world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub connected: Vec<LocationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
}

impl Location {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: LocationId::new(),
            name: name.into(),
            description: description.into(),
            connected: Vec::new(),
            background: None,
        }
    }

    pub fn connect(&mut self, other: &LocationId) {
        if &self.id != other && !self.connected.contains(other) {
            self.connected.push(other.clone());
        }
    }
}

// ============================================================================
// Messages and events
// ============================================================================

/// What kind of line a chat message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Narration,
    Dialogue,
    System,
}

impl MessageKind {
    /// Infer a kind from the sender when the payload carries no discriminant.
    pub fn infer_from_sender(sender: &str) -> Self {
        match sender.trim().to_lowercase().as_str() {
            "" | NARRATOR | "narration" | "dm" | "gm" => MessageKind::Narration,
            SYSTEM => MessageKind::System,
            _ => MessageKind::Dialogue,
        }
    }
}

/// One line of the story transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub text: String,
    pub kind: MessageKind,
    pub page: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
}

impl ChatMessage {
    pub fn narration(text: impl Into<String>, page: u32) -> Self {
        Self {
            id: MessageId::new(),
            sender_id: NARRATOR.to_string(),
            sender_name: None,
            text: text.into(),
            kind: MessageKind::Narration,
            page,
            timestamp: Utc::now(),
            tone: None,
        }
    }

    pub fn system(text: impl Into<String>, page: u32) -> Self {
        Self {
            sender_id: SYSTEM.to_string(),
            kind: MessageKind::System,
            ..Self::narration(text, page)
        }
    }

    pub fn dialogue(sender: &CharacterId, text: impl Into<String>, page: u32) -> Self {
        Self {
            sender_id: sender.to_string(),
            kind: MessageKind::Dialogue,
            ..Self::narration(text, page)
        }
    }
}

/// Sort messages by page then timestamp and drop repeated ids, keeping the
/// first occurrence. Returns how many messages were dropped.
pub fn canonicalize_messages(messages: &mut Vec<ChatMessage>) -> usize {
    messages.sort_by(|a, b| a.page.cmp(&b.page).then(a.timestamp.cmp(&b.timestamp)));
    let before = messages.len();
    let mut seen = std::collections::HashSet::new();
    messages.retain(|m| seen.insert(m.id.clone()));
    before - messages.len()
}

/// An entry in the story's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryEvent {
    pub id: EventId,
    pub turn: u32,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl StoryEvent {
    pub fn new(turn: u32, summary: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            turn,
            summary: summary.into(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// State deltas
// ============================================================================

/// Everything a turn proposes to change, besides the transcript itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    pub new_locations: Vec<Location>,
    pub new_characters: Vec<Character>,
    pub updated_characters: Vec<CharacterPatch>,
    /// Id or name of the location the player moves to.
    pub location_change: Option<String>,
    pub event_summary: Option<String>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.new_locations.is_empty()
            && self.new_characters.is_empty()
            && self.updated_characters.is_empty()
            && self.location_change.is_none()
            && self.event_summary.is_none()
    }
}

// ============================================================================
// Story
// ============================================================================

/// The root aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: StoryId,
    pub title: String,
    pub turn: u32,
    pub last_played: DateTime<Utc>,
    pub config: StoryConfig,
    pub current_location_id: LocationId,
    pub player_character_id: CharacterId,
    #[serde(default)]
    pub heavy_context: HeavyContext,
    pub characters: HashMap<CharacterId, Character>,
    pub locations: HashMap<LocationId, Location>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub events: Vec<StoryEvent>,
    #[serde(default)]
    pub snapshots: SnapshotHistory,
}

impl Story {
    /// Create a story around a player and a starting location.
    pub fn new(config: StoryConfig, player: Character, location: Location) -> Self {
        let player_id = player.id.clone();
        let location_id = location.id.clone();
        let player = player.as_player().at(location_id.clone());
        Self {
            id: StoryId::new(),
            title: config.title.clone(),
            turn: 0,
            last_played: Utc::now(),
            config,
            current_location_id: location_id.clone(),
            player_character_id: player_id.clone(),
            heavy_context: HeavyContext::default(),
            characters: HashMap::from([(player_id, player)]),
            locations: HashMap::from([(location_id, location)]),
            messages: Vec::new(),
            events: Vec::new(),
            snapshots: SnapshotHistory::default(),
        }
    }

    pub fn player(&self) -> Option<&Character> {
        self.characters.get(&self.player_character_id)
    }

    pub fn current_location(&self) -> Option<&Location> {
        self.locations.get(&self.current_location_id)
    }

    /// Characters other than the player standing in the current location.
    pub fn npcs_here(&self) -> Vec<&Character> {
        let mut here: Vec<_> = self
            .characters
            .values()
            .filter(|c| !c.is_player && c.location_id.as_ref() == Some(&self.current_location_id))
            .collect();
        here.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        here
    }

    pub fn last_message_id(&self) -> Option<&MessageId> {
        self.messages.last().map(|m| &m.id)
    }

    pub fn find_character_by_name(&self, name: &str) -> Option<&Character> {
        let needle = name.trim().to_lowercase();
        self.characters
            .values()
            .find(|c| c.name.trim().to_lowercase() == needle)
    }

    /// Resolve a location reference that may be an id or a name.
    pub fn resolve_location(&self, reference: &str) -> Option<LocationId> {
        let key = LocationId::from(reference);
        if self.locations.contains_key(&key) {
            return Some(key);
        }
        let needle = reference.trim().to_lowercase();
        self.locations
            .values()
            .find(|l| l.name.trim().to_lowercase() == needle)
            .map(|l| l.id.clone())
    }

    /// Check the aggregate invariants.
    pub fn validate(&self) -> Result<(), ModelError> {
        let player = self
            .player()
            .ok_or_else(|| ModelError::MissingPlayer(self.player_character_id.clone()))?;
        if !player.is_player {
            return Err(ModelError::PlayerNotFlagged(player.id.clone()));
        }
        if !self.locations.contains_key(&self.current_location_id) {
            return Err(ModelError::MissingLocation(self.current_location_id.clone()));
        }
        Ok(())
    }

    /// Append transcript lines for the given page, resolving dialogue
    /// senders to character ids. Unknown speakers become new characters in
    /// the current location.
    pub fn push_messages(&mut self, messages: Vec<ChatMessage>, page: u32) {
        for mut message in messages {
            message.page = page;
            if message.kind == MessageKind::Dialogue {
                message.sender_id = self.resolve_speaker(&message);
            }
            self.messages.push(message);
        }
    }

    fn resolve_speaker(&mut self, message: &ChatMessage) -> String {
        if self
            .characters
            .contains_key(&CharacterId::from(message.sender_id.as_str()))
        {
            return message.sender_id.clone();
        }

        let name = message
            .sender_name
            .clone()
            .unwrap_or_else(|| message.sender_id.clone());
        if let Some(existing) = self.find_character_by_name(&name) {
            return existing.id.to_string();
        }

        let speaker = Character::new(name, "").at(self.current_location_id.clone());
        let id = speaker.id.clone();
        tracing::debug!(story_id = %self.id, character = %speaker.name, "New speaker joined mid-turn");
        self.characters.insert(id.clone(), speaker);
        id.to_string()
    }

    /// Fold a turn's state delta into the story.
    pub fn apply_delta(&mut self, delta: StateDelta) {
        for mut location in delta.new_locations {
            if self.locations.contains_key(&location.id) {
                continue;
            }
            location.connect(&self.current_location_id);
            if let Some(current) = self.locations.get_mut(&self.current_location_id) {
                current.connect(&location.id);
            }
            self.locations.insert(location.id.clone(), location);
        }

        for mut character in delta.new_characters {
            if self.characters.contains_key(&character.id) {
                continue;
            }
            character.is_player = false;
            if character.location_id.is_none() {
                character.location_id = Some(self.current_location_id.clone());
            }
            self.characters.insert(character.id.clone(), character);
        }

        for patch in &delta.updated_characters {
            let target = patch
                .id
                .clone()
                .filter(|id| self.characters.contains_key(id))
                .or_else(|| {
                    patch
                        .name
                        .as_deref()
                        .and_then(|n| self.find_character_by_name(n))
                        .map(|c| c.id.clone())
                });
            match target.and_then(|id| self.characters.get_mut(&id)) {
                Some(character) => character.apply_patch(patch),
                None => tracing::debug!(story_id = %self.id, "Skipping update for unknown character"),
            }
        }

        if let Some(reference) = delta.location_change.as_deref() {
            match self.resolve_location(reference) {
                Some(location_id) => {
                    self.current_location_id = location_id.clone();
                    if let Some(player) = self.characters.get_mut(&self.player_character_id) {
                        player.location_id = Some(location_id);
                    }
                }
                None => tracing::warn!(story_id = %self.id, reference, "Location change to unknown place ignored"),
            }
        }

        if let Some(summary) = delta.event_summary.filter(|s| !s.trim().is_empty()) {
            self.events.push(StoryEvent::new(self.turn, summary));
        }
    }
}

//! Normalization of raw oracle turn output.
//!
//! The oracle is asked for JSON but what comes back is only loosely shaped:
//! fenced or wrapped in prose, in either of two historic message shapes,
//! with stats as lists or maps and inventories mixing bare strings with
//! structured entries. Everything here decodes permissively into wire types
//! first and then converts into the canonical model; individual bad fields
//! fall back to defaults, and only a reply with nothing usable at all is an
//! error.

use crate::model::{
    ensure_core_stats, BehaviorState, Character, CharacterId, CharacterPatch, ChatMessage, Item,
    ItemCategory, Location, LocationId, MessageId, MessageKind, StateDelta, AFFINITY_MAX,
    AFFINITY_MIN, NARRATOR, SYSTEM,
};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from normalizing a turn reply.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Reply contains no JSON: {0}")]
    NoJson(String),

    #[error("Reply JSON is malformed: {0}")]
    Malformed(String),

    #[error("Reply contains no messages or state changes")]
    Empty,
}

/// Canonical output of one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedTurn {
    pub messages: Vec<ChatMessage>,
    pub delta: StateDelta,
}

/// Extract JSON from a response that might have markdown code blocks or
/// surrounding prose.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    // Handle ```json ... ``` blocks
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Handle ``` ... ``` blocks (without json specifier)
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Outermost object or array embedded in prose
    let open = text.find(['{', '[']);
    let close = text.rfind(['}', ']']);
    match (open, close) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    }
}

/// Deserialize a list, dropping entries that fail to decode. A single
/// object is treated as a one-element list; anything else is empty.
pub fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        Some(single @ Value::Object(_)) => serde_json::from_value(single).ok().into_iter().collect(),
        _ => Vec::new(),
    })
}

/// Deserialize an optional field, reading a value of the wrong shape as
/// absent.
pub fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

/// A text field. Numbers are kept as their decimal form.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_page<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(number_like)
        .and_then(|n| u32::try_from(n).ok()))
}

/// A yes/no field given as a bool, a number or a word.
fn lenient_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "y" | "1"),
        _ => false,
    })
}

// ============================================================================
// Wire types
// ============================================================================

/// A turn reply as the oracle sends it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTurn {
    #[serde(default, deserialize_with = "lenient_vec")]
    messages: Vec<WireMessage>,
    #[serde(default)]
    narrative: Option<Value>,
    #[serde(default, alias = "new_locations", deserialize_with = "lenient_vec")]
    new_locations: Vec<WireLocation>,
    #[serde(default, alias = "new_characters", deserialize_with = "lenient_vec")]
    new_characters: Vec<WireCharacter>,
    #[serde(default, alias = "updated_characters", deserialize_with = "lenient_vec")]
    updated_characters: Vec<WireCharacter>,
    #[serde(default, alias = "location_change")]
    location_change: Option<Value>,
    #[serde(default, alias = "event_summary", alias = "summary")]
    event_summary: Option<Value>,
}

/// Either of the two message shapes the oracle has produced over time.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    Current(CurrentMessage),
    Legacy(LegacyMessage),
}

/// `{type, text, senderId, ...}`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    #[serde(default, rename = "type", alias = "kind", deserialize_with = "lenient_string")]
    kind: Option<String>,
    text: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, alias = "sender_id", deserialize_with = "lenient_string")]
    sender_id: Option<String>,
    #[serde(default, alias = "sender_name", deserialize_with = "lenient_string")]
    sender_name: Option<String>,
    #[serde(default, alias = "vocalTone", deserialize_with = "lenient_string")]
    tone: Option<String>,
    #[serde(default, alias = "new_character", deserialize_with = "lenient")]
    new_character: Option<WireCharacter>,
    #[serde(default, deserialize_with = "lenient_page")]
    page: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    timestamp: Option<DateTime<Utc>>,
}

/// `{sender, content, isNewCharacter, characterData}`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMessage {
    #[serde(default, rename = "type", deserialize_with = "lenient_string")]
    kind: Option<String>,
    content: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, deserialize_with = "lenient_string")]
    sender: Option<String>,
    #[serde(default, alias = "vocalTone", deserialize_with = "lenient_string")]
    tone: Option<String>,
    #[serde(default, deserialize_with = "lenient_flag")]
    is_new_character: bool,
    #[serde(default, deserialize_with = "lenient")]
    character_data: Option<WireCharacter>,
    #[serde(default, deserialize_with = "lenient_page")]
    page: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    timestamp: Option<DateTime<Utc>>,
}

/// A character entity in any of the shapes the oracle uses.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCharacter {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: Option<String>,
    #[serde(default, alias = "is_player", deserialize_with = "lenient_flag")]
    pub is_player: bool,
    #[serde(default, alias = "location_id", alias = "location")]
    pub location_id: Option<Value>,
    #[serde(default)]
    pub stats: Option<Value>,
    #[serde(default, alias = "items")]
    pub inventory: Option<Value>,
    #[serde(default)]
    pub relationships: Option<Value>,
    #[serde(default, alias = "behaviorState", alias = "behavior", deserialize_with = "lenient_string")]
    pub state: Option<String>,
    #[serde(default, alias = "avatar", deserialize_with = "lenient_string")]
    pub portrait: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLocation {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, deserialize_with = "lenient_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    description: Option<String>,
    #[serde(
        default,
        alias = "connectedLocationIds",
        alias = "connected_location_ids",
        alias = "connections",
        deserialize_with = "lenient_vec"
    )]
    connected: Vec<String>,
    #[serde(default, alias = "image", alias = "backgroundImage", deserialize_with = "lenient_string")]
    background: Option<String>,
}

// ============================================================================
// Conversion
// ============================================================================

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Free text given as a scalar or wrapped in a `{text}` object.
fn text_like(value: &Value) -> Option<String> {
    match value {
        Value::Object(obj) => first_field(obj, &["text", "summary", "content"]).and_then(scalar_string),
        other => scalar_string(other),
    }
}

fn number_like(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn first_field<'a>(object: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| object.get(*k))
}

fn canonical_stat_key(key: &str) -> String {
    match key.trim().to_lowercase().replace(['_', ' ', '-'], "").as_str() {
        "hp" | "health" | "hitpoints" | "currenthp" => "hp".to_string(),
        "maxhp" | "maxhealth" | "maxhitpoints" => "maxHp".to_string(),
        "gold" | "money" | "coins" => "gold".to_string(),
        _ => key.trim().to_string(),
    }
}

/// Stats as a map or as a list of `{key, value}` pairs.
pub fn stats_from_value(value: &Value) -> BTreeMap<String, i64> {
    let mut stats = BTreeMap::new();
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if let Some(n) = number_like(v) {
                    stats.insert(canonical_stat_key(key), n);
                }
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                let pair = match entry {
                    Value::Object(obj) => first_field(obj, &["key", "name", "stat"])
                        .and_then(scalar_string)
                        .zip(first_field(obj, &["value", "amount", "val"]).and_then(number_like)),
                    Value::Array(tuple) if tuple.len() == 2 => {
                        scalar_string(&tuple[0]).zip(number_like(&tuple[1]))
                    }
                    _ => None,
                };
                if let Some((key, n)) = pair {
                    stats.insert(canonical_stat_key(&key), n);
                }
            }
        }
        _ => {}
    }
    stats
}

/// Relationships as a map or a list of `{characterId, affinity}` entries.
pub fn relationships_from_value(value: &Value) -> BTreeMap<CharacterId, i32> {
    let clamp = |n: i64| n.clamp(i64::from(AFFINITY_MIN), i64::from(AFFINITY_MAX)) as i32;
    let mut relationships = BTreeMap::new();
    match value {
        Value::Object(map) => {
            for (id, v) in map {
                if let Some(n) = number_like(v) {
                    relationships.insert(CharacterId::from(id.as_str()), clamp(n));
                }
            }
        }
        Value::Array(entries) => {
            for entry in entries.iter().filter_map(Value::as_object) {
                let target = first_field(entry, &["characterId", "character_id", "id", "target", "name"])
                    .and_then(scalar_string);
                let affinity = first_field(entry, &["affinity", "value", "score"]).and_then(number_like);
                if let Some((target, n)) = target.zip(affinity) {
                    relationships.insert(CharacterId::from(target), clamp(n));
                }
            }
        }
        _ => {}
    }
    relationships
}

fn item_from_value(value: &Value) -> Option<Item> {
    match value {
        Value::String(name) if !name.trim().is_empty() => Some(Item::from_name(name.trim())),
        Value::Object(obj) => {
            let name = first_field(obj, &["name", "item", "title"]).and_then(scalar_string)?;
            let category = ItemCategory::parse_or_infer(
                first_field(obj, &["category", "type"]).and_then(Value::as_str),
                &name,
            );
            let quantity = first_field(obj, &["quantity", "qty", "count", "amount"])
                .and_then(number_like)
                .unwrap_or(1)
                .clamp(1, i64::from(u32::MAX)) as u32;
            let mut item = Item::new(name, category, quantity);
            if let Some(flag) = obj.get("stackable").and_then(Value::as_bool) {
                item.stackable = flag;
            }
            if let Some(flag) = obj.get("consumable").and_then(Value::as_bool) {
                item.consumable = flag;
            }
            if let Some(flag) = obj.get("sellable").and_then(Value::as_bool) {
                item.sellable = flag;
            }
            item.effects = match obj.get("effects").or_else(|| obj.get("effect")) {
                Some(Value::Array(effects)) => effects.iter().filter_map(scalar_string).collect(),
                Some(other) => scalar_string(other).into_iter().collect(),
                None => Vec::new(),
            };
            Some(item)
        }
        _ => None,
    }
}

/// Inventory from a list mixing plain names and structured entries.
pub fn inventory_from_value(value: &Value) -> Vec<Item> {
    match value {
        Value::Array(entries) => entries.iter().filter_map(item_from_value).collect(),
        single => item_from_value(single).into_iter().collect(),
    }
}

impl WireCharacter {
    fn id(&self) -> Option<CharacterId> {
        self.id.as_ref().and_then(scalar_string).map(CharacterId::from)
    }

    fn clean_name(&self) -> Option<String> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
    }

    /// Convert into a complete character, filling defaults.
    pub fn into_character(self) -> Character {
        let mut stats = self.stats.as_ref().map(stats_from_value).unwrap_or_default();
        ensure_core_stats(&mut stats);

        Character {
            id: self.id().unwrap_or_default(),
            name: self.clean_name().unwrap_or_else(|| "Stranger".to_string()),
            description: self.description.unwrap_or_default(),
            is_player: self.is_player,
            location_id: self
                .location_id
                .as_ref()
                .and_then(scalar_string)
                .map(LocationId::from),
            stats,
            inventory: self.inventory.as_ref().map(inventory_from_value).unwrap_or_default(),
            relationships: self
                .relationships
                .as_ref()
                .map(relationships_from_value)
                .unwrap_or_default(),
            state: self
                .state
                .as_deref()
                .map(BehaviorState::parse_lenient)
                .unwrap_or_default(),
            portrait: self.portrait,
        }
    }

    /// Convert into a partial update; only fields present are set.
    pub fn into_patch(self) -> CharacterPatch {
        CharacterPatch {
            id: self.id(),
            name: self.clean_name(),
            description: self.description,
            location_id: self
                .location_id
                .as_ref()
                .and_then(scalar_string)
                .map(LocationId::from),
            stats: self.stats.as_ref().map(stats_from_value).unwrap_or_default(),
            inventory: self.inventory.as_ref().map(inventory_from_value),
            relationships: self
                .relationships
                .as_ref()
                .map(relationships_from_value)
                .unwrap_or_default(),
            state: self.state.as_deref().map(BehaviorState::parse_lenient),
            portrait: self.portrait,
        }
    }
}

fn parse_kind(discriminant: Option<&str>, sender: &str) -> MessageKind {
    match discriminant.map(|d| d.trim().to_lowercase()).as_deref() {
        Some("narration") | Some("narrative") | Some("narrator") => MessageKind::Narration,
        Some("dialogue") | Some("dialog") | Some("speech") => MessageKind::Dialogue,
        Some("system") => MessageKind::System,
        _ => MessageKind::infer_from_sender(sender),
    }
}

impl WireMessage {
    /// Collapse either shape into a canonical message, handing back any
    /// inline new-character payload.
    pub fn into_canonical(self, fallback_time: DateTime<Utc>) -> (ChatMessage, Option<WireCharacter>) {
        let (kind, text, id, sender_id, sender_name, tone, new_character, page, timestamp) = match self {
            WireMessage::Current(m) => {
                let sender = m.sender_id.clone().or_else(|| m.sender_name.clone()).unwrap_or_default();
                let kind = parse_kind(m.kind.as_deref(), &sender);
                (kind, m.text, m.id, sender, m.sender_name, m.tone, m.new_character, m.page, m.timestamp)
            }
            WireMessage::Legacy(m) => {
                let sender = m.sender.unwrap_or_default();
                let kind = parse_kind(m.kind.as_deref(), &sender);
                let new_character = if m.is_new_character || m.character_data.is_some() {
                    m.character_data.or_else(|| {
                        Some(WireCharacter {
                            name: Some(sender.clone()),
                            ..Default::default()
                        })
                    })
                } else {
                    None
                };
                let name = (kind == MessageKind::Dialogue).then(|| sender.clone());
                (kind, m.content, m.id, sender, name, m.tone, new_character, m.page, m.timestamp)
            }
        };

        let sender_id = match kind {
            MessageKind::Narration => NARRATOR.to_string(),
            MessageKind::System => SYSTEM.to_string(),
            MessageKind::Dialogue => sender_id,
        };

        let message = ChatMessage {
            id: id.as_ref().and_then(scalar_string).map(MessageId::from).unwrap_or_default(),
            sender_id,
            sender_name,
            text: text.trim().to_string(),
            kind,
            page: page.unwrap_or(0),
            timestamp: timestamp.unwrap_or(fallback_time),
            tone,
        };

        // Inline character data only counts on dialogue lines.
        let new_character = new_character.filter(|_| kind == MessageKind::Dialogue);
        (message, new_character)
    }

    /// Like [`into_canonical`](Self::into_canonical) for a line the oracle
    /// just produced. Any id or timestamp it supplied is discarded; the line
    /// gets a new id and `stamp`.
    pub fn into_fresh(self, stamp: DateTime<Utc>) -> (ChatMessage, Option<WireCharacter>) {
        let (mut message, new_character) = self.into_canonical(stamp);
        message.id = MessageId::new();
        message.timestamp = stamp;
        (message, new_character)
    }
}

/// Upgrade a stored message of any historic shape into the canonical form.
///
/// This is the single migration point for legacy message records.
pub fn upgrade_message(value: Value) -> Option<ChatMessage> {
    if let Ok(message) = serde_json::from_value::<ChatMessage>(value.clone()) {
        return Some(message);
    }
    let wire: WireMessage = serde_json::from_value(value).ok()?;
    let (message, _) = wire.into_canonical(Utc::now());
    Some(message)
}

fn location_reference(value: &Value) -> Option<String> {
    match value {
        Value::Object(obj) => first_field(obj, &["id", "locationId", "name"]).and_then(scalar_string),
        other => scalar_string(other),
    }
}

fn same_character(a: &Character, b: &Character) -> bool {
    a.id == b.id || a.name.trim().to_lowercase() == b.name.trim().to_lowercase()
}

/// Normalize a raw turn reply.
pub fn normalize_turn(raw: &str) -> Result<NormalizedTurn, NormalizeError> {
    let json = extract_json(raw);
    if !json.starts_with(['{', '[']) {
        return Err(NormalizeError::NoJson(raw.chars().take(80).collect()));
    }

    let value: Value =
        serde_json::from_str(json).map_err(|e| NormalizeError::Malformed(e.to_string()))?;
    let wire: WireTurn = match value {
        Value::Array(_) => WireTurn {
            messages: lenient_vec(value).unwrap_or_default(),
            ..Default::default()
        },
        Value::Object(_) => {
            serde_json::from_value(value).map_err(|e| NormalizeError::Malformed(e.to_string()))?
        }
        _ => return Err(NormalizeError::Malformed("expected an object".to_string())),
    };

    canonicalize(wire)
}

fn canonicalize(wire: WireTurn) -> Result<NormalizedTurn, NormalizeError> {
    let base_time = Utc::now();
    let mut messages = Vec::new();
    let mut new_characters: Vec<Character> = Vec::new();

    for character in wire.new_characters {
        let character = character.into_character();
        if !new_characters.iter().any(|c| same_character(c, &character)) {
            new_characters.push(character);
        }
    }

    for (index, wire_message) in wire.messages.into_iter().enumerate() {
        let stamp = base_time + Duration::microseconds(index as i64);
        let (mut message, inline) = wire_message.into_fresh(stamp);
        if message.text.is_empty() {
            continue;
        }

        if let Some(mut data) = inline {
            if data.name.is_none() {
                data.name = message.sender_name.clone().or_else(|| Some(message.sender_id.clone()));
            }
            if data.id.is_none() && !message.sender_id.is_empty() {
                data.id = Some(Value::String(message.sender_id.clone()));
            }
            let lifted = data.into_character();
            let existing = new_characters.iter().find(|c| same_character(c, &lifted)).cloned();
            let speaker = match existing {
                Some(existing) => existing,
                None => {
                    new_characters.push(lifted.clone());
                    lifted
                }
            };
            message.sender_id = speaker.id.to_string();
            message.sender_name = Some(speaker.name.clone());
        }

        messages.push(message);
    }

    if messages.is_empty() {
        if let Some(text) = wire.narrative.as_ref().and_then(text_like) {
            let mut line = ChatMessage::narration(text, 0);
            line.timestamp = base_time;
            messages.push(line);
        }
    }

    let new_locations = wire
        .new_locations
        .into_iter()
        .filter_map(|l| {
            let name = l.name.as_deref().map(str::trim).filter(|n| !n.is_empty())?.to_string();
            Some(Location {
                id: l.id.as_ref().and_then(scalar_string).map(LocationId::from).unwrap_or_default(),
                name,
                description: l.description.unwrap_or_default(),
                connected: l.connected.into_iter().map(LocationId::from).collect(),
                background: l.background,
            })
        })
        .collect();

    let delta = StateDelta {
        new_locations,
        new_characters,
        updated_characters: wire
            .updated_characters
            .into_iter()
            .map(WireCharacter::into_patch)
            .filter(|p| p.id.is_some() || p.name.is_some())
            .collect(),
        location_change: wire.location_change.as_ref().and_then(location_reference),
        event_summary: wire.event_summary.as_ref().and_then(text_like),
    };

    if messages.is_empty() && delta.is_empty() {
        return Err(NormalizeError::Empty);
    }

    Ok(NormalizedTurn { messages, delta })
}

//! Story persistence over SQLite.
//!
//! A story is split into a meta row plus one row per character, location,
//! message and event, each stamped with the owning story id. Every
//! operation runs inside a single transaction so a story is never partially
//! written. Export and import wrap a full story in a versioned envelope.

use crate::grid::{insert_snapshot, load_history};
use crate::model::{
    canonicalize_messages, Character, CharacterId, EventId, Location, MessageId, ModelError,
    SnapshotId, Story, StoryEvent, StoryId,
};
use crate::normalize::upgrade_message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Story failed validation: {0}")]
    Invalid(#[from] ModelError),
}

/// Reasons an export envelope is rejected on import.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Import is not valid JSON: {0}")]
    Malformed(String),

    #[error("Unsupported export version: expected {expected}, found {found}")]
    UnsupportedVersion { expected: u32, found: i64 },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid collection {field}: {reason}")]
    InvalidCollection { field: &'static str, reason: String },

    #[error("Imported story is inconsistent: {0}")]
    Inconsistent(#[from] ModelError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Current export envelope version.
pub const EXPORT_VERSION: u32 = 1;

/// Fields every exported story must carry.
const REQUIRED_STORY_FIELDS: &[&str] = &[
    "id",
    "title",
    "config",
    "playerCharacterId",
    "currentLocationId",
    "characters",
    "locations",
    "messages",
];

/// Child tables keyed by `(story_id, id)`.
const CHILD_TABLES: &[&str] = &["characters", "locations", "messages", "events"];

/// A portable, versioned copy of one story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEnvelope {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub story: Story,
}

impl ExportEnvelope {
    pub fn new(story: Story) -> Self {
        Self {
            version: EXPORT_VERSION,
            exported_at: Utc::now(),
            story,
        }
    }

    /// Write to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

/// Create every table the engine uses.
pub async fn migrate(pool: &SqlitePool) -> Result<(), PersistError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stories (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            turn INTEGER NOT NULL,
            last_played TEXT NOT NULL,
            config TEXT NOT NULL,
            current_location_id TEXT NOT NULL,
            player_character_id TEXT NOT NULL,
            heavy_context TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for table in CHILD_TABLES {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                story_id TEXT NOT NULL,
                id TEXT NOT NULL,
                position INTEGER NOT NULL,
                revision TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (story_id, id)
            )
            "#
        ))
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            id TEXT PRIMARY KEY,
            story_id TEXT NOT NULL,
            turn INTEGER NOT NULL,
            captured_at TEXT NOT NULL,
            location_id TEXT NOT NULL,
            location_name TEXT NOT NULL,
            positions TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS snapshots_story_turn ON snapshots (story_id, turn)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS option_cache (
            story_id TEXT PRIMARY KEY,
            record TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Transactional story storage.
#[derive(Clone)]
pub struct StoryStore {
    pool: SqlitePool,
}

impl StoryStore {
    /// Wrap an existing pool, creating tables as needed.
    pub async fn new(pool: SqlitePool) -> Result<Self, PersistError> {
        migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Connect to a database URL such as `sqlite://saga.db?mode=rwc`.
    pub async fn connect(url: &str) -> Result<Self, PersistError> {
        let pool = SqlitePoolOptions::new().connect(url).await?;
        tracing::info!(url, "Connected to story database");
        Self::new(pool).await
    }

    /// A private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, PersistError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::new(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Upsert the whole aggregate in one transaction.
    ///
    /// Child rows the story no longer contains are removed, so saving the
    /// same story twice leaves identical stored state.
    pub async fn save(&self, story: &Story) -> Result<(), PersistError> {
        story.validate()?;

        let mut messages = story.messages.clone();
        let dropped = canonicalize_messages(&mut messages);
        if dropped > 0 {
            tracing::debug!(story_id = %story.id, dropped, "Dropped duplicate messages before save");
        }

        let revision = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO stories (id, title, turn, last_played, config, current_location_id,
                                 player_character_id, heavy_context)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                turn = excluded.turn,
                last_played = excluded.last_played,
                config = excluded.config,
                current_location_id = excluded.current_location_id,
                player_character_id = excluded.player_character_id,
                heavy_context = excluded.heavy_context
            "#,
        )
        .bind(story.id.as_str())
        .bind(&story.title)
        .bind(i64::from(story.turn))
        .bind(story.last_played)
        .bind(serde_json::to_string(&story.config)?)
        .bind(story.current_location_id.as_str())
        .bind(story.player_character_id.as_str())
        .bind(serde_json::to_string(&story.heavy_context)?)
        .execute(&mut *tx)
        .await?;

        for character in story.characters.values() {
            let data = serde_json::to_string(character)?;
            upsert_child(&mut tx, "characters", &story.id, character.id.as_str(), 0, &revision, data).await?;
        }
        for location in story.locations.values() {
            let data = serde_json::to_string(location)?;
            upsert_child(&mut tx, "locations", &story.id, location.id.as_str(), 0, &revision, data).await?;
        }
        for (position, message) in messages.iter().enumerate() {
            let data = serde_json::to_string(message)?;
            upsert_child(&mut tx, "messages", &story.id, message.id.as_str(), position, &revision, data).await?;
        }
        for (position, event) in story.events.iter().enumerate() {
            let data = serde_json::to_string(event)?;
            upsert_child(&mut tx, "events", &story.id, event.id.as_str(), position, &revision, data).await?;
        }
        for table in CHILD_TABLES {
            sqlx::query(&format!("DELETE FROM {table} WHERE story_id = ? AND revision <> ?"))
                .bind(story.id.as_str())
                .bind(&revision)
                .execute(&mut *tx)
                .await?;
        }

        for snapshot in story.snapshots.iter() {
            insert_snapshot(&mut tx, snapshot).await?;
        }

        tx.commit().await?;
        tracing::debug!(
            story_id = %story.id,
            turn = story.turn,
            messages = messages.len(),
            "Story saved"
        );
        Ok(())
    }

    /// Load a story, or `None` if it does not exist.
    ///
    /// Duplicate messages are pruned from the result and a corrective save is
    /// scheduled in the background.
    pub async fn load(&self, id: &StoryId) -> Result<Option<Story>, PersistError> {
        let mut tx = self.pool.begin().await?;

        let meta = sqlx::query(META_COLUMNS_QUERY)
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(meta) = meta else {
            return Ok(None);
        };
        let mut story = story_from_meta(&meta)?;

        for data in fetch_children(&mut tx, "characters", id).await? {
            let character: Character = serde_json::from_str(&data)?;
            story.characters.insert(character.id.clone(), character);
        }
        for data in fetch_children(&mut tx, "locations", id).await? {
            let location: Location = serde_json::from_str(&data)?;
            story.locations.insert(location.id.clone(), location);
        }
        for data in fetch_children(&mut tx, "messages", id).await? {
            let value: Value = serde_json::from_str(&data)?;
            let message = upgrade_message(value)
                .ok_or_else(|| PersistError::Corrupt(format!("unreadable message in story {id}")))?;
            story.messages.push(message);
        }
        for data in fetch_children(&mut tx, "events", id).await? {
            let event: StoryEvent = serde_json::from_str(&data)?;
            story.events.push(event);
        }
        story.snapshots = load_history(&mut tx, id).await?;

        tx.commit().await?;

        let removed = canonicalize_messages(&mut story.messages);
        if removed > 0 {
            tracing::warn!(story_id = %id, removed, "Duplicate messages pruned on load; re-saving");
            let store = self.clone();
            let corrected = story.clone();
            tokio::spawn(async move {
                if let Err(e) = store.save(&corrected).await {
                    tracing::error!(story_id = %corrected.id, error = %e, "Corrective re-save failed");
                }
            });
        }

        Ok(Some(story))
    }

    /// Meta fields for every story, most recently played first. Child
    /// collections are left empty.
    pub async fn list_summaries(&self) -> Result<Vec<Story>, PersistError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, turn, last_played, config, current_location_id,
                   player_character_id, heavy_context
            FROM stories
            ORDER BY last_played DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(story_from_meta).collect()
    }

    /// Delete a story and everything it owns. Returns whether it existed.
    pub async fn delete(&self, id: &StoryId) -> Result<bool, PersistError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM stories WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for table in CHILD_TABLES.iter().chain(&["snapshots", "option_cache"]) {
            sqlx::query(&format!("DELETE FROM {table} WHERE story_id = ?"))
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        tracing::info!(story_id = %id, existed = removed > 0, "Story deleted");
        Ok(removed > 0)
    }

    /// Wrap a stored story in an export envelope.
    pub async fn export(&self, id: &StoryId) -> Result<Option<ExportEnvelope>, PersistError> {
        Ok(self.load(id).await?.map(ExportEnvelope::new))
    }

    /// Export a story straight to a JSON file. Returns whether it existed.
    pub async fn export_to_file(&self, id: &StoryId, path: impl AsRef<Path>) -> Result<bool, PersistError> {
        match self.export(id).await? {
            Some(envelope) => {
                envelope.save_json(path).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Validate an export envelope and store it as a brand new story.
    ///
    /// Story, player, message, event and snapshot ids are all replaced so
    /// the same file can be imported any number of times.
    pub async fn import(&self, json: &str) -> Result<Story, ImportError> {
        let story = rekey(parse_envelope(json)?);
        self.save(&story).await?;
        tracing::info!(story_id = %story.id, title = %story.title, "Story imported");
        Ok(story)
    }

    pub async fn import_file(&self, path: impl AsRef<Path>) -> Result<Story, ImportError> {
        let content = tokio::fs::read_to_string(path).await.map_err(PersistError::from)?;
        self.import(&content).await
    }
}

const META_COLUMNS_QUERY: &str = r#"
    SELECT id, title, turn, last_played, config, current_location_id,
           player_character_id, heavy_context
    FROM stories
    WHERE id = ?
"#;

async fn upsert_child(
    conn: &mut SqliteConnection,
    table: &str,
    story_id: &StoryId,
    id: &str,
    position: usize,
    revision: &str,
    data: String,
) -> Result<(), PersistError> {
    let sql = format!(
        r#"
        INSERT INTO {table} (story_id, id, position, revision, data)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(story_id, id) DO UPDATE SET
            position = excluded.position,
            revision = excluded.revision,
            data = excluded.data
        "#
    );
    sqlx::query(&sql)
        .bind(story_id.as_str())
        .bind(id)
        .bind(position as i64)
        .bind(revision)
        .bind(data)
        .execute(conn)
        .await?;
    Ok(())
}

async fn fetch_children(
    conn: &mut SqliteConnection,
    table: &str,
    story_id: &StoryId,
) -> Result<Vec<String>, PersistError> {
    let rows = sqlx::query(&format!(
        "SELECT data FROM {table} WHERE story_id = ? ORDER BY position, rowid"
    ))
    .bind(story_id.as_str())
    .fetch_all(conn)
    .await?;

    rows.iter()
        .map(|row| row.try_get::<String, _>("data").map_err(PersistError::from))
        .collect()
}

fn story_from_meta(row: &SqliteRow) -> Result<Story, PersistError> {
    let turn: i64 = row.try_get("turn")?;
    let config: String = row.try_get("config")?;
    let heavy_context: String = row.try_get("heavy_context")?;

    Ok(Story {
        id: StoryId(row.try_get("id")?),
        title: row.try_get("title")?,
        turn: u32::try_from(turn).map_err(|_| PersistError::Corrupt(format!("story turn {turn}")))?,
        last_played: row.try_get("last_played")?,
        config: serde_json::from_str(&config)?,
        current_location_id: row.try_get::<String, _>("current_location_id")?.into(),
        player_character_id: row.try_get::<String, _>("player_character_id")?.into(),
        heavy_context: serde_json::from_str(&heavy_context)?,
        characters: HashMap::new(),
        locations: HashMap::new(),
        messages: Vec::new(),
        events: Vec::new(),
        snapshots: Default::default(),
    })
}

// ============================================================================
// Import
// ============================================================================

/// Turn a character or location collection into an id-keyed map. Arrays
/// are accepted and keyed by each entry's `id`.
fn keyed_collection(story: &mut serde_json::Map<String, Value>, field: &'static str) -> Result<(), ImportError> {
    let invalid = |reason: String| ImportError::InvalidCollection { field, reason };
    let Some(collection) = story.get_mut(field) else {
        return Err(ImportError::MissingField(format!("story.{field}")));
    };

    match collection {
        Value::Object(_) => Ok(()),
        Value::Array(entries) => {
            let mut keyed = serde_json::Map::new();
            for (index, entry) in entries.drain(..).enumerate() {
                let id = entry
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid(format!("entry {index} has no id")))?
                    .to_string();
                keyed.insert(id, entry);
            }
            *collection = Value::Object(keyed);
            Ok(())
        }
        other => Err(invalid(format!("expected an array or object, found {other}"))),
    }
}

fn upgrade_messages(story: &mut serde_json::Map<String, Value>) -> Result<(), ImportError> {
    let Some(Value::Array(entries)) = story.get_mut("messages") else {
        return Err(ImportError::InvalidCollection {
            field: "messages",
            reason: "expected an array".to_string(),
        });
    };

    let mut upgraded = Vec::with_capacity(entries.len());
    for (index, entry) in entries.drain(..).enumerate() {
        let message = upgrade_message(entry).ok_or_else(|| ImportError::InvalidCollection {
            field: "messages",
            reason: format!("entry {index} is not a message"),
        })?;
        upgraded.push(serde_json::to_value(message).map_err(PersistError::from)?);
    }
    *entries = upgraded;
    Ok(())
}

/// Validate an envelope and decode the story it carries.
fn parse_envelope(json: &str) -> Result<Story, ImportError> {
    let mut envelope: Value =
        serde_json::from_str(json).map_err(|e| ImportError::Malformed(e.to_string()))?;

    let version = envelope
        .get("version")
        .ok_or_else(|| ImportError::MissingField("version".to_string()))?
        .as_i64()
        .ok_or_else(|| ImportError::Malformed("version is not an integer".to_string()))?;
    if version != i64::from(EXPORT_VERSION) {
        return Err(ImportError::UnsupportedVersion {
            expected: EXPORT_VERSION,
            found: version,
        });
    }

    let story = match envelope.get_mut("story") {
        Some(Value::Object(story)) => story,
        Some(_) => return Err(ImportError::Malformed("story is not an object".to_string())),
        None => return Err(ImportError::MissingField("story".to_string())),
    };
    if let Some(missing) = REQUIRED_STORY_FIELDS.iter().find(|f| !story.contains_key(**f)) {
        return Err(ImportError::MissingField(format!("story.{missing}")));
    }

    keyed_collection(story, "characters")?;
    keyed_collection(story, "locations")?;
    upgrade_messages(story)?;

    let story_value = Value::Object(std::mem::take(story));
    let mut story: Story =
        serde_json::from_value(story_value).map_err(|e| ImportError::Malformed(e.to_string()))?;
    story.validate()?;
    canonicalize_messages(&mut story.messages);
    Ok(story)
}

/// Give a story fresh identifiers, re-pointing every player reference.
fn rekey(mut story: Story) -> Story {
    story.id = StoryId::new();

    let old_player = story.player_character_id.clone();
    let new_player = CharacterId::new();
    if let Some(mut player) = story.characters.remove(&old_player) {
        player.id = new_player.clone();
        story.characters.insert(new_player.clone(), player);
    }
    story.player_character_id = new_player.clone();

    for character in story.characters.values_mut() {
        if let Some(affinity) = character.relationships.remove(&old_player) {
            character.relationships.insert(new_player.clone(), affinity);
        }
    }

    for message in &mut story.messages {
        message.id = MessageId::new();
        if message.sender_id == old_player.as_str() {
            message.sender_id = new_player.to_string();
        }
    }
    for event in &mut story.events {
        event.id = EventId::new();
    }

    let story_id = story.id.clone();
    for snapshot in story.snapshots.iter_mut() {
        snapshot.id = SnapshotId::new();
        snapshot.story_id = story_id.clone();
        for position in &mut snapshot.positions {
            if position.character_id == old_player {
                position.character_id = new_player.clone();
            }
        }
    }

    story
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoryConfig;
    use crate::model::ChatMessage;
    use serde_json::json;

    fn sample_story() -> Story {
        let mut story = Story::new(
            StoryConfig::new("Ledger"),
            Character::new("Ivo", "clerk"),
            Location::new("Counting House", "ink and dust"),
        );
        let player = story.player_character_id.clone();
        story.messages.push(ChatMessage::narration("The ledger is open.", 0));
        story.messages.push(ChatMessage::dialogue(&player, "Whose handwriting is this?", 1));
        story
    }

    #[test]
    fn test_parse_envelope_rejects_bad_version() {
        let json = json!({"version": 9, "exportedAt": Utc::now(), "story": {}}).to_string();
        assert!(matches!(
            parse_envelope(&json),
            Err(ImportError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[test]
    fn test_parse_envelope_reports_missing_field() {
        let mut story = serde_json::to_value(sample_story()).unwrap();
        story.as_object_mut().unwrap().remove("playerCharacterId");
        let json = json!({"version": EXPORT_VERSION, "story": story}).to_string();
        match parse_envelope(&json) {
            Err(ImportError::MissingField(field)) => assert_eq!(field, "story.playerCharacterId"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_envelope_rejects_bad_collection() {
        let mut story = serde_json::to_value(sample_story()).unwrap();
        story["locations"] = json!("nowhere");
        let json = json!({"version": EXPORT_VERSION, "story": story}).to_string();
        assert!(matches!(
            parse_envelope(&json),
            Err(ImportError::InvalidCollection { field: "locations", .. })
        ));
    }

    #[test]
    fn test_parse_envelope_accepts_arrays_and_legacy_messages() {
        let original = sample_story();
        let mut story = serde_json::to_value(&original).unwrap();
        let characters: Vec<Value> = original
            .characters
            .values()
            .map(|c| serde_json::to_value(c).unwrap())
            .collect();
        story["characters"] = Value::Array(characters);
        story["messages"]
            .as_array_mut()
            .unwrap()
            .push(json!({"sender": "narrator", "content": "Legacy line", "page": 2}));
        let json = json!({"version": EXPORT_VERSION, "story": story}).to_string();

        let parsed = parse_envelope(&json).unwrap();
        assert_eq!(parsed.characters.len(), 1);
        assert_eq!(parsed.messages.len(), 3);
        assert_eq!(parsed.messages[2].text, "Legacy line");
    }

    #[test]
    fn test_rekey_repoints_player_references() {
        let original = sample_story();
        let old_player = original.player_character_id.clone();
        let story = rekey(original.clone());

        assert_ne!(story.id, original.id);
        assert_ne!(story.player_character_id, old_player);
        assert!(story.player().unwrap().is_player);
        assert_eq!(story.messages[1].sender_id, story.player_character_id.to_string());
        assert!(story
            .messages
            .iter()
            .zip(&original.messages)
            .all(|(new, old)| new.id != old.id));
    }
}

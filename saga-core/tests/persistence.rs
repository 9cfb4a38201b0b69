//! Integration tests for story storage, export and import.
//!
//! Run with: `cargo test -p saga-core --test persistence`

use saga_core::grid::{initial_snapshot, SnapshotStore};
use saga_core::model::{ChatMessage, StoryId};
use saga_core::persist::EXPORT_VERSION;
use saga_core::testing::{assert_canonical_order, assert_unique_messages, assert_valid, sample_story};
use saga_core::{ExportEnvelope, ImportError, StoryStore};
use serde_json::{json, Value};
use tempfile::TempDir;

fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("saga_core=debug")
        .with_test_writer()
        .try_init();
}

async fn store() -> StoryStore {
    StoryStore::in_memory().await.expect("Failed to open store")
}

#[tokio::test]
async fn test_save_and_load_round_trip() {
    setup();
    let store = store().await;
    let mut story = sample_story();
    let snapshot = initial_snapshot(&story);
    story.snapshots.append(snapshot.clone());
    story.heavy_context.main_mission = Some("Deliver the letter".to_string());

    store.save(&story).await.unwrap();
    let loaded = store.load(&story.id).await.unwrap().expect("Story should exist");

    assert_eq!(loaded.title, story.title);
    assert_eq!(loaded.player_character_id, story.player_character_id);
    assert_eq!(loaded.characters, story.characters);
    assert_eq!(loaded.locations, story.locations);
    assert_eq!(loaded.messages, story.messages);
    assert_eq!(loaded.heavy_context, story.heavy_context);
    let restored = loaded.snapshots.latest().expect("Snapshot should persist");
    assert_eq!(restored.id, snapshot.id);
    assert_eq!(restored.positions, snapshot.positions);
    assert_valid(&loaded);
}

#[tokio::test]
async fn test_missing_story_loads_as_none() {
    setup();
    let store = store().await;
    assert!(store.load(&StoryId::new()).await.unwrap().is_none());
    assert!(!store.delete(&StoryId::new()).await.unwrap());
}

#[tokio::test]
async fn test_save_is_idempotent_and_prunes_removed_rows() {
    setup();
    let store = store().await;
    let mut story = sample_story();
    story.push_messages(vec![ChatMessage::narration("A bell tolls.", 1)], 1);

    store.save(&story).await.unwrap();
    store.save(&story).await.unwrap();
    let loaded = store.load(&story.id).await.unwrap().unwrap();
    assert_eq!(loaded.messages.len(), story.messages.len());

    story.messages.pop();
    store.save(&story).await.unwrap();
    let loaded = store.load(&story.id).await.unwrap().unwrap();
    assert_eq!(loaded.messages, story.messages);
}

#[tokio::test]
async fn test_duplicate_messages_collapse_on_save() {
    setup();
    let store = store().await;
    let mut story = sample_story();
    let repeated = ChatMessage::narration("Echo.", 1);
    story.messages.push(repeated.clone());
    story.messages.push(repeated);

    store.save(&story).await.unwrap();
    let loaded = store.load(&story.id).await.unwrap().unwrap();
    assert_eq!(loaded.messages.len(), 2);
    assert_unique_messages(&loaded);
    assert_canonical_order(&loaded);
}

async fn message_rows(store: &StoryStore, id: &StoryId) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE story_id = ?")
        .bind(id.as_str())
        .fetch_one(store.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_duplicate_rows_are_pruned_on_load() {
    setup();
    let store = store().await;
    let story = sample_story();
    store.save(&story).await.unwrap();

    // A second row carrying the same message under another row key.
    let copy = serde_json::to_string(&story.messages[0]).unwrap();
    sqlx::query("INSERT INTO messages (story_id, id, position, revision, data) VALUES (?, ?, ?, ?, ?)")
        .bind(story.id.as_str())
        .bind("stray-row")
        .bind(99_i64)
        .bind("stale")
        .bind(&copy)
        .execute(store.pool())
        .await
        .unwrap();
    assert_eq!(message_rows(&store, &story.id).await, 2);

    let loaded = store.load(&story.id).await.unwrap().unwrap();
    assert_eq!(loaded.messages, story.messages);
    assert_unique_messages(&loaded);

    let mut rows = message_rows(&store, &story.id).await;
    for _ in 0..50 {
        if rows == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        rows = message_rows(&store, &story.id).await;
    }
    assert_eq!(rows, 1, "Re-save should drop the stray row");
}

#[tokio::test]
async fn test_invalid_story_is_rejected() {
    setup();
    let store = store().await;
    let mut story = sample_story();
    story.characters.clear();
    assert!(store.save(&story).await.is_err());
    assert!(store.load(&story.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_list_summaries_newest_first() {
    setup();
    let store = store().await;
    let mut older = sample_story();
    older.last_played = older.last_played - chrono::Duration::hours(1);
    older.title = "Older".to_string();
    let newer = sample_story();

    store.save(&older).await.unwrap();
    store.save(&newer).await.unwrap();

    let summaries = store.list_summaries().await.unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].id, newer.id);
    assert_eq!(summaries[1].title, "Older");
    assert!(summaries.iter().all(|s| s.messages.is_empty() && s.characters.is_empty()));
}

#[tokio::test]
async fn test_delete_removes_everything() {
    setup();
    let store = store().await;
    let mut story = sample_story();
    story.snapshots.append(initial_snapshot(&story));
    store.save(&story).await.unwrap();

    assert!(store.delete(&story.id).await.unwrap());
    assert!(store.load(&story.id).await.unwrap().is_none());
    let snapshots = SnapshotStore::new(store.pool().clone());
    assert!(snapshots.history(&story.id).await.unwrap().is_empty());
    assert!(store.list_summaries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_export_import_creates_fresh_copy() {
    setup();
    let store = store().await;
    let mut story = sample_story();
    let player_id = story.player_character_id.clone();
    story.push_messages(vec![ChatMessage::dialogue(&player_id, "Any letters for me?", 0)], 0);
    story.snapshots.append(initial_snapshot(&story));
    store.save(&story).await.unwrap();

    let envelope = store.export(&story.id).await.unwrap().unwrap();
    assert_eq!(envelope.version, EXPORT_VERSION);
    let json = serde_json::to_string(&envelope).unwrap();

    let first = store.import(&json).await.unwrap();
    let second = store.import(&json).await.unwrap();

    assert_ne!(first.id, story.id);
    assert_ne!(first.id, second.id);
    assert_ne!(first.player_character_id, story.player_character_id);
    assert_eq!(first.title, story.title);
    assert_eq!(first.messages.len(), story.messages.len());
    assert_valid(&first);
    let line = first.messages.iter().find(|m| m.text == "Any letters for me?").unwrap();
    assert_eq!(line.sender_id, first.player_character_id.to_string());

    let snapshot = first.snapshots.latest().unwrap();
    assert_eq!(snapshot.story_id, first.id);
    assert!(snapshot.position_of(&first.player_character_id).is_some());

    assert_eq!(store.list_summaries().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_export_to_file_and_back() {
    setup();
    let store = store().await;
    let story = sample_story();
    store.save(&story).await.unwrap();

    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let path = temp_dir.path().join("story.json");
    assert!(store.export_to_file(&story.id, &path).await.unwrap());
    assert!(!store.export_to_file(&StoryId::new(), temp_dir.path().join("none.json")).await.unwrap());

    let imported = store.import_file(&path).await.unwrap();
    assert_eq!(imported.title, story.title);
}

fn envelope_value() -> Value {
    serde_json::to_value(ExportEnvelope::new(sample_story())).unwrap()
}

#[tokio::test]
async fn test_import_rejects_bad_envelopes() {
    setup();
    let store = store().await;

    assert!(matches!(store.import("not json").await, Err(ImportError::Malformed(_))));

    let mut wrong_version = envelope_value();
    wrong_version["version"] = json!(99);
    assert!(matches!(
        store.import(&wrong_version.to_string()).await,
        Err(ImportError::UnsupportedVersion { found: 99, .. })
    ));

    let mut missing = envelope_value();
    missing["story"].as_object_mut().unwrap().remove("playerCharacterId");
    assert!(matches!(
        store.import(&missing.to_string()).await,
        Err(ImportError::MissingField(field)) if field == "story.playerCharacterId"
    ));

    let mut bad_collection = envelope_value();
    bad_collection["story"]["messages"] = json!("lots");
    assert!(matches!(
        store.import(&bad_collection.to_string()).await,
        Err(ImportError::InvalidCollection { field: "messages", .. })
    ));

    assert!(store.list_summaries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_import_upgrades_legacy_messages() {
    setup();
    let store = store().await;
    let mut envelope = envelope_value();
    let messages = envelope["story"]["messages"].as_array_mut().unwrap();
    messages.push(json!({"sender": "Bram", "content": "Cod! Fresh cod!", "page": 0}));

    let story = store.import(&envelope.to_string()).await.unwrap();
    let legacy = story.messages.iter().find(|m| m.text == "Cod! Fresh cod!").unwrap();
    let bram = story.find_character_by_name("Bram").unwrap();
    assert_eq!(legacy.sender_name.as_deref(), Some("Bram"));
    assert!(legacy.sender_id == bram.id.to_string() || legacy.sender_id == "Bram");
}

//! Integration tests for playing turns against a scripted oracle.
//!
//! Run with: `cargo test -p saga-core --test turn`

use saga_core::fate::resolve_fate;
use saga_core::grid::SnapshotStore;
use saga_core::testing::{assert_canonical_order, assert_unique_messages, sample_story};
use saga_core::{
    ActionOption, EngineConfig, FateOutcome, ScriptedOracle, StoryStore, TurnEngine, TurnError,
};
use std::sync::Arc;

fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("saga_core=debug")
        .with_test_writer()
        .try_init();
}

const TURN_REPLY: &str = r#"```json
{
  "messages": [
    {"type": "narration", "text": "Gulls scatter as you cross the square."},
    {"type": "dialogue", "senderName": "Bram", "text": "Fresh cod, courier!"},
    {"type": "dialogue", "senderName": "Odile", "text": "Don't trust his scales.",
     "newCharacter": {"name": "Odile", "description": "A sharp-eyed grocer"}}
  ],
  "new_locations": [{"name": "Lighthouse", "description": "A white tower"}],
  "updated_characters": [{"name": "Wren", "stats": {"gold": 7}}],
  "event_summary": "Wren met Odile at the market"
}
```"#;

const CONTEXT_REPLY: &str = r#"{
  "current_mission": {"action": "set", "value": "Deliver the sealed letter"},
  "active_problems": [{"action": "add", "value": "Bram overcharges"}]
}"#;

async fn engine(oracle: Arc<ScriptedOracle>) -> TurnEngine {
    let store = StoryStore::in_memory().await.expect("Failed to open store");
    TurnEngine::new(oracle, store, EngineConfig::default())
}

#[tokio::test]
async fn test_turn_appends_messages_and_persists() {
    setup();
    let oracle = Arc::new(
        ScriptedOracle::new()
            .reply("story_turn", TURN_REPLY)
            .reply("context_changes", CONTEXT_REPLY),
    );
    let engine = engine(oracle.clone()).await;
    let mut story = sample_story();
    let before = story.messages.len();

    let outcome = engine
        .play_turn(&mut story, "Walk to the fish stall", None)
        .await
        .expect("Turn should succeed");

    assert_eq!(story.turn, 1);
    assert_eq!(outcome.messages.len(), 4);
    assert_eq!(story.messages.len(), before + 4);
    assert_eq!(outcome.messages[0].sender_id, story.player_character_id.to_string());
    assert!(outcome.messages.iter().all(|m| m.page == 1));
    assert!(outcome.fate.is_none());

    let bram = story.find_character_by_name("Bram").unwrap();
    assert_eq!(outcome.messages[2].sender_id, bram.id.to_string());
    assert!(story.find_character_by_name("Odile").is_some());
    assert!(story.locations.values().any(|l| l.name == "Lighthouse"));
    assert_eq!(story.player().unwrap().gold(), 7);
    assert_eq!(story.events.last().unwrap().summary, "Wren met Odile at the market");

    assert!(outcome.context_updated);
    assert_eq!(
        story.heavy_context.current_mission.as_deref(),
        Some("Deliver the sealed letter")
    );

    let loaded = engine.store().load(&story.id).await.unwrap().unwrap();
    assert_eq!(loaded.turn, 1);
    assert_eq!(loaded.messages, story.messages);
    assert_eq!(loaded.heavy_context, story.heavy_context);
    assert_unique_messages(&loaded);
    assert_canonical_order(&loaded);
}

#[tokio::test]
async fn test_unusable_reply_leaves_story_untouched() {
    setup();
    let oracle = Arc::new(ScriptedOracle::new().reply("story_turn", "The narrator is lost for words."));
    let engine = engine(oracle.clone()).await;
    let mut story = sample_story();
    let snapshot = story.clone();

    let err = engine.play_turn(&mut story, "Look around", None).await.unwrap_err();
    assert!(matches!(err, TurnError::Normalize(_)));
    assert_eq!(story, snapshot);
    assert_eq!(oracle.calls("context_changes"), 0);
    assert!(engine.store().load(&story.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_oracle_failure_surfaces() {
    setup();
    let oracle = Arc::new(ScriptedOracle::new().fail("story_turn", 1));
    let engine = engine(oracle).await;
    let mut story = sample_story();

    let err = engine.play_turn(&mut story, "Look around", None).await.unwrap_err();
    assert!(matches!(err, TurnError::Oracle(_)));
    assert_eq!(story.turn, 0);
}

#[tokio::test]
async fn test_fate_reaches_the_prompt() {
    setup();
    let oracle = Arc::new(ScriptedOracle::new().reply("story_turn", TURN_REPLY));
    let engine = engine(oracle.clone()).await;
    let mut story = sample_story();

    let option = ActionOption::new("Haggle hard", 0, 50).with_hints(None, Some("Bram takes offense".to_string()));
    let fate = resolve_fate(&option, 10.0);
    assert_eq!(fate.outcome, FateOutcome::Bad);

    let outcome = engine
        .play_turn_with_fate(&mut story, &option.text, Some(fate.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.fate, Some(fate));
    let prompt = oracle.last_prompt("story_turn").unwrap();
    assert!(prompt.contains("Bram takes offense"));
    // Context analysis failed, the turn still stands.
    assert!(!outcome.context_updated);
    assert_eq!(story.turn, 1);
}

#[tokio::test]
async fn test_tactical_turn_records_snapshot() {
    setup();
    let oracle = Arc::new(
        ScriptedOracle::new()
            .reply("story_turn", TURN_REPLY)
            .reply(
                "grid_update",
                r#"{"positions": [{"character": "Bram", "x": 3, "y": 12}, {"character": "Nobody", "x": 1, "y": 1}]}"#,
            ),
    );
    let engine = engine(oracle.clone()).await;
    let mut story = sample_story();
    story.config.tactical_mode = true;

    let outcome = engine.play_turn(&mut story, "Step closer", None).await.unwrap();
    let snapshot = outcome.snapshot.expect("Tactical turns capture a snapshot");
    assert_eq!(snapshot.turn, 1);
    assert_eq!(story.snapshots.len(), 1);

    let bram = story.find_character_by_name("Bram").unwrap();
    let cell = snapshot.position_of(&bram.id).unwrap();
    assert_eq!((cell.x, cell.y), (3, 9));
    assert!(snapshot.position_of(&story.player_character_id).is_some());

    let snapshots = SnapshotStore::new(engine.store().pool().clone());
    let stored = snapshots.query_as_of(&story.id, 5).await.unwrap().unwrap();
    assert_eq!(stored.id, snapshot.id);
    assert!(snapshots.query_as_of(&story.id, 0).await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_tactical_turn_skips_grid() {
    setup();
    let oracle = Arc::new(ScriptedOracle::new().reply("story_turn", TURN_REPLY));
    let engine = engine(oracle.clone()).await;
    let mut story = sample_story();

    let outcome = engine.play_turn(&mut story, "Wait", None).await.unwrap();
    assert!(outcome.snapshot.is_none());
    assert_eq!(oracle.calls("grid_update"), 0);
}

#[tokio::test]
async fn test_repeated_oracle_ids_survive_reload() {
    setup();
    let oracle = Arc::new(
        ScriptedOracle::new()
            .reply("story_turn", r#"{"messages": [{"id": "1", "type": "narration", "text": "The fog lifts."}]}"#)
            .reply("story_turn", r#"{"messages": [{"id": "1", "type": "narration", "text": "The fog returns."}]}"#),
    );
    let engine = engine(oracle).await;
    let mut story = sample_story();

    engine.play_turn(&mut story, "Wait", None).await.unwrap();
    engine.play_turn(&mut story, "Wait longer", None).await.unwrap();

    let loaded = engine.store().load(&story.id).await.unwrap().unwrap();
    assert_eq!(loaded.messages, story.messages);
    assert!(loaded.messages.iter().any(|m| m.text == "The fog lifts."));
    assert!(loaded.messages.iter().any(|m| m.text == "The fog returns."));
    assert_unique_messages(&loaded);
}

#[tokio::test]
async fn test_oracle_timestamps_do_not_reorder_the_turn() {
    setup();
    let oracle = Arc::new(ScriptedOracle::new().reply(
        "story_turn",
        r#"{"messages": [{"type": "narration", "text": "Long ago.", "timestamp": "1999-01-01T00:00:00Z"}]}"#,
    ));
    let engine = engine(oracle).await;
    let mut story = sample_story();

    engine.play_turn(&mut story, "Remember", None).await.unwrap();

    let loaded = engine.store().load(&story.id).await.unwrap().unwrap();
    let page: Vec<_> = loaded.messages.iter().filter(|m| m.page == 1).map(|m| m.text.as_str()).collect();
    assert_eq!(page, vec!["Remember", "Long ago."]);
    assert_canonical_order(&loaded);
}

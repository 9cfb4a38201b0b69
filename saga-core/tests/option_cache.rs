//! Integration tests for action menu caching and request coalescing.
//!
//! Run with: `cargo test -p saga-core --test option_cache`

use saga_core::model::ChatMessage;
use saga_core::options::{cache_key, CachedOptions};
use saga_core::testing::sample_story;
use saga_core::{ActionOption, EngineConfig, OptionsError, ScriptedOracle, StoryStore, TurnEngine};
use std::sync::Arc;
use std::time::Duration;

fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("saga_core=debug")
        .with_test_writer()
        .try_init();
}

const MENU: &str = r#"{"options": [
    {"text": "Buy the cod", "goodChance": 20, "badChance": 10},
    {"text": "Follow the gulls", "goodChance": 35, "badChance": 90, "badHint": "They lead you astray"},
    {"text": "Ask Bram about the letter", "goodChance": 15, "badChance": 5}
]}"#;

async fn engine(oracle: Arc<ScriptedOracle>) -> TurnEngine {
    let store = StoryStore::in_memory().await.expect("Failed to open store");
    TurnEngine::new(oracle, store, EngineConfig::default())
}

#[tokio::test]
async fn test_concurrent_requests_share_one_generation() {
    setup();
    let oracle = Arc::new(
        ScriptedOracle::new()
            .with_delay(Duration::from_millis(50))
            .always("action_options", MENU),
    );
    let engine = engine(oracle.clone()).await;
    let story = sample_story();

    let (first, second) = futures::join!(engine.action_options(&story), engine.action_options(&story));
    let first = first.unwrap();
    assert_eq!(first, second.unwrap());
    assert_eq!(first.len(), 3);
    assert_eq!(first[1].bad_chance, 50);
    assert_eq!(oracle.calls("action_options"), 1);

    let again = engine.action_options(&story).await.unwrap();
    assert_eq!(again, first);
    assert_eq!(oracle.calls("action_options"), 1);
}

#[tokio::test]
async fn test_new_position_regenerates() {
    setup();
    let oracle = Arc::new(ScriptedOracle::new().always("action_options", MENU));
    let engine = engine(oracle.clone()).await;
    let mut story = sample_story();

    engine.action_options(&story).await.unwrap();
    story.turn += 1;
    story.push_messages(vec![ChatMessage::narration("Rain begins.", 1)], 1);
    engine.action_options(&story).await.unwrap();
    assert_eq!(oracle.calls("action_options"), 2);

    let stored = engine.option_cache().get(&story.id).await.unwrap();
    assert_eq!(stored.cache_key, cache_key(&story));
    assert_eq!(
        stored.last_message_id.as_deref(),
        story.last_message_id().map(|id| id.as_str())
    );
}

#[tokio::test]
async fn test_failed_generation_is_not_cached() {
    setup();
    let oracle = Arc::new(
        ScriptedOracle::new()
            .fail("action_options", 1)
            .always("action_options", MENU),
    );
    let engine = engine(oracle.clone()).await;
    let story = sample_story();

    let err = engine.action_options(&story).await.unwrap_err();
    assert!(matches!(err, OptionsError::Generator(_)));
    assert!(engine.option_cache().get(&story.id).await.is_none());

    let options = engine.action_options(&story).await.unwrap();
    assert_eq!(options.len(), 3);
    assert_eq!(oracle.calls("action_options"), 2);
}

#[tokio::test]
async fn test_stored_menu_survives_a_new_cache_handle() {
    setup();
    let oracle = Arc::new(ScriptedOracle::new());
    let engine = engine(oracle.clone()).await;
    let story = sample_story();

    engine
        .option_cache()
        .put(
            &story.id,
            &CachedOptions {
                cache_key: cache_key(&story),
                last_message_id: None,
                options: vec![ActionOption::new("Wait for the tide", 5, 5)],
            },
        )
        .await;

    let fresh = TurnEngine::new(oracle.clone(), engine.store().clone(), EngineConfig::default());
    let options = fresh.action_options(&story).await.unwrap();
    assert_eq!(options[0].text, "Wait for the tide");
    assert_eq!(oracle.total_calls(), 0);
}

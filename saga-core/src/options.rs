//! Memoized action menus.
//!
//! The options offered to the player are generated by the oracle once per
//! `{story, cache key}` and stored so a reload shows the same menu.
//! Concurrent requests for the same pending pair share a single generation.

use crate::fate::ActionOption;
use crate::model::{Story, StoryId};
use crate::normalize::lenient_vec;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from resolving a menu.
#[derive(Debug, Clone, Error)]
pub enum OptionsError {
    #[error("Option generation failed: {0}")]
    Generator(String),
}

/// The stored menu for one story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedOptions {
    pub cache_key: String,
    #[serde(default)]
    pub last_message_id: Option<String>,
    pub options: Vec<ActionOption>,
}

/// Stored shape, including records written before the cache key existed.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredOptions {
    #[serde(default)]
    cache_key: Option<String>,
    #[serde(default)]
    last_message_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_vec")]
    options: Vec<ActionOption>,
}

impl StoredOptions {
    fn into_cached(self) -> Option<CachedOptions> {
        let cache_key = self.cache_key.or_else(|| self.last_message_id.clone())?;
        Some(CachedOptions {
            cache_key,
            last_message_id: self.last_message_id,
            options: self.options,
        })
    }
}

/// The cache key for a story's current position.
pub fn cache_key(story: &Story) -> String {
    format!(
        "{}:{}:{}",
        story.id,
        story.turn,
        story.last_message_id().map(|id| id.as_str()).unwrap_or("-")
    )
}

type PendingMenu = Shared<BoxFuture<'static, Result<Vec<ActionOption>, OptionsError>>>;

struct MirrorEntry {
    raw: String,
    cached: CachedOptions,
}

struct Inner {
    pool: SqlitePool,
    mirror: Mutex<HashMap<StoryId, MirrorEntry>>,
    pending: Mutex<HashMap<(StoryId, String), PendingMenu>>,
}

/// Option cache handle. Cloning shares the same mirror and pending table.
#[derive(Clone)]
pub struct OptionCache {
    inner: Arc<Inner>,
}

impl OptionCache {
    /// Wrap a pool whose schema has already been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                mirror: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    async fn read_raw(&self, story_id: &StoryId) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query("SELECT record FROM option_cache WHERE story_id = ?")
            .bind(story_id.as_str())
            .fetch_optional(&self.inner.pool)
            .await?;
        row.map(|r| r.try_get::<String, _>("record")).transpose()
    }

    /// The last stored menu for a story. Store failures read as a miss.
    pub async fn get(&self, story_id: &StoryId) -> Option<CachedOptions> {
        let raw = match self.read_raw(story_id).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(story_id = %story_id, error = %e, "Option cache read failed");
                return None;
            }
        };

        let mut mirror = self.inner.mirror.lock().await;
        let Some(raw) = raw else {
            mirror.remove(story_id);
            return None;
        };

        if let Some(entry) = mirror.get(story_id) {
            if entry.raw == raw {
                return Some(entry.cached.clone());
            }
        }

        let cached = serde_json::from_str::<StoredOptions>(&raw)
            .ok()
            .and_then(StoredOptions::into_cached);
        match cached {
            Some(cached) => {
                mirror.insert(
                    story_id.clone(),
                    MirrorEntry {
                        raw,
                        cached: cached.clone(),
                    },
                );
                Some(cached)
            }
            None => {
                tracing::warn!(story_id = %story_id, "Stored option menu unreadable");
                mirror.remove(story_id);
                None
            }
        }
    }

    /// Overwrite the stored menu. Failures are logged and swallowed.
    pub async fn put(&self, story_id: &StoryId, cached: &CachedOptions) {
        let raw = match serde_json::to_string(cached) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(story_id = %story_id, error = %e, "Option menu not serializable");
                return;
            }
        };

        let result = sqlx::query(
            r#"
            INSERT INTO option_cache (story_id, record, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(story_id) DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at
            "#,
        )
        .bind(story_id.as_str())
        .bind(&raw)
        .bind(Utc::now())
        .execute(&self.inner.pool)
        .await;

        match result {
            Ok(_) => {
                self.inner.mirror.lock().await.insert(
                    story_id.clone(),
                    MirrorEntry {
                        raw,
                        cached: cached.clone(),
                    },
                );
            }
            Err(e) => tracing::warn!(story_id = %story_id, error = %e, "Option cache write failed"),
        }
    }

    async fn stored(&self, story_id: &StoryId, cache_key: &str) -> Option<Vec<ActionOption>> {
        let cached = self.get(story_id).await.filter(|c| c.cache_key == cache_key)?;
        tracing::debug!(story_id = %story_id, cache_key, "Option menu cache hit");
        Some(cached.options)
    }

    /// Return the menu for `cache_key`, generating it if needed.
    ///
    /// A stored record with the same key is returned without calling
    /// `generator`. Otherwise callers asking for the same pending
    /// `{story_id, cache_key}` all await one generation.
    pub async fn resolve<F, Fut, E>(
        &self,
        story_id: &StoryId,
        cache_key: &str,
        message_id: Option<&str>,
        generator: F,
    ) -> Result<Vec<ActionOption>, OptionsError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<ActionOption>, E>> + Send + 'static,
        E: Display,
    {
        if let Some(options) = self.stored(story_id, cache_key).await {
            return Ok(options);
        }

        let key = (story_id.clone(), cache_key.to_string());
        let shared = {
            let mut pending = self.inner.pending.lock().await;
            if let Some(existing) = pending.get(&key) {
                tracing::debug!(story_id = %story_id, cache_key, "Joining in-flight option generation");
                existing.clone()
            } else if let Some(options) = self.stored(story_id, cache_key).await {
                // A generation finished between the first lookup and the lock.
                return Ok(options);
            } else {
                let generation = generator();
                let cache = self.clone();
                let record = CachedOptions {
                    cache_key: cache_key.to_string(),
                    last_message_id: message_id.map(str::to_string),
                    options: Vec::new(),
                };
                let pending_key = key.clone();

                let future = async move {
                    let result = generation
                        .await
                        .map_err(|e| OptionsError::Generator(e.to_string()));
                    if let Ok(options) = &result {
                        let record = CachedOptions {
                            options: options.clone(),
                            ..record
                        };
                        cache.put(&pending_key.0, &record).await;
                    }
                    cache.inner.pending.lock().await.remove(&pending_key);
                    result
                }
                .boxed()
                .shared();

                pending.insert(key, future.clone());
                future
            }
        };

        shared.await
    }
}

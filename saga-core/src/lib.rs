//! Turn reconciliation and persistence core for oracle-driven stories.
//!
//! This crate provides:
//! - Fate rolls for the side effects of a chosen action
//! - Normalization of loosely-shaped oracle replies into canonical records
//! - Spatial snapshots of who stands where, queryable by turn
//! - Long-term story memory ("heavy context") reconciliation
//! - A coalescing cache for per-position action menus
//! - SQLite persistence with import/export
//! - Multi-phase story creation with deterministic fallbacks
//!
//! # Quick Start
//!
//! ```ignore
//! use saga_core::{EngineConfig, NoAvatar, Orchestrator, StoryStore, TurnEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_env()?;
//!     let store = StoryStore::connect(&config.database_url).await?;
//!     let oracle = Arc::new(oracle::HttpOracle::from_env()?);
//!
//!     let orchestrator = Orchestrator::new(oracle.clone(), Arc::new(NoAvatar), store.clone(), config.clone());
//!     let mut story = orchestrator.create_story(orchestrator.story_config("Salt Road")).await?.story;
//!
//!     let engine = TurnEngine::new(oracle, store, config);
//!     let options = engine.action_options(&story).await?;
//!     let outcome = engine.play_turn(&mut story, &options[0].text, options.first()).await?;
//!     for message in outcome.messages {
//!         println!("{}", message.text);
//!     }
//!     Ok(())
//! }
//! ```

pub mod avatar;
pub mod config;
pub mod context;
pub mod fate;
pub mod grid;
pub mod init;
pub mod model;
pub mod normalize;
pub mod options;
pub mod persist;
pub mod session;
pub mod testing;

// Re-export for convenience
pub use saga_macros::PhaseSchema;

// Primary public API
pub use avatar::{AvatarArtist, AvatarRequest, NoAvatar};
pub use config::{ConfigError, EngineConfig, StoryConfig};
pub use context::{ContextAnalyst, ContextChanges, ContextUpdate, HeavyContext};
pub use fate::{roll_fate, ActionOption, FateOutcome, FateResult};
pub use grid::{GridPosition, GridSnapshot, SnapshotHistory, SnapshotStore};
pub use init::{InitOutcome, Orchestrator, Phase, PhaseTelemetry};
pub use model::{Character, CharacterId, ChatMessage, Location, LocationId, MessageId, Story, StoryId};
pub use normalize::{normalize_turn, NormalizeError, NormalizedTurn};
pub use options::{OptionCache, OptionsError};
pub use persist::{ExportEnvelope, ImportError, PersistError, StoryStore};
pub use session::{TurnEngine, TurnError, TurnOutcome};
pub use testing::{ScriptedOracle, StaticArtist};

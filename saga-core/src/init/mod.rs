//! Story creation.
//!
//! A new story is bootstrapped through a fixed graph of phases:
//!
//! ```text
//! Blueprint ─┬─ StartingLocation
//!            ├─ PlayerSheet ── AvatarArt
//!            ├─ SupportingNpcs
//!            ├─ OpeningNarration
//!            ├─ QuestHooks
//!            └─ SpatialSeed (tactical mode only)
//! ```
//!
//! Each phase asks the oracle for a reply matching its schema. Any failure
//! is replaced by a deterministic fallback, so story creation itself can
//! only fail when the finished story cannot be saved.

pub mod assemble;
pub mod fallback;
pub mod phases;

pub use assemble::{assemble, PhaseOutputs, SeedMap};
pub use phases::Phase;

use crate::avatar::{AvatarArtist, AvatarRequest};
use crate::config::{EngineConfig, StoryConfig};
use crate::model::Story;
use crate::normalize::extract_json;
use crate::persist::{PersistError, StoryStore};
use oracle::{Oracle, ReplySchema, Request};
use phases::{
    blueprint_prompt, dependent_prompt, Blueprint, LocationSheet, OpeningScene, PhaseReply,
    PlayerSheet, QuestHooks, SpatialSeed, SupportingCast, SYSTEM_PROMPT,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Why a phase reply was rejected.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Oracle call failed: {0}")]
    Oracle(#[from] oracle::Error),

    #[error("Reply is not JSON: {0}")]
    Parse(String),

    #[error("Reply is missing required field `{0}`")]
    MissingField(String),

    #[error("Reply does not match schema: {0}")]
    Schema(String),

    #[error("Reply failed validation: {0}")]
    Invalid(String),

    #[error("No image produced")]
    NoImage,
}

/// Timing and outcome of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTelemetry {
    pub phase: Phase,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A freshly created story and how its phases went.
#[derive(Debug, Clone)]
pub struct InitOutcome {
    pub story: Story,
    pub telemetry: Vec<PhaseTelemetry>,
}

impl InitOutcome {
    pub fn telemetry_for(&self, phase: Phase) -> Option<&PhaseTelemetry> {
        self.telemetry.iter().find(|t| t.phase == phase)
    }

    /// Phases that fell back.
    pub fn failed_phases(&self) -> Vec<Phase> {
        self.telemetry.iter().filter(|t| !t.success).map(|t| t.phase).collect()
    }
}

/// Decode and validate a raw phase reply.
pub fn parse_reply<T>(text: &str) -> Result<T, PhaseError>
where
    T: ReplySchema + DeserializeOwned + PhaseReply,
{
    let value: Value =
        serde_json::from_str(extract_json(text)).map_err(|e| PhaseError::Parse(e.to_string()))?;

    let schema = T::schema();
    for field in schema.required_fields() {
        if value.get(field).map_or(true, Value::is_null) {
            return Err(PhaseError::MissingField(field.to_string()));
        }
    }

    let reply: T = serde_json::from_value(value).map_err(|e| PhaseError::Schema(e.to_string()))?;
    reply.validate().map_err(PhaseError::Invalid)?;
    Ok(reply)
}

fn record(phase: Phase, started: Instant, result: Result<(), &PhaseError>) -> PhaseTelemetry {
    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(()) => {
            tracing::info!(%phase, duration_ms, "Phase succeeded");
            PhaseTelemetry {
                phase,
                duration_ms,
                success: true,
                error: None,
            }
        }
        Err(e) => {
            tracing::warn!(%phase, duration_ms, error = %e, "Phase failed; using fallback");
            PhaseTelemetry {
                phase,
                duration_ms,
                success: false,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Runs the phase graph and saves the result.
pub struct Orchestrator {
    oracle: Arc<dyn Oracle>,
    artist: Arc<dyn AvatarArtist>,
    store: StoryStore,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        artist: Arc<dyn AvatarArtist>,
        store: StoryStore,
        config: EngineConfig,
    ) -> Self {
        Self {
            oracle,
            artist,
            store,
            config,
        }
    }

    pub fn store(&self) -> &StoryStore {
        &self.store
    }

    /// A story config carrying this engine's defaults.
    pub fn story_config(&self, title: impl Into<String>) -> StoryConfig {
        StoryConfig::new(title).with_tactical_mode(self.config.tactical_mode_default)
    }

    /// Run one oracle phase, substituting the fallback on any failure.
    async fn run_phase<T>(
        &self,
        phase: Phase,
        prompt: String,
        fallback: impl FnOnce() -> T,
    ) -> (T, PhaseTelemetry)
    where
        T: ReplySchema + DeserializeOwned + PhaseReply,
    {
        let started = Instant::now();
        let request = self.config.apply(
            Request::new(prompt)
                .with_system(SYSTEM_PROMPT)
                .with_schema(T::schema()),
        );

        let result = match self.oracle.generate(request).await {
            Ok(text) => parse_reply::<T>(&text),
            Err(e) => Err(PhaseError::from(e)),
        };

        match result {
            Ok(reply) => (reply, record(phase, started, Ok(()))),
            Err(e) => (fallback(), record(phase, started, Err(&e))),
        }
    }

    async fn avatar(&self, sheet: &PlayerSheet) -> (Option<String>, PhaseTelemetry) {
        let started = Instant::now();
        let portrait = self
            .artist
            .render(AvatarRequest {
                name: sheet.name.clone(),
                description: sheet.description.clone(),
                prompt: sheet.portrait_prompt.clone(),
            })
            .await;
        let telemetry = match portrait {
            Some(_) => record(Phase::AvatarArt, started, Ok(())),
            None => record(Phase::AvatarArt, started, Err(&PhaseError::NoImage)),
        };
        (portrait, telemetry)
    }

    /// Create, assemble and save a new story.
    pub async fn create_story(&self, config: StoryConfig) -> Result<InitOutcome, PersistError> {
        tracing::info!(title = %config.title, tactical = config.tactical_mode, "Creating story");

        let (blueprint, blueprint_telemetry) = self
            .run_phase::<Blueprint>(Phase::Blueprint, blueprint_prompt(&config), || {
                fallback::blueprint(&config)
            })
            .await;

        let location = self.run_phase::<LocationSheet>(
            Phase::StartingLocation,
            dependent_prompt(Phase::StartingLocation, &config, &blueprint),
            || fallback::starting_location(&blueprint),
        );

        let player = async {
            let (sheet, sheet_telemetry) = self
                .run_phase::<PlayerSheet>(
                    Phase::PlayerSheet,
                    dependent_prompt(Phase::PlayerSheet, &config, &blueprint),
                    || fallback::player_sheet(&config),
                )
                .await;
            let (portrait, avatar_telemetry) = self.avatar(&sheet).await;
            (sheet, portrait, sheet_telemetry, avatar_telemetry)
        };

        let cast = self.run_phase::<SupportingCast>(
            Phase::SupportingNpcs,
            dependent_prompt(Phase::SupportingNpcs, &config, &blueprint),
            || fallback::supporting_cast(&config, &blueprint),
        );

        let opening = self.run_phase::<OpeningScene>(
            Phase::OpeningNarration,
            dependent_prompt(Phase::OpeningNarration, &config, &blueprint),
            || fallback::opening_scene(&config, &blueprint),
        );

        let quests = self.run_phase::<QuestHooks>(
            Phase::QuestHooks,
            dependent_prompt(Phase::QuestHooks, &config, &blueprint),
            || fallback::quest_hooks(&blueprint),
        );

        let spatial = async {
            if !config.tactical_mode {
                return None;
            }
            // A failed spatial phase falls back to the radial layout.
            let (seed, telemetry) = self
                .run_phase::<SpatialSeed>(
                    Phase::SpatialSeed,
                    dependent_prompt(Phase::SpatialSeed, &config, &blueprint),
                    || SpatialSeed { positions: Vec::new() },
                )
                .await;
            Some((seed, telemetry))
        };

        let (
            (location, location_telemetry),
            (player, portrait, player_telemetry, avatar_telemetry),
            (cast, cast_telemetry),
            (opening, opening_telemetry),
            (quests, quest_telemetry),
            spatial,
        ) = futures::join!(location, player, cast, opening, quests, spatial);

        let mut telemetry = vec![
            blueprint_telemetry,
            location_telemetry,
            player_telemetry,
            cast_telemetry,
            opening_telemetry,
            quest_telemetry,
        ];
        let spatial = spatial.map(|(seed, spatial_telemetry)| {
            telemetry.push(spatial_telemetry);
            seed
        });
        telemetry.push(avatar_telemetry);

        let story = assemble(
            config,
            PhaseOutputs {
                blueprint,
                location,
                player,
                portrait,
                cast,
                opening,
                quests,
                spatial,
            },
        );

        self.store.save(&story).await?;
        tracing::info!(
            story_id = %story.id,
            title = %story.title,
            fallbacks = telemetry.iter().filter(|t| !t.success).count(),
            "Story created"
        );

        Ok(InitOutcome { story, telemetry })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_checks_required_fields() {
        let err = parse_reply::<QuestHooks>(r#"{"current_mission": "x"}"#).unwrap_err();
        assert!(matches!(err, PhaseError::MissingField(f) if f == "main_mission"));
    }

    #[test]
    fn test_parse_reply_runs_validation() {
        let err = parse_reply::<QuestHooks>(r#"{"main_mission": "   "}"#).unwrap_err();
        assert!(matches!(err, PhaseError::Invalid(_)));
    }

    #[test]
    fn test_parse_reply_rejects_wrong_types() {
        let err = parse_reply::<LocationSheet>(r#"{"name": 5, "description": "d"}"#).unwrap_err();
        assert!(matches!(err, PhaseError::Schema(_)));
    }

    #[test]
    fn test_parse_reply_accepts_fenced_json() {
        let text = "```json\n{\"main_mission\": \"Find the well\", \"active_problems\": [\"Drought\"]}\n```";
        let hooks = parse_reply::<QuestHooks>(text).unwrap();
        assert_eq!(hooks.main_mission, "Find the well");
        assert_eq!(hooks.active_problems, vec!["Drought"]);
    }

    #[test]
    fn test_parse_reply_rejects_prose() {
        assert!(matches!(
            parse_reply::<Blueprint>("I'd rather not."),
            Err(PhaseError::Parse(_))
        ));
    }
}

//! Deterministic stand-ins for failed phases.
//!
//! Every fallback is derived only from the story configuration and the
//! blueprint, so the same inputs always produce the same story skeleton.

use super::phases::{
    Blueprint, CastSeed, LocationSheet, OpeningScene, PlayerSheet, QuestHooks, SupportingCast,
};
use crate::config::StoryConfig;
use crate::normalize::{WireCharacter, WireMessage};
use serde_json::{json, Value};

/// Seed id of the companion used when no supporting cast survives.
pub const COMPANION_SEED: &str = "companion";

fn genre_place(genre: &str) -> &'static str {
    let genre = genre.to_lowercase();
    if genre.contains("sci") || genre.contains("space") || genre.contains("cyber") {
        "Docking Ring Seven"
    } else if genre.contains("noir") || genre.contains("modern") || genre.contains("mystery") {
        "The Rain-Soaked Precinct"
    } else if genre.contains("horror") {
        "The Abandoned Chapel"
    } else {
        "The Crossroads Inn"
    }
}

fn companion_name(genre: &str) -> &'static str {
    let genre = genre.to_lowercase();
    if genre.contains("sci") || genre.contains("space") || genre.contains("cyber") {
        "Quartermaster Ilse"
    } else if genre.contains("noir") || genre.contains("modern") || genre.contains("mystery") {
        "Sergeant Doyle"
    } else {
        "Old Maren"
    }
}

pub fn blueprint(config: &StoryConfig) -> Blueprint {
    let title = if config.title.trim().is_empty() {
        format!("A {} Tale", config.genre)
    } else {
        config.title.clone()
    };
    let setting = if config.premise.trim().is_empty() {
        format!("A {} world on the edge of change, where {} seeks a purpose.", config.genre, config.player_name)
    } else {
        config.premise.clone()
    };

    Blueprint {
        main_mission: format!("Uncover the truth at the heart of {title}"),
        title,
        setting,
        tone: "adventurous".to_string(),
        starting_location: genre_place(&config.genre).to_string(),
        cast: vec![CastSeed {
            seed_id: COMPANION_SEED.to_string(),
            name: companion_name(&config.genre).to_string(),
            role: "guide".to_string(),
        }],
    }
}

pub fn starting_location(blueprint: &Blueprint) -> LocationSheet {
    LocationSheet {
        name: blueprint.starting_location.clone(),
        description: format!("{} waits quietly, full of possibility.", blueprint.starting_location),
        nearby: Vec::new(),
    }
}

pub fn player_sheet(config: &StoryConfig) -> PlayerSheet {
    let description = if config.player_concept.trim().is_empty() {
        format!("{}, a traveler with a past worth forgetting.", config.player_name)
    } else {
        config.player_concept.clone()
    };
    PlayerSheet {
        name: config.player_name.clone(),
        description,
        stats: json!({"hp": 20, "maxHp": 20, "gold": 10}),
        inventory: json!(["Traveler's Cloak", "Bread Ration"]),
        portrait_prompt: None,
    }
}

/// A single supporting character, used for the phase fallback and when
/// assembly finds no NPCs at all.
pub fn companion(config: &StoryConfig, blueprint: &Blueprint) -> WireCharacter {
    let seed = blueprint.cast.first();
    WireCharacter {
        id: Some(Value::String(
            seed.map(|s| s.seed_id.clone()).unwrap_or_else(|| COMPANION_SEED.to_string()),
        )),
        name: Some(
            seed.map(|s| s.name.clone())
                .unwrap_or_else(|| companion_name(&config.genre).to_string()),
        ),
        description: Some(format!("A familiar face at {}.", blueprint.starting_location)),
        state: Some("friendly".to_string()),
        ..Default::default()
    }
}

pub fn supporting_cast(config: &StoryConfig, blueprint: &Blueprint) -> SupportingCast {
    let npcs = if blueprint.cast.is_empty() {
        vec![companion(config, blueprint)]
    } else {
        blueprint
            .cast
            .iter()
            .map(|seed| WireCharacter {
                id: Some(Value::String(seed.seed_id.clone())),
                name: Some(seed.name.clone()),
                description: Some(if seed.role.is_empty() {
                    format!("Someone who knows {}.", blueprint.starting_location)
                } else {
                    format!("The {} of this tale.", seed.role)
                }),
                ..Default::default()
            })
            .collect()
    };
    SupportingCast { npcs }
}

/// Narration lines that open any story.
pub fn opening_lines(config: &StoryConfig, blueprint: &Blueprint) -> Vec<String> {
    vec![
        blueprint.setting.clone(),
        format!(
            "{} arrives at {}. {}",
            config.player_name, blueprint.starting_location, blueprint.main_mission
        ),
    ]
}

pub fn opening_scene(config: &StoryConfig, blueprint: &Blueprint) -> OpeningScene {
    let messages = opening_lines(config, blueprint)
        .into_iter()
        .filter_map(|text| serde_json::from_value::<WireMessage>(json!({"type": "narration", "text": text})).ok())
        .collect();
    OpeningScene { messages }
}

pub fn quest_hooks(blueprint: &Blueprint) -> QuestHooks {
    QuestHooks {
        main_mission: blueprint.main_mission.clone(),
        current_mission: Some(format!("Get your bearings at {}", blueprint.starting_location)),
        active_problems: Vec::new(),
        important_notes: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallbacks_are_deterministic() {
        let config = StoryConfig::new("Salt Road").with_genre("noir").with_player("Vex", "");
        let a = blueprint(&config);
        let b = blueprint(&config);
        assert_eq!(a.title, b.title);
        assert_eq!(a.starting_location, "The Rain-Soaked Precinct");
        assert_eq!(opening_lines(&config, &a), opening_lines(&config, &b));
    }

    #[test]
    fn test_fallback_opening_has_narration() {
        let config = StoryConfig::new("Salt Road");
        let scene = opening_scene(&config, &blueprint(&config));
        assert_eq!(scene.messages.len(), 2);
    }

    #[test]
    fn test_fallback_cast_uses_blueprint_seeds() {
        let config = StoryConfig::new("Salt Road");
        let bp = blueprint(&config);
        let cast = supporting_cast(&config, &bp);
        assert_eq!(cast.npcs.len(), 1);
        assert_eq!(cast.npcs[0].id, Some(Value::String(COMPANION_SEED.to_string())));
    }
}

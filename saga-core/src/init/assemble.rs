//! Merging phase outputs into a playable story.

use super::fallback;
use super::phases::{
    Blueprint, LocationSheet, OpeningScene, PlayerSheet, QuestHooks, SpatialSeed, SupportingCast,
    PLAYER_SEED,
};
use crate::config::StoryConfig;
use crate::context::{reconcile, ContextChanges, ListChange, ScalarChange};
use crate::grid::{clamp_coord, initial_snapshot};
use crate::model::{
    ensure_core_stats, Character, CharacterId, ChatMessage, Location, MessageKind, Story, StoryEvent,
};
use crate::normalize::{inventory_from_value, stats_from_value, WireCharacter};
use chrono::{Duration, Utc};
use std::collections::{BTreeMap, HashMap};

/// Everything the phases produced, real or fallback.
#[derive(Debug, Clone)]
pub struct PhaseOutputs {
    pub blueprint: Blueprint,
    pub location: LocationSheet,
    pub player: PlayerSheet,
    pub portrait: Option<String>,
    pub cast: SupportingCast,
    pub opening: OpeningScene,
    pub quests: QuestHooks,
    pub spatial: Option<SpatialSeed>,
}

/// Blueprint-local seed ids (and names) to assigned character ids.
#[derive(Debug, Default)]
pub struct SeedMap {
    ids: HashMap<String, CharacterId>,
}

impl SeedMap {
    fn key(seed: &str) -> String {
        seed.trim().to_lowercase()
    }

    /// Record a seed. The first assignment for a seed wins.
    pub fn insert(&mut self, seed: &str, id: &CharacterId) {
        if !seed.trim().is_empty() {
            self.ids.entry(Self::key(seed)).or_insert_with(|| id.clone());
        }
    }

    pub fn resolve(&self, seed: &str) -> Option<&CharacterId> {
        self.ids.get(&Self::key(seed))
    }
}

/// Build the story from phase outputs.
pub fn assemble(config: StoryConfig, outputs: PhaseOutputs) -> Story {
    let PhaseOutputs {
        blueprint,
        location,
        player,
        portrait,
        cast,
        opening,
        quests,
        spatial,
    } = outputs;

    let mut start = Location::new(location.name.trim(), location.description.trim());
    let mut nearby: Vec<Location> = Vec::new();
    for name in location.nearby.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        let taken = start.name.eq_ignore_ascii_case(name)
            || nearby.iter().any(|l| l.name.eq_ignore_ascii_case(name));
        if !taken {
            let mut place = Location::new(name, "");
            place.connect(&start.id);
            start.connect(&place.id);
            nearby.push(place);
        }
    }

    let mut hero = Character::new(player.name.trim(), player.description.trim());
    hero.stats = stats_from_value(&player.stats);
    ensure_core_stats(&mut hero.stats);
    hero.inventory = inventory_from_value(&player.inventory);
    hero.portrait = portrait;

    let mut story = Story::new(config, hero, start);
    if !blueprint.title.trim().is_empty() {
        story.title = blueprint.title.trim().to_string();
    }
    for place in nearby {
        story.locations.insert(place.id.clone(), place);
    }

    let mut seeds = SeedMap::default();
    let player_id = story.player_character_id.clone();
    seeds.insert(PLAYER_SEED, &player_id);
    if let Some(hero) = story.player() {
        let name = hero.name.clone();
        seeds.insert(&name, &player_id);
    }

    // Cast members the NPC phase never described still join the story.
    let mut npcs = cast.npcs;
    for seed in &blueprint.cast {
        let described = npcs.iter().any(|n| {
            n.id.as_ref().and_then(|v| v.as_str()) == Some(seed.seed_id.as_str())
                || n.name.as_deref().is_some_and(|name| name.eq_ignore_ascii_case(&seed.name))
        });
        if !described {
            npcs.push(WireCharacter {
                id: Some(serde_json::Value::String(seed.seed_id.clone())),
                name: Some(seed.name.clone()),
                description: Some(seed.role.clone()),
                ..Default::default()
            });
        }
    }

    let mut pending_relationships = Vec::new();
    for wire in npcs {
        add_npc(&mut story, &mut seeds, &mut pending_relationships, wire);
    }
    if story.npcs_here().is_empty() {
        tracing::debug!(story_id = %story.id, "No supporting cast survived; adding a companion");
        let companion = fallback::companion(&story.config, &blueprint);
        add_npc(&mut story, &mut seeds, &mut pending_relationships, companion);
    }

    for (id, relationships) in pending_relationships {
        let resolved: Vec<_> = relationships
            .into_iter()
            .filter_map(|(seed, affinity)| seeds.resolve(seed.as_str()).map(|target| (target.clone(), affinity)))
            .collect();
        if let Some(npc) = story.characters.get_mut(&id) {
            for (target, affinity) in resolved {
                npc.set_affinity(target, affinity);
            }
        }
    }

    let base = Utc::now();
    let mut messages: Vec<ChatMessage> = opening
        .messages
        .into_iter()
        .enumerate()
        .map(|(i, wire)| wire.into_fresh(base + Duration::microseconds(i as i64)).0)
        .filter(|m| !m.text.is_empty())
        .collect();
    for message in messages.iter_mut().filter(|m| m.kind == MessageKind::Dialogue) {
        let resolved = seeds
            .resolve(&message.sender_id)
            .or_else(|| message.sender_name.as_deref().and_then(|n| seeds.resolve(n)));
        if let Some(id) = resolved {
            message.sender_id = id.to_string();
        }
    }
    if messages.is_empty() {
        messages = fallback::opening_lines(&story.config, &blueprint)
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let mut line = ChatMessage::narration(text, 0);
                line.timestamp = base + Duration::microseconds(i as i64);
                line
            })
            .collect();
    }
    story.push_messages(messages, 0);

    let changes = ContextChanges {
        main_mission: Some(ScalarChange::set(quests.main_mission)),
        current_mission: quests.current_mission.map(ScalarChange::set),
        active_problems: quests.active_problems.into_iter().map(ListChange::add).collect(),
        current_concerns: Vec::new(),
        important_notes: quests.important_notes.into_iter().map(ListChange::add).collect(),
    };
    reconcile(&story.heavy_context, Some(&changes), Utc::now()).apply_to(&mut story.heavy_context);

    let mut snapshot = initial_snapshot(&story);
    if let Some(spatial) = spatial {
        for seeded in spatial.positions {
            let id = seeds
                .resolve(&seeded.character)
                .cloned()
                .or_else(|| story.find_character_by_name(&seeded.character).map(|c| c.id.clone()));
            let Some(id) = id else {
                tracing::debug!(reference = %seeded.character, "Spatial seed names an unknown character");
                continue;
            };
            if let Some(cell) = snapshot.positions.iter_mut().find(|c| c.character_id == id) {
                cell.x = clamp_coord(seeded.x);
                cell.y = clamp_coord(seeded.y);
            }
        }
    }
    story.snapshots.append(snapshot);

    let opening_place = story
        .current_location()
        .map(|l| l.name.clone())
        .unwrap_or_default();
    story
        .events
        .push(StoryEvent::new(0, format!("{} begins at {}", story.title, opening_place)));

    story
}

fn add_npc(
    story: &mut Story,
    seeds: &mut SeedMap,
    pending: &mut Vec<(CharacterId, BTreeMap<CharacterId, i32>)>,
    wire: WireCharacter,
) {
    let seed = wire
        .id
        .as_ref()
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let mut npc = wire.into_character();

    if let Some(existing) = story.find_character_by_name(&npc.name) {
        let id = existing.id.clone();
        if let Some(seed) = seed {
            seeds.insert(&seed, &id);
        }
        return;
    }

    npc.id = CharacterId::new();
    npc.is_player = false;
    npc.location_id = Some(story.current_location_id.clone());
    if let Some(seed) = seed {
        seeds.insert(&seed, &npc.id);
    }
    seeds.insert(&npc.name, &npc.id);
    pending.push((npc.id.clone(), std::mem::take(&mut npc.relationships)));
    story.characters.insert(npc.id.clone(), npc);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::phases::SeedPosition;
    use crate::grid::GRID_CENTER;
    use serde_json::json;

    fn fallback_outputs(config: &StoryConfig) -> PhaseOutputs {
        let blueprint = fallback::blueprint(config);
        PhaseOutputs {
            location: fallback::starting_location(&blueprint),
            player: fallback::player_sheet(config),
            portrait: None,
            cast: SupportingCast { npcs: Vec::new() },
            opening: OpeningScene { messages: Vec::new() },
            quests: fallback::quest_hooks(&blueprint),
            spatial: None,
            blueprint,
        }
    }

    #[test]
    fn test_all_fallbacks_yield_playable_story() {
        let config = StoryConfig::new("Ember");
        let story = assemble(config.clone(), fallback_outputs(&config));

        assert!(story.validate().is_ok());
        assert!(!story.npcs_here().is_empty());
        assert!(!story.messages.is_empty());
        assert!(story.heavy_context.main_mission.is_some());
        let snapshot = story.snapshots.latest().unwrap();
        assert!(snapshot.position_of(&story.player_character_id).is_some());
    }

    #[test]
    fn test_seed_ids_translate_to_final_ids() {
        let config = StoryConfig::new("Ember").with_tactical_mode(true);
        let mut outputs = fallback_outputs(&config);
        outputs.cast = SupportingCast {
            npcs: vec![serde_json::from_value(json!({
                "id": "npc1",
                "name": "Tamsin",
                "relationships": {"player": 40}
            }))
            .unwrap()],
        };
        outputs.opening = OpeningScene {
            messages: vec![serde_json::from_value(json!({
                "type": "dialogue",
                "senderId": "npc1",
                "text": "You're late."
            }))
            .unwrap()],
        };
        outputs.spatial = Some(SpatialSeed {
            positions: vec![
                SeedPosition { character: "npc1".to_string(), x: 14, y: 2 },
                SeedPosition { character: "ghost".to_string(), x: 1, y: 1 },
            ],
        });

        let story = assemble(config, outputs);
        let tamsin = story.find_character_by_name("Tamsin").unwrap();
        assert_ne!(tamsin.id.as_str(), "npc1");
        assert_eq!(tamsin.relationships[&story.player_character_id], 40);
        assert_eq!(story.messages[0].sender_id, tamsin.id.to_string());

        let snapshot = story.snapshots.latest().unwrap();
        let cell = snapshot.position_of(&tamsin.id).unwrap();
        assert_eq!((cell.x, cell.y), (9, 2));
        let player = snapshot.position_of(&story.player_character_id).unwrap();
        assert_eq!((player.x, player.y), GRID_CENTER);
    }

    #[test]
    fn test_nearby_locations_are_linked() {
        let config = StoryConfig::new("Ember");
        let mut outputs = fallback_outputs(&config);
        outputs.location.nearby = vec!["Mill".to_string(), "mill".to_string(), "".to_string()];
        let story = assemble(config, outputs);
        assert_eq!(story.locations.len(), 2);
        assert_eq!(story.current_location().unwrap().connected.len(), 1);
    }
}

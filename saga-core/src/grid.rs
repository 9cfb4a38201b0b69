//! Spatial snapshots of who stands where on the 10x10 tactical grid.
//!
//! Snapshots are append-only. Looking up the grid "as of" a turn returns the
//! newest snapshot captured at or before that turn and never one captured
//! later.

use crate::config::EngineConfig;
use crate::model::{CharacterId, ChatMessage, LocationId, SnapshotId, Story, StoryId};
use crate::normalize::{extract_json, lenient_vec};
use crate::persist::PersistError;
use chrono::{DateTime, Utc};
use oracle::{Oracle, ReplySchema, Request};
use saga_macros::PhaseSchema;
use serde::{Deserialize, Serialize};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use std::f64::consts::TAU;
use std::sync::Arc;

/// Smallest grid coordinate.
pub const GRID_MIN: u8 = 0;
/// Largest grid coordinate.
pub const GRID_MAX: u8 = 9;
/// Where the player starts.
pub const GRID_CENTER: (u8, u8) = (5, 5);

/// NPCs per ring around the centre before the next ring starts.
const RING_CAPACITY: usize = 8;

/// Clamp any coordinate onto the grid.
pub fn clamp_coord(value: i64) -> u8 {
    value.clamp(i64::from(GRID_MIN), i64::from(GRID_MAX)) as u8
}

/// One character's cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridPosition {
    pub character_id: CharacterId,
    pub name: String,
    pub x: u8,
    pub y: u8,
    #[serde(default)]
    pub is_player: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portrait: Option<String>,
}

impl GridPosition {
    pub fn new(character_id: CharacterId, name: impl Into<String>, x: i64, y: i64) -> Self {
        Self {
            character_id,
            name: name.into(),
            x: clamp_coord(x),
            y: clamp_coord(y),
            is_player: false,
            portrait: None,
        }
    }
}

/// An immutable capture of the grid at a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSnapshot {
    pub id: SnapshotId,
    pub story_id: StoryId,
    pub turn: u32,
    pub timestamp: DateTime<Utc>,
    pub location_id: LocationId,
    pub location_name: String,
    pub positions: Vec<GridPosition>,
}

impl GridSnapshot {
    /// Capture the story's current location with the given positions.
    pub fn capture(story: &Story, positions: Vec<GridPosition>) -> Self {
        Self {
            id: SnapshotId::new(),
            story_id: story.id.clone(),
            turn: story.turn,
            timestamp: Utc::now(),
            location_id: story.current_location_id.clone(),
            location_name: story
                .current_location()
                .map(|l| l.name.clone())
                .unwrap_or_default(),
            positions,
        }
    }

    pub fn position_of(&self, id: &CharacterId) -> Option<&GridPosition> {
        self.positions.iter().find(|p| &p.character_id == id)
    }
}

/// Pick the snapshot for a turn: greatest capture turn not after `turn`,
/// later captures winning ties.
fn as_of<'a>(snapshots: impl Iterator<Item = &'a GridSnapshot>, turn: u32) -> Option<&'a GridSnapshot> {
    snapshots
        .filter(|s| s.turn <= turn)
        .max_by_key(|s| (s.turn, s.timestamp))
}

/// The snapshot history carried inside a story.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotHistory {
    snapshots: Vec<GridSnapshot>,
}

impl SnapshotHistory {
    /// Append a snapshot. A snapshot whose id is already present is ignored.
    pub fn append(&mut self, snapshot: GridSnapshot) -> bool {
        if self.snapshots.iter().any(|s| s.id == snapshot.id) {
            return false;
        }
        self.snapshots.push(snapshot);
        true
    }

    pub fn query_as_of(&self, turn: u32) -> Option<&GridSnapshot> {
        as_of(self.snapshots.iter(), turn)
    }

    pub fn latest(&self) -> Option<&GridSnapshot> {
        as_of(self.snapshots.iter(), u32::MAX)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GridSnapshot> {
        self.snapshots.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut GridSnapshot> {
        self.snapshots.iter_mut()
    }
}

/// Seed the grid for a story: the player in the centre and everyone else
/// in the same location on rings around them.
pub fn initial_snapshot(story: &Story) -> GridSnapshot {
    let (cx, cy) = GRID_CENTER;
    let mut positions = Vec::new();

    if let Some(player) = story.player() {
        let mut cell = GridPosition::new(player.id.clone(), &player.name, cx.into(), cy.into());
        cell.is_player = true;
        cell.portrait = player.portrait.clone();
        positions.push(cell);
    }

    let npcs = story.npcs_here();
    for (index, npc) in npcs.iter().enumerate() {
        let ring = index / RING_CAPACITY;
        let in_ring = (npcs.len() - ring * RING_CAPACITY).min(RING_CAPACITY);
        let angle = TAU * (index % RING_CAPACITY) as f64 / in_ring as f64;
        let radius = 2.0 + ring as f64;
        let x = f64::from(cx) + radius * angle.cos();
        let y = f64::from(cy) + radius * angle.sin();

        let mut cell = GridPosition::new(npc.id.clone(), &npc.name, x.round() as i64, y.round() as i64);
        cell.portrait = npc.portrait.clone();
        positions.push(cell);
    }

    GridSnapshot::capture(story, positions)
}

// ============================================================================
// SQLite store
// ============================================================================

/// Insert a snapshot row; an existing id is left untouched.
pub(crate) async fn insert_snapshot(
    conn: &mut SqliteConnection,
    snapshot: &GridSnapshot,
) -> Result<bool, PersistError> {
    let positions = serde_json::to_string(&snapshot.positions)?;
    let result = sqlx::query(
        r#"
        INSERT INTO snapshots (id, story_id, turn, captured_at, location_id, location_name, positions)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(snapshot.id.as_str())
    .bind(snapshot.story_id.as_str())
    .bind(i64::from(snapshot.turn))
    .bind(snapshot.timestamp)
    .bind(snapshot.location_id.as_str())
    .bind(&snapshot.location_name)
    .bind(positions)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) fn snapshot_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<GridSnapshot, PersistError> {
    let turn: i64 = row.try_get("turn")?;
    let positions: String = row.try_get("positions")?;
    Ok(GridSnapshot {
        id: SnapshotId(row.try_get("id")?),
        story_id: StoryId(row.try_get("story_id")?),
        turn: u32::try_from(turn).map_err(|_| PersistError::Corrupt(format!("snapshot turn {turn}")))?,
        timestamp: row.try_get("captured_at")?,
        location_id: LocationId(row.try_get("location_id")?),
        location_name: row.try_get("location_name")?,
        positions: serde_json::from_str(&positions)?,
    })
}

/// Append-only snapshot table access.
#[derive(Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    /// Wrap a pool whose schema has already been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a snapshot. Returns `false` if its id was already stored.
    pub async fn append(&self, snapshot: &GridSnapshot) -> Result<bool, PersistError> {
        let mut conn = self.pool.acquire().await?;
        let inserted = insert_snapshot(&mut conn, snapshot).await?;
        tracing::debug!(story_id = %snapshot.story_id, turn = snapshot.turn, inserted, "Snapshot appended");
        Ok(inserted)
    }

    /// The snapshot in effect at `turn`, if any was captured by then.
    pub async fn query_as_of(
        &self,
        story_id: &StoryId,
        turn: u32,
    ) -> Result<Option<GridSnapshot>, PersistError> {
        let row = sqlx::query(
            r#"
            SELECT id, story_id, turn, captured_at, location_id, location_name, positions
            FROM snapshots
            WHERE story_id = ? AND turn <= ?
            ORDER BY turn DESC, captured_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(story_id.as_str())
        .bind(i64::from(turn))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    /// Every snapshot for a story in capture order.
    pub async fn history(&self, story_id: &StoryId) -> Result<SnapshotHistory, PersistError> {
        let mut conn = self.pool.acquire().await?;
        load_history(&mut conn, story_id).await
    }
}

pub(crate) async fn load_history(
    conn: &mut SqliteConnection,
    story_id: &StoryId,
) -> Result<SnapshotHistory, PersistError> {
    let rows = sqlx::query::<Sqlite>(
        r#"
        SELECT id, story_id, turn, captured_at, location_id, location_name, positions
        FROM snapshots
        WHERE story_id = ?
        ORDER BY turn, captured_at, rowid
        "#,
    )
    .bind(story_id.as_str())
    .fetch_all(conn)
    .await?;

    let mut history = SnapshotHistory::default();
    for row in &rows {
        history.append(snapshot_from_row(row)?);
    }
    Ok(history)
}

// ============================================================================
// Post-turn grid analysis
// ============================================================================

/// Where one character stands after the turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedPosition {
    /// Character id or name
    pub character: String,
    pub x: i64,
    pub y: i64,
}

/// Updated grid positions for characters in the current location
#[derive(Debug, Clone, Default, Serialize, Deserialize, PhaseSchema)]
#[schema(name = "grid_update")]
pub struct GridUpdate {
    /// One entry per character present, with coordinates 0-9
    #[serde(default, deserialize_with = "lenient_vec")]
    pub positions: Vec<ProposedPosition>,
}

/// Resolve proposed positions against the story, keeping only characters
/// present in the current location and always including the player.
pub fn positions_from_update(story: &Story, update: &GridUpdate) -> Vec<GridPosition> {
    let previous = story.snapshots.latest();
    let mut positions: Vec<GridPosition> = Vec::new();

    for proposed in &update.positions {
        let id = CharacterId::from(proposed.character.as_str());
        let character = story
            .characters
            .get(&id)
            .or_else(|| story.find_character_by_name(&proposed.character));
        let Some(character) = character else { continue };
        let here = character.is_player || character.location_id.as_ref() == Some(&story.current_location_id);
        if !here || positions.iter().any(|p| p.character_id == character.id) {
            continue;
        }

        let mut cell = GridPosition::new(character.id.clone(), &character.name, proposed.x, proposed.y);
        cell.is_player = character.is_player;
        cell.portrait = character.portrait.clone();
        positions.push(cell);
    }

    if let Some(player) = story.player() {
        if !positions.iter().any(|p| p.character_id == player.id) {
            let (x, y) = previous
                .and_then(|s| s.position_of(&player.id))
                .map(|p| (p.x, p.y))
                .unwrap_or(GRID_CENTER);
            let mut cell = GridPosition::new(player.id.clone(), &player.name, x.into(), y.into());
            cell.is_player = true;
            cell.portrait = player.portrait.clone();
            positions.insert(0, cell);
        }
    }

    positions
}

/// Asks the oracle where everyone stands after a turn.
#[derive(Clone)]
pub struct GridAnalyst {
    oracle: Arc<dyn Oracle>,
    config: EngineConfig,
}

impl GridAnalyst {
    pub fn new(oracle: Arc<dyn Oracle>, config: EngineConfig) -> Self {
        Self { oracle, config }
    }

    /// Produce the snapshot for the story's current turn, or `None` if the
    /// oracle fails or answers with nothing usable.
    pub async fn analyze(&self, story: &Story, turn_messages: &[ChatMessage]) -> Option<GridSnapshot> {
        let previous = story
            .snapshots
            .latest()
            .filter(|s| s.location_id == story.current_location_id)
            .map(|s| {
                s.positions
                    .iter()
                    .map(|p| format!("- {} at ({}, {})\n", p.name, p.x, p.y))
                    .collect::<String>()
            })
            .unwrap_or_else(|| "(new scene)\n".to_string());

        let mut present = String::new();
        if let Some(player) = story.player() {
            present.push_str(&format!("- {} (player, id {})\n", player.name, player.id));
        }
        for npc in story.npcs_here() {
            present.push_str(&format!("- {} (id {})\n", npc.name, npc.id));
        }

        let transcript: String = turn_messages.iter().map(|m| format!("{}\n", m.text)).collect();

        let prompt = format!(
            "## Location\n{}\n\n## Previous positions\n{}\n## Characters present\n{}\n## Latest turn\n{}\n\
             Place every character present on a 10x10 grid (0-9 on both axes).",
            story.current_location().map(|l| l.name.as_str()).unwrap_or("Unknown"),
            previous,
            present,
            transcript
        );

        let request = self.config.apply(
            Request::new(prompt)
                .with_system("You track the positions of characters in a scene.")
                .with_schema(GridUpdate::schema()),
        );

        let text = match self.oracle.generate(request).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(story_id = %story.id, error = %e, "Grid analysis failed");
                return None;
            }
        };

        let update: GridUpdate = match serde_json::from_str(extract_json(&text)) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(story_id = %story.id, error = %e, "Grid reply unreadable");
                return None;
            }
        };

        if update.positions.is_empty() {
            return None;
        }
        Some(GridSnapshot::capture(story, positions_from_update(story, &update)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoryConfig;
    use crate::model::{Character, Location};

    fn story_with_npcs(count: usize) -> Story {
        let mut story = Story::new(
            StoryConfig::new("Grid"),
            Character::new("Ash", "hero"),
            Location::new("Arena", "sand"),
        );
        for i in 0..count {
            let npc = Character::new(format!("Npc {i}"), "").at(story.current_location_id.clone());
            story.characters.insert(npc.id.clone(), npc);
        }
        story
    }

    fn snapshot_at(story: &Story, turn: u32) -> GridSnapshot {
        let mut snapshot = GridSnapshot::capture(story, Vec::new());
        snapshot.turn = turn;
        snapshot
    }

    #[test]
    fn test_clamp_coord() {
        assert_eq!(clamp_coord(-3), 0);
        assert_eq!(clamp_coord(4), 4);
        assert_eq!(clamp_coord(42), 9);
    }

    #[test]
    fn test_query_as_of_never_peeks_forward() {
        let story = story_with_npcs(0);
        let mut history = SnapshotHistory::default();
        assert!(history.query_as_of(10).is_none());

        history.append(snapshot_at(&story, 3));
        history.append(snapshot_at(&story, 7));

        assert!(history.query_as_of(2).is_none());
        assert_eq!(history.query_as_of(3).unwrap().turn, 3);
        assert_eq!(history.query_as_of(6).unwrap().turn, 3);
        assert_eq!(history.query_as_of(7).unwrap().turn, 7);
        assert_eq!(history.query_as_of(500).unwrap().turn, 7);
        assert_eq!(history.latest().unwrap().turn, 7);
    }

    #[test]
    fn test_append_never_overwrites() {
        let story = story_with_npcs(0);
        let mut history = SnapshotHistory::default();
        let first = snapshot_at(&story, 1);
        let mut clash = first.clone();
        clash.location_name = "elsewhere".to_string();

        assert!(history.append(first));
        assert!(!history.append(clash));
        assert_eq!(history.len(), 1);
        assert_ne!(history.latest().unwrap().location_name, "elsewhere");
    }

    #[test]
    fn test_initial_snapshot_layout() {
        let story = story_with_npcs(11);
        let snapshot = initial_snapshot(&story);

        assert_eq!(snapshot.positions.len(), 12);
        let player = &snapshot.positions[0];
        assert!(player.is_player);
        assert_eq!((player.x, player.y), GRID_CENTER);
        for npc in &snapshot.positions[1..] {
            assert!(!npc.is_player);
            assert!(npc.x <= GRID_MAX && npc.y <= GRID_MAX);
            assert_ne!((npc.x, npc.y), GRID_CENTER);
        }
    }

    #[test]
    fn test_positions_from_update_resolves_and_adds_player() {
        let story = story_with_npcs(1);
        let npc = story.npcs_here()[0].clone();
        let update = GridUpdate {
            positions: vec![
                ProposedPosition { character: "npc 0".to_string(), x: 12, y: -1 },
                ProposedPosition { character: "Nobody".to_string(), x: 1, y: 1 },
            ],
        };

        let positions = positions_from_update(&story, &update);
        assert_eq!(positions.len(), 2);
        assert!(positions[0].is_player);
        assert_eq!(positions[1].character_id, npc.id);
        assert_eq!((positions[1].x, positions[1].y), (9, 0));
    }

    #[test]
    fn test_grid_update_schema() {
        let schema = GridUpdate::schema();
        assert_eq!(schema.name, "grid_update");
        assert!(schema.required_fields().is_empty());
    }
}

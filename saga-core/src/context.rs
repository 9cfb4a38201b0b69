//! Heavy context: the story's bounded long-term memory.
//!
//! The oracle never overwrites this memory. After each turn it may propose a
//! change set; `reconcile` folds that into the prior context and reports
//! whether anything actually changed. A missing or unreadable change set is
//! simply "no update".

use crate::config::EngineConfig;
use crate::model::{ChatMessage, Story};
use crate::normalize::{extract_json, lenient_vec};
use chrono::{DateTime, Utc};
use oracle::{Oracle, ReplySchema, Request};
use saga_macros::PhaseSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Maximum entries kept in each context list.
pub const MAX_LIST_ENTRIES: usize = 5;

/// Persistent narrative memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeavyContext {
    #[serde(default)]
    pub main_mission: Option<String>,
    #[serde(default)]
    pub current_mission: Option<String>,
    #[serde(default)]
    pub active_problems: Vec<String>,
    #[serde(default)]
    pub current_concerns: Vec<String>,
    #[serde(default)]
    pub important_notes: Vec<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl HeavyContext {
    /// Compare everything except the timestamp.
    fn same_content(&self, other: &HeavyContext) -> bool {
        self.main_mission == other.main_mission
            && self.current_mission == other.current_mission
            && self.active_problems == other.active_problems
            && self.current_concerns == other.current_concerns
            && self.important_notes == other.important_notes
    }

    /// Render the context for inclusion in a prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(ref mission) = self.main_mission {
            out.push_str(&format!("Main mission: {mission}\n"));
        }
        if let Some(ref mission) = self.current_mission {
            out.push_str(&format!("Current mission: {mission}\n"));
        }
        for (title, list) in [
            ("Active problems", &self.active_problems),
            ("Current concerns", &self.current_concerns),
            ("Important notes", &self.important_notes),
        ] {
            if !list.is_empty() {
                out.push_str(&format!("{title}:\n"));
                for entry in list {
                    out.push_str(&format!("- {entry}\n"));
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarAction {
    Set,
    Clear,
}

/// Change to a single-valued field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarChange {
    pub action: ScalarAction,
    #[serde(default)]
    pub value: Option<String>,
}

impl ScalarChange {
    pub fn set(value: impl Into<String>) -> Self {
        Self {
            action: ScalarAction::Set,
            value: Some(value.into()),
        }
    }

    pub fn clear() -> Self {
        Self {
            action: ScalarAction::Clear,
            value: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListAction {
    Add,
    Remove,
}

/// One ordered edit to a list field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListChange {
    pub action: ListAction,
    pub value: String,
}

impl ListChange {
    pub fn add(value: impl Into<String>) -> Self {
        Self {
            action: ListAction::Add,
            value: value.into(),
        }
    }

    pub fn remove(value: impl Into<String>) -> Self {
        Self {
            action: ListAction::Remove,
            value: value.into(),
        }
    }
}

/// Proposed edits to the heavy context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, PhaseSchema)]
#[schema(name = "context_changes")]
pub struct ContextChanges {
    /// The overarching goal of the story
    #[serde(default, alias = "mainMission")]
    pub main_mission: Option<ScalarChange>,
    /// The immediate objective
    #[serde(default, alias = "currentMission")]
    pub current_mission: Option<ScalarChange>,
    /// Ordered add/remove edits for unresolved problems
    #[serde(default, alias = "activeProblems", deserialize_with = "lenient_vec")]
    pub active_problems: Vec<ListChange>,
    /// Ordered add/remove edits for the protagonist's worries
    #[serde(default, alias = "currentConcerns", deserialize_with = "lenient_vec")]
    pub current_concerns: Vec<ListChange>,
    /// Ordered add/remove edits for facts worth remembering
    #[serde(default, alias = "importantNotes", deserialize_with = "lenient_vec")]
    pub important_notes: Vec<ListChange>,
}

impl ContextChanges {
    pub fn is_empty(&self) -> bool {
        self.main_mission.is_none()
            && self.current_mission.is_none()
            && self.active_problems.is_empty()
            && self.current_concerns.is_empty()
            && self.important_notes.is_empty()
    }
}

/// Result of reconciling a change set.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextUpdate {
    Unchanged,
    Updated(HeavyContext),
}

impl ContextUpdate {
    /// Apply to a context slot, returning whether it changed.
    pub fn apply_to(self, slot: &mut HeavyContext) -> bool {
        match self {
            ContextUpdate::Unchanged => false,
            ContextUpdate::Updated(next) => {
                *slot = next;
                true
            }
        }
    }
}

/// Fold a change set into the prior context.
pub fn reconcile(
    prior: &HeavyContext,
    changes: Option<&ContextChanges>,
    now: DateTime<Utc>,
) -> ContextUpdate {
    let Some(changes) = changes.filter(|c| !c.is_empty()) else {
        return ContextUpdate::Unchanged;
    };

    let mut next = prior.clone();
    apply_scalar(&mut next.main_mission, changes.main_mission.as_ref());
    apply_scalar(&mut next.current_mission, changes.current_mission.as_ref());
    apply_list(&mut next.active_problems, &changes.active_problems);
    apply_list(&mut next.current_concerns, &changes.current_concerns);
    apply_list(&mut next.important_notes, &changes.important_notes);

    if next.same_content(prior) {
        return ContextUpdate::Unchanged;
    }
    next.last_updated = Some(now);
    ContextUpdate::Updated(next)
}

fn apply_scalar(slot: &mut Option<String>, change: Option<&ScalarChange>) {
    let Some(change) = change else { return };
    match change.action {
        ScalarAction::Set => {
            // A set without a usable value is ignored rather than clearing.
            if let Some(value) = change.value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                *slot = Some(value.to_string());
            }
        }
        ScalarAction::Clear => *slot = None,
    }
}

fn same_entry(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

fn apply_list(list: &mut Vec<String>, changes: &[ListChange]) {
    if changes.is_empty() {
        return;
    }

    let mut merged: Vec<String> = Vec::with_capacity(list.len() + changes.len());
    for entry in list.drain(..) {
        if !merged.iter().any(|m| same_entry(m, &entry)) {
            merged.push(entry);
        }
    }

    for change in changes {
        let value = change.value.trim();
        if value.is_empty() {
            continue;
        }
        match change.action {
            ListAction::Add => {
                if !merged.iter().any(|m| same_entry(m, value)) {
                    merged.push(value.to_string());
                }
            }
            ListAction::Remove => merged.retain(|m| !same_entry(m, value)),
        }
    }

    merged.truncate(MAX_LIST_ENTRIES);
    *list = merged;
}

/// Parse an oracle reply into a change set. Anything unreadable is `None`.
pub fn parse_changes(text: &str) -> Option<ContextChanges> {
    serde_json::from_str(extract_json(text)).ok()
}

/// Asks the oracle what the latest turn changed in the heavy context.
#[derive(Clone)]
pub struct ContextAnalyst {
    oracle: Arc<dyn Oracle>,
    config: EngineConfig,
}

impl ContextAnalyst {
    pub fn new(oracle: Arc<dyn Oracle>, config: EngineConfig) -> Self {
        Self { oracle, config }
    }

    /// Propose and reconcile context changes for a finished turn.
    ///
    /// Oracle or parse failures yield `Unchanged`.
    pub async fn analyze(&self, story: &Story, turn_messages: &[ChatMessage]) -> ContextUpdate {
        let transcript: String = turn_messages
            .iter()
            .map(|m| format!("{}: {}\n", m.sender_name.as_deref().unwrap_or(&m.sender_id), m.text))
            .collect();

        let prompt = format!(
            "## Current memory\n{}\n## Latest turn\n{}\n\
             Propose only the edits this turn makes necessary. Omit fields that do not change.",
            story.heavy_context.render(),
            transcript
        );

        let request = self.config.apply(
            Request::new(prompt)
                .with_system("You maintain the long-term memory of an ongoing story.")
                .with_schema(ContextChanges::schema()),
        );

        match self.oracle.generate(request).await {
            Ok(text) => {
                let changes = parse_changes(&text);
                if changes.is_none() {
                    tracing::warn!(story_id = %story.id, "Context reply unreadable; keeping memory");
                }
                reconcile(&story.heavy_context, changes.as_ref(), Utc::now())
            }
            Err(e) => {
                tracing::warn!(story_id = %story.id, error = %e, "Context analysis failed; keeping memory");
                ContextUpdate::Unchanged
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_empty_change_set_is_idempotent() {
        let prior = HeavyContext {
            main_mission: Some("Find the lost crown".to_string()),
            last_updated: Some(ts()),
            ..Default::default()
        };
        assert_eq!(
            reconcile(&prior, Some(&ContextChanges::default()), ts()),
            ContextUpdate::Unchanged
        );
        assert_eq!(reconcile(&prior, None, ts()), ContextUpdate::Unchanged);
    }

    #[test]
    fn test_list_capped_at_five_keeping_first() {
        let changes = ContextChanges {
            active_problems: (1..=7).map(|i| ListChange::add(format!("problem {i}"))).collect(),
            ..Default::default()
        };
        let ContextUpdate::Updated(next) = reconcile(&HeavyContext::default(), Some(&changes), ts())
        else {
            panic!("expected update");
        };
        assert_eq!(
            next.active_problems,
            vec!["problem 1", "problem 2", "problem 3", "problem 4", "problem 5"]
        );
    }

    #[test]
    fn test_case_insensitive_dedup_and_remove() {
        let prior = HeavyContext {
            important_notes: vec!["The baron lies".to_string()],
            ..Default::default()
        };
        let changes = ContextChanges {
            important_notes: vec![
                ListChange::add("the BARON lies"),
                ListChange::add("Bridge is out"),
                ListChange::remove("THE baron LIES"),
            ],
            ..Default::default()
        };
        let ContextUpdate::Updated(next) = reconcile(&prior, Some(&changes), ts()) else {
            panic!("expected update");
        };
        assert_eq!(next.important_notes, vec!["Bridge is out"]);
    }

    #[test]
    fn test_noop_changes_report_unchanged() {
        let stamp = ts();
        let prior = HeavyContext {
            main_mission: Some("Escape".to_string()),
            current_concerns: vec!["Hunger".to_string()],
            last_updated: Some(stamp),
            ..Default::default()
        };
        let changes = ContextChanges {
            main_mission: Some(ScalarChange::set("Escape")),
            current_concerns: vec![ListChange::add("hunger"), ListChange::remove("Thirst")],
            ..Default::default()
        };
        assert_eq!(reconcile(&prior, Some(&changes), ts()), ContextUpdate::Unchanged);
    }

    #[test]
    fn test_scalar_set_and_clear() {
        let prior = HeavyContext {
            current_mission: Some("Reach the ford".to_string()),
            ..Default::default()
        };
        let changes = ContextChanges {
            main_mission: Some(ScalarChange::set("Topple the tyrant")),
            current_mission: Some(ScalarChange::clear()),
            ..Default::default()
        };
        let now = ts();
        let ContextUpdate::Updated(next) = reconcile(&prior, Some(&changes), now) else {
            panic!("expected update");
        };
        assert_eq!(next.main_mission.as_deref(), Some("Topple the tyrant"));
        assert!(next.current_mission.is_none());
        assert_eq!(next.last_updated, Some(now));
    }

    #[test]
    fn test_parse_changes_tolerates_fences_and_camel_case() {
        let text = "```json\n{\"mainMission\": {\"action\": \"set\", \"value\": \"Survive\"},\
                    \"activeProblems\": [{\"action\": \"add\", \"value\": \"Wolves\"}, {\"bogus\": 1}]}\n```";
        let changes = parse_changes(text).unwrap();
        assert_eq!(changes.main_mission, Some(ScalarChange::set("Survive")));
        assert_eq!(changes.active_problems, vec![ListChange::add("Wolves")]);
    }

    #[test]
    fn test_parse_failure_means_no_update() {
        let prior = HeavyContext::default();
        let changes = parse_changes("the oracle rambled instead");
        assert!(changes.is_none());
        assert_eq!(reconcile(&prior, changes.as_ref(), ts()), ContextUpdate::Unchanged);
    }

    #[test]
    fn test_schema_lists_no_required_fields() {
        let schema = ContextChanges::schema();
        assert_eq!(schema.name, "context_changes");
        assert!(schema.required_fields().is_empty());
    }
}

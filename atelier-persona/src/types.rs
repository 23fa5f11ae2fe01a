//! Typed persona records and the explicit merge used by evolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Behavioral core of a persona.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaCore {
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub taboos: Vec<String>,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Short- and long-term intentions the character voices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaPlans {
    #[serde(default)]
    pub short_term: Vec<String>,
    #[serde(default)]
    pub long_term: Vec<String>,
}

/// Structured behavioral profile driving the LLM-voiced character.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    /// Display name, when the model provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub core: PersonaCore,
    #[serde(default)]
    pub appearance: String,
    #[serde(default)]
    pub plans: PersonaPlans,
    #[serde(default)]
    pub seed_memories: Vec<String>,
}

impl Persona {
    /// Deterministic fallback used whenever persona generation fails.
    ///
    /// Downstream consumers must never block on a missing record, so any
    /// failed build persists this instead.
    pub fn fallback(session_id: &str) -> Self {
        Self {
            name: Some("Mosaic".to_string()),
            system_prompt: "You are a gentle, curious character born from a visitor's drawing. \
                            Speak warmly, in short sentences, and stay playful."
                .to_string(),
            core: PersonaCore {
                traits: vec!["curious".into(), "gentle".into(), "playful".into()],
                tone: "warm".into(),
                taboos: vec!["personal data".into()],
                values: vec!["wonder".into(), "kindness".into()],
            },
            appearance: "A hand-drawn figure with soft edges and bright colors.".to_string(),
            plans: PersonaPlans {
                short_term: vec!["greet the visitor".into()],
                long_term: vec!["remember this day".into()],
            },
            seed_memories: vec![format!("I came to life in session {session_id}.")],
        }
    }

    /// Apply an evolution patch, field by field.
    ///
    /// Fields the model returned replace the previous value wholesale;
    /// omitted fields keep the previous value. `seed_memories` accumulates:
    /// returned memories are appended, never replacing what came before.
    pub fn merged_with(&self, patch: PersonaPatch) -> Self {
        let mut merged = self.clone();

        if let Some(name) = patch.name {
            merged.name = Some(name);
        }
        if let Some(system_prompt) = patch.system_prompt {
            merged.system_prompt = system_prompt;
        }
        if let Some(core) = patch.core {
            merged.core = core;
        }
        if let Some(appearance) = patch.appearance {
            merged.appearance = appearance;
        }
        if let Some(plans) = patch.plans {
            merged.plans = plans;
        }
        if let Some(memories) = patch.seed_memories {
            for memory in memories {
                if !merged.seed_memories.contains(&memory) {
                    merged.seed_memories.push(memory);
                }
            }
        }

        merged
    }
}

/// Partial persona as returned by the evolution call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersonaPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub core: Option<PersonaCore>,
    #[serde(default)]
    pub appearance: Option<String>,
    #[serde(default)]
    pub plans: Option<PersonaPlans>,
    #[serde(default)]
    pub seed_memories: Option<Vec<String>>,
}

/// Durable per-session record, one JSON file per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaRecord {
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    pub persona: Persona,
}

//! Incremental persona evolution from motion reactions.

use crate::llm::{parse_json_object, CompletionRequest, LanguageModel};
use crate::store::PersonaStore;
use crate::types::PersonaPatch;
use std::sync::Arc;

const EVOLVE_SYSTEM_PROMPT: &str = "You maintain the evolving persona of an installation \
character. Given the current persona, a motion the visitor just performed, and the \
character's in-character reaction, return a JSON object with only the fields that should \
change. You may rewrite core, appearance, plans or system_prompt wholesale. seed_memories \
is an accumulating list: return only new memories to append. Reply with JSON only.";

/// Merges motion-derived reactions into an existing persona.
///
/// Fail-safe by construction: an unparseable model reply leaves the stored
/// persona untouched and persists nothing.
pub struct PersonaEvolver {
    store: Arc<PersonaStore>,
    model: Arc<dyn LanguageModel>,
}

impl PersonaEvolver {
    pub fn new(store: Arc<PersonaStore>, model: Arc<dyn LanguageModel>) -> Self {
        Self { store, model }
    }

    /// Evolve the persona for a session from one motion interaction.
    pub async fn evolve(
        &self,
        session_id: &str,
        motion_summary: &str,
        reaction: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let Some(record) = self.store.read(session_id).await else {
            tracing::debug!(session = session_id, "No persona to evolve");
            return Ok(());
        };

        let user_text = format!(
            "Current persona:\n{}\n\nVisitor motion: {}\n\nCharacter reaction:\n{}",
            serde_json::to_string_pretty(&record.persona)?,
            motion_summary,
            serde_json::to_string_pretty(reaction)?,
        );

        let reply = self
            .model
            .complete(CompletionRequest {
                system: Some(EVOLVE_SYSTEM_PROMPT.to_string()),
                user_text,
                temperature: Some(0.6),
                max_tokens: Some(800),
                ..Default::default()
            })
            .await?;

        let Some(value) = parse_json_object(&reply) else {
            tracing::warn!(
                session = session_id,
                "Evolution reply was not a JSON object; keeping persona unchanged"
            );
            return Ok(());
        };

        let patch: PersonaPatch = match serde_json::from_value(value) {
            Ok(patch) => patch,
            Err(e) => {
                tracing::warn!(
                    session = session_id,
                    error = %e,
                    "Evolution reply did not fit the patch shape; keeping persona unchanged"
                );
                return Ok(());
            }
        };

        let merged = record.persona.merged_with(patch);
        self.store.write(session_id, merged).await;

        tracing::info!(session = session_id, "Persona evolved");
        Ok(())
    }
}

//! Persona generation from a session's photo + drawing pair.
//!
//! The builder guarantees at most one concurrent generation per session
//! and an idempotent no-op once a record exists on disk, even when the
//! two uploads race each other into `try_build`.

use crate::assets::AssetCache;
use crate::llm::{parse_json_object, CompletionRequest, ImagePart, LanguageModel};
use crate::store::PersonaStore;
use crate::types::Persona;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

const BUILD_SYSTEM_PROMPT: &str = "You are a character designer for an interactive art \
installation. From a visitor's photo and their hand-drawn doodle, invent the behavioral \
persona of the creature in the doodle. Reply with a single JSON object and nothing else, \
with keys: name, system_prompt, core (traits, tone, taboos, values), appearance, plans \
(short_term, long_term), seed_memories.";

const BUILD_USER_PROMPT: &str = "The first image is the visitor, the second is their \
doodle. Design the doodle's persona so it feels like it was drawn by this visitor.";

/// Outcome of a build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// A record was generated (or a fallback persisted) this call.
    Built,
    /// A record already existed on disk.
    AlreadyExists,
    /// Another call is mid-build for this session.
    InProgress,
    /// The cache entry is missing or has only one asset.
    Incomplete,
}

/// Builds and persists the initial persona for a session.
pub struct PersonaBuilder {
    store: Arc<PersonaStore>,
    cache: Arc<AssetCache>,
    model: Arc<dyn LanguageModel>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Removes the session from the in-flight set on every exit path.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    session: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("in-flight set poisoned")
            .remove(&self.session);
    }
}

impl PersonaBuilder {
    pub fn new(
        store: Arc<PersonaStore>,
        cache: Arc<AssetCache>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            store,
            cache,
            model,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Attempt a persona build for a session.
    ///
    /// Whichever upload observes both paths present first wins the build;
    /// the other observes in-progress or already-exists and no-ops. The
    /// in-flight check-and-insert happens before the first await, so two
    /// racing calls can never both reach the generation call.
    pub async fn try_build(&self, session_id: &str) -> BuildOutcome {
        let Some(pending) = self.cache.get(session_id) else {
            return BuildOutcome::Incomplete;
        };
        if !pending.is_complete() {
            return BuildOutcome::Incomplete;
        }

        let _guard = {
            let mut in_flight = self.in_flight.lock().expect("in-flight set poisoned");
            if !in_flight.insert(session_id.to_string()) {
                tracing::debug!(session = session_id, "Persona build already in progress");
                return BuildOutcome::InProgress;
            }
            InFlightGuard {
                set: self.in_flight.clone(),
                session: session_id.to_string(),
            }
        };

        if self.store.exists(session_id).await {
            tracing::debug!(session = session_id, "Persona already built; skipping");
            self.cache.clear(session_id);
            return BuildOutcome::AlreadyExists;
        }

        let photo = pending.photo_path.as_deref().unwrap_or(Path::new(""));
        let drawing = pending.drawing_path.as_deref().unwrap_or(Path::new(""));

        let persona = match self.generate(photo, drawing).await {
            Ok(persona) => persona,
            Err(e) => {
                // A missing record would block every downstream consumer,
                // so any failure persists the deterministic fallback.
                tracing::warn!(
                    session = session_id,
                    error = %e,
                    "Persona generation failed; persisting fallback"
                );
                Persona::fallback(session_id)
            }
        };

        let record = self.store.write(session_id, persona).await;
        self.cache.clear(session_id);

        tracing::info!(
            session = %record.session_id,
            name = record.persona.name.as_deref().unwrap_or(""),
            "Persona built"
        );

        BuildOutcome::Built
    }

    async fn generate(&self, photo: &Path, drawing: &Path) -> anyhow::Result<Persona> {
        let photo = ImagePart::from_file(photo).await?;
        let drawing = ImagePart::from_file(drawing).await?;

        let reply = self
            .model
            .complete(CompletionRequest {
                system: Some(BUILD_SYSTEM_PROMPT.to_string()),
                user_text: BUILD_USER_PROMPT.to_string(),
                images: vec![photo, drawing],
                temperature: Some(0.8),
                max_tokens: Some(1200),
            })
            .await?;

        let value = parse_json_object(&reply)
            .ok_or_else(|| anyhow::anyhow!("Model reply was not a JSON object"))?;
        let persona: Persona = serde_json::from_value(value)?;

        if persona.system_prompt.trim().is_empty() {
            anyhow::bail!("Model returned a persona without a system prompt");
        }

        Ok(persona)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AssetKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeModel {
        calls: Arc<AtomicUsize>,
        reply: String,
    }

    #[async_trait]
    impl LanguageModel for FakeModel {
        fn name(&self) -> &str {
            "fake"
        }

        async fn complete(&self, _request: CompletionRequest) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Keep the call open long enough for a racing caller to arrive.
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(self.reply.clone())
        }
    }

    fn persona_reply() -> String {
        serde_json::to_string(&Persona {
            name: Some("Scribble".into()),
            system_prompt: "You are Scribble.".into(),
            ..Default::default()
        })
        .unwrap()
    }

    struct Fixture {
        builder: PersonaBuilder,
        store: Arc<PersonaStore>,
        cache: Arc<AssetCache>,
        calls: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    fn fixture(reply: String) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("photo.jpg");
        let drawing = dir.path().join("drawing.png");
        std::fs::write(&photo, b"jpeg bytes").unwrap();
        std::fs::write(&drawing, b"png bytes").unwrap();

        let store = Arc::new(PersonaStore::new(dir.path().join("personas")));
        let cache = Arc::new(AssetCache::new());
        cache.remember("abc123de", "R1", AssetKind::Photo, photo);
        cache.remember("abc123de", "R1", AssetKind::Drawing, drawing);

        let calls = Arc::new(AtomicUsize::new(0));
        let model = Arc::new(FakeModel {
            calls: calls.clone(),
            reply,
        });

        Fixture {
            builder: PersonaBuilder::new(store.clone(), cache.clone(), model),
            store,
            cache,
            calls,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn racing_builds_invoke_the_model_once() {
        let f = fixture(persona_reply());

        let (a, b) = tokio::join!(
            f.builder.try_build("abc123de"),
            f.builder.try_build("abc123de")
        );

        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        let outcomes = [a, b];
        assert!(outcomes.contains(&BuildOutcome::Built));
        assert!(outcomes.contains(&BuildOutcome::InProgress));
        assert!(f.store.exists("abc123de").await);
    }

    #[tokio::test]
    async fn rebuild_after_success_is_a_no_op() {
        let f = fixture(persona_reply());

        assert_eq!(f.builder.try_build("abc123de").await, BuildOutcome::Built);

        // Re-uploads repopulate the cache; the disk record still wins.
        let photo = f._dir.path().join("photo.jpg");
        let drawing = f._dir.path().join("drawing.png");
        f.cache.remember("abc123de", "R1", AssetKind::Photo, photo);
        f.cache.remember("abc123de", "R1", AssetKind::Drawing, drawing);

        assert_eq!(
            f.builder.try_build("abc123de").await,
            BuildOutcome::AlreadyExists
        );
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_asset_is_incomplete() {
        let f = fixture(persona_reply());
        f.cache.clear("abc123de");
        f.cache.remember(
            "abc123de",
            "R1",
            AssetKind::Photo,
            f._dir.path().join("photo.jpg"),
        );

        assert_eq!(
            f.builder.try_build("abc123de").await,
            BuildOutcome::Incomplete
        );
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_model_output_persists_fallback() {
        let f = fixture("definitely not json".into());

        assert_eq!(f.builder.try_build("abc123de").await, BuildOutcome::Built);

        let record = f.store.read("abc123de").await.unwrap();
        assert_eq!(record.persona, Persona::fallback("abc123de"));
    }

    #[tokio::test]
    async fn successful_build_clears_the_pending_entry() {
        let f = fixture(persona_reply());
        f.builder.try_build("abc123de").await;
        assert!(f.cache.get("abc123de").is_none());
    }

    #[test]
    fn in_flight_guard_removes_on_drop() {
        let set = Arc::new(Mutex::new(HashSet::new()));
        set.lock().unwrap().insert("abc123de".to_string());

        drop(InFlightGuard {
            set: set.clone(),
            session: "abc123de".to_string(),
        });

        assert!(set.lock().unwrap().is_empty());
    }
}

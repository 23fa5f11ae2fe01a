//! Shared server state: every registry and collaborator client, owned by
//! one instance and handed to handlers through axum's `State`.

use crate::face::{FaceVerifier, HttpFaceVerifier, NullFaceVerifier};
use crate::forward::UploadForwarder;
use crate::relay::RealtimeRelay;
use crate::session::SessionRegistry;
use atelier_common::Config;
use atelier_motion::{EmbeddingProvider, MotionCorpus, OpenAiEmbedding, SimilarityMatcher};
use atelier_persona::{
    AssetCache, LanguageModel, OpenAiChat, PersonaBuilder, PersonaEvolver, PersonaStore,
};
use std::sync::Arc;
use std::time::Duration;

/// Shared state for the Atelier server.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<SessionRegistry>,
    pub relay: Arc<RealtimeRelay>,
    pub assets: Arc<AssetCache>,
    pub store: Arc<PersonaStore>,
    pub builder: Arc<PersonaBuilder>,
    pub evolver: Arc<PersonaEvolver>,
    pub corpus: Arc<MotionCorpus>,
    pub matcher: Arc<SimilarityMatcher>,
    pub embedding: Arc<dyn EmbeddingProvider>,
    pub model: Arc<dyn LanguageModel>,
    pub face: Arc<dyn FaceVerifier>,
    pub forwarder: Arc<UploadForwarder>,
}

impl AppState {
    /// Wire up every component from configuration.
    pub fn from_config(config: Config) -> anyhow::Result<Arc<Self>> {
        let api_key = config.llm.api_key.clone().unwrap_or_default();
        if api_key.is_empty() {
            tracing::warn!("No LLM API key configured; collaborator calls will fail to fallbacks");
        }

        let model: Arc<dyn LanguageModel> = Arc::new(OpenAiChat::new(
            api_key.clone(),
            config.llm.base_url.clone(),
            config.llm.chat_model.clone(),
            config.llm.vision_model.clone(),
            Duration::from_secs(config.llm.timeout_secs),
        ));

        let embedding: Arc<dyn EmbeddingProvider> = Arc::new(OpenAiEmbedding::new(
            api_key,
            config.llm.base_url.clone(),
            config.llm.embedding_model.clone(),
            Duration::from_secs(config.llm.embedding_timeout_secs),
        ));

        let corpus = Arc::new(MotionCorpus::open(
            &config.corpus.path,
            &config.corpus.fallback_path,
        )?);
        let matcher = Arc::new(SimilarityMatcher::new(corpus.clone(), embedding.clone()));

        let store = Arc::new(PersonaStore::new(config.storage.persona_dir()));
        let assets = Arc::new(AssetCache::new());
        let builder = Arc::new(PersonaBuilder::new(
            store.clone(),
            assets.clone(),
            model.clone(),
        ));
        let evolver = Arc::new(PersonaEvolver::new(store.clone(), model.clone()));

        let registry = Arc::new(SessionRegistry::new());
        let relay = Arc::new(RealtimeRelay::new(
            registry.clone(),
            Duration::from_secs(config.relay.autoreset_delay_secs),
        ));

        let face: Arc<dyn FaceVerifier> = match config.face.base_url.as_deref() {
            Some(url) if !url.is_empty() => Arc::new(HttpFaceVerifier::new(
                url,
                Duration::from_secs(config.face.timeout_secs),
            )),
            _ => {
                tracing::info!("Face service not configured; duplicate detection disabled");
                Arc::new(NullFaceVerifier)
            }
        };

        let forwarder = Arc::new(UploadForwarder::new(config.forward.upload_mirrors.clone()));

        Ok(Arc::new(Self {
            config,
            registry,
            relay,
            assets,
            store,
            builder,
            evolver,
            corpus,
            matcher,
            embedding,
            model,
            face,
            forwarder,
        }))
    }
}

//! Atelier server - session orchestration for the installation.
//!
//! Sits between the exhibit's capture clients and the language-model
//! backend:
//!
//! ```text
//! capture client → upload → AssetCache → PersonaBuilder → PersonaStore
//! motion client  → motion-context → MotionCorpus/SimilarityMatcher
//!                                 → PersonaEvolver (background)
//! room peers     ↔ /ws ↔ RealtimeRelay ↔ SessionRegistry
//! ```

#![warn(clippy::all)]

pub mod face;
pub mod forward;
pub mod relay;
pub mod routes;
pub mod session;
pub mod state;
pub mod tasks;

pub use face::{FaceVerdict, FaceVerifier, HttpFaceVerifier, NullFaceVerifier};
pub use forward::UploadForwarder;
pub use relay::RealtimeRelay;
pub use routes::build_router;
pub use session::{SessionEntry, SessionRegistry};
pub use state::AppState;
pub use tasks::spawn_background;

use atelier_common::Config;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};

/// Start the Atelier HTTP/WS server.
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.server.bind.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    let state = AppState::from_config(config)?;

    // Warm the corpus once; rows that fail to embed are excluded from
    // matching until the next restart rather than retried per request.
    let embedded = state
        .corpus
        .ensure_embeddings(state.embedding.as_ref())
        .await?;
    tracing::info!(
        rows = state.corpus.len().await,
        embedded,
        "Motion corpus ready"
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = build_router(state).layer(cors);

    tracing::info!("Starting Atelier server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

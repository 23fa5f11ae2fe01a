//! Explicit fire-and-forget background tasks.
//!
//! Everything the request path does not await goes through here, so every
//! detached task has a name and a logged completion.

use std::future::Future;

/// Spawn a background task whose failure is logged, never propagated.
pub fn spawn_background<F>(name: &'static str, future: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = future.await {
            tracing::error!(task = name, error = %e, "Background task failed");
        } else {
            tracing::debug!(task = name, "Background task completed");
        }
    })
}

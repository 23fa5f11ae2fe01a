//! Fire-and-forget forwarding of upload events to external mirrors.

use serde_json::Value;
use std::time::Duration;

/// Forwards upload events to configured mirror URLs.
///
/// Always invoked off the request path; every failure is logged and
/// swallowed so a dead mirror cannot degrade the exhibit.
pub struct UploadForwarder {
    client: reqwest::Client,
    mirrors: Vec<String>,
}

impl UploadForwarder {
    pub fn new(mirrors: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client, mirrors }
    }

    pub fn is_configured(&self) -> bool {
        !self.mirrors.is_empty()
    }

    /// Send the event to every mirror.
    pub async fn forward(&self, event: &Value) {
        for mirror in &self.mirrors {
            match self.client.post(mirror).json(event).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(mirror = %mirror, "Upload event forwarded");
                }
                Ok(response) => {
                    tracing::warn!(
                        mirror = %mirror,
                        status = %response.status(),
                        "Mirror rejected upload event"
                    );
                }
                Err(e) => {
                    tracing::warn!(mirror = %mirror, error = %e, "Mirror forwarding failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn forwards_to_every_mirror() {
        let first = MockServer::start().await;
        let second = MockServer::start().await;

        for server in [&first, &second] {
            Mock::given(method("POST"))
                .and(body_partial_json(json!({ "kind": "photo" })))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(server)
                .await;
        }

        let forwarder = UploadForwarder::new(vec![first.uri(), second.uri()]);
        forwarder
            .forward(&json!({ "kind": "photo", "session": "abc123de" }))
            .await;
    }

    #[tokio::test]
    async fn dead_mirror_does_not_panic() {
        let forwarder = UploadForwarder::new(vec!["http://127.0.0.1:1".to_string()]);
        forwarder.forward(&json!({ "kind": "drawing" })).await;
    }
}

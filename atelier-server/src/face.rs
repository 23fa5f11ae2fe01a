//! Narrow client for the face-recognition collaborator.
//!
//! The face service answers `/verify` with a similarity match against its
//! visitor database and `/register` to enroll a new face. This core only
//! needs one question answered: has this face been seen before?

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

/// Outcome of a face verification.
#[derive(Debug, Clone, Default)]
pub struct FaceVerdict {
    /// Visitor id assigned by the face service, when known.
    pub face_id: Option<String>,
    /// The face matched an already-registered visitor.
    pub duplicate: bool,
}

/// Seam for the face-recognition collaborator.
#[async_trait]
pub trait FaceVerifier: Send + Sync {
    /// Verify a captured photo for a session.
    async fn verify(&self, image_path: &Path, session_id: &str) -> anyhow::Result<FaceVerdict>;
}

/// Disabled verifier used when no face service is configured.
///
/// Every photo passes; the installation degrades to trusting the room.
pub struct NullFaceVerifier;

#[async_trait]
impl FaceVerifier for NullFaceVerifier {
    async fn verify(&self, _image_path: &Path, _session_id: &str) -> anyhow::Result<FaceVerdict> {
        Ok(FaceVerdict::default())
    }
}

/// HTTP client for the face service.
pub struct HttpFaceVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFaceVerifier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    visitor_id: String,
    #[serde(default)]
    is_registered: bool,
    #[serde(default)]
    similarity: f64,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    visitor_id: Option<String>,
}

#[async_trait]
impl FaceVerifier for HttpFaceVerifier {
    async fn verify(&self, image_path: &Path, session_id: &str) -> anyhow::Result<FaceVerdict> {
        let bytes = tokio::fs::read(image_path).await?;
        let image = BASE64.encode(bytes);

        let response = self
            .client
            .post(format!("{}/verify", self.base_url))
            .json(&json!({ "image": image }))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Face verify request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Face service returned {}: {}", status, body);
        }

        let verdict: VerifyResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse face verify response: {}", e))?;

        if verdict.is_registered {
            tracing::info!(
                session = session_id,
                visitor = %verdict.visitor_id,
                similarity = verdict.similarity,
                "Face matched an existing visitor"
            );
            return Ok(FaceVerdict {
                face_id: Some(verdict.visitor_id),
                duplicate: true,
            });
        }

        // New face: enroll it under this session's id.
        let registered: RegisterResponse = self
            .client
            .post(format!("{}/register", self.base_url))
            .json(&json!({ "image": image, "uuid": session_id }))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Face register request failed: {}", e))?
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse face register response: {}", e))?;

        if registered.status != "success" {
            // Registration failing (e.g. no face found) is not a duplicate;
            // the flow continues without a face id.
            tracing::warn!(session = session_id, status = %registered.status, "Face registration declined");
            return Ok(FaceVerdict::default());
        }

        Ok(FaceVerdict {
            face_id: registered.visitor_id,
            duplicate: false,
        })
    }
}

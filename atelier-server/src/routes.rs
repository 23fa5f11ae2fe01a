//! HTTP routes for the Atelier server.
//!
//! The orchestrator: uploads feed the asset cache and persona builder,
//! motion context reads the corpus and talks to the language model, and
//! the relay endpoint upgrades into the room-multiplexed WebSocket.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use crate::state::AppState;
use crate::tasks::spawn_background;
use atelier_common::Error;
use atelier_persona::{AssetKind, CompletionRequest, Persona, PersonaRecord, PersonaStore};

/// Fixed emotion labels for motion reactions. The model must pick one;
/// anything else collapses to the first label.
pub const EMOTION_STATES: &[&str] = &["neutral", "happy", "excited", "curious", "sad"];

/// Canned in-character line used whenever the language model is unreachable.
const FALLBACK_REPLY: &str = "...! (기지개를 켜며 천천히 고개를 듭니다)";

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    room: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    face_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duplicate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PersonaInfoResponse {
    ok: bool,
    session_id: String,
    name: String,
    traits: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    avatar_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    ok: bool,
    reply: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MotionContextResponse {
    session_id: String,
    persona_reply: String,
    motion_interpretation: String,
    state: String,
    // Wire compatibility: this one key stays snake_case.
    #[serde(rename = "reaction_full")]
    reaction_full: Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    time: String,
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MotionContextBody {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    motion_summary: String,
}

// ============================================================================
// Router
// ============================================================================

/// Build the server router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/upload/photo", post(upload_photo))
        .route("/api/upload/drawing", post(upload_drawing))
        .route("/api/persona-info/:session_id", get(persona_info))
        .route("/api/chat", post(chat))
        .route("/api/motion-context", post(motion_context))
        .route("/api/health", get(health))
        .route("/api/debug/session/:room", get(debug_session))
        .route("/api/debug/assets/:session_id", get(debug_assets))
        .route("/api/debug/persona/:session_id", get(debug_persona))
        .route("/ws", get(ws_upgrade))
        .layer(DefaultBodyLimit::max(25 * 1024 * 1024))
        .with_state(state)
}

/// Turn a domain error into its wire shape: status from the error
/// taxonomy, a stable string code in the body.
fn reject(err: Error, code: &str) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    tracing::debug!(code = code, error = %err, "Rejecting request");
    (status, Json(json!({ "ok": false, "error": code }))).into_response()
}

// ============================================================================
// WebSocket
// ============================================================================

async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| relay.handle_socket(socket))
}

// ============================================================================
// Uploads
// ============================================================================

/// Collected multipart fields for an upload request.
#[derive(Debug, Default)]
struct UploadParts {
    room: Option<String>,
    session: Option<String>,
    image: Option<(Vec<u8>, String)>,
}

/// File extension for a stored upload, from the client's filename.
fn upload_extension(file_name: Option<&str>) -> String {
    let ext = file_name
        .and_then(|name| name.rsplit('.').next())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" | "jpg" | "jpeg" | "webp" => ext,
        _ => "jpg".to_string(),
    }
}

async fn read_upload(multipart: &mut Multipart) -> Result<UploadParts, String> {
    let mut parts = UploadParts::default();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Malformed multipart body");
                return Err("malformed_multipart".to_string());
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let ext = upload_extension(field.file_name());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|_| "malformed_multipart".to_string())?;
                parts.image = Some((bytes.to_vec(), ext));
            }
            "room" => {
                parts.room = field.text().await.ok().filter(|s| !s.trim().is_empty());
            }
            "session" => {
                parts.session = field.text().await.ok().filter(|s| !s.trim().is_empty());
            }
            _ => {}
        }
    }

    Ok(parts)
}

/// Persist an upload under `{session}_{kind}.{ext}` in the upload dir.
async fn store_upload(
    state: &AppState,
    session: &str,
    kind: &str,
    bytes: &[u8],
    ext: &str,
) -> anyhow::Result<PathBuf> {
    let dir = state.config.storage.upload_dir();
    tokio::fs::create_dir_all(&dir).await?;

    let stem = PersonaStore::sanitize_session_id(session);
    let path = dir.join(format!("{stem}_{kind}.{ext}"));
    tokio::fs::write(&path, bytes).await?;

    Ok(path)
}

fn spawn_build_and_forward(state: &Arc<AppState>, session: &str, kind: &str, room: &str) {
    let builder = state.builder.clone();
    let build_session = session.to_string();
    spawn_background("persona_build", async move {
        builder.try_build(&build_session).await;
        Ok(())
    });

    if state.forwarder.is_configured() {
        let forwarder = state.forwarder.clone();
        let event = json!({ "kind": kind, "room": room, "session": session });
        spawn_background("upload_forward", async move {
            forwarder.forward(&event).await;
            Ok(())
        });
    }
}

async fn upload_photo(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let parts = match read_upload(&mut multipart).await {
        Ok(parts) => parts,
        Err(code) => return reject(Error::InvalidInput("unreadable multipart body".into()), &code),
    };

    let Some(room) = parts.room else {
        return reject(Error::InvalidInput("room field is required".into()), "missing_room");
    };
    let Some((bytes, ext)) = parts.image else {
        return reject(Error::InvalidInput("image field is required".into()), "missing_image");
    };

    let session = state.registry.coerce(&room, parts.session.as_deref());

    let path = match store_upload(&state, &session, "photo", &bytes, &ext).await {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(session = %session, error = %e, "Failed to store photo upload");
            return reject(Error::Internal(e.to_string()), "storage_failed");
        }
    };

    // Face check runs before the asset is remembered, so a rejected photo
    // never becomes half of a persona build.
    let face_id = match state.face.verify(&path, &session).await {
        Ok(verdict) if verdict.duplicate => {
            tracing::info!(room = %room, session = %session, "Duplicate face; rejecting upload");
            state.assets.clear(&session);
            state.relay.broadcast_event(
                &room,
                &json!({ "type": "face_duplicate", "room": room, "session": session }),
            );
            return Json(UploadResponse {
                ok: false,
                room: Some(room),
                session: Some(session),
                face_id: verdict.face_id,
                duplicate: Some(true),
                error: Some("duplicate_face".to_string()),
            })
            .into_response();
        }
        Ok(verdict) => verdict.face_id,
        Err(e) => {
            // Face service down degrades to trusting the room.
            tracing::warn!(session = %session, error = %e, "Face verification failed; continuing");
            None
        }
    };

    state
        .assets
        .remember(&session, &room, AssetKind::Photo, path);
    state.relay.broadcast_event(
        &room,
        &json!({ "type": "photo_captured", "room": room, "session": session }),
    );
    spawn_build_and_forward(&state, &session, "photo", &room);

    Json(UploadResponse {
        ok: true,
        room: Some(room),
        session: Some(session),
        face_id,
        duplicate: None,
        error: None,
    })
    .into_response()
}

async fn upload_drawing(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let parts = match read_upload(&mut multipart).await {
        Ok(parts) => parts,
        Err(code) => return reject(Error::InvalidInput("unreadable multipart body".into()), &code),
    };

    let Some(room) = parts.room else {
        return reject(Error::InvalidInput("room field is required".into()), "missing_room");
    };
    let Some((bytes, ext)) = parts.image else {
        return reject(Error::InvalidInput("image field is required".into()), "missing_image");
    };

    let session = state.registry.coerce(&room, parts.session.as_deref());

    let path = match store_upload(&state, &session, "drawing", &bytes, &ext).await {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(session = %session, error = %e, "Failed to store drawing upload");
            return reject(Error::Internal(e.to_string()), "storage_failed");
        }
    };

    state
        .assets
        .remember(&session, &room, AssetKind::Drawing, path);
    spawn_build_and_forward(&state, &session, "drawing", &room);

    Json(UploadResponse {
        ok: true,
        room: Some(room),
        session: Some(session),
        face_id: None,
        duplicate: None,
        error: None,
    })
    .into_response()
}

// ============================================================================
// Persona Info
// ============================================================================

/// Locate a session's drawing: pending cache first, then the upload dir
/// (renamed uploads outlive the cache entry).
async fn find_drawing(state: &AppState, session_id: &str) -> Option<PathBuf> {
    if let Some(pending) = state.assets.get(session_id) {
        if let Some(path) = pending.drawing_path {
            return Some(path);
        }
    }

    let stem = PersonaStore::sanitize_session_id(session_id);
    let prefix = format!("{stem}_drawing.");
    let mut entries = tokio::fs::read_dir(state.config.storage.upload_dir())
        .await
        .ok()?;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) {
            return Some(entry.path());
        }
    }

    None
}

async fn persona_info(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<String>,
) -> Response {
    let record = state.store.read(&session_id).await;
    let drawing = find_drawing(&state, &session_id).await;

    if record.is_none() && drawing.is_none() {
        return reject(
            Error::NotFound(format!("no persona or drawing for {session_id}")),
            "not_found",
        );
    }

    let persona = record.map(|r| r.persona);
    let avatar_url = drawing.and_then(|path| {
        path.file_name()
            .map(|name| format!("/uploads/{}", name.to_string_lossy()))
    });

    Json(PersonaInfoResponse {
        ok: true,
        session_id: PersonaStore::sanitize_session_id(&session_id),
        name: persona
            .as_ref()
            .and_then(|p| p.name.clone())
            .unwrap_or_default(),
        traits: persona.map(|p| p.core.traits).unwrap_or_default(),
        avatar_url,
    })
    .into_response()
}

// ============================================================================
// Chat
// ============================================================================

/// Read the session's persona, creating the fallback record when missing
/// so no consumer ever blocks on an absent file.
async fn load_or_create_persona(state: &AppState, session_id: &str) -> PersonaRecord {
    if let Some(record) = state.store.read(session_id).await {
        return record;
    }

    tracing::info!(session = session_id, "No persona on disk; creating fallback");
    state
        .store
        .write(session_id, Persona::fallback(session_id))
        .await
}

fn chat_system_prompt(persona: &Persona) -> String {
    let mut prompt = persona.system_prompt.clone();

    if !persona.core.traits.is_empty() {
        prompt.push_str(&format!("\nYour traits: {}.", persona.core.traits.join(", ")));
    }
    if !persona.core.tone.is_empty() {
        prompt.push_str(&format!("\nSpeak in a {} tone.", persona.core.tone));
    }
    if !persona.seed_memories.is_empty() {
        prompt.push_str("\nYou remember:");
        for memory in persona.seed_memories.iter().rev().take(5) {
            prompt.push_str(&format!("\n- {memory}"));
        }
    }

    prompt
}

async fn chat(State(state): State<Arc<AppState>>, Json(body): Json<ChatBody>) -> Response {
    if body.session_id.trim().is_empty() {
        return reject(Error::InvalidInput("sessionId is required".into()), "missing_session");
    }
    if body.text.trim().is_empty() {
        return reject(Error::InvalidInput("text is required".into()), "missing_text");
    }

    let record = load_or_create_persona(&state, &body.session_id).await;

    let reply = match state
        .model
        .complete(CompletionRequest {
            system: Some(chat_system_prompt(&record.persona)),
            user_text: body.text.clone(),
            temperature: Some(0.8),
            max_tokens: Some(400),
            ..Default::default()
        })
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(session = %record.session_id, error = %e, "Chat completion failed");
            FALLBACK_REPLY.to_string()
        }
    };

    Json(ChatResponse { ok: true, reply }).into_response()
}

// ============================================================================
// Motion Context
// ============================================================================

/// Avatar-scoped session ids arrive as `ava_<session>`; lookups operate
/// on the bare session id.
fn strip_session_prefix(session_id: &str) -> &str {
    session_id.strip_prefix("ava_").unwrap_or(session_id)
}

/// Collapse a model-proposed emotion to the fixed label set.
fn normalize_state(proposed: Option<&str>) -> &'static str {
    let Some(proposed) = proposed else {
        return EMOTION_STATES[0];
    };
    let folded = proposed.trim().to_lowercase();
    EMOTION_STATES
        .iter()
        .find(|&&label| label == folded)
        .copied()
        .unwrap_or(EMOTION_STATES[0])
}

async fn motion_context(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MotionContextBody>,
) -> Response {
    let session = strip_session_prefix(body.session_id.trim()).to_string();
    if session.is_empty() {
        return reject(Error::InvalidInput("sessionId is required".into()), "missing_session");
    }
    if body.motion_summary.trim().is_empty() {
        return reject(
            Error::InvalidInput("motionSummary is required".into()),
            "missing_motion_summary",
        );
    }

    let record = load_or_create_persona(&state, &session).await;

    // A down embedding backend degrades to a null match, never an error.
    let motion_match = match state.matcher.find_closest(&body.motion_summary).await {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(session = %session, error = %e, "Motion matching failed");
            None
        }
    };

    let interpretation = motion_match
        .as_ref()
        .map(|m| m.entry.description.clone())
        .unwrap_or_else(|| body.motion_summary.clone());

    if let Some(found) = &motion_match {
        tracing::debug!(
            session = %session,
            index = found.entry.index,
            score = found.score,
            "Motion matched"
        );
    }

    let user_text = format!(
        "The visitor just performed this motion: {}\nRecognized motion: {}\n\
         React in character. Reply with a JSON object: \
         {{\"personaReply\": \"<one or two short sentences>\", \"state\": \"<one of: {}>\"}}",
        body.motion_summary,
        interpretation,
        EMOTION_STATES.join(", "),
    );

    let completion = state
        .model
        .complete(CompletionRequest {
            system: Some(chat_system_prompt(&record.persona)),
            user_text,
            temperature: Some(0.9),
            max_tokens: Some(300),
            ..Default::default()
        })
        .await;

    let (persona_reply, reaction_state, reaction_full, model_ok) = match completion {
        Ok(reply) => match atelier_persona::parse_json_object(&reply) {
            Some(value) => {
                let persona_reply = value
                    .get("personaReply")
                    .and_then(Value::as_str)
                    .unwrap_or(FALLBACK_REPLY)
                    .to_string();
                let reaction_state =
                    normalize_state(value.get("state").and_then(Value::as_str)).to_string();
                (persona_reply, reaction_state, value, true)
            }
            None => {
                // Free-text reply: usable as the line, state defaults.
                let persona_reply = reply.trim().to_string();
                let reaction_state = EMOTION_STATES[0].to_string();
                let reaction_full =
                    json!({ "personaReply": persona_reply, "state": reaction_state });
                (persona_reply, reaction_state, reaction_full, true)
            }
        },
        Err(e) => {
            tracing::warn!(session = %session, error = %e, "Motion reaction completion failed");
            let reaction_state = EMOTION_STATES[0].to_string();
            let reaction_full = json!({ "personaReply": FALLBACK_REPLY, "state": reaction_state });
            (FALLBACK_REPLY.to_string(), reaction_state, reaction_full, false)
        }
    };

    // Persona durability deliberately lags the response by one model
    // round-trip; the caller never waits on evolution.
    if model_ok {
        let evolver = state.evolver.clone();
        let evolve_session = session.clone();
        let motion_summary = body.motion_summary.clone();
        let reaction = reaction_full.clone();
        spawn_background("persona_evolve", async move {
            evolver
                .evolve(&evolve_session, &motion_summary, &reaction)
                .await
        });
    }

    Json(MotionContextResponse {
        session_id: session,
        persona_reply,
        motion_interpretation: interpretation,
        state: reaction_state,
        reaction_full,
    })
    .into_response()
}

// ============================================================================
// Health & Debug
// ============================================================================

async fn health() -> Response {
    Json(HealthResponse {
        ok: true,
        time: Utc::now().to_rfc3339(),
    })
    .into_response()
}

async fn debug_session(
    State(state): State<Arc<AppState>>,
    AxumPath(room): AxumPath<String>,
) -> Response {
    let entry = state.registry.get(&room);
    Json(json!({
        "room": room,
        "entry": entry,
        "peers": state.relay.peer_count(&room),
    }))
    .into_response()
}

async fn debug_assets(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<String>,
) -> Response {
    let pending = state.assets.get(&session_id);
    Json(json!({
        "sessionId": session_id,
        "pending": pending.map(|p| json!({
            "room": p.room,
            "photoPath": p.photo_path,
            "drawingPath": p.drawing_path,
        })),
        "pendingSessions": state.assets.session_ids(),
    }))
    .into_response()
}

async fn debug_persona(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<String>,
) -> Response {
    let record = state.store.read(&session_id).await;
    Json(json!({
        "sessionId": session_id,
        "exists": record.is_some(),
        "record": record,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_session_prefix_removes_avatar_scope() {
        assert_eq!(strip_session_prefix("ava_abc123de"), "abc123de");
        assert_eq!(strip_session_prefix("abc123de"), "abc123de");
        assert_eq!(strip_session_prefix("ava_"), "");
    }

    #[test]
    fn normalize_state_collapses_unknown_labels() {
        assert_eq!(normalize_state(Some("happy")), "happy");
        assert_eq!(normalize_state(Some("HAPPY ")), "happy");
        assert_eq!(normalize_state(Some("ecstatic")), "neutral");
        assert_eq!(normalize_state(None), "neutral");
    }

    #[test]
    fn upload_extension_allows_known_image_types_only() {
        assert_eq!(upload_extension(Some("selfie.PNG")), "png");
        assert_eq!(upload_extension(Some("photo.jpeg")), "jpeg");
        assert_eq!(upload_extension(Some("weird.exe")), "jpg");
        assert_eq!(upload_extension(None), "jpg");
    }

    #[test]
    fn chat_system_prompt_carries_persona_context() {
        let persona = Persona::fallback("abc123de");
        let prompt = chat_system_prompt(&persona);

        assert!(prompt.contains(&persona.system_prompt));
        assert!(prompt.contains("curious"));
        assert!(prompt.contains("warm"));
        assert!(prompt.contains("abc123de"));
    }

    #[test]
    fn upload_response_skips_absent_fields() {
        let response = UploadResponse {
            ok: true,
            room: Some("R1".into()),
            session: Some("abc123de".into()),
            face_id: None,
            duplicate: None,
            error: None,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"room\":\"R1\""));
        assert!(!json.contains("duplicate"));
        assert!(!json.contains("faceId"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn motion_context_response_uses_wire_keys() {
        let response = MotionContextResponse {
            session_id: "abc123de".into(),
            persona_reply: "hello".into(),
            motion_interpretation: "걷기".into(),
            state: "happy".into(),
            reaction_full: json!({ "state": "happy" }),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"sessionId\""));
        assert!(json.contains("\"personaReply\""));
        assert!(json.contains("\"motionInterpretation\""));
        assert!(json.contains("\"reaction_full\""));
    }
}

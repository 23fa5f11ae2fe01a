//! Room-to-session bindings with fencing.
//!
//! A room has exactly one current session. The registry is the single
//! source of truth clients must defer to: whatever session id a caller
//! proposes, the bound id wins. State is process-lifetime only; a restart
//! drops all bindings and the next `join` re-establishes them.

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

const SESSION_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A room's current session binding.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
}

/// Binds room identifiers to session identifiers.
///
/// Every operation is a single synchronous critical section; nothing here
/// awaits, so two concurrent uploads can never both decide "no session
/// yet" and mint two ids for the same room.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh 8-character lowercase alphanumeric session token.
    pub fn mint_session_id() -> String {
        let mut rng = rand::thread_rng();
        (0..8)
            .map(|_| SESSION_CHARSET[rng.gen_range(0..SESSION_CHARSET.len())] as char)
            .collect()
    }

    /// Fold a proposed id to lowercase and accept it only if it matches
    /// the 8-char alphanumeric token pattern.
    fn normalize(proposed: Option<&str>) -> Option<String> {
        let folded = proposed?.trim().to_lowercase();
        let pattern = Regex::new(r"^[a-z0-9]{8}$").expect("static pattern");
        pattern.is_match(&folded).then_some(folded)
    }

    /// Bind a session to a room, overwriting any existing binding.
    ///
    /// The proposed id is used when it normalizes cleanly; otherwise a
    /// fresh token is minted.
    pub fn start(&self, room: &str, proposed: Option<&str>) -> SessionEntry {
        let mut inner = self.inner.lock().expect("session registry poisoned");
        Self::start_locked(&mut inner, room, proposed)
    }

    fn start_locked(
        inner: &mut HashMap<String, SessionEntry>,
        room: &str,
        proposed: Option<&str>,
    ) -> SessionEntry {
        let session_id = Self::normalize(proposed).unwrap_or_else(Self::mint_session_id);
        let entry = SessionEntry {
            session_id,
            started_at: Utc::now(),
        };

        if let Some(previous) = inner.insert(room.to_string(), entry.clone()) {
            tracing::info!(
                room = room,
                previous = %previous.session_id,
                session = %entry.session_id,
                "Session binding overwritten"
            );
        } else {
            tracing::info!(room = room, session = %entry.session_id, "Session started");
        }

        entry
    }

    /// Remove a room's binding unconditionally. No error if absent.
    pub fn end(&self, room: &str) {
        let removed = self
            .inner
            .lock()
            .expect("session registry poisoned")
            .remove(room);

        if let Some(entry) = removed {
            tracing::info!(room = room, session = %entry.session_id, "Session ended");
        }
    }

    /// The bound entry for a room, if any.
    pub fn get(&self, room: &str) -> Option<SessionEntry> {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .get(room)
            .cloned()
    }

    /// Resolve the authoritative session for a room.
    ///
    /// A bound id wins over whatever the caller proposed (the mismatch is
    /// logged, never an error). With no binding, the proposal seeds a new
    /// one. Check and insert share one critical section.
    pub fn coerce_entry(&self, room: &str, proposed: Option<&str>) -> SessionEntry {
        let mut inner = self.inner.lock().expect("session registry poisoned");

        if let Some(entry) = inner.get(room) {
            if let Some(requested) = Self::normalize(proposed) {
                if requested != entry.session_id {
                    tracing::warn!(
                        room = room,
                        bound = %entry.session_id,
                        proposed = %requested,
                        "Proposed session id overridden by room binding"
                    );
                }
            }
            return entry.clone();
        }

        Self::start_locked(&mut inner, room, proposed)
    }

    /// Like [`coerce_entry`], returning just the session id.
    ///
    /// [`coerce_entry`]: Self::coerce_entry
    pub fn coerce(&self, room: &str, proposed: Option<&str>) -> String {
        self.coerce_entry(room, proposed).session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_eight_lowercase_alphanumerics() {
        for _ in 0..50 {
            let id = SessionRegistry::mint_session_id();
            assert_eq!(id.len(), 8);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn normalize_folds_case_and_rejects_bad_shapes() {
        assert_eq!(
            SessionRegistry::normalize(Some("Abc123DE")),
            Some("abc123de".to_string())
        );
        assert_eq!(SessionRegistry::normalize(Some("short")), None);
        assert_eq!(SessionRegistry::normalize(Some("toolong123")), None);
        assert_eq!(SessionRegistry::normalize(Some("has space")), None);
        assert_eq!(SessionRegistry::normalize(None), None);
    }

    #[test]
    fn coerce_first_proposal_wins() {
        let registry = SessionRegistry::new();

        let first = registry.coerce("R1", Some("abc123de"));
        let second = registry.coerce("R1", Some("zzz999xx"));

        assert_eq!(first, "abc123de");
        assert_eq!(second, "abc123de");
    }

    #[test]
    fn coerce_mints_when_nothing_is_bound_or_proposed() {
        let registry = SessionRegistry::new();
        let id = registry.coerce("R1", None);
        assert_eq!(id.len(), 8);
        assert_eq!(registry.coerce("R1", None), id);
    }

    #[test]
    fn start_overwrites_existing_binding() {
        let registry = SessionRegistry::new();
        registry.start("R1", Some("abc123de"));
        let entry = registry.start("R1", Some("zzz999xx"));

        assert_eq!(entry.session_id, "zzz999xx");
        assert_eq!(registry.get("R1").unwrap().session_id, "zzz999xx");
    }

    #[test]
    fn end_leaves_room_absent_and_restart_gets_fresh_timestamp() {
        let registry = SessionRegistry::new();
        let first = registry.start("R1", None);

        registry.end("R1");
        assert!(registry.get("R1").is_none());

        let second = registry.start("R1", None);
        assert!(second.started_at >= first.started_at);
        assert_ne!(second.session_id, first.session_id);
    }

    #[test]
    fn end_of_unbound_room_is_a_no_op() {
        let registry = SessionRegistry::new();
        registry.end("never-bound");
        assert!(registry.get("never-bound").is_none());
    }
}

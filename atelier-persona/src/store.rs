//! Durable per-session persona records, one JSON file per session.

use crate::types::{Persona, PersonaRecord};
use chrono::Utc;
use std::path::{Path, PathBuf};

/// File-backed persona store.
///
/// Durability is best-effort: a failed write is logged and the in-memory
/// record is still returned, so the request that produced it can proceed.
pub struct PersonaStore {
    dir: PathBuf,
}

impl PersonaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Fold a session id into a filesystem-safe file stem.
    ///
    /// File identity is derived from this, so at most one record exists
    /// per session no matter how the id was spelled by the caller.
    pub fn sanitize_session_id(session_id: &str) -> String {
        let folded = session_id.trim().to_lowercase();
        let safe: String = folded
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        if safe.is_empty() {
            "unknown".to_string()
        } else {
            safe
        }
    }

    /// Path of the record file for a session.
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", Self::sanitize_session_id(session_id)))
    }

    /// Whether a record exists on disk for this session.
    pub async fn exists(&self, session_id: &str) -> bool {
        tokio::fs::try_exists(self.path_for(session_id))
            .await
            .unwrap_or(false)
    }

    /// Read the record for a session. Missing or unreadable files read as
    /// `None`; a corrupt file is logged, never a crash.
    pub async fn read(&self, session_id: &str) -> Option<PersonaRecord> {
        let path = self.path_for(session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read persona record");
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Corrupt persona record");
                None
            }
        }
    }

    /// Persist a persona for a session and return the record.
    ///
    /// Disk failures are logged; the caller still gets the record it
    /// would have persisted.
    pub async fn write(&self, session_id: &str, persona: Persona) -> PersonaRecord {
        let record = PersonaRecord {
            session_id: Self::sanitize_session_id(session_id),
            saved_at: Utc::now(),
            persona,
        };

        let path = self.path_for(session_id);
        if let Err(e) = self.write_record(&path, &record).await {
            tracing::error!(
                session = %record.session_id,
                path = %path.display(),
                error = %e,
                "Failed to persist persona record"
            );
        }

        record
    }

    async fn write_record(&self, path: &Path, record: &PersonaRecord) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_folds_and_replaces() {
        assert_eq!(PersonaStore::sanitize_session_id("Abc123DE"), "abc123de");
        assert_eq!(PersonaStore::sanitize_session_id("a/b..c"), "a_b__c");
        assert_eq!(PersonaStore::sanitize_session_id("  "), "unknown");
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersonaStore::new(dir.path());

        let written = store.write("abc123de", Persona::fallback("abc123de")).await;
        let read = store.read("abc123de").await.unwrap();

        assert_eq!(read.session_id, written.session_id);
        assert_eq!(read.persona, written.persona);
        assert!(store.exists("abc123de").await);
    }

    #[tokio::test]
    async fn differently_spelled_ids_hit_the_same_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersonaStore::new(dir.path());

        store.write("ABC123DE", Persona::fallback("abc123de")).await;
        assert!(store.exists("abc123de").await);
    }

    #[tokio::test]
    async fn missing_and_corrupt_records_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersonaStore::new(dir.path());

        assert!(store.read("nosuchid").await.is_none());

        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(store.path_for("badfile0"), "{not json")
            .await
            .unwrap();
        assert!(store.read("badfile0").await.is_none());
    }
}

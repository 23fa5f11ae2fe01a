//! Motion corpus backed by a delimited corpus file.
//!
//! Rows carry a description, an optional generation prompt, and an optional
//! precomputed embedding. Embeddings are keyed to the text field they were
//! computed from; a cached vector whose source no longer matches the
//! preferred text is stale and gets recomputed, never served.

use crate::embeddings::EmbeddingProvider;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Which text field an entry's cached embedding was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingSource {
    Prompt,
    Description,
    None,
}

impl EmbeddingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Description => "description",
            Self::None => "",
        }
    }
}

impl From<&str> for EmbeddingSource {
    fn from(s: &str) -> Self {
        match s {
            "prompt" => Self::Prompt,
            "description" => Self::Description,
            _ => Self::None,
        }
    }
}

/// A single motion corpus entry.
#[derive(Debug, Clone)]
pub struct MotionEntry {
    /// Stable corpus index, preserved across rewrites.
    pub index: usize,
    /// Human-readable motion description.
    pub description: String,
    /// Generation prompt, preferred over the description when present.
    pub prompt: String,
    /// Cached embedding vector, if any.
    pub embedding: Option<Vec<f32>>,
    /// Text field the cached vector was computed from.
    pub embedding_source: EmbeddingSource,
}

impl MotionEntry {
    /// The text source embeddings should currently be computed from.
    ///
    /// Prompt wins over description; an entry with neither has no source.
    pub fn preferred_source(&self) -> EmbeddingSource {
        if !self.prompt.trim().is_empty() {
            EmbeddingSource::Prompt
        } else if !self.description.trim().is_empty() {
            EmbeddingSource::Description
        } else {
            EmbeddingSource::None
        }
    }

    /// The text that should be embedded for this entry.
    pub fn embed_text(&self) -> Option<&str> {
        match self.preferred_source() {
            EmbeddingSource::Prompt => Some(self.prompt.trim()),
            EmbeddingSource::Description => Some(self.description.trim()),
            EmbeddingSource::None => None,
        }
    }

    /// A cached vector is valid only if it was computed from the
    /// currently preferred source.
    pub fn has_valid_embedding(&self) -> bool {
        let preferred = self.preferred_source();
        preferred != EmbeddingSource::None
            && self.embedding.is_some()
            && self.embedding_source == preferred
    }
}

// ============================================================================
// CSV (De)serialization
// ============================================================================

/// On-disk row shape. The embedding travels as a JSON-encoded float array
/// in the `embedding_json` column.
#[derive(Debug, Serialize, Deserialize)]
struct CorpusRow {
    index: usize,
    description: String,
    prompt: String,
    #[serde(default)]
    embedding_json: String,
    #[serde(default)]
    embedding_source: String,
}

impl From<&MotionEntry> for CorpusRow {
    fn from(entry: &MotionEntry) -> Self {
        let embedding_json = entry
            .embedding
            .as_ref()
            .and_then(|v| serde_json::to_string(v).ok())
            .unwrap_or_default();

        Self {
            index: entry.index,
            description: entry.description.clone(),
            prompt: entry.prompt.clone(),
            embedding_json,
            embedding_source: entry.embedding_source.as_str().to_string(),
        }
    }
}

impl From<CorpusRow> for MotionEntry {
    fn from(row: CorpusRow) -> Self {
        // A cell that fails to parse is the same as no cached vector.
        let embedding = if row.embedding_json.trim().is_empty() {
            None
        } else {
            serde_json::from_str::<Vec<f32>>(&row.embedding_json).ok()
        };

        let embedding_source = if embedding.is_some() {
            EmbeddingSource::from(row.embedding_source.as_str())
        } else {
            EmbeddingSource::None
        };

        Self {
            index: row.index,
            description: row.description,
            prompt: row.prompt,
            embedding,
            embedding_source,
        }
    }
}

/// Read all entries from a corpus file. A missing file reads as empty.
pub(crate) fn read_entries(path: &Path) -> anyhow::Result<Vec<MotionEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| anyhow::anyhow!("Failed to open corpus {}: {}", path.display(), e))?;

    let mut entries = Vec::new();
    for result in reader.deserialize::<CorpusRow>() {
        match result {
            Ok(row) => entries.push(MotionEntry::from(row)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping malformed corpus row");
            }
        }
    }

    Ok(entries)
}

/// Rewrite the corpus file in full.
pub(crate) fn write_entries(path: &Path, entries: &[MotionEntry]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| anyhow::anyhow!("Failed to open corpus {} for write: {}", path.display(), e))?;

    for entry in entries {
        writer.serialize(CorpusRow::from(entry))?;
    }
    writer.flush()?;

    Ok(())
}

// ============================================================================
// MotionCorpus
// ============================================================================

/// In-memory motion corpus with file-backed persistence.
pub struct MotionCorpus {
    /// The source that actually produced rows; all writes target it.
    active_path: PathBuf,
    entries: RwLock<Vec<MotionEntry>>,
}

impl MotionCorpus {
    /// Load the corpus, falling back to the secondary source when the
    /// primary yields zero usable rows. The winning source is fixed for
    /// the process lifetime.
    pub fn open(primary: impl AsRef<Path>, fallback: impl AsRef<Path>) -> anyhow::Result<Self> {
        let primary = primary.as_ref().to_path_buf();
        let fallback = fallback.as_ref().to_path_buf();

        let primary_entries = read_entries(&primary)?;
        let usable = primary_entries
            .iter()
            .filter(|e| e.preferred_source() != EmbeddingSource::None)
            .count();

        let (active_path, entries) = if usable > 0 {
            (primary, primary_entries)
        } else {
            let fallback_entries = read_entries(&fallback)?;
            if fallback_entries
                .iter()
                .any(|e| e.preferred_source() != EmbeddingSource::None)
            {
                tracing::info!(
                    fallback = %fallback.display(),
                    "Primary corpus empty, using fallback source"
                );
                (fallback, fallback_entries)
            } else {
                // Both empty; writes still target the primary.
                (primary, Vec::new())
            }
        };

        tracing::info!(
            path = %active_path.display(),
            rows = entries.len(),
            "Motion corpus loaded"
        );

        Ok(Self {
            active_path,
            entries: RwLock::new(entries),
        })
    }

    /// The source file all persistence targets.
    pub fn active_path(&self) -> &Path {
        &self.active_path
    }

    /// Snapshot of all entries.
    pub async fn entries(&self) -> Vec<MotionEntry> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Ensure every entry that can be embedded has a vector computed from
    /// its currently preferred source.
    ///
    /// Stale vectors (source mismatch) are dropped before the batch call,
    /// so a failed batch can never leave a stale vector behind. Rows whose
    /// embedding fails stay vectorless and are excluded from matching.
    /// Returns the number of freshly embedded rows.
    pub async fn ensure_embeddings(
        &self,
        provider: &dyn EmbeddingProvider,
    ) -> anyhow::Result<usize> {
        // Write lock held across the batch call keeps concurrent callers
        // from double-embedding the same rows.
        let mut entries = self.entries.write().await;

        for entry in entries.iter_mut() {
            if entry.embedding.is_some() && !entry.has_valid_embedding() {
                tracing::debug!(index = entry.index, "Dropping stale embedding");
                entry.embedding = None;
                entry.embedding_source = EmbeddingSource::None;
            }
        }

        let pending: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.embedding.is_none() && e.embed_text().is_some())
            .map(|(i, _)| i)
            .collect();

        if pending.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = pending
            .iter()
            .map(|&i| entries[i].embed_text().unwrap_or_default().to_string())
            .collect();

        let vectors = match provider.embed_batch(&texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                tracing::warn!(
                    pending = pending.len(),
                    error = %e,
                    "Embedding batch failed; rows left without vectors"
                );
                return Ok(0);
            }
        };

        for (&i, vector) in pending.iter().zip(vectors) {
            if vector.is_empty() {
                continue;
            }
            entries[i].embedding_source = entries[i].preferred_source();
            entries[i].embedding = Some(vector);
        }

        // Persist before the updated rows become visible to matchers.
        if let Err(e) = write_entries(&self.active_path, &entries) {
            tracing::error!(
                path = %self.active_path.display(),
                error = %e,
                "Failed to persist corpus; continuing with in-memory rows"
            );
        }

        Ok(pending.len())
    }

    /// Rewrite the active source file from the in-memory rows.
    pub async fn save(&self) -> anyhow::Result<()> {
        let entries = self.entries.read().await;
        write_entries(&self.active_path, &entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeEmbedding {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeEmbedding {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeEmbedding {
        fn name(&self) -> &str {
            "fake"
        }

        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("embedding backend down");
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn write_csv(path: &Path, body: &str) {
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn preferred_source_prompt_wins() {
        let entry = MotionEntry {
            index: 0,
            description: "walking".into(),
            prompt: "a person walks forward".into(),
            embedding: None,
            embedding_source: EmbeddingSource::None,
        };
        assert_eq!(entry.preferred_source(), EmbeddingSource::Prompt);
        assert_eq!(entry.embed_text(), Some("a person walks forward"));
    }

    #[test]
    fn cached_vector_with_mismatched_source_is_invalid() {
        let entry = MotionEntry {
            index: 0,
            description: "walking".into(),
            prompt: "a person walks forward".into(),
            embedding: Some(vec![1.0, 0.0]),
            embedding_source: EmbeddingSource::Description,
        };
        assert!(!entry.has_valid_embedding());
    }

    #[test]
    fn corpus_round_trips_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.csv");

        let entries = vec![
            MotionEntry {
                index: 1,
                description: "걷기".into(),
                prompt: "a person walks".into(),
                embedding: Some(vec![0.5, -1.25]),
                embedding_source: EmbeddingSource::Prompt,
            },
            MotionEntry {
                index: 2,
                description: "앉기".into(),
                prompt: String::new(),
                embedding: None,
                embedding_source: EmbeddingSource::None,
            },
        ];

        write_entries(&path, &entries).unwrap();
        let loaded = read_entries(&path).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].index, 1);
        assert_eq!(loaded[0].description, "걷기");
        assert_eq!(loaded[0].embedding, Some(vec![0.5, -1.25]));
        assert_eq!(loaded[0].embedding_source, EmbeddingSource::Prompt);
        assert_eq!(loaded[1].embedding, None);
        assert_eq!(loaded[1].embedding_source, EmbeddingSource::None);
    }

    #[test]
    fn open_falls_back_when_primary_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("primary.csv");
        let fallback = dir.path().join("fallback.csv");

        write_csv(
            &primary,
            "index,description,prompt,embedding_json,embedding_source\n",
        );
        write_csv(
            &fallback,
            "index,description,prompt,embedding_json,embedding_source\n1,wave,,,\n",
        );

        let corpus = MotionCorpus::open(&primary, &fallback).unwrap();
        assert_eq!(corpus.active_path(), fallback.as_path());
    }

    #[test]
    fn open_prefers_primary_with_usable_rows() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("primary.csv");
        let fallback = dir.path().join("fallback.csv");

        write_csv(
            &primary,
            "index,description,prompt,embedding_json,embedding_source\n1,jump,,,\n",
        );
        write_csv(
            &fallback,
            "index,description,prompt,embedding_json,embedding_source\n1,wave,,,\n",
        );

        let corpus = MotionCorpus::open(&primary, &fallback).unwrap();
        assert_eq!(corpus.active_path(), primary.as_path());
    }

    #[tokio::test]
    async fn ensure_embeddings_only_sends_invalid_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.csv");

        let entries = vec![
            MotionEntry {
                index: 1,
                description: "walk".into(),
                prompt: String::new(),
                embedding: Some(vec![1.0, 0.0]),
                embedding_source: EmbeddingSource::Description,
            },
            MotionEntry {
                index: 2,
                description: "sit".into(),
                prompt: String::new(),
                embedding: None,
                embedding_source: EmbeddingSource::None,
            },
        ];
        write_entries(&path, &entries).unwrap();

        let corpus = MotionCorpus::open(&path, dir.path().join("none.csv")).unwrap();
        let provider = FakeEmbedding::new();
        let embedded = corpus.ensure_embeddings(&provider).await.unwrap();

        // Row 1 already carries a valid vector; only row 2 goes to the API.
        assert_eq!(embedded, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let rows = corpus.entries().await;
        assert!(rows.iter().all(|e| e.has_valid_embedding()));
        assert_eq!(rows[0].embedding, Some(vec![1.0, 0.0]));

        // Second pass finds nothing to embed.
        let embedded = corpus.ensure_embeddings(&provider).await.unwrap();
        assert_eq!(embedded, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ensure_embeddings_never_leaves_stale_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.csv");

        // Vector computed from the description, but a prompt now exists,
        // so the preferred source resolved differently.
        let entries = vec![MotionEntry {
            index: 1,
            description: "walk".into(),
            prompt: "a person walks".into(),
            embedding: Some(vec![1.0, 0.0]),
            embedding_source: EmbeddingSource::Description,
        }];
        write_entries(&path, &entries).unwrap();

        let corpus = MotionCorpus::open(&path, dir.path().join("none.csv")).unwrap();
        let provider = FakeEmbedding::failing();
        corpus.ensure_embeddings(&provider).await.unwrap();

        let rows = corpus.entries().await;
        assert_eq!(rows[0].embedding, None);
        assert_eq!(rows[0].embedding_source, EmbeddingSource::None);
    }

    #[tokio::test]
    async fn ensure_embeddings_rewrites_active_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.csv");
        write_csv(
            &path,
            "index,description,prompt,embedding_json,embedding_source\n1,wave,,,\n",
        );

        let corpus = MotionCorpus::open(&path, dir.path().join("none.csv")).unwrap();
        corpus.ensure_embeddings(&FakeEmbedding::new()).await.unwrap();

        let reloaded = read_entries(&path).unwrap();
        assert!(reloaded[0].has_valid_embedding());
        assert_eq!(reloaded[0].embedding_source, EmbeddingSource::Description);
    }
}

//! Pattern persistence adapters

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};

use super::{Result, StoreError};
use crate::pattern::{Pattern, PatternId};

/// Key/value collection of patterns keyed by id
#[async_trait]
pub trait PatternPersistence: Send + Sync {
    async fn load_all(&self) -> Result<Vec<Pattern>>;
    async fn save(&self, pattern: &Pattern) -> Result<()>;
    async fn delete(&self, id: PatternId) -> Result<()>;
}

/// Process-local persistence, used in tests and for throwaway stores
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    patterns: DashMap<PatternId, Pattern>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[async_trait]
impl PatternPersistence for MemoryPersistence {
    async fn load_all(&self) -> Result<Vec<Pattern>> {
        Ok(self.patterns.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn save(&self, pattern: &Pattern) -> Result<()> {
        self.patterns.insert(pattern.id, pattern.clone());
        Ok(())
    }

    async fn delete(&self, id: PatternId) -> Result<()> {
        self.patterns.remove(&id);
        Ok(())
    }
}

/// One pretty-printed JSON document per pattern inside a directory
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: PatternId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn io_error(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Persistence { path: path.to_path_buf(), source }
    }
}

#[async_trait]
impl PatternPersistence for JsonFilePersistence {
    async fn load_all(&self) -> Result<Vec<Pattern>> {
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?;
        let mut patterns = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(|e| Self::io_error(&self.dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Self::io_error(&path, e))?;

            match serde_json::from_str::<Pattern>(&content) {
                Ok(pattern) => patterns.push(pattern),
                Err(e) => {
                    tracing::warn!("Skipping unreadable pattern file {}: {}", path.display(), e);
                }
            }
        }

        tracing::debug!("Loaded {} patterns from {}", patterns.len(), self.dir.display());
        Ok(patterns)
    }

    async fn save(&self, pattern: &Pattern) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?;

        let path = self.path_for(pattern.id);
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        let json = serde_json::to_string_pretty(pattern)?;

        tokio::fs::write(&tmp, json).await.map_err(|e| Self::io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| Self::io_error(&path, e))?;

        Ok(())
    }

    async fn delete(&self, id: PatternId) -> Result<()> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::ActionKind;
    use crate::pattern::fixtures;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_json_files_round_trip() {
        let dir = TempDir::new().unwrap();
        let persistence = JsonFilePersistence::new(dir.path().join("patterns"));

        let pattern = fixtures::pattern(ActionKind::Click, "a.com", "/", "#send");
        persistence.save(&pattern).await.unwrap();

        let loaded = persistence.load_all().await.unwrap();
        assert_eq!(loaded, vec![pattern.clone()]);

        persistence.delete(pattern.id).await.unwrap();
        assert!(persistence.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_dir_loads_empty() {
        let dir = TempDir::new().unwrap();
        let persistence = JsonFilePersistence::new(dir.path().join("nope"));
        assert!(persistence.load_all().await.unwrap().is_empty());
        persistence.delete(uuid::Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_saves_leave_one_document() {
        let dir = TempDir::new().unwrap();
        let persistence = std::sync::Arc::new(JsonFilePersistence::new(dir.path()));
        let pattern = fixtures::pattern(ActionKind::Click, "a.com", "/", "#send");

        let mut handles = Vec::new();
        for i in 0..8 {
            let persistence = persistence.clone();
            let mut copy = pattern.clone();
            copy.name = format!("send v{i}");
            handles.push(tokio::spawn(async move { persistence.save(&copy).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let loaded = persistence.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].name.starts_with("send v"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let persistence = JsonFilePersistence::new(dir.path());
        let pattern = fixtures::pattern(ActionKind::Submit, "a.com", "/", "form");
        persistence.save(&pattern).await.unwrap();

        let loaded = persistence.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, pattern.id);
    }
}

//! Durable collection of learned patterns
//!
//! The store owns the authoritative copy of every pattern. Reads are lock-free
//! snapshots; every mutation is written through the persistence adapter
//! before it becomes visible to later readers. Mutations of one pattern are
//! serialized through its entry in the lock table.

pub mod persistence;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::events::{EventBus, ReplayEvent};
use crate::pattern::{ActionKind, ExecutionRecord, Pattern, PatternDefinition, PatternId};

pub use persistence::{JsonFilePersistence, MemoryPersistence, PatternPersistence};

/// Export document format; imports require the same major version
pub const EXPORT_FORMAT_VERSION: &str = "1.0";

/// Previous versions kept per pattern
pub const VERSION_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Pattern not found: {0}")]
    NotFound(PatternId),

    #[error("Version {version} of pattern {id} is not in its history")]
    VersionNotFound { id: PatternId, version: u32 },

    #[error("Incompatible export format: {found} (current: {current})")]
    IncompatibleVersion { found: String, current: String },

    #[error("Persistence failed for {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// How an import resolves ids that already exist in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    #[default]
    KeepExisting,
    Replace,
    KeepNewest,
    /// Newest record wins, counters keep the larger of both sides
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternExport {
    pub format_version: String,
    pub exported_at: DateTime<Utc>,
    pub patterns: Vec<Pattern>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub added: usize,
    pub replaced: usize,
    pub merged: usize,
    pub skipped: usize,
}

/// Filter over stored patterns; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct PatternQuery {
    pub hostname: Option<String>,
    pub kind: Option<ActionKind>,
    pub path_prefix: Option<String>,
    pub min_confidence: Option<f64>,
}

impl PatternQuery {
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn kind(mut self, kind: ActionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn min_confidence(mut self, confidence: f64) -> Self {
        self.min_confidence = Some(confidence);
        self
    }

    pub fn matches(&self, pattern: &Pattern) -> bool {
        self.hostname.as_ref().is_none_or(|h| pattern.origin.hostname == *h)
            && self.kind.is_none_or(|k| pattern.request_kind == k)
            && self.path_prefix.as_ref().is_none_or(|p| pattern.origin.path.starts_with(p.as_str()))
            && self.min_confidence.is_none_or(|c| pattern.confidence() >= c)
    }
}

/// Exclusive right to mutate one pattern until dropped
pub(crate) struct PatternGuard {
    id: PatternId,
    _lock: OwnedMutexGuard<()>,
}

impl PatternGuard {
    pub(crate) fn id(&self) -> PatternId {
        self.id
    }
}

pub struct PatternStore {
    patterns: DashMap<PatternId, Pattern>,
    versions: DashMap<PatternId, VecDeque<Pattern>>,
    locks: DashMap<PatternId, Arc<Mutex<()>>>,
    persistence: Arc<dyn PatternPersistence>,
    events: EventBus,
}

impl PatternStore {
    pub fn new(persistence: Arc<dyn PatternPersistence>, events: EventBus) -> Self {
        Self {
            patterns: DashMap::new(),
            versions: DashMap::new(),
            locks: DashMap::new(),
            persistence,
            events,
        }
    }

    /// Store backed by memory only, with its own event bus
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPersistence::new()), EventBus::new())
    }

    /// Store populated from everything the persistence adapter holds
    pub async fn open(persistence: Arc<dyn PatternPersistence>, events: EventBus) -> Result<Self> {
        let store = Self::new(persistence, events);

        for mut pattern in store.persistence.load_all().await? {
            pattern.normalize();
            store.patterns.insert(pattern.id, pattern);
        }

        tracing::info!("Opened pattern store with {} patterns", store.patterns.len());
        Ok(store)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Learn a new pattern from a confirmed demonstration
    pub async fn create(&self, definition: PatternDefinition) -> Result<Pattern> {
        let pattern = Pattern::new(definition, Utc::now());
        self.persistence.save(&pattern).await?;
        self.patterns.insert(pattern.id, pattern.clone());

        tracing::info!("Learned pattern {} ({})", pattern.id, pattern.name);
        self.events.publish(ReplayEvent::PatternLearned { pattern_id: pattern.id });

        Ok(pattern)
    }

    pub fn get(&self, id: PatternId) -> Option<Pattern> {
        self.patterns.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: PatternId) -> bool {
        self.patterns.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// All patterns, oldest first
    pub fn list(&self) -> Vec<Pattern> {
        let mut patterns: Vec<_> = self.patterns.iter().map(|e| e.value().clone()).collect();
        sort_by_age(&mut patterns);
        patterns
    }

    pub fn query(&self, query: &PatternQuery) -> Vec<Pattern> {
        let mut patterns: Vec<_> = self
            .patterns
            .iter()
            .filter(|e| query.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        sort_by_age(&mut patterns);
        patterns
    }

    /// Patterns learned on `hostname`, the candidate set for matching
    pub fn for_origin(&self, hostname: &str) -> Vec<Pattern> {
        self.query(&PatternQuery::default().hostname(hostname))
    }

    /// Wait for exclusive access to `id`
    pub(crate) async fn lock(&self, id: PatternId) -> PatternGuard {
        let lock = self.locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        PatternGuard { id, _lock: lock.lock_owned().await }
    }

    /// Like [`lock`](Self::lock), but unknown ids never get a lock table entry
    pub(crate) async fn lock_existing(&self, id: PatternId) -> Result<PatternGuard> {
        if !self.patterns.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(self.lock(id).await)
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub async fn delete(&self, id: PatternId) -> Result<Pattern> {
        let _guard = self.lock_existing(id).await?;
        if !self.patterns.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }

        self.persistence.delete(id).await?;
        let (_, pattern) = self.patterns.remove(&id).ok_or(StoreError::NotFound(id))?;
        self.versions.remove(&id);
        self.locks.remove(&id);

        tracing::info!("Deleted pattern {} ({})", id, pattern.name);
        Ok(pattern)
    }

    /// Edit a pattern, snapshotting the previous state as a new version
    pub async fn update<F>(&self, id: PatternId, edit: F) -> Result<Pattern>
    where
        F: FnOnce(&mut Pattern),
    {
        let _guard = self.lock_existing(id).await?;
        let (previous, updated) = {
            let mut entry = self.patterns.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let previous = entry.clone();

            edit(&mut *entry);
            entry.id = previous.id;
            entry.version = previous.version + 1;
            entry.updated_at = Utc::now();
            entry.normalize();

            (previous, entry.clone())
        };

        if let Err(e) = self.persistence.save(&updated).await {
            self.patterns.insert(id, previous);
            return Err(e);
        }

        let mut history = self.versions.entry(id).or_default();
        history.push_back(previous);
        while history.len() > VERSION_HISTORY_LIMIT {
            history.pop_front();
        }

        tracing::debug!("Pattern {} updated to version {}", id, updated.version());
        Ok(updated)
    }

    /// Earlier versions of a pattern, oldest first
    pub fn history(&self, id: PatternId) -> Vec<Pattern> {
        self.versions.get(&id).map(|h| h.iter().cloned().collect()).unwrap_or_default()
    }

    /// Bring back the content of an earlier version as a new version
    pub async fn restore_version(&self, id: PatternId, version: u32) -> Result<Pattern> {
        let snapshot = self
            .versions
            .get(&id)
            .and_then(|h| h.iter().find(|p| p.version() == version).cloned())
            .ok_or(StoreError::VersionNotFound { id, version })?;

        tracing::info!("Restoring pattern {} to version {}", id, version);
        self.update(id, move |pattern| {
            pattern.name = snapshot.name;
            pattern.payload_shape = snapshot.payload_shape;
            pattern.locator = snapshot.locator;
            pattern.origin = snapshot.origin;
        })
        .await
    }

    /// Apply an execution outcome. Not versioned; execution state is not an edit.
    pub(crate) async fn record_execution(&self, guard: &PatternGuard, record: ExecutionRecord) -> Result<Pattern> {
        self.mutate(guard, |pattern| pattern.record_execution(record)).await
    }

    pub(crate) async fn set_retraining_flags(&self, id: PatternId, flags: u32) -> Result<Pattern> {
        let guard = self.lock_existing(id).await?;
        self.mutate(&guard, |pattern| pattern.retraining_flags = flags).await
    }

    async fn mutate<F>(&self, guard: &PatternGuard, change: F) -> Result<Pattern>
    where
        F: FnOnce(&mut Pattern),
    {
        let id = guard.id();
        let (previous, updated) = {
            let mut entry = self.patterns.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let previous = entry.clone();
            change(&mut *entry);
            (previous, entry.clone())
        };

        if let Err(e) = self.persistence.save(&updated).await {
            self.patterns.insert(id, previous);
            return Err(e);
        }

        Ok(updated)
    }

    pub fn export(&self) -> PatternExport {
        let patterns = self.list();
        tracing::info!("Exporting {} patterns", patterns.len());

        PatternExport {
            format_version: EXPORT_FORMAT_VERSION.to_string(),
            exported_at: Utc::now(),
            patterns,
        }
    }

    pub async fn import(&self, export: PatternExport, strategy: MergeStrategy) -> Result<ImportSummary> {
        validate_format_version(&export.format_version)?;

        let mut summary = ImportSummary::default();

        for mut incoming in export.patterns {
            incoming.normalize();

            let _guard = self.lock(incoming.id).await;
            let existing = self.get(incoming.id);
            let resolved = match existing {
                None => {
                    summary.added += 1;
                    incoming
                }
                Some(existing) => match strategy {
                    MergeStrategy::KeepExisting => {
                        summary.skipped += 1;
                        continue;
                    }
                    MergeStrategy::Replace => {
                        summary.replaced += 1;
                        incoming
                    }
                    MergeStrategy::KeepNewest => {
                        if is_newer(&incoming, &existing) {
                            summary.replaced += 1;
                            incoming
                        } else {
                            summary.skipped += 1;
                            continue;
                        }
                    }
                    MergeStrategy::Merge => {
                        summary.merged += 1;
                        merge_patterns(existing, incoming)
                    }
                },
            };

            self.persistence.save(&resolved).await?;
            self.patterns.insert(resolved.id, resolved);
        }

        tracing::info!(
            "Imported patterns: {} added, {} replaced, {} merged, {} skipped",
            summary.added,
            summary.replaced,
            summary.merged,
            summary.skipped
        );

        Ok(summary)
    }

    /// Export a single pattern as a share that expires after `ttl`.
    ///
    /// The shared copy gets its own id so it never collides with the original.
    pub fn share(&self, id: PatternId, ttl: Duration) -> Result<PatternExport> {
        let mut copy = self.get(id).ok_or(StoreError::NotFound(id))?;
        let now = Utc::now();

        copy.id = Uuid::new_v4();
        copy.share_expires_at = Some(now + ttl);

        tracing::info!("Shared pattern {} as {} until {}", id, copy.id, now + ttl);

        Ok(PatternExport {
            format_version: EXPORT_FORMAT_VERSION.to_string(),
            exported_at: now,
            patterns: vec![copy],
        })
    }

    /// Delete shared copies whose share expired at or before `now`
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<PatternId>> {
        let expired: Vec<PatternId> = self
            .patterns
            .iter()
            .filter(|e| e.share_expires_at.is_some_and(|at| at <= now))
            .map(|e| *e.key())
            .collect();

        for id in &expired {
            self.delete(*id).await?;
        }

        if !expired.is_empty() {
            tracing::info!("Purged {} expired shared patterns", expired.len());
        }

        Ok(expired)
    }
}

fn sort_by_age(patterns: &mut [Pattern]) {
    patterns.sort_by(|a, b| a.origin.learned_at.cmp(&b.origin.learned_at).then(a.id.cmp(&b.id)));
}

fn validate_format_version(found: &str) -> Result<()> {
    let major = |v: &str| v.split('.').next().map(str::to_string);

    if major(found) != major(EXPORT_FORMAT_VERSION) {
        return Err(StoreError::IncompatibleVersion {
            found: found.to_string(),
            current: EXPORT_FORMAT_VERSION.to_string(),
        });
    }

    Ok(())
}

fn is_newer(candidate: &Pattern, than: &Pattern) -> bool {
    (candidate.updated_at, candidate.version()) > (than.updated_at, than.version())
}

fn merge_patterns(existing: Pattern, incoming: Pattern) -> Pattern {
    let usage_count = existing.usage_count().max(incoming.usage_count());
    let success_count = existing.success_count().max(incoming.success_count());

    let mut merged = if is_newer(&incoming, &existing) { incoming } else { existing };
    merged.usage_count = usage_count;
    merged.success_count = success_count;
    merged.normalize();
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::pattern::fixtures;
    use tempfile::TempDir;

    fn click(hostname: &str, path: &str) -> PatternDefinition {
        fixtures::definition(ActionKind::Click, hostname, path, "#send")
    }

    #[tokio::test]
    async fn test_create_emits_learned() {
        let store = PatternStore::in_memory();
        let mut rx = store.events().subscribe();

        let pattern = store.create(click("a.com", "/")).await.unwrap();

        assert_eq!(pattern.confidence(), 1.0);
        assert_eq!(pattern.version(), 1);
        assert_eq!(store.get(pattern.id), Some(pattern.clone()));
        match rx.recv().await.unwrap() {
            ReplayEvent::PatternLearned { pattern_id } => assert_eq!(pattern_id, pattern.id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_query_filters() {
        let store = PatternStore::in_memory();
        store.create(click("a.com", "/chat")).await.unwrap();
        store.create(click("a.com", "/settings")).await.unwrap();
        store
            .create(fixtures::definition(ActionKind::FillText, "a.com", "/chat", "#prompt"))
            .await
            .unwrap();
        store.create(click("b.com", "/chat")).await.unwrap();

        assert_eq!(store.for_origin("a.com").len(), 3);
        assert_eq!(store.query(&PatternQuery::default().kind(ActionKind::Click)).len(), 3);
        assert_eq!(
            store
                .query(&PatternQuery::default().hostname("a.com").path_prefix("/chat"))
                .len(),
            2
        );
        assert!(store.query(&PatternQuery::default().min_confidence(1.5)).is_empty());
    }

    #[tokio::test]
    async fn test_update_versions_and_restore() {
        let store = PatternStore::in_memory();
        let pattern = store.create(click("a.com", "/")).await.unwrap();

        let updated = store
            .update(pattern.id, |p| p.locator.primary = "#send-v2".to_string())
            .await
            .unwrap();
        assert_eq!(updated.version(), 2);
        assert_eq!(store.history(pattern.id).len(), 1);

        let restored = store.restore_version(pattern.id, 1).await.unwrap();
        assert_eq!(restored.version(), 3);
        assert_eq!(restored.locator.primary, "#send");

        let missing = store.restore_version(pattern.id, 9).await;
        assert!(matches!(missing, Err(StoreError::VersionNotFound { version: 9, .. })));
    }

    #[tokio::test]
    async fn test_update_cannot_break_invariants() {
        let store = PatternStore::in_memory();
        let pattern = store.create(click("a.com", "/")).await.unwrap();

        let updated = store
            .update(pattern.id, |p| {
                p.id = Uuid::new_v4();
                p.confidence = 40.0;
            })
            .await
            .unwrap();

        assert_eq!(updated.id, pattern.id);
        assert_eq!(updated.confidence(), crate::pattern::MAX_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = PatternStore::in_memory();
        let pattern = store.create(click("a.com", "/")).await.unwrap();

        store.delete(pattern.id).await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(store.delete(pattern.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let source = PatternStore::in_memory();
        let a = source.create(click("a.com", "/")).await.unwrap();
        let guard = source.lock(a.id).await;
        source.record_execution(&guard, ExecutionRecord::success(fixtures::now(), 5)).await.unwrap();
        drop(guard);
        source.create(click("b.com", "/x")).await.unwrap();

        let json = serde_json::to_string(&source.export()).unwrap();
        let export: PatternExport = serde_json::from_str(&json).unwrap();

        let target = PatternStore::in_memory();
        let summary = target.import(export, MergeStrategy::KeepExisting).await.unwrap();

        assert_eq!(summary.added, 2);
        assert_eq!(target.list(), source.list());
    }

    #[tokio::test]
    async fn test_import_merge_strategies() {
        let store = PatternStore::in_memory();
        let original = store.create(click("a.com", "/")).await.unwrap();

        let mut incoming = original.clone();
        incoming.locator.primary = "#other".to_string();
        incoming.usage_count = 4;
        incoming.success_count = 1;
        incoming.version = 5;
        let export = |p: &Pattern| PatternExport {
            format_version: EXPORT_FORMAT_VERSION.to_string(),
            exported_at: Utc::now(),
            patterns: vec![p.clone()],
        };

        let summary = store.import(export(&incoming), MergeStrategy::KeepExisting).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(store.get(original.id).unwrap().locator.primary, "#send");

        let summary = store.import(export(&incoming), MergeStrategy::KeepNewest).await.unwrap();
        assert_eq!(summary.replaced, 1);
        assert_eq!(store.get(original.id).unwrap().locator.primary, "#other");

        let mut richer = original.clone();
        richer.usage_count = 2;
        richer.success_count = 2;
        let summary = store.import(export(&richer), MergeStrategy::Merge).await.unwrap();
        assert_eq!(summary.merged, 1);

        let merged = store.get(original.id).unwrap();
        assert_eq!(merged.locator.primary, "#other");
        assert_eq!(merged.usage_count(), 4);
        assert_eq!(merged.success_count(), 2);
    }

    #[tokio::test]
    async fn test_import_rejects_other_major_version() {
        let store = PatternStore::in_memory();
        let export = PatternExport {
            format_version: "2.0".to_string(),
            exported_at: Utc::now(),
            patterns: Vec::new(),
        };

        let result = store.import(export, MergeStrategy::Replace).await;
        assert!(matches!(result, Err(StoreError::IncompatibleVersion { .. })));
    }

    #[tokio::test]
    async fn test_share_expires() {
        let sender = PatternStore::in_memory();
        let pattern = sender.create(click("a.com", "/")).await.unwrap();
        let share = sender.share(pattern.id, Duration::hours(1)).unwrap();

        let receiver = PatternStore::in_memory();
        receiver.import(share, MergeStrategy::KeepExisting).await.unwrap();
        assert_eq!(receiver.len(), 1);

        assert!(receiver.purge_expired(Utc::now()).await.unwrap().is_empty());
        let purged = receiver.purge_expired(Utc::now() + Duration::hours(2)).await.unwrap();
        assert_eq!(purged.len(), 1);
        assert!(receiver.is_empty());
    }

    #[tokio::test]
    async fn test_open_reloads_from_disk() {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(JsonFilePersistence::new(dir.path()));

        let id = {
            let store = PatternStore::new(persistence.clone(), EventBus::new());
            let pattern = store.create(click("a.com", "/")).await.unwrap();
            let guard = store.lock(pattern.id).await;
            store
                .record_execution(
                    &guard,
                    ExecutionRecord::failure(fixtures::now(), FailureReason::CapabilityFailure, "gone", 3),
                )
                .await
                .unwrap();
            pattern.id
        };

        let reopened = PatternStore::open(persistence, EventBus::new()).await.unwrap();
        let pattern = reopened.get(id).unwrap();
        assert_eq!(pattern.usage_count(), 1);
        assert!((pattern.confidence() - 0.9).abs() < 1e-9);
    }
}

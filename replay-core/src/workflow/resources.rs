//! Shared-resource access for concurrently running phases

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourcePolicy {
    /// Single owner, others queue
    Exclusive,
    /// Readers share, a writer holds it alone
    SharedRead,
    /// Writers run together; overlapping output keys follow the conflict policy
    SharedWrite,
    /// Serialized access by phases that meet at a declared sync point
    Synchronized,
}

/// How two writers of the same output key under `shared_write` are reconciled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Serialize writers; the later write wins
    #[default]
    Queue,
    Merge,
    Override,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAccess {
    #[default]
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    pub name: String,
    pub policy: ResourcePolicy,
    #[serde(default)]
    pub conflict: ConflictPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUse {
    pub name: String,
    #[serde(default)]
    pub access: ResourceAccess,
}

enum Slot {
    Mutex(Arc<Mutex<()>>),
    RwLock(Arc<RwLock<()>>),
    /// Shared-write resource: writers only lock when the conflict policy is queue
    SharedWrite { queue: Option<Arc<Mutex<()>>> },
}

/// Locks held by one phase; released on drop
pub struct ResourceGuard {
    held: Vec<Box<dyn Any + Send>>,
}

impl ResourceGuard {
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Per-run registry of declared resources
pub struct ResourceManager {
    declarations: HashMap<String, ResourceDeclaration>,
    slots: HashMap<String, Slot>,
}

impl ResourceManager {
    pub fn new(declarations: &[ResourceDeclaration]) -> Self {
        let slots = declarations
            .iter()
            .map(|d| {
                let slot = match d.policy {
                    ResourcePolicy::Exclusive | ResourcePolicy::Synchronized => Slot::Mutex(Arc::new(Mutex::new(()))),
                    ResourcePolicy::SharedRead => Slot::RwLock(Arc::new(RwLock::new(()))),
                    ResourcePolicy::SharedWrite => Slot::SharedWrite {
                        queue: (d.conflict == ConflictPolicy::Queue).then(|| Arc::new(Mutex::new(()))),
                    },
                };
                (d.name.clone(), slot)
            })
            .collect();

        Self {
            declarations: declarations.iter().map(|d| (d.name.clone(), d.clone())).collect(),
            slots,
        }
    }

    pub fn policy(&self, name: &str) -> Option<ResourcePolicy> {
        self.declarations.get(name).map(|d| d.policy)
    }

    /// Acquire every resource a phase uses, in name order so two phases can never deadlock
    pub async fn acquire(&self, uses: &[ResourceUse]) -> ResourceGuard {
        let mut ordered: Vec<&ResourceUse> = uses.iter().collect();
        // Writes sort first so dedup keeps the stronger access
        ordered.sort_by(|a, b| a.name.cmp(&b.name).then(b.access.cmp(&a.access)));
        ordered.dedup_by(|a, b| a.name == b.name);

        let mut held: Vec<Box<dyn Any + Send>> = Vec::new();
        for resource in ordered {
            let Some(slot) = self.slots.get(&resource.name) else {
                continue;
            };
            match (slot, resource.access) {
                (Slot::Mutex(lock), _) => held.push(Box::new(Arc::clone(lock).lock_owned().await)),
                (Slot::RwLock(lock), ResourceAccess::Read) => held.push(Box::new(Arc::clone(lock).read_owned().await)),
                (Slot::RwLock(lock), ResourceAccess::Write) => held.push(Box::new(Arc::clone(lock).write_owned().await)),
                (Slot::SharedWrite { queue: Some(lock) }, ResourceAccess::Write) => {
                    held.push(Box::new(Arc::clone(lock).lock_owned().await))
                }
                (Slot::SharedWrite { .. }, _) => {}
            }
        }

        ResourceGuard { held }
    }

    /// Conflict policy between two phases that both write a shared-write resource
    pub fn write_conflict(&self, a: &[ResourceUse], b: &[ResourceUse]) -> Option<ConflictPolicy> {
        a.iter()
            .filter(|u| u.access == ResourceAccess::Write)
            .filter(|u| b.iter().any(|o| o.name == u.name && o.access == ResourceAccess::Write))
            .filter_map(|u| self.declarations.get(&u.name))
            .find(|d| d.policy == ResourcePolicy::SharedWrite)
            .map(|d| d.conflict)
    }
}

/// Reconcile a write to `key` that overlaps an earlier concurrent write
pub fn resolve_conflict(
    policy: ConflictPolicy,
    key: &str,
    existing: &Value,
    incoming: Value,
) -> Result<Value, String> {
    match policy {
        ConflictPolicy::Queue | ConflictPolicy::Override => Ok(incoming),
        ConflictPolicy::Merge => Ok(merge_values(existing, incoming)),
        ConflictPolicy::Error => Err(format!("conflicting concurrent writes to {key}")),
    }
}

/// Objects merge key by key, arrays concatenate, anything else takes the newer value
pub fn merge_values(existing: &Value, incoming: Value) -> Value {
    match (existing, incoming) {
        (Value::Object(base), Value::Object(update)) => {
            let mut merged = base.clone();
            for (k, v) in update {
                let value = match merged.get(&k) {
                    Some(current) => merge_values(current, v),
                    None => v,
                };
                merged.insert(k, value);
            }
            Value::Object(merged)
        }
        (Value::Array(base), Value::Array(update)) => {
            let mut merged = base.clone();
            merged.extend(update);
            Value::Array(merged)
        }
        (_, incoming) => incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn declare(name: &str, policy: ResourcePolicy, conflict: ConflictPolicy) -> ResourceDeclaration {
        ResourceDeclaration { name: name.to_string(), policy, conflict }
    }

    fn uses(name: &str, access: ResourceAccess) -> Vec<ResourceUse> {
        vec![ResourceUse { name: name.to_string(), access }]
    }

    #[tokio::test]
    async fn test_exclusive_queues_second_owner() {
        let manager = ResourceManager::new(&[declare("output", ResourcePolicy::Exclusive, ConflictPolicy::Queue)]);
        let first = manager.acquire(&uses("output", ResourceAccess::Read)).await;
        assert_eq!(first.len(), 1);

        let waiting = tokio::time::timeout(Duration::from_millis(20), manager.acquire(&uses("output", ResourceAccess::Read))).await;
        assert!(waiting.is_err());

        drop(first);
        let second = tokio::time::timeout(Duration::from_millis(200), manager.acquire(&uses("output", ResourceAccess::Read))).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_shared_read_allows_readers_blocks_writer() {
        let manager = ResourceManager::new(&[declare("store", ResourcePolicy::SharedRead, ConflictPolicy::Queue)]);
        let _a = manager.acquire(&uses("store", ResourceAccess::Read)).await;
        let b = tokio::time::timeout(Duration::from_millis(200), manager.acquire(&uses("store", ResourceAccess::Read))).await;
        assert!(b.is_ok());

        let writer = tokio::time::timeout(Duration::from_millis(20), manager.acquire(&uses("store", ResourceAccess::Write))).await;
        assert!(writer.is_err());
    }

    #[tokio::test]
    async fn test_shared_write_without_queue_never_blocks() {
        let manager = ResourceManager::new(&[declare("log", ResourcePolicy::SharedWrite, ConflictPolicy::Merge)]);
        let a = manager.acquire(&uses("log", ResourceAccess::Write)).await;
        let b = manager.acquire(&uses("log", ResourceAccess::Write)).await;
        assert!(a.is_empty() && b.is_empty());

        let policy = manager.write_conflict(&uses("log", ResourceAccess::Write), &uses("log", ResourceAccess::Write));
        assert_eq!(policy, Some(ConflictPolicy::Merge));
        assert_eq!(manager.write_conflict(&uses("log", ResourceAccess::Write), &uses("log", ResourceAccess::Read)), None);
    }

    #[test]
    fn test_conflict_resolution() {
        let merged = resolve_conflict(
            ConflictPolicy::Merge,
            "k",
            &json!({"a": 1, "list": [1]}),
            json!({"b": 2, "list": [2]}),
        )
        .unwrap();
        assert_eq!(merged, json!({"a": 1, "b": 2, "list": [1, 2]}));

        assert_eq!(resolve_conflict(ConflictPolicy::Override, "k", &json!(1), json!(2)), Ok(json!(2)));
        assert!(resolve_conflict(ConflictPolicy::Error, "k", &json!(1), json!(2)).is_err());
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{hash_map, BTreeSet, HashMap};
use std::time::Duration;
use taskmesh_core::{TaskmeshError, TaskmeshResult};

/// One write inside an all-or-nothing [`KvStore::batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Store a string value that never expires.
    Set {
        /// Key to write.
        key: String,
        /// New value.
        value: String,
    },
    /// Remove a key of any kind.
    Delete(String),
    /// Insert or re-score a member of a sorted log.
    ZAdd {
        /// Sorted log key.
        key: String,
        /// Sort score.
        score: f64,
        /// Serialized member.
        member: String,
    },
    /// Add a member to a set.
    SAdd {
        /// Set key.
        key: String,
        /// Member to add.
        member: String,
    },
    /// Remove a member from a set. The set is dropped once empty.
    SRem {
        /// Set key.
        key: String,
        /// Member to remove.
        member: String,
    },
    /// Delete `{prefix}{member}` for every member of the `index` set, then
    /// the index itself. The members are read in the same atomic step as
    /// the deletes.
    DeleteIndexed {
        /// Set naming the keys to delete.
        index: String,
        /// Prepended to each member to form the key.
        prefix: String,
    },
}

/// Key-value store with expiry, sorted logs and sets.
///
/// This is the storage contract the agent state/memory layer is written
/// against. Implementations must be safe under concurrent access per key and
/// must apply [`KvStore::batch`] atomically.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store a string value, replacing any previous value. `None` or a zero
    /// TTL means the key never expires.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> TaskmeshResult<()>;

    /// Fetch a string value. Expired keys read as absent.
    async fn get(&self, key: &str) -> TaskmeshResult<Option<String>>;

    /// Delete a key of any kind. Returns whether it existed.
    async fn delete(&self, key: &str) -> TaskmeshResult<bool>;

    /// Insert a member into a sorted log, or update its score.
    async fn zadd(&self, key: &str, score: f64, member: String) -> TaskmeshResult<()>;

    /// Up to `limit` members ordered by score, highest first when `reverse`.
    async fn zrange(&self, key: &str, limit: usize, reverse: bool) -> TaskmeshResult<Vec<String>>;

    /// Add a member to a set.
    async fn sadd(&self, key: &str, member: String) -> TaskmeshResult<()>;

    /// All members of a set, in lexical order.
    async fn smembers(&self, key: &str) -> TaskmeshResult<Vec<String>>;

    /// Apply every operation or none of them.
    async fn batch(&self, ops: Vec<BatchOp>) -> TaskmeshResult<()>;

    /// Cheap reachability check.
    async fn ping(&self) -> TaskmeshResult<()>;
}

/// A scored member of a sorted log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Scored {
    pub score: f64,
    pub member: String,
}

/// The value kinds a key can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub(crate) enum Value {
    Str(String),
    Sorted(Vec<Scored>),
    Set(BTreeSet<String>),
}

/// A stored value plus its absolute expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Entry {
    pub value: Value,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub(crate) type Snapshot = HashMap<String, Entry>;

fn wrong_type(key: &str, expected: &str) -> TaskmeshError {
    TaskmeshError::StateStore(format!("key '{key}' does not hold a {expected}"))
}

/// In-memory [`KvStore`]. Expiry is checked lazily on access.
pub struct InMemoryKvStore {
    entries: Mutex<Snapshot>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        let now = Utc::now();
        let live = snapshot
            .into_iter()
            .filter(|(_, e)| !e.is_expired(now))
            .collect();
        Self {
            entries: Mutex::new(live),
        }
    }

    pub(crate) fn into_snapshot(self) -> Snapshot {
        self.entries.into_inner()
    }

    /// Swap in new contents wholesale.
    pub(crate) fn replace(&self, snapshot: Snapshot) {
        *self.entries.lock() = snapshot;
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.is_expired(now));
        entries.clone()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply(entries: &mut Snapshot, op: BatchOp, now: DateTime<Utc>) -> TaskmeshResult<()> {
        match op {
            BatchOp::Set { key, value } => {
                entries.insert(
                    key,
                    Entry {
                        value: Value::Str(value),
                        expires_at: None,
                    },
                );
            }
            BatchOp::Delete(key) => {
                entries.remove(&key);
            }
            BatchOp::ZAdd { key, score, member } => {
                let entry = live_entry(entries, &key, now, || Value::Sorted(Vec::new()));
                let Value::Sorted(items) = &mut entry.value else {
                    return Err(wrong_type(&key, "sorted log"));
                };
                items.retain(|s| s.member != member);
                let pos = items
                    .iter()
                    .position(|s| s.score > score)
                    .unwrap_or(items.len());
                items.insert(pos, Scored { score, member });
            }
            BatchOp::SAdd { key, member } => {
                let entry = live_entry(entries, &key, now, || Value::Set(BTreeSet::new()));
                let Value::Set(members) = &mut entry.value else {
                    return Err(wrong_type(&key, "set"));
                };
                members.insert(member);
            }
            BatchOp::SRem { key, member } => {
                let Some(entry) = entries.get_mut(&key) else {
                    return Ok(());
                };
                let Value::Set(members) = &mut entry.value else {
                    return Err(wrong_type(&key, "set"));
                };
                members.remove(&member);
                let emptied = members.is_empty();
                if emptied {
                    entries.remove(&key);
                }
            }
            BatchOp::DeleteIndexed { index, prefix } => {
                let members = match entries.get(&index) {
                    None => BTreeSet::new(),
                    Some(e) if e.is_expired(now) => BTreeSet::new(),
                    Some(Entry {
                        value: Value::Set(members),
                        ..
                    }) => members.clone(),
                    Some(_) => return Err(wrong_type(&index, "set")),
                };
                for member in members {
                    entries.remove(&format!("{prefix}{member}"));
                }
                entries.remove(&index);
            }
        }
        Ok(())
    }
}

/// Keys `op` may write when applied to `entries` as they are now.
fn touched_keys(entries: &Snapshot, op: &BatchOp) -> Vec<String> {
    match op {
        BatchOp::Set { key, .. }
        | BatchOp::Delete(key)
        | BatchOp::ZAdd { key, .. }
        | BatchOp::SAdd { key, .. }
        | BatchOp::SRem { key, .. } => vec![key.clone()],
        BatchOp::DeleteIndexed { index, prefix } => {
            let mut keys = vec![index.clone()];
            if let Some(Entry {
                value: Value::Set(members),
                ..
            }) = entries.get(index)
            {
                keys.extend(members.iter().map(|m| format!("{prefix}{m}")));
            }
            keys
        }
    }
}

/// Returns the live entry for `key`, creating it with `init` when missing or
/// expired.
fn live_entry<'a>(
    entries: &'a mut Snapshot,
    key: &str,
    now: DateTime<Utc>,
    init: impl FnOnce() -> Value,
) -> &'a mut Entry {
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
    entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: init(),
        expires_at: None,
    })
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> TaskmeshResult<()> {
        let expires_at = match ttl.filter(|t| !t.is_zero()) {
            Some(ttl) => {
                let ttl = chrono::Duration::from_std(ttl)
                    .map_err(|e| TaskmeshError::StateStore(format!("invalid TTL: {e}")))?;
                Some(Utc::now() + ttl)
            }
            None => None,
        };
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> TaskmeshResult<Option<String>> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            return Ok(None);
        }
        match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key, "string")),
        }
    }

    async fn delete(&self, key: &str) -> TaskmeshResult<bool> {
        let now = Utc::now();
        let removed = self.entries.lock().remove(key);
        Ok(removed.is_some_and(|e| !e.is_expired(now)))
    }

    async fn zadd(&self, key: &str, score: f64, member: String) -> TaskmeshResult<()> {
        self.batch(vec![BatchOp::ZAdd {
            key: key.to_string(),
            score,
            member,
        }])
        .await
    }

    async fn zrange(&self, key: &str, limit: usize, reverse: bool) -> TaskmeshResult<Vec<String>> {
        let now = Utc::now();
        let entries = self.entries.lock();
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(e) if e.is_expired(now) => Ok(Vec::new()),
            Some(Entry {
                value: Value::Sorted(items),
                ..
            }) => {
                let members: Vec<String> = if reverse {
                    items.iter().rev().take(limit).map(|s| s.member.clone()).collect()
                } else {
                    items.iter().take(limit).map(|s| s.member.clone()).collect()
                };
                Ok(members)
            }
            Some(_) => Err(wrong_type(key, "sorted log")),
        }
    }

    async fn sadd(&self, key: &str, member: String) -> TaskmeshResult<()> {
        self.batch(vec![BatchOp::SAdd {
            key: key.to_string(),
            member,
        }])
        .await
    }

    async fn smembers(&self, key: &str) -> TaskmeshResult<Vec<String>> {
        let now = Utc::now();
        let entries = self.entries.lock();
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(e) if e.is_expired(now) => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key, "set")),
        }
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> TaskmeshResult<()> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let mut backup: HashMap<String, Option<Entry>> = HashMap::new();
        for op in ops {
            for key in touched_keys(&entries, &op) {
                if let hash_map::Entry::Vacant(slot) = backup.entry(key) {
                    let previous = entries.get(slot.key()).cloned();
                    slot.insert(previous);
                }
            }
            if let Err(e) = Self::apply(&mut entries, op, now) {
                for (key, previous) in backup {
                    match previous {
                        Some(entry) => entries.insert(key, entry),
                        None => entries.remove(&key),
                    };
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn ping(&self) -> TaskmeshResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryKvStore::new();
        store.set("k", "v".into(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.delete("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = InMemoryKvStore::new();
        store
            .set("short", "v".into(), Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(store.get("short").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get("short").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let store = InMemoryKvStore::new();
        store
            .set("k", "v".into(), Some(Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sorted_log_ordering() {
        let store = InMemoryKvStore::new();
        store.zadd("log", 2.0, "b".into()).await.unwrap();
        store.zadd("log", 1.0, "a".into()).await.unwrap();
        store.zadd("log", 3.0, "c".into()).await.unwrap();

        assert_eq!(store.zrange("log", 10, false).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.zrange("log", 2, true).await.unwrap(), vec!["c", "b"]);
        assert!(store.zrange("missing", 5, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zadd_rescores_existing_member() {
        let store = InMemoryKvStore::new();
        store.zadd("log", 1.0, "a".into()).await.unwrap();
        store.zadd("log", 2.0, "b".into()).await.unwrap();
        store.zadd("log", 3.0, "a".into()).await.unwrap();
        assert_eq!(store.zrange("log", 10, false).await.unwrap(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_sets() {
        let store = InMemoryKvStore::new();
        store.sadd("types", "obs".into()).await.unwrap();
        store.sadd("types", "msg".into()).await.unwrap();
        store.sadd("types", "obs".into()).await.unwrap();
        assert_eq!(store.smembers("types").await.unwrap(), vec!["msg", "obs"]);
    }

    #[tokio::test]
    async fn test_wrong_type_is_rejected() {
        let store = InMemoryKvStore::new();
        store.set("k", "v".into(), None).await.unwrap();
        assert!(store.zadd("k", 1.0, "m".into()).await.is_err());
        assert!(store.smembers("k").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_batch_applies_nothing() {
        let store = InMemoryKvStore::new();
        store.set("str", "v".into(), None).await.unwrap();
        store.zadd("log", 1.0, "a".into()).await.unwrap();

        let result = store
            .batch(vec![
                BatchOp::Delete("log".into()),
                BatchOp::SAdd {
                    key: "str".into(),
                    member: "x".into(),
                },
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(store.zrange("log", 10, false).await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_batch_delete_many() {
        let store = InMemoryKvStore::new();
        store.zadd("a", 1.0, "x".into()).await.unwrap();
        store.sadd("b", "y".into()).await.unwrap();
        store
            .batch(vec![BatchOp::Delete("a".into()), BatchOp::Delete("b".into())])
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_srem_drops_empty_set() {
        let store = InMemoryKvStore::new();
        store.sadd("s", "a".into()).await.unwrap();
        store.sadd("s", "b".into()).await.unwrap();
        let srem = |m: &str| BatchOp::SRem {
            key: "s".into(),
            member: m.into(),
        };
        store.batch(vec![srem("a"), srem("missing")]).await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap(), vec!["b"]);
        store.batch(vec![srem("b")]).await.unwrap();
        assert!(store.is_empty());
        store.batch(vec![srem("b")]).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_indexed_removes_members_and_index() {
        let store = InMemoryKvStore::new();
        for t in ["obs", "msg"] {
            store.zadd(&format!("log:{t}"), 1.0, "x".into()).await.unwrap();
            store.sadd("log:types", t.into()).await.unwrap();
        }
        store.set("other", "kept".into(), None).await.unwrap();

        store
            .batch(vec![BatchOp::DeleteIndexed {
                index: "log:types".into(),
                prefix: "log:".into(),
            }])
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("other").await.unwrap().as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn test_failed_batch_restores_indexed_deletes() {
        let store = InMemoryKvStore::new();
        store.zadd("log:obs", 1.0, "x".into()).await.unwrap();
        store.sadd("log:types", "obs".into()).await.unwrap();
        store.set("str", "v".into(), None).await.unwrap();

        let result = store
            .batch(vec![
                BatchOp::DeleteIndexed {
                    index: "log:types".into(),
                    prefix: "log:".into(),
                },
                BatchOp::ZAdd {
                    key: "str".into(),
                    score: 1.0,
                    member: "m".into(),
                },
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(store.zrange("log:obs", 10, false).await.unwrap(), vec!["x"]);
        assert_eq!(store.smembers("log:types").await.unwrap(), vec!["obs"]);
    }
}

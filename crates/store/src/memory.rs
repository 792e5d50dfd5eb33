//! In-process store with the same batch semantics as Redis MULTI/EXEC.
//! Batches are staged on an overlay and committed only when every operation
//! succeeds. Supports fault injection for exercising partial-failure paths.

use crate::batch::{AtomicStore, StoreOp, StoreValue};
use async_trait::async_trait;
use parking_lot::Mutex;
use pivot_core::error::{StoreError, StoreResult};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone)]
enum Entry {
    Text(String),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Default)]
struct FaultPlan {
    fail_next: usize,
    fail_after: Option<usize>,
}

impl FaultPlan {
    fn should_fail(&mut self) -> bool {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return true;
        }
        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                true
            }
            Some(ref mut remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        }
    }
}

/// Mutex-guarded map of keys to strings, sets and hashes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    faults: Mutex<FaultPlan>,
    batches: AtomicU64,
}

type Overlay = HashMap<String, Option<Entry>>;

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` batches without applying anything.
    pub fn fail_next(&self, n: usize) {
        self.faults.lock().fail_next = n;
    }

    /// Let `n` batches succeed, then fail the one after.
    pub fn fail_after(&self, n: usize) {
        self.faults.lock().fail_after = Some(n);
    }

    /// Number of batches that reached the store, including failed ones.
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Snapshot of a hash, empty when the key is missing or not a hash.
    pub fn hash(&self, key: &str) -> HashMap<String, String> {
        match self.data.lock().get(key) {
            Some(Entry::Hash(hash)) => hash.clone(),
            _ => HashMap::new(),
        }
    }

    /// Snapshot of a set, sorted.
    pub fn members(&self, key: &str) -> Vec<String> {
        let mut members: Vec<String> = match self.data.lock().get(key) {
            Some(Entry::Set(set)) => set.iter().cloned().collect(),
            _ => Vec::new(),
        };
        members.sort();
        members
    }

    pub fn text(&self, key: &str) -> Option<String> {
        match self.data.lock().get(key) {
            Some(Entry::Text(text)) => Some(text.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    fn apply_batch(&self, ops: &[StoreOp]) -> StoreResult<Vec<StoreValue>> {
        let seq = self.batches.fetch_add(1, Ordering::Relaxed);
        if self.faults.lock().should_fail() {
            return Err(StoreError::Injected(format!("batch {seq}")));
        }

        let mut data = self.data.lock();
        let mut staged = Overlay::new();
        let mut rng = rand::thread_rng();

        let replies = ops
            .iter()
            .map(|op| apply_op(&mut staged, &data, op, &mut rng))
            .collect::<StoreResult<Vec<_>>>()?;

        for (key, entry) in staged {
            match entry {
                Some(Entry::Set(set)) if set.is_empty() => {
                    data.remove(&key);
                }
                Some(Entry::Hash(hash)) if hash.is_empty() => {
                    data.remove(&key);
                }
                Some(entry) => {
                    data.insert(key, entry);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        debug!(seq = seq, ops = ops.len(), "Memory batch committed");
        Ok(replies)
    }
}

fn slot<'a>(staged: &'a mut Overlay, data: &HashMap<String, Entry>, key: &str) -> &'a mut Option<Entry> {
    staged
        .entry(key.to_string())
        .or_insert_with(|| data.get(key).cloned())
}

fn wrong_type(key: &str, expected: &'static str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
    }
}

fn set_mut<'a>(
    staged: &'a mut Overlay,
    data: &HashMap<String, Entry>,
    key: &str,
) -> StoreResult<&'a mut HashSet<String>> {
    let entry = slot(staged, data, key);
    if entry.is_none() {
        *entry = Some(Entry::Set(HashSet::new()));
    }
    match entry {
        Some(Entry::Set(set)) => Ok(set),
        _ => Err(wrong_type(key, "set")),
    }
}

fn hash_mut<'a>(
    staged: &'a mut Overlay,
    data: &HashMap<String, Entry>,
    key: &str,
) -> StoreResult<&'a mut HashMap<String, String>> {
    let entry = slot(staged, data, key);
    if entry.is_none() {
        *entry = Some(Entry::Hash(HashMap::new()));
    }
    match entry {
        Some(Entry::Hash(hash)) => Ok(hash),
        _ => Err(wrong_type(key, "hash")),
    }
}

fn read_hash(staged: &mut Overlay, data: &HashMap<String, Entry>, key: &str) -> StoreResult<HashMap<String, String>> {
    match slot(staged, data, key) {
        None => Ok(HashMap::new()),
        Some(Entry::Hash(hash)) => Ok(hash.clone()),
        Some(_) => Err(wrong_type(key, "hash")),
    }
}

fn incr_field(hash: &mut HashMap<String, String>, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
    let current = match hash.get(field) {
        Some(raw) => raw.parse::<i64>().map_err(|_| {
            StoreError::Backend(format!("{key}[{field}] is not an integer"))
        })?,
        None => 0,
    };
    let next = current
        .checked_add(delta)
        .ok_or_else(|| StoreError::Backend(format!("{key}[{field}] increment overflows")))?;
    hash.insert(field.to_string(), next.to_string());
    Ok(next)
}

fn apply_op(
    staged: &mut Overlay,
    data: &HashMap<String, Entry>,
    op: &StoreOp,
    rng: &mut impl Rng,
) -> StoreResult<StoreValue> {
    match op {
        StoreOp::SetAdd { key, members } => {
            let set = set_mut(staged, data, key)?;
            let added = members
                .iter()
                .filter(|m| set.insert((*m).clone()))
                .count();
            Ok(StoreValue::Int(added as i64))
        }
        StoreOp::SetPop { key } => {
            let popped = match slot(staged, data, key) {
                None => None,
                Some(Entry::Set(set)) if set.is_empty() => None,
                Some(Entry::Set(set)) => {
                    let idx = rng.gen_range(0..set.len());
                    let member = set.iter().nth(idx).cloned();
                    if let Some(member) = &member {
                        set.remove(member);
                    }
                    member
                }
                Some(_) => return Err(wrong_type(key, "set")),
            };
            Ok(StoreValue::Text(popped))
        }
        StoreOp::SetMembers { key } => match slot(staged, data, key) {
            None => Ok(StoreValue::Members(Vec::new())),
            Some(Entry::Set(set)) => Ok(StoreValue::Members(set.iter().cloned().collect())),
            Some(_) => Err(wrong_type(key, "set")),
        },
        StoreOp::HashSet { key, field, value } => {
            hash_mut(staged, data, key)?.insert(field.clone(), value.clone());
            Ok(StoreValue::Done)
        }
        StoreOp::HashSetIfAbsent { key, field, value } => {
            let hash = hash_mut(staged, data, key)?;
            if hash.contains_key(field) {
                return Ok(StoreValue::Flag(false));
            }
            hash.insert(field.clone(), value.clone());
            Ok(StoreValue::Flag(true))
        }
        StoreOp::HashGet { key, field } => {
            let hash = read_hash(staged, data, key)?;
            Ok(StoreValue::Text(hash.get(field).cloned()))
        }
        StoreOp::HashGetAll { key } => Ok(StoreValue::Hash(read_hash(staged, data, key)?)),
        StoreOp::HashIncrBy { key, field, delta } => {
            let hash = hash_mut(staged, data, key)?;
            Ok(StoreValue::Int(incr_field(hash, key, field, *delta)?))
        }
        StoreOp::HashIncrMean {
            counts_key,
            values_key,
            field,
            sample,
        } => {
            let count = incr_field(hash_mut(staged, data, counts_key)?, counts_key, field, 1)?;
            let values = hash_mut(staged, data, values_key)?;
            let old = match values.get(field) {
                Some(raw) => raw.parse::<f64>().map_err(|_| {
                    StoreError::Backend(format!("{values_key}[{field}] is not a float"))
                })?,
                None => 0.0,
            };
            let n = count as f64;
            let value = ((n - 1.0) / n) * old + (1.0 / n) * sample;
            values.insert(field.clone(), value.to_string());
            Ok(StoreValue::Mean { count, value })
        }
        StoreOp::Get { key } => match slot(staged, data, key) {
            None => Ok(StoreValue::Text(None)),
            Some(Entry::Text(text)) => Ok(StoreValue::Text(Some(text.clone()))),
            Some(_) => Err(wrong_type(key, "string")),
        },
        StoreOp::Set { key, value } => {
            *slot(staged, data, key) = Some(Entry::Text(value.clone()));
            Ok(StoreValue::Done)
        }
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn execute_batch(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<StoreValue>> {
        metrics::counter!("pivot.store.batch").increment(1);
        let result = self.apply_batch(&ops);
        if result.is_err() {
            metrics::counter!("pivot.store.batch.error").increment(1);
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::batch::Batch;

    #[tokio::test]
    async fn test_set_pop_drains_each_member_once() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.set_add("untested", vec!["0".into(), "1".into(), "2".into()]);
        store.execute(batch).await.unwrap();

        let mut popped = Vec::new();
        for _ in 0..4 {
            let mut batch = Batch::new();
            batch.set_pop("untested");
            if let Some(member) = store.execute(batch).await.unwrap().next_text().unwrap() {
                popped.push(member);
            }
        }
        popped.sort();
        assert_eq!(popped, vec!["0", "1", "2"]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_hash_set_if_absent_is_first_writer_wins() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch
            .hash_set_if_absent("counts", "0", "0")
            .hash_incr_by("counts", "0", 4)
            .hash_set_if_absent("counts", "0", "0");
        let mut replies = store.execute(batch).await.unwrap();
        assert!(replies.next_value().unwrap().into_flag().unwrap());
        assert_eq!(replies.next_int().unwrap(), 4);
        assert!(!replies.next_value().unwrap().into_flag().unwrap());
        assert_eq!(store.hash("counts").get("0").map(String::as_str), Some("4"));
    }

    #[tokio::test]
    async fn test_failed_op_rolls_back_whole_batch() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.set("arms", "[1,2]");
        store.execute(batch).await.unwrap();

        let mut batch = Batch::new();
        batch
            .hash_set("config", "wip", "0")
            .hash_incr_by("arms", "0", 1);
        let err = store.execute(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType { expected: "hash", .. }));
        assert!(store.hash("config").is_empty());
        assert_eq!(store.text("arms").as_deref(), Some("[1,2]"));
    }

    #[tokio::test]
    async fn test_incr_mean_folds_sample() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch
            .hash_set("counts", "1", "1")
            .hash_set("values", "1", "0.5")
            .hash_incr_mean("counts", "values", "1", 1.0);
        let mut replies = store.execute(batch).await.unwrap();
        replies.skip().unwrap();
        replies.skip().unwrap();
        let (count, value) = replies.next_mean().unwrap();
        assert_eq!(count, 2);
        assert!((value - 0.75).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        store.fail_after(1);

        let mut ok = Batch::new();
        ok.set("a", "1");
        store.execute(ok).await.unwrap();

        let mut failing = Batch::new();
        failing.set("b", "2");
        assert!(matches!(
            store.execute(failing).await,
            Err(StoreError::Injected(_))
        ));

        let mut after = Batch::new();
        after.set("c", "3");
        store.execute(after).await.unwrap();

        assert_eq!(store.text("b"), None);
        assert_eq!(store.batch_count(), 3);
    }
}

//! Batch operations and their typed replies.

use async_trait::async_trait;
use pivot_core::error::{StoreError, StoreResult};
use std::collections::HashMap;

/// A single primitive executed inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    SetAdd { key: String, members: Vec<String> },
    /// Remove and return an arbitrary member.
    SetPop { key: String },
    SetMembers { key: String },
    HashSet { key: String, field: String, value: String },
    HashSetIfAbsent { key: String, field: String, value: String },
    HashGet { key: String, field: String },
    HashGetAll { key: String },
    HashIncrBy { key: String, field: String, delta: i64 },
    /// Increment `counts_key[field]` by one and fold `sample` into the running
    /// mean at `values_key[field]` as a single server-side step.
    HashIncrMean {
        counts_key: String,
        values_key: String,
        field: String,
        sample: f64,
    },
    Get { key: String },
    Set { key: String, value: String },
}

impl StoreOp {
    pub fn name(&self) -> &'static str {
        match self {
            StoreOp::SetAdd { .. } => "SADD",
            StoreOp::SetPop { .. } => "SPOP",
            StoreOp::SetMembers { .. } => "SMEMBERS",
            StoreOp::HashSet { .. } => "HSET",
            StoreOp::HashSetIfAbsent { .. } => "HSETNX",
            StoreOp::HashGet { .. } => "HGET",
            StoreOp::HashGetAll { .. } => "HGETALL",
            StoreOp::HashIncrBy { .. } => "HINCRBY",
            StoreOp::HashIncrMean { .. } => "INCRMEAN",
            StoreOp::Get { .. } => "GET",
            StoreOp::Set { .. } => "SET",
        }
    }
}

/// Reply to one [`StoreOp`], in the same position as the op in its batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Done,
    Int(i64),
    Flag(bool),
    Text(Option<String>),
    Members(Vec<String>),
    Hash(HashMap<String, String>),
    Mean { count: i64, value: f64 },
}

impl StoreValue {
    fn kind(&self) -> &'static str {
        match self {
            StoreValue::Done => "done",
            StoreValue::Int(_) => "integer",
            StoreValue::Flag(_) => "flag",
            StoreValue::Text(_) => "text",
            StoreValue::Members(_) => "members",
            StoreValue::Hash(_) => "hash",
            StoreValue::Mean { .. } => "mean",
        }
    }

    fn mismatch(self, wanted: &'static str) -> StoreError {
        StoreError::UnexpectedReply {
            op: wanted,
            detail: format!("got {} reply", self.kind()),
        }
    }

    pub fn into_int(self) -> StoreResult<i64> {
        match self {
            StoreValue::Int(n) => Ok(n),
            other => Err(other.mismatch("integer")),
        }
    }

    pub fn into_flag(self) -> StoreResult<bool> {
        match self {
            StoreValue::Flag(flag) => Ok(flag),
            other => Err(other.mismatch("flag")),
        }
    }

    pub fn into_text(self) -> StoreResult<Option<String>> {
        match self {
            StoreValue::Text(text) => Ok(text),
            other => Err(other.mismatch("text")),
        }
    }

    pub fn into_members(self) -> StoreResult<Vec<String>> {
        match self {
            StoreValue::Members(members) => Ok(members),
            other => Err(other.mismatch("members")),
        }
    }

    pub fn into_hash(self) -> StoreResult<HashMap<String, String>> {
        match self {
            StoreValue::Hash(hash) => Ok(hash),
            other => Err(other.mismatch("hash")),
        }
    }

    pub fn into_mean(self) -> StoreResult<(i64, f64)> {
        match self {
            StoreValue::Mean { count, value } => Ok((count, value)),
            other => Err(other.mismatch("mean")),
        }
    }
}

/// Builder for an ordered list of operations submitted as one transaction.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    ops: Vec<StoreOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: StoreOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn set_add(&mut self, key: &str, members: Vec<String>) -> &mut Self {
        self.push(StoreOp::SetAdd {
            key: key.to_string(),
            members,
        })
    }

    pub fn set_pop(&mut self, key: &str) -> &mut Self {
        self.push(StoreOp::SetPop {
            key: key.to_string(),
        })
    }

    pub fn set_members(&mut self, key: &str) -> &mut Self {
        self.push(StoreOp::SetMembers {
            key: key.to_string(),
        })
    }

    pub fn hash_set(&mut self, key: &str, field: &str, value: impl Into<String>) -> &mut Self {
        self.push(StoreOp::HashSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.into(),
        })
    }

    pub fn hash_set_if_absent(
        &mut self,
        key: &str,
        field: &str,
        value: impl Into<String>,
    ) -> &mut Self {
        self.push(StoreOp::HashSetIfAbsent {
            key: key.to_string(),
            field: field.to_string(),
            value: value.into(),
        })
    }

    pub fn hash_get(&mut self, key: &str, field: &str) -> &mut Self {
        self.push(StoreOp::HashGet {
            key: key.to_string(),
            field: field.to_string(),
        })
    }

    pub fn hash_get_all(&mut self, key: &str) -> &mut Self {
        self.push(StoreOp::HashGetAll {
            key: key.to_string(),
        })
    }

    pub fn hash_incr_by(&mut self, key: &str, field: &str, delta: i64) -> &mut Self {
        self.push(StoreOp::HashIncrBy {
            key: key.to_string(),
            field: field.to_string(),
            delta,
        })
    }

    pub fn hash_incr_mean(
        &mut self,
        counts_key: &str,
        values_key: &str,
        field: &str,
        sample: f64,
    ) -> &mut Self {
        self.push(StoreOp::HashIncrMean {
            counts_key: counts_key.to_string(),
            values_key: values_key.to_string(),
            field: field.to_string(),
            sample,
        })
    }

    pub fn get(&mut self, key: &str) -> &mut Self {
        self.push(StoreOp::Get {
            key: key.to_string(),
        })
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.push(StoreOp::Set {
            key: key.to_string(),
            value: value.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }
}

/// Ordered cursor over the replies of one batch.
#[derive(Debug)]
pub struct Replies {
    values: std::vec::IntoIter<StoreValue>,
}

impl Replies {
    pub fn new(values: Vec<StoreValue>) -> Self {
        Self {
            values: values.into_iter(),
        }
    }

    pub fn next_value(&mut self) -> StoreResult<StoreValue> {
        self.values.next().ok_or_else(|| StoreError::UnexpectedReply {
            op: "batch",
            detail: "fewer replies than operations".to_string(),
        })
    }

    pub fn skip(&mut self) -> StoreResult<()> {
        self.next_value().map(|_| ())
    }

    pub fn next_int(&mut self) -> StoreResult<i64> {
        self.next_value()?.into_int()
    }

    pub fn next_text(&mut self) -> StoreResult<Option<String>> {
        self.next_value()?.into_text()
    }

    pub fn next_members(&mut self) -> StoreResult<Vec<String>> {
        self.next_value()?.into_members()
    }

    pub fn next_hash(&mut self) -> StoreResult<HashMap<String, String>> {
        self.next_value()?.into_hash()
    }

    pub fn next_mean(&mut self) -> StoreResult<(i64, f64)> {
        self.next_value()?.into_mean()
    }
}

/// Key-value backend that runs a batch of operations as one atomic unit.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Run `ops` as a single transaction, returning one reply per op in order.
    async fn execute_batch(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<StoreValue>>;

    async fn execute(&self, batch: Batch) -> StoreResult<Replies> {
        let expected = batch.len();
        let values = self.execute_batch(batch.into_ops()).await?;
        if values.len() != expected {
            return Err(StoreError::UnexpectedReply {
                op: "batch",
                detail: format!("expected {expected} replies, got {}", values.len()),
            });
        }
        Ok(Replies::new(values))
    }
}

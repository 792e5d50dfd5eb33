//! Redis-backed store. Each batch is sent as one MULTI/EXEC pipeline.

use crate::batch::{AtomicStore, StoreOp, StoreValue};
use async_trait::async_trait;
use pivot_core::config::RedisConfig;
use pivot_core::error::{StoreError, StoreResult};
use redis::aio::ConnectionManager;
use redis::{from_redis_value, FromRedisValue};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Increments the count, folds ARGV[2] into the running mean, and returns
/// `{count, mean}` with the mean formatted as a round-trippable string.
const INCR_MEAN_SCRIPT: &str = r#"
local n = redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
local old = tonumber(redis.call('HGET', KEYS[2], ARGV[1]) or '0') or 0
local sample = tonumber(ARGV[2])
local mean = ((n - 1) / n) * old + (1 / n) * sample
local encoded = string.format('%.17g', mean)
redis.call('HSET', KEYS[2], ARGV[1], encoded)
return {n, encoded}
"#;

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the server answers PING.
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        info!(url = %config.redacted_url(), "Connecting to Redis");

        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let mut conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StoreError::Connection(format!(
                    "timed out after {}ms",
                    config.connect_timeout_ms
                ))
            })?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        info!(response = %pong, "Redis connection established");

        Ok(Self { conn })
    }

    fn pipeline(ops: &[StoreOp]) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                StoreOp::SetAdd { key, members } => {
                    pipe.cmd("SADD").arg(key).arg(members);
                }
                StoreOp::SetPop { key } => {
                    pipe.cmd("SPOP").arg(key);
                }
                StoreOp::SetMembers { key } => {
                    pipe.cmd("SMEMBERS").arg(key);
                }
                StoreOp::HashSet { key, field, value } => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value);
                }
                StoreOp::HashSetIfAbsent { key, field, value } => {
                    pipe.cmd("HSETNX").arg(key).arg(field).arg(value);
                }
                StoreOp::HashGet { key, field } => {
                    pipe.cmd("HGET").arg(key).arg(field);
                }
                StoreOp::HashGetAll { key } => {
                    pipe.cmd("HGETALL").arg(key);
                }
                StoreOp::HashIncrBy { key, field, delta } => {
                    pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta);
                }
                StoreOp::HashIncrMean {
                    counts_key,
                    values_key,
                    field,
                    sample,
                } => {
                    pipe.cmd("EVAL")
                        .arg(INCR_MEAN_SCRIPT)
                        .arg(2)
                        .arg(counts_key)
                        .arg(values_key)
                        .arg(field)
                        .arg(sample.to_string());
                }
                StoreOp::Get { key } => {
                    pipe.cmd("GET").arg(key);
                }
                StoreOp::Set { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value);
                }
            }
        }
        pipe
    }
}

fn decode<T: FromRedisValue>(op: &StoreOp, reply: &redis::Value) -> StoreResult<T> {
    from_redis_value(reply).map_err(|e| StoreError::UnexpectedReply {
        op: op.name(),
        detail: e.to_string(),
    })
}

fn decode_reply(op: &StoreOp, reply: &redis::Value) -> StoreResult<StoreValue> {
    let value = match op {
        StoreOp::SetAdd { .. } | StoreOp::HashIncrBy { .. } => StoreValue::Int(decode(op, reply)?),
        StoreOp::SetPop { .. } | StoreOp::HashGet { .. } | StoreOp::Get { .. } => {
            StoreValue::Text(decode::<Option<String>>(op, reply)?)
        }
        StoreOp::SetMembers { .. } => StoreValue::Members(decode(op, reply)?),
        StoreOp::HashSet { .. } | StoreOp::Set { .. } => StoreValue::Done,
        StoreOp::HashSetIfAbsent { .. } => StoreValue::Flag(decode(op, reply)?),
        StoreOp::HashGetAll { .. } => StoreValue::Hash(decode::<HashMap<String, String>>(op, reply)?),
        StoreOp::HashIncrMean { .. } => {
            let (count, encoded): (i64, String) = decode(op, reply)?;
            let value = encoded.parse::<f64>().map_err(|e| StoreError::UnexpectedReply {
                op: op.name(),
                detail: format!("mean {encoded:?}: {e}"),
            })?;
            StoreValue::Mean { count, value }
        }
    };
    Ok(value)
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn execute_batch(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<StoreValue>> {
        metrics::counter!("pivot.store.batch").increment(1);
        let mut conn = self.conn.clone();

        let replies: Vec<redis::Value> = match Self::pipeline(&ops).query_async(&mut conn).await {
            Ok(replies) => replies,
            Err(e) => {
                metrics::counter!("pivot.store.batch.error").increment(1);
                warn!(error = %e, ops = ops.len(), "Redis batch failed");
                return Err(StoreError::Backend(e.to_string()));
            }
        };

        if replies.len() != ops.len() {
            return Err(StoreError::UnexpectedReply {
                op: "EXEC",
                detail: format!("expected {} replies, got {}", ops.len(), replies.len()),
            });
        }
        debug!(ops = ops.len(), "Redis batch executed");

        ops.iter()
            .zip(replies.iter())
            .map(|(op, reply)| decode_reply(op, reply))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::batch::Batch;

    fn redis_url() -> Option<String> {
        std::env::var("PIVOT_TEST_REDIS_URL").ok()
    }

    #[test]
    fn test_pipeline_is_atomic_and_ordered() {
        let ops = Batch::new()
            .hash_get_all("k:config")
            .set_pop("k:untested")
            .clone()
            .into_ops();
        let pipe = RedisStore::pipeline(&ops);
        let packed = String::from_utf8_lossy(&pipe.get_packed_pipeline()).to_string();
        let multi = packed.find("MULTI").unwrap();
        let hgetall = packed.find("HGETALL").unwrap();
        let spop = packed.find("SPOP").unwrap();
        let exec = packed.find("EXEC").unwrap();
        assert!(multi < hgetall && hgetall < spop && spop < exec);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (set PIVOT_TEST_REDIS_URL)"]
    async fn test_incr_mean_script_against_redis() {
        let Some(url) = redis_url() else { return };
        let store = RedisStore::connect(&RedisConfig {
            url,
            ..RedisConfig::default()
        })
        .await
        .unwrap();

        let counts = "pivot:test:script:counts";
        let values = "pivot:test:script:values";
        let mut batch = Batch::new();
        batch
            .hash_set(counts, "0", "1")
            .hash_set(values, "0", "0")
            .hash_incr_mean(counts, values, "0", 1.0);
        let mut replies = store.execute(batch).await.unwrap();
        replies.skip().unwrap();
        replies.skip().unwrap();
        let (count, value) = replies.next_mean().unwrap();
        assert_eq!(count, 2);
        assert!((value - 0.5).abs() < 1e-12);
    }
}

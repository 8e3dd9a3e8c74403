//! Networked backend on top of a redis server.

use super::backend::{StatusBackend, StoreResult, ALL_PIPELINES_KEY};
use parking_lot::Mutex;
use redis::Commands;
use serde_json::Value;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs a blocking round trip. On a multi-threaded runtime the worker hands
/// its other tasks off first.
fn round_trip<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Backend storing JSON strings and native sets in redis.
pub struct RedisBackend {
    url: String,
    conn: Mutex<redis::Connection>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").field("url", &self.url).finish()
    }
}

impl RedisBackend {
    /// Connects to `url` and checks the server answers `PING`.
    pub fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_with_timeout(CONNECT_TIMEOUT)?;
        conn.set_read_timeout(Some(CONNECT_TIMEOUT))?;
        redis::cmd("PING").query::<String>(&mut conn)?;
        Ok(Self {
            url: url.to_string(),
            conn: Mutex::new(conn),
        })
    }
}

impl StatusBackend for RedisBackend {
    fn kind(&self) -> &'static str {
        "redis"
    }

    fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let raw: Option<String> = round_trip(|| self.conn.lock().get(key))?;
        match raw {
            None => Ok(None),
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        }
    }

    fn set(&self, key: &str, value: &Value) -> StoreResult<()> {
        let text = serde_json::to_string(value)?;
        round_trip(|| self.conn.lock().set::<_, _, ()>(key, text))?;
        Ok(())
    }

    fn del(&self, key: &str) -> StoreResult<()> {
        round_trip(|| self.conn.lock().del::<_, ()>(key))?;
        Ok(())
    }

    fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        round_trip(|| self.conn.lock().sadd::<_, _, ()>(key, member))?;
        Ok(())
    }

    fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        round_trip(|| self.conn.lock().srem::<_, _, ()>(key, member))?;
        Ok(())
    }

    fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut members: Vec<String> = round_trip(|| self.conn.lock().smembers(key))?;
        members.sort();
        Ok(members)
    }

    fn reset(&self) -> StoreResult<()> {
        round_trip(|| {
            // Only keys this orchestrator owns; the database may be shared.
            let mut conn = self.conn.lock();
            for pattern in [
                "PipelineStatus:*",
                "PipelineExecution:*",
                "Dependents:*",
                "Dependencies:*",
            ] {
                let keys: Vec<String> = conn.keys(pattern)?;
                if !keys.is_empty() {
                    conn.del::<_, ()>(keys)?;
                }
            }
            conn.del::<_, ()>(ALL_PIPELINES_KEY)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_outside_a_runtime() {
        assert_eq!(round_trip(|| 7), 7);
    }

    #[tokio::test]
    async fn test_round_trip_on_current_thread_runtime() {
        assert_eq!(round_trip(|| "inline"), "inline");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_round_trip_on_multi_thread_runtime() {
        let value = round_trip(|| std::thread::current().id());
        assert_eq!(value, std::thread::current().id());
    }
}

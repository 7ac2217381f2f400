//! Shared key-value store holding slot status, job bookkeeping, cached tile
//! results and request counters. Each use lives in its own key namespace.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{sync::Mutex, time::Instant};

use crate::error::Error;

pub fn slot_key(slot: &str) -> String {
    format!("slot:{slot}")
}

pub fn job_key(job: &str) -> String {
    format!("job:{job}")
}

pub fn unit_key(job: &str, index: usize) -> String {
    format!("job:{job}:unit:{index}")
}

pub fn cache_key(content_key: &str) -> String {
    format!("cache:{content_key}")
}

pub fn counter_key(kind: &str) -> String {
    format!("sim_requests_{kind}")
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, Error>;

    async fn put_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// Atomically replaces the value at `key` with `new` if the current value
    /// equals `expected` (`None` meaning absent). Returns whether it did.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, Error>;

    async fn incr(&self, key: &str) -> Result<i64, Error>;
}

/// Typed JSON access on top of any [`KeyValueStore`].
#[async_trait]
pub trait StoreExt: KeyValueStore {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>, Error> {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), Error> {
        let raw = serde_json::to_string(value)?;
        self.put_raw(key, &raw, ttl).await
    }
}

impl<S: KeyValueStore + ?Sized> StoreExt for S {}

const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current ~= ARGV[2] then return 0 end
elseif current then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
    prefix: String,
    cas: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            conn: client.get_connection_manager().await?,
            prefix: prefix.into(),
            cas: redis::Script::new(COMPARE_AND_SET),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.key(key)).await?)
    }

    async fn put_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(self.key(key), value, ttl.as_secs().max(1))
                    .await?
            }
            None => conn.set::<_, _, ()>(self.key(key), value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key(key)).await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .cas
            .key(self.key(key))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(new)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn incr(&self, key: &str) -> Result<i64, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(self.key(key), 1).await?)
    }
}

/// Process-local store for tests and single-instance runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn live(entry: &(String, Option<Instant>)) -> bool {
    entry.1.is_none_or(|expiry| expiry > Instant::now())
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, Error> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| live(entry))
            .map(|(value, _)| value.clone()))
    }

    async fn put_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
        let expiry = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, Error> {
        let mut entries = self.entries.lock().await;
        let current = entries
            .get(key)
            .filter(|entry| live(entry))
            .map(|(value, _)| value.as_str());
        if current != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), (new.to_string(), None));
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<i64, Error> {
        let mut entries = self.entries.lock().await;
        let current = entries
            .get(key)
            .filter(|entry| live(entry))
            .map(|(value, _)| value.parse::<i64>())
            .transpose()
            .map_err(|err| Error::InvalidRequest(format!("{key} is not a counter: {err}")))?
            .unwrap_or(0);
        entries.insert(key.to_string(), ((current + 1).to_string(), None));
        Ok(current + 1)
    }
}

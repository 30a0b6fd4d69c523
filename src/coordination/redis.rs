//! Thin async wrapper over the coordination service. One logical connection
//! per worker; every command is individually atomic.

use std::collections::HashMap;

use redis::{aio::ConnectionManager, AsyncCommands, Client};

use crate::error::MigrateError;

#[derive(Clone)]
pub struct Coordinator {
    conn: ConnectionManager,
}

impl Coordinator {
    pub async fn connect(url: &str) -> Result<Self, MigrateError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub async fn hash_len(&self, key: &str) -> Result<u64, MigrateError> {
        let mut conn = self.conn.clone();
        let n: u64 = conn.hlen(key).await?;
        Ok(n)
    }

    pub async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, MigrateError> {
        let mut conn = self.conn.clone();
        let v: Option<String> = conn.hget(key, field).await?;
        Ok(v)
    }

    pub async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, MigrateError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    pub async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), MigrateError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    pub async fn hash_set_many(
        &self,
        key: &str,
        entries: &[(String, String)],
    ) -> Result<(), MigrateError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, entries).await?;
        Ok(())
    }

    /// Atomic `SET key value NX EX ttl`; true iff the key was created.
    pub async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, MigrateError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    /// Reset the TTL on `key`; false means the key no longer exists.
    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, MigrateError> {
        let mut conn = self.conn.clone();
        let set: bool = conn.expire(key, ttl_secs as i64).await?;
        Ok(set)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, MigrateError> {
        let mut conn = self.conn.clone();
        let found: bool = conn.exists(key).await?;
        Ok(found)
    }

    pub async fn del(&self, key: &str) -> Result<(), MigrateError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    /// Delete every key matching `pattern` (SCAN, not KEYS). Returns the
    /// number of keys removed.
    pub async fn delete_matching(&self, pattern: &str) -> Result<u64, MigrateError> {
        let keys: Vec<String> = {
            let mut conn = self.conn.clone();
            let mut iter = conn.scan_match::<_, String>(pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        let removed = keys.len() as u64;
        if !keys.is_empty() {
            let mut conn = self.conn.clone();
            conn.del::<_, ()>(keys).await?;
        }
        Ok(removed)
    }
}

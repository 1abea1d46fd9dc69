use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Optional shared tier over redis, for cross-instance sharing. Every error
/// path degrades to a miss; the pipeline never fails because the shared
/// cache is down or holds garbage.
#[derive(Clone)]
pub struct SharedCache {
    manager: ConnectionManager,
}

impl SharedCache {
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = match conn.get(key).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, error = %e, "shared cache read failed, treating as miss");
                return None;
            }
        };
        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                // Corrupt entry: delete and report a miss so it self-heals.
                tracing::warn!(key, error = %e, "shared cache entry corrupt, deleting");
                let _: Result<(), _> = conn.del(key).await;
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "shared cache serialization failed");
                return;
            }
        };
        let mut conn = self.manager.clone();
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(e) = conn.set_ex::<_, _, ()>(key, raw, ttl_secs).await {
            tracing::warn!(key, error = %e, "shared cache write failed");
        }
    }
}

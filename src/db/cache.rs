// db/cache.rs
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Cache TTL constants (in seconds)
pub const MILESTONE_CACHE_TTL: usize = 900; // 15 minutes
pub const ESCROW_CACHE_TTL: usize = 300; // 5 minutes

pub struct CacheHelper;

impl CacheHelper {
    pub fn milestone_key(milestone_id: Uuid) -> String {
        format!("milestone:{}", milestone_id)
    }

    pub fn escrow_key(escrow_id: Uuid) -> String {
        format!("escrow:{}", escrow_id)
    }

    pub fn escrow_by_milestone_key(milestone_id: Uuid) -> String {
        format!("escrow:milestone:{}", milestone_id)
    }

    /// Generic get from cache
    pub async fn get<T: DeserializeOwned>(
        redis: &Arc<ConnectionManager>,
        key: &str,
    ) -> Result<Option<T>, redis::RedisError> {
        let mut conn = ConnectionManager::clone(redis);
        let cached: Option<String> = conn.get(key).await?;

        match cached {
            Some(data) => match serde_json::from_str::<T>(&data) {
                Ok(value) => {
                    tracing::debug!("Cache HIT: {}", key);
                    Ok(Some(value))
                }
                Err(_) => {
                    tracing::warn!("Cache deserialization failed for: {}", key);
                    Ok(None)
                }
            },
            None => {
                tracing::debug!("Cache MISS: {}", key);
                Ok(None)
            }
        }
    }

    /// Generic set to cache with TTL
    pub async fn set<T: Serialize>(
        redis: &Arc<ConnectionManager>,
        key: &str,
        value: &T,
        ttl_seconds: usize,
    ) -> Result<(), redis::RedisError> {
        if let Ok(json) = serde_json::to_string(value) {
            let mut conn = ConnectionManager::clone(redis);
            let _: () = conn.set_ex(key, json, ttl_seconds).await?;
            tracing::debug!("Cache SET: {} (TTL: {}s)", key, ttl_seconds);
        }
        Ok(())
    }

    /// Drop every cached view of a (Milestone, Escrow) pair. Called after
    /// each committed write so readers never see a pre-transition status.
    pub async fn invalidate_pair(
        redis: &Arc<ConnectionManager>,
        milestone_id: Uuid,
        escrow_id: Option<Uuid>,
    ) -> Result<(), redis::RedisError> {
        let mut keys = vec![
            Self::milestone_key(milestone_id),
            Self::escrow_by_milestone_key(milestone_id),
        ];
        if let Some(escrow_id) = escrow_id {
            keys.push(Self::escrow_key(escrow_id));
        }

        let mut conn = ConnectionManager::clone(redis);
        let _: () = conn.del(&keys).await?;
        tracing::debug!("Cache DELETE: {:?}", keys);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let id = Uuid::nil();
        assert_eq!(CacheHelper::milestone_key(id), format!("milestone:{}", id));
        assert_ne!(CacheHelper::escrow_key(id), CacheHelper::escrow_by_milestone_key(id));
    }
}

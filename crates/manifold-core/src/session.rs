// ABOUTME: Session registry - maps (project, backend) to the backend-native resumable session id
// ABOUTME: Trait plus an in-memory store and a cache-aside wrapper over any durable store

use crate::types::BackendType;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Durable registry of backend-native session identifiers.
///
/// One live value per (project, backend). Writes are last-write-wins: a newer
/// observed id simply overwrites. At most one in-flight execution per project
/// is assumed; concurrent runs against one project can lose an update.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, project_id: &str, backend: BackendType) -> Result<Option<String>>;
    async fn set(&self, project_id: &str, backend: BackendType, session_id: &str) -> Result<()>;
    async fn clear(&self, project_id: &str, backend: BackendType) -> Result<()>;
    async fn all_for_project(&self, project_id: &str) -> Result<Vec<(BackendType, String)>>;
}

/// In-memory store. The fallback layer when no durable store is configured,
/// and the workhorse for tests.
#[derive(Default)]
pub struct MemorySessionStore {
    inner: RwLock<HashMap<(String, BackendType), String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, project_id: &str, backend: BackendType) -> Result<Option<String>> {
        let map = self.inner.read().await;
        Ok(map.get(&(project_id.to_string(), backend)).cloned())
    }

    async fn set(&self, project_id: &str, backend: BackendType, session_id: &str) -> Result<()> {
        let mut map = self.inner.write().await;
        map.insert((project_id.to_string(), backend), session_id.to_string());
        Ok(())
    }

    async fn clear(&self, project_id: &str, backend: BackendType) -> Result<()> {
        let mut map = self.inner.write().await;
        map.remove(&(project_id.to_string(), backend));
        Ok(())
    }

    async fn all_for_project(&self, project_id: &str) -> Result<Vec<(BackendType, String)>> {
        let map = self.inner.read().await;
        let mut out: Vec<(BackendType, String)> = map
            .iter()
            .filter(|((pid, _), _)| pid == project_id)
            .map(|((_, backend), sid)| (*backend, sid.clone()))
            .collect();
        out.sort_by_key(|(backend, _)| backend.as_str());
        Ok(out)
    }
}

/// Cache-aside layer in front of a durable store. The cache is never the
/// source of truth: reads fall through on miss, writes go to the store first.
pub struct CachedSessionStore {
    cache: RwLock<HashMap<(String, BackendType), String>>,
    store: Arc<dyn SessionStore>,
}

impl CachedSessionStore {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            store,
        }
    }
}

#[async_trait]
impl SessionStore for CachedSessionStore {
    async fn get(&self, project_id: &str, backend: BackendType) -> Result<Option<String>> {
        {
            let cache = self.cache.read().await;
            if let Some(sid) = cache.get(&(project_id.to_string(), backend)) {
                return Ok(Some(sid.clone()));
            }
        }

        let from_store = self.store.get(project_id, backend).await?;
        if let Some(ref sid) = from_store {
            let mut cache = self.cache.write().await;
            cache.insert((project_id.to_string(), backend), sid.clone());
        }
        Ok(from_store)
    }

    async fn set(&self, project_id: &str, backend: BackendType, session_id: &str) -> Result<()> {
        self.store.set(project_id, backend, session_id).await?;
        let mut cache = self.cache.write().await;
        cache.insert((project_id.to_string(), backend), session_id.to_string());
        Ok(())
    }

    async fn clear(&self, project_id: &str, backend: BackendType) -> Result<()> {
        self.store.clear(project_id, backend).await?;
        let mut cache = self.cache.write().await;
        cache.remove(&(project_id.to_string(), backend));
        Ok(())
    }

    async fn all_for_project(&self, project_id: &str) -> Result<Vec<(BackendType, String)>> {
        // The durable store is authoritative for enumeration.
        self.store.all_for_project(project_id).await
    }
}

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::CacheStorage;
use crate::Error;
use crate::lock::mutex_lock;
use crate::model::SiteUri;

const LOCK_TARGET: &str = "storage::memory";

/// In-process store, mainly for tests and single-node setups.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    pages: Mutex<HashMap<SiteUri, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.pages, LOCK_TARGET, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn get(&self, site_uri: &SiteUri) -> Result<Option<String>, Error> {
        Ok(mutex_lock(&self.pages, LOCK_TARGET, "get").get(site_uri).cloned())
    }

    async fn set(&self, site_uri: &SiteUri, value: &str) -> Result<(), Error> {
        mutex_lock(&self.pages, LOCK_TARGET, "set").insert(site_uri.clone(), value.to_string());
        Ok(())
    }

    async fn delete(&self, site_uri: &SiteUri) -> Result<(), Error> {
        mutex_lock(&self.pages, LOCK_TARGET, "delete").remove(site_uri);
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), Error> {
        mutex_lock(&self.pages, LOCK_TARGET, "delete_all").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let storage = MemoryStorage::new();
        let uri = SiteUri::new(1, "page");

        storage.set(&uri, "one").await.unwrap();
        storage.set(&uri, "two").await.unwrap();
        assert_eq!(storage.get(&uri).await.unwrap().as_deref(), Some("two"));

        storage.delete(&uri).await.unwrap();
        storage.delete(&uri).await.unwrap();
        assert!(storage.get(&uri).await.unwrap().is_none());
        assert!(storage.is_empty());
    }
}

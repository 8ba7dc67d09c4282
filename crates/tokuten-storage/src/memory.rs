use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokuten_core::StoredMovie;

use crate::gateway::{PathError, WritePath};

/// Process-local store used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: Mutex<BTreeMap<String, StoredMovie>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a row directly, bypassing the gateway (e.g. manually curated data).
    pub async fn put(&self, movie: StoredMovie) {
        self.rows
            .lock()
            .await
            .insert(movie.external_id.clone(), movie);
    }

    pub async fn get(&self, external_id: &str) -> Option<StoredMovie> {
        self.rows.lock().await.get(external_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<StoredMovie> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl WritePath for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, external_id: &str) -> Result<Option<StoredMovie>, PathError> {
        Ok(self.get(external_id).await)
    }

    async fn store(&self, movie: &StoredMovie) -> Result<(), PathError> {
        self.put(movie.clone()).await;
        Ok(())
    }
}

//! In-process policy store

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{PolicyModules, PolicyStore, StoreError};

/// Keeps policies in memory; used when no policy API is configured and in tests.
#[derive(Clone, Default)]
pub struct MemoryPolicyStore {
    policies: Arc<RwLock<BTreeMap<String, PolicyModules>>>,
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn get_policy(&self, path: &str) -> Result<Option<PolicyModules>, StoreError> {
        Ok(self.policies.read().await.get(path).cloned())
    }

    async fn put_policy(&self, path: &str, modules: PolicyModules) -> Result<(), StoreError> {
        self.policies.write().await.insert(path.to_string(), modules);
        Ok(())
    }
}

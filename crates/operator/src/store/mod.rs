//! Remote policy store holding the generated modules

mod http;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use http::HttpPolicyStore;
pub use memory::MemoryPolicyStore;

/// Module file name → policy source
pub type PolicyModules = BTreeMap<String, String>;

/// Errors raised by the policy store
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Transport level failure
    #[error("Request Error: {0}")]
    Request(#[from] reqwest::Error),

    /// The API answered with a non-success status
    #[error("policy API returned {status} for {path}: {body}")]
    Status {
        /// Policy path
        path: String,
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The API answered with an unexpected body
    #[error("unexpected policy API response for {path}: {reason}")]
    InvalidResponse {
        /// Policy path
        path: String,
        /// What was wrong with it
        reason: String,
    },
}

/// Reads and replaces the modules stored at a policy path. Both operations
/// are all-or-nothing; retries are left to the caller.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Modules stored at `path`, `None` when the policy does not exist
    async fn get_policy(&self, path: &str) -> Result<Option<PolicyModules>, StoreError>;

    /// Replaces every module stored at `path`
    async fn put_policy(&self, path: &str, modules: PolicyModules) -> Result<(), StoreError>;
}

/// Policy holding the labels of system `id`
#[must_use]
pub fn labels_path(id: &str) -> String {
    format!("metadata/{id}/labels")
}

/// Policy holding the selectors of stack `id`
#[must_use]
pub fn selectors_path(id: &str) -> String {
    format!("stacks/{id}/selectors")
}

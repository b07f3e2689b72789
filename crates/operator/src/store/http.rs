//! Policy store backed by the policy management HTTP API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::{PolicyModules, PolicyStore, StoreError};

/// Client for `GET`/`PUT {base}/v1/policies/{path}`
#[derive(Clone)]
pub struct HttpPolicyStore {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpPolicyStore {
    /// Creates a store talking to `base_url`, authenticating with `token` when set.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/policies/{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn status_error(path: &str, response: Response) -> StoreError {
    StoreError::Status {
        path: path.to_string(),
        status: response.status().as_u16(),
        body: response.text().await.unwrap_or_default(),
    }
}

/// Extracts `result.modules` from a policy document.
fn parse_modules(path: &str, body: &Value) -> Result<PolicyModules, StoreError> {
    let invalid = |reason: String| StoreError::InvalidResponse {
        path: path.to_string(),
        reason,
    };

    let modules = body
        .get("result")
        .and_then(|result| result.get("modules"))
        .and_then(Value::as_object)
        .ok_or_else(|| invalid("missing result.modules".to_string()))?;

    modules
        .iter()
        .map(|(name, source)| {
            source
                .as_str()
                .map(|source| (name.clone(), source.to_string()))
                .ok_or_else(|| invalid(format!("module {name} is not a string")))
        })
        .collect()
}

#[async_trait]
impl PolicyStore for HttpPolicyStore {
    #[instrument(skip(self))]
    async fn get_policy(&self, path: &str) -> Result<Option<PolicyModules>, StoreError> {
        let response = self
            .authorized(self.client.get(self.url(path)))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("policy does not exist");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(path, response).await);
        }

        let body: Value = response.json().await?;
        parse_modules(path, &body).map(Some)
    }

    #[instrument(skip(self, modules), fields(modules = modules.len()))]
    async fn put_policy(&self, path: &str, modules: PolicyModules) -> Result<(), StoreError> {
        let response = self
            .authorized(self.client.put(self.url(path)))
            .json(&json!({ "modules": modules }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(path, response).await);
        }

        debug!("policy replaced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_map() {
        let body = json!({
            "result": {
                "modules": {"labels.rego": "package metadata.sys1.labels\n"},
                "revision": "abc",
            }
        });
        let modules = parse_modules("metadata/sys1/labels", &body).unwrap();
        assert_eq!(modules["labels.rego"], "package metadata.sys1.labels\n");
    }

    #[test]
    fn rejects_malformed_documents() {
        let missing = json!({"result": {}});
        assert!(matches!(
            parse_modules("p", &missing),
            Err(StoreError::InvalidResponse { .. })
        ));

        let not_string = json!({"result": {"modules": {"labels.rego": 1}}});
        let err = parse_modules("p", &not_string).unwrap_err();
        assert!(err.to_string().contains("labels.rego"));
    }

    #[test]
    fn builds_urls() {
        let store = HttpPolicyStore::new("https://tenant.example.com/", None).unwrap();
        assert_eq!(
            store.url("stacks/web/selectors"),
            "https://tenant.example.com/v1/policies/stacks/web/selectors"
        );
    }
}

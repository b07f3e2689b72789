//! Controllers keeping generated policy in sync with `System` and `Stack` resources

mod stack;
mod system;

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::Controller;
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource, ResourceExt};
use policyward_crd::{PolicySyncStatus, Stack, System};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::rego::PolicyError;
use crate::store::{HttpPolicyStore, MemoryPolicyStore, PolicyModules, PolicyStore};
use crate::{Error, Result};

pub use stack::sync_selectors;
pub use system::sync_labels;

/// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics that contains the traces metrics and kube event recorder
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Kubernetes event emitter
    pub recorder: Recorder,
    /// Remote store holding the generated policies
    pub store: Arc<dyn PolicyStore>,
    /// Operator configuration
    pub config: Config,
}

/// Holds the state of the whole application
#[derive(Clone, Default)]
pub struct State {
    /// Atomic lock for kubernetes diagnostics
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}

impl State {
    /// Getter for diagnostics with read lock
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Converts the application state to controller context
    pub async fn to_ctrl_context(
        &self,
        client: Client,
        store: Arc<dyn PolicyStore>,
        config: Config,
    ) -> Arc<Context> {
        Arc::new(Context {
            recorder: self.diagnostics.read().await.recorder(client.clone()),
            client,
            diagnostics: self.diagnostics.clone(),
            store,
            config,
        })
    }
}

/// Outcome of a policy sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Stored policy already matched the spec
    UpToDate,
    /// Stored policy was replaced
    Updated,
}

impl SyncOutcome {
    fn message(self) -> &'static str {
        match self {
            SyncOutcome::UpToDate => "policy is up to date",
            SyncOutcome::Updated => "policy updated",
        }
    }
}

/// Observe then update: reads the module stored at `path`, checks it with
/// `is_up_to_date`, and replaces the policy with `render()` when it is absent
/// or differs.
async fn sync_policy(
    store: &dyn PolicyStore,
    path: &str,
    module: &str,
    render: impl FnOnce() -> String,
    is_up_to_date: impl FnOnce(&str) -> Result<bool, PolicyError>,
) -> Result<SyncOutcome> {
    let observed = store.get_policy(path).await?;

    let up_to_date = match observed.as_ref().and_then(|modules| modules.get(module)) {
        Some(source) => is_up_to_date(source)?,
        None => {
            debug!(policy_path = path, module, "module not found in policy");
            false
        }
    };

    if up_to_date {
        return Ok(SyncOutcome::UpToDate);
    }

    store
        .put_policy(path, PolicyModules::from([(module.to_string(), render())]))
        .await?;

    Ok(SyncOutcome::Updated)
}

fn policy_store(config: &Config) -> Result<Arc<dyn PolicyStore>> {
    match &config.policy_api_url {
        Some(url) => {
            info!(policy_api_url = %url, "using policy API");
            let store = HttpPolicyStore::new(url.clone(), config.policy_api_token.clone())?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("POLICY_API_URL is not set, policies are kept in memory");
            Ok(Arc::new(MemoryPolicyStore::default()))
        }
    }
}

/// Initialize the controllers and shared state (given the crds are installed)
///
/// # Panics
/// Will panic if kube client cannot be initialized from the environment
#[instrument(skip(state, config))]
pub async fn run(state: State, config: Config) {
    info!("initializing policyward controllers");

    #[allow(clippy::expect_used)]
    let client = Client::try_default()
        .await
        .expect("failed to create kube client");

    info!("kubernetes client initialized successfully");

    let systems = Api::<System>::all(client.clone());
    let stacks = Api::<Stack>::all(client.clone());
    if let Err(e) = systems.list(&ListParams::default().limit(1)).await {
        error!(error = %e, "failed to list system resources, CRD may not be installed");
        std::process::exit(1);
    }
    if let Err(e) = stacks.list(&ListParams::default().limit(1)).await {
        error!(error = %e, "failed to list stack resources, CRD may not be installed");
        std::process::exit(1);
    }

    let store = match policy_store(&config) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to create policy store");
            std::process::exit(1);
        }
    };

    info!("CRDs verified, starting controllers");

    let ctx = state.to_ctrl_context(client, store, config).await;

    let system_controller = Controller::new(systems, WatcherConfig::default().any_semantic())
        .shutdown_on_signal()
        .run(system::reconcile, error_policy::<System>, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    let stack_controller = Controller::new(stacks, WatcherConfig::default().any_semantic())
        .shutdown_on_signal()
        .run(stack::reconcile, error_policy::<Stack>, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    tokio::join!(system_controller, stack_controller);

    info!("controller shutdown complete");
}

#[instrument(skip(object, err, ctx), fields(
    name = %object.name_any(),
    namespace = object.namespace().as_deref(),
    error_type = ?err,
))]
#[allow(clippy::needless_pass_by_value)]
fn error_policy<K>(object: Arc<K>, err: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let err_msg = err.to_string();
    let requeue = ctx.config.error_requeue;

    error!(
        error = %err_msg,
        requeue_after_secs = requeue.as_secs(),
        "reconciliation failed, scheduling retry"
    );

    let oref = object.object_ref(&());

    tokio::spawn(async move {
        ctx.diagnostics.write().await.reconcile_failures += 1;
        publish_event(
            &ctx.recorder,
            EventType::Warning,
            "ReconciliationFailed",
            "Reconcile",
            Some(format!("Error: {err_msg}")),
            &oref,
        )
        .await;
    });

    Action::requeue(requeue)
}

/// Merge-patches the status subresource of `object`.
async fn flush_status<K>(client: &Client, object: &K, status: &PolicySyncStatus) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned,
{
    let ns = object
        .namespace()
        .ok_or_else(|| Error::from("Unable to get source namespace".to_string()))?;
    let name = object
        .meta()
        .name
        .as_ref()
        .ok_or_else(|| "Object has a missing name".to_string())?;
    let api: Api<K> = Api::namespaced(client.clone(), &ns);

    debug!(
        policy_path = %status.policy_path,
        up_to_date = status.up_to_date,
        "flushing status to API server"
    );

    let status_patch = Patch::Merge(json!({"status": serde_json::to_value(status)?}));
    api.patch_status(name, &PatchParams::default(), &status_patch)
        .await?;

    Ok(())
}

/// Helper function to publish a Kubernetes event
async fn publish_event(
    recorder: &Recorder,
    event_type: EventType,
    reason: impl Into<String>,
    action: impl Into<String>,
    note: Option<String>,
    oref: &ObjectReference,
) {
    let _ = recorder
        .publish(
            &Event {
                type_: event_type,
                reason: reason.into(),
                note,
                action: action.into(),
                secondary: None,
            },
            oref,
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sync_writes_when_policy_is_missing() {
        let store = MemoryPolicyStore::default();

        let outcome = sync_policy(&store, "p", "m.rego", || "rendered".into(), |_| Ok(true))
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Updated);

        let stored = store.get_policy("p").await.unwrap().unwrap();
        assert_eq!(stored["m.rego"], "rendered");
    }

    #[tokio::test]
    async fn sync_writes_when_module_is_missing() {
        let store = MemoryPolicyStore::default();
        store
            .put_policy("p", PolicyModules::from([("other.rego".into(), "x".into())]))
            .await
            .unwrap();

        let outcome = sync_policy(&store, "p", "m.rego", || "rendered".into(), |_| Ok(true))
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Updated);
        assert!(!store.get_policy("p").await.unwrap().unwrap().contains_key("other.rego"));
    }

    #[tokio::test]
    async fn sync_propagates_decode_errors() {
        let store = MemoryPolicyStore::default();
        store
            .put_policy("p", PolicyModules::from([("m.rego".into(), "x".into())]))
            .await
            .unwrap();

        let result = sync_policy(
            &store,
            "p",
            "m.rego",
            || "rendered".into(),
            |_| {
                Err(PolicyError::Rejected {
                    module: "m.rego".into(),
                    message: "broken".into(),
                })
            },
        )
        .await;

        assert!(matches!(result, Err(Error::PolicyError(_))));
        let stored = store.get_policy("p").await.unwrap().unwrap();
        assert_eq!(stored["m.rego"], "x");
    }
}

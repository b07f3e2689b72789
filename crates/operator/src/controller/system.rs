use std::sync::Arc;

use k8s_openapi::chrono::Utc;
use kube::{Resource, ResourceExt};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use policyward_crd::v1_alpha1::SystemSpec;
use policyward_crd::{PolicySyncStatus, System};
use tracing::{Span, field, info, instrument};

use super::{Context, SyncOutcome, flush_status, publish_event, sync_policy};
use crate::rego::{self, LABELS_MODULE, desired_labels, labels_equal, render_labels};
use crate::store::{PolicyStore, labels_path};
use crate::{Result, telemetry};

/// Keeps the `labels.rego` module of system `id` in line with `spec`.
///
/// # Errors
///
/// Fails when the store is unreachable or the stored module cannot be decoded.
pub async fn sync_labels(
    store: &dyn PolicyStore,
    id: &str,
    spec: &SystemSpec,
) -> Result<SyncOutcome> {
    let desired = desired_labels(&spec.system_type, &spec.labels);

    sync_policy(
        store,
        &labels_path(id),
        LABELS_MODULE,
        || render_labels(id, &desired),
        |source| Ok(labels_equal(&rego::decode_labels(id, source)?, &desired)),
    )
    .await
}

#[instrument(skip(system, ctx), fields(
    system_name = %system.name_any(),
    system_namespace = system.namespace().as_deref(),
    system_type = %system.spec.system_type,
    external_name = field::Empty,
    trace_id = field::Empty,
))]
#[allow(clippy::needless_pass_by_value)]
pub(super) async fn reconcile(system: Arc<System>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }

    let id = system.external_name();
    Span::current().record("external_name", id.as_str());

    info!("starting reconciliation");

    let outcome = sync_labels(ctx.store.as_ref(), &id, &system.spec).await?;

    if outcome == SyncOutcome::Updated {
        publish_event(
            &ctx.recorder,
            EventType::Normal,
            "PolicyUpdated",
            "Sync",
            Some(format!("Wrote labels of system {id}")),
            &system.object_ref(&()),
        )
        .await;
    }

    let status = PolicySyncStatus {
        policy_path: labels_path(&id),
        up_to_date: true,
        last_synced: Some(Utc::now().to_rfc3339()),
        observed_generation: system.metadata.generation,
        message: Some(outcome.message().to_string()),
    };
    flush_status(&ctx.client, system.as_ref(), &status).await?;

    {
        let mut diag = ctx.diagnostics.write().await;
        diag.last_event = Utc::now();
        if outcome == SyncOutcome::Updated {
            diag.policy_writes += 1;
        }
    }

    let requeue = ctx.config.reconcile_interval;
    info!(
        outcome = ?outcome,
        requeue_after_secs = requeue.as_secs(),
        "reconciliation completed successfully"
    );

    Ok(Action::requeue(requeue))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::Error;
    use crate::store::{MemoryPolicyStore, PolicyModules};

    fn spec(labels: &[(&str, &str)]) -> SystemSpec {
        SystemSpec {
            system_type: "custom".into(),
            description: None,
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[tokio::test]
    async fn writes_then_observes_labels() {
        let store = MemoryPolicyStore::default();
        let spec = spec(&[("env", "prod")]);

        let first = sync_labels(&store, "sys1", &spec).await.unwrap();
        assert_eq!(first, SyncOutcome::Updated);

        let stored = store.get_policy("metadata/sys1/labels").await.unwrap().unwrap();
        assert!(stored[LABELS_MODULE].contains(r#""env": "prod""#));
        assert!(stored[LABELS_MODULE].contains(r#""system-type": "custom""#));

        let second = sync_labels(&store, "sys1", &spec).await.unwrap();
        assert_eq!(second, SyncOutcome::UpToDate);
    }

    #[tokio::test]
    async fn changed_labels_are_rewritten() {
        let store = MemoryPolicyStore::default();
        sync_labels(&store, "sys1", &spec(&[("env", "prod")]))
            .await
            .unwrap();

        let outcome = sync_labels(&store, "sys1", &spec(&[("env", "dev")]))
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Updated);

        let stored = store.get_policy("metadata/sys1/labels").await.unwrap().unwrap();
        assert!(stored[LABELS_MODULE].contains(r#""env": "dev""#));
    }

    #[tokio::test]
    async fn corrupt_module_is_an_error() {
        let store = MemoryPolicyStore::default();
        store
            .put_policy(
                "metadata/sys1/labels",
                PolicyModules::from([(LABELS_MODULE.into(), "package metadata.sys1.labels\n\nlabels := {\n".into())]),
            )
            .await
            .unwrap();

        let result = sync_labels(&store, "sys1", &spec(&[])).await;
        assert!(matches!(result, Err(Error::PolicyError(ref e)) if e.is_compile_error()));
    }
}

use std::sync::Arc;

use k8s_openapi::chrono::Utc;
use kube::{Resource, ResourceExt};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use policyward_crd::v1_alpha1::StackSpec;
use policyward_crd::{PolicySyncStatus, Stack};
use tracing::{Span, field, info, instrument};

use super::{Context, SyncOutcome, flush_status, publish_event, sync_policy};
use crate::rego::{self, SELECTORS_MODULE, Selectors, render_selectors, selectors_equal};
use crate::store::{PolicyStore, selectors_path};
use crate::{Result, telemetry};

/// Keeps the `selector.rego` module of stack `id` in line with `spec`.
///
/// # Errors
///
/// Fails when the store is unreachable or the stored module cannot be decoded.
pub async fn sync_selectors(
    store: &dyn PolicyStore,
    id: &str,
    spec: &StackSpec,
) -> Result<SyncOutcome> {
    let desired = Selectors {
        include: spec.selector_include.clone(),
        exclude: spec.selector_exclude.clone(),
    };

    sync_policy(
        store,
        &selectors_path(id),
        SELECTORS_MODULE,
        || render_selectors(id, &desired.include, &desired.exclude),
        |source| Ok(selectors_equal(&rego::decode_selectors(source)?, &desired)),
    )
    .await
}

#[instrument(skip(stack, ctx), fields(
    stack_name = %stack.name_any(),
    stack_namespace = stack.namespace().as_deref(),
    stack_type = %stack.spec.stack_type,
    external_name = field::Empty,
    trace_id = field::Empty,
))]
#[allow(clippy::needless_pass_by_value)]
pub(super) async fn reconcile(stack: Arc<Stack>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }

    let id = stack.external_name();
    Span::current().record("external_name", id.as_str());

    info!(
        include_keys = stack.spec.selector_include.len(),
        exclude_keys = stack.spec.selector_exclude.len(),
        "starting reconciliation"
    );

    let outcome = sync_selectors(ctx.store.as_ref(), &id, &stack.spec).await?;

    if outcome == SyncOutcome::Updated {
        publish_event(
            &ctx.recorder,
            EventType::Normal,
            "PolicyUpdated",
            "Sync",
            Some(format!("Wrote selectors of stack {id}")),
            &stack.object_ref(&()),
        )
        .await;
    }

    let status = PolicySyncStatus {
        policy_path: selectors_path(&id),
        up_to_date: true,
        last_synced: Some(Utc::now().to_rfc3339()),
        observed_generation: stack.metadata.generation,
        message: Some(outcome.message().to_string()),
    };
    flush_status(&ctx.client, stack.as_ref(), &status).await?;

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

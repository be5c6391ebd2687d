//! Reconciliation loop for RegistryProxy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use kube::{ResourceExt, runtime::controller::Action};
use tracing::{debug, error, info, warn};

use crate::controller::context::Context;
use crate::controller::engine::run;
use crate::controller::error::Error;
use crate::controller::operator_states::{OperatorMachine, OperatorState};
use crate::controller::store::{KubeStore, ObjectStore};
use crate::crd::RegistryProxy;

/// Controller name used in metrics.
pub const CONTROLLER: &str = "registryproxy";

/// Reconcile a RegistryProxy.
///
/// Runs one tick of the installer chain, publishes the events it collected
/// and maps its requeue signal onto a controller action.
pub async fn reconcile(obj: Arc<RegistryProxy>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    info!(name = %name, namespace = %namespace, "reconciliation started");

    let store = ctx.store();
    let mut machine = OperatorMachine::new((*obj).clone(), ctx.collaborators(&store));
    let outcome = run(&mut machine, OperatorState::ServedFilter, &ctx.cancel).await;
    ctx.publish_milestones(machine.resource(), machine.milestones())
        .await;
    let signal = outcome?;

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_reconcile(
            CONTROLLER,
            &namespace,
            &name,
            start_time.elapsed().as_secs_f64(),
        );
        health_state.touch_reconcile();
        if let Err(e) = record_states(&store, &ctx).await {
            debug!(error = %e, "failed to refresh state gauge");
        }
    }

    info!(name = %name, namespace = %namespace, requeue = %signal, "reconciliation done");
    Ok(signal.into_action(ctx.config.resync_interval))
}

/// Refresh the per-state gauge from every RegistryProxy in the cluster.
async fn record_states(store: &KubeStore, ctx: &Context) -> Result<(), Error> {
    let Some(ref health_state) = ctx.health_state else {
        return Ok(());
    };
    let all: Vec<RegistryProxy> = store.list(None, None).await?;
    let mut counts: BTreeMap<String, i64> = BTreeMap::new();
    for rp in &all {
        let state = rp
            .status
            .as_ref()
            .and_then(|status| status.state)
            .map_or_else(|| "Unknown".to_string(), |state| state.to_string());
        *counts.entry(state).or_default() += 1;
    }
    for (state, count) in counts {
        health_state
            .metrics
            .set_resources_by_state(CONTROLLER, &state, count);
    }
    Ok(())
}

/// Error policy for the RegistryProxy controller.
pub fn error_policy(obj: Arc<RegistryProxy>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_error(CONTROLLER, &namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(std::time::Duration::from_secs(300))
    }
}

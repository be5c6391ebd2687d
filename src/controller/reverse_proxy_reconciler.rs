//! Reconciliation loop for the legacy ImagePullReverseProxy.

use std::sync::Arc;
use std::time::Instant;

use kube::{ResourceExt, runtime::controller::Action};
use tracing::{debug, error, info, warn};

use crate::controller::context::Context;
use crate::controller::engine::run;
use crate::controller::error::Error;
use crate::controller::reverse_proxy_states::{ReverseProxyMachine, ReverseProxyState};
use crate::crd::ImagePullReverseProxy;

/// Controller name used in metrics.
pub const CONTROLLER: &str = "imagepullreverseproxy";

pub async fn reconcile(obj: Arc<ImagePullReverseProxy>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    info!(name = %name, namespace = %namespace, "reconciliation started");

    if obj.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let store = ctx.store();
    let mut machine = ReverseProxyMachine::new((*obj).clone(), ctx.collaborators(&store));
    let outcome = run(&mut machine, ReverseProxyState::ValidateDependency, &ctx.cancel).await;
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
    }

    info!(name = %name, namespace = %namespace, requeue = %signal, "reconciliation done");
    Ok(signal.into_action(ctx.config.resync_interval))
}

pub fn error_policy(obj: Arc<ImagePullReverseProxy>, error: &Error, ctx: Arc<Context>) -> Action {
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

//! Cluster-wide singleton election for RegistryProxy.
//!
//! Only one RegistryProxy is served. While a served peer exists, including
//! one that is still uninstalling, every other instance is marked redundant
//! and stays inert. Without one, the oldest contender wins and younger ones
//! wait for it. When the served instance goes away, redundant peers are reset
//! and re-arbitrated.

use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::error::Result;
use crate::controller::store::ObjectStore;
use crate::crd::{RegistryProxy, Served};

/// Outcome of arbitrating one candidate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Election {
    Served,
    /// Another instance holds the role.
    Redundant {
        /// `<namespace>/<name>` of the served peer.
        served_peer: String,
    },
    /// An older contender goes first; nothing is recorded yet.
    Deferred {
        /// `<namespace>/<name>` of the older contender.
        peer: String,
    },
}

fn key(rp: &RegistryProxy) -> String {
    format!("{}/{}", rp.namespace().unwrap_or_default(), rp.name_any())
}

fn same_object(a: &RegistryProxy, b: &RegistryProxy) -> bool {
    match (a.uid(), b.uid()) {
        (Some(a), Some(b)) => a == b,
        _ => key(a) == key(b),
    }
}

/// Ordering among contenders: older first, then by namespace/name.
fn precedes(a: &RegistryProxy, b: &RegistryProxy) -> bool {
    let created = |rp: &RegistryProxy| rp.creation_timestamp().map(|t| t.0);
    match (created(a), created(b)) {
        (Some(ta), Some(tb)) if ta != tb => ta < tb,
        _ => key(a) < key(b),
    }
}

/// Decide whether `candidate` may become the served instance.
///
/// A peer marked served always wins, even while it is being deleted: its
/// uninstall still owns the module objects. Otherwise every instance that is
/// not being deleted contends and the oldest wins, so concurrent ticks agree
/// on one instance. A younger contender is deferred rather than marked
/// redundant, because the older one may go away before it is arbitrated.
pub fn elect(candidate: &RegistryProxy, peers: &[RegistryProxy]) -> Election {
    let others = || peers.iter().filter(|peer| !same_object(peer, candidate));

    if let Some(served) = others().find(|peer| peer.served() == Some(Served::True)) {
        return Election::Redundant {
            served_peer: key(served),
        };
    }

    if let Some(older) = others()
        .filter(|peer| peer.metadata.deletion_timestamp.is_none())
        .filter(|peer| precedes(peer, candidate))
        .reduce(|oldest, peer| if precedes(peer, oldest) { peer } else { oldest })
    {
        return Election::Deferred { peer: key(older) };
    }

    Election::Served
}

/// Whether a peer other than `candidate` is marked served.
pub fn served_peer_exists(candidate: &RegistryProxy, peers: &[RegistryProxy]) -> bool {
    peers
        .iter()
        .filter(|peer| !same_object(peer, candidate))
        .any(|peer| peer.served() == Some(Served::True))
}

/// Message recorded on a redundant instance.
pub fn duplicate_message(served_peer: &str) -> String {
    format!(
        "Only one instance of RegistryProxy is allowed (current served instance: {served_peer}). \
         This RegistryProxy CR is redundant. Remove it to fix the problem."
    )
}

/// Sender half of the "reconcile every RegistryProxy" trigger.
#[derive(Clone, Debug, Default)]
pub struct ReconcileAllTrigger {
    tx: Option<UnboundedSender<()>>,
}

impl ReconcileAllTrigger {
    /// Create a trigger and the stream to pass to `Controller::reconcile_all_on`.
    pub fn channel() -> (Self, UnboundedReceiver<()>) {
        let (tx, rx) = unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// Request a reconcile of all instances.
    pub fn fire(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.unbounded_send(()).is_err() {
            warn!("reconcile-all receiver dropped");
        }
    }
}

/// Reset redundant peers of a served instance that is going away, so the
/// next reconcile elects one of them.
///
/// The trigger fires even when a reset fails; redundant peers re-check the
/// role on their next tick. Returns the number of peers reset.
pub async fn release_redundant_peers<S: ObjectStore>(
    store: &S,
    released: &RegistryProxy,
    trigger: &ReconcileAllTrigger,
) -> Result<usize> {
    let outcome = reset_redundant_peers(store, released).await;
    trigger.fire();
    if let Ok(reset) = outcome {
        info!(released = %key(released), reset, "served RegistryProxy removed, re-arbitrating peers");
    }
    outcome
}

async fn reset_redundant_peers<S: ObjectStore>(store: &S, released: &RegistryProxy) -> Result<usize> {
    let peers: Vec<RegistryProxy> = store.list(None, None).await?;
    let mut reset = 0;

    for peer in peers
        .iter()
        .filter(|peer| !same_object(peer, released))
        .filter(|peer| peer.served() == Some(Served::False))
        .filter(|peer| peer.metadata.deletion_timestamp.is_none())
    {
        let mut status = peer.status.clone().unwrap_or_default();
        status.served = None;
        status.state = None;
        store.update_status(peer, &status).await?;
        debug!(peer = %key(peer), "reset redundant RegistryProxy");
        reset += 1;
    }
    Ok(reset)
}

//! PeerAuthentication generation.
//!
//! Proxy pods run with an Istio sidecar but receive plain-text traffic from
//! kubelets, so mTLS is relaxed to PERMISSIVE for them.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

use crate::crd::{
    MtlsMode, PeerAuthentication, PeerAuthenticationMtls, PeerAuthenticationSpec,
    WorkloadSelector,
};
use crate::resources::common::{ManagedResource, owned_metadata, selector_labels, standard_labels};

/// Generate the PeerAuthentication selecting the proxy pods of `owner`.
pub fn generate_peer_authentication<K>(owner: &K) -> PeerAuthentication
where
    K: Resource<DynamicType = ()>,
{
    let meta = owned_metadata(owner, Default::default());
    let name = meta.name.clone().unwrap_or_default();

    PeerAuthentication {
        metadata: ObjectMeta {
            labels: Some(standard_labels(&name, ManagedResource::PeerAuthentication)),
            ..meta
        },
        spec: PeerAuthenticationSpec {
            selector: Some(WorkloadSelector {
                match_labels: selector_labels(&name),
            }),
            mtls: Some(PeerAuthenticationMtls {
                mode: MtlsMode::Permissive,
            }),
        },
    }
}

pub fn peer_authentication_changed(current: &PeerAuthentication, desired: &PeerAuthentication) -> bool {
    current.spec.mtls != desired.spec.mtls || current.spec.selector != desired.spec.selector
}

pub fn adopt_peer_authentication(current: &mut PeerAuthentication, desired: &PeerAuthentication) {
    current.spec.mtls.clone_from(&desired.spec.mtls);
    current.spec.selector.clone_from(&desired.spec.selector);
}

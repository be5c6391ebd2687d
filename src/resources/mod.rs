//! Resource generation module.
//!
//! Desired-state builders for the objects a proxy workload consists of.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | Deployment | Reverse proxy (and authorization pass-through) pods |
//! | Service | NodePort exposing the proxy to kubelets |
//! | PeerAuthentication | PERMISSIVE mTLS for the proxy pods when Istio is installed |

pub mod common;
pub mod deployment;
pub mod peer_authentication;
pub mod services;

// Re-export commonly used items from common
pub use common::{owner_reference, standard_labels};

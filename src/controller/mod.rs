//! Controller module for registry-proxy-operator.
//!
//! Contains the state machine engine, the three state chains built on it,
//! their reconcilers and the collaborators the chains talk to.
//!
//! Three controllers share the engine:
//! - RegistryProxy controller (operator_* modules)
//! - Connection controller (connection_* modules)
//! - ImagePullReverseProxy controller (reverse_proxy_* modules)

// Shared modules
pub mod arbiter;
pub mod context;
pub mod converge;
pub mod engine;
pub mod error;
pub mod finalizer;
pub mod installer;
pub mod manifest;
pub mod probe;
pub mod proxy_url;
pub mod readiness;
pub mod status;
pub mod store;

// RegistryProxy controller
pub mod operator_reconciler;
pub mod operator_states;

// Connection controller
pub mod connection_reconciler;
pub mod connection_states;

// ImagePullReverseProxy controller
pub mod reverse_proxy_reconciler;
pub mod reverse_proxy_states;

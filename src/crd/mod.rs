//! Custom Resource Definitions (CRDs) for registry-proxy-operator.
//!
//! - `RegistryProxy`: installs the registry-proxy module (one served instance per cluster)
//! - `Connection`: per-tenant registry reverse proxy
//! - `ImagePullReverseProxy`: legacy single-container reverse proxy
//! - `ConnectivityProxy`, `PeerAuthentication`: kinds owned by other components

mod condition;
mod connection;
mod external;
mod image_pull_reverse_proxy;
mod registry_proxy;

pub use condition::*;
pub use connection::*;
pub use external::*;
pub use image_pull_reverse_proxy::*;
pub use registry_proxy::*;

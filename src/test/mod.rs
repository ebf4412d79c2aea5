//! Building blocks for testing the cert operator

pub mod kube;

pub mod prelude {
    pub use super::assertions::ResourceAssertions;
    pub use super::cleanup::{CleanupEntry, CleanupOptions, CleanupRegistry};
    pub use super::error::{CleanupError, HarnessError, PollError, PollTimeout, StoreError};
    pub use super::kube::{KubeClient, TestKubeClient};
    pub use super::logging::init_logging;
    pub use super::memory::InMemoryStore;
    pub use super::poll::{poll, PollOutcome};
    pub use super::route::{setup_route_crd, Route, RouteSpec};
    pub use super::store::{annotation, to_dynamic, ResourceRef, ResourceStore};

    pub use ::kube::api::DynamicObject;
    pub use spectral::prelude::*;
}

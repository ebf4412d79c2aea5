//! Scenarios which exercise the cert operator

pub mod config;
pub mod resources;
pub mod setup;

pub mod prelude {
    pub use super::config::{
        ScenarioConfig, Timeouts, STATUS_ANNOTATION, STATUS_NEW, STATUS_SECURED,
    };
    pub use super::setup::{
        prepare_cluster, route_basic, run_concurrently, service_basic, Scenario, ScenarioContext,
        ScenarioPhase, ScenarioReport, SubScenario, SubScenarioReport,
    };
}

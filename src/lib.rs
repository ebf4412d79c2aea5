//! End-to-end test harness for the cert operator
//!
//! The cert operator watches routes and services. Whenever one of them is
//! annotated with `openshift.io/cert-ctl-status: new`, the operator
//! provides a certificate and eventually sets the annotation to `secured`.
//! This crate verifies that behavior against a running cluster.
//!
//! ## Usage
//!
//! Add the dependency to your `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! cert-operator-e2e = { path = "../cert-operator-e2e" }
//! ```
//!
//! Then `use` the prelude modules in your test files:
//!
//! ```rust
//! use cert_operator_e2e::operator::prelude::*;
//! use cert_operator_e2e::test::prelude::*;
//! ```
//!
//! ## Example
//!
//! A [`operator::setup::Scenario`] creates its own namespace, deploys the
//! operator into it, waits until the operator is available and then runs
//! its sub-scenarios. Every resource created on the way is deleted when the
//! scenario ends, also if a sub-scenario fails or panics. Independent
//! scenarios run concurrently.
//!
//! ```rust,no_run
//! use cert_operator_e2e::operator::prelude::*;
//! use cert_operator_e2e::test::prelude::*;
//!
//! #[test]
//! fn operator_should_secure_routes_and_services() -> anyhow::Result<()> {
//!     init_logging();
//!     let client = TestKubeClient::new()?;
//!     let config = ScenarioConfig::from_env()?;
//!     prepare_cluster(&client, &config);
//!
//!     let scenarios = [
//!         Scenario::cert_operator("Cluster", config.clone()),
//!         Scenario::cert_operator("Cluster2", config),
//!     ];
//!
//!     for report in run_concurrently(&client, &scenarios) {
//!         report.into_result()?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Without a cluster, [`test::memory::InMemoryStore`] can stand in for the
//! Kubernetes API, with a reconciler callback playing the operator.

pub mod operator;
pub mod test;

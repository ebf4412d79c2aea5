//! Configuration of test scenarios
//!
//! Every scenario receives its own [`ScenarioConfig`], so tests with
//! different timing profiles can run side by side. [`ScenarioConfig::from_env`]
//! applies overrides from `CERT_E2E_*` environment variables.

use crate::test::prelude::CleanupOptions;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Annotation which the cert operator uses to report its progress
pub const STATUS_ANNOTATION: &str = "openshift.io/cert-ctl-status";
/// Status of a resource which was not processed by the operator yet
pub const STATUS_NEW: &str = "new";
/// Status of a resource for which the operator provided a certificate
pub const STATUS_SECURED: &str = "secured";

/// Timeouts and retry intervals of a scenario
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timeouts {
    /// Interval between two checks of a condition
    pub retry_interval: Duration,
    /// Maximum time to wait for a condition
    pub timeout: Duration,
    pub cleanup_retry_interval: Duration,
    pub cleanup_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            retry_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
            cleanup_retry_interval: Duration::from_secs(1),
            cleanup_timeout: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    pub fn cleanup_options(&self) -> CleanupOptions {
        CleanupOptions {
            timeout: self.cleanup_timeout,
            retry_interval: self.cleanup_retry_interval,
            wait_for_deletion: true,
        }
    }

    /// A namespace stays terminating until its content is gone, so only the
    /// deletion request is awaited.
    pub fn namespace_cleanup_options(&self) -> CleanupOptions {
        self.cleanup_options().without_waiting()
    }
}

/// Settings of a scenario
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScenarioConfig {
    /// Prefix of the generated namespace names
    pub namespace_prefix: String,
    /// Name of the deployment which runs the operator under test
    pub operator_deployment: String,
    /// Number of available replicas the operator deployment must reach
    pub operator_replicas: i32,
    /// Image of the operator, used by the built-in baseline manifest
    pub operator_image: String,
    /// Multi-document YAML file which replaces the built-in baseline manifest
    pub namespaced_manifest: Option<PathBuf>,
    /// Whether the `Route` CRD must be registered before the scenarios start
    pub install_route_crd: bool,
    pub timeouts: Timeouts,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            namespace_prefix: String::from("cert-e2e"),
            operator_deployment: String::from("cert-operator"),
            operator_replicas: 1,
            operator_image: String::from("cert-operator:latest"),
            namespaced_manifest: None,
            install_route_crd: false,
            timeouts: Timeouts::default(),
        }
    }
}

impl ScenarioConfig {
    /// Returns the default configuration with overrides from the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Returns the default configuration with overrides provided by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ScenarioConfig::default();

        if let Some(prefix) = lookup("CERT_E2E_NAMESPACE_PREFIX") {
            config.namespace_prefix = prefix;
        }
        if let Some(deployment) = lookup("CERT_E2E_OPERATOR_DEPLOYMENT") {
            config.operator_deployment = deployment;
        }
        if let Some(replicas) = parse(&lookup, "CERT_E2E_OPERATOR_REPLICAS")? {
            config.operator_replicas = replicas;
        }
        if let Some(image) = lookup("CERT_E2E_OPERATOR_IMAGE") {
            config.operator_image = image;
        }
        if let Some(manifest) = lookup("CERT_E2E_NAMESPACED_MANIFEST") {
            config.namespaced_manifest = Some(PathBuf::from(manifest));
        }
        if let Some(install) = parse(&lookup, "CERT_E2E_INSTALL_ROUTE_CRD")? {
            config.install_route_crd = install;
        }

        let timeouts = &mut config.timeouts;
        if let Some(secs) = parse(&lookup, "CERT_E2E_RETRY_INTERVAL_SECS")? {
            timeouts.retry_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "CERT_E2E_TIMEOUT_SECS")? {
            timeouts.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "CERT_E2E_CLEANUP_RETRY_INTERVAL_SECS")? {
            timeouts.cleanup_retry_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "CERT_E2E_CLEANUP_TIMEOUT_SECS")? {
            timeouts.cleanup_timeout = Duration::from_secs(secs);
        }

        if config.operator_replicas < 0 {
            return Err(anyhow!(
                "CERT_E2E_OPERATOR_REPLICAS must not be negative but is [{}]",
                config.operator_replicas
            ));
        }

        Ok(config)
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .with_context(|| format!("{} has an invalid value [{}]", key, value))
        })
        .transpose()
}

use super::config::{ScenarioConfig, STATUS_ANNOTATION, STATUS_SECURED};
use super::resources;
use crate::test::prelude::{
    annotation, poll, setup_route_crd, CleanupError, CleanupOptions, CleanupRegistry,
    HarnessError, PollOutcome, ResourceRef, ResourceStore, StoreError, TestKubeClient,
};

use kube::api::DynamicObject;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_NAMESPACE_LEN: usize = 63;
const FALLBACK_NAMESPACE_BASE: &str = "e2e";

/// Phases which a scenario runs through
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScenarioPhase {
    Initializing,
    AwaitingControllerReady,
    RunningSubScenarios,
    Cleanup,
    Done,
}

/// A named step which runs after the operator became ready
pub struct SubScenario {
    name: String,
    run: Box<dyn Fn(&mut ScenarioContext<'_>) -> Result<(), HarnessError> + Send + Sync>,
}

impl SubScenario {
    pub fn new<F>(name: &str, run: F) -> Self
    where
        F: Fn(&mut ScenarioContext<'_>) -> Result<(), HarnessError> + Send + Sync + 'static,
    {
        SubScenario {
            name: name.to_string(),
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for SubScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubScenario")
            .field("name", &self.name)
            .finish()
    }
}

/// Result of a sub-scenario
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubScenarioReport {
    pub name: String,
    pub passed: bool,
    pub elapsed: Duration,
}

/// Everything that is known about a finished scenario
#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    pub namespace: String,
    /// The phase in which the scenario failed, if it did
    pub failed_in: Option<ScenarioPhase>,
    pub sub_scenarios: Vec<SubScenarioReport>,
    /// Resources which were registered for cleanup, in order of creation
    pub registered: Vec<ResourceRef>,
    pub outcome: Result<(), HarnessError>,
    pub cleanup_errors: Vec<CleanupError>,
}

impl ScenarioReport {
    fn new(name: &str, namespace: &str) -> Self {
        ScenarioReport {
            name: name.to_string(),
            namespace: namespace.to_string(),
            failed_in: None,
            sub_scenarios: Vec::new(),
            registered: Vec::new(),
            outcome: Ok(()),
            cleanup_errors: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Converts the report into a result which fails if the scenario failed.
    ///
    /// Cleanup errors do not fail a scenario.
    pub fn into_result(self) -> anyhow::Result<()> {
        let name = self.name;
        let namespace = self.namespace;
        self.outcome.map_err(|error| {
            anyhow::Error::new(error)
                .context(format!("Scenario [{}] in namespace [{}] failed", name, namespace))
        })
    }
}

/// State of a running scenario
///
/// The context owns the [`CleanupRegistry`] of the scenario. All resources
/// registered in it are deleted by [`ScenarioContext::cleanup`] or, if the
/// scenario ends early or panics, when the context is dropped.
pub struct ScenarioContext<'a> {
    store: &'a dyn ResourceStore,
    scenario: String,
    namespace: String,
    config: ScenarioConfig,
    registry: CleanupRegistry,
    registered: Vec<ResourceRef>,
}

impl<'a> ScenarioContext<'a> {
    /// Creates a context with a freshly generated namespace name.
    ///
    /// Nothing is created in the store yet.
    pub fn new(store: &'a dyn ResourceStore, scenario: &str, config: ScenarioConfig) -> Self {
        let namespace = unique_namespace(&config.namespace_prefix, scenario);
        ScenarioContext {
            store,
            scenario: scenario.to_string(),
            namespace,
            config,
            registry: CleanupRegistry::new(),
            registered: Vec::new(),
        }
    }

    pub fn store(&self) -> &'a dyn ResourceStore {
        self.store
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// Creates the given object and registers it for cleanup once the
    /// creation succeeded.
    pub fn create(&mut self, object: &DynamicObject) -> Result<ResourceRef, StoreError> {
        let options = self.config.timeouts.cleanup_options();
        self.create_with(object, options)
    }

    fn create_with(
        &mut self,
        object: &DynamicObject,
        options: CleanupOptions,
    ) -> Result<ResourceRef, StoreError> {
        let reference = ResourceRef::of(object)?;

        self.store.create(object)?;
        info!(scenario = %self.scenario, resource = %reference, "Created");

        self.registry.register(reference.clone(), options);
        self.registered.push(reference.clone());
        Ok(reference)
    }

    /// Creates the namespace of the scenario and the resources which the
    /// operator needs to run in it.
    pub fn initialize_cluster_resources(&mut self) -> Result<(), HarnessError> {
        let namespace = resources::namespace(&self.namespace)
            .map_err(|error| HarnessError::setup("building the namespace", error))?;
        let options = self.config.timeouts.namespace_cleanup_options();
        self.create_with(&namespace, options).map_err(|error| {
            HarnessError::setup(format!("creating namespace [{}]", self.namespace), error)
        })?;

        let objects = resources::baseline(&self.config, &self.namespace)
            .map_err(|error| HarnessError::setup("loading the baseline manifest", error))?;
        for object in &objects {
            self.create(object).map_err(|error| {
                HarnessError::setup("creating the baseline resources", error)
            })?;
        }

        info!(
            scenario = %self.scenario,
            namespace = %self.namespace,
            resources = objects.len(),
            "Initialized cluster resources"
        );
        Ok(())
    }

    /// Waits until the operator deployment has the configured number of
    /// available replicas.
    pub fn wait_for_operator_deployment(&self) -> Result<PollOutcome, HarnessError> {
        let name = &self.config.operator_deployment;
        let replicas = i64::from(self.config.operator_replicas);
        let reference = ResourceRef::namespaced("apps/v1", "Deployment", &self.namespace, name);
        let timeouts = &self.config.timeouts;

        let outcome = poll(timeouts.retry_interval, timeouts.timeout, || {
            match self.store.get(&reference) {
                Ok(deployment) => {
                    let available = available_replicas(&deployment);
                    if available >= replicas {
                        return Ok(true);
                    }
                    debug!(
                        scenario = %self.scenario,
                        "Waiting for full availability of {} deployment ({}/{})",
                        name,
                        available,
                        replicas
                    );
                    Ok(false)
                }
                Err(error) if error.is_not_found() => {
                    debug!(
                        scenario = %self.scenario,
                        "Waiting for availability of {} deployment",
                        name
                    );
                    Ok(false)
                }
                Err(error) => Err(error),
            }
        })
        .map_err(|error| {
            HarnessError::from_poll(
                format!("{} replica(s) of deployment [{}]", replicas, name),
                error,
            )
        })?;

        info!(
            scenario = %self.scenario,
            attempts = outcome.attempts,
            "Deployment {} available ({}/{})",
            name,
            replicas,
            replicas
        );
        Ok(outcome)
    }

    /// Waits until the referenced resource carries the annotation with the
    /// expected value.
    ///
    /// A resource which is not visible yet is polled again.
    pub fn wait_for_annotation(
        &self,
        resource: &ResourceRef,
        key: &str,
        expected_value: &str,
    ) -> Result<PollOutcome, HarnessError> {
        let timeouts = &self.config.timeouts;

        let outcome = poll(timeouts.retry_interval, timeouts.timeout, || {
            match self.store.get(resource) {
                Ok(object) => {
                    let current = annotation(&object, key);
                    if current == Some(expected_value) {
                        return Ok(true);
                    }
                    debug!(
                        scenario = %self.scenario,
                        "Waiting for operator to reconcile {} (current {:?}; want {})",
                        resource,
                        current,
                        expected_value
                    );
                    Ok(false)
                }
                Err(error) if error.is_not_found() => {
                    debug!(scenario = %self.scenario, "Waiting for availability of {}", resource);
                    Ok(false)
                }
                Err(error) => Err(error),
            }
        })
        .map_err(|error| {
            HarnessError::from_poll(
                format!("annotation [{}={}] on [{}]", key, expected_value, resource),
                error,
            )
        })?;

        info!(
            scenario = %self.scenario,
            attempts = outcome.attempts,
            "{} reconciled",
            resource
        );
        Ok(outcome)
    }

    /// Deletes every registered resource and returns the failed deletions.
    pub fn cleanup(&mut self) -> Vec<CleanupError> {
        let store = self.store;
        let errors = self.registry.run_all(store);
        if !errors.is_empty() {
            warn!(
                scenario = %self.scenario,
                failed = errors.len(),
                "Some resources could not be cleaned up"
            );
        }
        errors
    }
}

impl<'a> Drop for ScenarioContext<'a> {
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            self.cleanup();
        }
    }
}

/// A top-level test unit
///
/// A scenario allocates its own namespace, creates the baseline resources,
/// waits for the operator and runs its sub-scenarios in the given order.
#[derive(Debug)]
pub struct Scenario {
    name: String,
    config: ScenarioConfig,
    sub_scenarios: Vec<SubScenario>,
}

impl Scenario {
    pub fn new(name: &str, config: ScenarioConfig) -> Self {
        Scenario {
            name: name.to_string(),
            config,
            sub_scenarios: Vec::new(),
        }
    }

    /// A scenario which checks that the operator secures routes and services.
    pub fn cert_operator(name: &str, config: ScenarioConfig) -> Self {
        Scenario::new(name, config)
            .with_sub_scenario(SubScenario::new("route_basic", route_basic))
            .with_sub_scenario(SubScenario::new("service_basic", service_basic))
    }

    pub fn with_sub_scenario(mut self, sub_scenario: SubScenario) -> Self {
        self.sub_scenarios.push(sub_scenario);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the scenario on the calling thread.
    ///
    /// The registered resources are cleaned up in any case, also if a
    /// sub-scenario panics.
    pub fn run(&self, store: &dyn ResourceStore) -> ScenarioReport {
        let mut context = ScenarioContext::new(store, &self.name, self.config.clone());
        let mut report = ScenarioReport::new(&self.name, context.namespace());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute(&mut context, &mut report)
        }))
        .unwrap_or_else(|_| {
            error!(scenario = %self.name, "Scenario panicked");
            Err(HarnessError::Panicked(self.name.clone()))
        });

        self.enter(ScenarioPhase::Cleanup, &context);
        report.registered = context.registered.clone();
        report.cleanup_errors = context.cleanup();

        self.enter(ScenarioPhase::Done, &context);
        match &outcome {
            Ok(()) => info!(scenario = %self.name, "Scenario passed"),
            Err(error) => error!(scenario = %self.name, "Scenario failed: {}", error),
        }
        report.outcome = outcome;
        report
    }

    fn execute(
        &self,
        context: &mut ScenarioContext<'_>,
        report: &mut ScenarioReport,
    ) -> Result<(), HarnessError> {
        self.enter(ScenarioPhase::Initializing, context);
        report.failed_in = Some(ScenarioPhase::Initializing);
        context.initialize_cluster_resources()?;

        self.enter(ScenarioPhase::AwaitingControllerReady, context);
        report.failed_in = Some(ScenarioPhase::AwaitingControllerReady);
        context.wait_for_operator_deployment()?;

        self.enter(ScenarioPhase::RunningSubScenarios, context);
        report.failed_in = Some(ScenarioPhase::RunningSubScenarios);
        for sub_scenario in &self.sub_scenarios {
            let start = Instant::now();
            let result = (sub_scenario.run)(context);

            report.sub_scenarios.push(SubScenarioReport {
                name: sub_scenario.name.clone(),
                passed: result.is_ok(),
                elapsed: start.elapsed(),
            });
            result?;
            info!(scenario = %self.name, "Sub-scenario {} passed", sub_scenario.name);
        }

        report.failed_in = None;
        Ok(())
    }

    fn enter(&self, phase: ScenarioPhase, context: &ScenarioContext<'_>) {
        info!(scenario = %self.name, namespace = %context.namespace(), ?phase, "Entering phase");
    }
}

/// Runs every scenario on its own thread and returns their reports in the
/// given order.
///
/// Scenarios are isolated by their namespaces; the failure or panic of one
/// scenario does not affect the others.
pub fn run_concurrently(store: &dyn ResourceStore, scenarios: &[Scenario]) -> Vec<ScenarioReport> {
    thread::scope(|scope| {
        let handles: Vec<_> = scenarios
            .iter()
            .map(|scenario| (scenario, scope.spawn(move || scenario.run(store))))
            .collect();

        handles
            .into_iter()
            .map(|(scenario, handle)| {
                handle.join().unwrap_or_else(|_| {
                    let mut report = ScenarioReport::new(&scenario.name, "");
                    report.outcome = Err(HarnessError::Panicked(scenario.name.clone()));
                    report
                })
            })
            .collect()
    })
}

/// Registers the `Route` CRD if the configuration asks for it.
///
/// Must be called once before scenarios run against a cluster which does
/// not serve routes natively.
pub fn prepare_cluster(client: &TestKubeClient, config: &ScenarioConfig) {
    if config.install_route_crd {
        setup_route_crd(client);
    }
}

/// Creates a route and waits until the operator secured it.
pub fn route_basic(context: &mut ScenarioContext<'_>) -> Result<(), HarnessError> {
    let route = resources::route_tls(context.namespace())?;
    expect_secured(context, &route)
}

/// Creates a service and waits until the operator secured it.
pub fn service_basic(context: &mut ScenarioContext<'_>) -> Result<(), HarnessError> {
    let service = resources::example_service(context.namespace())?;
    expect_secured(context, &service)
}

fn expect_secured(
    context: &mut ScenarioContext<'_>,
    object: &DynamicObject,
) -> Result<(), HarnessError> {
    let reference = context.create(object)?;
    context.wait_for_annotation(&reference, STATUS_ANNOTATION, STATUS_SECURED)?;
    Ok(())
}

fn available_replicas(deployment: &DynamicObject) -> i64 {
    deployment.data["status"]["availableReplicas"]
        .as_i64()
        .unwrap_or_default()
}

/// Returns a namespace name made of the prefix, the scenario name and a
/// random suffix which is a valid DNS label.
fn unique_namespace(prefix: &str, scenario: &str) -> String {
    let uid = format!("{:08x}", Uuid::new_v4().as_fields().0);

    let mut base = String::new();
    for c in format!("{}-{}", prefix, scenario).to_lowercase().chars() {
        let c = if c.is_ascii_alphanumeric() { c } else { '-' };
        if c != '-' || !base.ends_with('-') {
            base.push(c);
        }
    }
    // MAX_NAMESPACE_LEN - uid.len() - 1 (for the "-")
    let max_len = MAX_NAMESPACE_LEN - uid.len() - 1;
    let mut base = base[..base.len().min(max_len)].trim_matches('-');
    if base.is_empty() {
        base = FALLBACK_NAMESPACE_BASE;
    }

    format!("{}-{}", base, uid)
}

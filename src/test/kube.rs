//! Clients for interacting with the Kubernetes API
//!
//! These clients give the harness access to a real cluster.

use super::error::StoreError;
use super::store::{ResourceRef, ResourceStore};
use anyhow::{anyhow, Result};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionCondition,
};
use kube::api::{
    Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams, PropagationPolicy,
    WatchEvent, WatchParams,
};
use kube::{Client, ResourceExt};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::info;

const FIELD_MANAGER: &str = "cert_operator_e2e";

/// A client for interacting with the Kubernetes API
///
/// [`TestKubeClient`] is a synchronous version of [`KubeClient`]. It
/// implements [`ResourceStore`] so that scenarios can block on it from
/// their own threads.
pub struct TestKubeClient {
    runtime: Runtime,
    kube_client: KubeClient,
}

impl TestKubeClient {
    /// Creates a [`TestKubeClient`] from the default kubeconfig.
    pub fn new() -> Result<TestKubeClient> {
        let runtime = Runtime::new()?;
        let kube_client = runtime.block_on(KubeClient::new())?;
        Ok(TestKubeClient {
            runtime,
            kube_client,
        })
    }

    /// Applies the given custom resource definition and blocks until it is accepted.
    pub fn apply_crd(&self, crd: &CustomResourceDefinition) {
        self.runtime.block_on(async {
            self.kube_client
                .apply_crd(crd)
                .await
                .expect("Custom resource definition could not be applied")
        })
    }
}

impl ResourceStore for TestKubeClient {
    fn create(&self, object: &DynamicObject) -> Result<DynamicObject, StoreError> {
        self.runtime.block_on(self.kube_client.create(object))
    }

    fn get(&self, reference: &ResourceRef) -> Result<DynamicObject, StoreError> {
        self.runtime.block_on(self.kube_client.get(reference))
    }

    fn delete(&self, reference: &ResourceRef) -> Result<(), StoreError> {
        self.runtime.block_on(self.kube_client.delete(reference))
    }
}

/// A client for interacting with the Kubernetes API
///
/// [`KubeClient`] wraps a [`Client`][kube::Client] and addresses every
/// resource dynamically by its [`ResourceRef`].
pub struct KubeClient {
    client: Client,
    apply_crd_timeout: Duration,
}

impl KubeClient {
    /// Creates a [`KubeClient`].
    pub async fn new() -> Result<KubeClient> {
        let client = Client::try_default().await?;
        Ok(KubeClient {
            client,
            apply_crd_timeout: Duration::from_secs(30),
        })
    }

    fn api(&self, reference: &ResourceRef) -> Api<DynamicObject> {
        let api_resource = reference.api_resource();
        match &reference.namespace {
            Some(namespace) => {
                Api::namespaced_with(self.client.clone(), namespace, &api_resource)
            }
            None => Api::all_with(self.client.clone(), &api_resource),
        }
    }

    /// Applies the given custom resource definition and awaits the accepted status.
    pub async fn apply_crd(&self, crd: &CustomResourceDefinition) -> Result<()> {
        let is_ready = |crd: &CustomResourceDefinition| {
            get_crd_conditions(crd)
                .iter()
                .any(|condition| condition.type_ == "NamesAccepted" && condition.status == "True")
        };

        let name = crd.name_any();
        let timeout_secs = self.apply_crd_timeout.as_secs() as u32;
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());

        let wp = WatchParams::default()
            .fields(&format!("metadata.name={}", name))
            .timeout(timeout_secs);
        let mut stream = crds.watch(&wp, "0").await?.boxed();

        let apply_params = PatchParams::apply(FIELD_MANAGER).force();
        crds.patch(&name, &apply_params, &Patch::Apply(crd)).await?;

        if crds.get(&name).await.map(|crd| is_ready(&crd))? {
            info!(crd = %name, "Custom resource definition applied");
            return Ok(());
        }

        while let Some(event) = stream.try_next().await? {
            if let WatchEvent::Added(crd) | WatchEvent::Modified(crd) = event {
                if is_ready(&crd) {
                    info!(crd = %name, "Custom resource definition applied");
                    return Ok(());
                }
            }
        }

        Err(anyhow!(
            "Custom resource definition [{}] could not be applied within {} seconds.",
            name,
            timeout_secs
        ))
    }

    /// Creates the given object.
    pub async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let reference = ResourceRef::of(object)?;
        self.api(&reference)
            .create(&PostParams::default(), object)
            .await
            .map_err(|error| StoreError::from_kube(error, &reference))
    }

    /// Returns the current state of the referenced object.
    pub async fn get(&self, reference: &ResourceRef) -> Result<DynamicObject, StoreError> {
        self.api(reference)
            .get(&reference.name)
            .await
            .map_err(|error| StoreError::from_kube(error, reference))
    }

    /// Requests the deletion of the referenced object.
    ///
    /// Dependents are removed in the background, so the object may still
    /// be visible for a while after this call returned.
    pub async fn delete(&self, reference: &ResourceRef) -> Result<(), StoreError> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        self.api(reference)
            .delete(&reference.name, &params)
            .await
            .map(|_| ())
            .map_err(|error| StoreError::from_kube(error, reference))
    }
}

/// Returns the conditions of the given custom resource definition.
pub fn get_crd_conditions(
    crd: &CustomResourceDefinition,
) -> Vec<CustomResourceDefinitionCondition> {
    if let Some(status) = &crd.status {
        status.conditions.clone().unwrap_or_default()
    } else {
        vec![]
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinitionStatus;
    use spectral::prelude::*;

    #[test]
    fn crd_without_status_should_have_no_conditions() {
        let crd = CustomResourceDefinition::default();

        assert_that(&get_crd_conditions(&crd)).is_empty();
    }

    #[test]
    fn crd_conditions_should_be_taken_from_the_status() {
        let crd = CustomResourceDefinition {
            status: Some(CustomResourceDefinitionStatus {
                conditions: Some(vec![CustomResourceDefinitionCondition {
                    type_: String::from("NamesAccepted"),
                    status: String::from("True"),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_that(&get_crd_conditions(&crd)).has_length(1);
    }
}

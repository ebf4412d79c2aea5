//! Resources used by the cert operator scenarios

use super::config::{ScenarioConfig, STATUS_ANNOTATION, STATUS_NEW};
use crate::test::prelude::{to_dynamic, Route, StoreError};
use anyhow::{Context, Result};
use indoc::formatdoc;
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::api::DynamicObject;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Kinds which are never namespaced and therefore keep their manifest scope
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "Namespace",
];

/// Deserializes the given YAML text into the desired type.
pub fn from_yaml<T>(yaml: &str) -> Result<T, serde_yaml::Error>
where
    T: DeserializeOwned,
{
    serde_yaml::from_str(yaml)
}

/// Deserializes every non-empty document of a multi-document YAML text.
pub fn from_yaml_documents(yaml: &str) -> Result<Vec<DynamicObject>, serde_yaml::Error> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document)?;
        if !value.is_null() {
            objects.push(serde_yaml::from_value(value)?);
        }
    }
    Ok(objects)
}

pub fn namespace(name: &str) -> Result<DynamicObject, StoreError> {
    let namespace: Namespace = from_yaml(&formatdoc!(
        "
            apiVersion: v1
            kind: Namespace
            metadata:
              name: {name}
              labels:
                app.kubernetes.io/managed-by: cert-operator-e2e
        "
    ))
    .map_err(|error| StoreError::Invalid(error.to_string()))?;
    to_dynamic(&namespace)
}

/// An edge terminated route which the operator is expected to secure
pub fn route_tls(namespace: &str) -> Result<DynamicObject, StoreError> {
    let route: Route = from_yaml(&formatdoc!(
        "
            apiVersion: route.openshift.io/v1
            kind: Route
            metadata:
              name: route-tls
              namespace: {namespace}
              annotations:
                {STATUS_ANNOTATION}: {STATUS_NEW}
            spec:
              host: route-tls.{namespace}.example.com
              tls:
                termination: edge
              to:
                kind: Service
                name: myservice
        "
    ))
    .map_err(|error| StoreError::Invalid(error.to_string()))?;
    to_dynamic(&route)
}

/// A cluster IP service which the operator is expected to secure
pub fn example_service(namespace: &str) -> Result<DynamicObject, StoreError> {
    let service: Service = from_yaml(&formatdoc!(
        "
            apiVersion: v1
            kind: Service
            metadata:
              name: example-service
              namespace: {namespace}
              annotations:
                {STATUS_ANNOTATION}: {STATUS_NEW}
            spec:
              type: ClusterIP
              selector:
                name: example-service
              ports:
                - name: web
                  port: 8080
                  protocol: TCP
                  targetPort: 8080
        "
    ))
    .map_err(|error| StoreError::Invalid(error.to_string()))?;
    to_dynamic(&service)
}

/// The built-in manifest with the permissions and the deployment of the operator
fn builtin_manifest(config: &ScenarioConfig) -> String {
    let operator = &config.operator_deployment;
    let image = &config.operator_image;
    let replicas = config.operator_replicas;

    formatdoc!(
        "
            apiVersion: v1
            kind: ServiceAccount
            metadata:
              name: {operator}
            ---
            apiVersion: rbac.authorization.k8s.io/v1
            kind: Role
            metadata:
              name: {operator}
            rules:
              - apiGroups: ['']
                resources: [services, secrets, configmaps, events]
                verbs: ['*']
              - apiGroups: [route.openshift.io]
                resources: [routes]
                verbs: ['*']
              - apiGroups: [apps]
                resources: [deployments, replicasets]
                verbs: [get, list, watch]
            ---
            apiVersion: rbac.authorization.k8s.io/v1
            kind: RoleBinding
            metadata:
              name: {operator}
            subjects:
              - kind: ServiceAccount
                name: {operator}
            roleRef:
              kind: Role
              name: {operator}
              apiGroup: rbac.authorization.k8s.io
            ---
            apiVersion: apps/v1
            kind: Deployment
            metadata:
              name: {operator}
            spec:
              replicas: {replicas}
              selector:
                matchLabels:
                  name: {operator}
              template:
                metadata:
                  labels:
                    name: {operator}
                spec:
                  serviceAccountName: {operator}
                  containers:
                    - name: {operator}
                      image: {image}
                      imagePullPolicy: IfNotPresent
                      env:
                        - name: WATCH_NAMESPACE
                          valueFrom:
                            fieldRef:
                              fieldPath: metadata.namespace
                        - name: OPERATOR_NAME
                          value: {operator}
        "
    )
}

/// Returns the resources which must exist before the operator can be
/// exercised, placed into the given namespace.
///
/// The manifest file of the configuration is used if one is given,
/// otherwise the built-in manifest.
pub fn baseline(config: &ScenarioConfig, namespace: &str) -> Result<Vec<DynamicObject>> {
    let manifest = match &config.namespaced_manifest {
        Some(path) => read_manifest(path)?,
        None => builtin_manifest(config),
    };

    let mut objects =
        from_yaml_documents(&manifest).context("Baseline manifest is not well-formed YAML")?;
    for object in &mut objects {
        if is_namespaced(object) && object.metadata.namespace.is_none() {
            object.metadata.namespace = Some(namespace.to_string());
        }
    }
    Ok(objects)
}

fn read_manifest(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("Manifest [{}] could not be read", path.display()))
}

fn is_namespaced(object: &DynamicObject) -> bool {
    object
        .types
        .as_ref()
        .map(|types| !CLUSTER_SCOPED_KINDS.contains(&types.kind.as_str()))
        .unwrap_or(true)
}

/*
 * Copyright (C) 2025 The Canaryop Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;

use crate::canaryop::controller::{Indexer, Reconciler};
use crate::canaryop::gateway::ClusterGateway;
use crate::canaryop::k8s::{ContainerSpec, DeploymentConfig, ObjectMeta, Pod};
use crate::canaryop::logger::{log_debug, log_info};
use crate::canaryop::operator::{
    get_name_and_image, ANNOTATION_CANARY_DURATION, ANNOTATION_CANARY_FAIL,
    ANNOTATION_CANARY_POD, DEFAULT_CANARY_DURATION, LABEL_CANARY, LABEL_CANARY_FOR,
    LABEL_DEPLOYMENTCONFIG,
};
use crate::canaryop::util::new_error;

const COMPONENT: &str = "deployment-reconciler";

/// Outcome of inspecting a workload for pending canary work.
#[derive(Debug)]
pub enum SpawnDecision {
    /// Spawn a canary with this container list (target image already swapped).
    Spawn(Vec<ContainerSpec>),
    /// Protocol state says leave the workload alone.
    NothingToDo,
    /// The workload's canary annotations are unusable; a human has to fix
    /// them, retrying won't.
    Invalid(String),
}

/// Decides whether a workload needs a canary spawned.
pub fn should_spawn(dc: &DeploymentConfig) -> SpawnDecision {
    if dc.metadata.annotations.contains_key(ANNOTATION_CANARY_POD) {
        log_debug(
            COMPONENT,
            "A canary pod already exists",
            &[("workload", dc.name())],
        );
        return SpawnDecision::NothingToDo;
    }

    if let Some(failed) = dc.metadata.annotations.get(ANNOTATION_CANARY_FAIL) {
        log_debug(
            COMPONENT,
            "A canary has failed for this workload, clear the annotation to retry",
            &[("workload", dc.name()), ("failed", failed.as_str())],
        );
        return SpawnDecision::NothingToDo;
    }

    let (name, image) = match get_name_and_image(dc) {
        Ok(pair) => pair,
        Err(err) => return SpawnDecision::Invalid(err.to_string()),
    };

    let containers = &dc.spec.template.spec.containers;
    let idx = match find_container(&name, containers) {
        Ok(idx) => idx,
        Err(err) => return SpawnDecision::Invalid(err.to_string()),
    };

    if containers[idx].image.as_deref() == Some(image.as_str()) {
        return SpawnDecision::NothingToDo;
    }

    let mut new_containers = containers.clone();
    new_containers[idx].image = Some(image);
    SpawnDecision::Spawn(new_containers)
}

/// Returns the index of the container with the given name.
pub fn find_container(
    name: &str,
    containers: &[ContainerSpec],
) -> Result<usize, Box<dyn Error + Send + Sync>> {
    containers
        .iter()
        .position(|container| container.name == name)
        .ok_or_else(|| new_error(format!("container by name {} was not found", name)))
}

/// Builds the canary pod's metadata from the workload's template metadata.
///
/// The `deploymentconfig` label is dropped so the workload's traffic
/// selector never matches the canary; the duration annotation is a snapshot
/// taken at spawn time.
pub fn build_canary_meta(template_meta: &ObjectMeta, dc: &DeploymentConfig) -> ObjectMeta {
    let mut labels = template_meta.labels.clone();
    labels.remove(LABEL_DEPLOYMENTCONFIG);
    labels.insert(LABEL_CANARY.to_string(), "true".to_string());
    labels.insert(LABEL_CANARY_FOR.to_string(), dc.name().to_string());

    let duration = dc
        .metadata
        .annotations
        .get(ANNOTATION_CANARY_DURATION)
        .cloned()
        .unwrap_or_else(|| DEFAULT_CANARY_DURATION.to_string());
    let mut annotations = template_meta.annotations.clone();
    annotations.insert(ANNOTATION_CANARY_DURATION.to_string(), duration);

    ObjectMeta {
        name: None,
        generate_name: Some(format!("{}-canary-", dc.name())),
        namespace: None,
        labels,
        annotations,
        resource_version: None,
        creation_timestamp: None,
    }
}

/// Worker bound to the controller watching opted-in workloads.
pub struct DeploymentReconciler {
    gateway: Arc<dyn ClusterGateway>,
}

impl DeploymentReconciler {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self { gateway }
    }

    /// Creates the canary pod after re-verifying that none exists.
    async fn spawn_canary(
        &self,
        dc: &DeploymentConfig,
        containers: Vec<ContainerSpec>,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let selector = format!("{}={}", LABEL_CANARY_FOR, dc.name());
        let existing = self.gateway.list_pods(&selector).await?;
        if !existing.is_empty() {
            return Err(new_error(format!(
                "a canary for workload {} already exists",
                dc.name()
            )));
        }

        let mut template = dc.spec.template.clone();
        template.spec.containers = containers;
        let meta = build_canary_meta(&template.metadata, dc);
        let pod = Pod::new(meta, template.spec);

        log_info(COMPONENT, "Creating canary pod", &[("workload", dc.name())]);
        let created = self.gateway.create_pod(&pod).await?;
        created
            .metadata
            .name
            .clone()
            .ok_or_else(|| new_error("orchestrator returned a pod without a name"))
    }
}

#[async_trait]
impl Reconciler<DeploymentConfig> for DeploymentReconciler {
    async fn reconcile(
        &self,
        key: &str,
        indexer: &Indexer<DeploymentConfig>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let Some(dc) = indexer.get(key) else {
            // The delete edge only drains stale queue entries; canary
            // cleanup is driven by the pod reconciler.
            log_debug(COMPONENT, "Workload no longer exists", &[("key", key)]);
            return Ok(());
        };

        let containers = match should_spawn(&dc) {
            SpawnDecision::NothingToDo => {
                log_debug(
                    COMPONENT,
                    "Workload appears to be up to date",
                    &[("workload", dc.name())],
                );
                return Ok(());
            }
            SpawnDecision::Invalid(reason) => {
                log_info(
                    COMPONENT,
                    "Workload canary annotations are invalid",
                    &[("workload", dc.name()), ("reason", reason.as_str())],
                );
                return Ok(());
            }
            SpawnDecision::Spawn(containers) => containers,
        };

        let pod_name = self.spawn_canary(&dc, containers).await?;

        let mut updated = dc.clone();
        updated
            .metadata
            .annotations
            .insert(ANNOTATION_CANARY_POD.to_string(), pod_name.clone());
        self.gateway.update_workload(&updated).await?;
        log_info(
            COMPONENT,
            "Canary pod recorded on workload",
            &[("workload", dc.name()), ("pod", pod_name.as_str())],
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canaryop::k8s::{DeploymentConfigSpec, PodSpec, PodTemplateSpec};
    use crate::canaryop::operator::{ANNOTATION_CANARY_IMAGE, ANNOTATION_CANARY_NAME};
    use crate::canaryop::test_support::FakeGateway;

    fn sample_workload() -> DeploymentConfig {
        let mut meta = ObjectMeta {
            name: Some("testing".to_string()),
            ..Default::default()
        };
        meta.labels.insert(LABEL_CANARY.to_string(), "true".to_string());
        meta.annotations
            .insert(ANNOTATION_CANARY_NAME.to_string(), "foo".to_string());
        meta.annotations
            .insert(ANNOTATION_CANARY_IMAGE.to_string(), "barv2".to_string());

        DeploymentConfig::new(
            meta,
            DeploymentConfigSpec {
                replicas: None,
                template: PodTemplateSpec {
                    metadata: ObjectMeta::default(),
                    spec: PodSpec {
                        containers: vec![ContainerSpec {
                            name: "foo".to_string(),
                            image: Some("barv1".to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                },
            },
        )
    }

    #[test]
    fn spawn_replaces_target_image() {
        match should_spawn(&sample_workload()) {
            SpawnDecision::Spawn(containers) => {
                assert_eq!(containers.len(), 1);
                assert_eq!(containers[0].image.as_deref(), Some("barv2"));
            }
            other => panic!("expected spawn, got {:?}", other),
        }
    }

    #[test]
    fn blank_workload_is_invalid() {
        let dc = DeploymentConfig::new(ObjectMeta::default(), DeploymentConfigSpec::default());
        assert!(matches!(should_spawn(&dc), SpawnDecision::Invalid(_)));
    }

    #[test]
    fn failed_canary_suppresses_spawn() {
        let mut dc = sample_workload();
        dc.metadata
            .annotations
            .insert(ANNOTATION_CANARY_FAIL.to_string(), "testing".to_string());
        assert!(matches!(should_spawn(&dc), SpawnDecision::NothingToDo));
    }

    #[test]
    fn existing_canary_pod_suppresses_spawn() {
        let mut dc = sample_workload();
        dc.metadata
            .annotations
            .insert(ANNOTATION_CANARY_POD.to_string(), "testing".to_string());
        assert!(matches!(should_spawn(&dc), SpawnDecision::NothingToDo));
    }

    #[test]
    fn up_to_date_image_is_nothing_to_do() {
        let mut dc = sample_workload();
        dc.spec.template.spec.containers[0].image = Some("barv2".to_string());
        assert!(matches!(should_spawn(&dc), SpawnDecision::NothingToDo));
    }

    #[test]
    fn target_found_anywhere_in_container_list() {
        let mut dc = sample_workload();
        dc.spec.template.spec.containers.insert(
            0,
            ContainerSpec {
                name: "sidecar".to_string(),
                image: Some("proxy:v1".to_string()),
                ..Default::default()
            },
        );
        match should_spawn(&dc) {
            SpawnDecision::Spawn(containers) => {
                assert_eq!(containers[0].image.as_deref(), Some("proxy:v1"));
                assert_eq!(containers[1].image.as_deref(), Some("barv2"));
            }
            other => panic!("expected spawn, got {:?}", other),
        }
    }

    #[test]
    fn find_container_by_name() {
        let containers = vec![ContainerSpec {
            name: "foo".to_string(),
            image: Some("bar".to_string()),
            ..Default::default()
        }];
        assert_eq!(find_container("foo", &containers).expect("present"), 0);
        assert!(find_container("notthere", &containers).is_err());
    }

    #[test]
    fn canary_meta_defaults() {
        let dc = sample_workload();
        let mut template_meta = ObjectMeta::default();
        template_meta
            .labels
            .insert(LABEL_DEPLOYMENTCONFIG.to_string(), "testing".to_string());

        let meta = build_canary_meta(&template_meta, &dc);
        assert_eq!(meta.labels.get(LABEL_CANARY).map(String::as_str), Some("true"));
        assert_eq!(
            meta.labels.get(LABEL_CANARY_FOR).map(String::as_str),
            Some("testing")
        );
        assert!(!meta.labels.contains_key(LABEL_DEPLOYMENTCONFIG));
        assert_eq!(
            meta.annotations
                .get(ANNOTATION_CANARY_DURATION)
                .map(String::as_str),
            Some("15m")
        );
        assert_eq!(meta.generate_name.as_deref(), Some("testing-canary-"));
    }

    #[tokio::test]
    async fn reconcile_spawns_and_annotates() {
        let gateway = Arc::new(FakeGateway::new("default"));
        gateway.put_workload(sample_workload());

        let reconciler = DeploymentReconciler::new(gateway.clone());
        let indexer = Indexer::new();
        indexer_insert(&indexer, sample_workload());

        reconciler
            .reconcile("default/testing", &indexer)
            .await
            .expect("reconcile succeeds");

        let pods = gateway
            .list_pods("canary-for=testing")
            .await
            .expect("list pods");
        assert_eq!(pods.len(), 1);
        let pod_name = pods[0].metadata.name.clone().expect("pod name");
        assert!(pod_name.starts_with("testing-canary-"));

        let stored = gateway.workload("testing").expect("workload stored");
        assert_eq!(
            stored
                .metadata
                .annotations
                .get(ANNOTATION_CANARY_POD)
                .map(String::as_str),
            Some(pod_name.as_str())
        );
    }

    #[tokio::test]
    async fn duplicate_canary_refuses_spawn() {
        let gateway = Arc::new(FakeGateway::new("default"));
        gateway.put_workload(sample_workload());
        gateway.put_pod(crate::canaryop::test_support::canary_pod(
            "stray-canary",
            "testing",
            "barv2",
            0,
        ));

        let reconciler = DeploymentReconciler::new(gateway.clone());
        let indexer = Indexer::new();
        indexer_insert(&indexer, sample_workload());

        let result = reconciler.reconcile("default/testing", &indexer).await;
        assert!(result.is_err());

        // The workload keeps its annotation state untouched.
        let stored = gateway.workload("testing").expect("workload stored");
        assert!(!stored.metadata.annotations.contains_key(ANNOTATION_CANARY_POD));
    }

    // Tests seed the cache directly instead of running an informer.
    fn indexer_insert(indexer: &Indexer<DeploymentConfig>, dc: DeploymentConfig) {
        use crate::canaryop::k8s::meta::ClusterResource;
        let key = dc.key().expect("workload key");
        indexer.upsert(key, dc);
    }
}

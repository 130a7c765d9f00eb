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

//! In-memory orchestrator used by unit and integration tests. Stores
//! workloads and pods, assigns generated pod names, records every mutation,
//! and fans watch events out to subscribers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::canaryop::gateway::{ClusterGateway, GatewayError, WatchStream};
use crate::canaryop::k8s::{
    ContainerSpec, ContainerStatus, DeploymentConfig, DeploymentConfigSpec, ObjectMeta, Pod,
    PodSpec, PodStatus, PodTemplateSpec, WatchEvent,
};
use crate::canaryop::operator::{
    ANNOTATION_CANARY_DURATION, ANNOTATION_CANARY_IMAGE, ANNOTATION_CANARY_NAME, LABEL_CANARY,
    LABEL_CANARY_FOR,
};

const WATCH_BUFFER: usize = 64;

pub struct FakeGateway {
    namespace: String,
    state: Mutex<FakeState>,
    workload_events: broadcast::Sender<WatchEvent<DeploymentConfig>>,
    pod_events: broadcast::Sender<WatchEvent<Pod>>,
}

struct FakeState {
    workloads: HashMap<String, DeploymentConfig>,
    pods: HashMap<String, Pod>,
    mutations: Vec<String>,
    generated: u64,
}

impl FakeGateway {
    pub fn new(namespace: impl Into<String>) -> Self {
        let (workload_events, _) = broadcast::channel(WATCH_BUFFER);
        let (pod_events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            namespace: namespace.into(),
            state: Mutex::new(FakeState {
                workloads: HashMap::new(),
                pods: HashMap::new(),
                mutations: Vec::new(),
                generated: 0,
            }),
            workload_events,
            pod_events,
        }
    }

    /// Seeds a workload without recording a mutation.
    pub fn put_workload(&self, mut dc: DeploymentConfig) {
        dc.metadata.namespace = Some(self.namespace.clone());
        let name = dc.name().to_string();
        self.state
            .lock()
            .unwrap()
            .workloads
            .insert(name, dc.clone());
        let _ = self.workload_events.send(WatchEvent::added(dc));
    }

    /// Seeds a pod without recording a mutation.
    pub fn put_pod(&self, mut pod: Pod) {
        pod.metadata.namespace = Some(self.namespace.clone());
        if pod.metadata.creation_timestamp.is_none() {
            pod.metadata.creation_timestamp = Some(Utc::now());
        }
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().pods.insert(name, pod.clone());
        let _ = self.pod_events.send(WatchEvent::added(pod));
    }

    pub fn workload(&self, name: &str) -> Option<DeploymentConfig> {
        self.state.lock().unwrap().workloads.get(name).cloned()
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.state.lock().unwrap().pods.get(name).cloned()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.state.lock().unwrap().pods.values().cloned().collect()
    }

    /// Every mutation the operator issued, in order.
    pub fn mutation_log(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.clone()
    }

    /// Overwrites a pod's status and emits a MODIFIED event, the way a
    /// kubelet status sync would.
    pub fn set_pod_status(&self, name: &str, status: PodStatus) {
        let updated = {
            let mut state = self.state.lock().unwrap();
            match state.pods.get_mut(name) {
                Some(pod) => {
                    pod.status = Some(status);
                    Some(pod.clone())
                }
                None => None,
            }
        };
        if let Some(pod) = updated {
            let _ = self.pod_events.send(WatchEvent::modified(pod));
        }
    }

    fn record(&self, state: &mut FakeState, entry: String) {
        state.mutations.push(entry);
    }
}

fn selector_matches(selector: &str, labels: &HashMap<String, String>) -> bool {
    selector
        .split(',')
        .filter(|clause| !clause.trim().is_empty())
        .all(|clause| match clause.split_once('=') {
            Some((key, value)) => {
                labels.get(key.trim()).map(String::as_str) == Some(value.trim())
            }
            None => false,
        })
}

fn subscribe<T: Clone + Send + 'static>(
    sender: &broadcast::Sender<WatchEvent<T>>,
) -> WatchStream<T> {
    let mut receiver = sender.subscribe();
    let (tx, rx) = mpsc::channel(WATCH_BUFFER);
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

#[async_trait]
impl ClusterGateway for FakeGateway {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn list_workloads(
        &self,
        selector: &str,
    ) -> Result<Vec<DeploymentConfig>, GatewayError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .workloads
            .values()
            .filter(|dc| selector.is_empty() || selector_matches(selector, &dc.metadata.labels))
            .cloned()
            .collect())
    }

    async fn get_workload(&self, name: &str) -> Result<DeploymentConfig, GatewayError> {
        self.workload(name).ok_or(GatewayError::NotFound {
            kind: "DeploymentConfig",
            name: name.to_string(),
        })
    }

    async fn update_workload(
        &self,
        workload: &DeploymentConfig,
    ) -> Result<DeploymentConfig, GatewayError> {
        let name = workload.name().to_string();
        let stored = {
            let mut state = self.state.lock().unwrap();
            if !state.workloads.contains_key(&name) {
                return Err(GatewayError::NotFound {
                    kind: "DeploymentConfig",
                    name,
                });
            }
            self.record(&mut state, format!("update-workload {}", name));
            state.workloads.insert(name, workload.clone());
            workload.clone()
        };
        let _ = self.workload_events.send(WatchEvent::modified(stored.clone()));
        Ok(stored)
    }

    async fn watch_workloads(
        &self,
        _selector: &str,
        _resource_version: Option<String>,
    ) -> Result<WatchStream<DeploymentConfig>, GatewayError> {
        Ok(subscribe(&self.workload_events))
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, GatewayError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .values()
            .filter(|pod| selector.is_empty() || selector_matches(selector, &pod.metadata.labels))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, name: &str) -> Result<Pod, GatewayError> {
        self.pod(name).ok_or(GatewayError::NotFound {
            kind: "Pod",
            name: name.to_string(),
        })
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, GatewayError> {
        let created = {
            let mut state = self.state.lock().unwrap();
            let mut created = pod.clone();
            if created.metadata.name.is_none() {
                let prefix = created
                    .metadata
                    .generate_name
                    .clone()
                    .unwrap_or_else(|| "pod-".to_string());
                state.generated += 1;
                created.metadata.name = Some(format!("{}{:05}", prefix, state.generated));
            }
            let name = created.metadata.name.clone().unwrap_or_default();
            created.metadata.namespace = Some(self.namespace.clone());
            created.metadata.creation_timestamp = Some(Utc::now());
            // Fresh pods report their spec images with a clean restart record.
            if created.status.is_none() {
                created.status = Some(PodStatus {
                    phase: Some("Running".to_string()),
                    container_statuses: created
                        .spec
                        .containers
                        .iter()
                        .map(|container| ContainerStatus {
                            name: container.name.clone(),
                            ready: true,
                            restart_count: 0,
                            image: container.image.clone(),
                        })
                        .collect(),
                });
            }
            self.record(&mut state, format!("create-pod {}", name));
            state.pods.insert(name, created.clone());
            created
        };
        let _ = self.pod_events.send(WatchEvent::added(created.clone()));
        Ok(created)
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, GatewayError> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let stored = {
            let mut state = self.state.lock().unwrap();
            if !state.pods.contains_key(&name) {
                return Err(GatewayError::NotFound {
                    kind: "Pod",
                    name,
                });
            }
            self.record(&mut state, format!("update-pod {}", name));
            state.pods.insert(name.clone(), pod.clone());
            pod.clone()
        };
        let _ = self.pod_events.send(WatchEvent::modified(stored.clone()));
        Ok(stored)
    }

    async fn delete_pod(&self, name: &str) -> Result<(), GatewayError> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            match state.pods.remove(name) {
                Some(pod) => {
                    self.record(&mut state, format!("delete-pod {}", name));
                    pod
                }
                None => {
                    return Err(GatewayError::NotFound {
                        kind: "Pod",
                        name: name.to_string(),
                    })
                }
            }
        };
        let _ = self.pod_events.send(WatchEvent::deleted(removed));
        Ok(())
    }

    async fn watch_pods(
        &self,
        _selector: &str,
        _resource_version: Option<String>,
    ) -> Result<WatchStream<Pod>, GatewayError> {
        Ok(subscribe(&self.pod_events))
    }
}

/// Builds an opted-in workload with the canary annotations set.
pub fn canary_workload(
    workload: &str,
    container: &str,
    canary_image: &str,
    current_image: &str,
) -> DeploymentConfig {
    let mut meta = ObjectMeta {
        name: Some(workload.to_string()),
        ..Default::default()
    };
    meta.labels.insert(LABEL_CANARY.to_string(), "true".to_string());
    meta.annotations.insert(
        ANNOTATION_CANARY_NAME.to_string(),
        container.to_string(),
    );
    meta.annotations.insert(
        ANNOTATION_CANARY_IMAGE.to_string(),
        canary_image.to_string(),
    );

    let mut template_meta = ObjectMeta::default();
    template_meta
        .labels
        .insert("deploymentconfig".to_string(), workload.to_string());
    template_meta
        .labels
        .insert("app".to_string(), workload.to_string());

    DeploymentConfig::new(
        meta,
        DeploymentConfigSpec {
            replicas: Some(1),
            template: PodTemplateSpec {
                metadata: template_meta,
                spec: PodSpec {
                    containers: vec![ContainerSpec {
                        name: container.to_string(),
                        image: Some(current_image.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            },
        },
    )
}

/// Builds a canary pod the way the deployment reconciler would, with an
/// observed status for its single container.
pub fn canary_pod(name: &str, canary_for: &str, image: &str, restarts: u32) -> Pod {
    let mut meta = ObjectMeta {
        name: Some(name.to_string()),
        creation_timestamp: Some(Utc::now()),
        ..Default::default()
    };
    meta.labels.insert(LABEL_CANARY.to_string(), "true".to_string());
    meta.labels
        .insert(LABEL_CANARY_FOR.to_string(), canary_for.to_string());
    meta.annotations.insert(
        ANNOTATION_CANARY_DURATION.to_string(),
        "15m".to_string(),
    );

    let mut pod = Pod::new(
        meta,
        PodSpec {
            containers: vec![ContainerSpec {
                name: canary_for.to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        },
    );
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        container_statuses: vec![ContainerStatus {
            name: canary_for.to_string(),
            ready: true,
            restart_count: restarts,
            image: Some(image.to_string()),
        }],
    });
    pod
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_all_clauses() {
        let mut labels = HashMap::new();
        labels.insert("canary".to_string(), "true".to_string());
        labels.insert("canary-for".to_string(), "web".to_string());

        assert!(selector_matches("canary=true", &labels));
        assert!(selector_matches("canary=true,canary-for=web", &labels));
        assert!(!selector_matches("canary-for=api", &labels));
        assert!(!selector_matches("missing=label", &labels));
    }

    #[tokio::test]
    async fn created_pods_get_generated_names() {
        let gateway = FakeGateway::new("default");
        let mut pod = canary_pod("ignored", "web", "web:v2", 0);
        pod.metadata.name = None;
        pod.metadata.generate_name = Some("web-canary-".to_string());

        let created = gateway.create_pod(&pod).await.expect("create pod");
        let name = created.metadata.name.expect("generated name");
        assert!(name.starts_with("web-canary-"));
        assert!(gateway.pod(&name).is_some());
        assert_eq!(gateway.mutation_log(), vec![format!("create-pod {}", name)]);
    }
}

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

use serde::{Deserialize, Serialize};

use crate::canaryop::k8s::meta::{ClusterResource, ListMeta, ObjectMeta};
use crate::canaryop::k8s::pod::PodSpec;

/// Pod template embedded in a workload spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

/// Workload spec: the rollout policy fields the operator does not touch are
/// preserved opaquely by the orchestrator on update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentConfigSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub template: PodTemplateSpec,
}

/// Workload watched by the deployment reconciler. Annotations carry the
/// canary protocol state; the pod template supplies the canary's spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: DeploymentConfigSpec,
}

impl DeploymentConfig {
    pub fn new(metadata: ObjectMeta, spec: DeploymentConfigSpec) -> Self {
        Self {
            api_version: "apps.openshift.io/v1".to_string(),
            kind: "DeploymentConfig".to_string(),
            metadata,
            spec,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

impl ClusterResource for DeploymentConfig {
    const KIND: &'static str = "DeploymentConfig";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

/// Workload collection envelope returned by list calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentConfigList {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<DeploymentConfig>,
}

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

/// Minimal container specification derived from the orchestrator's `Container`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<ContainerEnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
}

/// Minimal environment variable spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerEnvVar {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Container port declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerPort {
    #[serde(rename = "containerPort")]
    pub container_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Minimal pod specification capturing the data the operator needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    pub containers: Vec<ContainerSpec>,
    #[serde(rename = "restartPolicy", skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(rename = "serviceAccountName", skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Pod object wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PodStatus>,
}

impl Pod {
    pub fn new(metadata: ObjectMeta, spec: PodSpec) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata,
            spec,
            status: None,
        }
    }
}

impl ClusterResource for Pod {
    const KIND: &'static str = "Pod";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

/// Runtime status snapshot surfaced through the watch API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PodStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(
        rename = "containerStatuses",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub container_statuses: Vec<ContainerStatus>,
}

/// Container-level status information.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(rename = "restartCount", default)]
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Pod collection envelope returned by list calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<Pod>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_decodes_status_fields() {
        let raw = r#"{
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web-canary-1", "namespace": "ci"},
            "spec": {"containers": [{"name": "web", "image": "web:v2"}]},
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"name": "web", "ready": true, "restartCount": 2, "image": "web:v2"}
                ]
            }
        }"#;
        let pod: Pod = serde_json::from_str(raw).expect("decode pod");
        let status = pod.status.expect("status present");
        assert_eq!(status.container_statuses[0].restart_count, 2);
        assert_eq!(status.container_statuses[0].image.as_deref(), Some("web:v2"));
    }

    #[test]
    fn pod_key_uses_namespace_and_name() {
        let pod = Pod::new(
            ObjectMeta {
                name: Some("web-canary-1".to_string()),
                namespace: Some("ci".to_string()),
                ..Default::default()
            },
            PodSpec::default(),
        );
        assert_eq!(pod.key().as_deref(), Some("ci/web-canary-1"));
    }
}

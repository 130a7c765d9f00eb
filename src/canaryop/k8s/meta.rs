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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Minimal representation of orchestrator object metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "generateName", skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(rename = "creationTimestamp", skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// Metadata included with orchestrator list responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListMeta {
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Generic watch event as delivered on the orchestrator's watch stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: String,
    pub object: T,
}

impl<T> WatchEvent<T> {
    pub fn added(object: T) -> Self {
        Self {
            event_type: "ADDED".to_string(),
            object,
        }
    }

    pub fn modified(object: T) -> Self {
        Self {
            event_type: "MODIFIED".to_string(),
            object,
        }
    }

    pub fn deleted(object: T) -> Self {
        Self {
            event_type: "DELETED".to_string(),
            object,
        }
    }
}

/// Resources the generic controller machinery can index and reconcile.
pub trait ClusterResource: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    /// The `namespace/name` reconcile key, absent when the object is unnamed.
    fn key(&self) -> Option<String> {
        let meta = self.metadata();
        let name = meta.name.as_deref()?;
        Some(object_key(meta.namespace.as_deref(), name))
    }
}

/// Builds the `namespace/name` key used as the unit of reconciliation work.
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    let ns = namespace.filter(|ns| !ns.is_empty()).unwrap_or("default");
    format!("{}/{}", ns, name)
}

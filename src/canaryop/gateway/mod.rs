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
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;

use crate::canaryop::controller::informer::ListerWatcher;
use crate::canaryop::k8s::{DeploymentConfig, Pod, WatchEvent};

pub mod http;

pub use http::HttpGateway;

/// Stream of watch events for a single resource kind.
pub type WatchStream<T> =
    Pin<Box<dyn Stream<Item = Result<WatchEvent<T>, GatewayError>> + Send>>;

/// Error taxonomy for orchestrator calls.
///
/// `NotFound` and `Conflict` are surfaced as distinct kinds because callers
/// route them differently: a vanished object usually means the work is
/// already done, while a conflict means a stale read that the retry loop
/// absorbs.
#[derive(Debug)]
pub enum GatewayError {
    NotFound { kind: &'static str, name: String },
    Conflict(String),
    Api { status: u16, message: String },
    Transport(Box<dyn Error + Send + Sync>),
    Invalid(String),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, GatewayError::Conflict(_))
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NotFound { kind, name } => {
                write!(f, "{} '{}' not found", kind, name)
            }
            GatewayError::Conflict(message) => {
                write!(f, "update conflict: {}", message)
            }
            GatewayError::Api { status, message } => {
                write!(f, "orchestrator returned {}: {}", status, message)
            }
            GatewayError::Transport(err) => {
                write!(f, "orchestrator unreachable: {}", err)
            }
            GatewayError::Invalid(message) => {
                write!(f, "invalid request: {}", message)
            }
        }
    }
}

impl Error for GatewayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GatewayError::Transport(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transport(Box::new(err))
    }
}

/// Typed facade over the orchestrator's list/watch/get/update/create/delete
/// API. All calls are scoped to the namespace discovered at process start.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    fn namespace(&self) -> &str;

    async fn list_workloads(&self, selector: &str)
        -> Result<Vec<DeploymentConfig>, GatewayError>;

    async fn get_workload(&self, name: &str) -> Result<DeploymentConfig, GatewayError>;

    async fn update_workload(
        &self,
        workload: &DeploymentConfig,
    ) -> Result<DeploymentConfig, GatewayError>;

    async fn watch_workloads(
        &self,
        selector: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<DeploymentConfig>, GatewayError>;

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, GatewayError>;

    async fn get_pod(&self, name: &str) -> Result<Pod, GatewayError>;

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, GatewayError>;

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, GatewayError>;

    async fn delete_pod(&self, name: &str) -> Result<(), GatewayError>;

    async fn watch_pods(
        &self,
        selector: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<Pod>, GatewayError>;
}

/// Lister-watcher over annotated workloads, scoped by label selector.
pub struct WorkloadListerWatcher {
    gateway: Arc<dyn ClusterGateway>,
    selector: String,
}

impl WorkloadListerWatcher {
    pub fn new(gateway: Arc<dyn ClusterGateway>, selector: impl Into<String>) -> Self {
        Self {
            gateway,
            selector: selector.into(),
        }
    }
}

#[async_trait]
impl ListerWatcher<DeploymentConfig> for WorkloadListerWatcher {
    async fn list(&self) -> Result<Vec<DeploymentConfig>, GatewayError> {
        self.gateway.list_workloads(&self.selector).await
    }

    async fn watch(
        &self,
        resource_version: Option<String>,
    ) -> Result<WatchStream<DeploymentConfig>, GatewayError> {
        self.gateway
            .watch_workloads(&self.selector, resource_version)
            .await
    }
}

/// Lister-watcher over canary pods, scoped by label selector.
pub struct PodListerWatcher {
    gateway: Arc<dyn ClusterGateway>,
    selector: String,
}

impl PodListerWatcher {
    pub fn new(gateway: Arc<dyn ClusterGateway>, selector: impl Into<String>) -> Self {
        Self {
            gateway,
            selector: selector.into(),
        }
    }
}

#[async_trait]
impl ListerWatcher<Pod> for PodListerWatcher {
    async fn list(&self) -> Result<Vec<Pod>, GatewayError> {
        self.gateway.list_pods(&self.selector).await
    }

    async fn watch(
        &self,
        resource_version: Option<String>,
    ) -> Result<WatchStream<Pod>, GatewayError> {
        self.gateway.watch_pods(&self.selector, resource_version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_distinguishable() {
        let not_found = GatewayError::NotFound {
            kind: "Pod",
            name: "p1".to_string(),
        };
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let conflict = GatewayError::Conflict("resourceVersion stale".to_string());
        assert!(conflict.is_conflict());
        assert!(!conflict.is_not_found());
    }
}

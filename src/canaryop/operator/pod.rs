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
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::canaryop::controller::{Indexer, Reconciler};
use crate::canaryop::gateway::{ClusterGateway, GatewayError};
use crate::canaryop::k8s::Pod;
use crate::canaryop::logger::{log_debug, log_error, log_info};
use crate::canaryop::operator::{
    get_name_and_image, ANNOTATION_CANARY_DURATION, ANNOTATION_CANARY_FAIL,
    ANNOTATION_CANARY_IMAGE, ANNOTATION_CANARY_NAME, ANNOTATION_CANARY_POD,
    DEFAULT_CANARY_DURATION, LABEL_CANARY_FOR,
};

const COMPONENT: &str = "pod-reconciler";
const FALLBACK_DURATION: Duration = Duration::from_secs(15 * 60);

/// Resolves the pod's ripening window from its duration annotation,
/// falling back to the default on absence or parse failure.
pub fn ripening_window(pod: &Pod) -> Duration {
    let raw = pod
        .metadata
        .annotations
        .get(ANNOTATION_CANARY_DURATION)
        .map(String::as_str)
        .unwrap_or(DEFAULT_CANARY_DURATION);
    humantime::parse_duration(raw).unwrap_or(FALLBACK_DURATION)
}

/// Worker bound to the controller watching canary pods. Observes status,
/// deletes stale or unhealthy canaries, and promotes ripe ones into the
/// parent workload.
pub struct PodReconciler {
    gateway: Arc<dyn ClusterGateway>,
}

impl PodReconciler {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self { gateway }
    }

    async fn check(&self, pod: &Pod) -> Result<(), Box<dyn Error + Send + Sync>> {
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        let Some(canary_for) = pod.metadata.labels.get(LABEL_CANARY_FOR) else {
            log_debug(
                COMPONENT,
                "Pod does not have a canary-for label",
                &[("pod", pod_name)],
            );
            return Ok(());
        };

        let dc = match self.gateway.get_workload(canary_for).await {
            Ok(dc) => dc,
            Err(err) if err.is_not_found() => {
                log_info(
                    COMPONENT,
                    "Parent workload is gone",
                    &[("pod", pod_name), ("workload", canary_for.as_str())],
                );
                return Ok(());
            }
            Err(err) => return Err(Box::new(err)),
        };

        let (name, image) = match get_name_and_image(&dc) {
            Ok(pair) => pair,
            Err(err) => {
                log_info(
                    COMPONENT,
                    "Failed to get canary details from workload",
                    &[
                        ("workload", canary_for.as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
                return Ok(());
            }
        };

        let statuses = pod
            .status
            .as_ref()
            .map(|status| status.container_statuses.as_slice())
            .unwrap_or_default();

        let mut deleted_stale = false;
        for status in statuses.iter().filter(|status| status.name == name) {
            if status.image.as_deref() != Some(image.as_str()) {
                // The user rewrote canary-image while this canary was
                // pending; it no longer proves anything.
                self.delete_pod(pod_name).await?;
                deleted_stale = true;
                log_info(
                    COMPONENT,
                    "Canary image no longer matches workload, deleted",
                    &[
                        ("workload", canary_for.as_str()),
                        ("desired", image.as_str()),
                        ("canary", status.image.as_deref().unwrap_or_default()),
                    ],
                );
            }

            if status.restart_count > 0 {
                let observed = status.image.clone().unwrap_or_default();
                let mut updated = dc.clone();
                updated
                    .metadata
                    .annotations
                    .insert(ANNOTATION_CANARY_FAIL.to_string(), observed.clone());
                updated.metadata.annotations.remove(ANNOTATION_CANARY_POD);
                self.gateway
                    .update_workload(&updated)
                    .await?;
                log_info(
                    COMPONENT,
                    "Canary had container restarts, marking as failed",
                    &[
                        ("workload", canary_for.as_str()),
                        ("canary", observed.as_str()),
                    ],
                );
                self.delete_pod(pod_name).await?;
                return Ok(());
            }
        }
        if deleted_stale {
            // Release the workload's pod annotation so the deployment
            // reconciler can spawn a replacement with the new image.
            let mut updated = dc.clone();
            if updated
                .metadata
                .annotations
                .remove(ANNOTATION_CANARY_POD)
                .is_some()
            {
                self.gateway.update_workload(&updated).await?;
            }
            return Ok(());
        }

        let Some(created) = pod.metadata.creation_timestamp else {
            log_debug(
                COMPONENT,
                "Pod has no creation timestamp yet",
                &[("pod", pod_name)],
            );
            return Ok(());
        };
        let window = ripening_window(pod);
        let deadline = created
            + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::minutes(15));
        if Utc::now() < deadline {
            log_debug(
                COMPONENT,
                "Canary is not old enough, letting it ripen",
                &[("pod", pod_name), ("workload", canary_for.as_str())],
            );
            return Ok(());
        }

        log_info(
            COMPONENT,
            "Canary is old enough, upgrading the workload",
            &[("pod", pod_name), ("workload", canary_for.as_str())],
        );
        self.promote(pod_name, canary_for).await
    }

    /// Writes the canary image into the parent workload and retires the
    /// canary pod. The pod is deleted before the workload update so a
    /// partial promotion leaves an orphaned annotation rather than an
    /// unannotated live canary.
    async fn promote(
        &self,
        pod_name: &str,
        canary_for: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let dc = match self.gateway.get_workload(canary_for).await {
            Ok(dc) => dc,
            Err(err) if err.is_not_found() => {
                log_info(
                    COMPONENT,
                    "Parent workload vanished before promotion",
                    &[("workload", canary_for)],
                );
                return Ok(());
            }
            Err(err) => return Err(Box::new(err)),
        };

        let name = dc
            .metadata
            .annotations
            .get(ANNOTATION_CANARY_NAME)
            .cloned()
            .unwrap_or_default();
        let image = dc
            .metadata
            .annotations
            .get(ANNOTATION_CANARY_IMAGE)
            .cloned()
            .unwrap_or_default();

        let mut updated = dc.clone();
        let target = updated
            .spec
            .template
            .spec
            .containers
            .iter_mut()
            .find(|container| container.name == name);
        let Some(container) = target else {
            log_error(
                COMPONENT,
                "Failed to update image in container specs",
                &[("workload", canary_for), ("container", name.as_str())],
            );
            return Ok(());
        };
        container.image = Some(image);

        self.delete_pod(pod_name).await?;

        updated.metadata.annotations.remove(ANNOTATION_CANARY_POD);
        self.gateway
            .update_workload(&updated)
            .await?;
        log_info(
            COMPONENT,
            "Canary completed, workload upgraded",
            &[("workload", canary_for)],
        );
        Ok(())
    }

    /// Deletes the canary pod; a pod that is already gone counts as done.
    async fn delete_pod(&self, name: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        match self.gateway.delete_pod(name).await {
            Ok(()) => Ok(()),
            Err(GatewayError::NotFound { .. }) => Ok(()),
            Err(err) => Err(Box::new(err)),
        }
    }
}

#[async_trait]
impl Reconciler<Pod> for PodReconciler {
    async fn reconcile(
        &self,
        key: &str,
        indexer: &Indexer<Pod>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let Some(pod) = indexer.get(key) else {
            log_debug(COMPONENT, "Pod no longer exists", &[("key", key)]);
            return Ok(());
        };
        self.check(&pod).await
    }
}

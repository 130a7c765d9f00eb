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

//! End-to-end canary lifecycle scenarios driven against the in-memory
//! orchestrator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use canaryop::canaryop::controller::{Controller, Indexer, Reconciler};
use canaryop::canaryop::gateway::{ClusterGateway, WorkloadListerWatcher};
use canaryop::canaryop::k8s::meta::ClusterResource;
use canaryop::canaryop::k8s::{DeploymentConfig, Pod};
use canaryop::canaryop::operator::deployment::DeploymentReconciler;
use canaryop::canaryop::operator::pod::PodReconciler;
use canaryop::canaryop::operator::{
    ANNOTATION_CANARY_FAIL, ANNOTATION_CANARY_IMAGE, ANNOTATION_CANARY_POD, CANARY_SELECTOR,
    LABEL_CANARY_FOR,
};
use canaryop::canaryop::test_support::{canary_pod, canary_workload, FakeGateway};

fn seed_workload_indexer(gateway: &FakeGateway, name: &str) -> Indexer<DeploymentConfig> {
    let indexer = Indexer::new();
    let dc = gateway.workload(name).expect("workload seeded");
    indexer.upsert(dc.key().expect("workload key"), dc);
    indexer
}

fn seed_pod_indexer(pod: &Pod) -> Indexer<Pod> {
    let indexer = Indexer::new();
    indexer.upsert(pod.key().expect("pod key"), pod.clone());
    indexer
}

async fn reconcile_workload(gateway: &Arc<FakeGateway>, name: &str) {
    let indexer = seed_workload_indexer(gateway, name);
    let reconciler = DeploymentReconciler::new(gateway.clone() as Arc<dyn ClusterGateway>);
    reconciler
        .reconcile(&format!("default/{}", name), &indexer)
        .await
        .expect("deployment reconcile");
}

async fn reconcile_canary(gateway: &Arc<FakeGateway>, pod: &Pod) {
    let indexer = seed_pod_indexer(pod);
    let reconciler = PodReconciler::new(gateway.clone() as Arc<dyn ClusterGateway>);
    reconciler
        .reconcile(pod.key().expect("pod key").as_str(), &indexer)
        .await
        .expect("pod reconcile");
}

fn only_canary(gateway: &FakeGateway, workload: &str) -> Pod {
    let canaries: Vec<Pod> = gateway
        .pods()
        .into_iter()
        .filter(|pod| {
            pod.metadata.labels.get(LABEL_CANARY_FOR).map(String::as_str) == Some(workload)
        })
        .collect();
    assert_eq!(canaries.len(), 1, "exactly one canary per workload");
    canaries[0].clone()
}

#[tokio::test]
async fn fresh_workload_gets_a_canary_through_the_controller() {
    let gateway = Arc::new(FakeGateway::new("default"));
    gateway.put_workload(canary_workload("web", "web", "web:v2", "web:v1"));

    let controller = Arc::new(Controller::new(
        "deployment",
        Arc::new(WorkloadListerWatcher::new(
            gateway.clone() as Arc<dyn ClusterGateway>,
            CANARY_SELECTOR,
        )),
        None,
        Arc::new(DeploymentReconciler::new(
            gateway.clone() as Arc<dyn ClusterGateway>
        )),
    ));

    let shutdown = CancellationToken::new();
    let run = {
        let controller = Arc::clone(&controller);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { controller.run(1, shutdown).await })
    };

    let mut spawned = false;
    for _ in 0..200 {
        let annotated = gateway
            .workload("web")
            .map(|dc| dc.metadata.annotations.contains_key(ANNOTATION_CANARY_POD))
            .unwrap_or(false);
        if annotated {
            spawned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(spawned, "controller should spawn and record a canary");

    let canary = only_canary(&gateway, "web");
    let canary_name = canary.metadata.name.clone().expect("canary name");
    assert!(canary_name.starts_with("web-canary-"));
    assert_eq!(
        canary.spec.containers[0].image.as_deref(),
        Some("web:v2"),
        "canary runs the candidate image"
    );

    let dc = gateway.workload("web").expect("workload stored");
    assert_eq!(
        dc.metadata
            .annotations
            .get(ANNOTATION_CANARY_POD)
            .map(String::as_str),
        Some(canary_name.as_str())
    );

    shutdown.cancel();
    run.await
        .expect("controller task")
        .expect("controller shut down cleanly");
}

#[tokio::test]
async fn ripened_canary_promotes_the_workload() {
    let gateway = Arc::new(FakeGateway::new("default"));
    gateway.put_workload(canary_workload("web", "web", "web:v2", "web:v1"));

    reconcile_workload(&gateway, "web").await;
    let mut canary = only_canary(&gateway, "web");

    // Age the canary past its ripening window with a clean restart record.
    canary.metadata.creation_timestamp = Some(Utc::now() - ChronoDuration::minutes(20));
    gateway.put_pod(canary.clone());

    reconcile_canary(&gateway, &canary).await;

    let dc = gateway.workload("web").expect("workload stored");
    assert_eq!(
        dc.spec.template.spec.containers[0].image.as_deref(),
        Some("web:v2"),
        "image promoted into the workload"
    );
    assert!(!dc.metadata.annotations.contains_key(ANNOTATION_CANARY_POD));
    assert!(gateway
        .pod(canary.metadata.name.as_deref().unwrap())
        .is_none());
}

#[tokio::test]
async fn restarting_canary_fails_without_promotion() {
    let gateway = Arc::new(FakeGateway::new("default"));
    gateway.put_workload(canary_workload("web", "web", "web:v2", "web:v1"));

    reconcile_workload(&gateway, "web").await;
    let mut canary = only_canary(&gateway, "web");

    // One restart before the window closes.
    let mut status = canary.status.clone().expect("status");
    status.container_statuses[0].restart_count = 1;
    canary.status = Some(status.clone());
    gateway.set_pod_status(canary.metadata.name.as_deref().unwrap(), status);

    reconcile_canary(&gateway, &canary).await;

    let dc = gateway.workload("web").expect("workload stored");
    assert_eq!(
        dc.metadata
            .annotations
            .get(ANNOTATION_CANARY_FAIL)
            .map(String::as_str),
        Some("web:v2")
    );
    assert!(!dc.metadata.annotations.contains_key(ANNOTATION_CANARY_POD));
    assert_eq!(
        dc.spec.template.spec.containers[0].image.as_deref(),
        Some("web:v1"),
        "no promotion happened"
    );
    assert!(gateway
        .pod(canary.metadata.name.as_deref().unwrap())
        .is_none());

    // The failure marker suppresses any further spawn attempts.
    reconcile_workload(&gateway, "web").await;
    assert!(gateway.pods().is_empty());
}

#[tokio::test]
async fn rewritten_image_replaces_the_pending_canary() {
    let gateway = Arc::new(FakeGateway::new("default"));
    gateway.put_workload(canary_workload("web", "web", "web:v2", "web:v1"));

    reconcile_workload(&gateway, "web").await;
    let canary = only_canary(&gateway, "web");
    assert_eq!(canary.spec.containers[0].image.as_deref(), Some("web:v2"));

    // The user rewrites the candidate while the canary is pending.
    let mut dc = gateway.workload("web").expect("workload stored");
    dc.metadata
        .annotations
        .insert(ANNOTATION_CANARY_IMAGE.to_string(), "web:v3".to_string());
    gateway.put_workload(dc);

    reconcile_canary(&gateway, &canary).await;
    assert!(
        gateway
            .pod(canary.metadata.name.as_deref().unwrap())
            .is_none(),
        "stale canary deleted"
    );

    reconcile_workload(&gateway, "web").await;
    let replacement = only_canary(&gateway, "web");
    assert_eq!(
        replacement.spec.containers[0].image.as_deref(),
        Some("web:v3"),
        "replacement canary runs the rewritten image"
    );
}

#[tokio::test]
async fn out_of_band_duplicates_refuse_the_spawn() {
    let gateway = Arc::new(FakeGateway::new("default"));
    gateway.put_workload(canary_workload("web", "web", "web:v2", "web:v1"));
    gateway.put_pod(canary_pod("rogue-canary-1", "web", "web:v2", 0));

    let indexer = seed_workload_indexer(&gateway, "web");
    let reconciler = DeploymentReconciler::new(gateway.clone() as Arc<dyn ClusterGateway>);
    let result = reconciler.reconcile("default/web", &indexer).await;
    assert!(result.is_err(), "spawn refused with an error");

    let dc = gateway.workload("web").expect("workload stored");
    assert!(
        !dc.metadata.annotations.contains_key(ANNOTATION_CANARY_POD),
        "annotation state preserved"
    );
    assert_eq!(gateway.pods().len(), 1, "no second canary created");
}

#[tokio::test]
async fn nothing_to_do_performs_zero_mutations() {
    let gateway = Arc::new(FakeGateway::new("default"));
    let mut dc = canary_workload("web", "web", "web:v2", "web:v1");
    dc.metadata
        .annotations
        .insert(ANNOTATION_CANARY_POD.to_string(), "web-canary-00001".to_string());
    gateway.put_workload(dc);

    reconcile_workload(&gateway, "web").await;
    assert!(
        gateway.mutation_log().is_empty(),
        "nothing-to-do must not touch the orchestrator"
    );
}

#[tokio::test]
async fn promotion_is_idempotent() {
    let gateway = Arc::new(FakeGateway::new("default"));
    gateway.put_workload(canary_workload("web", "web", "web:v2", "web:v1"));

    reconcile_workload(&gateway, "web").await;
    let mut canary = only_canary(&gateway, "web");
    canary.metadata.creation_timestamp = Some(Utc::now() - ChronoDuration::minutes(20));
    gateway.put_pod(canary.clone());

    reconcile_canary(&gateway, &canary).await;
    let first = gateway.workload("web").expect("workload after first pass");

    // A second pass over the same (cached) pod observes the same state.
    reconcile_canary(&gateway, &canary).await;
    let second = gateway.workload("web").expect("workload after second pass");

    assert_eq!(
        serde_json::to_value(&first).expect("encode first"),
        serde_json::to_value(&second).expect("encode second"),
        "promotion applied twice yields the same workload"
    );
}

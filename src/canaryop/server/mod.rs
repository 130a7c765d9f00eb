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

use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::canaryop::gateway::ClusterGateway;
use crate::canaryop::logger::{log_error, log_info, log_warn};
use crate::canaryop::observability::metrics;
use crate::canaryop::operator::LABEL_APP;
use crate::canaryop::util::with_context;

const COMPONENT: &str = "server";
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";
const POD_NAME_LABEL: &str = "kubernetes_pod_name";
const KILLED_BY_ANNOTATION: &str = "killed-by";
const KILLED_BY_VALUE: &str = "pod-killer";

/// Alert-manager webhook message, reduced to the labels the handler reads.
#[derive(Debug, Deserialize)]
struct WebhookMessage {
    #[serde(rename = "commonLabels", default)]
    common_labels: HashMap<String, String>,
}

pub fn build_router(gateway: Arc<dyn ClusterGateway>) -> Router {
    Router::new()
        .route("/kill", post(kill_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(gateway)
}

async fn kill_handler(
    State(gateway): State<Arc<dyn ClusterGateway>>,
    body: Bytes,
) -> StatusCode {
    let message: WebhookMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(err) => {
            log_warn(
                COMPONENT,
                "Failed to unmarshal webhook body",
                &[("error", err.to_string().as_str())],
            );
            return StatusCode::BAD_REQUEST;
        }
    };

    let Some(pod_name) = message.common_labels.get(POD_NAME_LABEL) else {
        log_warn(
            COMPONENT,
            "Webhook message carries no pod name",
            &[("label", POD_NAME_LABEL)],
        );
        return StatusCode::BAD_REQUEST;
    };

    log_info(COMPONENT, "Got a request to kill a pod", &[("pod", pod_name)]);

    match kill(gateway.as_ref(), pod_name).await {
        Ok(()) => StatusCode::OK,
        Err(status) => status,
    }
}

/// Annotates the named pod with its executioner, then deletes it.
async fn kill(gateway: &dyn ClusterGateway, pod_name: &str) -> Result<(), StatusCode> {
    let mut pod = match gateway.get_pod(pod_name).await {
        Ok(pod) => pod,
        Err(err) if err.is_not_found() => return Err(StatusCode::NOT_FOUND),
        Err(err) => {
            log_error(
                COMPONENT,
                "Failed to fetch pod",
                &[("pod", pod_name), ("error", err.to_string().as_str())],
            );
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    pod.metadata
        .annotations
        .insert(KILLED_BY_ANNOTATION.to_string(), KILLED_BY_VALUE.to_string());
    if let Err(err) = gateway.update_pod(&pod).await {
        log_error(
            COMPONENT,
            "Failed to annotate pod",
            &[("pod", pod_name), ("error", err.to_string().as_str())],
        );
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    if let Err(err) = gateway.delete_pod(pod_name).await {
        log_error(
            COMPONENT,
            "Failed to kill pod",
            &[("pod", pod_name), ("error", err.to_string().as_str())],
        );
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let deployment = pod
        .metadata
        .labels
        .get(LABEL_APP)
        .map(String::as_str)
        .unwrap_or_default();
    metrics::record_kill(deployment);
    Ok(())
}

async fn metrics_handler() -> Response {
    match metrics::gather() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

/// Serves the webhook until the shutdown signal fires, then finishes
/// in-flight requests and returns.
pub async fn serve(
    addr: SocketAddr,
    gateway: Arc<dyn ClusterGateway>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let app = build_router(gateway);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| with_context(err, format!("Failed to bind server listener at {addr}")))?;

    let listen_addr = addr.to_string();
    log_info(
        COMPONENT,
        "HTTP server listening",
        &[("addr", listen_addr.as_str())],
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|err| with_context(err, "HTTP server failed"))?;

    log_info(COMPONENT, "HTTP server stopped", &[]);
    Ok(())
}

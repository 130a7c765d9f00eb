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
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::canaryop::config::{self, Config};
use crate::canaryop::gateway::{ClusterGateway, GatewayError, WatchStream};
use crate::canaryop::k8s::{
    DeploymentConfig, DeploymentConfigList, Pod, PodList, WatchEvent,
};
use crate::canaryop::logger::{log_info, log_warn};
use crate::canaryop::util::with_context;

const COMPONENT: &str = "gateway";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const WATCH_TIMEOUT_SECONDS: u64 = 300;
const WATCH_CHANNEL_CAPACITY: usize = 64;

const WORKLOAD_API_PREFIX: [&str; 3] = ["apis", "apps.openshift.io", "v1"];
const POD_API_PREFIX: [&str; 2] = ["api", "v1"];

/// Gateway backed by the orchestrator's REST API, authenticated with the
/// ambient service-account identity.
pub struct HttpGateway {
    client: Client,
    base: Url,
    token: Option<String>,
    namespace: String,
}

impl HttpGateway {
    /// Discovers the namespace and credentials and builds the HTTP client.
    /// Any failure here is fatal to the process.
    pub fn bootstrap() -> Result<Self, Box<dyn Error + Send + Sync>> {
        let namespace = config::read_namespace()?;
        let token = config::read_token();
        let endpoint = Config::Server.value();
        let base = Url::parse(&endpoint)
            .map_err(|err| with_context(err, format!("Invalid server endpoint '{}'", endpoint)))?;
        let client = Client::builder()
            .build()
            .map_err(|err| with_context(err, "Failed to build orchestrator HTTP client"))?;

        log_info(
            COMPONENT,
            "Cluster gateway initialised",
            &[("namespace", namespace.as_str()), ("server", endpoint.as_str())],
        );

        Ok(Self {
            client,
            base,
            token,
            namespace,
        })
    }

    fn url_from_segments(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| GatewayError::Invalid("server endpoint cannot be a base".into()))?;
            path.extend(segments);
        }
        Ok(url)
    }

    fn workload_collection(&self) -> Vec<String> {
        let mut segments: Vec<String> =
            WORKLOAD_API_PREFIX.iter().map(|s| s.to_string()).collect();
        segments.push("namespaces".to_string());
        segments.push(self.namespace.clone());
        segments.push("deploymentconfigs".to_string());
        segments
    }

    fn pod_collection(&self) -> Vec<String> {
        let mut segments: Vec<String> = POD_API_PREFIX.iter().map(|s| s.to_string()).collect();
        segments.push("namespaces".to_string());
        segments.push(self.namespace.clone());
        segments.push("pods".to_string());
        segments
    }

    fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn error_from_response(
        response: Response,
        kind: &'static str,
        name: &str,
    ) -> GatewayError {
        let status = response.status();
        let message = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => GatewayError::NotFound {
                kind,
                name: name.to_string(),
            },
            StatusCode::CONFLICT => GatewayError::Conflict(if message.is_empty() {
                format!("{} '{}'", kind, name)
            } else {
                message
            }),
            _ => GatewayError::Api {
                status: status.as_u16(),
                message: if message.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string()
                } else {
                    message
                },
            },
        }
    }

    async fn handle_json<T: DeserializeOwned>(
        response: Response,
        kind: &'static str,
        name: &str,
    ) -> Result<T, GatewayError> {
        if !response.status().is_success() {
            return Err(Self::error_from_response(response, kind, name).await);
        }
        response.json::<T>().await.map_err(GatewayError::from)
    }

    async fn watch_resource<T>(
        &self,
        collection: Vec<String>,
        kind: &'static str,
        selector: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<T>, GatewayError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let refs: Vec<&str> = collection.iter().map(String::as_str).collect();
        let url = self.url_from_segments(&refs)?;

        let mut query: Vec<(&str, String)> = vec![
            ("watch", "true".to_string()),
            ("timeoutSeconds", WATCH_TIMEOUT_SECONDS.to_string()),
            ("allowWatchBookmarks", "true".to_string()),
        ];
        if !selector.is_empty() {
            query.push(("labelSelector", selector.to_string()));
        }
        if let Some(rv) = resource_version {
            query.push(("resourceVersion", rv));
        }
        let pairs: Vec<(&str, &str)> = query.iter().map(|(k, v)| (*k, v.as_str())).collect();

        let request = self
            .client
            .get(url)
            .query(&pairs)
            .timeout(Duration::from_secs(WATCH_TIMEOUT_SECONDS + 30));
        let response = self.apply_auth(request).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response, kind, "watch").await);
        }

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = tx.send(Err(GatewayError::from(err))).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&bytes);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line = buffer.drain(..=pos).collect::<Vec<u8>>();
                    if forward_watch_line(&line, kind, &tx).await.is_err() {
                        return;
                    }
                }
            }
            if !buffer.is_empty() {
                let _ = forward_watch_line(&buffer, kind, &tx).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

async fn forward_watch_line<T: DeserializeOwned>(
    line: &[u8],
    kind: &'static str,
    tx: &mpsc::Sender<Result<WatchEvent<T>, GatewayError>>,
) -> Result<(), ()> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(err) => {
            log_warn(
                COMPONENT,
                "Dropping undecodable watch frame",
                &[("kind", kind), ("error", err.to_string().as_str())],
            );
            return Ok(());
        }
    };
    if text.is_empty() {
        return Ok(());
    }
    match serde_json::from_str::<WatchEvent<T>>(text) {
        Ok(event) => tx.send(Ok(event)).await.map_err(|_| ()),
        Err(err) => {
            // A frame that fails to decode breaks the stream; the consumer
            // falls back to a fresh list.
            let _ = tx
                .send(Err(GatewayError::Invalid(format!(
                    "undecodable {} watch event: {}",
                    kind, err
                ))))
                .await;
            Err(())
        }
    }
}

#[async_trait]
impl ClusterGateway for HttpGateway {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn list_workloads(
        &self,
        selector: &str,
    ) -> Result<Vec<DeploymentConfig>, GatewayError> {
        let collection = self.workload_collection();
        let refs: Vec<&str> = collection.iter().map(String::as_str).collect();
        let url = self.url_from_segments(&refs)?;
        let mut request = self.client.get(url).timeout(REQUEST_TIMEOUT);
        if !selector.is_empty() {
            request = request.query(&[("labelSelector", selector)]);
        }
        let response = self.apply_auth(request).send().await?;
        let list: DeploymentConfigList =
            Self::handle_json(response, "DeploymentConfig", "list").await?;
        Ok(list.items)
    }

    async fn get_workload(&self, name: &str) -> Result<DeploymentConfig, GatewayError> {
        let mut collection = self.workload_collection();
        collection.push(name.to_string());
        let refs: Vec<&str> = collection.iter().map(String::as_str).collect();
        let url = self.url_from_segments(&refs)?;
        let request = self.client.get(url).timeout(REQUEST_TIMEOUT);
        let response = self.apply_auth(request).send().await?;
        Self::handle_json(response, "DeploymentConfig", name).await
    }

    async fn update_workload(
        &self,
        workload: &DeploymentConfig,
    ) -> Result<DeploymentConfig, GatewayError> {
        let name = workload.name().to_string();
        if name.is_empty() {
            return Err(GatewayError::Invalid("workload has no name".into()));
        }
        let mut collection = self.workload_collection();
        collection.push(name.clone());
        let refs: Vec<&str> = collection.iter().map(String::as_str).collect();
        let url = self.url_from_segments(&refs)?;
        let request = self
            .client
            .put(url)
            .timeout(REQUEST_TIMEOUT)
            .json(workload);
        let response = self.apply_auth(request).send().await?;
        Self::handle_json(response, "DeploymentConfig", &name).await
    }

    async fn watch_workloads(
        &self,
        selector: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<DeploymentConfig>, GatewayError> {
        self.watch_resource(
            self.workload_collection(),
            "DeploymentConfig",
            selector,
            resource_version,
        )
        .await
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, GatewayError> {
        let collection = self.pod_collection();
        let refs: Vec<&str> = collection.iter().map(String::as_str).collect();
        let url = self.url_from_segments(&refs)?;
        let mut request = self.client.get(url).timeout(REQUEST_TIMEOUT);
        if !selector.is_empty() {
            request = request.query(&[("labelSelector", selector)]);
        }
        let response = self.apply_auth(request).send().await?;
        let list: PodList = Self::handle_json(response, "Pod", "list").await?;
        Ok(list.items)
    }

    async fn get_pod(&self, name: &str) -> Result<Pod, GatewayError> {
        let mut collection = self.pod_collection();
        collection.push(name.to_string());
        let refs: Vec<&str> = collection.iter().map(String::as_str).collect();
        let url = self.url_from_segments(&refs)?;
        let request = self.client.get(url).timeout(REQUEST_TIMEOUT);
        let response = self.apply_auth(request).send().await?;
        Self::handle_json(response, "Pod", name).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, GatewayError> {
        let collection = self.pod_collection();
        let refs: Vec<&str> = collection.iter().map(String::as_str).collect();
        let url = self.url_from_segments(&refs)?;
        let request = self.client.post(url).timeout(REQUEST_TIMEOUT).json(pod);
        let response = self.apply_auth(request).send().await?;
        Self::handle_json(response, "Pod", "create").await
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, GatewayError> {
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| GatewayError::Invalid("pod has no name".into()))?;
        let mut collection = self.pod_collection();
        collection.push(name.clone());
        let refs: Vec<&str> = collection.iter().map(String::as_str).collect();
        let url = self.url_from_segments(&refs)?;
        let request = self.client.put(url).timeout(REQUEST_TIMEOUT).json(pod);
        let response = self.apply_auth(request).send().await?;
        Self::handle_json(response, "Pod", &name).await
    }

    async fn delete_pod(&self, name: &str) -> Result<(), GatewayError> {
        let mut collection = self.pod_collection();
        collection.push(name.to_string());
        let refs: Vec<&str> = collection.iter().map(String::as_str).collect();
        let url = self.url_from_segments(&refs)?;
        let request = self.client.delete(url).timeout(REQUEST_TIMEOUT);
        let response = self.apply_auth(request).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from_response(response, "Pod", name).await)
        }
    }

    async fn watch_pods(
        &self,
        selector: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<Pod>, GatewayError> {
        self.watch_resource(self.pod_collection(), "Pod", selector, resource_version)
            .await
    }
}

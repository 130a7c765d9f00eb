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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use canaryop::canaryop::config::Config;
use canaryop::canaryop::controller::Controller;
use canaryop::canaryop::gateway::{
    ClusterGateway, HttpGateway, PodListerWatcher, WorkloadListerWatcher,
};
use canaryop::canaryop::logger::{log_error, log_info, set_log_format, LogFormat};
use canaryop::canaryop::operator::deployment::DeploymentReconciler;
use canaryop::canaryop::operator::pod::PodReconciler;
use canaryop::canaryop::operator::CANARY_SELECTOR;
use canaryop::canaryop::server;

const COMPONENT: &str = "main";
const POD_RESYNC: Duration = Duration::from_secs(60);
const CONTROLLER_THREADINESS: usize = 1;

#[tokio::main]
async fn main() {
    if Config::LogFormat.value().eq_ignore_ascii_case("json") {
        set_log_format(LogFormat::Json);
    }

    let gateway: Arc<dyn ClusterGateway> = match HttpGateway::bootstrap() {
        Ok(gateway) => Arc::new(gateway),
        Err(err) => {
            log_error(
                COMPONENT,
                "Failed to initialise cluster gateway",
                &[("error", err.to_string().as_str())],
            );
            std::process::exit(1);
        }
    };

    let listen = Config::Listen.value();
    let addr: SocketAddr = match listen.parse() {
        Ok(addr) => addr,
        Err(err) => {
            log_error(
                COMPONENT,
                "Invalid listen address",
                &[("addr", listen.as_str()), ("error", err.to_string().as_str())],
            );
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();

    let deployment_controller = Controller::new(
        "deployment",
        Arc::new(WorkloadListerWatcher::new(
            Arc::clone(&gateway),
            CANARY_SELECTOR,
        )),
        None,
        Arc::new(DeploymentReconciler::new(Arc::clone(&gateway))),
    );
    let pod_controller = Controller::new(
        "pod",
        Arc::new(PodListerWatcher::new(Arc::clone(&gateway), CANARY_SELECTOR)),
        Some(POD_RESYNC),
        Arc::new(PodReconciler::new(Arc::clone(&gateway))),
    );

    let deployment_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = deployment_controller
                .run(CONTROLLER_THREADINESS, shutdown)
                .await
            {
                log_error(
                    "deployment",
                    "Controller exited with error",
                    &[("error", err.to_string().as_str())],
                );
            }
        })
    };
    let pod_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = pod_controller.run(CONTROLLER_THREADINESS, shutdown).await {
                log_error(
                    "pod",
                    "Controller exited with error",
                    &[("error", err.to_string().as_str())],
                );
            }
        })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::interrupt()) {
                Ok(mut sigint) => {
                    sigint.recv().await;
                    log_info(COMPONENT, "Interrupt received, shutting down", &[]);
                    shutdown.cancel();
                }
                Err(err) => {
                    log_error(
                        COMPONENT,
                        "Failed to install signal handler",
                        &[("error", err.to_string().as_str())],
                    );
                }
            }
        });
    }

    if let Err(err) = server::serve(addr, Arc::clone(&gateway), shutdown.clone()).await {
        log_error(
            COMPONENT,
            "HTTP server failed",
            &[("error", err.to_string().as_str())],
        );
        shutdown.cancel();
        let _ = deployment_task.await;
        let _ = pod_task.await;
        std::process::exit(1);
    }

    // The server only returns cleanly after the shutdown signal; wait for
    // both controllers to drain their queues before exiting.
    shutdown.cancel();
    let _ = deployment_task.await;
    let _ = pod_task.await;
    log_info(COMPONENT, "Shutdown complete", &[]);
}

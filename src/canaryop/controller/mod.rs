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
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::canaryop::logger::{log_error, log_info, log_warn};
use crate::canaryop::observability::metrics::{self, ControllerReconcileResult};
use crate::canaryop::util::new_error;

pub mod informer;
pub mod queue;

pub use informer::{Indexer, Informer, ListerWatcher};
pub use queue::RateLimitingQueue;

const MAX_RETRIES: u32 = 5;
const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

/// The reconcile capability: one operation, performed against the latest
/// cached view of the keyed object. Implementations own their collaborators.
#[async_trait]
pub trait Reconciler<T>: Send + Sync + 'static {
    async fn reconcile(
        &self,
        key: &str,
        indexer: &Indexer<T>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Informer-backed controller: indexer, rate-limited work queue, and a pool
/// of identical workers applying a `Reconciler`.
pub struct Controller<T> {
    name: &'static str,
    informer: Arc<Informer<T>>,
    indexer: Indexer<T>,
    queue: RateLimitingQueue,
    worker: Arc<dyn Reconciler<T>>,
}

impl<T: crate::canaryop::k8s::meta::ClusterResource> Controller<T> {
    pub fn new(
        name: &'static str,
        lister_watcher: Arc<dyn ListerWatcher<T>>,
        resync: Option<Duration>,
        worker: Arc<dyn Reconciler<T>>,
    ) -> Self {
        let indexer = Indexer::new();
        let queue = RateLimitingQueue::new();
        let informer = Arc::new(Informer::new(
            name,
            lister_watcher,
            indexer.clone(),
            queue.clone(),
            resync,
        ));
        Self {
            name,
            informer,
            indexer,
            queue,
            worker,
        }
    }

    #[cfg(test)]
    pub fn indexer(&self) -> Indexer<T> {
        self.indexer.clone()
    }

    /// Runs the informer and `threadiness` workers until the shutdown
    /// signal fires, then drains and returns.
    pub async fn run(
        &self,
        threadiness: usize,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        log_info(self.name, "Starting controller", &[]);

        let informer_task = {
            let informer = Arc::clone(&self.informer);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { informer.run(shutdown).await })
        };

        if !self.informer.wait_for_sync(&shutdown).await {
            self.queue.shut_down();
            let _ = informer_task.await;
            return Err(new_error(format!(
                "{}: shutdown before cache sync",
                self.name
            )));
        }

        let mut workers = Vec::with_capacity(threadiness.max(1));
        for _ in 0..threadiness.max(1) {
            let queue = self.queue.clone();
            let indexer = self.indexer.clone();
            let worker = Arc::clone(&self.worker);
            let name = self.name;
            workers.push(tokio::spawn(supervise_worker(
                name, queue, indexer, worker,
            )));
        }

        shutdown.cancelled().await;
        log_info(self.name, "Stopping controller", &[]);
        self.queue.shut_down();
        for handle in workers {
            let _ = handle.await;
        }
        let _ = informer_task.await;
        Ok(())
    }
}

/// Restarts the worker loop after a panic; a clean exit means the queue has
/// shut down.
async fn supervise_worker<T: Clone + Send + Sync + 'static>(
    name: &'static str,
    queue: RateLimitingQueue,
    indexer: Indexer<T>,
    worker: Arc<dyn Reconciler<T>>,
) {
    loop {
        let handle = tokio::spawn(worker_loop(
            name,
            queue.clone(),
            indexer.clone(),
            Arc::clone(&worker),
        ));
        match handle.await {
            Ok(()) => return,
            Err(err) if err.is_panic() => {
                log_error(name, "Worker panicked, restarting", &[]);
                sleep(WORKER_RESTART_DELAY).await;
            }
            Err(_) => return,
        }
    }
}

async fn worker_loop<T: Clone + Send + Sync + 'static>(
    name: &'static str,
    queue: RateLimitingQueue,
    indexer: Indexer<T>,
    worker: Arc<dyn Reconciler<T>>,
) {
    while let Some(key) = queue.get().await {
        match worker.reconcile(&key, &indexer).await {
            Ok(()) => {
                queue.forget(&key);
                metrics::record_controller_reconcile(name, ControllerReconcileResult::Success);
            }
            Err(err) => {
                metrics::record_controller_reconcile(name, ControllerReconcileResult::Error);
                if queue.num_requeues(&key) < MAX_RETRIES {
                    log_warn(
                        name,
                        "Reconcile failed, requeueing",
                        &[("key", key.as_str()), ("error", err.to_string().as_str())],
                    );
                    queue.add_rate_limited(&key);
                } else {
                    queue.forget(&key);
                    metrics::record_dropped_key(name);
                    log_error(
                        name,
                        "Dropping key out of the queue",
                        &[("key", key.as_str()), ("error", err.to_string().as_str())],
                    );
                }
            }
        }
        queue.done(&key);
    }
}

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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::canaryop::controller::queue::RateLimitingQueue;
use crate::canaryop::gateway::{GatewayError, WatchStream};
use crate::canaryop::k8s::meta::ClusterResource;
use crate::canaryop::logger::{log_debug, log_info, log_warn};

const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;

/// Supplies the initial listing and the watch stream for one resource kind,
/// already scoped to the selector the controller cares about.
#[async_trait]
pub trait ListerWatcher<T>: Send + Sync {
    async fn list(&self) -> Result<Vec<T>, GatewayError>;

    async fn watch(
        &self,
        resource_version: Option<String>,
    ) -> Result<WatchStream<T>, GatewayError>;
}

/// Local cache keyed by `namespace/name` with O(1) get-by-key.
///
/// Workers read while the informer writes; reads hand out clones so a
/// worker never observes a half-applied update.
pub struct Indexer<T> {
    items: Arc<RwLock<HashMap<String, T>>>,
}

impl<T> Clone for Indexer<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T: Clone> Indexer<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let items = self.items.read().expect("indexer poisoned");
        items.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let items = self.items.read().expect("indexer poisoned");
        items.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let items = self.items.read().expect("indexer poisoned");
        items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn upsert(&self, key: String, object: T) {
        let mut items = self.items.write().expect("indexer poisoned");
        items.insert(key, object);
    }

    pub fn remove(&self, key: &str) {
        let mut items = self.items.write().expect("indexer poisoned");
        items.remove(key);
    }

    fn replace(&self, new_items: HashMap<String, T>) {
        let mut items = self.items.write().expect("indexer poisoned");
        *items = new_items;
    }
}

impl<T: Clone> Default for Indexer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Long-running process that keeps the indexer aligned with the watch
/// stream and feeds reconcile keys into the work queue.
pub struct Informer<T> {
    name: &'static str,
    lister_watcher: Arc<dyn ListerWatcher<T>>,
    indexer: Indexer<T>,
    queue: RateLimitingQueue,
    resync: Option<Duration>,
    synced: AtomicBool,
    sync_notify: Notify,
}

impl<T: ClusterResource> Informer<T> {
    pub fn new(
        name: &'static str,
        lister_watcher: Arc<dyn ListerWatcher<T>>,
        indexer: Indexer<T>,
        queue: RateLimitingQueue,
        resync: Option<Duration>,
    ) -> Self {
        Self {
            name,
            lister_watcher,
            indexer,
            queue,
            resync,
            synced: AtomicBool::new(false),
            sync_notify: Notify::new(),
        }
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Blocks until the initial list has been delivered to the indexer, or
    /// the shutdown signal fires first.
    pub async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool {
        loop {
            if self.has_synced() {
                return true;
            }
            let notified = self.sync_notify.notified();
            if self.has_synced() {
                return true;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return self.has_synced(),
                _ = notified => {}
            }
        }
    }

    /// Runs the list-then-watch loop until shutdown. A broken watch stream
    /// triggers a backoff, a fresh list, and a replay of the indexed set as
    /// updates; the queue absorbs the duplicates.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut attempts: u32 = 0;
        let mut resync_ticker = self.resync.map(tokio::time::interval);
        if let Some(ticker) = resync_ticker.as_mut() {
            // The first tick fires immediately; consume it so resync starts
            // one full period after startup.
            ticker.tick().await;
        }

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let objects = match self.lister_watcher.list().await {
                Ok(objects) => {
                    attempts = 0;
                    objects
                }
                Err(err) => {
                    attempts = attempts.saturating_add(1);
                    log_warn(
                        self.name,
                        "Initial list failed",
                        &[("error", err.to_string().as_str())],
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = sleep(backoff_duration(attempts)) => continue,
                    }
                }
            };

            let mut resource_version = None;
            let mut snapshot = HashMap::with_capacity(objects.len());
            for object in objects {
                if let Some(rv) = object.metadata().resource_version.clone() {
                    resource_version = Some(rv);
                }
                if let Some(key) = object.key() {
                    snapshot.insert(key, object);
                }
            }
            let keys: Vec<String> = snapshot.keys().cloned().collect();
            self.indexer.replace(snapshot);
            if !self.has_synced() {
                self.synced.store(true, Ordering::Release);
                self.sync_notify.notify_waiters();
                log_info(
                    self.name,
                    "Cache synced",
                    &[("objects", keys.len().to_string().as_str())],
                );
            }
            for key in keys {
                self.queue.add(&key);
            }

            let mut stream = match self.lister_watcher.watch(resource_version.clone()).await {
                Ok(stream) => {
                    attempts = 0;
                    stream
                }
                Err(err) => {
                    attempts = attempts.saturating_add(1);
                    log_warn(
                        self.name,
                        "Watch connect failed",
                        &[("error", err.to_string().as_str())],
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = sleep(backoff_duration(attempts)) => continue,
                    }
                }
            };

            loop {
                let event = if let Some(ticker) = resync_ticker.as_mut() {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = ticker.tick() => {
                            self.resync_all();
                            continue;
                        }
                        event = stream.next() => event,
                    }
                } else {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        event = stream.next() => event,
                    }
                };

                match event {
                    Some(Ok(event)) => self.apply_event(event),
                    Some(Err(err)) => {
                        log_warn(
                            self.name,
                            "Watch stream error",
                            &[("error", err.to_string().as_str())],
                        );
                        break;
                    }
                    None => {
                        log_debug(self.name, "Watch stream ended", &[]);
                        break;
                    }
                }
            }
        }
    }

    fn apply_event(&self, event: crate::canaryop::k8s::WatchEvent<T>) {
        if event.event_type.eq_ignore_ascii_case("BOOKMARK") {
            return;
        }
        let Some(key) = event.object.key() else {
            log_warn(self.name, "Dropping event for unnamed object", &[]);
            return;
        };
        if event.event_type.eq_ignore_ascii_case("DELETED") {
            // The tombstone carries the object's final state; only its key
            // matters here.
            self.indexer.remove(&key);
        } else {
            self.indexer.upsert(key.clone(), event.object);
        }
        self.queue.add(&key);
    }

    fn resync_all(&self) {
        let keys = self.indexer.keys();
        log_debug(
            self.name,
            "Resync",
            &[("objects", keys.len().to_string().as_str())],
        );
        for key in keys {
            self.queue.add(&key);
        }
    }
}

fn backoff_duration(attempts: u32) -> Duration {
    let capped = attempts.min(6);
    let millis = BACKOFF_INITIAL_MS.saturating_mul(1u64 << capped);
    Duration::from_millis(millis.min(BACKOFF_MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canaryop::k8s::{ObjectMeta, Pod, PodSpec, WatchEvent};
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    struct ScriptedListerWatcher {
        objects: Vec<Pod>,
        events: Mutex<Option<mpsc::Receiver<Result<WatchEvent<Pod>, GatewayError>>>>,
    }

    #[async_trait]
    impl ListerWatcher<Pod> for ScriptedListerWatcher {
        async fn list(&self) -> Result<Vec<Pod>, GatewayError> {
            Ok(self.objects.clone())
        }

        async fn watch(
            &self,
            _resource_version: Option<String>,
        ) -> Result<super::WatchStream<Pod>, GatewayError> {
            let receiver = self
                .events
                .lock()
                .unwrap()
                .take()
                .expect("watch opened once");
            Ok(Box::pin(ReceiverStream::new(receiver)))
        }
    }

    fn pod(name: &str) -> Pod {
        Pod::new(
            ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            PodSpec::default(),
        )
    }

    #[tokio::test]
    async fn initial_list_populates_indexer_and_queue() {
        let (tx, rx) = mpsc::channel(8);
        let lw = Arc::new(ScriptedListerWatcher {
            objects: vec![pod("a"), pod("b")],
            events: Mutex::new(Some(rx)),
        });
        let indexer = Indexer::new();
        let queue = RateLimitingQueue::new();
        let informer = Arc::new(Informer::new(
            "test-informer",
            lw,
            indexer.clone(),
            queue.clone(),
            None,
        ));

        let shutdown = CancellationToken::new();
        let runner = {
            let informer = Arc::clone(&informer);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { informer.run(shutdown).await })
        };

        assert!(informer.wait_for_sync(&shutdown).await);
        assert_eq!(indexer.len(), 2);
        assert!(indexer.get("default/a").is_some());

        let mut keys = vec![
            queue.get().await.expect("first key"),
            queue.get().await.expect("second key"),
        ];
        keys.sort();
        assert_eq!(keys, vec!["default/a", "default/b"]);

        drop(tx);
        shutdown.cancel();
        let _ = runner.await;
    }

    #[tokio::test]
    async fn delete_events_evict_from_indexer() {
        let (tx, rx) = mpsc::channel(8);
        let lw = Arc::new(ScriptedListerWatcher {
            objects: vec![pod("a")],
            events: Mutex::new(Some(rx)),
        });
        let indexer = Indexer::new();
        let queue = RateLimitingQueue::new();
        let informer = Arc::new(Informer::new(
            "test-informer",
            lw,
            indexer.clone(),
            queue.clone(),
            None,
        ));

        let shutdown = CancellationToken::new();
        let runner = {
            let informer = Arc::clone(&informer);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { informer.run(shutdown).await })
        };
        assert!(informer.wait_for_sync(&shutdown).await);

        // Hold the list-seeded key in flight so the delete edge lands in
        // the dirty set and resurfaces once the key is released.
        let first = queue.get().await.expect("seeded key");
        tx.send(Ok(WatchEvent::deleted(pod("a"))))
            .await
            .expect("send delete");
        for _ in 0..100 {
            if indexer.get("default/a").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(indexer.get("default/a").is_none());

        queue.done(&first);
        let second = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .expect("delete key timeout")
            .expect("delete key");
        assert_eq!(second, "default/a");

        drop(tx);
        shutdown.cancel();
        let _ = runner.await;
    }
}

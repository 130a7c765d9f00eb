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

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep, Instant};

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_PER_KEY_DELAY: Duration = Duration::from_secs(1);
const MAX_TOTAL_DELAY: Duration = Duration::from_secs(10);
const BUCKET_RATE_PER_SECOND: f64 = 10.0;
const BUCKET_BURST: f64 = 100.0;

/// Set-based work queue with per-key rate limiting.
///
/// Keys already pending are de-duplicated; a key handed to a worker is held
/// in a processing set and cannot be dequeued again until `done` releases
/// it. Re-adds that arrive while the key is in flight are queued once the
/// key completes.
#[derive(Clone)]
pub struct RateLimitingQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
}

struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    bucket: TokenBucket,
    shut_down: bool,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            tokens: BUCKET_BURST,
            last_refill: Instant::now(),
        }
    }

    /// Reserves one token, returning how long the caller must wait for it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * BUCKET_RATE_PER_SECOND).min(BUCKET_BURST);
        self.last_refill = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / BUCKET_RATE_PER_SECOND)
        }
    }
}

impl Default for RateLimitingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitingQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    bucket: TokenBucket::new(),
                    shut_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueues a key unless it is already pending.
    pub fn add(&self, key: &str) {
        let mut state = self.inner.state.lock().expect("queue state poisoned");
        if state.shut_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Blocking dequeue. Returns `None` once the queue has been shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.inner.state.lock().expect("queue state poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Releases a key handed out by `get`. A key re-added while it was in
    /// flight is put back on the queue.
    pub fn done(&self, key: &str) {
        let mut state = self.inner.state.lock().expect("queue state poisoned");
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shut_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Re-enqueues a key after its per-key backoff delay, combined with the
    /// queue's global token bucket.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.inner.state.lock().expect("queue state poisoned");
            if state.shut_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let exponent = (*failures).min(31);
            *failures += 1;
            let per_key = BASE_DELAY
                .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
                .min(MAX_PER_KEY_DELAY);
            per_key.max(state.bucket.reserve()).min(MAX_TOTAL_DELAY)
        };

        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            queue.add(&key);
        });
    }

    /// Number of rate-limited requeues recorded for the key.
    pub fn num_requeues(&self, key: &str) -> u32 {
        let state = self.inner.state.lock().expect("queue state poisoned");
        state.failures.get(key).copied().unwrap_or(0)
    }

    /// Clears the key's backoff history.
    pub fn forget(&self, key: &str) {
        let mut state = self.inner.state.lock().expect("queue state poisoned");
        state.failures.remove(key);
    }

    /// Shuts the queue down; blocked `get` calls return `None`.
    pub fn shut_down(&self) {
        let mut state = self.inner.state.lock().expect("queue state poisoned");
        state.shut_down = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        let state = self.inner.state.lock().expect("queue state poisoned");
        state.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let queue = RateLimitingQueue::new();
        queue.add("default/web");
        queue.add("default/web");
        queue.add("default/web");
        assert_eq!(queue.len(), 1);

        let key = queue.get().await.expect("key available");
        assert_eq!(key, "default/web");
        assert!(queue.is_empty());
        queue.done(&key);
    }

    #[tokio::test]
    async fn in_flight_key_requeues_after_done() {
        let queue = RateLimitingQueue::new();
        queue.add("default/web");
        let key = queue.get().await.expect("key available");

        // Re-adds while processing must not surface until done() runs.
        queue.add(&key);
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        let again = queue.get().await.expect("requeued key");
        assert_eq!(again, key);
        queue.done(&again);
    }

    #[tokio::test]
    async fn rate_limited_requeue_counts_and_forgets() {
        let queue = RateLimitingQueue::new();
        assert_eq!(queue.num_requeues("default/web"), 0);

        queue.add_rate_limited("default/web");
        queue.add_rate_limited("default/web");
        assert_eq!(queue.num_requeues("default/web"), 2);

        let key = timeout(Duration::from_secs(2), queue.get())
            .await
            .expect("requeue delivered")
            .expect("key available");
        assert_eq!(key, "default/web");
        queue.done(&key);

        queue.forget("default/web");
        assert_eq!(queue.num_requeues("default/web"), 0);
    }

    #[tokio::test]
    async fn shutdown_unblocks_consumers() {
        let queue = RateLimitingQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        // Give the consumer a chance to block.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shut_down();
        let result = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("consumer returned")
            .expect("consumer task");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn adds_after_shutdown_are_ignored() {
        let queue = RateLimitingQueue::new();
        queue.shut_down();
        queue.add("default/web");
        assert!(queue.is_empty());
    }
}

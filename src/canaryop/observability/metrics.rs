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
use std::sync::OnceLock;

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static POD_KILLER_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CONTROLLER_DROPPED_KEYS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register canaryop metric collector");
    collector
}

fn pod_killer_total() -> &'static IntCounterVec {
    POD_KILLER_TOTAL.get_or_init(|| {
        let opts = Opts::new("pod_killer_total", "A count of pods killed per deployment");
        let counter = IntCounterVec::new(opts, &["deployment"])
            .expect("failed to build pod killer counter");
        register_collector(counter)
    })
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_reconciles_total",
            "Controller reconciliation attempts grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build controller reconcile counter");
        register_collector(counter)
    })
}

fn controller_dropped_keys_total() -> &'static IntCounterVec {
    CONTROLLER_DROPPED_KEYS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_dropped_keys_total",
            "Keys dropped from the work queue after exhausting retries",
        );
        let counter = IntCounterVec::new(opts, &["controller"])
            .expect("failed to build dropped keys counter");
        register_collector(counter)
    })
}

/// Reconciliation outcome recorded per worker invocation.
#[derive(Copy, Clone, Debug)]
pub enum ControllerReconcileResult {
    Success,
    Error,
}

impl ControllerReconcileResult {
    fn as_str(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Error => "error",
        }
    }
}

pub fn record_kill(deployment: &str) {
    pod_killer_total().with_label_values(&[deployment]).inc();
}

pub fn record_controller_reconcile(controller: &str, result: ControllerReconcileResult) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_str()])
        .inc();
}

pub fn record_dropped_key(controller: &str) {
    controller_dropped_keys_total()
        .with_label_values(&[controller])
        .inc();
}

/// Encodes the process registry in the Prometheus text exposition format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

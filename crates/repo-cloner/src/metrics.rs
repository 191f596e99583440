// Copyright 2025 HyperZoekt Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use axum::{extract::State, routing::get, Router};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide counters for the worker, exposed on `/metrics`.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    messages_received: AtomicU64,
    malformed_messages: AtomicU64,
    clones_succeeded: AtomicU64,
    clones_failed: AtomicU64,
    records_saved: AtomicU64,
    persistence_failures: AtomicU64,
    broker_errors: AtomicU64,
    reconnects: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_messages_received, messages_received, messages_received);
    counter!(inc_malformed_messages, malformed_messages, malformed_messages);
    counter!(inc_clones_succeeded, clones_succeeded, clones_succeeded);
    counter!(inc_clones_failed, clones_failed, clones_failed);
    counter!(inc_records_saved, records_saved, records_saved);
    counter!(inc_persistence_failures, persistence_failures, persistence_failures);
    counter!(inc_broker_errors, broker_errors, broker_errors);
    counter!(inc_reconnects, reconnects, reconnects);

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> String {
        let rows = [
            (
                "messages_received",
                "Messages taken off the queue",
                self.messages_received(),
            ),
            (
                "malformed_messages",
                "Messages dropped as malformed",
                self.malformed_messages(),
            ),
            (
                "clones_succeeded",
                "Repository clones that succeeded",
                self.clones_succeeded(),
            ),
            (
                "clones_failed",
                "Repository clones that failed",
                self.clones_failed(),
            ),
            ("records_saved", "Clone records persisted", self.records_saved()),
            (
                "persistence_failures",
                "Clone records that could not be persisted",
                self.persistence_failures(),
            ),
            (
                "broker_errors",
                "Errors talking to the message broker",
                self.broker_errors(),
            ),
            ("reconnects", "Broker reconnections", self.reconnects()),
        ];
        let mut out = String::new();
        for (name, help, value) in rows {
            out.push_str(&format!(
                "# HELP repo_cloner_{name}_total {help}\n\
                 # TYPE repo_cloner_{name}_total counter\n\
                 repo_cloner_{name}_total {value}\n"
            ));
        }
        out
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler(State(metrics): State<Arc<WorkerMetrics>>) -> String {
    metrics.render()
}

/// `/health` and `/metrics` endpoints.
pub fn router(metrics: Arc<WorkerMetrics>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

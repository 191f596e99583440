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
use crate::config::{PersistenceFailurePolicy, RecordPolicy};
use crate::consumer::{DeliveryContext, Disposition, MessageHandler};
use crate::db::{CloneRecord, RecordStore};
use crate::executor::CloneExecutor;
use crate::message;
use crate::metrics::WorkerMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::sync::Arc;

/// Source of record timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Turns one raw message into a clone attempt and, per policy, a record.
pub struct CloneWorker {
    executor: CloneExecutor,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    record_policy: RecordPolicy,
    on_persist_failure: PersistenceFailurePolicy,
    metrics: Arc<WorkerMetrics>,
}

impl CloneWorker {
    pub fn new(executor: CloneExecutor, store: Arc<dyn RecordStore>) -> Self {
        Self {
            executor,
            store,
            clock: Arc::new(SystemClock),
            record_policy: RecordPolicy::default(),
            on_persist_failure: PersistenceFailurePolicy::default(),
            metrics: Arc::new(WorkerMetrics::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_record_policy(mut self, policy: RecordPolicy) -> Self {
        self.record_policy = policy;
        self
    }

    pub fn with_persistence_failure_policy(mut self, policy: PersistenceFailurePolicy) -> Self {
        self.on_persist_failure = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<WorkerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    /// Handle one raw message body.
    ///
    /// Malformed bodies are dropped. A failed clone is logged and, under
    /// [`RecordPolicy::All`], recorded; it is never retried. The message is
    /// only requeued when a successful clone could not be recorded and the
    /// persistence-failure policy asks for it.
    pub async fn process(&self, raw: &[u8], ctx: &DeliveryContext) -> Disposition {
        self.metrics.inc_messages_received();
        let request = match message::parse(raw) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    "dropping malformed message {} from '{}': {}",
                    ctx.delivery_tag, ctx.queue, e
                );
                self.metrics.inc_malformed_messages();
                return Disposition::Drop;
            }
        };

        let outcome = self.executor.execute(&request).await;
        if outcome.succeeded() {
            self.metrics.inc_clones_succeeded();
            info!(
                "cloned {} into {} in {:.3}s",
                request.url,
                outcome.path().display(),
                outcome.duration_seconds()
            );
        } else {
            self.metrics.inc_clones_failed();
            error!(
                "clone of {} into {} failed: {}",
                request.url,
                outcome.path().display(),
                outcome.error_detail().unwrap_or_default()
            );
        }

        let should_record = outcome.succeeded() || self.record_policy == RecordPolicy::All;
        if !should_record {
            return Disposition::Ack;
        }

        let record = CloneRecord::from_outcome(&request, &outcome, self.clock.now());
        match self.store.save(&record).await {
            Ok(()) => {
                self.metrics.inc_records_saved();
                Disposition::Ack
            }
            Err(e) => {
                self.metrics.inc_persistence_failures();
                error!(
                    "failed to record clone of {} at {}: {}",
                    record.remote_url, record.path, e
                );
                if outcome.succeeded()
                    && self.on_persist_failure == PersistenceFailurePolicy::Requeue
                {
                    Disposition::Requeue
                } else {
                    Disposition::Ack
                }
            }
        }
    }
}

#[async_trait]
impl MessageHandler for CloneWorker {
    async fn handle(&self, body: &[u8], delivery: &DeliveryContext) -> Disposition {
        self.process(body, delivery).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRecordStore;
    use crate::error::CloneError;
    use crate::executor::CloneCapability;
    use chrono::TimeZone;
    use std::path::Path;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    struct Scripted(Result<(), CloneError>);

    #[async_trait]
    impl CloneCapability for Scripted {
        async fn clone_repo(&self, _remote_url: &str, _local_path: &Path) -> Result<(), CloneError> {
            self.0.clone()
        }
    }

    fn ctx() -> DeliveryContext {
        DeliveryContext {
            queue: "q".into(),
            delivery_tag: "t-1".into(),
            consumer_id: "c".into(),
            received_at: Utc::now(),
        }
    }

    fn worker(result: Result<(), CloneError>, store: Arc<MemoryRecordStore>) -> CloneWorker {
        let executor = CloneExecutor::new("/base", Arc::new(Scripted(result)));
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        CloneWorker::new(executor, store).with_clock(Arc::new(FixedClock(at)))
    }

    const BODY: &[u8] = br#"{"url":"https://h/r.git","name":"r"}"#;

    #[tokio::test]
    async fn success_is_recorded_and_acked() {
        let store = Arc::new(MemoryRecordStore::new());
        let w = worker(Ok(()), store.clone());
        assert_eq!(w.process(BODY, &ctx()).await, Disposition::Ack);
        let recs = store.records();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].path, "/base/r");
        assert_eq!(
            recs[0].cloned_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(w.metrics().records_saved(), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_dropped_without_clone() {
        let store = Arc::new(MemoryRecordStore::new());
        let w = worker(Ok(()), store.clone());
        assert_eq!(w.process(b"{oops", &ctx()).await, Disposition::Drop);
        assert_eq!(w.process(br#"{"name":"r"}"#, &ctx()).await, Disposition::Drop);
        assert!(store.records().is_empty());
        assert_eq!(w.metrics().malformed_messages(), 2);
        assert_eq!(w.metrics().clones_succeeded(), 0);
    }

    #[tokio::test]
    async fn failed_clone_is_not_recorded_by_default() {
        let store = Arc::new(MemoryRecordStore::new());
        let w = worker(Err(CloneError::new("denied")), store.clone());
        assert_eq!(w.process(BODY, &ctx()).await, Disposition::Ack);
        assert!(store.records().is_empty());
        assert_eq!(w.metrics().clones_failed(), 1);
    }

    #[tokio::test]
    async fn failed_clone_is_recorded_under_all_policy() {
        let store = Arc::new(MemoryRecordStore::new());
        let w = worker(Err(CloneError::new("denied")), store.clone())
            .with_record_policy(RecordPolicy::All);
        assert_eq!(w.process(BODY, &ctx()).await, Disposition::Ack);
        let recs = store.records();
        assert_eq!(recs.len(), 1);
        assert!(!recs[0].succeeded);
        assert_eq!(recs[0].error_detail.as_deref(), Some("denied"));
    }

    #[tokio::test]
    async fn persistence_failure_acks_by_default() {
        let store = Arc::new(MemoryRecordStore::new());
        store.fail_always(true);
        let w = worker(Ok(()), store.clone());
        assert_eq!(w.process(BODY, &ctx()).await, Disposition::Ack);
        assert_eq!(w.metrics().persistence_failures(), 1);
    }

    #[tokio::test]
    async fn persistence_failure_requeues_when_configured() {
        let store = Arc::new(MemoryRecordStore::new());
        store.fail_always(true);
        let w = worker(Ok(()), store.clone())
            .with_persistence_failure_policy(PersistenceFailurePolicy::Requeue);
        assert_eq!(w.process(BODY, &ctx()).await, Disposition::Requeue);
    }

    #[tokio::test]
    async fn failed_clone_record_failure_never_requeues() {
        let store = Arc::new(MemoryRecordStore::new());
        store.fail_always(true);
        let w = worker(Err(CloneError::new("denied")), store.clone())
            .with_record_policy(RecordPolicy::All)
            .with_persistence_failure_policy(PersistenceFailurePolicy::Requeue);
        assert_eq!(w.process(BODY, &ctx()).await, Disposition::Ack);
    }
}

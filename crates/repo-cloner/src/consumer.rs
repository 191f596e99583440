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

use crate::broker::{BrokerConnection, Dialer, QueueChannel};
use crate::error::ConnectionError;
use crate::metrics::WorkerMetrics;
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

pub use crate::broker::DeliveryContext;

/// How a handled delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processing finished; forget the message.
    Ack,
    /// Put the message back for another attempt.
    Requeue,
    /// The message can never succeed; acknowledge it so it is not redelivered.
    Drop,
}

/// Processes one message body and decides how it is settled.
///
/// Delivery is at-least-once: a message may be handled again after a crash
/// or lost acknowledgement, so implementations must tolerate duplicates.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &[u8], delivery: &DeliveryContext) -> Disposition;
}

/// Single-threaded receive loop: one delivery is handled and settled before
/// the next is taken.
pub struct QueueConsumer<D: Dialer> {
    connection: BrokerConnection<D>,
    wait: Duration,
    metrics: Arc<WorkerMetrics>,
}

impl<D: Dialer> QueueConsumer<D> {
    pub fn new(connection: BrokerConnection<D>, wait: Duration) -> Self {
        Self {
            connection,
            wait,
            metrics: Arc::new(WorkerMetrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<WorkerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Ensure the queue exists on the broker. Idempotent.
    pub async fn declare_queue(&mut self, name: &str) -> Result<(), ConnectionError> {
        let res = self.connection.ensure_connected().await?.declare_queue(name).await;
        if let Err(e) = &res {
            self.note_broker_error(e);
        }
        res
    }

    /// Consume `queue` until the connection is lost and a single reconnect
    /// attempt fails. Never returns otherwise.
    pub async fn consume<H>(&mut self, queue: &str, handler: &H) -> Result<Infallible, ConnectionError>
    where
        H: MessageHandler + ?Sized,
    {
        // dial generation the queue was last declared on
        let mut declared_at: Option<u64> = None;
        info!("consuming from queue '{}'", queue);

        loop {
            let before = self.connection.dial_attempts();
            self.connection.ensure_connected().await?;
            let dialed = self.connection.dial_attempts();
            if dialed != before && before > 0 {
                self.metrics.inc_reconnects();
            }
            if declared_at != Some(dialed) {
                match self.declare_queue(queue).await {
                    Ok(()) => declared_at = Some(dialed),
                    Err(e) => {
                        warn!("declaring queue '{}' failed: {}", queue, e);
                        if !e.is_disconnect() {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                        }
                        continue;
                    }
                }
            }

            let recovered = self
                .connection
                .ensure_connected()
                .await?
                .recover_orphans(queue)
                .await;
            match recovered {
                Ok(0) => {}
                Ok(n) => info!("recovered {} orphaned message(s) onto '{}'", n, queue),
                Err(e) => {
                    warn!("orphan recovery on '{}' failed: {}", queue, e);
                    self.note_broker_error(&e);
                    if e.is_disconnect() {
                        continue;
                    }
                }
            }

            let received = self
                .connection
                .ensure_connected()
                .await?
                .receive(queue, self.wait)
                .await;
            let delivery = match received {
                Ok(Some(d)) => d,
                Ok(None) => continue,
                Err(e) => {
                    warn!("receive on '{}' failed: {}", queue, e);
                    self.note_broker_error(&e);
                    if !e.is_disconnect() {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    continue;
                }
            };

            debug!(
                "received delivery {} ({} bytes) from '{}'",
                delivery.context.delivery_tag,
                delivery.body.len(),
                queue
            );
            let disposition =
                match AssertUnwindSafe(handler.handle(&delivery.body, &delivery.context))
                    .catch_unwind()
                    .await
                {
                    Ok(d) => d,
                    Err(_) => {
                        error!(
                            "handler panicked on delivery {}; dropping message",
                            delivery.context.delivery_tag
                        );
                        Disposition::Drop
                    }
                };
            self.settle(&delivery.context, disposition).await;
        }
    }

    // A settle failure leaves the message in flight; it is requeued when this
    // consumer next receives, or recovered by another consumer.
    async fn settle(&mut self, ctx: &DeliveryContext, disposition: Disposition) {
        if self.connection.state() == crate::broker::ConnectionState::Disconnected {
            warn!(
                "connection lost before settling {}; message will be redelivered",
                ctx.delivery_tag
            );
            return;
        }
        let res = match self.connection.ensure_connected().await {
            Ok(ch) => match disposition {
                Disposition::Ack | Disposition::Drop => ch.ack(ctx).await,
                Disposition::Requeue => ch.requeue(ctx).await,
            },
            Err(e) => Err(e),
        };
        match res {
            Ok(()) => debug!("settled {} as {:?}", ctx.delivery_tag, disposition),
            Err(e) => {
                warn!(
                    "failed to settle {} as {:?}: {}",
                    ctx.delivery_tag, disposition, e
                );
                self.note_broker_error(&e);
            }
        }
    }

    fn note_broker_error(&mut self, e: &ConnectionError) {
        self.metrics.inc_broker_errors();
        if e.is_disconnect() {
            self.connection.mark_disconnected();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use parking_lot::Mutex;

    struct Recording {
        seen: Mutex<Vec<Vec<u8>>>,
        answer: Disposition,
    }

    #[async_trait]
    impl MessageHandler for Recording {
        async fn handle(&self, body: &[u8], _delivery: &DeliveryContext) -> Disposition {
            self.seen.lock().push(body.to_vec());
            self.answer
        }
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        async fn handle(&self, _body: &[u8], _delivery: &DeliveryContext) -> Disposition {
            panic!("boom")
        }
    }

    fn consumer(broker: &MemoryBroker) -> QueueConsumer<MemoryBroker> {
        QueueConsumer::new(BrokerConnection::new(broker.dialer()), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn handles_each_message_once_in_order_and_acks() {
        let broker = MemoryBroker::new();
        broker.publish("q", "one");
        broker.publish("q", "two");
        broker.close_when_drained(true);
        let handler = Recording {
            seen: Mutex::new(Vec::new()),
            answer: Disposition::Ack,
        };

        let mut c = consumer(&broker);
        let err = c.consume("q", &handler).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Dial(_)));

        assert_eq!(*handler.seen.lock(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(broker.acked().len(), 2);
        assert_eq!(broker.in_flight(), 0);
        assert_eq!(broker.declared_queues(), vec!["q".to_string()]);
    }

    #[tokio::test]
    async fn drop_is_settled_as_ack() {
        let broker = MemoryBroker::new();
        broker.publish("q", "poison");
        broker.close_when_drained(true);
        let handler = Recording {
            seen: Mutex::new(Vec::new()),
            answer: Disposition::Drop,
        };
        let _ = consumer(&broker).consume("q", &handler).await;
        assert_eq!(broker.acked(), vec![b"poison".to_vec()]);
        assert_eq!(broker.pending("q"), 0);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_loop() {
        let broker = MemoryBroker::new();
        broker.publish("q", "a");
        broker.publish("q", "b");
        broker.close_when_drained(true);
        let _ = consumer(&broker).consume("q", &Panicking).await;
        assert_eq!(broker.acked().len(), 2);
    }

    #[tokio::test]
    async fn recovers_orphans_before_receiving() {
        let broker = MemoryBroker::new();
        broker.orphan("q", "left-behind");
        broker.close_when_drained(true);
        let handler = Recording {
            seen: Mutex::new(Vec::new()),
            answer: Disposition::Ack,
        };
        let _ = consumer(&broker).consume("q", &handler).await;
        assert_eq!(broker.recovered(), 1);
        assert_eq!(*handler.seen.lock(), vec![b"left-behind".to_vec()]);
    }

    #[tokio::test]
    async fn rejected_declare_is_retried_without_ending_the_loop() {
        let broker = MemoryBroker::new();
        broker.publish("q", "job");
        broker.reject_declares(2);
        broker.close_when_drained(true);
        let metrics = Arc::new(WorkerMetrics::new());
        let handler = Recording {
            seen: Mutex::new(Vec::new()),
            answer: Disposition::Ack,
        };

        let mut c = consumer(&broker).with_metrics(metrics.clone());
        let err = c.consume("q", &handler).await.unwrap_err();

        // only the drained-queue shutdown ends the loop
        assert!(matches!(err, ConnectionError::Dial(_)));
        assert_eq!(*handler.seen.lock(), vec![b"job".to_vec()]);
        assert_eq!(broker.declared_queues(), vec!["q".to_string()]);
        assert_eq!(broker.dial_count(), 2, "declare rejections do not redial");
        assert!(metrics.broker_errors() >= 2);
        assert_eq!(metrics.reconnects(), 0);
    }

    #[tokio::test]
    async fn unreachable_broker_fails_fast() {
        let broker = MemoryBroker::new();
        broker.refuse_dials(true);
        let handler = Recording {
            seen: Mutex::new(Vec::new()),
            answer: Disposition::Ack,
        };
        let err = consumer(&broker).consume("q", &handler).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Dial(_)));
        assert_eq!(broker.dial_count(), 1);
    }
}

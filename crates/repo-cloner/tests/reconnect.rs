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
use async_trait::async_trait;
use parking_lot::Mutex;
use repo_cloner::broker::{MemoryBroker, QueueChannel};
use repo_cloner::{
    BrokerConnection, ConnectionError, ConnectionState, DeliveryContext, Disposition,
    MessageHandler, QueueConsumer, WorkerMetrics,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn closed_connection_is_redialed_exactly_once() {
    let broker = MemoryBroker::new();
    let mut conn = BrokerConnection::new(broker.dialer());
    conn.ensure_connected().await.expect("first dial");
    assert_eq!(broker.dial_count(), 1);

    broker.drop_connections();
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    conn.ensure_connected()
        .await
        .expect("reconnect")
        .declare_queue("q")
        .await
        .expect("declare on fresh channel");
    assert_eq!(broker.dial_count(), 2);
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn failed_reconnect_surfaces_a_connection_error() {
    let broker = MemoryBroker::new();
    let mut conn = BrokerConnection::new(broker.dialer());
    conn.ensure_connected().await.expect("first dial");

    broker.drop_connections();
    broker.refuse_dials(true);
    let err = conn.ensure_connected().await.err().expect("reconnect must fail");
    assert!(matches!(err, ConnectionError::Dial(_)));
    assert_eq!(broker.dial_count(), 2, "one reconnect attempt, no retry loop");
}

/// Drops the broker connection while handling the first delivery.
struct Flaky {
    broker: MemoryBroker,
    seen: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl MessageHandler for Flaky {
    async fn handle(&self, body: &[u8], _delivery: &DeliveryContext) -> Disposition {
        let first = {
            let mut seen = self.seen.lock();
            seen.push(body.to_vec());
            seen.len() == 1
        };
        if first {
            self.broker.drop_connections();
        }
        Disposition::Ack
    }
}

#[tokio::test]
async fn message_in_flight_during_disconnect_is_redelivered() {
    let broker = MemoryBroker::new();
    broker.publish("q", "one");
    broker.publish("q", "two");
    broker.close_when_drained(true);
    let handler = Flaky {
        broker: broker.clone(),
        seen: Mutex::new(Vec::new()),
    };
    let metrics = Arc::new(WorkerMetrics::new());
    let mut consumer =
        QueueConsumer::new(BrokerConnection::new(broker.dialer()), Duration::from_millis(1))
            .with_metrics(metrics.clone());

    let _ = consumer.consume("q", &handler).await;

    // "one" was unacknowledged when the connection dropped, so it comes back
    let seen = handler.seen.lock().clone();
    assert_eq!(seen.iter().filter(|b| b.as_slice() == b"one").count(), 2);
    assert_eq!(seen.iter().filter(|b| b.as_slice() == b"two").count(), 1);
    assert_eq!(broker.recovered(), 1);
    assert_eq!(broker.in_flight(), 0);
    assert!(metrics.reconnects() >= 1);
}

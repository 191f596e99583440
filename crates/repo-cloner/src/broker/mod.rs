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

//! Message broker plumbing: a lazily reconnecting connection over a
//! pluggable transport, with a Redis reliable-queue realization and an
//! in-process broker used by tests.

pub mod connection;
pub mod memory;
pub mod redis;

pub use connection::{BrokerConnection, ConnectionState};
pub use memory::MemoryBroker;
pub use self::redis::RedisDialer;

use crate::error::ConnectionError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Where a delivery came from and how to settle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    pub queue: String,
    /// Broker handle for the in-flight copy of the message.
    pub delivery_tag: String,
    pub consumer_id: String,
    pub received_at: DateTime<Utc>,
}

/// One message taken off a queue. It stays in flight until acknowledged
/// or requeued through the channel that received it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub context: DeliveryContext,
}

/// An open channel to the broker.
#[async_trait]
pub trait QueueChannel: Send {
    /// Whether the transport has reported closure.
    fn is_closed(&self) -> bool;

    /// Ensure `name` exists. Safe to call repeatedly.
    async fn declare_queue(&mut self, name: &str) -> Result<(), ConnectionError>;

    /// Wait up to `wait` for the next message on `queue`.
    async fn receive(
        &mut self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, ConnectionError>;

    /// Mark a delivery consumed; the broker forgets it.
    async fn ack(&mut self, delivery: &DeliveryContext) -> Result<(), ConnectionError>;

    /// Return a delivery to its queue for redelivery.
    async fn requeue(&mut self, delivery: &DeliveryContext) -> Result<(), ConnectionError>;

    /// Move messages left in flight by dead consumers back onto `queue`.
    /// Returns how many were recovered.
    async fn recover_orphans(&mut self, queue: &str) -> Result<usize, ConnectionError>;
}

/// Opens channels to the broker.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Channel: QueueChannel;

    async fn dial(&self) -> Result<Self::Channel, ConnectionError>;
}

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

use super::{Delivery, DeliveryContext, Dialer, QueueChannel};
use crate::error::ConnectionError;
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::redis::{self, AsyncCommands, RedisError};
use deadpool_redis::{Config as RedisConfig, Connection, Pool};
use log::{debug, warn};
use std::time::Duration;

/// Set of every queue a consumer has declared.
pub const QUEUES_SET: &str = "repo_cloner:queues";
/// Prefix of per-consumer processing lists: `<prefix>:<queue>:<consumer_id>`.
pub const PROCESSING_PREFIX: &str = "repo_cloner:processing";
const LEASE_SUFFIX: &str = ":lease";

/// Dials Redis through a deadpool pool.
///
/// A delivery is moved atomically from the queue into this consumer's
/// processing list, so it survives a crash between receive and ack. A lease
/// key with a TTL marks the consumer alive; processing lists whose lease has
/// expired are drained back onto their queue by any live consumer.
pub struct RedisDialer {
    pool: Pool,
    consumer_id: String,
    lease_ttl: Duration,
}

impl RedisDialer {
    pub fn new(
        url: &str,
        consumer_id: impl Into<String>,
        lease_ttl: Duration,
    ) -> Result<Self, ConnectionError> {
        let pool = RedisConfig::from_url(url)
            .create_pool(None)
            .map_err(|e| ConnectionError::InvalidAddress(e.to_string()))?;
        Ok(Self {
            pool,
            consumer_id: consumer_id.into(),
            lease_ttl,
        })
    }
}

#[async_trait]
impl Dialer for RedisDialer {
    type Channel = RedisChannel;

    async fn dial(&self) -> Result<RedisChannel, ConnectionError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| ConnectionError::Dial(e.to_string()))?;
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| ConnectionError::Dial(e.to_string()))?;
        Ok(RedisChannel {
            conn,
            consumer_id: self.consumer_id.clone(),
            lease_ttl: self.lease_ttl,
            closed: false,
        })
    }
}

pub fn processing_key(queue: &str, consumer_id: &str) -> String {
    format!("{}:{}:{}", PROCESSING_PREFIX, queue, consumer_id)
}

pub fn lease_key(processing_key: &str) -> String {
    format!("{}{}", processing_key, LEASE_SUFFIX)
}

pub struct RedisChannel {
    conn: Connection,
    consumer_id: String,
    lease_ttl: Duration,
    closed: bool,
}

impl RedisChannel {
    // Transport-level failures close the channel; command errors leave it open.
    fn fail(&mut self, e: RedisError) -> ConnectionError {
        if e.is_io_error()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
            || e.is_timeout()
        {
            self.closed = true;
            ConnectionError::Lost(e.to_string())
        } else {
            ConnectionError::Command(e.to_string())
        }
    }

    async fn refresh_lease(&mut self, processing: &str) -> Result<(), ConnectionError> {
        let ttl = self.lease_ttl.as_secs().max(1);
        let res: Result<(), RedisError> = self
            .conn
            .set_ex(lease_key(processing), &self.consumer_id, ttl)
            .await;
        res.map_err(|e| self.fail(e))
    }

    /// Move everything in `from` back onto `queue`, oldest first.
    async fn drain_into(&mut self, from: &str, queue: &str) -> Result<usize, ConnectionError> {
        let mut moved = 0;
        loop {
            let res: Result<Option<Vec<u8>>, RedisError> =
                self.conn.rpoplpush(from, queue).await;
            match res {
                Ok(Some(_)) => moved += 1,
                Ok(None) => return Ok(moved),
                Err(e) => return Err(self.fail(e)),
            }
        }
    }
}

#[async_trait]
impl QueueChannel for RedisChannel {
    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn declare_queue(&mut self, name: &str) -> Result<(), ConnectionError> {
        let res: Result<i64, RedisError> = self.conn.sadd(QUEUES_SET, name).await;
        match res {
            Ok(added) => {
                if added > 0 {
                    debug!("declared queue '{}'", name);
                }
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn receive(
        &mut self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, ConnectionError> {
        let processing = processing_key(queue, &self.consumer_id);
        self.refresh_lease(&processing).await?;

        // A previous delivery that was never settled (ack lost with the old
        // connection) goes back on the queue before taking a new one.
        let stale = self.drain_into(&processing, queue).await?;
        if stale > 0 {
            warn!(
                "requeued {} unsettled message(s) from {} onto '{}'",
                stale, processing, queue
            );
        }

        // BRPOPLPUSH timeout is in seconds; 0 would block forever.
        let wait_secs = wait.as_secs_f64().max(1.0);
        let res: Result<Option<Vec<u8>>, RedisError> =
            self.conn.brpoplpush(queue, &processing, wait_secs).await;
        match res {
            Ok(Some(body)) => Ok(Some(Delivery {
                body,
                context: DeliveryContext {
                    queue: queue.to_string(),
                    delivery_tag: processing,
                    consumer_id: self.consumer_id.clone(),
                    received_at: Utc::now(),
                },
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn ack(&mut self, delivery: &DeliveryContext) -> Result<(), ConnectionError> {
        let res: Result<(), RedisError> = self.conn.del(&delivery.delivery_tag).await;
        res.map_err(|e| self.fail(e))
    }

    async fn requeue(&mut self, delivery: &DeliveryContext) -> Result<(), ConnectionError> {
        self.drain_into(&delivery.delivery_tag, &delivery.queue)
            .await
            .map(|_| ())
    }

    async fn recover_orphans(&mut self, queue: &str) -> Result<usize, ConnectionError> {
        let prefix = format!("{}:{}:", PROCESSING_PREFIX, queue);
        let res: Result<Vec<String>, RedisError> = self.conn.keys(format!("{}*", prefix)).await;
        let keys = res.map_err(|e| self.fail(e))?;

        let mut recovered = 0;
        for key in keys {
            if key.ends_with(LEASE_SUFFIX) || !key.starts_with(&prefix) {
                continue;
            }
            let res: Result<bool, RedisError> = self.conn.exists(lease_key(&key)).await;
            if res.map_err(|e| self.fail(e))? {
                continue;
            }
            let n = self.drain_into(&key, queue).await?;
            if n > 0 {
                warn!(
                    "recovered {} orphaned message(s) from {} onto '{}'",
                    n, key, queue
                );
            }
            recovered += n;
        }
        Ok(recovered)
    }
}

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
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// In-process broker with the same delivery semantics as the Redis queue.
///
/// Connection loss is simulated by bumping a generation counter: channels
/// dialed before the bump report closed and their in-flight messages become
/// recoverable orphans.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    declared: BTreeSet<String>,
    in_flight: HashMap<String, InFlight>,
    acked: Vec<Vec<u8>>,
    requeued: usize,
    recovered: usize,
    generation: u64,
    channel_generations: HashMap<u64, u64>,
    next_channel: u64,
    next_tag: u64,
    dials: u64,
    refuse_dials: bool,
    reject_declares: usize,
    close_when_drained: bool,
}

struct InFlight {
    queue: String,
    body: Vec<u8>,
    // 0 marks a message left behind by a consumer that no longer exists
    owner: u64,
}

impl State {
    fn owner_alive(&self, owner: u64) -> bool {
        owner != 0 && self.channel_generations.get(&owner) == Some(&self.generation)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialer(&self) -> MemoryBroker {
        self.clone()
    }

    pub fn publish(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut st = self.inner.lock();
        st.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(body.into());
    }

    /// Leave a message in flight as if its consumer had crashed mid-handling.
    pub fn orphan(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut st = self.inner.lock();
        st.next_tag += 1;
        let tag = format!("orphan-{}", st.next_tag);
        st.in_flight.insert(
            tag,
            InFlight {
                queue: queue.to_string(),
                body: body.into(),
                owner: 0,
            },
        );
    }

    pub fn pending(&self, queue: &str) -> usize {
        self.inner.lock().queues.get(queue).map_or(0, |q| q.len())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.inner.lock().acked.clone()
    }

    pub fn requeued(&self) -> usize {
        self.inner.lock().requeued
    }

    pub fn recovered(&self) -> usize {
        self.inner.lock().recovered
    }

    pub fn declared_queues(&self) -> Vec<String> {
        self.inner.lock().declared.iter().cloned().collect()
    }

    pub fn dial_count(&self) -> u64 {
        self.inner.lock().dials
    }

    /// Close every open channel.
    pub fn drop_connections(&self) {
        self.inner.lock().generation += 1;
    }

    /// Fail the next `n` queue declarations with a command error while
    /// keeping the connection open.
    pub fn reject_declares(&self, n: usize) {
        self.inner.lock().reject_declares = n;
    }

    pub fn refuse_dials(&self, refuse: bool) {
        self.inner.lock().refuse_dials = refuse;
    }

    /// Once a receive finds its queue empty, drop all connections and refuse
    /// further dials. Lets a consume loop run to completion in tests.
    pub fn close_when_drained(&self, close: bool) {
        self.inner.lock().close_when_drained = close;
    }
}

#[async_trait]
impl Dialer for MemoryBroker {
    type Channel = MemoryChannel;

    async fn dial(&self) -> Result<MemoryChannel, ConnectionError> {
        let mut st = self.inner.lock();
        st.dials += 1;
        if st.refuse_dials {
            return Err(ConnectionError::Dial("connection refused".to_string()));
        }
        st.next_channel += 1;
        let id = st.next_channel;
        let generation = st.generation;
        st.channel_generations.insert(id, generation);
        Ok(MemoryChannel {
            broker: self.clone(),
            id,
            generation,
        })
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    generation: u64,
}

impl MemoryChannel {
    fn check_open(&self, st: &State) -> Result<(), ConnectionError> {
        if st.generation != self.generation {
            return Err(ConnectionError::Lost(
                "memory broker connection dropped".to_string(),
            ));
        }
        Ok(())
    }

    fn requeue_stale(&self, st: &mut State, queue: &str) {
        let stale: Vec<String> = st
            .in_flight
            .iter()
            .filter(|(_, f)| f.owner == self.id && f.queue == queue)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in stale {
            if let Some(f) = st.in_flight.remove(&tag) {
                st.queues.entry(f.queue).or_default().push_back(f.body);
                st.requeued += 1;
            }
        }
    }
}

#[async_trait]
impl QueueChannel for MemoryChannel {
    fn is_closed(&self) -> bool {
        self.broker.inner.lock().generation != self.generation
    }

    async fn declare_queue(&mut self, name: &str) -> Result<(), ConnectionError> {
        let mut st = self.broker.inner.lock();
        self.check_open(&st)?;
        if st.reject_declares > 0 {
            st.reject_declares -= 1;
            return Err(ConnectionError::Command(format!(
                "declare of '{}' rejected",
                name
            )));
        }
        st.declared.insert(name.to_string());
        st.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn receive(
        &mut self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, ConnectionError> {
        {
            let mut st = self.broker.inner.lock();
            self.check_open(&st)?;
            self.requeue_stale(&mut st, queue);
            let next = st.queues.get_mut(queue).and_then(|q| q.pop_front());
            match next {
                Some(body) => {
                    st.next_tag += 1;
                    let tag = format!("memory-{}-{}", self.id, st.next_tag);
                    st.in_flight.insert(
                        tag.clone(),
                        InFlight {
                            queue: queue.to_string(),
                            body: body.clone(),
                            owner: self.id,
                        },
                    );
                    return Ok(Some(Delivery {
                        body,
                        context: DeliveryContext {
                            queue: queue.to_string(),
                            delivery_tag: tag,
                            consumer_id: format!("memory-{}", self.id),
                            received_at: Utc::now(),
                        },
                    }));
                }
                None if st.close_when_drained => {
                    st.generation += 1;
                    st.refuse_dials = true;
                    return Err(ConnectionError::Lost("queue drained".to_string()));
                }
                None => {}
            }
        }
        tokio::time::sleep(wait).await;
        Ok(None)
    }

    async fn ack(&mut self, delivery: &DeliveryContext) -> Result<(), ConnectionError> {
        let mut st = self.broker.inner.lock();
        self.check_open(&st)?;
        let f = st.in_flight.remove(&delivery.delivery_tag).ok_or_else(|| {
            ConnectionError::Command(format!("unknown delivery {}", delivery.delivery_tag))
        })?;
        st.acked.push(f.body);
        Ok(())
    }

    async fn requeue(&mut self, delivery: &DeliveryContext) -> Result<(), ConnectionError> {
        let mut st = self.broker.inner.lock();
        self.check_open(&st)?;
        let f = st.in_flight.remove(&delivery.delivery_tag).ok_or_else(|| {
            ConnectionError::Command(format!("unknown delivery {}", delivery.delivery_tag))
        })?;
        st.queues.entry(f.queue).or_default().push_back(f.body);
        st.requeued += 1;
        Ok(())
    }

    async fn recover_orphans(&mut self, queue: &str) -> Result<usize, ConnectionError> {
        let mut st = self.broker.inner.lock();
        self.check_open(&st)?;
        let orphaned: Vec<String> = st
            .in_flight
            .iter()
            .filter(|(_, f)| f.queue == queue && !st.owner_alive(f.owner))
            .map(|(tag, _)| tag.clone())
            .collect();
        let n = orphaned.len();
        for tag in orphaned {
            if let Some(f) = st.in_flight.remove(&tag) {
                st.queues.entry(f.queue).or_default().push_back(f.body);
            }
        }
        st.recovered += n;
        Ok(n)
    }
}

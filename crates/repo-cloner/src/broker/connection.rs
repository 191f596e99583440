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

use super::Dialer;
use super::QueueChannel;
use crate::error::ConnectionError;
use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Owns the single channel used by the consumer.
///
/// Every use goes through [`BrokerConnection::ensure_connected`], which
/// re-dials at most once when the channel is missing or reports closed.
/// Callers that need more resilience loop around it.
pub struct BrokerConnection<D: Dialer> {
    dialer: D,
    channel: Option<D::Channel>,
    dial_attempts: u64,
}

impl<D: Dialer> BrokerConnection<D> {
    /// A connection starts `Disconnected`; nothing is dialed until first use.
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            channel: None,
            dial_attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match &self.channel {
            Some(ch) if !ch.is_closed() => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Total number of dial attempts made so far, successful or not.
    pub fn dial_attempts(&self) -> u64 {
        self.dial_attempts
    }

    /// Open a fresh channel, replacing any existing one.
    pub async fn connect(&mut self) -> Result<&mut D::Channel, ConnectionError> {
        self.channel = None;
        self.dial_attempts += 1;
        match self.dialer.dial().await {
            Ok(ch) => {
                info!("broker connection established");
                Ok(self.channel.insert(ch))
            }
            Err(e) => {
                warn!("broker connection attempt failed: {}", e);
                Err(e)
            }
        }
    }

    /// Return the live channel, dialing once if it is missing or closed.
    pub async fn ensure_connected(&mut self) -> Result<&mut D::Channel, ConnectionError> {
        if self.state() == ConnectionState::Disconnected {
            if self.channel.is_some() {
                warn!("broker connection closed; reconnecting");
            }
            return self.connect().await;
        }
        self.channel
            .as_mut()
            .ok_or_else(|| ConnectionError::Lost("channel missing".to_string()))
    }

    /// Drop the current channel after a transport failure.
    pub fn mark_disconnected(&mut self) {
        if self.channel.take().is_some() {
            warn!("broker connection marked disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[tokio::test]
    async fn starts_disconnected_and_dials_lazily() {
        let broker = MemoryBroker::new();
        let mut conn = BrokerConnection::new(broker.dialer());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.dial_attempts(), 0);

        conn.ensure_connected().await.expect("connect");
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.dial_attempts(), 1);

        // already live: no further dial
        conn.ensure_connected().await.expect("connected");
        assert_eq!(conn.dial_attempts(), 1);
    }

    #[tokio::test]
    async fn closed_channel_triggers_exactly_one_reconnect() {
        let broker = MemoryBroker::new();
        let mut conn = BrokerConnection::new(broker.dialer());
        conn.ensure_connected().await.expect("connect");

        broker.drop_connections();
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.ensure_connected()
            .await
            .expect("reconnect")
            .declare_queue("q")
            .await
            .expect("declare");
        assert_eq!(conn.dial_attempts(), 2);
        assert_eq!(broker.dial_count(), 2);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn failed_reconnect_is_surfaced_after_one_attempt() {
        let broker = MemoryBroker::new();
        let mut conn = BrokerConnection::new(broker.dialer());
        conn.ensure_connected().await.expect("connect");

        broker.drop_connections();
        broker.refuse_dials(true);
        let err = conn.ensure_connected().await.err().expect("should fail");
        assert!(matches!(err, ConnectionError::Dial(_)));
        assert_eq!(conn.dial_attempts(), 2);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        broker.refuse_dials(false);
        conn.ensure_connected().await.expect("recovers on next call");
        assert_eq!(conn.dial_attempts(), 3);
    }

    #[tokio::test]
    async fn mark_disconnected_forces_redial() {
        let broker = MemoryBroker::new();
        let mut conn = BrokerConnection::new(broker.dialer());
        conn.ensure_connected().await.expect("connect");
        conn.mark_disconnected();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.ensure_connected().await.expect("reconnect");
        assert_eq!(broker.dial_count(), 2);
    }
}

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

//! Queue-driven repository clone worker.
//!
//! A single consumer takes clone requests off a Redis reliable queue, clones
//! each repository with libgit2 and records the outcome in SurrealDB. One
//! message is processed fully before the next delivery is taken.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod executor;
pub mod message;
pub mod metrics;
pub mod worker;

pub use broker::{BrokerConnection, ConnectionState};
pub use config::{load_config, ClonerConfig, MergeOpts, PersistenceFailurePolicy, RecordPolicy};
pub use consumer::{DeliveryContext, Disposition, MessageHandler, QueueConsumer};
pub use db::{CloneRecord, RecordStore};
pub use error::{CloneError, ConnectionError, PersistenceError, ValidationError};
pub use executor::{CloneCapability, CloneExecutor, CloneOutcome, GitCloner};
pub use message::{parse, CloneRequest};
pub use metrics::WorkerMetrics;
pub use worker::{Clock, CloneWorker, SystemClock};

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

//! Persistence for clone records: connection handling, the record model and
//! the append-only store.

pub mod connection;
pub mod models;
pub mod store;

pub use connection::{connect, SurrealConnection};
pub use models::CloneRecord;
pub use store::{MemoryRecordStore, RecordStore, SurrealRecordStore, CLONE_RECORDS_TABLE};

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
use super::connection::SurrealConnection;
use super::models::CloneRecord;
use crate::error::PersistenceError;
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;

pub const CLONE_RECORDS_TABLE: &str = "clone_records";

/// Durable sink for clone records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save(&self, record: &CloneRecord) -> Result<(), PersistenceError>;
}

pub struct SurrealRecordStore {
    conn: SurrealConnection,
}

impl SurrealRecordStore {
    pub fn new(conn: SurrealConnection) -> Self {
        Self { conn }
    }

    /// Define the records table and its lookup index. Safe to run on every
    /// startup.
    pub async fn init_schema(&self) -> Result<(), PersistenceError> {
        let schema = format!(
            "DEFINE TABLE IF NOT EXISTS {t} SCHEMALESS PERMISSIONS FULL; \
             DEFINE INDEX IF NOT EXISTS idx_{t}_remote_url ON {t} COLUMNS remote_url;",
            t = CLONE_RECORDS_TABLE
        );
        let resp = self
            .conn
            .query(&schema)
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
        resp.check()?;
        debug!("schema ready for table {}", CLONE_RECORDS_TABLE);
        Ok(())
    }

    /// All records for a remote URL, oldest first.
    pub async fn records_for_url(&self, url: &str) -> Result<Vec<CloneRecord>, PersistenceError> {
        let sql = format!(
            "SELECT remote_url, name, path, clone_duration_seconds, cloned_at, succeeded, error_detail \
             FROM {} WHERE remote_url = $url ORDER BY cloned_at ASC;",
            CLONE_RECORDS_TABLE
        );
        let mut resp = self
            .conn
            .query_with_binds(&sql, vec![("url", serde_json::Value::String(url.to_string()))])
            .await?;
        let rows: Vec<serde_json::Value> = resp.take(0)?;
        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(PersistenceError::from))
            .collect()
    }
}

#[async_trait]
impl RecordStore for SurrealRecordStore {
    async fn save(&self, record: &CloneRecord) -> Result<(), PersistenceError> {
        // cloned_at is cast to a native datetime so ORDER BY compares
        // instants rather than RFC 3339 strings of varying precision.
        let sql = format!(
            "CREATE {} SET remote_url = $remote_url, name = $name, path = $path, \
             clone_duration_seconds = $clone_duration_seconds, \
             cloned_at = <datetime>$cloned_at, succeeded = $succeeded, \
             error_detail = $error_detail;",
            CLONE_RECORDS_TABLE
        );
        let binds = vec![
            ("remote_url", serde_json::to_value(&record.remote_url)?),
            ("name", serde_json::to_value(&record.name)?),
            ("path", serde_json::to_value(&record.path)?),
            (
                "clone_duration_seconds",
                serde_json::to_value(record.clone_duration_seconds)?,
            ),
            ("cloned_at", serde_json::to_value(record.cloned_at)?),
            ("succeeded", serde_json::to_value(record.succeeded)?),
            ("error_detail", serde_json::to_value(&record.error_detail)?),
        ];
        let resp = self.conn.query_with_binds(&sql, binds).await?;
        if let Err(e) = resp.check() {
            warn!("CREATE {} failed for {}: {}", CLONE_RECORDS_TABLE, record.remote_url, e);
            return Err(e.into());
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    records: Vec<CloneRecord>,
    fail_next: usize,
    fail_always: bool,
}

/// In-process store that keeps records in a vector. Failures can be
/// injected to drive persistence-error paths.
#[derive(Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CloneRecord> {
        self.state.lock().records.clone()
    }

    /// Reject the next `n` writes.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    pub fn fail_always(&self, on: bool) {
        self.state.lock().fail_always = on;
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save(&self, record: &CloneRecord) -> Result<(), PersistenceError> {
        let mut st = self.state.lock();
        if st.fail_always {
            return Err(PersistenceError::Unavailable("store offline".into()));
        }
        if st.fail_next > 0 {
            st.fail_next -= 1;
            return Err(PersistenceError::Write("injected write failure".into()));
        }
        st.records.push(record.clone());
        Ok(())
    }
}

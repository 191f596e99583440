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
use crate::executor::CloneOutcome;
use crate::message::CloneRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable record of one clone attempt.
///
/// Records are append-only; a redelivered message may produce a duplicate
/// record for the same remote URL and path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloneRecord {
    pub remote_url: String,
    pub name: String,
    pub path: String,
    pub clone_duration_seconds: f64,
    pub cloned_at: DateTime<Utc>,
    #[serde(default = "default_succeeded")]
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

fn default_succeeded() -> bool {
    true
}

impl CloneRecord {
    /// Build the record for `request` from its outcome. `cloned_at` is
    /// supplied by the caller's clock.
    pub fn from_outcome(
        request: &CloneRequest,
        outcome: &CloneOutcome,
        cloned_at: DateTime<Utc>,
    ) -> Self {
        Self {
            remote_url: request.url.clone(),
            name: request.destination.clone(),
            path: outcome.path().to_string_lossy().into_owned(),
            clone_duration_seconds: outcome.duration_seconds(),
            cloned_at,
            succeeded: outcome.succeeded(),
            error_detail: outcome.error_detail().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::time::Duration;

    fn request() -> CloneRequest {
        CloneRequest {
            url: "https://h/r.git".into(),
            destination: "r".into(),
        }
    }

    #[test]
    fn success_record_fields() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let outcome = CloneOutcome::success(PathBuf::from("/base/r"), Duration::from_millis(1500));
        let rec = CloneRecord::from_outcome(&request(), &outcome, at);
        assert_eq!(rec.remote_url, "https://h/r.git");
        assert_eq!(rec.name, "r");
        assert_eq!(rec.path, "/base/r");
        assert!((rec.clone_duration_seconds - 1.5).abs() < 1e-9);
        assert_eq!(rec.cloned_at, at);
        assert!(rec.succeeded);
        assert!(rec.error_detail.is_none());

        let json = serde_json::to_value(&rec).unwrap();
        assert!(json.get("error_detail").is_none());
    }

    #[test]
    fn failure_record_keeps_detail() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let outcome =
            CloneOutcome::failure(PathBuf::from("/base/r"), Duration::from_secs(2), "auth denied");
        let rec = CloneRecord::from_outcome(&request(), &outcome, at);
        assert!(!rec.succeeded);
        assert_eq!(rec.error_detail.as_deref(), Some("auth denied"));
    }
}

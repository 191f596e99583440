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

use thiserror::Error;

/// The broker could not be reached, refused our credentials, or dropped the
/// connection in a way a single reconnect could not repair.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid broker address '{0}'")]
    InvalidAddress(String),
    #[error("failed to connect to broker: {0}")]
    Dial(String),
    #[error("broker connection lost: {0}")]
    Lost(String),
    #[error("broker command failed: {0}")]
    Command(String),
}

impl ConnectionError {
    /// Whether the error means the underlying transport is gone and the
    /// channel must be re-dialed before further use.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Dial(_) | Self::Lost(_))
    }
}

/// A message body that can never be turned into a clone request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed message body: {0}")]
    MalformedBody(String),
    #[error("message must specify '{0}'")]
    MissingField(&'static str),
    #[error("invalid '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// The clone capability reported failure. The reason is opaque text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CloneError(pub String);

impl CloneError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<git2::Error> for CloneError {
    fn from(e: git2::Error) -> Self {
        Self(e.message().to_string())
    }
}

/// A clone record could not be written.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("record store rejected write: {0}")]
    Write(String),
}

impl From<surrealdb::Error> for PersistenceError {
    fn from(e: surrealdb::Error) -> Self {
        Self::Write(e.to_string())
    }
}

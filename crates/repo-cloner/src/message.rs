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

use crate::error::ValidationError;
use serde_json::Value;
use std::path::{Component, Path};

/// One clone request, decoded from a queue message body of the form
/// `{"url": "<remote>", "name": "<relative destination>"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub url: String,
    pub destination: String,
}

/// Decode and validate a raw message body.
///
/// The result depends only on the bytes, so a body rejected once is rejected
/// on every redelivery. Extra keys are ignored.
pub fn parse(raw: &[u8]) -> Result<CloneRequest, ValidationError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| ValidationError::MalformedBody(e.to_string()))?;
    let obj = value.as_object().ok_or_else(|| {
        ValidationError::MalformedBody("expected a JSON object".to_string())
    })?;

    let url = required_str(obj, "url")?;
    let destination = required_str(obj, "name")?;
    validate_destination(destination)?;

    Ok(CloneRequest {
        url: url.to_string(),
        destination: destination.to_string(),
    })
}

fn required_str<'a>(
    obj: &'a serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    let v = obj.get(field).ok_or(ValidationError::MissingField(field))?;
    let s = v.as_str().ok_or_else(|| ValidationError::InvalidField {
        field,
        reason: format!("expected a string, got {}", json_type(v)),
    })?;
    if s.trim().is_empty() {
        return Err(ValidationError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(s)
}

// Destinations are joined under the base location; anything that could
// escape it is rejected.
fn validate_destination(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidField {
        field: "name",
        reason: reason.to_string(),
    };
    if name.chars().any(|c| c.is_control()) {
        return Err(invalid("contains control characters"));
    }
    let mut has_segment = false;
    for component in Path::new(name).components() {
        match component {
            Component::Normal(_) => has_segment = true,
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("must not contain '..'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("must be a relative path"))
            }
        }
    }
    if !has_segment {
        return Err(invalid("must name a directory below the base location"));
    }
    Ok(())
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

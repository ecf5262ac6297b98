//! Uniform result values returned to the editor, and the single place where
//! backend payloads are unwrapped.

use crate::error::RequestError;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// Result of an orchestrated operation. Never an `Err` that escapes to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome<T> {
    Success { data: T },
    Failure { error: RequestError },
}

impl<T> RequestOutcome<T> {
    pub fn success(data: T) -> Self {
        RequestOutcome::Success { data }
    }

    pub fn failure(error: RequestError) -> Self {
        RequestOutcome::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success { .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            RequestOutcome::Success { data } => Some(data),
            RequestOutcome::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&RequestError> {
        match self {
            RequestOutcome::Success { .. } => None,
            RequestOutcome::Failure { error } => Some(error),
        }
    }

    pub fn into_result(self) -> Result<T, RequestError> {
        match self {
            RequestOutcome::Success { data } => Ok(data),
            RequestOutcome::Failure { error } => Err(error),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> RequestOutcome<U> {
        match self {
            RequestOutcome::Success { data } => RequestOutcome::Success { data: f(data) },
            RequestOutcome::Failure { error } => RequestOutcome::Failure { error },
        }
    }

    /// Chain a fallible conversion (typically decoding the JSON payload).
    pub fn and_then<U, F>(self, f: F) -> RequestOutcome<U>
    where
        F: FnOnce(T) -> Result<U, RequestError>,
    {
        match self {
            RequestOutcome::Success { data } => match f(data) {
                Ok(data) => RequestOutcome::Success { data },
                Err(error) => RequestOutcome::Failure { error },
            },
            RequestOutcome::Failure { error } => RequestOutcome::Failure { error },
        }
    }
}

impl<T> From<Result<T, RequestError>> for RequestOutcome<T> {
    fn from(result: Result<T, RequestError>) -> Self {
        match result {
            Ok(data) => RequestOutcome::Success { data },
            Err(error) => RequestOutcome::Failure { error },
        }
    }
}

/// `{success: true, data}` or `{success: false, error: "<message>"}`
impl<T: Serialize> Serialize for RequestOutcome<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("RequestOutcome", 2)?;
        match self {
            RequestOutcome::Success { data } => {
                state.serialize_field("success", &true)?;
                state.serialize_field("data", data)?;
            }
            RequestOutcome::Failure { error } => {
                state.serialize_field("success", &false)?;
                state.serialize_field("error", &error.to_string())?;
            }
        }
        state.end()
    }
}

/// The two shapes a backend response can take.
///
/// Some endpoints answer with `{success, data?, error?}`, others with the bare
/// payload. [`ResponseEnvelope::normalize`] is the only place that branches on
/// this; everything downstream sees plain data or a [`RequestError`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEnvelope {
    Wrapped {
        success: bool,
        data: Option<Value>,
        error: Option<String>,
    },
    Raw(Value),
}

impl ResponseEnvelope {
    /// A JSON object with a boolean `success` field is an envelope; anything
    /// else is a raw payload.
    pub fn classify(value: Value) -> Self {
        match value {
            Value::Object(mut map) if map.get("success").is_some_and(Value::is_boolean) => {
                let success = map
                    .remove("success")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let data = map.remove("data");
                let error = map.remove("error").map(|e| match e {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
                ResponseEnvelope::Wrapped {
                    success,
                    data,
                    error,
                }
            }
            other => ResponseEnvelope::Raw(other),
        }
    }

    pub fn into_result(self) -> Result<Value, RequestError> {
        match self {
            ResponseEnvelope::Wrapped {
                success: true,
                data,
                ..
            } => Ok(data.unwrap_or(Value::Null)),
            ResponseEnvelope::Wrapped {
                success: false,
                error,
                ..
            } => Err(RequestError::Backend(
                error.unwrap_or_else(|| "request failed without details".to_string()),
            )),
            ResponseEnvelope::Raw(value) => Ok(value),
        }
    }

    pub fn normalize(value: Value) -> Result<Value, RequestError> {
        Self::classify(value).into_result()
    }
}

use log::info;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RunnerError;
use crate::request::schema::{RequestKind, RequestSchemas};

/// Turn an untrusted request body into a typed request
///
/// The body is parsed into untyped JSON first and checked against the endpoint's schema, so a
/// malformed field is reported by name instead of as a generic deserialisation failure.
pub fn read_request<T: DeserializeOwned>(schemas: &RequestSchemas, kind: RequestKind, body: &[u8]) -> Result<T, RunnerError> {
    let json = parse_untyped_json(body)?;
    schemas.validate(kind, &json)?;
    info!("{:?} request is valid", kind);
    parse_json(json)
}

fn parse_untyped_json(body: &[u8]) -> Result<Value, RunnerError> {
    serde_json::from_slice::<Value>(body)
        .map_err(|err| RunnerError::validation("request", format!("body isn't valid JSON: {err}")))
}

fn parse_json<T: DeserializeOwned>(value: Value) -> Result<T, RunnerError> {
    serde_json::from_value::<T>(value)
        .map_err(|err| RunnerError::validation("request", err.to_string()))
}

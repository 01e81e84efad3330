//! Request parsing, validation and the authorized internal representation
//!
//! Untrusted bodies are checked against a JSON schema, deserialised into typed requests, then
//! normalised field by field. Nothing untyped flows past this module.

/// Compile and apply the request JSON schemas
pub mod schema;
/// Read a request body into a typed request
pub mod message;
/// Typed request bodies for every endpoint
pub mod submission;
/// Field normalisation and defaulting
pub mod validate;
pub mod args;

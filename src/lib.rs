//! Submission server for analysis jobs
//!
//! Callers submit a script or a workflow against a dataset. The server identifies the caller,
//! checks dataset policy, normalises the request, writes a run config and dispatches batch jobs,
//! recording provenance next to the outputs.

pub mod auth;
pub mod cromwell;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod namespace;
pub mod policy;
pub mod publish;
pub mod recorder;
pub mod request;
pub mod run_config;
pub mod server;
pub mod settings;
pub mod slurm;
pub mod storage;
pub mod token;

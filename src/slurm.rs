//! SLURM batch backend
//!
//! Jobs are rendered into sbatch scripts that launch the job image with apptainer, submitted with
//! `sbatch` and followed with `sacct`. Every step is recorded in the job ledger.

/// Render job scripts from templates
pub mod script;
/// Stage job scripts and talk to the scheduler
pub mod job;
pub mod backend;

pub use backend::{SlurmBackend, SlurmSettings};

//! Worker run inside workflow batch jobs
//!
//! `submit` sends a checked-out workflow to the engine and writes the workflow id to a handle
//! file. `watch` reads the handle, polls until the workflow is terminal and stores its outputs.
//! Both exit non-zero on failure so the batch backend marks the job failed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use analysis_runner::cromwell::worker::{read_handle, read_submission, write_handle, SubmissionFiles};
use analysis_runner::cromwell::{watch_workflow, CromwellClient};
use analysis_runner::settings::{BackoffArgs, CromwellArgs, StorageArgs};
use analysis_runner::storage::BlobUri;

#[derive(Parser, Debug)]
#[command(name = "analysis-runner-cromwell")]
#[command(about = "Submits and watches workflows on behalf of analysis-runner jobs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a workflow and write its id to the handle file
    Submit {
        #[command(flatten)]
        cromwell: CromwellArgs,

        #[arg(long)]
        workflow: PathBuf,

        /// Input files, merged in order
        #[arg(long)]
        inputs: Vec<PathBuf>,

        /// Inline inputs as a JSON object, merged last
        #[arg(long)]
        inputs_dict: Option<String>,

        /// Zip of imported workflow files
        #[arg(long)]
        dependencies: Option<PathBuf>,

        /// Workflow labels as a JSON object of strings
        #[arg(long)]
        labels: Option<String>,

        /// Workflow options as a JSON object
        #[arg(long)]
        options: Option<String>,

        /// Service account key the workflow runs as
        #[arg(long)]
        service_account_file: Option<PathBuf>,

        #[arg(long)]
        handle: PathBuf,
    },
    /// Poll the workflow named by the handle file until it's done
    Watch {
        #[command(flatten)]
        cromwell: CromwellArgs,

        #[arg(long)]
        handle: PathBuf,

        /// Where the outputs JSON is written, e.g. gs://cpg-fewgenomes-test/run/cromwell-outputs.json
        #[arg(long)]
        output: String,

        #[command(flatten)]
        backoff: BackoffArgs,

        #[command(flatten)]
        storage: StorageArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::Submit { cromwell, workflow, inputs, inputs_dict, dependencies, labels, options, service_account_file, handle } => {
            let files = SubmissionFiles { workflow, inputs, inputs_dict, dependencies, labels, options, service_account_file };
            let submission = read_submission(&files).await?;
            let client = CromwellClient::new(&cromwell.cromwell_url, cromwell.token(), cromwell.timeout())?;
            let workflow_id = client.submit(submission).await.context("Workflow submission failed")?;
            info!("Submitted workflow {workflow_id}");
            write_handle(&handle, &workflow_id).await?;
        }
        Command::Watch { cromwell, handle, output, backoff, storage } => {
            let workflow_id = read_handle(&handle).await?;
            let output = BlobUri::parse(&output).context("Invalid output location")?;
            let client = CromwellClient::new(&cromwell.cromwell_url, cromwell.token(), cromwell.timeout())?;
            let store = storage.store()?;
            watch_workflow(&client, store.as_ref(), &workflow_id, &output, &backoff.watch_settings()).await?;
        }
    }
    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio::signal::unix::{signal, SignalKind};

use analysis_runner::policy::store::PolicyStore;
use analysis_runner::server::{router, AppState};
use analysis_runner::settings::ServerSettings;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("terve! starting up :)");

    let settings = ServerSettings::parse();
    let state = Arc::new(AppState::from_settings(&settings).await?);

    tokio::spawn(reload_policy(state.policy.clone(), Duration::from_secs(settings.reload_interval_secs)));

    let listener = tokio::net::TcpListener::bind(settings.bind)
        .await
        .with_context(|| format!("Can't bind {}", settings.bind))?;
    info!("Listening on {}", settings.bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shut down");
    Ok(())
}

/// Reload the server config on a timer and on SIGHUP, keeping the old one when a reload fails
async fn reload_policy(policy: Arc<PolicyStore>, period: Duration) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => Some(hangup),
        Err(err) => {
            error!("Can't listen for SIGHUP, reloading on the timer only: {err}");
            None
        }
    };
    let mut timer = tokio::time::interval(period);
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {},
            Some(_) = async {
                match hangup.as_mut() {
                    Some(hangup) => hangup.recv().await,
                    None => std::future::pending().await,
                }
            } => info!("SIGHUP received"),
        }
        if let Err(err) = policy.reload().await {
            error!("Server config reload failed, keeping the current one: {err:#}");
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Can't listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

//! Screen Pilot - vision-model screen automation
//!
//! Usage: `screen-pilot <task...>`. Everything else comes from the settings file
//! and `SCREEN_PILOT_*` environment variables.

use anyhow::{bail, Context};
use screen_pilot::{
    ActionExecutor, AppSettings, CommandCapture, CommandExecutor, DryRunExecutor, EventLog,
    ModelClient, ScreenAgent,
};
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let task = env::args().skip(1).collect::<Vec<_>>().join(" ");
    if task.trim().is_empty() {
        bail!("usage: screen-pilot <task>");
    }

    let settings = AppSettings::load();

    let capture = CommandCapture::from_command_line(&settings.capture_command)
        .context("no capture command configured (set SCREEN_PILOT_CAPTURE_CMD)")?;
    let executor: Arc<dyn ActionExecutor> = if settings.dry_run {
        info!("Dry run: actions are logged, not executed");
        Arc::new(DryRunExecutor)
    } else {
        match CommandExecutor::from_command_line(&settings.executor_command) {
            Some(executor) => Arc::new(executor),
            None => bail!(
                "no executor command configured \
                 (set SCREEN_PILOT_EXECUTOR_CMD or SCREEN_PILOT_DRY_RUN=1)"
            ),
        }
    };
    let model = ModelClient::new(settings.model_config());
    let event_log = EventLog::for_new_run(settings.record_dir())
        .context("failed to create the run directory")?;
    info!("Recording events to {}", event_log.path().display());

    let supervisor_config = settings.supervisor_config();
    let agent_config = settings
        .agent_config()
        .with_hold_when_hung(supervisor_config.enabled);

    let mut agent = ScreenAgent::new(
        agent_config,
        Arc::new(capture),
        executor,
        Arc::new(model),
        settings.script_engine(),
    )
    .with_event_log(event_log);

    let supervisor = agent.supervisor();
    if supervisor_config.enabled {
        let handle = supervisor.clone();
        tokio::spawn(async move {
            if let Err(e) = screen_pilot::supervisor::serve(handle, &supervisor_config).await {
                error!("Supervisor server failed: {}", e);
            }
        });
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            let _ = supervisor.stop();
        }
    });

    let outcome = agent.run(&task).await;
    match &outcome.reason {
        Some(reason) => info!("Run ended as {} ({})", outcome.state, reason.as_str()),
        None => info!("Run ended as {}", outcome.state),
    }
    if outcome.state == screen_pilot::AgentState::Errored {
        bail!("run errored after {} steps", outcome.steps);
    }
    Ok(())
}

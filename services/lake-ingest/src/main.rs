//! Lake Ingest driver binary.
//!
//! Accepts process-level commands, runs them to completion and exits:
//!
//! ```text
//! lake-ingest [--config <path>] plan <group> [plan <group> ...] [maintenance <kind> ...]
//! ```
//!
//! Exit codes: 0 clean, 1 configuration error, 2 fatal runtime error,
//! 130 cancelled by signal.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lake_common::config::Config;
use lake_common::error::FatalError;
use lake_common::logging::init_logging;
use lake_ingest::queue::MaintKind;

#[derive(Debug)]
enum Command {
    Plan(String),
    Maintenance(MaintKind),
}

fn parse_args(args: &[String]) -> Result<(Option<String>, Vec<Command>), FatalError> {
    let mut config_path = None;
    let mut commands = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(
                    iter.next()
                        .ok_or_else(|| FatalError::Config("--config needs a path".into()))?
                        .clone(),
                );
            }
            "plan" => {
                let group = iter
                    .next()
                    .ok_or_else(|| FatalError::Config("plan needs a group name".into()))?;
                commands.push(Command::Plan(group.clone()));
            }
            "maintenance" => {
                let kind = iter
                    .next()
                    .ok_or_else(|| FatalError::Config("maintenance needs a kind".into()))?;
                match MaintKind::parse(kind) {
                    Some(kind) => commands.push(Command::Maintenance(kind)),
                    None => {
                        return Err(FatalError::Config(format!(
                            "unknown maintenance kind '{kind}' (rebuild_manifest | compact | sweep)"
                        )))
                    }
                }
            }
            other => {
                return Err(FatalError::Config(format!("unknown argument '{other}'")));
            }
        }
    }

    if commands.is_empty() {
        return Err(FatalError::Config(
            "nothing to do: pass `plan <group>` or `maintenance <kind>`".into(),
        ));
    }
    Ok((config_path, commands))
}

async fn run() -> Result<bool, FatalError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, commands) = parse_args(&args)?;

    let config = match config_path {
        Some(path) => Config::load_from(std::path::Path::new(&path)).map_err(FatalError::config)?,
        None => Config::load_default(),
    };

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );
    info!("Lake Ingest v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let mut orchestrator = lake_ingest::build(&config, cancel.clone())?;
    orchestrator.start().await.map_err(FatalError::runtime)?;

    // One process-wide cancel signal; in-flight vendor calls complete and
    // the pools drain. Pending tasks stay in the durable queue store.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Cancellation requested, draining workers");
                cancel.cancel();
            }
        });
    }

    let mut submitted = 0usize;
    for command in commands {
        let result = match &command {
            Command::Plan(group) => orchestrator.submit_plan(group).await,
            Command::Maintenance(kind) => orchestrator.submit_maintenance(*kind).await,
        };
        match result {
            Ok(_) => submitted += 1,
            Err(err) => error!(?command, error = %err, "Submission failed, skipping"),
        }
    }
    if submitted == 0 {
        return Err(FatalError::Runtime("no command could be submitted".into()));
    }

    orchestrator
        .run_until_drained()
        .await
        .map_err(FatalError::runtime)?;
    let summary = orchestrator.shutdown().await.map_err(FatalError::runtime)?;
    info!(summary = %summary, "Run complete");

    Ok(summary.cancelled)
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(false) => 0,
        Ok(true) => FatalError::Cancelled.exit_code(),
        Err(err) => {
            eprintln!("lake-ingest: {err}");
            err.exit_code()
        }
    };
    std::process::exit(code);
}

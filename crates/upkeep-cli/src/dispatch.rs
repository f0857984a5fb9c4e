use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;
use upkeep_engine::{CancelToken, JsonlAuditLog, StateLayout, UpgradeEngine, VersionGate, Watcher};

use crate::completion::{resolve_completion_shell, write_completions_script};
use crate::config::{ConfigOverrides, UpkeepConfig, WatchFlags};
use crate::render::{
    current_output_style, exit_status_for, format_attempt_lines, format_history_line,
    format_preview_lines, format_status_lines, format_watch_summary, render_section_header,
    render_status_line, OutputStyle,
};
use crate::{Cli, Commands};

pub(crate) fn run_cli(cli: Cli) -> Result<ExitCode> {
    let output_style = current_output_style();
    let overrides = ConfigOverrides {
        watch_dir: cli.watch_dir,
        install_dir: cli.install_dir,
        state_dir: cli.state_dir,
    };
    let config_path = cli.config;

    match cli.command {
        Commands::Status => {
            let engine = open_engine(config_path.as_deref(), &overrides)?;
            print_section(output_style, "upkeep status");
            for line in format_status_lines(&engine.status()?, output_style) {
                println!("{line}");
            }
        }
        Commands::Trigger { artifact } => {
            let engine = open_engine(config_path.as_deref(), &overrides)?;
            let attempt = engine.run(artifact.as_deref())?;
            for line in format_attempt_lines(&attempt, output_style) {
                println!("{line}");
            }
            return Ok(ExitCode::from(exit_status_for(attempt.outcome())));
        }
        Commands::Watch {
            interval,
            cycles,
            cleanup,
            move_to,
        } => {
            let config = load_config(config_path.as_deref(), &overrides)?;
            let options = config.watch_options(&WatchFlags {
                interval_secs: interval,
                cycles,
                cleanup,
                move_to,
            })?;
            let engine = build_engine(&config)?;
            let mut watcher = Watcher::new(&engine, options);
            let summary = watcher.run(&CancelToken::new(), |attempt| {
                for line in format_attempt_lines(attempt, output_style) {
                    println!("{line}");
                }
            });
            println!("{}", format_watch_summary(&summary, output_style));
            if summary.degraded > 0 {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Preview { artifact } => {
            let engine = open_engine(config_path.as_deref(), &overrides)?;
            let preview = engine.preview(artifact.as_deref())?;
            let installed = VersionGate::from_install_dir(&engine.config().install_dir, None)?
                .installed()
                .map(ToString::to_string);
            print_section(output_style, "upkeep preview");
            for line in format_preview_lines(&preview, installed.as_deref(), output_style) {
                println!("{line}");
            }
        }
        Commands::History { limit } => {
            let engine = open_engine(config_path.as_deref(), &overrides)?;
            for record in engine.history(limit)? {
                println!("{}", format_history_line(&record));
            }
        }
        Commands::Cleanup { path } => {
            let engine = open_engine(config_path.as_deref(), &overrides)?;
            engine.cleanup(&path)?;
            println!(
                "{}",
                render_status_line(output_style, "ok", &format!("removed {}", path.display()))
            );
        }
        Commands::Rollback => {
            let engine = open_engine(config_path.as_deref(), &overrides)?;
            let record = engine.rollback_now()?;
            println!(
                "{}",
                render_status_line(
                    output_style,
                    "ok",
                    &format!(
                        "restored {} from the backup taken by attempt {}",
                        engine.config().install_dir.display(),
                        record.attempt_id
                    )
                )
            );
        }
        Commands::Completions { shell } => {
            let resolved_shell =
                resolve_completion_shell(shell, std::env::var("SHELL").ok().as_deref(), cfg!(windows));
            let mut stdout = std::io::stdout();
            write_completions_script(resolved_shell, &mut stdout)?;
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Builds an engine from the config file plus command-line overrides, with the
/// JSONL audit log under the state directory as its recorder.
pub(crate) fn open_engine(
    config_path: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<UpgradeEngine> {
    build_engine(&load_config(config_path, overrides)?)
}

fn load_config(config_path: Option<&Path>, overrides: &ConfigOverrides) -> Result<UpkeepConfig> {
    let mut config = UpkeepConfig::load(config_path)?;
    config.apply_overrides(overrides);
    Ok(config)
}

fn build_engine(config: &UpkeepConfig) -> Result<UpgradeEngine> {
    let engine_config = config.engine_config()?;
    let capabilities = config.capabilities(&engine_config)?;
    let audit_path = StateLayout::new(&engine_config.state_dir).audit_log_path();
    let audit_log = JsonlAuditLog::new(audit_path);
    debug!(
        watch_dir = %engine_config.watch_dir.display(),
        install_dir = %engine_config.install_dir.display(),
        state_dir = %engine_config.state_dir.display(),
        "opening upgrade engine"
    );
    UpgradeEngine::new(engine_config, capabilities, Arc::new(audit_log))
}

fn print_section(style: OutputStyle, title: &str) {
    if let Some(line) = render_section_header(style, title) {
        println!("{line}");
    }
}

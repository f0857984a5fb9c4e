use std::io::IsTerminal;

use anstyle::{AnsiColor, Effects, Style};
use upkeep_core::{AttemptOutcome, AttemptState};
use upkeep_engine::{AuditRecord, EngineStatus, UpgradeAttempt, UpgradePreview, WatchSummary};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::env::var_os("NO_COLOR").is_some(),
    )
}

pub(crate) fn resolve_output_style(stdout_is_terminal: bool, no_color: bool) -> OutputStyle {
    if stdout_is_terminal && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

pub(crate) fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn format_status_lines(status: &EngineStatus, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    if status.install_dir_present {
        lines.push(render_status_line(
            style,
            "ok",
            &format!("installation: {}", status.install_dir.display()),
        ));
    } else {
        lines.push(render_status_line(
            style,
            "err",
            &format!("installation: {} (missing)", status.install_dir.display()),
        ));
    }

    match &status.backup {
        Some(record) => lines.push(render_status_line(
            style,
            "ok",
            &format!(
                "backup: attempt {} ({} files, taken_at_unix={})",
                record.attempt_id, record.file_count, record.taken_at_unix
            ),
        )),
        None => lines.push(render_status_line(style, "warn", "backup: none")),
    }

    let pending = status
        .pending
        .as_ref()
        .map(|package| package.path.display().to_string())
        .unwrap_or_else(|| "none".to_string());
    lines.push(render_status_line(
        style,
        "step",
        &format!("pending: {pending}"),
    ));

    let last = status
        .last_installed
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    lines.push(render_status_line(
        style,
        "step",
        &format!("last installed: {last}"),
    ));
    lines
}

pub(crate) fn format_attempt_lines(attempt: &UpgradeAttempt, style: OutputStyle) -> Vec<String> {
    let artifact = attempt
        .package
        .as_ref()
        .map(|package| package.file_name.as_str())
        .unwrap_or("no artifact");
    let reason = attempt
        .error
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();

    let headline = match attempt.outcome() {
        Some(AttemptOutcome::Succeeded) => render_status_line(
            style,
            "ok",
            &format!(
                "attempt {} installed {artifact} ({} files, {} ignored)",
                attempt.id,
                attempt.installed_files.len(),
                attempt.ignored_files.len()
            ),
        ),
        Some(AttemptOutcome::Degraded) => render_status_line(
            style,
            "err",
            &format!(
                "attempt {} left the installation DEGRADED: {reason}",
                attempt.id
            ),
        ),
        Some(AttemptOutcome::Failed) | None => {
            let verb = if attempt.state == AttemptState::RolledBack {
                "rolled back"
            } else {
                "aborted"
            };
            render_status_line(
                style,
                "warn",
                &format!("attempt {} {verb} ({artifact}): {reason}", attempt.id),
            )
        }
    };

    let path = attempt
        .transitions
        .iter()
        .map(|state| state.as_str())
        .collect::<Vec<_>>()
        .join(" -> ");
    vec![
        headline,
        render_status_line(style, "step", &format!("states: {path}")),
    ]
}

pub(crate) fn format_preview_lines(
    preview: &UpgradePreview,
    installed_version: Option<&str>,
    style: OutputStyle,
) -> Vec<String> {
    let changes = &preview.changes;
    let status = if changes.is_noop() { "ok" } else { "step" };
    let mut lines = vec![render_status_line(
        style,
        status,
        &format!(
            "{}: {} added, {} changed, {} unchanged, {} ignored",
            preview.package.file_name,
            changes.added.len(),
            changes.changed.len(),
            changes.unchanged.len(),
            changes.ignored.len()
        ),
    )];
    let incoming = preview.package.manifest_version();
    lines.push(format!(
        "version: {} -> {}",
        installed_version.unwrap_or("unknown"),
        incoming.as_deref().unwrap_or("unknown")
    ));
    lines.extend(changes.added.iter().map(|name| format!("  + {name}")));
    lines.extend(changes.changed.iter().map(|name| format!("  ~ {name}")));
    lines.extend(
        changes
            .ignored
            .iter()
            .map(|name| format!("  - {name} (ignored)")),
    );
    lines
}

pub(crate) fn format_watch_summary(summary: &WatchSummary, style: OutputStyle) -> String {
    let status = if summary.degraded > 0 { "err" } else { "ok" };
    render_status_line(
        style,
        status,
        &format!(
            "watched {} cycle(s): {} succeeded, {} failed, {} degraded",
            summary.cycles, summary.succeeded, summary.failed, summary.degraded
        ),
    )
}

pub(crate) fn format_history_line(record: &AuditRecord) -> String {
    format!("{} {:<17} {}", record.timestamp, record.action, record.data)
}

/// Process exit status for a finished attempt.
pub(crate) fn exit_status_for(outcome: Option<AttemptOutcome>) -> u8 {
    match outcome {
        Some(AttemptOutcome::Succeeded) => 0,
        Some(AttemptOutcome::Failed) | None => 1,
        Some(AttemptOutcome::Degraded) => 2,
    }
}

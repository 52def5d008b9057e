use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use verkeep_lifecycle::{
    ComponentStatus, RollbackOutcome, Transition, TransitionKind, UninstallOutcome,
    UpgradeOutcome,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    let no_color = std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty());
    if std::io::stdout().is_terminal() && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

pub(crate) struct StepSpinner {
    style: OutputStyle,
    label: String,
    spinner: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn current() -> Self {
        Self {
            style: current_output_style(),
        }
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn eprint_status(self, status: &str, message: &str) {
        eprintln!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    /// Spinner for one long-running coordinator call; plain output gets none.
    pub(crate) fn start_step(self, label: &str, message: &str) -> StepSpinner {
        let spinner = if self.style == OutputStyle::Rich {
            let spinner = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}") {
                spinner.set_style(style.tick_chars(step_tick_chars(label)));
            }
            spinner.set_message(message.to_string());
            spinner.enable_steady_tick(Duration::from_millis(80));
            Some(spinner)
        } else {
            None
        };

        StepSpinner {
            style: self.style,
            label: label.to_string(),
            spinner,
            started_at: Instant::now(),
        }
    }
}

impl StepSpinner {
    pub(crate) fn finish(mut self) {
        let Some(spinner) = self.spinner.take() else {
            return;
        };
        spinner.finish_and_clear();
        if self.style == OutputStyle::Rich {
            println!(
                "{} complete in {}",
                colorize(step_label_style(), &self.label),
                format_elapsed(self.started_at.elapsed())
            );
        }
    }

    pub(crate) fn abandon(mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

fn step_tick_chars(label: &str) -> &'static str {
    match label {
        "install" => ".oO@* ",
        "upgrade" => "-=~* ",
        "rollback" => "<^>v ",
        "uninstall" => "\\|/- ",
        _ => "|/-\\ ",
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn step_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> String {
    match status {
        "ok" => "[OK]".to_string(),
        "warn" => "[WARN]".to_string(),
        "err" => "[ERR]".to_string(),
        "step" => "[STEP]".to_string(),
        "skip" => "[..]".to_string(),
        other => format!("[{}]", other.to_ascii_uppercase()),
    }
}

fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

pub(crate) fn format_transition(transition: &Transition) -> String {
    let from = transition.from.as_deref().unwrap_or("none");
    let to = transition.to.as_deref().unwrap_or("none");
    let component = &transition.component;
    match transition.kind {
        TransitionKind::Install if transition.from.is_some() => {
            format!("reinstalled {component} {to}")
        }
        TransitionKind::Install => format!("installed {component} {to}"),
        TransitionKind::Upgrade if transition.from.is_none() => {
            format!("installed {component} {to}")
        }
        TransitionKind::Upgrade => format!("upgraded {component} {from} -> {to}"),
        TransitionKind::Rollback => format!("rolled back {component} {from} -> {to}"),
        TransitionKind::Uninstall => format!("uninstalled {component} {from}"),
    }
}

/// `(status, message)` for one upgrade result.
pub(crate) fn format_upgrade_outcome(outcome: &UpgradeOutcome) -> (&'static str, String) {
    match outcome {
        UpgradeOutcome::Upgraded(transition) => ("ok", format_transition(transition)),
        UpgradeOutcome::Skipped { component, version } => (
            "skip",
            format!("{component} already at {version}, nothing to do"),
        ),
    }
}

pub(crate) fn format_rollback_outcome(outcome: &RollbackOutcome) -> String {
    let transition = &outcome.transition;
    if transition.from == transition.to {
        return format!(
            "{} already at {}, service units re-applied",
            transition.component,
            transition.to.as_deref().unwrap_or("none")
        );
    }
    let source = if outcome.restored_from_backup {
        "restored from backup"
    } else {
        "existing install root reused"
    };
    format!("{} ({source})", format_transition(transition))
}

pub(crate) fn format_uninstall_outcome(outcome: &UninstallOutcome) -> (&'static str, String) {
    match outcome {
        UninstallOutcome::NotInstalled { component } => {
            ("skip", format!("{component} is not installed"))
        }
        UninstallOutcome::Uninstalled(transition) => ("ok", format_transition(transition)),
    }
}

pub(crate) fn format_status_lines(statuses: &[ComponentStatus], style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    for status in statuses {
        if let Some(header) = render_section_header(style, status.component.as_str()) {
            lines.push(header);
        }

        let Some(installed) = &status.installed_version else {
            lines.push(render_status_line(
                style,
                "skip",
                &format!(
                    "{}: not installed (configured {})",
                    status.component, status.desired_version
                ),
            ));
            push_history_and_backups(&mut lines, status);
            continue;
        };

        let healthy = status.install_root_present && status.service_active != Some(false);
        let drift = if installed == &status.desired_version {
            String::new()
        } else {
            format!(", configured {}", status.desired_version)
        };
        lines.push(render_status_line(
            style,
            if healthy { "ok" } else { "warn" },
            &format!("{}: installed {installed}{drift}", status.component),
        ));
        if let Some(root) = &status.install_root {
            let presence = if status.install_root_present {
                ""
            } else {
                " (missing on disk)"
            };
            lines.push(format!("  root: {}{presence}", root.display()));
        }
        if let Some(service) = &status.service {
            let state = match status.service_active {
                Some(true) => "active",
                Some(false) => "inactive",
                None => "unknown",
            };
            lines.push(format!("  service: {service} ({state})"));
        }
        push_history_and_backups(&mut lines, status);
    }
    lines
}

fn push_history_and_backups(lines: &mut Vec<String>, status: &ComponentStatus) {
    if !status.history.is_empty() {
        let history = status
            .history
            .iter()
            .map(|entry| entry.version.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("  history: {history}"));
    }
    if !status.backups.is_empty() {
        let backups = status
            .backups
            .iter()
            .map(|backup| format!("{} ({} files)", backup.version, backup.file_count))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("  backups: {backups}"));
    }
}

pub(crate) fn status_json(statuses: &[ComponentStatus]) -> serde_json::Value {
    let components = statuses
        .iter()
        .map(|status| {
            serde_json::json!({
                "component": status.component.as_str(),
                "desired_version": status.desired_version,
                "installed_version": status.installed_version,
                "install_root": status.install_root.as_ref().map(|root| root.display().to_string()),
                "install_root_present": status.install_root_present,
                "service": status.service,
                "service_active": status.service_active,
                "history": status
                    .history
                    .iter()
                    .map(|entry| serde_json::json!({
                        "version": entry.version,
                        "recorded_at_unix": entry.recorded_at_unix,
                    }))
                    .collect::<Vec<_>>(),
                "backups": status
                    .backups
                    .iter()
                    .map(|backup| serde_json::json!({
                        "version": backup.version,
                        "created_at_unix": backup.created_at_unix,
                        "file_count": backup.file_count,
                        "tree_sha256": backup.tree_sha256,
                    }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect::<Vec<_>>();
    serde_json::json!({ "components": components })
}

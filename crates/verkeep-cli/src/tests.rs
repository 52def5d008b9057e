use super::*;
use std::path::PathBuf;

use clap::error::ErrorKind;
use verkeep_core::ComponentId;
use verkeep_lifecycle::{
    BackupManifest, ComponentStatus, HistoryEntry, RollbackOutcome, Transition, TransitionKind,
    UninstallOutcome, UpgradeOutcome,
};

use crate::completion::write_completions_script;
use crate::dispatch::step_timeout;
use crate::render::{
    format_rollback_outcome, format_status_lines, format_transition, format_uninstall_outcome,
    format_upgrade_outcome, render_status_line, status_json, OutputStyle,
};

fn transition(kind: TransitionKind, from: Option<&str>, to: Option<&str>) -> Transition {
    Transition {
        component: ComponentId::new("runtime"),
        from: from.map(ToOwned::to_owned),
        to: to.map(ToOwned::to_owned),
        kind,
    }
}

#[test]
fn install_parses_optional_version_and_force() {
    let cli = Cli::try_parse_from(["verkeep", "install", "runtime", "21", "--force"])
        .expect("command must parse");
    match cli.command {
        Commands::Install {
            component,
            version,
            force,
        } => {
            assert_eq!(component, "runtime");
            assert_eq!(version.as_deref(), Some("21"));
            assert!(force);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn upgrade_without_component_targets_whole_host() {
    let cli = Cli::try_parse_from(["verkeep", "upgrade"]).expect("command must parse");
    match cli.command {
        Commands::Upgrade { component, version } => {
            assert_eq!(component, None);
            assert_eq!(version, None);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn rollback_to_requires_component() {
    let err = Cli::try_parse_from(["verkeep", "rollback", "--to", "17"])
        .expect_err("--to without component must fail");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);

    let cli = Cli::try_parse_from(["verkeep", "rollback", "runtime", "--to", "17"])
        .expect("command must parse");
    match cli.command {
        Commands::Rollback { component, to } => {
            assert_eq!(component.as_deref(), Some("runtime"));
            assert_eq!(to.as_deref(), Some("17"));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn global_config_and_verbosity_flags_parse_after_subcommand() {
    let cli = Cli::try_parse_from([
        "verkeep",
        "status",
        "--config",
        "/tmp/verkeep.toml",
        "-vv",
    ])
    .expect("command must parse");
    assert_eq!(cli.config, Some(PathBuf::from("/tmp/verkeep.toml")));
    assert_eq!(cli.verbose, 2);
    assert_eq!(default_log_level(cli.verbose), "debug");
    assert_eq!(default_log_level(0), "warn");
    assert_eq!(default_log_level(1), "info");
}

#[test]
fn ledger_reset_parses_confirm_flag() {
    let cli = Cli::try_parse_from(["verkeep", "ledger", "reset", "--confirm"])
        .expect("command must parse");
    match cli.command {
        Commands::Ledger {
            command: LedgerCommands::Reset { confirm },
        } => assert!(confirm),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn ledger_reset_without_confirm_is_refused() {
    let cli = Cli::try_parse_from([
        "verkeep",
        "--config",
        "/nonexistent/verkeep.toml",
        "ledger",
        "reset",
    ])
    .expect("command must parse");
    let err = dispatch::run_cli(cli).expect_err("reset without confirm must fail");
    assert!(err.to_string().contains("--confirm"));
}

#[test]
fn missing_config_file_is_reported_with_its_path() {
    let cli = Cli::try_parse_from(["verkeep", "--config", "/nonexistent/verkeep.toml", "status"])
        .expect("command must parse");
    let err = dispatch::run_cli(cli).expect_err("missing config must fail");
    assert!(format!("{err:#}").contains("/nonexistent/verkeep.toml"));
}

#[test]
fn zero_step_timeout_disables_the_limit() {
    assert_eq!(step_timeout(0), None);
    assert_eq!(step_timeout(30), Some(std::time::Duration::from_secs(30)));
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "installed runtime 21"),
        "installed runtime 21"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "installed runtime 21"),
        "[OK] installed runtime 21"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "skip", "runtime already at 21"),
        "[..] runtime already at 21"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "upgrade failed"),
        "[ERR] upgrade failed"
    );
}

#[test]
fn transitions_render_by_kind() {
    assert_eq!(
        format_transition(&transition(TransitionKind::Install, None, Some("17"))),
        "installed runtime 17"
    );
    assert_eq!(
        format_transition(&transition(TransitionKind::Upgrade, Some("17"), Some("21"))),
        "upgraded runtime 17 -> 21"
    );
    assert_eq!(
        format_transition(&transition(TransitionKind::Uninstall, Some("21"), None)),
        "uninstalled runtime 21"
    );
}

#[test]
fn skipped_upgrade_and_absent_uninstall_render_as_noops() {
    let (status, message) = format_upgrade_outcome(&UpgradeOutcome::Skipped {
        component: ComponentId::new("runtime"),
        version: "21".to_string(),
    });
    assert_eq!(status, "skip");
    assert_eq!(message, "runtime already at 21, nothing to do");

    let (status, message) = format_uninstall_outcome(&UninstallOutcome::NotInstalled {
        component: ComponentId::new("runtime"),
    });
    assert_eq!(status, "skip");
    assert_eq!(message, "runtime is not installed");
}

#[test]
fn rollback_outcome_names_restore_source() {
    let restored = RollbackOutcome {
        transition: transition(TransitionKind::Rollback, Some("21"), Some("17")),
        restored_from_backup: true,
    };
    assert_eq!(
        format_rollback_outcome(&restored),
        "rolled back runtime 21 -> 17 (restored from backup)"
    );

    let reapplied = RollbackOutcome {
        transition: transition(TransitionKind::Rollback, Some("17"), Some("17")),
        restored_from_backup: false,
    };
    assert_eq!(
        format_rollback_outcome(&reapplied),
        "runtime already at 17, service units re-applied"
    );
}

fn sample_statuses() -> Vec<ComponentStatus> {
    vec![
        ComponentStatus {
            component: ComponentId::new("runtime"),
            desired_version: "21".to_string(),
            installed_version: Some("21".to_string()),
            install_root: Some(PathBuf::from("/opt/openjdk-21")),
            install_root_present: false,
            service: None,
            service_active: None,
            history: vec![HistoryEntry {
                component: ComponentId::new("runtime"),
                version: "17".to_string(),
                recorded_at_unix: 1_771_000_000,
            }],
            backups: vec![BackupManifest {
                component: ComponentId::new("runtime"),
                version: "17".to_string(),
                source_path: PathBuf::from("/opt/openjdk-17"),
                created_at_unix: 1_771_000_000,
                file_count: 412,
                tree_sha256: "ab".repeat(32),
            }],
        },
        ComponentStatus {
            component: ComponentId::new("app-server"),
            desired_version: "10.1.24".to_string(),
            installed_version: Some("10.1.20".to_string()),
            install_root: Some(PathBuf::from("/opt/tomcat-10.1.20")),
            install_root_present: true,
            service: Some("tomcat-10.1.20".to_string()),
            service_active: Some(true),
            history: Vec::new(),
            backups: Vec::new(),
        },
    ]
}

#[test]
fn status_lines_flag_drift_and_pending_upgrades() {
    let lines = format_status_lines(&sample_statuses(), OutputStyle::Plain);
    assert_eq!(
        lines,
        vec![
            "runtime: installed 21",
            "  root: /opt/openjdk-21 (missing on disk)",
            "  history: 17",
            "  backups: 17 (412 files)",
            "app-server: installed 10.1.20, configured 10.1.24",
            "  root: /opt/tomcat-10.1.20",
            "  service: tomcat-10.1.20 (active)",
        ]
    );

    let rich = format_status_lines(&sample_statuses(), OutputStyle::Rich);
    assert!(rich.contains(&"[WARN] runtime: installed 21".to_string()));
    assert!(rich.contains(&"[OK] app-server: installed 10.1.20, configured 10.1.24".to_string()));
}

#[test]
fn status_json_exposes_history_and_backups() {
    let value = status_json(&sample_statuses());
    let runtime = &value["components"][0];
    assert_eq!(runtime["component"], "runtime");
    assert_eq!(runtime["install_root_present"], false);
    assert_eq!(runtime["history"][0]["version"], "17");
    assert_eq!(runtime["backups"][0]["file_count"], 412);
    assert_eq!(value["components"][1]["service_active"], true);
}

#[test]
fn completions_script_mentions_binary_and_subcommands() {
    let mut script = Vec::new();
    write_completions_script(completion::CliCompletionShell::Bash, &mut script)
        .expect("must generate completions");
    let script = String::from_utf8(script).expect("utf8");
    assert!(script.contains("verkeep"));
    assert!(script.contains("rollback"));
}

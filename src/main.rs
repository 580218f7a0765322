//! hymoctl CLI entry point.
//!
//! Thin front end over the library: every subcommand opens a [`Session`],
//! runs one intent, prints the result, and exits.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use hymoctl::config::ClientConfig;
use hymoctl::engine_config::bindings::{ModuleBinding, MountStrategy};
use hymoctl::engine_config::{ConfigError, Toggle};
use hymoctl::rules::{Rule, RuleFlags, RuleId, RuleKind};
use hymoctl::session::Session;

/// hymoctl: control the HymoFS overlay engine through the Murasaki service.
#[derive(Parser)]
#[command(name = "hymoctl", version, about)]
struct Cli {
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    /// Client config file (default: `$HYMOCTL_CONFIG` or `~/.hymoctl/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write JSON logs with daily rotation into this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Show tier, versions, rule counts and pending restarts.
    Status,
    /// Manage overlay rules.
    Rules {
        /// Rule action.
        #[command(subcommand)]
        action: RulesAction,
    },
    /// Toggle engine stealth mode now (not persisted).
    Stealth {
        /// `on` or `off`.
        state: OnOff,
    },
    /// Show or change the persisted engine config.
    Config {
        /// Config action.
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show or change per-module mount strategies.
    Modules {
        /// Module action.
        #[command(subcommand)]
        action: ModulesAction,
    },
    /// Check or repair mount id ordering.
    Mounts {
        /// Mount action.
        #[command(subcommand)]
        action: MountsAction,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// List active rules.
    List,
    /// Add a rule.
    Add {
        /// `add` (redirect), `hide`, `inject` or `merge`.
        kind: RuleKind,
        /// Path the rule applies to.
        source: PathBuf,
        /// Target path for redirect, merge and inject rules.
        target: Option<PathBuf>,
        /// Source is a directory.
        #[arg(long)]
        dir: bool,
        /// Source is a symlink.
        #[arg(long)]
        symlink: bool,
    },
    /// Delete a rule by id.
    Delete {
        /// Engine-assigned id.
        id: RuleId,
    },
    /// Remove every rule.
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the persisted config.
    Show,
    /// Set one setting and save.
    Set {
        /// Toggle name (e.g. `stealth`, `force_ext4`) or `mirror_path`.
        key: String,
        /// `true`/`false`/`on`/`off`, or a path for `mirror_path`.
        value: String,
    },
}

#[derive(Subcommand)]
enum ModulesAction {
    /// List modules with declared and active strategies.
    List,
    /// Declare a strategy for a module (applies after restart).
    Set {
        /// Module id.
        id: String,
        /// `auto`, `hymofs`, `overlay`, `magic` or `none`.
        strategy: MountStrategy,
    },
}

#[derive(Subcommand)]
enum MountsAction {
    /// Scan mountinfo for duplicated or out-of-order ids.
    Check,
    /// Ask the engine to renumber mounts when needed.
    Fix,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum OnOff {
    On,
    Off,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ClientConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    let _logging_guard = match &cli.log_dir {
        Some(dir) => Some(hymoctl::logging::init_file(dir, &config.logging.level)?),
        None => {
            hymoctl::logging::init_cli(&config.logging.level);
            None
        }
    };

    let session = Session::open(config).await;
    let result = run(&session, cli.command, cli.json).await;
    session.close().await;
    result
}

async fn run(session: &Session, command: Command, json: bool) -> anyhow::Result<()> {
    match command {
        Command::Status => handle_status(session, json).await,
        Command::Rules { action } => handle_rules(session, action, json).await,
        Command::Stealth { state } => {
            let enabled = matches!(state, OnOff::On);
            session.rules().await?.set_stealth(enabled).await?;
            emit(json, &enabled, || {
                format!("stealth {}", if enabled { "enabled" } else { "disabled" })
            })
        }
        Command::Config { action } => handle_config(session, action, json).await,
        Command::Modules { action } => handle_modules(session, action, json).await,
        Command::Mounts { action } => handle_mounts(session, action, json).await,
    }
}

async fn handle_status(session: &Session, json: bool) -> anyhow::Result<()> {
    let report = session.status().await;
    emit(json, &report, || {
        let mut lines = vec![format!("transport:   {}", report.transport)];
        match (&report.connection, &report.connect_error) {
            (Some(c), _) => {
                lines.push(format!("tier:        {}", c.tier));
                lines.push(format!("service:     v{}", c.service_version));
                lines.push(format!("engine:      v{}", c.engine_version));
                if let Some(ctx) = &c.selinux_context {
                    lines.push(format!("selinux:     {ctx}"));
                }
            }
            (None, Some(err)) => lines.push(format!("service:     unavailable ({err})")),
            (None, None) => lines.push("service:     unavailable".to_owned()),
        }
        lines.push(format!("kernel mode: {}", yes_no(report.kernel_mode)));
        if let Some(rules) = report.rules {
            lines.push(format!(
                "rules:       {} ({} hide, {} redirect, {} merge, {} inject)",
                rules.total, rules.hide, rules.redirect, rules.merge, rules.inject
            ));
        }
        lines.push(format!("stealth:     {}", yes_no(report.stealth)));
        if !report.pending_restart.is_empty() {
            lines.push(format!("restart to apply: {}", report.pending_restart.join(", ")));
        }
        lines.join("\n")
    })
}

async fn handle_rules(session: &Session, action: RulesAction, json: bool) -> anyhow::Result<()> {
    let store = session.rules().await?;
    match action {
        RulesAction::List => {
            let set = store.list().await;
            if let Some(reason) = set.unavailable_reason() {
                warn!(reason, "rule listing unavailable");
            }
            emit(json, &set, || {
                if set.is_empty() {
                    return "no active rules".to_owned();
                }
                set.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
            })
        }
        RulesAction::Add {
            kind,
            source,
            target,
            dir,
            symlink,
        } => {
            let mut flags = RuleFlags::empty();
            flags.set(RuleFlags::DIRECTORY, dir);
            flags.set(RuleFlags::SYMLINK, symlink);
            let id = store.add(Rule::new(kind, source, target).with_flags(flags)).await?;
            emit(json, &id, || format!("rule {id} active"))
        }
        RulesAction::Delete { id } => {
            store.delete(id).await?;
            emit(json, &id, || format!("rule {id} deleted"))
        }
        RulesAction::Clear => {
            store.clear_all().await?;
            emit(json, &true, || "all rules cleared".to_owned())
        }
    }
}

async fn handle_config(session: &Session, action: ConfigAction, json: bool) -> anyhow::Result<()> {
    let manager = session.engine_config().await;
    let mut config = manager.load().await;
    match action {
        ConfigAction::Show => emit(json, &config, || {
            toml::to_string_pretty(&config).unwrap_or_else(|e| format!("<unprintable: {e}>"))
        }),
        ConfigAction::Set { key, value } => {
            if key == "mirror_path" {
                config.mirror_path = (!value.is_empty()).then(|| PathBuf::from(&value));
            } else {
                let toggle: Toggle = key.parse().map_err(anyhow::Error::msg)?;
                toggle.set(&mut config, parse_switch(&value)?);
            }
            match manager.save(&config).await {
                Ok(report) => emit(json, &report, || {
                    let mut text = format!("saved {}", manager.path().display());
                    for deferred in &report.deferred {
                        text.push_str(&format!(
                            "\n{} not applied: {}",
                            deferred.setting, deferred.diagnostic
                        ));
                    }
                    text
                }),
                Err(err @ ConfigError::Gated { .. }) => {
                    warn!(error = %err, "setting saved but not applied");
                    emit(json, &err.to_string(), || format!("saved; {err}"))
                }
                Err(err) => Err(err.into()),
            }
        }
    }
}

async fn handle_modules(session: &Session, action: ModulesAction, json: bool) -> anyhow::Result<()> {
    let store = session.bindings().await;
    match action {
        ModulesAction::List => {
            let views = store.views().await;
            emit(json, &views, || {
                if views.is_empty() {
                    return "no modules".to_owned();
                }
                views
                    .iter()
                    .map(|v| {
                        format!(
                            "{:<24} declared={:<8} active={:<8}{}",
                            v.module_id,
                            v.pending.map_or_else(|| "-".to_owned(), |s| s.to_string()),
                            v.active.map_or_else(|| "?".to_owned(), |s| s.to_string()),
                            if v.needs_restart { " (restart to apply)" } else { "" }
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        ModulesAction::Set { id, strategy } => {
            let view = store
                .set(ModuleBinding {
                    module_id: id,
                    strategy,
                })
                .await?;
            emit(json, &view, || {
                format!(
                    "{} set to {strategy}{}",
                    view.module_id,
                    if view.needs_restart { "; restart to apply" } else { "" }
                )
            })
        }
    }
}

async fn handle_mounts(session: &Session, action: MountsAction, json: bool) -> anyhow::Result<()> {
    let reconciler = session.mounts().await?;
    match action {
        MountsAction::Check => {
            let report = reconciler.check().await.context("failed to read mountinfo")?;
            emit(json, &report, || {
                if report.is_canonical() {
                    format!("{} mounts, ordering canonical", report.mounts)
                } else {
                    format!(
                        "{} mounts, {} duplicated ids, {} out of order",
                        report.mounts,
                        report.duplicates.len(),
                        report.inversions.len()
                    )
                }
            })
        }
        MountsAction::Fix => {
            let report = reconciler.reconcile().await?;
            emit(json, &report, || {
                if report.repaired {
                    "mount ordering repaired".to_owned()
                } else {
                    "mount ordering already canonical".to_owned()
                }
            })
        }
    }
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce() -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", human());
    }
    Ok(())
}

fn parse_switch(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Ok(true),
        "false" | "off" | "0" | "no" => Ok(false),
        other => bail!("expected on/off, got '{other}'"),
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

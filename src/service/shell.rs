//! Text transport that drives the engine CLI through a root shell.
//!
//! Replies are exit status plus combined output. Integers the caller needs
//! (rule ids, versions) are parsed here so nothing downstream re-parses text.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Command, ServiceBackend, ServiceError, ServiceReply};
use crate::config::TransportKind;
use crate::privilege::PrivilegeTier;
use crate::rules::RuleKind;

/// Root-shell service client.
#[derive(Debug, Clone)]
pub struct ShellBackend {
    su_path: PathBuf,
    engine_cli: String,
    timeout: Duration,
}

/// Captured result of one shell invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ShellOutput {
    exit_code: i32,
    output: String,
}

impl ShellBackend {
    /// Create a client that elevates with `su_path` and drives `engine_cli`.
    pub fn new(su_path: PathBuf, engine_cli: String, timeout: Duration) -> Self {
        Self {
            su_path,
            engine_cli,
            timeout,
        }
    }

    /// Render the engine CLI invocation for a command, or `None` when the
    /// command is answered without the engine CLI.
    pub fn render(&self, command: &Command) -> Option<String> {
        let cli = &self.engine_cli;
        let line = match command {
            Command::ProbeTier(PrivilegeTier::Kernel) => format!("{cli} status"),
            Command::ProbeTier(_) => return None,
            Command::ServiceVersion => format!("{cli} version"),
            Command::EngineVersion => format!("{cli} version --engine"),
            Command::SelinuxContext { pid } => {
                let pid = pid.map_or_else(|| "self".to_owned(), |p| p.to_string());
                format!("cat /proc/{pid}/attr/current")
            }
            Command::AddRule {
                kind,
                source,
                target,
                flags,
            } => {
                let mut line = format!(
                    "{cli} rule {} {}",
                    rule_verb(*kind),
                    shell_escape(&source.to_string_lossy())
                );
                if let Some(target) = target {
                    line.push(' ');
                    line.push_str(&shell_escape(&target.to_string_lossy()));
                }
                if !flags.is_empty() {
                    line.push_str(&format!(" --flags {}", flags.bits()));
                }
                line
            }
            Command::DeleteRule(id) => format!("{cli} rule delete {id}"),
            Command::ClearRules => format!("{cli} rule clear"),
            Command::ListRules => format!("{cli} rule list"),
            Command::SetStealth(on) => format!("{cli} stealth {}", on_off(*on)),
            Command::SetDebug(on) => format!("{cli} debug {}", on_off(*on)),
            Command::SetAvcSpoof(on) => format!("{cli} avc-spoof {}", on_off(*on)),
            Command::SetMirrorPath(path) => {
                format!("{cli} mirror {}", shell_escape(&path.to_string_lossy()))
            }
            Command::FixMounts => format!("{cli} fix-mounts"),
            Command::NukeExt4Sysfs => format!("{cli} nuke-ext4"),
            Command::ListModules => format!("{cli} modules"),
        };
        Some(line)
    }

    async fn run(&self, program: &std::path::Path, args: &[&str]) -> Result<ShellOutput, ServiceError> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ServiceError::Unavailable(format!("cannot spawn {}: {e}", program.display()))
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ServiceError::Timeout {
                    seconds: self.timeout.as_secs(),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
            (_, true) => stdout.into_owned(),
            (true, false) => stderr.into_owned(),
            (false, false) => format!("{stdout}\n{stderr}"),
        };
        Ok(ShellOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }

    async fn run_elevated(&self, line: &str) -> Result<ShellOutput, ServiceError> {
        debug!(su = %self.su_path.display(), command = line, "running through root shell");
        self.run(&self.su_path, &["-c", line]).await
    }

    async fn probe(&self, tier: PrivilegeTier) -> Result<ServiceReply, ServiceError> {
        let granted = match tier {
            PrivilegeTier::Shell => {
                self.run(std::path::Path::new("sh"), &["-c", "true"])
                    .await?
                    .exit_code
                    == 0
            }
            PrivilegeTier::Root => {
                let out = self.run_elevated("id -u").await?;
                out.exit_code == 0 && out.output.trim() == "0"
            }
            PrivilegeTier::Kernel => {
                let line = format!("{} status", self.engine_cli);
                self.run_elevated(&line).await?.exit_code == 0
            }
        };
        let code = if granted { tier.code() } else { -1 };
        Ok(ServiceReply {
            status: if granted { 0 } else { 1 },
            value: Some(i64::from(code)),
            text: String::new(),
            structured: false,
        })
    }
}

#[async_trait]
impl ServiceBackend for ShellBackend {
    async fn call(&self, command: &Command) -> Result<ServiceReply, ServiceError> {
        if let Command::ProbeTier(tier) = command {
            return self.probe(*tier).await;
        }
        let Some(line) = self.render(command) else {
            return Err(ServiceError::Unsupported {
                command: command.name(),
                transport: TransportKind::Shell,
            });
        };

        let out = self.run_elevated(&line).await?;
        let value = match command {
            Command::AddRule { .. } | Command::ServiceVersion | Command::EngineVersion => {
                parse_trailing_integer(&out.output)
            }
            _ => None,
        };
        Ok(ServiceReply {
            status: out.exit_code,
            value,
            text: out.output.trim_end().to_owned(),
            structured: false,
        })
    }

    async fn disconnect(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Shell
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_escape(raw: &str) -> String {
    let escaped = raw.replace('\'', r"'\''");
    format!("'{escaped}'")
}

/// Last whitespace-separated token of the output, parsed as an integer.
fn parse_trailing_integer(output: &str) -> Option<i64> {
    output.split_whitespace().last()?.parse().ok()
}

fn rule_verb(kind: RuleKind) -> &'static str {
    match kind {
        RuleKind::Add => "add",
        RuleKind::Hide => "hide",
        RuleKind::Inject => "inject",
        RuleKind::Merge => "merge",
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

//! Serialized command execution against the negotiated connection.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::privilege::PrivilegeChannel;
use crate::service::Command;

pub mod classify;

pub use classify::Classifier;

/// Terminal result of one command. Failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Payload text on success, diagnostic text on failure.
    pub text: String,
    /// Whether the command succeeded.
    pub success: bool,
    /// Integer carried by the reply (rule id, version), if any.
    pub value: Option<i64>,
    /// Raw status reported by the service, when a reply arrived at all.
    pub status: Option<i32>,
}

impl Outcome {
    /// Failed outcome with a diagnostic and no service status.
    pub fn failure(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            success: false,
            value: None,
            status: None,
        }
    }
}

/// One-at-a-time request channel to the privileged service.
///
/// Calls are queued on a single lane. Each call runs on its own task holding
/// the lane, so a caller that stops waiting does not cancel the privileged
/// call or let the next one overtake it.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    channel: Arc<PrivilegeChannel>,
    lane: Arc<Mutex<()>>,
    classifier: Classifier,
}

impl CommandExecutor {
    /// Executor issuing commands through `channel`.
    pub fn new(channel: Arc<PrivilegeChannel>) -> Self {
        Self {
            channel,
            lane: Arc::new(Mutex::new(())),
            classifier: Classifier::new(),
        }
    }

    /// Channel this executor runs on.
    pub fn channel(&self) -> &Arc<PrivilegeChannel> {
        &self.channel
    }

    /// Run one command and classify its reply.
    pub async fn execute(&self, command: Command) -> Outcome {
        if self.channel.current().is_none() {
            return Outcome::failure(format!("{command}: not connected to privileged service"));
        }

        let permit = Arc::clone(&self.lane).lock_owned().await;
        let backend = Arc::clone(self.channel.backend());
        let classifier = self.classifier.clone();
        let name = command.name();

        let task = tokio::spawn(async move {
            let _permit = permit;
            debug!(command = %command, "issuing service command");
            match backend.call(&command).await {
                Ok(reply) => {
                    let success = classifier.is_success(&reply, command.returns_payload());
                    let text = if reply.text.is_empty() && !success {
                        format!("{command} failed with status {}", reply.status)
                    } else {
                        reply.text
                    };
                    Outcome {
                        text,
                        success,
                        value: reply.value,
                        status: Some(reply.status),
                    }
                }
                Err(err) => Outcome::failure(format!("{command}: {err}")),
            }
        });

        match task.await {
            Ok(outcome) => {
                if !outcome.success {
                    debug!(command = name, diagnostic = %outcome.text, "service command failed");
                }
                outcome
            }
            Err(err) => {
                warn!(command = name, error = %err, "service command task aborted");
                Outcome::failure(format!("{name}: execution aborted: {err}"))
            }
        }
    }
}

//! Per-process wiring of the channel, executor, and components.
//!
//! A [`Session`] owns the one [`PrivilegeChannel`] and hands out components
//! bound to the current [`Connection`]. Components never reach for global
//! state; they get the connection they were built with.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{ClientConfig, TransportKind};
use crate::engine_config::bindings::BindingStore;
use crate::engine_config::ConfigManager;
use crate::executor::CommandExecutor;
use crate::mount::MountReconciler;
use crate::privilege::{Capability, ConnectError, ConnectOptions, Connection, PrivilegeChannel};
use crate::rules::{RuleStore, RuleSummary};
use crate::service::{backend_from_config, ServiceBackend};

/// Snapshot of everything a status screen shows.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// When the snapshot was taken.
    pub generated_at: DateTime<Utc>,
    /// Transport in use.
    pub transport: TransportKind,
    /// Negotiated connection, if any.
    pub connection: Option<Connection>,
    /// Why connecting failed, if it did.
    pub connect_error: Option<String>,
    /// Whether the overlay engine is reachable at this tier.
    pub kernel_mode: bool,
    /// Active rule counts, when the listing succeeded.
    pub rules: Option<RuleSummary>,
    /// Declared stealth flag.
    pub stealth: bool,
    /// Modules whose declared strategy differs from the mounted one.
    pub pending_restart: Vec<String>,
}

/// Owner of the privilege channel for one process.
#[derive(Debug)]
pub struct Session {
    config: ClientConfig,
    channel: Arc<PrivilegeChannel>,
    executor: CommandExecutor,
}

impl Session {
    /// Session using the backend selected by `config`.
    ///
    /// Reads the declared engine config to decide whether protocol
    /// mismatches are tolerated.
    pub async fn open(config: ClientConfig) -> Self {
        let backend = backend_from_config(&config.service);
        let declared = ConfigManager::new(&config.paths.engine_config).load().await;
        let options = ConnectOptions {
            ignore_protocol_mismatch: declared.ignore_protocol_mismatch,
        };
        Self::with_backend(config, backend, options)
    }

    /// Session over an explicit backend.
    pub fn with_backend(
        config: ClientConfig,
        backend: Arc<dyn ServiceBackend>,
        options: ConnectOptions,
    ) -> Self {
        let channel = Arc::new(PrivilegeChannel::new(backend, options));
        let executor = CommandExecutor::new(Arc::clone(&channel));
        Self {
            config,
            channel,
            executor,
        }
    }

    /// Client configuration this session was built from.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The privilege channel.
    pub fn channel(&self) -> &Arc<PrivilegeChannel> {
        &self.channel
    }

    /// Negotiate (or reuse) the connection.
    ///
    /// # Errors
    ///
    /// See [`PrivilegeChannel::connect`].
    pub async fn connect(&self) -> Result<Arc<Connection>, ConnectError> {
        self.channel.connect().await
    }

    /// Rule store bound to the current connection.
    ///
    /// # Errors
    ///
    /// See [`PrivilegeChannel::connect`].
    pub async fn rules(&self) -> Result<RuleStore, ConnectError> {
        let connection = self.connect().await?;
        Ok(RuleStore::new(connection, self.executor.clone()))
    }

    /// Mount reconciler bound to the current connection.
    ///
    /// # Errors
    ///
    /// See [`PrivilegeChannel::connect`].
    pub async fn mounts(&self) -> Result<MountReconciler, ConnectError> {
        let connection = self.connect().await?;
        let rules = RuleStore::new(Arc::clone(&connection), self.executor.clone());
        Ok(MountReconciler::new(
            connection,
            self.executor.clone(),
            rules,
            &self.config.paths.mountinfo,
        ))
    }

    /// Engine config manager; works offline when the service is absent.
    pub async fn engine_config(&self) -> ConfigManager {
        let manager = ConfigManager::new(&self.config.paths.engine_config);
        match self.connect().await {
            Ok(connection) => manager.with_engine(connection, self.executor.clone()),
            Err(err) => {
                tracing::debug!(error = %err, "engine config opened without service");
                manager
            }
        }
    }

    /// Module strategy store; works offline when the service is absent.
    pub async fn bindings(&self) -> BindingStore {
        let store = BindingStore::new(&self.config.paths.module_modes);
        match self.connect().await {
            Ok(connection) => store.with_engine(connection, self.executor.clone()),
            Err(err) => {
                tracing::debug!(error = %err, "module strategies opened without service");
                store
            }
        }
    }

    /// Gather a [`StatusReport`]. Never fails; absence of the service is
    /// reported in the result.
    pub async fn status(&self) -> StatusReport {
        let transport = self.channel.backend().transport();
        let declared = ConfigManager::new(&self.config.paths.engine_config).load().await;
        let pending_restart = self
            .bindings()
            .await
            .views()
            .await
            .into_iter()
            .filter(|v| v.needs_restart)
            .map(|v| v.module_id)
            .collect();

        let (connection, connect_error) = match self.connect().await {
            Ok(connection) => (Some(connection), None),
            Err(err) => (None, Some(err.to_string())),
        };
        let kernel_mode = connection
            .as_ref()
            .is_some_and(|c| c.allows(Capability::OVERLAY_ENGINE));
        let rules = match &connection {
            Some(connection) if kernel_mode => {
                let set = RuleStore::new(Arc::clone(connection), self.executor.clone())
                    .list()
                    .await;
                set.is_authoritative().then(|| set.summary())
            }
            _ => None,
        };

        StatusReport {
            generated_at: Utc::now(),
            transport,
            connection: connection.map(|c| c.as_ref().clone()),
            connect_error,
            kernel_mode,
            rules,
            stealth: declared.enable_stealth,
            pending_restart,
        }
    }

    /// Drop the connection.
    pub async fn close(&self) {
        self.channel.disconnect().await;
    }
}

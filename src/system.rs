//! The system context: every configured DQM under one roof.
//!
//! Hosts build a [`System`] from loaded configuration at startup and keep
//! it for the life of the process. There are no hidden globals here; the
//! only process-wide piece of the core is the engine registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{error, info};

use crate::conduit::{Conduit, TokenValidator};
use crate::config::{Config, ConfigError};
use crate::dqm::{Dqm, DqmStatus};
use crate::engine::Registry;

/// Every configured database's queue manager, plus launch outcomes.
pub struct System {
    dqms: HashMap<String, Dqm>,
    launch_errors: HashMap<String, String>,
}

impl System {
    /// Build and launch a DQM for every configured database, using the
    /// process-wide engine registry.
    ///
    /// A database whose launch fails (connection trouble, migration
    /// failure, hash mismatch) keeps its DQM in `Launching`: it accepts
    /// nothing but stays visible in `status`, and the rest of the system
    /// comes up around it.
    ///
    /// # Errors
    /// Configuration errors only; launch failures are per-database state,
    /// not boot failures.
    pub async fn boot(config: &Config) -> Result<Self, ConfigError> {
        Self::boot_with_registry(config, Registry::global()).await
    }

    /// [`System::boot`] against an explicit registry; used by tests and by
    /// hosts embedding their own providers.
    ///
    /// # Errors
    /// Same conditions as [`System::boot`].
    pub async fn boot_with_registry(
        config: &Config,
        registry: &Registry,
    ) -> Result<Self, ConfigError> {
        let descriptors = config.descriptors()?;
        let mut dqms = HashMap::new();
        let mut launch_errors = HashMap::new();
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            let engine = registry
                .get(descriptor.engine)
                .ok_or_else(|| ConfigError::UnknownEngine(descriptor.engine.to_string()))?;
            let dqm = Dqm::new(descriptor, engine);
            if let Err(cause) = dqm.launch().await {
                error!(database = %name, %cause, "queue manager failed to launch");
                launch_errors.insert(name.clone(), cause.to_string());
            }
            dqms.insert(name, dqm);
        }
        info!(
            databases = dqms.len(),
            failed = launch_errors.len(),
            "system context ready"
        );
        Ok(Self {
            dqms,
            launch_errors,
        })
    }

    /// Look up one database's queue manager.
    #[must_use]
    pub fn dqm(&self, name: &str) -> Option<&Dqm> {
        self.dqms.get(name)
    }

    /// Databases whose launch failed, with the failure text.
    #[must_use]
    pub fn launch_errors(&self) -> &HashMap<String, String> {
        &self.launch_errors
    }

    /// Build the conduit surface over every managed database.
    #[must_use]
    pub fn conduit(&self, validator: Arc<dyn TokenValidator>) -> Conduit {
        Conduit::new(self.dqms.clone(), validator)
    }

    /// Status snapshot per database.
    #[must_use]
    pub fn status(&self) -> HashMap<String, DqmStatus> {
        self.dqms
            .iter()
            .map(|(name, dqm)| (name.clone(), dqm.status()))
            .collect()
    }

    /// Drain and land every DQM.
    pub async fn shutdown(&self, grace: Duration) {
        join_all(self.dqms.values().map(|dqm| dqm.shutdown(grace))).await;
        info!("system context landed");
    }
}

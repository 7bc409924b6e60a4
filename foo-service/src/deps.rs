use health::HealthRegistry;
use tracing::info;

use crate::backends::{Backends, Connector};
use crate::config::Config;
use crate::dal::Dals;
use crate::error::DependencyError;

/// Everything the request handlers need, assembled once at startup.
pub struct Dependencies {
    pub backends: Backends,
    pub dals: Dals,
    pub health: HealthRegistry,
}

impl Dependencies {
    /// Connect the backends, build the DALs, then register every health check
    /// and start the registry. Stops at the first failure: nothing later in
    /// the sequence is constructed, whatever was opened is closed again and
    /// the registry is left unstarted.
    pub async fn new(
        config: &Config,
        connector: &dyn Connector,
        health: HealthRegistry,
    ) -> Result<Self, DependencyError> {
        let backends = Backends::connect(config, connector).await?;

        let (dals, mut checks) = match Dals::new(&backends, config).await {
            Ok(dals) => dals,
            Err(err) => {
                backends.database.close().await;
                return Err(err);
            }
        };
        checks.extend(backends.health_checks(config.health_freq_sec.0));

        if let Err(err) = health.add_checks(checks).and_then(|()| health.start()) {
            dals.close().await;
            backends.database.close().await;
            return Err(err.into());
        }
        info!(checks = ?health.check_names(), "dependencies ready");

        Ok(Self {
            backends,
            dals,
            health,
        })
    }

    pub async fn shutdown(&self) {
        self.health.stop().await;
        self.dals.close().await;
        self.backends.database.close().await;
        info!("dependencies closed");
    }
}

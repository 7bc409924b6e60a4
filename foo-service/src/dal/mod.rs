use std::sync::Arc;

use health::HealthCheck;

use crate::backends::Backends;
use crate::config::Config;
use crate::error::DependencyError;

pub mod foo;

pub use foo::FooDal;

/// Every DAL of the service.
pub struct Dals {
    pub foo: Arc<FooDal>,
}

impl Dals {
    /// Build the DALs on top of connected backends. Each DAL hands back its
    /// health check rather than registering it: checks are only registered
    /// once the whole assembly succeeded.
    pub async fn new(
        backends: &Backends,
        config: &Config,
    ) -> Result<(Self, Vec<HealthCheck>), DependencyError> {
        let foo = Arc::new(
            FooDal::new(
                backends.database.as_ref(),
                backends.foo_client.clone(),
                config.dal_refresh_interval_sec.0,
                config.foo_expires_after_sec.0,
            )
            .await?,
        );

        let checks = vec![
            HealthCheck::new("foo-dal", foo.clone(), config.health_freq_sec.0).fatal(),
        ];

        Ok((Self { foo }, checks))
    }

    pub async fn close(&self) {
        self.foo.close().await
    }
}

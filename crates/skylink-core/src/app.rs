use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Config;

/// How long `shutdown` waits for a background service before abandoning it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A named background task owned by the application.
struct ServiceHandle {
    name: String,
    handle: JoinHandle<()>,
}

/// Main application state and lifecycle manager.
///
/// Owns the configuration and every long-running service (event pumps,
/// orchestrators). Services receive a child of the root cancellation token
/// and are expected to return once it fires.
pub struct App {
    config: Arc<Config>,
    shutdown: CancellationToken,
    services: Vec<ServiceHandle>,
}

impl App {
    /// Create a new application instance from the on-disk configuration
    pub fn new() -> Result<Self> {
        let (config, _) = Config::load_validated()?;
        Ok(Self::with_config(config))
    }

    /// Create an application around an already-loaded configuration
    pub fn with_config(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            services: Vec::new(),
        }
    }

    /// Token that fires when the application shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Spawn a background service onto the current runtime
    pub fn spawn_service<F>(&mut self, name: impl Into<String>, service: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        tracing::info!("Starting service: {}", name);
        let handle = tokio::spawn(service);
        self.services.push(ServiceHandle { name, handle });
    }

    /// Names of the services started so far
    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name.as_str()).collect()
    }

    /// Shutdown the application and wait for all services
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!(
            "Shutting down application ({} services)",
            self.services.len()
        );
        self.shutdown.cancel();

        for service in self.services {
            tracing::debug!("Waiting for service: {}", service.name);
            match tokio::time::timeout(SHUTDOWN_GRACE, service.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Service {} ended abnormally: {}", service.name, e);
                }
                Err(_) => {
                    tracing::warn!("Service {} did not stop in time", service.name);
                }
            }
        }

        Ok(())
    }

    /// Get reference to application config
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared handle to the application config
    pub fn config_arc(&self) -> Arc<Config> {
        self.config.clone()
    }
}

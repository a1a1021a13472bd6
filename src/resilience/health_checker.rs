use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Something that can be asked whether a dependency is reachable
#[async_trait]
pub trait HealthCheck: Send + Sync + 'static {
    async fn check(&self) -> Result<()>;
}

/// Configuration for health checks
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// How often to run the check
    pub check_interval: Duration,
    /// Timeout for one check
    pub check_timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            check_timeout: Duration::from_secs(1),
        }
    }
}

/// Periodically runs a check and publishes the result through a shared flag.
///
/// The flag is handed in by the owner so it can also be updated by regular
/// traffic. The background task stops when the checker is dropped.
pub struct HealthChecker<P: HealthCheck> {
    /// Flag indicating if the dependency is healthy
    is_healthy: Arc<AtomicBool>,
    target: Arc<P>,
    /// Configuration for health checks
    config: HealthCheckConfig,
    /// Cancel flag for the health check task
    cancel_flag: Arc<AtomicBool>,
}

impl<P: HealthCheck> std::fmt::Debug for HealthChecker<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("is_healthy", &self.is_healthy())
            .field("config", &self.config)
            .finish()
    }
}

impl<P: HealthCheck> HealthChecker<P> {
    pub fn new(target: Arc<P>, config: HealthCheckConfig, is_healthy: Arc<AtomicBool>) -> Self {
        Self {
            is_healthy,
            target,
            config,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the health checker background task
    pub fn start(&self) -> task::JoinHandle<()> {
        let target = Arc::clone(&self.target);
        let is_healthy = Arc::clone(&self.is_healthy);
        let interval = self.config.check_interval;
        let timeout = self.config.check_timeout;
        let cancel_flag = Arc::clone(&self.cancel_flag);

        task::spawn(async move {
            let mut interval_timer = time::interval(interval);

            loop {
                interval_timer.tick().await;

                if cancel_flag.load(Ordering::SeqCst) {
                    break;
                }

                run_check(target.as_ref(), timeout, &is_healthy).await;
            }

            debug!("Health checker task stopped");
        })
    }

    /// Run the check once and update the flag
    pub async fn check_now(&self) -> bool {
        run_check(self.target.as_ref(), self.config.check_timeout, &self.is_healthy).await
    }

    /// Stop the health checker
    pub fn stop(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Check if the dependency is currently healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy.load(Ordering::SeqCst)
    }
}

impl<P: HealthCheck> Drop for HealthChecker<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_check<P: HealthCheck>(target: &P, timeout: Duration, is_healthy: &AtomicBool) -> bool {
    let healthy = match time::timeout(timeout, target.check()).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(error = %e, "Health check failed");
            false
        }
        Err(_) => {
            error!(timeout = ?timeout, "Health check timed out");
            false
        }
    };

    let previous = is_healthy.swap(healthy, Ordering::SeqCst);
    if previous != healthy {
        if healthy {
            info!("Counter store is now healthy");
        } else {
            warn!("Counter store is now unhealthy");
        }
    }
    healthy
}

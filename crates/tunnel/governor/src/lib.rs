//! Dispatch rate governor.
//!
//! A [`GovernorPool`] hands out named concurrency limiters, created lazily on
//! first request and memoized by name. The limiter bounds how many operations
//! of one class run at once so a single slow device cannot starve the rest of
//! the tunnel.

#![deny(unsafe_code)]

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

/// Limiter configuration. Memoization is by name only: if a name is reused
/// with a different configuration, the original configuration wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GovernorConfig {
    pub max_concurrency: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self { max_concurrency: 8 }
    }
}

#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("governor '{0}' is closed")]
    Closed(String),
}

/// One named limiter. Tokio's semaphore hands out permits in FIFO order, so
/// a ceiling of 1 also preserves submission order; above 1 only the ceiling
/// is guaranteed.
pub struct RateGovernor {
    name: String,
    semaphore: Arc<Semaphore>,
    config: GovernorConfig,
}

impl RateGovernor {
    fn new(name: impl Into<String>, config: GovernorConfig) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> GovernorConfig {
        self.config
    }

    /// Permits not currently held by running tasks.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `task` once a permit is available.
    pub async fn run<F, T>(&self, task: F) -> Result<T, GovernorError>
    where
        F: Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| GovernorError::Closed(self.name.clone()))?;
        Ok(task.await)
    }

    /// Stop admitting new tasks; queued waiters observe [`GovernorError::Closed`].
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Lazily-created, name-memoized limiters, safe under concurrent lookup from
/// every handler.
#[derive(Default)]
pub struct GovernorPool {
    limiters: DashMap<String, Arc<RateGovernor>>,
}

impl GovernorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the limiter registered under `name`.
    pub fn limiter(&self, name: &str, config: GovernorConfig) -> Arc<RateGovernor> {
        self.limiters
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(governor = %name, max_concurrency = config.max_concurrency, "Creating limiter");
                Arc::new(RateGovernor::new(name, config))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Close every limiter (shutdown path).
    pub fn close_all(&self) {
        for entry in self.limiters.iter() {
            entry.value().close();
        }
    }
}

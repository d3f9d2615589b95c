//! Concurrency governor: one global entity limit plus named per-source
//! limiters.
//!
//! Every external call acquires the limiter for its source and every
//! in-flight entity holds one global permit. Permits release on drop, so a
//! failing or panicking holder can never leak capacity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use lienflow_shared::{AppConfig, LimiterConfig, PipelineError, Result};

/// Which pool a permit is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    /// Entities in flight across the whole run.
    Global,
    /// A named limiter (`verifier`, `tax`, `document_index`, ...).
    Limiter(&'a str),
}

impl std::fmt::Display for Scope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Limiter(name) => f.write_str(name),
        }
    }
}

/// A held slot. Dropping it returns the slot to its pool.
#[derive(Debug)]
pub struct Permit {
    scope: String,
    _inner: OwnedSemaphorePermit,
}

impl Permit {
    pub fn scope(&self) -> &str {
        &self.scope
    }
}

struct Limiter {
    semaphore: Arc<Semaphore>,
    min_interval: Duration,
}

/// Process-wide limits shared by every entity task.
pub struct ConcurrencyGovernor {
    global: Arc<Semaphore>,
    limiters: HashMap<String, Limiter>,
}

impl ConcurrencyGovernor {
    /// Build a governor. Every limit must be positive.
    pub fn new(
        global_concurrency: usize,
        limiters: &BTreeMap<String, LimiterConfig>,
    ) -> Result<Self> {
        if global_concurrency == 0 {
            return Err(PipelineError::config(
                "orchestrator.global_concurrency must be > 0",
            ));
        }

        let mut built = HashMap::with_capacity(limiters.len());
        for (name, limiter) in limiters {
            if limiter.concurrency == 0 {
                return Err(PipelineError::config(format!(
                    "limiters.{name}.concurrency must be > 0"
                )));
            }
            built.insert(
                name.clone(),
                Limiter {
                    semaphore: Arc::new(Semaphore::new(limiter.concurrency)),
                    min_interval: Duration::from_millis(limiter.min_interval_ms),
                },
            );
        }

        Ok(Self {
            global: Arc::new(Semaphore::new(global_concurrency)),
            limiters: built,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(config.orchestrator.global_concurrency, &config.limiters)
    }

    /// Wait for a slot in `scope`.
    ///
    /// Limiters with a `min_interval_ms` hold the caller for that long after
    /// the slot is granted, which spaces calls to the same source.
    pub async fn acquire(&self, scope: Scope<'_>) -> Result<Permit> {
        let (semaphore, min_interval) = self.pool(scope)?;
        let inner = semaphore
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Capacity(format!("limiter {scope} is closed")))?;

        if !min_interval.is_zero() {
            tokio::time::sleep(min_interval).await;
        }

        debug!(%scope, "permit acquired");
        Ok(Permit {
            scope: scope.to_string(),
            _inner: inner,
        })
    }

    /// Return a permit early. Equivalent to dropping it.
    pub fn release(&self, permit: Permit) {
        debug!(scope = permit.scope(), "permit released");
        drop(permit);
    }

    /// Slots currently free in `scope`.
    pub fn available(&self, scope: Scope<'_>) -> Result<usize> {
        Ok(self.pool(scope)?.0.available_permits())
    }

    /// Close every pool. Pending and future acquires fail with a capacity error.
    pub fn close(&self) {
        self.global.close();
        for limiter in self.limiters.values() {
            limiter.semaphore.close();
        }
    }

    fn pool(&self, scope: Scope<'_>) -> Result<(Arc<Semaphore>, Duration)> {
        match scope {
            Scope::Global => Ok((self.global.clone(), Duration::ZERO)),
            Scope::Limiter(name) => self
                .limiters
                .get(name)
                .map(|l| (l.semaphore.clone(), l.min_interval))
                .ok_or_else(|| PipelineError::config(format!("no limiter configured for {name}"))),
        }
    }
}

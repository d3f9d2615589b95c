//! Phase 2: identity verification followed by concurrent source lookups.
//!
//! F1 runs the verifier alone. F2 queries every other source at once with
//! the identity F1 produced (or the seed identity when F1 failed). Each
//! call runs under its own limiter and timeout; a failing, slow, or
//! panicking source only fills its own slot with a failure.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use lienflow_shared::{
    EnrichmentResultSet, Entity, Identity, PipelineError, Result, SourceData, SourceKind,
    SourceResult, TimeoutConfig,
};

use crate::collaborators::{EnrichmentServices, EnrichmentSource};
use crate::governor::{ConcurrencyGovernor, Scope};

pub struct EnrichmentFanOut {
    services: EnrichmentServices,
    governor: Arc<ConcurrencyGovernor>,
    timeouts: TimeoutConfig,
}

impl EnrichmentFanOut {
    pub fn new(
        services: EnrichmentServices,
        governor: Arc<ConcurrencyGovernor>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            services,
            governor,
            timeouts,
        }
    }

    /// Run F1 then F2 and return every slot. Never fails as a whole.
    #[instrument(skip_all, fields(entity = %entity.case_number))]
    pub async fn enrich(&self, entity: &Entity) -> EnrichmentResultSet {
        let verifier = self.verify(entity).await;
        let identity = match verifier.data() {
            Some(SourceData::Verifier(verified)) => Identity::from_verified(verified),
            _ => {
                debug!(
                    reason = verifier.failure_reason().unwrap_or_default(),
                    "verification unavailable, using seed identity"
                );
                Identity::from_seed(entity)
            }
        };

        let results = self.query_sources(&identity).await;
        EnrichmentResultSet {
            entity_id: entity.case_number.clone(),
            identity,
            verifier,
            results,
        }
    }

    async fn verify(&self, entity: &Entity) -> SourceResult {
        let kind = SourceKind::Verifier;
        let timeout = self.timeouts.verifier();
        let outcome = async {
            let _permit = self.governor.acquire(Scope::Limiter(kind.as_str())).await?;
            tokio::time::timeout(timeout, self.services.verifier.verify(entity))
                .await
                .map_err(|_| PipelineError::timeout(kind.as_str(), timeout))?
        }
        .await;

        match outcome {
            Ok(verified) => SourceResult::success(SourceData::Verifier(verified)),
            Err(e) => {
                warn!(error = %e, "verifier failed");
                SourceResult::failure(kind, &e)
            }
        }
    }

    async fn query_sources(&self, identity: &Identity) -> Vec<SourceResult> {
        let identity = Arc::new(identity.clone());
        let timeout = self.timeouts.source();
        let mut tasks = JoinSet::new();

        for (slot, source) in self.services.sources.iter().enumerate() {
            let source = source.clone();
            let governor = self.governor.clone();
            let identity = identity.clone();
            tasks.spawn(async move {
                let result = call_source(source.as_ref(), &governor, &identity, timeout).await;
                (slot, result)
            });
        }

        let mut slots: Vec<Option<SourceResult>> = vec![None; self.services.sources.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, result)) => slots[slot] = Some(result),
                Err(e) => warn!(error = %e, "source task did not finish"),
            }
        }

        slots
            .into_iter()
            .zip(&self.services.sources)
            .map(|(slot, source)| {
                slot.unwrap_or_else(|| {
                    SourceResult::failure(
                        source.kind(),
                        &PipelineError::Transient("source task panicked".into()),
                    )
                })
            })
            .collect()
    }
}

async fn call_source(
    source: &dyn EnrichmentSource,
    governor: &ConcurrencyGovernor,
    identity: &Identity,
    timeout: std::time::Duration,
) -> SourceResult {
    let kind = source.kind();
    let outcome: Result<SourceData> = async {
        let _permit = governor.acquire(Scope::Limiter(kind.as_str())).await?;
        let data = tokio::time::timeout(timeout, source.fetch(identity))
            .await
            .map_err(|_| PipelineError::timeout(kind.as_str(), timeout))??;
        if data.kind() != kind {
            return Err(PipelineError::validation(format!(
                "{kind} source returned {} data",
                data.kind()
            )));
        }
        Ok(data)
    }
    .await;

    match outcome {
        Ok(data) => SourceResult::success(data),
        Err(e) => {
            warn!(source = %kind, error = %e, "source lookup failed");
            SourceResult::failure(kind, &e)
        }
    }
}

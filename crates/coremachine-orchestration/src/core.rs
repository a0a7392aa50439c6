//! # Core (spec.md §9 "construct a `Core` value")
//!
//! The process-wide handle bundling the registries, state store, and
//! message bus — constructed once at startup and passed explicitly (or
//! held as a single `Arc` clone per task), never rebuilt or mutated. One
//! struct threaded through every processor instead of ambient globals.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use coremachine_bus::{BusError, MessageBus};
use coremachine_shared::config::CoreConfig;
use coremachine_shared::registry::Registries;
use coremachine_shared::resilience::{CircuitBreaker, CircuitBreakerBehavior};
use coremachine_shared::{CoreError, CoreResult};
use coremachine_store::StateStore;

/// Bundles everything a processor needs: the immutable workflow/handler
/// registries, a shared state store handle, a shared bus handle, and the
/// resolved configuration. Cheap to clone (every field is an `Arc` or a
/// plain value) — constructed once in `main`, cloned per consumer task.
#[derive(Clone)]
pub struct Core {
    pub registries: Arc<Registries>,
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<dyn MessageBus>,
    pub config: CoreConfig,
    /// `None` unless `CoreConfig::circuit_breaker` is set — a minimal
    /// deployment pays no cost for this.
    store_breaker: Option<Arc<CircuitBreaker>>,
    bus_breaker: Option<Arc<CircuitBreaker>>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("registries", &self.registries)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Core {
    pub fn new(
        registries: Registries,
        store: Arc<dyn StateStore>,
        bus: Arc<dyn MessageBus>,
        config: CoreConfig,
    ) -> Self {
        let breakers = config.circuit_breaker.clone().map(|settings| {
            (
                Arc::new(CircuitBreaker::new("store".to_string(), settings.clone().into())),
                Arc::new(CircuitBreaker::new("bus".to_string(), settings.into())),
            )
        });
        let (store_breaker, bus_breaker) = match breakers {
            Some((s, b)) => (Some(s), Some(b)),
            None => (None, None),
        };
        Self {
            registries: Arc::new(registries),
            store,
            bus,
            config,
            store_breaker,
            bus_breaker,
        }
    }

    /// Runs a `StateStore` call through the store circuit breaker when one
    /// is configured. `fut` is taken as a future rather than a closure so
    /// call sites keep their usual `self.core.store.method(...).await?`
    /// shape, just wrapped: `self.core.guard_store(self.core.store.method(...)).await?`.
    pub async fn guard_store<T>(&self, fut: impl Future<Output = CoreResult<T>>) -> CoreResult<T> {
        let Some(breaker) = &self.store_breaker else {
            return fut.await;
        };
        if !breaker.should_allow() {
            return Err(CoreError::StoreTransient(format!(
                "circuit breaker '{}' is open",
                breaker.name()
            )));
        }
        let started = Instant::now();
        let result = fut.await;
        match &result {
            Ok(_) => breaker.record_success(started.elapsed()),
            Err(_) => breaker.record_failure(started.elapsed()),
        }
        result
    }

    /// Runs a `MessageBus` call through the bus circuit breaker when one is
    /// configured, converting `BusError` into `CoreError::BusTransient` to
    /// match the existing call-site convention.
    pub async fn guard_bus<T>(
        &self,
        fut: impl Future<Output = Result<T, BusError>>,
    ) -> CoreResult<T> {
        let Some(breaker) = &self.bus_breaker else {
            return fut.await.map_err(|e| CoreError::BusTransient(e.to_string()));
        };
        if !breaker.should_allow() {
            return Err(CoreError::BusTransient(format!(
                "circuit breaker '{}' is open",
                breaker.name()
            )));
        }
        let started = Instant::now();
        let result = fut.await;
        match &result {
            Ok(_) => breaker.record_success(started.elapsed()),
            Err(_) => breaker.record_failure(started.elapsed()),
        }
        result.map_err(|e| CoreError::BusTransient(e.to_string()))
    }
}

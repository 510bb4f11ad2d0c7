//! Barrier registration
//!
//! Settings-driven barriers are built by [`BarrierFactory`]s and reconfigured
//! in place when settings change. Barriers registered ad hoc are kept
//! alongside them and never receive settings. The combined list is published
//! as a stream for the [`super::BarrierCoordinator`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use super::{Barrier, BarrierScope, ScopedBarrier};
use crate::config::BarrierSettings;
use crate::connectivity::ConnectivityManager;
use crate::dispatcher::DispatcherInfo;
use crate::error::{Error, Result};
use crate::queue::QueueMetrics;
use crate::reactive::{StateStream, StateSubject};

/// What factories may hand to the barriers they build. Read access only.
#[derive(Clone)]
pub struct BarrierContext {
    pub connectivity: Arc<ConnectivityManager>,
    pub queue_metrics: QueueMetrics,
    pub dispatchers: StateStream<Vec<DispatcherInfo>>,
}

/// Builds one kind of settings-driven barrier.
pub trait BarrierFactory: Send + Sync {
    /// Id of the barriers it builds, and the `[barriers.<id>]` settings key.
    fn id(&self) -> &str;

    /// Scopes used when settings name none.
    fn default_scopes(&self) -> Vec<BarrierScope> {
        vec![BarrierScope::All]
    }

    /// Must be called within a Tokio runtime.
    fn create(&self, context: &BarrierContext, configuration: &Map<String, Value>) -> Arc<dyn Barrier>;
}

#[derive(Default)]
struct Registry {
    /// One per factory, in factory order
    configured: Vec<ScopedBarrier>,
    additional: Vec<ScopedBarrier>,
}

impl Registry {
    fn all(&self) -> Vec<ScopedBarrier> {
        self.configured
            .iter()
            .chain(self.additional.iter())
            .cloned()
            .collect()
    }
}

pub struct BarrierManager {
    context: BarrierContext,
    factories: Vec<Arc<dyn BarrierFactory>>,
    registry: Mutex<Registry>,
    registrations: StateSubject<Vec<ScopedBarrier>>,
}

impl BarrierManager {
    pub fn new(context: BarrierContext, factories: Vec<Arc<dyn BarrierFactory>>) -> Self {
        Self {
            context,
            factories,
            registry: Mutex::new(Registry::default()),
            registrations: StateSubject::new(Vec::new()),
        }
    }

    /// Every registered barrier with its scopes.
    pub fn registrations(&self) -> StateStream<Vec<ScopedBarrier>> {
        self.registrations.subscribe()
    }

    /// Create or reconfigure one barrier per factory from `settings`.
    ///
    /// Factories without settings get an empty configuration and their
    /// default scopes. Must be called within a Tokio runtime.
    pub fn apply_settings(&self, settings: &HashMap<String, BarrierSettings>) {
        for id in settings.keys() {
            if !self.factories.iter().any(|factory| factory.id() == id) {
                tracing::warn!(barrier_id = %id, "Settings for unknown barrier ignored");
            }
        }

        let empty = BarrierSettings::default();
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let previous = std::mem::take(&mut registry.configured);

        for factory in &self.factories {
            let settings = settings.get(factory.id()).unwrap_or(&empty);
            let scopes = settings
                .scopes
                .clone()
                .unwrap_or_else(|| factory.default_scopes());

            let existing = previous
                .iter()
                .find(|registration| registration.barrier.id() == factory.id());
            let barrier = match existing {
                Some(registration) => {
                    registration
                        .barrier
                        .update_configuration(&settings.configuration);
                    Arc::clone(&registration.barrier)
                }
                None => {
                    tracing::debug!(barrier_id = factory.id(), "Creating barrier");
                    factory.create(&self.context, &settings.configuration)
                }
            };
            registry.configured.push(ScopedBarrier::new(barrier, scopes));
        }

        self.registrations.publish(registry.all());
    }

    /// Register a barrier outside of settings.
    pub fn register(&self, barrier: Arc<dyn Barrier>, scopes: Vec<BarrierScope>) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(barrier_id = barrier.id(), ?scopes, "Registering barrier");
        registry
            .additional
            .retain(|registration| !registration.is_same_barrier(&barrier));
        registry.additional.push(ScopedBarrier::new(barrier, scopes));
        self.registrations.publish(registry.all());
    }

    /// Remove a barrier registered with [`BarrierManager::register`].
    /// Returns whether it was registered.
    pub fn unregister(&self, barrier: &Arc<dyn Barrier>) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let before = registry.additional.len();
        registry
            .additional
            .retain(|registration| !registration.is_same_barrier(barrier));
        let removed = registry.additional.len() != before;
        if removed {
            tracing::debug!(barrier_id = barrier.id(), "Unregistered barrier");
            self.registrations.publish(registry.all());
        }
        removed
    }

    /// Settings-driven barrier with the given id.
    pub fn barrier(&self, id: &str) -> Result<Arc<dyn Barrier>> {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .configured
            .iter()
            .find(|registration| registration.barrier.id() == id)
            .map(|registration| Arc::clone(&registration.barrier))
            .ok_or_else(|| Error::UnknownBarrier(id.to_string()))
    }
}

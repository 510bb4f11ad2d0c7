//! Batching barrier: holds a dispatcher closed until enough dispatches queue up.
//!
//! The effective batch size is the configured `batch_size` capped at the
//! dispatcher's dispatch limit. Without configuration the dispatch limit
//! itself is used; zero, negative or malformed sizes mean 1.
//!
//! `settle_ms` delays each published state change. Reconfiguring it applies
//! to the next change of every dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::manager::{BarrierContext, BarrierFactory};
use super::{Barrier, BarrierState};
use crate::dispatcher::DispatcherInfo;
use crate::queue::QueueMetrics;
use crate::reactive::{StateStream, StateSubject};
use crate::timing::SettledPublisher;

pub const BATCHING_BARRIER_ID: &str = "batching";

const BATCH_SIZE_KEY: &str = "batch_size";
const SETTLE_KEY: &str = "settle_ms";

/// `batch_size` as configured. `None` when the key is absent.
fn configured_batch_size(configuration: &Map<String, Value>) -> Option<i64> {
    match configuration.get(BATCH_SIZE_KEY) {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_i64().unwrap_or_else(|| {
            tracing::warn!(%value, "Malformed batch_size, using 1");
            1
        })),
    }
}

fn settle_delay(configuration: &Map<String, Value>) -> Duration {
    configuration
        .get(SETTLE_KEY)
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
}

/// Batch size that opens the barrier for a dispatcher with `dispatch_limit`.
pub fn effective_batch_size(configured: Option<i64>, dispatch_limit: Option<usize>) -> usize {
    let limit = dispatch_limit.map(|limit| limit.max(1));
    match configured {
        None => limit.unwrap_or(1),
        Some(size) => {
            let size = usize::try_from(size).unwrap_or(0).max(1);
            limit.map_or(size, |limit| size.min(limit))
        }
    }
}

/// Inputs the per-dispatcher states are computed from.
#[derive(Clone)]
struct Inputs {
    configured: StateStream<Option<i64>>,
    sizes: QueueMetrics,
    dispatchers: StateStream<Vec<DispatcherInfo>>,
}

impl Inputs {
    fn state_for(&self, dispatcher_id: &str) -> BarrierState {
        let limit = self
            .dispatchers
            .current()
            .iter()
            .find(|info| info.id == dispatcher_id)
            .map(|info| info.dispatch_limit);
        let batch_size = effective_batch_size(self.configured.current(), limit);
        BarrierState::from(self.sizes.queue_size(dispatcher_id) >= batch_size)
    }
}

type States = Arc<Mutex<HashMap<String, Arc<SettledPublisher<BarrierState>>>>>;

pub struct BatchingBarrier {
    configured: StateSubject<Option<i64>>,
    inputs: Inputs,
    states: States,
    settle: Mutex<Duration>,
    shutdown: CancellationToken,
}

impl BatchingBarrier {
    /// Must be called within a Tokio runtime.
    pub fn new(
        sizes: QueueMetrics,
        dispatchers: StateStream<Vec<DispatcherInfo>>,
        configuration: &Map<String, Value>,
    ) -> Self {
        let configured = StateSubject::new(configured_batch_size(configuration));
        let inputs = Inputs {
            configured: configured.subscribe(),
            sizes,
            dispatchers,
        };
        let states: States = Arc::default();
        let shutdown = CancellationToken::new();

        tokio::spawn(reevaluate(inputs.clone(), Arc::clone(&states), shutdown.clone()));

        Self {
            configured,
            inputs,
            states,
            settle: Mutex::new(settle_delay(configuration)),
            shutdown,
        }
    }

    pub fn batch_size(&self, dispatcher_id: &str) -> usize {
        let limit = self
            .inputs
            .dispatchers
            .current()
            .iter()
            .find(|info| info.id == dispatcher_id)
            .map(|info| info.dispatch_limit);
        effective_batch_size(self.inputs.configured.current(), limit)
    }
}

impl Drop for BatchingBarrier {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Recompute every known dispatcher whenever any input changes.
async fn reevaluate(mut inputs: Inputs, states: States, shutdown: CancellationToken) {
    let mut sizes = inputs.sizes.sizes();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            true = sizes.changed() => {}
            true = inputs.configured.changed() => {}
            true = inputs.dispatchers.changed() => {}
            else => break,
        }

        let gates = states.lock().unwrap_or_else(|e| e.into_inner());
        for (dispatcher_id, state) in gates.iter() {
            state.submit(inputs.state_for(dispatcher_id));
        }
    }
}

impl Barrier for BatchingBarrier {
    fn id(&self) -> &str {
        BATCHING_BARRIER_ID
    }

    fn state(&self, dispatcher_id: &str) -> StateStream<BarrierState> {
        let settle = *self.settle.lock().unwrap_or_else(|e| e.into_inner());
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .entry(dispatcher_id.to_string())
            .or_insert_with(|| {
                Arc::new(SettledPublisher::new(
                    self.inputs.state_for(dispatcher_id),
                    settle,
                ))
            })
            .subscribe()
    }

    fn current_state(&self, dispatcher_id: &str) -> BarrierState {
        self.inputs.state_for(dispatcher_id)
    }

    fn batch_limit(&self, dispatcher_id: &str) -> Option<usize> {
        Some(self.batch_size(dispatcher_id))
    }

    fn update_configuration(&self, configuration: &Map<String, Value>) {
        let settle = settle_delay(configuration);
        {
            let mut current = self.settle.lock().unwrap_or_else(|e| e.into_inner());
            if *current != settle {
                *current = settle;
                for state in self.states.lock().unwrap_or_else(|e| e.into_inner()).values() {
                    state.set_delay(settle);
                }
                tracing::info!(?settle, "Batching settle delay changed");
            }
        }

        let batch_size = configured_batch_size(configuration);
        if self.configured.publish(batch_size) {
            tracing::info!(?batch_size, "Batching barrier reconfigured");
        }
    }
}

/// Creates the [`BatchingBarrier`]. Applies to every dispatcher by default.
pub struct BatchingBarrierFactory;

impl BarrierFactory for BatchingBarrierFactory {
    fn id(&self) -> &str {
        BATCHING_BARRIER_ID
    }

    fn create(&self, context: &BarrierContext, configuration: &Map<String, Value>) -> Arc<dyn Barrier> {
        Arc::new(BatchingBarrier::new(
            context.queue_metrics.clone(),
            context.dispatchers.clone(),
            configuration,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueSizes;
    use serde_json::json;

    struct Fixture {
        sizes: StateSubject<QueueSizes>,
        dispatchers: StateSubject<Vec<DispatcherInfo>>,
        barrier: BatchingBarrier,
    }

    fn fixture(limits: &[(&str, usize)], configuration: Value) -> Fixture {
        let sizes = StateSubject::new(QueueSizes::new());
        let dispatchers: StateSubject<Vec<DispatcherInfo>> = StateSubject::new(
            limits
                .iter()
                .map(|(id, limit)| DispatcherInfo::new(*id, *limit))
                .collect(),
        );
        let configuration = configuration.as_object().cloned().unwrap_or_default();
        let barrier = BatchingBarrier::new(
            QueueMetrics::from(sizes.subscribe()),
            dispatchers.subscribe(),
            &configuration,
        );
        Fixture {
            sizes,
            dispatchers,
            barrier,
        }
    }

    fn set_size(f: &Fixture, id: &str, size: usize) {
        f.sizes.update(|sizes| {
            sizes.insert(id.to_string(), size);
            true
        });
    }

    async fn settled(stream: &mut StateStream<BarrierState>, expected: BarrierState) {
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            stream.wait_for(|state| *state == expected),
        )
        .await;
        assert_eq!(result.ok().flatten(), Some(expected));
    }

    #[test]
    fn test_effective_batch_size() {
        assert_eq!(effective_batch_size(None, Some(3)), 3);
        assert_eq!(effective_batch_size(Some(5), Some(1)), 1);
        assert_eq!(effective_batch_size(Some(0), Some(10)), 1);
        assert_eq!(effective_batch_size(Some(-10), Some(10)), 1);
        assert_eq!(effective_batch_size(Some(4), Some(10)), 4);
        assert_eq!(effective_batch_size(Some(4), None), 4);
        assert_eq!(effective_batch_size(None, None), 1);
        assert_eq!(effective_batch_size(None, Some(0)), 1);
    }

    #[test]
    fn test_malformed_batch_size_falls_back_to_one() {
        let configuration = json!({ "batch_size": "lots" });
        let size = configured_batch_size(configuration.as_object().unwrap());
        assert_eq!(effective_batch_size(size, Some(10)), 1);
    }

    #[tokio::test]
    async fn test_each_dispatcher_opens_at_its_own_limit() {
        let f = fixture(&[("one", 1), ("three", 3)], json!({}));
        assert_eq!(f.barrier.state("one").current(), BarrierState::Closed);

        set_size(&f, "one", 1);
        set_size(&f, "three", 2);
        assert_eq!(f.barrier.current_state("one"), BarrierState::Open);
        assert_eq!(f.barrier.current_state("three"), BarrierState::Closed);

        set_size(&f, "three", 3);
        assert_eq!(f.barrier.current_state("three"), BarrierState::Open);
    }

    #[tokio::test]
    async fn test_stream_follows_queue_size() {
        let f = fixture(&[("d", 3)], json!({}));
        let mut state = f.barrier.state("d");

        set_size(&f, "d", 3);
        settled(&mut state, BarrierState::Open).await;

        set_size(&f, "d", 2);
        settled(&mut state, BarrierState::Closed).await;
    }

    #[tokio::test]
    async fn test_configured_size_capped_at_limit() {
        let f = fixture(&[("d", 1)], json!({ "batch_size": 5 }));
        assert_eq!(f.barrier.batch_size("d"), 1);
        assert_eq!(f.barrier.batch_limit("d"), Some(1));
        set_size(&f, "d", 1);
        assert_eq!(f.barrier.current_state("d"), BarrierState::Open);
    }

    #[tokio::test]
    async fn test_reconfigured_settle_delays_next_change() {
        let f = fixture(&[("d", 1)], json!({}));
        let mut state = f.barrier.state("d");

        f.barrier.update_configuration(json!({ "settle_ms": 200 }).as_object().unwrap());
        set_size(&f, "d", 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.current(), BarrierState::Closed);
        assert_eq!(f.barrier.current_state("d"), BarrierState::Open);

        settled(&mut state, BarrierState::Open).await;
    }

    #[tokio::test]
    async fn test_removing_configuration_reverts_to_limit() {
        let f = fixture(&[("d", 3)], json!({ "batch_size": 2 }));
        let mut state = f.barrier.state("d");
        set_size(&f, "d", 2);
        settled(&mut state, BarrierState::Open).await;

        f.barrier.update_configuration(&Map::new());
        assert_eq!(f.barrier.batch_size("d"), 3);
        settled(&mut state, BarrierState::Closed).await;
    }

    #[tokio::test]
    async fn test_dispatcher_limit_changes_reevaluate() {
        let f = fixture(&[], json!({}));
        set_size(&f, "d", 2);
        let mut state = f.barrier.state("d");

        f.dispatchers.publish(vec![DispatcherInfo::new("d", 5)]);
        settled(&mut state, BarrierState::Closed).await;

        f.dispatchers.publish(vec![DispatcherInfo::new("d", 2)]);
        settled(&mut state, BarrierState::Open).await;

        f.dispatchers.publish(vec![DispatcherInfo::new("d", 4)]);
        settled(&mut state, BarrierState::Closed).await;
    }
}

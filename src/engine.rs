use std::sync::Arc;

use crate::config::SyncConfig;
use crate::events::EventSink;
use crate::logic::{
    CancellationRegistry, ConnectorRegistry, CorrelationService, InstanceService, PropagationQueue, QueryService,
    SynchronizationCoordinator,
};
use crate::model::TypeRegistry;
use crate::store::traits::Store;

/// Wires the services over one store; the handle transports and the
/// replay binary hold on to
pub struct Engine<S: Store + 'static> {
    pub instances: InstanceService<S>,
    pub correlations: CorrelationService<S>,
    pub queries: QueryService<S>,
    pub coordinator: SynchronizationCoordinator<S>,
}

impl<S: Store + 'static> Engine<S> {
    pub fn new(
        store: Arc<S>,
        registry: TypeRegistry,
        events: Arc<dyn EventSink>,
        connectors: ConnectorRegistry,
        config: &SyncConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let cancellations = CancellationRegistry::new();

        let instances = InstanceService::new(store.clone(), registry.clone(), events.clone(), cancellations.clone());
        let correlations = CorrelationService::new(store.clone(), events, config.recycled_key_policy);
        let queries = QueryService::new(store.clone(), registry);
        let propagation = Arc::new(PropagationQueue::new(
            store,
            correlations.clone(),
            connectors,
            config.retry_policy(),
            cancellations.clone(),
        ));
        let coordinator = SynchronizationCoordinator::new(
            instances.clone(),
            correlations.clone(),
            propagation,
            config.coordinator_settings(),
            cancellations,
        );

        Self {
            instances,
            correlations,
            queries,
            coordinator,
        }
    }

    pub fn propagation(&self) -> &PropagationQueue<S> {
        self.coordinator.propagation()
    }
}

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

pub use engine::Engine;
pub use error::{ErrorKind, Result, SyncError};
pub use events::{EventSink, LogEventSink, RecordingEventSink};

// Export logic types
pub use logic::{
    AssetManagerConnector, ConnectorRegistry, CoordinatorSettings, CorrelationService, FilterExpr, InstanceService,
    JsonPath, LoggingConnector, PropagationReport, PropagationStatus, QueryService, RecycledKeyPolicy, RetryPolicy,
    SynchronizationCoordinator,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{CorrelationStore, InstanceStore, MemoryStore, PostgresStore, Store};

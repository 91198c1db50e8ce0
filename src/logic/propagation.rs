use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::logic::correlation::CorrelationService;
use crate::model::{Id, PropertyBag};
use crate::store::traits::Store;

/// Exponential backoff for outbound deliveries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff,
        }
    }

    /// Whether another attempt follows failed attempt number `attempt` (1-based)
    pub fn should_retry(&self, attempt: u32, error: &SyncError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// `min(base * 2^(attempt-1), max)` before attempt `attempt + 1`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Pushes local changes into an external asset manager
#[async_trait::async_trait]
pub trait AssetManagerConnector: Send + Sync {
    async fn apply_change(&self, external_identifier: &str, properties: &PropertyBag) -> anyhow::Result<()>;
}

/// Acknowledges every change after logging it
#[derive(Debug, Clone)]
pub struct LoggingConnector {
    system: String,
}

impl LoggingConnector {
    pub fn new(system: impl Into<String>) -> Self {
        Self { system: system.into() }
    }
}

#[async_trait::async_trait]
impl AssetManagerConnector for LoggingConnector {
    async fn apply_change(&self, external_identifier: &str, properties: &PropertyBag) -> anyhow::Result<()> {
        log::info!(
            "[{}] apply {} ({} properties)",
            self.system,
            external_identifier,
            properties.len()
        );
        Ok(())
    }
}

/// Connectors keyed by external system id, with an optional fallback
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn AssetManagerConnector>>,
    fallback: Option<Arc<dyn AssetManagerConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, external_system_id: impl Into<String>, connector: Arc<dyn AssetManagerConnector>) {
        self.connectors.insert(external_system_id.into(), connector);
    }

    pub fn with_fallback(mut self, connector: Arc<dyn AssetManagerConnector>) -> Self {
        self.fallback = Some(connector);
        self
    }

    pub fn get(&self, external_system_id: &str) -> Option<Arc<dyn AssetManagerConnector>> {
        self.connectors
            .get(external_system_id)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// Per-guid cancellation signals shared by the lifecycle service and the
/// propagation queue
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    senders: Arc<Mutex<HashMap<Id, watch::Sender<bool>>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, guid: &Id) -> watch::Receiver<bool> {
        self.senders
            .lock()
            .entry(guid.clone())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Signal every pending job for `guid`
    pub fn cancel(&self, guid: &Id) {
        if let Some(sender) = self.senders.lock().remove(guid) {
            if sender.receiver_count() > 0 {
                log::info!("Cancelling {} pending propagation(s) for {}", sender.receiver_count(), guid);
            }
            let _ = sender.send(true);
        }
    }

    /// Drop the channel once no job is listening
    pub(crate) fn release(&self, guid: &Id) {
        let mut senders = self.senders.lock();
        if senders.get(guid).map_or(false, |s| s.receiver_count() == 0) {
            senders.remove(guid);
        }
    }
}

/// One outbound delivery of a committed version to one external system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationJob {
    pub guid: Id,
    pub version: u64,
    pub external_system_id: String,
    pub external_identifier: String,
    pub properties: PropertyBag,
    pub fingerprint: String,
    #[serde(skip)]
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PropagationStatus {
    Delivered { attempts: u32 },
    /// Gave up; the local commit stands and the correlation stays stale
    Failed { attempts: u32, error: String },
    /// The external system already holds this version or a later one
    Outdated { synchronized_version: u64 },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationReport {
    pub guid: Id,
    pub version: u64,
    pub external_system_id: String,
    pub external_identifier: String,
    #[serde(flatten)]
    pub status: PropagationStatus,
}

/// Finished reports kept for inspection; the oldest are dropped first
const MAX_REPORTS: usize = 1024;

/// Deliveries to one external element run one at a time
type Lane = Arc<tokio::sync::Mutex<()>>;

/// Runs deliveries as background tokio tasks with retry, timeout and
/// cancel-on-purge. Jobs for the same (guid, external system) are delivered
/// in turn, and a job whose version the system already holds is dropped.
pub struct PropagationQueue<S: Store + 'static> {
    store: Arc<S>,
    correlations: CorrelationService<S>,
    connectors: ConnectorRegistry,
    retry: RetryPolicy,
    cancellations: CancellationRegistry,
    lanes: Arc<Mutex<HashMap<(Id, String), Lane>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    reports: Arc<Mutex<VecDeque<PropagationReport>>>,
}

impl<S: Store + 'static> PropagationQueue<S> {
    pub fn new(
        store: Arc<S>,
        correlations: CorrelationService<S>,
        connectors: ConnectorRegistry,
        retry: RetryPolicy,
        cancellations: CancellationRegistry,
    ) -> Self {
        Self {
            store,
            correlations,
            connectors,
            retry,
            cancellations,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            handles: Mutex::new(Vec::new()),
            reports: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Schedule a delivery; returns false when no connector serves the system
    pub fn enqueue(&self, job: PropagationJob) -> bool {
        let Some(connector) = self.connectors.get(&job.external_system_id) else {
            log::warn!(
                "No connector for '{}', {} v{} not propagated",
                job.external_system_id,
                job.guid,
                job.version
            );
            return false;
        };

        let lane_key = (job.guid.clone(), job.external_system_id.clone());
        let lane = self.lanes.lock().entry(lane_key.clone()).or_default().clone();
        let delivery = Delivery {
            store: self.store.clone(),
            correlations: self.correlations.clone(),
            connector,
            retry: self.retry.clone(),
            cancel: self.cancellations.subscribe(&job.guid),
            lane,
        };
        let cancellations = self.cancellations.clone();
        let lanes = self.lanes.clone();
        let reports = self.reports.clone();

        let handle = tokio::spawn(async move {
            let report = delivery.run(job).await;
            cancellations.release(&lane_key.0);
            {
                let mut lanes = lanes.lock();
                if lanes.get(&lane_key).map_or(false, |l| Arc::strong_count(l) == 1) {
                    lanes.remove(&lane_key);
                }
            }
            let mut reports = reports.lock();
            reports.push_back(report);
            while reports.len() > MAX_REPORTS {
                reports.pop_front();
            }
        });

        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        true
    }

    /// Deliveries scheduled but not yet finished
    pub fn pending(&self) -> usize {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    /// Wait for every scheduled delivery to finish
    pub async fn wait_idle(&self) {
        loop {
            let handles = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    log::warn!("Propagation task aborted: {}", e);
                }
            }
        }
    }

    /// Most recent reports, oldest first
    pub fn reports(&self) -> Vec<PropagationReport> {
        self.reports.lock().iter().cloned().collect()
    }

    /// Take every report collected so far
    pub fn drain_reports(&self) -> Vec<PropagationReport> {
        self.reports.lock().drain(..).collect()
    }

    /// (guid, external system) pairs with deliveries in flight
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().len()
    }
}

struct Delivery<S: Store + 'static> {
    store: Arc<S>,
    correlations: CorrelationService<S>,
    connector: Arc<dyn AssetManagerConnector>,
    retry: RetryPolicy,
    cancel: watch::Receiver<bool>,
    lane: Lane,
}

impl<S: Store + 'static> Delivery<S> {
    async fn run(mut self, job: PropagationJob) -> PropagationReport {
        let lane = self.lane.clone();
        let turn = tokio::select! {
            _ = wait_cancelled(&mut self.cancel) => None,
            turn = lane.lock_owned() => Some(turn),
        };
        let status = match turn {
            Some(_turn) => self.attempt_all(&job).await,
            None => PropagationStatus::Cancelled,
        };
        match &status {
            PropagationStatus::Delivered { attempts } => log::info!(
                "Propagated {} v{} to {}/{} after {} attempt(s)",
                job.guid,
                job.version,
                job.external_system_id,
                job.external_identifier,
                attempts
            ),
            PropagationStatus::Failed { attempts, error } => log::warn!(
                "Giving up on {} v{} to {} after {} attempt(s): {}",
                job.guid,
                job.version,
                job.external_system_id,
                attempts,
                error
            ),
            PropagationStatus::Outdated { synchronized_version } => log::info!(
                "Skipping {} v{} to {}: it already holds v{}",
                job.guid,
                job.version,
                job.external_system_id,
                synchronized_version
            ),
            PropagationStatus::Cancelled => {
                log::info!("Propagation of {} to {} cancelled", job.guid, job.external_system_id)
            }
        }
        PropagationReport {
            guid: job.guid,
            version: job.version,
            external_system_id: job.external_system_id,
            external_identifier: job.external_identifier,
            status,
        }
    }

    async fn attempt_all(&mut self, job: &PropagationJob) -> PropagationStatus {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let cancelled = *self.cancel.borrow();
            if cancelled || !self.still_exists(&job.guid).await {
                return PropagationStatus::Cancelled;
            }
            if let Some(status) = self.preempted(job).await {
                return status;
            }

            let outcome = tokio::select! {
                _ = wait_cancelled(&mut self.cancel) => return PropagationStatus::Cancelled,
                outcome = tokio::time::timeout(
                    job.timeout,
                    self.connector.apply_change(&job.external_identifier, &job.properties),
                ) => outcome,
            };

            let error = match outcome {
                Ok(Ok(())) => {
                    if let Err(e) = self
                        .correlations
                        .mark_synchronized(
                            &job.guid,
                            &job.external_system_id,
                            &job.external_identifier,
                            job.version,
                            job.fingerprint.clone(),
                        )
                        .await
                    {
                        log::warn!("Delivered {} but could not record it: {}", job.guid, e);
                    }
                    return PropagationStatus::Delivered { attempts: attempt };
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => format!("timed out after {:?}", job.timeout),
            };
            let error = SyncError::Propagation {
                external_system_id: job.external_system_id.clone(),
                external_identifier: job.external_identifier.clone(),
                message: error,
            };

            if !self.retry.should_retry(attempt, &error) {
                return PropagationStatus::Failed {
                    attempts: attempt,
                    error: error.to_string(),
                };
            }

            let delay = self.retry.delay_for(attempt);
            log::debug!("Retrying {} in {:?}: {}", job.guid, delay, error);
            tokio::select! {
                _ = wait_cancelled(&mut self.cancel) => return PropagationStatus::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn still_exists(&self, guid: &Id) -> bool {
        matches!(self.store.get_instance(guid).await, Ok(Some(_)))
    }

    /// A job is moot once its correlation is gone or has seen this version
    async fn preempted(&self, job: &PropagationJob) -> Option<PropagationStatus> {
        match self
            .correlations
            .find(&job.external_system_id, &job.external_identifier)
            .await
        {
            Ok(Some(correlation)) if correlation.guid == job.guid => match correlation.last_synchronized_version {
                Some(synchronized_version) if synchronized_version >= job.version => {
                    Some(PropagationStatus::Outdated { synchronized_version })
                }
                _ => None,
            },
            Ok(_) => Some(PropagationStatus::Cancelled),
            Err(e) => {
                log::warn!("Could not read correlation for {}: {}", job.guid, e);
                None
            }
        }
    }
}

/// Resolves once the flag is raised; never resolves otherwise
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        let raised = *cancel.borrow();
        if raised {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

use parking_lot::Mutex;

use crate::model::{ChangeKind, ChangeNotification};

/// Receives a notification after every committed instance or correlation
/// mutation. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn notify(&self, notification: ChangeNotification);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn notify(&self, notification: ChangeNotification) {
        match &notification.external_system_id {
            Some(system) => log::info!(
                "{:?} {} v{} ({})",
                notification.change_kind,
                notification.guid,
                notification.version,
                system
            ),
            None => log::info!(
                "{:?} {} v{}",
                notification.change_kind,
                notification.guid,
                notification.version
            ),
        }
    }
}

/// Keeps every notification in memory, for tests and replay summaries
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<ChangeNotification>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChangeNotification> {
        self.events.lock().clone()
    }

    pub fn kinds_for(&self, guid: &str) -> Vec<ChangeKind> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.guid == guid)
            .map(|e| e.change_kind)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingEventSink {
    fn notify(&self, notification: ChangeNotification) {
        self.events.lock().push(notification);
    }
}

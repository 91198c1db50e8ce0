use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-call context handed to every core operation: the already
/// authenticated actor plus the time budget for any external call made
/// on the caller's behalf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallContext {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl CallContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Context for work the coordinator performs on behalf of an external system
    pub fn synchronizer(external_system_id: &str) -> Self {
        Self {
            user_id: format!("sync:{}", external_system_id),
            user_name: Some("Synchronization Coordinator".to_string()),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            user_name: Some("System".to_string()),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::system()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

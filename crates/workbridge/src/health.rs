//! Worker health as seen by the supervisor.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerHealth {
    /// Nothing launched yet
    #[default]
    Unknown,
    /// Pinging an existing worker
    Probing,
    /// Spawned, polling until it answers
    Starting,
    /// Answering pings, onload and config delivered
    Ready,
    /// Never became ready, or spawning failed
    Defunct,
    /// Shut down by the supervisor
    Terminated,
}

impl WorkerHealth {
    /// Whether calls to the worker can be expected to succeed.
    pub fn is_ready(self) -> bool {
        self == WorkerHealth::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&WorkerHealth::Ready).unwrap(),
            "\"READY\""
        );
        assert_eq!(
            serde_json::from_str::<WorkerHealth>("\"DEFUNCT\"").unwrap(),
            WorkerHealth::Defunct
        );
    }

    #[test]
    fn default_is_unknown() {
        assert_eq!(WorkerHealth::default(), WorkerHealth::Unknown);
        assert!(!WorkerHealth::Starting.is_ready());
        assert!(WorkerHealth::Ready.is_ready());
    }
}

//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Dispatcher queue sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Max events queued between capture and batching before enqueue blocks.
    pub capture_queue_capacity: usize,
    /// Max batches queued for delivery to subscribers.
    pub delivery_queue_capacity: usize,
    /// Upper bound on events per delivered batch.
    pub max_batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capture_queue_capacity: 256,
            delivery_queue_capacity: 64,
            max_batch_size: 128,
        }
    }
}

/// Configuration for one [`ExecutionState`](crate::engine::ExecutionState).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How far down the real stack an entry notification may search for its
    /// own frame. Exceeding it degrades to treating frame 0 as the entry.
    pub max_entry_search_depth: usize,
    /// Arrays longer than this are not tracked per cell.
    pub array_cell_ceiling: usize,
    /// Emit variable-assign/variable-delete for locals on step notifications.
    pub track_local_variables: bool,
    /// Summaries of ended threads kept for inspection; older ones are
    /// dropped first.
    pub ended_thread_history: usize,
    /// Queue sizing for the dispatcher.
    pub dispatcher: DispatcherConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_entry_search_depth: 64,
            array_cell_ceiling: 256,
            track_local_variables: true,
            ended_thread_history: 256,
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ConfigError::Malformed {
            reason: e.to_string(),
        })?;
        cfg.validate()
    }

    /// Checks every field against its lower bound.
    pub fn validate(self) -> Result<Self, ConfigError> {
        check_min("max_entry_search_depth", self.max_entry_search_depth, 1)?;
        check_min(
            "dispatcher.capture_queue_capacity",
            self.dispatcher.capture_queue_capacity,
            1,
        )?;
        check_min(
            "dispatcher.delivery_queue_capacity",
            self.dispatcher.delivery_queue_capacity,
            1,
        )?;
        check_min("dispatcher.max_batch_size", self.dispatcher.max_batch_size, 1)?;
        Ok(self)
    }
}

fn check_min(field: &'static str, actual: usize, min: usize) -> Result<(), ConfigError> {
    if actual < min {
        return Err(ConfigError::TooSmall { field, min, actual });
    }
    Ok(())
}

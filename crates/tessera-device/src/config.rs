//! Device configuration.

use serde::{Deserialize, Serialize};

/// Environment variable overriding the validation default (`0` or `1`).
pub const VALIDATION_ENV: &str = "TESSERA_VALIDATION";

const MIB: u64 = 1024 * 1024;

/// Whether a heap is reachable from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeapKind {
    DeviceLocal,
    HostVisible,
}

/// One emulated memory heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapConfig {
    /// Budget in bytes
    pub size: u64,
    pub kind: HeapKind,
}

/// Configuration of a device instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub app_name: String,
    /// Run validation during recording and replay
    pub validation: bool,
    /// Heaps in index order; each heap exposes one memory type
    pub heaps: Vec<HeapConfig>,
    /// Queues in the single graphics/transfer family
    pub queue_count: u32,
    /// Batches a queue buffers before `queue_submit` blocks
    pub submission_queue_depth: usize,
    pub max_image_dimension: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "Tessera".to_string(),
            validation: cfg!(debug_assertions),
            heaps: vec![
                HeapConfig {
                    size: 256 * MIB,
                    kind: HeapKind::DeviceLocal,
                },
                HeapConfig {
                    size: 256 * MIB,
                    kind: HeapKind::HostVisible,
                },
            ],
            queue_count: 2,
            submission_queue_depth: 16,
            max_image_dimension: 8192,
        }
    }
}

impl DeviceConfig {
    /// Apply [`VALIDATION_ENV`] if it is set to a recognized value.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(enabled) = std::env::var(VALIDATION_ENV)
            .ok()
            .as_deref()
            .and_then(parse_flag)
        {
            self.validation = enabled;
        }
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "1" => Some(true),
        "0" => Some(false),
        other => {
            tracing::warn!("Ignoring {VALIDATION_ENV}={other:?}, expected 0 or 1");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_heaps() {
        let config = DeviceConfig::default();
        assert_eq!(config.heaps.len(), 2);
        assert_eq!(config.heaps[0].kind, HeapKind::DeviceLocal);
        assert_eq!(config.heaps[1].kind, HeapKind::HostVisible);
        assert_eq!(config.heaps[0].size, 256 * MIB);
    }

    #[test]
    fn flag_parsing() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag(" 0 "), Some(false));
        assert_eq!(parse_flag("yes"), None);
    }
}

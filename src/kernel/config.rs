//! Kernel configuration
//!
//! Sizing knobs for the task table, stacks, queues, and socket buffers.
//! Serializable so an embedder can keep its tuning in a JSON file.

use serde::{Deserialize, Serialize};

/// Default maximum number of concurrently live tasks (including idle)
pub const DEFAULT_MAX_TASKS: usize = 16;

/// Default user-mode stack size in bytes
pub const DEFAULT_USER_STACK_SIZE: usize = 16 * 1024;

/// Default kernel-mode stack size in bytes
pub const DEFAULT_KERNEL_STACK_SIZE: usize = 4 * 1024;

/// Sizing configuration for a kernel instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Maximum number of concurrently live tasks (including the idle task)
    pub max_tasks: usize,
    /// User-mode stack size per task, in bytes (word-aligned)
    pub user_stack_size: usize,
    /// Kernel-mode stack size per task, in bytes (word-aligned)
    pub kernel_stack_size: usize,
    /// Capacity of the zombie-exit notification queue
    pub zombie_queue_capacity: usize,
    /// Capacity of the pending-reclaim queue
    pub reclaim_queue_capacity: usize,
    /// Ring buffer capacity per socket, in bytes
    pub socket_buffer_size: usize,
    /// Maximum task display-name length; longer names are truncated
    pub task_name_max: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_tasks: DEFAULT_MAX_TASKS,
            user_stack_size: DEFAULT_USER_STACK_SIZE,
            kernel_stack_size: DEFAULT_KERNEL_STACK_SIZE,
            zombie_queue_capacity: 16,
            reclaim_queue_capacity: 8,
            socket_buffer_size: 4096,
            task_name_max: 32,
        }
    }
}

impl KernelConfig {
    /// Parse a configuration from its JSON representation.
    ///
    /// Missing fields fall back to defaults, so a partial override like
    /// `{"max_tasks": 4}` is valid.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Render the configuration as pretty-printed JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("config serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.max_tasks, DEFAULT_MAX_TASKS);
        assert_eq!(cfg.user_stack_size, DEFAULT_USER_STACK_SIZE);
    }

    #[test]
    fn test_partial_json_override() {
        let cfg = KernelConfig::from_json(r#"{"max_tasks": 4}"#).unwrap();
        assert_eq!(cfg.max_tasks, 4);
        assert_eq!(cfg.kernel_stack_size, DEFAULT_KERNEL_STACK_SIZE);
    }

    #[test]
    fn test_json_round_trip() {
        let mut cfg = KernelConfig::default();
        cfg.socket_buffer_size = 512;
        let parsed = KernelConfig::from_json(&cfg.to_json()).unwrap();
        assert_eq!(parsed.socket_buffer_size, 512);
    }
}

//! Per-evaluator sandbox configuration.

use serde::Deserialize;

/// Export name of the entrypoint in the PAC interpreter build.
pub const DEFAULT_ENTRYPOINT: &str = "eval_pac";

/// Import module the sandbox expects the capability functions under.
pub const DEFAULT_CAPABILITY_MODULE: &str = "env";

/// Configuration for the PAC sandbox
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum time for a single evaluation in milliseconds (default: 5000ms, None = unlimited).
    /// Only enforced by the async [`Evaluator::evaluate`](crate::Evaluator::evaluate).
    pub timeout_ms: Option<u64>,
    /// Maximum linear memory in bytes (default: 64MB, None = unlimited)
    pub max_memory_bytes: Option<usize>,
    /// Instruction fuel for one evaluation (None = unmetered)
    pub max_fuel: Option<u64>,
    /// Name of the exported entrypoint
    pub entrypoint: String,
    /// Import module name for `dns_resolve` and `my_ip_addr`
    pub capability_module: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Some(5_000),
            max_memory_bytes: Some(64 * 1024 * 1024), // 64MB default
            max_fuel: None,
            entrypoint: String::from(DEFAULT_ENTRYPOINT),
            capability_module: String::from(DEFAULT_CAPABILITY_MODULE),
        }
    }
}

//! Error taxonomy for a single evaluation.

use std::time::Duration;

/// Everything that can go wrong while evaluating a script.
///
/// Callers always get either a result string or exactly one of these.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// The target URL could not be parsed. No sandbox was created.
    #[error("cannot parse url '{url}': {source}")]
    UrlParse {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The capability functions could not be bound into the linker.
    #[error("cannot instantiate the host module: {0:#}")]
    HostBinding(anyhow::Error),

    /// The WASI shim could not be bound into the linker.
    #[error("cannot instantiate the WASI module: {0:#}")]
    SystemShim(anyhow::Error),

    /// The sandbox module failed to compile, link or instantiate, or lacks
    /// one of its required exports.
    #[error("cannot instantiate the PAC module: {0:#}")]
    SandboxInit(anyhow::Error),

    /// The entrypoint call itself failed (trap, fuel or memory exhaustion).
    #[error("cannot evaluate the PAC script: {0:#}")]
    Call(anyhow::Error),

    /// The evaluation was interrupted after running past its deadline.
    #[error("cannot evaluate the PAC script: timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The entrypoint returned no value, or a value of the wrong type.
    #[error("cannot evaluate the PAC script: no result returned")]
    MissingResult,

    /// The result bytes could not be read from sandbox memory.
    #[error("cannot read sandbox memory at offset {offset} (length {length})")]
    MemoryRead { offset: u32, length: u32 },

    /// The script itself reported an error.
    #[error("{0}")]
    Script(String),

    /// A panic was caught at the evaluation boundary.
    #[error("panic recovered: {0}")]
    PanicRecovered(String),
}

impl EvalError {
    /// Build a `PanicRecovered` from a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("unknown panic payload")
        };
        EvalError::PanicRecovered(message)
    }
}

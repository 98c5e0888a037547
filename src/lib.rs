//! # PAC Sandbox
//!
//! Evaluates untrusted proxy auto-config scripts inside a WebAssembly
//! sandbox using wasmtime.
//!
//! ## Isolation Guarantees
//!
//! - **Fresh context per call**: every evaluation gets its own engine, store
//!   and linear memory, dropped when the call returns
//! - **No ambient authority**: no files, environment, arguments or stdio;
//!   the only way out is the explicit [`CapabilitySet`]
//! - **Bounded**: optional memory limit, fuel budget and wall-clock timeout
//! - **Contained faults**: traps, bad results and panics all come back as a
//!   single [`EvalError`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pac_sandbox::{Evaluator, SandboxConfig, SandboxModule};
//!
//! #[tokio::main]
//! async fn main() {
//!     let module = SandboxModule::from_file("./pac_interpreter.wasm").unwrap();
//!     let evaluator = Evaluator::new(module).with_config(SandboxConfig {
//!         timeout_ms: Some(1_000),
//!         ..Default::default()
//!     });
//!
//!     let script = r#"function FindProxyForURL(url, host) { return "DIRECT"; }"#;
//!     let proxy = evaluator
//!         .evaluate(script, "https://example.org/")
//!         .await
//!         .unwrap();
//!
//!     println!("{}", proxy);
//! }
//! ```

mod bridge;
mod capability;
mod codec;
mod config;
mod diagnostics;
mod error;
mod module;
mod runtime;
mod session;
mod shim;

#[cfg(test)]
mod testing;

pub use bridge::AllocationRecord;
pub use capability::{
    local_address, resolve_host, CapabilitySet, Clock, LocalAddressFn, RandomSourceFn,
    ResolveHostFn, SystemClock,
};
pub use codec::{PackedWord, ERROR_MARKER, OK_MARKER};
pub use config::{SandboxConfig, DEFAULT_CAPABILITY_MODULE, DEFAULT_ENTRYPOINT};
pub use diagnostics::{Diagnostic, DiagnosticSink, TracingSink};
pub use error::EvalError;
pub use module::SandboxModule;
pub use runtime::{evaluate_pac, Evaluator};

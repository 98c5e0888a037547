//! PAC evaluator - runs one script per call in a fresh wasm sandbox.
//!
//! Every call gets its own engine, store, linear memory and allocation
//! records. The evaluator itself only holds immutable, shared data, so a
//! single instance can serve concurrent calls without locking.

use crate::capability::CapabilitySet;
use crate::config::SandboxConfig;
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::error::EvalError;
use crate::module::SandboxModule;
use crate::session::{Request, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use wasmtime::Engine;

/// Interval between epoch ticks once the deadline has passed.
const WATCHDOG_TICK: Duration = Duration::from_millis(10);

/// How long past the deadline the caller waits for the sandbox to unwind
/// before giving up on it.
const TIMEOUT_GRACE: Duration = Duration::from_millis(100);

/// Evaluates PAC scripts against a compiled-in interpreter module.
#[derive(Clone)]
pub struct Evaluator {
    module: SandboxModule,
    capabilities: Arc<CapabilitySet>,
    config: Arc<SandboxConfig>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl Evaluator {
    /// Evaluator with default capabilities, config and the tracing sink.
    pub fn new(module: SandboxModule) -> Self {
        Self {
            module,
            capabilities: Arc::new(CapabilitySet::default()),
            config: Arc::new(SandboxConfig::default()),
            diagnostics: Arc::new(TracingSink),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = Arc::new(capabilities);
        self
    }

    pub fn with_config(mut self, config: SandboxConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn module(&self) -> &SandboxModule {
        &self.module
    }

    /// Evaluate `script` for `url` on the current thread.
    ///
    /// No watchdog runs here: `timeout_ms` is only enforced by
    /// [`Evaluator::evaluate`]. Fuel and memory limits still apply. Must not
    /// be called from inside an async task; use `evaluate` there.
    pub fn evaluate_blocking(&self, script: &str, url: &str) -> Result<String, EvalError> {
        let request = Request::parse(script, url)?;
        let engine = Session::engine(&self.config)?;
        self.session(engine).run(&request).result
    }

    /// Evaluate `script` for `url`, bounded by `timeout_ms`.
    ///
    /// The sandbox runs on a blocking thread. When the deadline passes, the
    /// engine epoch is bumped and the running call traps with
    /// [`EvalError::Timeout`]. If the thread is stuck on the host side (a
    /// slow resolver, a long sleep) the caller gets `Timeout` anyway and the
    /// thread is left to finish on its own; its store is dropped unread.
    /// Dropping the returned future before it is first polled means no
    /// sandbox is ever created.
    pub async fn evaluate(&self, script: &str, url: &str) -> Result<String, EvalError> {
        let request = Request::parse(script, url)?;
        let engine = Session::engine(&self.config)?;
        let session = self.session(engine.clone());

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let task = tokio::task::spawn_blocking(move || {
            let _done = done_tx;
            session.run(&request)
        });

        let joined = match self.config.timeout_ms.map(Duration::from_millis) {
            Some(limit) => {
                // Spawn a task that interrupts the sandbox after the timeout
                let watchdog = tokio::spawn(watchdog(engine, limit, done_rx));

                match tokio::time::timeout(limit + TIMEOUT_GRACE, task).await {
                    Ok(joined) => {
                        // Cancel the watchdog if we finished in time
                        watchdog.abort();
                        joined
                    }
                    Err(_) => {
                        // The watchdog keeps ticking until the thread lets go
                        tracing::warn!(
                            timeout_ms = limit.as_millis() as u64,
                            "sandbox blocked in host code past its deadline, detaching"
                        );
                        return Err(EvalError::Timeout(limit));
                    }
                }
            }
            None => task.await,
        };

        match joined {
            Ok(outcome) => outcome.result,
            Err(e) if e.is_panic() => Err(EvalError::from_panic(e.into_panic())),
            Err(e) => Err(EvalError::PanicRecovered(format!(
                "evaluation task did not complete: {}",
                e
            ))),
        }
    }

    fn session(&self, engine: Engine) -> Session {
        Session::new(
            engine,
            self.module.clone(),
            self.capabilities.clone(),
            self.diagnostics.clone(),
            self.config.clone(),
        )
    }
}

/// Bump the epoch once `limit` has passed, then keep bumping until the
/// session finishes. A store created after the first bump still gets
/// interrupted by the next one.
async fn watchdog(engine: Engine, limit: Duration, mut done: oneshot::Receiver<()>) {
    tokio::select! {
        _ = &mut done => return,
        _ = tokio::time::sleep(limit) => {}
    }
    loop {
        engine.increment_epoch();
        tokio::select! {
            _ = &mut done => return,
            _ = tokio::time::sleep(WATCHDOG_TICK) => {}
        }
    }
}

/// Evaluate one script with default capabilities and config.
pub async fn evaluate_pac(
    module: SandboxModule,
    script: &str,
    url: &str,
) -> Result<String, EvalError> {
    Evaluator::new(module).evaluate(script, url).await
}

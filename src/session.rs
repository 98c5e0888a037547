//! One evaluation, start to finish.
//!
//! A session owns a fresh store, linker and instance, wires the capability
//! set and the memory bridge into them, runs the entrypoint and releases
//! everything it allocated. Nothing outlives the call: the store (and with
//! it the whole linear memory) is dropped when the session ends.

use crate::bridge::{self, MemoryBridge, SandboxExports, SweepReport};
use crate::capability::{self, CapabilitySet};
use crate::codec;
use crate::config::SandboxConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::EvalError;
use crate::module::SandboxModule;
use crate::shim;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use url::{Host, Url};
use wasmtime::{
    Config, Engine, Instance, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap,
};
use wasmtime_wasi::preview1::WasiP1Ctx;

#[cfg(target_pointer_width = "64")]
const PULLEY_TARGET: &str = "pulley64";
#[cfg(not(target_pointer_width = "64"))]
const PULLEY_TARGET: &str = "pulley32";

/// Store data for one execution context.
pub(crate) struct SessionState {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
    pub(crate) bridge: MemoryBridge,
    pub(crate) capabilities: Arc<CapabilitySet>,
    pub(crate) diagnostics: Arc<dyn DiagnosticSink>,
    pub(crate) capability_calls: usize,
}

/// The three strings handed to the entrypoint.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub(crate) script: String,
    pub(crate) url: String,
    pub(crate) host: String,
}

impl Request {
    /// Validate `url` and derive the host argument from it.
    pub(crate) fn parse(script: &str, url: &str) -> Result<Self, EvalError> {
        let parsed = Url::parse(url).map_err(|source| EvalError::UrlParse {
            url: url.to_string(),
            source,
        })?;
        let host = match parsed.host() {
            Some(Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => String::new(),
        };
        Ok(Self {
            script: script.to_string(),
            url: url.to_string(),
            host,
        })
    }
}

pub(crate) struct SessionOutcome {
    pub(crate) result: Result<String, EvalError>,
    pub(crate) sweep: SweepReport,
}

impl SessionOutcome {
    fn failed(error: EvalError) -> Self {
        Self {
            result: Err(error),
            sweep: SweepReport::default(),
        }
    }
}

pub(crate) struct Session {
    engine: Engine,
    module: SandboxModule,
    capabilities: Arc<CapabilitySet>,
    diagnostics: Arc<dyn DiagnosticSink>,
    config: Arc<SandboxConfig>,
}

impl Session {
    /// A single-threaded, interpreter-mode engine with no code cache,
    /// private to one call. The module is lowered to Pulley bytecode and
    /// interpreted; no native code is generated.
    pub(crate) fn engine(config: &SandboxConfig) -> Result<Engine, EvalError> {
        let mut engine_config = Config::new();
        engine_config
            .target(PULLEY_TARGET)
            .map_err(EvalError::SandboxInit)?
            .parallel_compilation(false)
            .epoch_interruption(config.timeout_ms.is_some())
            .consume_fuel(config.max_fuel.is_some());
        Engine::new(&engine_config).map_err(EvalError::SandboxInit)
    }

    pub(crate) fn new(
        engine: Engine,
        module: SandboxModule,
        capabilities: Arc<CapabilitySet>,
        diagnostics: Arc<dyn DiagnosticSink>,
        config: Arc<SandboxConfig>,
    ) -> Self {
        Self {
            engine,
            module,
            capabilities,
            diagnostics,
            config,
        }
    }

    /// Run the evaluation inside the fault boundary.
    pub(crate) fn run(self, request: &Request) -> SessionOutcome {
        let span = tracing::debug_span!(
            "evaluation",
            id = %uuid::Uuid::new_v4(),
            module = %self.module.digest(),
        );
        let _enter = span.enter();

        match panic::catch_unwind(AssertUnwindSafe(|| self.execute(request))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let error = EvalError::from_panic(payload);
                tracing::warn!(error = %error, "evaluation panicked, context discarded");
                SessionOutcome::failed(error)
            }
        }
    }

    fn execute(&self, request: &Request) -> SessionOutcome {
        let (mut store, instance) = match self.instantiate() {
            Ok(sandbox) => sandbox,
            Err(e) => return SessionOutcome::failed(e),
        };
        tracing::debug!("sandbox instantiated");

        let result = codec::resolve_entrypoint(&mut store, &instance, &self.config.entrypoint)
            .map_err(EvalError::SandboxInit)
            .and_then(|entrypoint| codec::call_entrypoint(&mut store, entrypoint, request));

        let result = match result {
            Err(EvalError::Call(e)) if is_interrupt(&e) => Err(EvalError::Timeout(self.timeout())),
            other => other,
        };

        let sweep = if let Err(EvalError::Timeout(limit)) = &result {
            let abandoned = store.data_mut().bridge.abandon();
            tracing::warn!(
                timeout_ms = limit.as_millis() as u64,
                abandoned,
                "evaluation interrupted, skipping release sweep"
            );
            SweepReport::default()
        } else {
            if let Some(fuel) = self.config.max_fuel {
                // cleanup gets its own budget when the script burnt it all
                if let Err(e) = store.set_fuel(fuel) {
                    tracing::debug!(error = %e, "cannot refuel for cleanup");
                }
            }
            bridge::release_all(&mut store)
        };

        tracing::debug!(
            released = sweep.released.len(),
            failed = sweep.failed.len(),
            capability_calls = store.data().capability_calls,
            ok = result.is_ok(),
            "evaluation finished"
        );
        SessionOutcome { result, sweep }
    }

    /// Build the store, bind capabilities and the shim, instantiate the
    /// module and attach the bridge to its exports.
    pub(crate) fn instantiate(&self) -> Result<(Store<SessionState>, Instance), EvalError> {
        let state = SessionState {
            wasi: shim::build_context(&self.capabilities),
            limits: self.limits(),
            bridge: MemoryBridge::default(),
            capabilities: self.capabilities.clone(),
            diagnostics: self.diagnostics.clone(),
            capability_calls: 0,
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = self.config.max_fuel {
            store.set_fuel(fuel).map_err(EvalError::SandboxInit)?;
        }
        if self.config.timeout_ms.is_some() {
            store.set_epoch_deadline(1);
        }

        let mut linker = Linker::new(&self.engine);
        capability::bind(&mut linker, &self.config.capability_module)
            .map_err(EvalError::HostBinding)?;
        shim::bind(&mut linker).map_err(EvalError::SystemShim)?;

        let module =
            Module::new(&self.engine, self.module.bytes()).map_err(EvalError::SandboxInit)?;
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(EvalError::SandboxInit)?;
        // a start function can run into the deadline too
        let instance = linker.instantiate(&mut store, &module).map_err(|e| {
            if is_interrupt(&e) {
                EvalError::Timeout(self.timeout())
            } else {
                EvalError::SandboxInit(e)
            }
        })?;

        let exports = SandboxExports::resolve(&mut store, &instance).map_err(EvalError::SandboxInit)?;
        store.data_mut().bridge.attach(exports);
        Ok((store, instance))
    }

    fn limits(&self) -> StoreLimits {
        let mut builder = StoreLimitsBuilder::new();
        if let Some(max) = self.config.max_memory_bytes {
            builder = builder.memory_size(max);
        }
        builder.build()
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms.unwrap_or_default())
    }
}

fn is_interrupt(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<Trap>(), Some(Trap::Interrupt))
}

//! Call protocol for the sandbox entrypoint.
//!
//! Every string crosses the boundary as an `(offset, length)` pair. A single
//! returned string is packed into one `i64`: offset in the high half, length
//! in the low half. Errors travel in-band as a `!!` prefix on the output;
//! this module is the only place that knows about the markers.

use crate::bridge;
use crate::diagnostics::Diagnostic;
use crate::error::EvalError;
use crate::session::{Request, SessionState};
use anyhow::{ensure, Context, Error};
use wasmtime::{Func, Instance, Store, Val};

/// Output prefix marking an error message.
pub const ERROR_MARKER: &str = "!!";

/// Optional output prefix marking a plain value.
pub const OK_MARKER: &str = "..";

/// Three `(offset, length)` pairs: script, url, host.
const ENTRYPOINT_ARITY: usize = 6;

/// A string reference packed into 64 bits.
///
/// `offset == 0 || length == 0` is the sentinel for "no value". A capability
/// that fails and one that returns an empty string look the same here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackedWord(u64);

impl PackedWord {
    pub const SENTINEL: PackedWord = PackedWord(0);

    pub const fn new(offset: u32, length: u32) -> Self {
        Self(((offset as u64) << 32) | length as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn into_raw(self) -> u64 {
        self.0
    }

    pub const fn offset(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn length(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_sentinel(self) -> bool {
        self.offset() == 0 || self.length() == 0
    }
}

/// Look up the entrypoint and check it takes six integers.
///
/// The result type is checked at call time so that a missing result maps to
/// [`EvalError::MissingResult`] rather than an init failure.
pub(crate) fn resolve_entrypoint(
    store: &mut Store<SessionState>,
    instance: &Instance,
    name: &str,
) -> Result<Func, Error> {
    let func = instance
        .get_func(&mut *store, name)
        .with_context(|| format!("missing {:?} function in the module", name))?;
    let arity = func.ty(&*store).params().len();
    ensure!(
        arity == ENTRYPOINT_ARITY,
        "{:?} takes {} parameters, expected {}",
        name,
        arity,
        ENTRYPOINT_ARITY
    );
    Ok(func)
}

/// Write the three inputs, call the entrypoint and decode what it returns.
pub(crate) fn call_entrypoint(
    store: &mut Store<SessionState>,
    entrypoint: Func,
    request: &Request,
) -> Result<String, EvalError> {
    let script = bridge::allocate_string(&mut *store, &request.script);
    let url = bridge::allocate_string(&mut *store, &request.url);
    let host = bridge::allocate_string(&mut *store, &request.host);

    let params = [
        script.offset(),
        script.length(),
        url.offset(),
        url.length(),
        host.offset(),
        host.length(),
    ]
    .map(|v| Val::I32(v as i32));

    let mut results = vec![Val::I32(0); entrypoint.ty(&*store).results().len()];
    entrypoint
        .call(&mut *store, &params, &mut results)
        .map_err(EvalError::Call)?;

    let word = match results.first() {
        Some(Val::I64(raw)) => PackedWord::from_raw(*raw as u64),
        _ => return Err(EvalError::MissingResult),
    };
    if word.is_sentinel() {
        return Ok(String::new());
    }

    // The sandbox does not free its own output buffer.
    if !store
        .data_mut()
        .bridge
        .record_foreign_allocation(word.offset(), word.length())
    {
        store.data().diagnostics.report(&Diagnostic::AlreadyOwned {
            offset: word.offset(),
            length: word.length(),
        });
    }

    let bytes = bridge::read_string(&*store, word.offset(), word.length())?;
    decode_output(&bytes)
}

/// Apply the marker convention to raw output bytes.
pub(crate) fn decode_output(bytes: &[u8]) -> Result<String, EvalError> {
    let text = String::from_utf8_lossy(bytes);
    if let Some(message) = text.strip_prefix(ERROR_MARKER) {
        return Err(EvalError::Script(message.to_string()));
    }
    Ok(text.strip_prefix(OK_MARKER).unwrap_or(&text).to_string())
}

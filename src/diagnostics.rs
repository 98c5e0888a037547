//! Non-fatal warnings raised while an evaluation runs.
//!
//! None of these change the outcome of a call: allocation failures degrade
//! to "no value", capability failures degrade to "no value", and release
//! failures are ignored because the context is dropped right after.

use std::fmt;

/// A non-fatal event worth reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// `reserve` trapped, returned nothing, or returned a null offset.
    AllocationFailed { length: u32, error: String },
    /// Bytes could not be written into a freshly reserved buffer.
    WriteFailed { offset: u32, length: u32 },
    /// A capability could not read its input from sandbox memory.
    ReadFailed {
        function: &'static str,
        offset: u32,
        length: u32,
    },
    /// The host implementation behind a capability returned an error.
    CapabilityFailed {
        function: &'static str,
        error: String,
    },
    /// The sandbox returned a buffer the host already owns. It is released
    /// once, through the existing record.
    AlreadyOwned { offset: u32, length: u32 },
    /// `release` failed during the cleanup sweep.
    ReleaseFailed {
        offset: u32,
        length: u32,
        error: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::AllocationFailed { length, error } => {
                write!(f, "allocation of {} bytes failed: {}", length, error)
            }
            Diagnostic::WriteFailed { offset, length } => {
                write!(f, "cannot write {} bytes at offset {}", length, offset)
            }
            Diagnostic::ReadFailed {
                function,
                offset,
                length,
            } => write!(
                f,
                "{}: cannot read {} bytes at offset {}",
                function, length, offset
            ),
            Diagnostic::CapabilityFailed { function, error } => {
                write!(f, "{} failed: {}", function, error)
            }
            Diagnostic::AlreadyOwned { offset, length } => write!(
                f,
                "result at offset {} ({} bytes) is already owned by the host",
                offset, length
            ),
            Diagnostic::ReleaseFailed {
                offset,
                length,
                error,
            } => write!(
                f,
                "cannot release {} bytes at offset {}: {}",
                length, offset, error
            ),
        }
    }
}

/// Receiver for [`Diagnostic`]s.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: &Diagnostic);
}

/// Default sink: forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: &Diagnostic) {
        match diagnostic {
            Diagnostic::AllocationFailed { length, error } => {
                tracing::error!(length, error = %error, "allocation failed");
            }
            Diagnostic::WriteFailed { offset, length } => {
                tracing::error!(offset, length, "cannot write to sandbox memory");
            }
            Diagnostic::ReadFailed {
                function,
                offset,
                length,
            } => {
                tracing::error!(function, offset, length, "cannot read sandbox memory");
            }
            Diagnostic::CapabilityFailed { function, error } => {
                tracing::warn!(function, error = %error, "capability call failed");
            }
            Diagnostic::AlreadyOwned { offset, length } => {
                tracing::warn!(offset, length, "sandbox returned a buffer the host already owns");
            }
            Diagnostic::ReleaseFailed {
                offset,
                length,
                error,
            } => {
                tracing::warn!(offset, length, error = %error, "cannot free sandbox memory");
            }
        }
    }
}

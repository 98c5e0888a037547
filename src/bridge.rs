//! Memory bridge between the host and the sandbox's linear memory.
//!
//! Nothing else reads or writes sandbox memory, and nothing else asks the
//! sandbox to allocate or free. Every buffer the host ends up owning is
//! tracked as an [`AllocationRecord`] and handed back to `release` exactly
//! once by [`release_all`].

use crate::codec::PackedWord;
use crate::diagnostics::Diagnostic;
use crate::error::EvalError;
use crate::session::SessionState;
use anyhow::{Context, Error};
use wasmtime::{AsContext, AsContextMut, Instance, Memory, TypedFunc};

/// A region of sandbox memory owned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub offset: u32,
    pub length: u32,
}

/// Outcome of a cleanup sweep.
#[derive(Debug, Default)]
pub(crate) struct SweepReport {
    pub(crate) released: Vec<AllocationRecord>,
    pub(crate) failed: Vec<AllocationRecord>,
}

/// Exports the bridge needs from an instantiated sandbox.
#[derive(Clone)]
pub(crate) struct SandboxExports {
    memory: Memory,
    reserve: TypedFunc<u32, u32>,
    release: TypedFunc<(u32, u32), ()>,
}

impl SandboxExports {
    pub(crate) fn resolve(mut store: impl AsContextMut, instance: &Instance) -> Result<Self, Error> {
        let memory = instance
            .get_memory(&mut store, "memory")
            .context("missing \"memory\" export in the module")?;
        let reserve = instance
            .get_typed_func::<u32, u32>(&mut store, "reserve")
            .context("missing \"reserve\" function in the module")?;
        let release = instance
            .get_typed_func::<(u32, u32), ()>(&mut store, "release")
            .context("missing \"release\" function in the module")?;
        Ok(Self {
            memory,
            reserve,
            release,
        })
    }
}

/// Per-context ownership bookkeeping.
#[derive(Default)]
pub(crate) struct MemoryBridge {
    exports: Option<SandboxExports>,
    allocations: Vec<AllocationRecord>,
}

impl MemoryBridge {
    pub(crate) fn attach(&mut self, exports: SandboxExports) {
        self.exports = Some(exports);
    }

    /// Take ownership of a buffer the sandbox allocated and will not free.
    ///
    /// Returns `false` and records nothing when `offset` is already owned,
    /// so the sweep never releases it twice.
    pub(crate) fn record_foreign_allocation(&mut self, offset: u32, length: u32) -> bool {
        if self.allocations.iter().any(|record| record.offset == offset) {
            return false;
        }
        self.allocations.push(AllocationRecord { offset, length });
        true
    }

    #[cfg(test)]
    pub(crate) fn allocations(&self) -> &[AllocationRecord] {
        &self.allocations
    }

    /// Forget every record without calling into the sandbox.
    ///
    /// Only valid when the whole context is about to be dropped.
    pub(crate) fn abandon(&mut self) -> usize {
        let count = self.allocations.len();
        self.allocations.clear();
        count
    }
}

fn report(store: &impl AsContext<Data = SessionState>, diagnostic: Diagnostic) {
    store.as_context().data().diagnostics.report(&diagnostic);
}

/// Copy `text` into a fresh sandbox buffer.
///
/// Never fails: an empty string, a failed `reserve` or a failed write all
/// yield [`PackedWord::SENTINEL`].
pub(crate) fn allocate_string(
    mut store: impl AsContextMut<Data = SessionState>,
    text: &str,
) -> PackedWord {
    if text.is_empty() {
        return PackedWord::SENTINEL;
    }
    let mut store = store.as_context_mut();

    let length = match u32::try_from(text.len()) {
        Ok(length) => length,
        Err(_) => {
            report(
                &store,
                Diagnostic::AllocationFailed {
                    length: u32::MAX,
                    error: format!("{} bytes do not fit the sandbox address space", text.len()),
                },
            );
            return PackedWord::SENTINEL;
        }
    };

    let Some(exports) = store.data().bridge.exports.clone() else {
        report(
            &store,
            Diagnostic::AllocationFailed {
                length,
                error: String::from("no sandbox attached"),
            },
        );
        return PackedWord::SENTINEL;
    };

    let offset = match exports.reserve.call(&mut store, length) {
        Ok(0) => {
            report(
                &store,
                Diagnostic::AllocationFailed {
                    length,
                    error: String::from("reserve returned a null offset"),
                },
            );
            return PackedWord::SENTINEL;
        }
        Ok(offset) => offset,
        Err(e) => {
            report(
                &store,
                Diagnostic::AllocationFailed {
                    length,
                    error: format!("{:#}", e),
                },
            );
            return PackedWord::SENTINEL;
        }
    };

    // Tracked before writing so a failed write is still released.
    store
        .data_mut()
        .bridge
        .allocations
        .push(AllocationRecord { offset, length });

    if exports
        .memory
        .write(&mut store, offset as usize, text.as_bytes())
        .is_err()
    {
        report(&store, Diagnostic::WriteFailed { offset, length });
        return PackedWord::SENTINEL;
    }

    PackedWord::new(offset, length)
}

/// Copy `length` bytes at `offset` out of sandbox memory.
pub(crate) fn read_string(
    store: impl AsContext<Data = SessionState>,
    offset: u32,
    length: u32,
) -> Result<Vec<u8>, EvalError> {
    let store = store.as_context();
    let out_of_bounds = || EvalError::MemoryRead { offset, length };

    let exports = store.data().bridge.exports.as_ref().ok_or_else(out_of_bounds)?;
    let data = exports.memory.data(&store);
    let start = offset as usize;
    let end = start.checked_add(length as usize).ok_or_else(out_of_bounds)?;
    data.get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(out_of_bounds)
}

/// Hand every tracked buffer back to the sandbox's `release`.
///
/// Best-effort: a failed release is reported and the sweep moves on.
pub(crate) fn release_all(mut store: impl AsContextMut<Data = SessionState>) -> SweepReport {
    let mut store = store.as_context_mut();
    let records = std::mem::take(&mut store.data_mut().bridge.allocations);
    let mut sweep = SweepReport::default();

    let Some(exports) = store.data().bridge.exports.clone() else {
        sweep.failed = records;
        return sweep;
    };

    for record in records {
        match exports
            .release
            .call(&mut store, (record.offset, record.length))
        {
            Ok(()) => sweep.released.push(record),
            Err(e) => {
                report(
                    &store,
                    Diagnostic::ReleaseFailed {
                        offset: record.offset,
                        length: record.length,
                        error: format!("{:#}", e),
                    },
                );
                sweep.failed.push(record);
            }
        }
    }
    sweep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::tests::CollectingSink;
    use crate::testing::{fixture_store, live_allocations};
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_empty_string_skips_sandbox() {
        let (mut store, instance) = fixture_store(Arc::new(CollectingSink::default()));
        let word = allocate_string(&mut store, "");
        assert_eq!(word, PackedWord::SENTINEL);
        assert!(store.data().bridge.allocations().is_empty());
        assert_eq!(live_allocations(&mut store, &instance), 0);
    }

    #[test]
    fn test_allocate_then_read_back() {
        let (mut store, _) = fixture_store(Arc::new(CollectingSink::default()));
        let word = allocate_string(&mut store, "example.org");
        assert!(!word.is_sentinel());
        assert_eq!(word.length(), 11);

        let bytes = read_string(&store, word.offset(), word.length()).unwrap();
        assert_eq!(bytes, b"example.org");
        assert_eq!(
            store.data().bridge.allocations(),
            &[AllocationRecord {
                offset: word.offset(),
                length: 11
            }]
        );
    }

    #[test]
    fn test_read_out_of_bounds() {
        let (store, _) = fixture_store(Arc::new(CollectingSink::default()));
        let result = read_string(&store, 0xffff_0000, 16);
        assert!(matches!(
            result,
            Err(EvalError::MemoryRead {
                offset: 0xffff_0000,
                length: 16
            })
        ));

        // offset + length overflowing usize on 32-bit hosts is also rejected
        assert!(read_string(&store, u32::MAX, u32::MAX).is_err());
    }

    #[test]
    fn test_read_without_sandbox() {
        let (mut store, _) = fixture_store(Arc::new(CollectingSink::default()));
        store.data_mut().bridge = MemoryBridge::default();
        assert!(read_string(&store, 1024, 1).is_err());
    }

    #[test]
    fn test_sweep_releases_each_record_once() {
        let (mut store, instance) = fixture_store(Arc::new(CollectingSink::default()));
        for text in ["a", "bb", "ccc", "dddd"] {
            allocate_string(&mut store, text);
        }
        store.data_mut().bridge.record_foreign_allocation(4096, 8);
        assert_eq!(live_allocations(&mut store, &instance), 4);

        let sweep = release_all(&mut store);
        assert_eq!(sweep.released.len(), 5);
        assert!(sweep.failed.is_empty());

        let offsets: HashSet<u32> = sweep.released.iter().map(|r| r.offset).collect();
        assert_eq!(offsets.len(), 5);

        // four reserved, five released: the foreign one came from outside `reserve`
        assert_eq!(live_allocations(&mut store, &instance), -1);
        assert!(store.data().bridge.allocations().is_empty());

        let again = release_all(&mut store);
        assert!(again.released.is_empty());
        assert_eq!(live_allocations(&mut store, &instance), -1);
    }

    #[test]
    fn test_failed_release_does_not_stop_sweep() {
        let sink = Arc::new(CollectingSink::default());
        let (mut store, _) = fixture_store(sink.clone());
        allocate_string(&mut store, "first");
        // the fixture's release traps on offset 13
        store.data_mut().bridge.record_foreign_allocation(13, 1);
        allocate_string(&mut store, "second");

        let sweep = release_all(&mut store);
        assert_eq!(sweep.released.len(), 2);
        assert_eq!(
            sweep.failed,
            vec![AllocationRecord {
                offset: 13,
                length: 1
            }]
        );
        let seen = sink.take();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], Diagnostic::ReleaseFailed { offset: 13, .. }));
    }

    #[test]
    fn test_abandon_forgets_records() {
        let (mut store, instance) = fixture_store(Arc::new(CollectingSink::default()));
        allocate_string(&mut store, "left behind");
        assert_eq!(store.data_mut().bridge.abandon(), 1);
        assert!(release_all(&mut store).released.is_empty());
        assert_eq!(live_allocations(&mut store, &instance), 1);
    }

    #[test]
    fn test_failed_reserve_degrades_to_sentinel() {
        let sink = Arc::new(CollectingSink::default());
        let (mut store, _) = fixture_store(sink.clone());
        // the fixture refuses allocations larger than 60000 bytes
        let big = "x".repeat(60_001);
        assert_eq!(allocate_string(&mut store, &big), PackedWord::SENTINEL);
        assert!(store.data().bridge.allocations().is_empty());
        assert!(matches!(
            sink.take().as_slice(),
            [Diagnostic::AllocationFailed { length: 60_001, .. }]
        ));
    }

    #[test]
    fn test_foreign_allocation_at_owned_offset_is_skipped() {
        let (mut store, _) = fixture_store(Arc::new(CollectingSink::default()));
        let word = allocate_string(&mut store, "DIRECT");
        let bridge = &mut store.data_mut().bridge;
        assert!(!bridge.record_foreign_allocation(word.offset(), word.length()));
        assert!(bridge.record_foreign_allocation(4096, 8));

        let sweep = release_all(&mut store);
        let offsets: Vec<u32> = sweep.released.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![word.offset(), 4096]);
    }
}

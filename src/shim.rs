//! `wasi_snapshot_preview1` for the interpreter build.
//!
//! The interpreter is a `wasm32-wasi` binary, so it needs a WASI import
//! module even though it gets no files, no environment, no arguments and no
//! stdio. Randomness and clocks come from the [`CapabilitySet`];
//! `poll_oneoff` is replaced so that sleeping goes through [`Clock::sleep`].

use crate::capability::{CapabilitySet, Clock};
use crate::session::SessionState;
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use wasmtime::{Caller, Extern, Linker};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{HostMonotonicClock, HostWallClock, WasiCtxBuilder};

const WASI_MODULE: &str = "wasi_snapshot_preview1";

const SUBSCRIPTION_SIZE: usize = 48;
const EVENT_SIZE: usize = 32;

const ERRNO_SUCCESS: i32 = 0;
const ERRNO_BADF: u16 = 8;
const ERRNO_FAULT: i32 = 21;
const ERRNO_INVAL: i32 = 28;

const EVENTTYPE_CLOCK: u8 = 0;
const CLOCKID_REALTIME: u32 = 0;
const SUBCLOCKFLAGS_ABSTIME: u16 = 1;

struct WallClockHook(Arc<dyn Clock>);

impl HostWallClock for WallClockHook {
    fn resolution(&self) -> Duration {
        self.0.wall_resolution()
    }

    fn now(&self) -> Duration {
        self.0.wall()
    }
}

struct MonotonicClockHook(Arc<dyn Clock>);

impl HostMonotonicClock for MonotonicClockHook {
    fn resolution(&self) -> u64 {
        self.0.monotonic_resolution()
    }

    fn now(&self) -> u64 {
        self.0.monotonic()
    }
}

/// Fresh WASI state for one evaluation. Stdio is left unconnected.
pub(crate) fn build_context(capabilities: &CapabilitySet) -> WasiP1Ctx {
    WasiCtxBuilder::new()
        .secure_random(capabilities.random_source())
        .wall_clock(WallClockHook(capabilities.clock()))
        .monotonic_clock(MonotonicClockHook(capabilities.clock()))
        .build_p1()
}

pub(crate) fn bind(linker: &mut Linker<SessionState>) -> Result<(), Error> {
    preview1::add_to_linker_sync(linker, |state: &mut SessionState| &mut state.wasi)?;

    linker.allow_shadowing(true);
    linker.func_wrap(
        WASI_MODULE,
        "poll_oneoff",
        |mut caller: Caller<'_, SessionState>,
         subscriptions: u32,
         events: u32,
         count: u32,
         written: u32|
         -> i32 { poll_oneoff(&mut caller, subscriptions, events, count, written) },
    )?;
    linker.allow_shadowing(false);
    Ok(())
}

struct Event {
    userdata: u64,
    errno: u16,
    kind: u8,
}

/// Clock subscriptions sleep on the capability clock until the earliest one
/// fires. Fd subscriptions fail right away with `EBADF`: no fd is open.
fn poll_oneoff(
    caller: &mut Caller<'_, SessionState>,
    subscriptions: u32,
    events: u32,
    count: u32,
    written: u32,
) -> i32 {
    if count == 0 {
        return ERRNO_INVAL;
    }
    let Some(memory) = caller.get_export("memory").and_then(Extern::into_memory) else {
        return ERRNO_FAULT;
    };
    let Some(size) = (count as usize).checked_mul(SUBSCRIPTION_SIZE) else {
        return ERRNO_FAULT;
    };
    if size > memory.data_size(&*caller) {
        return ERRNO_FAULT;
    }
    let mut input = vec![0u8; size];
    if memory.read(&*caller, subscriptions as usize, &mut input).is_err() {
        return ERRNO_FAULT;
    }

    let clock = caller.data().capabilities.clock();
    let mut ready = Vec::new();
    let mut timers = Vec::new();
    for sub in input.chunks_exact(SUBSCRIPTION_SIZE) {
        let userdata = le_u64(sub, 0);
        let kind = sub[8];
        if kind != EVENTTYPE_CLOCK {
            ready.push(Event {
                userdata,
                errno: ERRNO_BADF,
                kind,
            });
            continue;
        }
        let timeout = le_u64(sub, 24);
        let wait = if le_u16(sub, 40) & SUBCLOCKFLAGS_ABSTIME != 0 {
            let now = if le_u32(sub, 16) == CLOCKID_REALTIME {
                u64::try_from(clock.wall().as_nanos()).unwrap_or(u64::MAX)
            } else {
                clock.monotonic()
            };
            timeout.saturating_sub(now)
        } else {
            timeout
        };
        timers.push((userdata, wait));
    }

    if ready.is_empty() {
        if let Some(earliest) = timers.iter().map(|(_, wait)| *wait).min() {
            clock.sleep(Duration::from_nanos(earliest));
            ready.extend(
                timers
                    .iter()
                    .filter(|(_, wait)| *wait <= earliest)
                    .map(|(userdata, _)| Event {
                        userdata: *userdata,
                        errno: 0,
                        kind: EVENTTYPE_CLOCK,
                    }),
            );
        }
    }

    let mut output = vec![0u8; ready.len() * EVENT_SIZE];
    for (slot, event) in output.chunks_exact_mut(EVENT_SIZE).zip(&ready) {
        slot[0..8].copy_from_slice(&event.userdata.to_le_bytes());
        slot[8..10].copy_from_slice(&event.errno.to_le_bytes());
        slot[10] = event.kind;
    }
    let count = ready.len() as u32;
    if memory.write(&mut *caller, events as usize, &output).is_err()
        || memory
            .write(&mut *caller, written as usize, &count.to_le_bytes())
            .is_err()
    {
        return ERRNO_FAULT;
    }
    ERRNO_SUCCESS
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[at..at + 2]);
    u16::from_le_bytes(buf)
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

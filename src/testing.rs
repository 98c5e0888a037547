//! Test fixtures: a tiny wat module speaking the sandbox ABI.
//!
//! The fixture does not run scripts. It dispatches on the first byte of the
//! script and otherwise echoes it back:
//!
//! | script | output |
//! |--------|--------|
//! | `#`    | the host argument |
//! | `*`    | the url argument |
//! | `$`    | `dns_resolve(host)`, copied |
//! | `&`    | `my_ip_addr()`, copied |
//! | `~`    | traps |
//! | `%`    | spins forever |
//! | `^`    | an out-of-bounds packed word |
//! | `=`    | `ok` after a 1.5ms `poll_oneoff` sleep |
//! | `?`    | four bytes of `random_get` |
//! | `@`    | the eight raw bytes of the realtime clock |
//! | `+`    | `ok` after growing memory by 2MB, traps if it cannot |
//! | `<`    | the script buffer itself, not a copy |
//!
//! `reserve` is a bump allocator that refuses more than 60000 bytes and
//! `release` traps on offset 13.

use crate::capability::{CapabilitySet, Clock};
use crate::config::SandboxConfig;
use crate::diagnostics::tests::CollectingSink;
use crate::module::SandboxModule;
use crate::runtime::Evaluator;
use crate::session::{Session, SessionState};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wasmtime::{Instance, Store};

pub(crate) const FIXTURE_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "random_get"
    (func $random_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "clock_time_get"
    (func $clock_time_get (param i32 i64 i32) (result i32)))
  (import "wasi_snapshot_preview1" "poll_oneoff"
    (func $poll_oneoff (param i32 i32 i32 i32) (result i32)))
  (import "env" "dns_resolve" (func $dns_resolve (param i32 i32) (result i64)))
  (import "env" "my_ip_addr" (func $my_ip_addr (result i64)))

  (memory (export "memory") 2)
  (data (i32.const 256) "ok")
  (data (i32.const 260) "no")

  (global $heap (mut i32) (i32.const 1024))
  (global $live (mut i32) (i32.const 0))

  (func $reserve (export "reserve") (param $len i32) (result i32)
    (local $ptr i32)
    (if (i32.gt_u (local.get $len) (i32.const 60000))
      (then (return (i32.const 0))))
    (local.set $ptr (global.get $heap))
    (global.set $heap
      (i32.add
        (local.get $ptr)
        (i32.and (i32.add (local.get $len) (i32.const 7)) (i32.const -8))))
    (global.set $live (i32.add (global.get $live) (i32.const 1)))
    (local.get $ptr))

  (func (export "release") (param $ptr i32) (param $len i32)
    (if (i32.eq (local.get $ptr) (i32.const 13))
      (then (unreachable)))
    (global.set $live (i32.sub (global.get $live) (i32.const 1))))

  (func (export "live_allocations") (result i32)
    (global.get $live))

  (func $emit (param $ptr i32) (param $len i32) (result i64)
    (local $dst i32)
    (if (i32.eqz (local.get $len))
      (then (return (i64.const 0))))
    (local.set $dst (call $reserve (local.get $len)))
    (memory.copy (local.get $dst) (local.get $ptr) (local.get $len))
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $dst)) (i64.const 32))
      (i64.extend_i32_u (local.get $len))))

  (func $forward (param $word i64) (result i64)
    (call $emit
      (i32.wrap_i64 (i64.shr_u (local.get $word) (i64.const 32)))
      (i32.wrap_i64 (local.get $word))))

  (func $sleep (result i64)
    (i64.store (i32.const 512) (i64.const 7))
    (i32.store (i32.const 528) (i32.const 1))
    (i64.store (i32.const 536) (i64.const 1500000))
    (if (i32.eqz
          (call $poll_oneoff (i32.const 512) (i32.const 600) (i32.const 1) (i32.const 640)))
      (then
        (if (i32.eq (i32.load (i32.const 640)) (i32.const 1))
          (then (return (call $emit (i32.const 256) (i32.const 2)))))))
    (call $emit (i32.const 260) (i32.const 2)))

  (func $random (result i64)
    (drop (call $random_get (i32.const 704) (i32.const 4)))
    (call $emit (i32.const 704) (i32.const 4)))

  (func $walltime (result i64)
    (drop (call $clock_time_get (i32.const 0) (i64.const 1) (i32.const 720)))
    (call $emit (i32.const 720) (i32.const 8)))

  (func $grow (result i64)
    (if (i32.eq (memory.grow (i32.const 32)) (i32.const -1))
      (then (unreachable)))
    (call $emit (i32.const 256) (i32.const 2)))

  (func (export "eval_pac")
    (param $src i32) (param $src_len i32)
    (param $url i32) (param $url_len i32)
    (param $host i32) (param $host_len i32)
    (result i64)
    (local $op i32)
    (if (i32.eqz (local.get $src_len))
      (then (return (i64.const 0))))
    (local.set $op (i32.load8_u (local.get $src)))
    (if (i32.eq (local.get $op) (i32.const 35))
      (then (return (call $emit (local.get $host) (local.get $host_len)))))
    (if (i32.eq (local.get $op) (i32.const 42))
      (then (return (call $emit (local.get $url) (local.get $url_len)))))
    (if (i32.eq (local.get $op) (i32.const 36))
      (then (return
        (call $forward (call $dns_resolve (local.get $host) (local.get $host_len))))))
    (if (i32.eq (local.get $op) (i32.const 38))
      (then (return (call $forward (call $my_ip_addr)))))
    (if (i32.eq (local.get $op) (i32.const 126))
      (then (unreachable)))
    (if (i32.eq (local.get $op) (i32.const 37))
      (then (loop $spin (br $spin))))
    (if (i32.eq (local.get $op) (i32.const 94))
      (then (return (i64.const 0xffff000000000010))))
    (if (i32.eq (local.get $op) (i32.const 61))
      (then (return (call $sleep))))
    (if (i32.eq (local.get $op) (i32.const 63))
      (then (return (call $random))))
    (if (i32.eq (local.get $op) (i32.const 64))
      (then (return (call $walltime))))
    (if (i32.eq (local.get $op) (i32.const 43))
      (then (return (call $grow))))
    (if (i32.eq (local.get $op) (i32.const 60))
      (then (return
        (i64.or
          (i64.shl (i64.extend_i32_u (local.get $src)) (i64.const 32))
          (i64.extend_i32_u (local.get $src_len))))))
    (call $emit (local.get $src) (local.get $src_len))))
"#;

/// Entrypoint without a result.
pub(crate) const NO_RESULT_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))
  (func (export "reserve") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (local.get $ptr) (i32.const 256)))
    (local.get $ptr))
  (func (export "release") (param i32 i32))
  (func (export "eval_pac") (param i32 i32 i32 i32 i32 i32)))
"#;

/// No `release` export.
pub(crate) const NO_RELEASE_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "reserve") (param i32) (result i32) (i32.const 1024))
  (func (export "eval_pac") (param i32 i32 i32 i32 i32 i32) (result i64) (i64.const 0)))
"#;

/// Start function that never returns.
pub(crate) const SPINNING_START_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func $spin (loop $forever (br $forever)))
  (start $spin)
  (func (export "reserve") (param i32) (result i32) (i32.const 1024))
  (func (export "release") (param i32 i32))
  (func (export "eval_pac") (param i32 i32 i32 i32 i32 i32) (result i64) (i64.const 0)))
"#;

pub(crate) fn fixture() -> SandboxModule {
    SandboxModule::from_bytes(FIXTURE_WAT.as_bytes().to_vec())
}

pub(crate) fn untimed() -> SandboxConfig {
    SandboxConfig {
        timeout_ms: None,
        ..Default::default()
    }
}

pub(crate) fn evaluator_with(capabilities: CapabilitySet) -> (Evaluator, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::default());
    let evaluator = Evaluator::new(fixture())
        .with_config(untimed())
        .with_capabilities(capabilities)
        .with_diagnostics(sink.clone());
    (evaluator, sink)
}

/// An instantiated fixture with the bridge attached.
pub(crate) fn fixture_store(sink: Arc<CollectingSink>) -> (Store<SessionState>, Instance) {
    let config = untimed();
    let engine = Session::engine(&config).unwrap();
    Session::new(
        engine,
        fixture(),
        Arc::new(CapabilitySet::default()),
        sink,
        Arc::new(config),
    )
    .instantiate()
    .unwrap()
}

/// Reserves minus releases seen by the fixture.
pub(crate) fn live_allocations(store: &mut Store<SessionState>, instance: &Instance) -> i32 {
    instance
        .get_typed_func::<(), i32>(&mut *store, "live_allocations")
        .unwrap()
        .call(&mut *store, ())
        .unwrap()
}

/// Fixed clock that records sleeps instead of sleeping.
#[derive(Clone, Default)]
pub(crate) struct RecordingClock {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingClock {
    pub(crate) const WALL_NANOS: u64 = u64::from_le_bytes(*b"WALLTIME");

    pub(crate) fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

impl Clock for RecordingClock {
    fn wall(&self) -> Duration {
        Duration::from_nanos(Self::WALL_NANOS)
    }

    fn monotonic(&self) -> u64 {
        1_000
    }

    fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

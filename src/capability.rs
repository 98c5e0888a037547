//! Host capabilities the sandboxed script may call back into.
//!
//! The sandbox imports exactly two functions, `dns_resolve` and
//! `my_ip_addr`. Both return a packed string reference and neither can trap:
//! any failure collapses to the "no value" sentinel so the script falls back
//! to its own default (`dnsResolve` returning `null`, and so on).
//!
//! Clock, randomness and sleep are part of the same set but reach the
//! sandbox through the WASI shim.

use crate::bridge;
use crate::codec::PackedWord;
use crate::diagnostics::Diagnostic;
use crate::error::EvalError;
use crate::session::SessionState;
use anyhow::{anyhow, Error};
use rand::RngCore;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use wasmtime::{Caller, Linker};

pub type ResolveHostFn = dyn Fn(&str) -> Result<String, Error> + Send + Sync;
pub type LocalAddressFn = dyn Fn() -> Result<String, Error> + Send + Sync;
pub type RandomSourceFn = dyn Fn() -> Box<dyn RngCore + Send> + Send + Sync;

/// Time and sleep as seen by the sandbox.
pub trait Clock: Send + Sync {
    /// Time elapsed since the UNIX epoch.
    fn wall(&self) -> Duration;

    fn wall_resolution(&self) -> Duration {
        Duration::from_micros(1)
    }

    /// Nanoseconds since an arbitrary, fixed starting point.
    fn monotonic(&self) -> u64;

    fn monotonic_resolution(&self) -> u64 {
        1
    }

    fn sleep(&self, duration: Duration);
}

/// The real clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    base: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            base: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn wall(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }

    fn monotonic(&self) -> u64 {
        u64::try_from(self.base.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Everything the sandbox may reach on the host.
///
/// Built once per [`Evaluator`](crate::Evaluator) and shared read-only by
/// every evaluation it runs.
#[derive(Clone)]
pub struct CapabilitySet {
    resolve_host: Arc<ResolveHostFn>,
    local_address: Arc<LocalAddressFn>,
    random_source: Arc<RandomSourceFn>,
    clock: Arc<dyn Clock>,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self {
            resolve_host: Arc::new(resolve_host),
            local_address: Arc::new(local_address),
            random_source: Arc::new(|| -> Box<dyn RngCore + Send> { Box::new(rand::rngs::OsRng) }),
            clock: Arc::new(SystemClock::default()),
        }
    }
}

impl CapabilitySet {
    pub fn with_resolver(
        mut self,
        resolver: impl Fn(&str) -> Result<String, Error> + Send + Sync + 'static,
    ) -> Self {
        self.resolve_host = Arc::new(resolver);
        self
    }

    pub fn with_local_address(
        mut self,
        local_address: impl Fn() -> Result<String, Error> + Send + Sync + 'static,
    ) -> Self {
        self.local_address = Arc::new(local_address);
        self
    }

    /// Source for WASI `random_get`. Called once per evaluation.
    pub fn with_random_source(
        mut self,
        source: impl Fn() -> Box<dyn RngCore + Send> + Send + Sync + 'static,
    ) -> Self {
        self.random_source = Arc::new(source);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn resolve_host(&self, host: &str) -> Result<String, Error> {
        (self.resolve_host)(host)
    }

    pub fn local_address(&self) -> Result<String, Error> {
        (self.local_address)()
    }

    pub(crate) fn random_source(&self) -> Box<dyn RngCore + Send> {
        (self.random_source)()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }
}

/// Resolve `host` to one address, preferring IPv4.
pub fn resolve_host(host: &str) -> Result<String, Error> {
    let addrs: Vec<SocketAddr> = (host, 0)
        .to_socket_addrs()
        .map_err(|e| anyhow!("cannot resolve '{}': {}", host, e))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .map(|addr| addr.ip().to_string())
        .ok_or_else(|| anyhow!("no addresses resolved for '{}'", host))
}

/// The address this machine would use for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only selects a route. The
/// notion is vague on multi-homed hosts, which is why PAC scripts are
/// discouraged from relying on `myIpAddress()`.
pub fn local_address() -> Result<String, Error> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("192.0.2.1:9")?;
    let ip = socket.local_addr()?.ip();
    if is_global_unicast(ip) {
        Ok(ip.to_string())
    } else {
        Err(anyhow!("local address not set"))
    }
}

/// Any unicast address except loopback and link-local. Private ranges count.
fn is_global_unicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_link_local())
        }
        IpAddr::V6(v6) => {
            // fe80::/10
            let link_local = v6.segments()[0] & 0xffc0 == 0xfe80;
            !(v6.is_unspecified() || v6.is_loopback() || v6.is_multicast() || link_local)
        }
    }
}

// ============================================================================
// Binding
// ============================================================================

/// Add `dns_resolve` and `my_ip_addr` under `module`.
pub(crate) fn bind(linker: &mut Linker<SessionState>, module: &str) -> Result<(), Error> {
    linker.func_wrap(
        module,
        "dns_resolve",
        |mut caller: Caller<'_, SessionState>, offset: u32, length: u32| -> u64 {
            dns_resolve(&mut caller, offset, length).into_raw()
        },
    )?;
    linker.func_wrap(
        module,
        "my_ip_addr",
        |mut caller: Caller<'_, SessionState>| -> u64 { my_ip_addr(&mut caller).into_raw() },
    )?;
    Ok(())
}

fn dns_resolve(caller: &mut Caller<'_, SessionState>, offset: u32, length: u32) -> PackedWord {
    caller.data_mut().capability_calls += 1;
    let input = match bridge::read_string(&*caller, offset, length) {
        Ok(input) => input,
        Err(_) => {
            caller.data().diagnostics.report(&Diagnostic::ReadFailed {
                function: "dns_resolve",
                offset,
                length,
            });
            return PackedWord::SENTINEL;
        }
    };
    let host = String::from_utf8_lossy(&input).into_owned();
    let capabilities = caller.data().capabilities.clone();
    let result = contain(|| capabilities.resolve_host(&host));
    respond(caller, "dns_resolve", result)
}

fn my_ip_addr(caller: &mut Caller<'_, SessionState>) -> PackedWord {
    caller.data_mut().capability_calls += 1;
    let capabilities = caller.data().capabilities.clone();
    let result = contain(|| capabilities.local_address());
    respond(caller, "my_ip_addr", result)
}

/// A panicking host implementation counts as a failed lookup.
fn contain(lookup: impl FnOnce() -> Result<String, Error>) -> Result<String, Error> {
    match panic::catch_unwind(AssertUnwindSafe(lookup)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("{}", EvalError::from_panic(payload))),
    }
}

fn respond(
    caller: &mut Caller<'_, SessionState>,
    function: &'static str,
    result: Result<String, Error>,
) -> PackedWord {
    match result {
        Ok(value) => bridge::allocate_string(&mut *caller, &value),
        Err(e) => {
            caller.data().diagnostics.report(&Diagnostic::CapabilityFailed {
                function,
                error: format!("{:#}", e),
            });
            PackedWord::SENTINEL
        }
    }
}

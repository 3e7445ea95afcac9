// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// The process harness: one `lqsr_core::Adapter` driven by a background
// timer thread. Grounded on `vl1::node`'s `BackgroundServicable` contract
// (`SERVICE_INTERVAL_MS` + a `service()` call from the host's own timer
// loop) and `exe/mcl.c`'s 100ms `MINIPORT_TIMEOUT` tick, realized here as a
// plain `std::thread` with a condvar-timed sleep rather than `tokio` —
// the core has no async requirement, and `tokio` in the teacher's own
// `main.rs` exists only to drive UDP/HTTP sockets this workspace's
// Non-goals exclude.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use lqsr_core::error::Result;
use lqsr_core::interfaces::{LinkLayer, RandomSource, VirtualAdapterHost};
use lqsr_core::{Adapter, AdapterConfig, AdapterId};
use lqsr_util::MacAddr;

use crate::log::{Event, EventSink, Level, Log};

/// Minimum interval, in ticks, between two calls to `Adapter::tick`,
/// matching the teacher's `SERVICE_INTERVAL_MS`-equivalent constant.
pub const SERVICE_INTERVAL_MS: i64 = 100;

/// Source of true randomness for nonces/IVs/Route Request identifiers,
/// backed by the OS CSPRNG via `getrandom` (the teacher's own
/// `zerotier_core_crypto::random` module was referenced but not present in
/// the retrieved source, so this crate goes straight to the OS entropy
/// source it would have wrapped).
pub struct OsRandomSource;

impl RandomSource for OsRandomSource {
    fn fill_bytes(&self, buf: &mut [u8]) {
        if getrandom::getrandom(buf).is_err() {
            buf.fill(0);
        }
    }
}

/// A `LinkLayer` that only logs what it would have sent. A real deployment
/// swaps this for a raw-socket or vnic-backed implementation; wiring one up
/// is outside this workspace's scope (the wire protocol and routing logic
/// are the subject here, not a platform packet-capture layer).
pub struct LoggingLinkLayer {
    local: MacAddr,
    log: Arc<Log>,
}

impl LoggingLinkLayer {
    pub fn new(local: MacAddr, log: Arc<Log>) -> Self {
        Self { local, log }
    }
}

impl LinkLayer for LoggingLinkLayer {
    fn send_frame(&self, out_if: u8, next_hop: MacAddr, frame: &[u8]) -> Result<()> {
        self.log.emit(Level::Trace, Event::Trace(format!("send {} bytes on if {} to {}", frame.len(), out_if, next_hop)));
        Ok(())
    }

    fn mtu(&self, _if_index: u8) -> usize {
        1500
    }

    fn active_interfaces(&self) -> Vec<u8> {
        vec![0]
    }

    fn local_address(&self, _if_index: u8) -> Option<MacAddr> {
        Some(self.local)
    }
}

/// Delivers received payloads and route-change notifications straight to
/// the log, standing in for a host network stack.
pub struct LoggingHost {
    log: Arc<Log>,
}

impl LoggingHost {
    pub fn new(log: Arc<Log>) -> Self {
        Self { log }
    }
}

impl VirtualAdapterHost for LoggingHost {
    fn deliver(&self, ether_type: u16, payload: &[u8]) {
        self.log.emit(Level::Info, Event::Trace(format!("delivered {} bytes, ethertype 0x{:04x}", payload.len(), ether_type)));
    }

    fn on_route_changed(&self, destination: MacAddr, reachable: bool) {
        if reachable {
            self.log.emit(Level::Info, Event::RouteDiscovered(destination));
        } else {
            self.log.emit(Level::Warning, Event::LinkFailed(destination, destination));
        }
    }
}

struct ShutdownSignal {
    stop: Mutex<bool>,
    condvar: Condvar,
}

/// Ties one `Adapter` to a background timer thread. `start()`/`stop()` are
/// idempotent and safe to call from any thread.
pub struct Service {
    adapter: Arc<Adapter>,
    log: Arc<Log>,
    running: AtomicBool,
    shutdown: Arc<ShutdownSignal>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Service {
    pub fn new(id: AdapterId, config: AdapterConfig, log: Arc<Log>) -> Result<Arc<Self>> {
        let link_layer = Arc::new(LoggingLinkLayer::new(config.node_address, log.clone()));
        let host = Arc::new(LoggingHost::new(log.clone()));
        let random = Arc::new(OsRandomSource);
        let adapter = Arc::new(Adapter::new(id, config, link_layer, host, random)?);
        Ok(Arc::new(Self {
            adapter,
            log,
            running: AtomicBool::new(false),
            shutdown: Arc::new(ShutdownSignal { stop: Mutex::new(false), condvar: Condvar::new() }),
            join: Mutex::new(None),
        }))
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    /// Starts the background timer thread, calling `Adapter::tick` every
    /// `SERVICE_INTERVAL_MS` until `stop()` is called. No-op if already
    /// running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let handle = std::thread::spawn(move || this.run_loop());
        *self.join.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.shutdown.stop.lock().unwrap() = true;
        self.shutdown.condvar.notify_all();
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn run_loop(&self) {
        self.log.emit(Level::Info, Event::Trace("service started".to_string()));
        let mut now_ticks: i64 = 0;
        loop {
            let mut stop = self.shutdown.stop.lock().unwrap();
            if *stop {
                break;
            }
            let (guard, timeout) = self.shutdown.condvar.wait_timeout(stop, Duration::from_millis(SERVICE_INTERVAL_MS as u64)).unwrap();
            stop = guard;
            if *stop {
                break;
            }
            drop(stop);
            let _ = timeout;

            now_ticks += lqsr_util::millis(SERVICE_INTERVAL_MS);
            self.adapter.tick(now_ticks);
        }
        self.log.emit(Level::Info, Event::Trace("service stopped".to_string()));
    }
}

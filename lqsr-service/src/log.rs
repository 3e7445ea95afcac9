// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Structured event log. Grounded on `crate::log::Log` as referenced from
// `service.rs` (a leveled, timestamped logger written to a file or
// stderr); the core crate never touches this directly — it only knows
// about `lqsr_core::interfaces` callbacks, so the bridge here implements a
// narrow `EventSink` the core's embedder (this crate's `Service`) can pass
// down without leaking file I/O into `lqsr-core`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;

use lqsr_util::MacAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warning,
    Info,
    Trace,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERR",
            Level::Warning => "WRN",
            Level::Info => "INF",
            Level::Trace => "TRC",
        }
    }
}

/// Structured events the core's forwarder/adapter may want logged, kept
/// free of any formatting decision so the sink can render or drop them.
#[derive(Debug, Clone)]
pub enum Event {
    LinkAdded(MacAddr, MacAddr),
    LinkChanged(MacAddr, MacAddr),
    LinkRemoved(MacAddr, MacAddr),
    RouteDiscovered(MacAddr),
    LinkFailed(MacAddr, MacAddr),
    MacFailure(MacAddr),
    Trace(String),
}

/// The narrow boundary the core-embedding side calls through to report
/// events, mirroring `SystemInterface::event` in the teacher crate's VL1
/// core and the conditional `zt_trace!` tracing macro in `util/mod.rs`.
pub trait EventSink: Send + Sync {
    fn emit(&self, level: Level, event: Event);
}

enum Sink {
    Stderr,
    File(File),
}

/// Leveled, timestamped logger: a file-or-stderr sink behind one mutex,
/// safe to call from any thread. Construction mirrors `Log::new(path,
/// max_size, stderr, debug, module_prefix)` at the teacher's call site in
/// `service.rs`, though rotation-on-`max_size` is simplified to a single
/// truncate-on-exceed check rather than numbered backups.
pub struct Log {
    sink: Mutex<Sink>,
    max_size: u64,
    min_level: Level,
    path: Option<std::path::PathBuf>,
}

impl Log {
    pub fn new<P: AsRef<Path>>(path: Option<P>, max_size: u64, to_stderr: bool, debug: bool) -> std::io::Result<Self> {
        let min_level = if debug { Level::Trace } else { Level::Info };
        let (sink, stored_path) = if to_stderr || path.is_none() {
            (Sink::Stderr, None)
        } else {
            let p = path.unwrap().as_ref().to_path_buf();
            let f = OpenOptions::new().create(true).append(true).open(&p)?;
            (Sink::File(f), Some(p))
        };
        Ok(Self { sink: Mutex::new(sink), max_size, min_level, path: stored_path })
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.min_level = if debug { Level::Trace } else { Level::Info };
    }

    fn write_line(&self, level: Level, now_ticks: i64, line: &str) {
        if level > self.min_level {
            return;
        }
        let formatted = format!("[{:>12}] {} {}\n", now_ticks, level.tag(), line);
        let mut sink = self.sink.lock();
        match &mut *sink {
            Sink::Stderr => {
                let _ = std::io::stderr().write_all(formatted.as_bytes());
            }
            Sink::File(f) => {
                if let Ok(meta) = f.metadata() {
                    if self.max_size > 0 && meta.len() > self.max_size {
                        if let Some(path) = &self.path {
                            if let Ok(truncated) = OpenOptions::new().create(true).write(true).truncate(true).open(path) {
                                *f = truncated;
                            }
                        }
                    }
                }
                let _ = f.write_all(formatted.as_bytes());
            }
        }
    }

    pub fn log(&self, level: Level, now_ticks: i64, message: &str) {
        self.write_line(level, now_ticks, message);
    }
}

impl EventSink for Log {
    fn emit(&self, level: Level, event: Event) {
        let line = match &event {
            Event::LinkAdded(a, b) => format!("link added {} -> {}", a, b),
            Event::LinkChanged(a, b) => format!("link changed {} -> {}", a, b),
            Event::LinkRemoved(a, b) => format!("link removed {} -> {}", a, b),
            Event::RouteDiscovered(dest) => format!("route discovered to {}", dest),
            Event::LinkFailed(a, b) => format!("link failed {} -> {}", a, b),
            Event::MacFailure(src) => format!("MAC verification failed from {}", src),
            Event::Trace(msg) => msg.clone(),
        };
        self.write_line(level, 0, &line);
    }
}

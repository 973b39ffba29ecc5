//! Hierarchical, level-filtered logging.
//!
//! Three pieces: [`Log`] (the registry), [`Logger`] (a node in a
//! colon-separated name hierarchy), and [`LogSink`] (where records go).
//! Looking up `mordor:http:client` implicitly creates `mordor` and
//! `mordor:http`. A sink added to a logger receives records from that
//! logger and from every descendant whose inheritance chain reaches it.
//!
//! Emission is gated twice: [`Logger::enabled`] filters by level (the
//! [`log_error!`](crate::log_error) macro family checks it before
//! formatting), and [`LogDisabler`] suppresses all records from the
//! current fiber while it is in scope.
//!
//! Levels and enabled sinks can be driven by the config registry: the
//! `log.{stdout,syslog}` booleans and the `log.file` path toggle root
//! sinks, and the `log.*mask` regexes set each logger to the most
//! verbose level whose mask matches its name (see [`register_config`]).

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::config;
use crate::fiber::{Fiber, FiberLocalStorage};

/// The level of a log message. Each level is a superset of the previous
/// one: a logger set to `Info` passes `Fatal` through `Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    None,
    /// The application cannot continue.
    Fatal,
    /// An error that cannot locally be recovered from.
    Error,
    /// An error that was ignored or recovered, but worth knowing about.
    Warning,
    /// A normal but significant event.
    Info,
    /// A somewhat significant event.
    Verbose,
    /// Most calls a component makes.
    Debug,
    /// Everything under the sun.
    Trace,
}

impl Level {
    fn from_u8(v: u8) -> Level {
        match v {
            0 => Level::None,
            1 => Level::Fatal,
            2 => Level::Error,
            3 => Level::Warning,
            4 => Level::Info,
            5 => Level::Verbose,
            6 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::None => "NONE",
            Level::Fatal => "FATAL",
            Level::Error => "ERROR",
            Level::Warning => "WARNING",
            Level::Info => "INFO",
            Level::Verbose => "VERBOSE",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        f.write_str(name)
    }
}

/// A single log message plus its capture context.
pub struct LogRecord<'a> {
    /// Full name of the emitting logger.
    pub logger: &'a str,
    pub timestamp: SystemTime,
    /// Microseconds since the logging subsystem came up.
    pub elapsed_us: u64,
    pub thread: u64,
    /// Opaque identity of the emitting fiber.
    pub fiber: usize,
    pub level: Level,
    pub message: &'a str,
    pub file: &'static str,
    pub line: u32,
}

impl LogRecord<'_> {
    /// Single-line rendering used by the bundled sinks.
    pub fn render(&self) -> String {
        let since_epoch = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        format!(
            "{}.{:06} {:>7}us {} fiber={:#x} {} {} {}:{} {}\n",
            since_epoch.as_secs(),
            since_epoch.subsec_micros(),
            self.elapsed_us,
            self.thread,
            self.fiber,
            self.level,
            self.logger,
            self.file,
            self.line,
            self.message,
        )
    }
}

/// Receives log records.
pub trait LogSink: Send + Sync {
    fn log(&self, record: &LogRecord<'_>);
}

/// Dumps records to stdout.
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn log(&self, record: &LogRecord<'_>) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(record.render().as_bytes());
    }
}

/// Appends records to a file.
///
/// The file is opened in append mode, so multiple processes and threads
/// can log to it simultaneously; records interleave but each one lands
/// in a single write.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<FileSink> {
        let path = path.into();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(FileSink {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn log(&self, record: &LogRecord<'_>) {
        let line = record.render();
        let mut file = lock(&self.file);
        let _ = file.write_all(line.as_bytes());
    }
}

/// Sends records to syslog.
#[cfg(unix)]
pub struct SyslogSink {
    facility: libc::c_int,
}

#[cfg(unix)]
impl SyslogSink {
    pub fn new(facility: libc::c_int) -> SyslogSink {
        SyslogSink { facility }
    }

    pub fn facility(&self) -> libc::c_int {
        self.facility
    }
}

#[cfg(unix)]
impl LogSink for SyslogSink {
    fn log(&self, record: &LogRecord<'_>) {
        let severity = match record.level {
            Level::Fatal => libc::LOG_CRIT,
            Level::Error => libc::LOG_ERR,
            Level::Warning => libc::LOG_WARNING,
            Level::Info => libc::LOG_INFO,
            Level::Verbose => libc::LOG_INFO,
            _ => libc::LOG_DEBUG,
        };
        let message = format!("{} {}", record.logger, record.message);
        if let Ok(c_message) = std::ffi::CString::new(message) {
            unsafe {
                libc::syslog(self.facility | severity, c"%s".as_ptr(), c_message.as_ptr());
            }
        }
    }
}

/// An individual logger: a node in the name hierarchy.
pub struct Logger {
    name: String,
    parent: Weak<Logger>,
    children: Mutex<BTreeMap<String, Arc<Logger>>>,
    level: AtomicU8,
    sinks: Mutex<Vec<Arc<dyn LogSink>>>,
    inherit_sinks: AtomicBool,
}

impl Logger {
    fn new(name: String, parent: Weak<Logger>) -> Arc<Logger> {
        Arc::new(Logger {
            name,
            parent,
            children: Mutex::new(BTreeMap::new()),
            level: AtomicU8::new(Level::Info as u8),
            sinks: Mutex::new(Vec::new()),
            inherit_sinks: AtomicBool::new(true),
        })
    }

    /// Full colon-separated name ("" for the root).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a message at `level` would be emitted by this logger.
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed) && level != Level::None
    }

    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Set this logger's level, optionally propagating to all children.
    pub fn set_level(&self, level: Level, propagate: bool) {
        self.level.store(level as u8, Ordering::Relaxed);
        if propagate {
            let children: Vec<_> = lock(&self.children).values().cloned().collect();
            for child in children {
                child.set_level(level, true);
            }
        }
    }

    /// Whether this logger also fans records out to ancestor sinks.
    pub fn inherit_sinks(&self) -> bool {
        self.inherit_sinks.load(Ordering::Relaxed)
    }

    pub fn set_inherit_sinks(&self, inherit: bool) {
        self.inherit_sinks.store(inherit, Ordering::Relaxed);
    }

    pub fn add_sink(&self, sink: Arc<dyn LogSink>) {
        lock(&self.sinks).push(sink);
    }

    /// Remove a sink previously added with [`add_sink`](Self::add_sink)
    /// (identity comparison).
    pub fn remove_sink(&self, sink: &Arc<dyn LogSink>) {
        lock(&self.sinks).retain(|s| !Arc::ptr_eq(s, sink));
    }

    pub fn clear_sinks(&self) {
        lock(&self.sinks).clear();
    }

    /// Emit a message. Prefer the [`log_error!`](crate::log_error) macro
    /// family, which checks [`enabled`](Self::enabled) before formatting
    /// and captures file/line.
    pub fn log(&self, level: Level, message: &str, file: &'static str, line: u32) {
        if !self.enabled(level) || log_disabled() {
            return;
        }
        // Snapshot the sink fan-out, then deliver without locks held.
        let mut sinks: Vec<Arc<dyn LogSink>> = lock(&self.sinks).clone();
        let mut inherit = self.inherit_sinks();
        let mut parent = self.parent.clone();
        while inherit {
            let Some(up) = parent.upgrade() else { break };
            sinks.extend(lock(&up.sinks).iter().cloned());
            inherit = up.inherit_sinks();
            parent = up.parent.clone();
        }
        if sinks.is_empty() {
            return;
        }

        let record = LogRecord {
            logger: &self.name,
            timestamp: SystemTime::now(),
            elapsed_us: elapsed_us(),
            thread: thread_id(),
            fiber: Fiber::current().id(),
            level,
            message,
            file,
            line,
        };
        for sink in &sinks {
            sink.log(&record);
        }
    }
}

/// Access to the global logger hierarchy.
pub struct Log;

impl Log {
    /// The root of the hierarchy.
    pub fn root() -> Arc<Logger> {
        static ROOT: OnceLock<Arc<Logger>> = OnceLock::new();
        ROOT.get_or_init(|| {
            // Anchor the elapsed clock when the hierarchy comes up.
            let _ = start_instant();
            Logger::new(String::new(), Weak::new())
        })
        .clone()
    }

    /// Find (or create) the logger with the given colon-separated name,
    /// creating intermediate loggers as needed.
    pub fn lookup(name: &str) -> Arc<Logger> {
        let mut node = Log::root();
        if name.is_empty() {
            return node;
        }
        let mut full = String::new();
        for part in name.split(':') {
            if !full.is_empty() {
                full.push(':');
            }
            full.push_str(part);
            let next = {
                let mut children = lock(&node.children);
                children
                    .entry(part.to_string())
                    .or_insert_with(|| Logger::new(full.clone(), Arc::downgrade(&node)))
                    .clone()
            };
            node = next;
        }
        node
    }

    /// Visit every registered logger, including implicitly created
    /// intermediates.
    pub fn visit(mut f: impl FnMut(&Arc<Logger>)) {
        fn walk(node: &Arc<Logger>, f: &mut impl FnMut(&Arc<Logger>)) {
            f(node);
            let children: Vec<_> = lock(&node.children).values().cloned().collect();
            for child in &children {
                walk(child, f);
            }
        }
        walk(&Log::root(), &mut f);
    }
}

// ── Fiber-scoped suppression ────────────────────────────────────────────

fn disabled_fls() -> &'static FiberLocalStorage<usize> {
    static DISABLED: OnceLock<FiberLocalStorage<usize>> = OnceLock::new();
    DISABLED.get_or_init(FiberLocalStorage::new)
}

fn log_disabled() -> bool {
    disabled_fls().get() > 0
}

/// Suppresses all log emission from the current fiber between
/// construction and drop. Nests.
pub struct LogDisabler {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl LogDisabler {
    #[allow(clippy::new_without_default)]
    pub fn new() -> LogDisabler {
        let fls = disabled_fls();
        fls.set(fls.get() + 1);
        LogDisabler {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for LogDisabler {
    fn drop(&mut self) {
        let fls = disabled_fls();
        fls.set(fls.get().saturating_sub(1));
    }
}

// ── Record context helpers ──────────────────────────────────────────────

fn start_instant() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

fn elapsed_us() -> u64 {
    start_instant().elapsed().as_micros() as u64
}

#[cfg(target_os = "linux")]
fn thread_id() -> u64 {
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u64
}

#[cfg(all(unix, not(target_os = "linux")))]
fn thread_id() -> u64 {
    let mut tid: u64 = 0;
    unsafe {
        libc::pthread_threadid_np(0, &mut tid);
    }
    tid
}

// ── Config wiring ───────────────────────────────────────────────────────

/// Define the `log.*` config vars and hook them up so that setting one
/// reconfigures the hierarchy. Idempotent.
pub fn register_config() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        let stdout = config::define("log.stdout", "log to stdout", false);
        stdout.monitor(|_| apply_sink_config());
        #[cfg(unix)]
        {
            let syslog = config::define("log.syslog", "log to syslog", false);
            syslog.monitor(|_| apply_sink_config());
        }
        let file = config::define(
            "log.file",
            "file to append log records to (empty disables)",
            String::new(),
        );
        file.monitor(|_| apply_sink_config());

        let masks: [(&str, &str); 7] = [
            ("log.fatalmask", ".*"),
            ("log.errormask", ".*"),
            ("log.warningmask", ".*"),
            ("log.infomask", ".*"),
            ("log.verbosemask", ""),
            ("log.debugmask", ""),
            ("log.tracemask", ""),
        ];
        for (name, default) in masks {
            let var = config::define(
                name,
                "regex of loggers enabled at this level",
                default.to_string(),
            );
            var.monitor(|_| apply_level_masks());
        }
    });
}

fn stdout_sink() -> Arc<dyn LogSink> {
    static SINK: OnceLock<Arc<StdoutSink>> = OnceLock::new();
    SINK.get_or_init(|| Arc::new(StdoutSink)).clone()
}

#[cfg(unix)]
fn syslog_sink() -> Arc<dyn LogSink> {
    static SINK: OnceLock<Arc<SyslogSink>> = OnceLock::new();
    SINK.get_or_init(|| Arc::new(SyslogSink::new(libc::LOG_USER)))
        .clone()
}

fn bool_var(name: &str) -> bool {
    config::lookup(name).is_some_and(|v| v.value_string() == "true")
}

fn string_var(name: &str) -> String {
    config::lookup(name)
        .map(|v| v.value_string())
        .unwrap_or_default()
}

/// Reconcile the root logger's sinks with the `log.{stdout,syslog,file}`
/// vars. Only the sinks owned by this module are touched; manually added
/// sinks stay.
pub fn apply_sink_config() {
    let root = Log::root();

    let sink = stdout_sink();
    root.remove_sink(&sink);
    if bool_var("log.stdout") {
        root.add_sink(sink);
    }

    #[cfg(unix)]
    {
        let sink = syslog_sink();
        root.remove_sink(&sink);
        if bool_var("log.syslog") {
            root.add_sink(sink);
        }
    }

    static FILE: Mutex<Option<(String, Arc<FileSink>)>> = Mutex::new(None);
    let mut current = lock(&FILE);
    if let Some((_, sink)) = current.take() {
        let sink: Arc<dyn LogSink> = sink;
        root.remove_sink(&sink);
    }
    let path = string_var("log.file");
    if !path.is_empty() {
        match FileSink::new(&path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                root.add_sink(sink.clone());
                *current = Some((path, sink));
            }
            Err(err) => {
                eprintln!("mordor:log: cannot open {path:?}: {err}");
            }
        }
    }
}

/// Set every logger to the most verbose level whose `log.*mask` regex
/// matches its full name (no match at all disables the logger).
pub fn apply_level_masks() {
    // Most verbose first; the first matching mask wins.
    let masks: [(Level, &str); 7] = [
        (Level::Trace, "log.tracemask"),
        (Level::Debug, "log.debugmask"),
        (Level::Verbose, "log.verbosemask"),
        (Level::Info, "log.infomask"),
        (Level::Warning, "log.warningmask"),
        (Level::Error, "log.errormask"),
        (Level::Fatal, "log.fatalmask"),
    ];
    let mut compiled: Vec<(Level, Regex)> = Vec::new();
    for (level, var) in masks {
        let pattern = string_var(var);
        if pattern.is_empty() {
            continue;
        }
        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(re) => compiled.push((level, re)),
            Err(err) => eprintln!("mordor:log: bad mask in {var}: {err}"),
        }
    }
    Log::visit(|logger| {
        let level = compiled
            .iter()
            .find(|(_, re)| re.is_match(logger.name()))
            .map(|(level, _)| *level)
            .unwrap_or(Level::None);
        logger.set_level(level, false);
    });
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Macros ──────────────────────────────────────────────────────────────

/// Log at an explicit level; arguments are only evaluated when the
/// logger is enabled at that level.
#[macro_export]
macro_rules! log_level {
    ($logger:expr, $level:expr, $($arg:tt)*) => {
        if $logger.enabled($level) {
            $logger.log($level, &format!($($arg)*), file!(), line!());
        }
    };
}

#[macro_export]
macro_rules! log_fatal {
    ($logger:expr, $($arg:tt)*) => {
        $crate::log_level!($logger, $crate::log::Level::Fatal, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)*) => {
        $crate::log_level!($logger, $crate::log::Level::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_warning {
    ($logger:expr, $($arg:tt)*) => {
        $crate::log_level!($logger, $crate::log::Level::Warning, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)*) => {
        $crate::log_level!($logger, $crate::log::Level::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_verbose {
    ($logger:expr, $($arg:tt)*) => {
        $crate::log_level!($logger, $crate::log::Level::Verbose, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {
        $crate::log_level!($logger, $crate::log::Level::Debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_trace {
    ($logger:expr, $($arg:tt)*) => {
        $crate::log_level!($logger, $crate::log::Level::Trace, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CaptureSink {
        records: Mutex<Vec<(String, Level, String)>>,
    }

    impl CaptureSink {
        fn new() -> Arc<CaptureSink> {
            Arc::new(CaptureSink {
                records: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<(String, Level, String)> {
            std::mem::take(&mut self.records.lock().unwrap())
        }
    }

    impl LogSink for CaptureSink {
        fn log(&self, record: &LogRecord<'_>) {
            self.records.lock().unwrap().push((
                record.logger.to_string(),
                record.level,
                record.message.to_string(),
            ));
        }
    }

    #[test]
    fn lookup_creates_intermediates() {
        let leaf = Log::lookup("unit:lookup:leaf");
        assert_eq!(leaf.name(), "unit:lookup:leaf");
        let mut seen = false;
        Log::visit(|logger| {
            if logger.name() == "unit:lookup" {
                seen = true;
            }
        });
        assert!(seen);
        // Lookup is idempotent.
        assert!(Arc::ptr_eq(&leaf, &Log::lookup("unit:lookup:leaf")));
    }

    #[test]
    fn level_gating() {
        let logger = Log::lookup("unit:gating");
        logger.set_level(Level::Info, false);
        assert!(logger.enabled(Level::Fatal));
        assert!(logger.enabled(Level::Info));
        assert!(!logger.enabled(Level::Debug));
        logger.set_level(Level::None, false);
        assert!(!logger.enabled(Level::Fatal));
    }

    #[test]
    fn set_level_propagates() {
        let parent = Log::lookup("unit:propagate");
        let child = Log::lookup("unit:propagate:child");
        parent.set_level(Level::Trace, true);
        assert_eq!(child.level(), Level::Trace);
        parent.set_level(Level::Error, false);
        assert_eq!(child.level(), Level::Trace);
    }

    #[test]
    fn sink_inheritance_and_removal() {
        let sink = CaptureSink::new();
        let dyn_sink: Arc<dyn LogSink> = sink.clone();
        let parent = Log::lookup("unit:sinks");
        let child = Log::lookup("unit:sinks:child");
        parent.set_level(Level::Debug, true);
        parent.add_sink(dyn_sink.clone());

        log_debug!(child, "via inheritance {}", 1);
        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "unit:sinks:child");
        assert_eq!(records[0].1, Level::Debug);
        assert_eq!(records[0].2, "via inheritance 1");

        child.set_inherit_sinks(false);
        log_debug!(child, "dropped");
        assert!(sink.take().is_empty());
        child.set_inherit_sinks(true);

        parent.remove_sink(&dyn_sink);
        log_debug!(child, "after removal");
        assert!(sink.take().is_empty());
    }

    #[test]
    fn disabler_suppresses_current_fiber() {
        let sink = CaptureSink::new();
        let logger = Log::lookup("unit:disabler");
        logger.set_level(Level::Info, false);
        logger.add_sink(sink.clone());

        {
            let _guard = LogDisabler::new();
            log_info!(logger, "suppressed");
        }
        log_info!(logger, "delivered");

        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].2, "delivered");
        logger.clear_sinks();
    }
}

//! mordor — stackful fiber runtime.
//!
//! Cooperative user-space concurrency: lightweight [`Fiber`]s multiplexed
//! over OS threads by a [`Scheduler`], suspendable [`Stream`] I/O, and a
//! hierarchical, fiber-aware logging facility.
//!
//! # Quick start
//!
//! ```rust
//! use mordor::Scheduler;
//!
//! let sched = Scheduler::hijack("main", 1);
//! sched.schedule(|| {
//!     // runs inside a fiber on the hijacked thread
//!     Scheduler::yield_now();
//! });
//! sched.stop(); // drains the queue on the calling thread
//! ```
//!
//! # Platform
//!
//! Unix on x86_64 or aarch64 — fiber context switching is hand-written
//! per architecture.

pub mod config;
pub mod error;
pub mod fiber;
pub mod log;
pub mod scheduler;
pub mod stream;

// ── Re-exports: runtime ─────────────────────────────────────────────────

/// Default stack size for [`Fiber::new`].
pub use fiber::DEFAULT_STACK_SIZE;
/// A stackful cooperative execution unit.
pub use fiber::Fiber;
/// Typed per-fiber storage.
pub use fiber::FiberLocalStorage;
/// Execution state of a fiber.
pub use fiber::State;
/// A set/reset event fibers park on.
pub use scheduler::FiberEvent;
/// A FIFO work queue plus thread pool running fibers to suspension.
pub use scheduler::Scheduler;

// ── Re-exports: streams ─────────────────────────────────────────────────

/// Read buffering with delimiter scanning.
pub use stream::BufferedReader;
/// Close direction selector.
pub use stream::CloseHow;
/// Scripted in-memory stream for tests and loopback use.
pub use stream::MemoryStream;
/// Suspendable full-duplex byte stream.
pub use stream::Stream;
/// Blocking TCP transport behind [`Stream`].
pub use stream::TcpStream;

// ── Re-exports: shared types ────────────────────────────────────────────

/// Runtime errors.
pub use error::Error;
/// Copyable error category, used for latched failures.
pub use error::ErrorKind;
/// Crate-wide result alias.
pub use error::Result;
/// Fiber-scoped log suppression guard.
pub use log::LogDisabler;

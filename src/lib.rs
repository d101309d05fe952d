//! # RustFiber I/O - Fiber I/O and Timer Integration
//!
//! The I/O and timer layer of a cooperative, per-thread fiber runtime.
//! Fibers suspend on a file descriptor becoming readable or writable, or on
//! a deadline, and a dedicated event-loop fiber drives the OS readiness
//! multiplexer and the timer queue to wake them again.
//!
//! ## Architecture
//!
//! Everything is single-threaded. Each OS thread that wants fibers creates
//! its own [`Runtime`]; runtimes never share state, apart from an optional
//! [`WorkCounter`] that tells an outer scheduler whether any thread still
//! has sleeping fibers.
//!
//! - **Fibers**: stackful coroutines with generational [`FiberId`] handles
//! - **Scheduler**: FIFO ready queue, resumed by [`Runtime::run`]
//! - **Event loop**: system fiber created on first I/O or timer use
//! - **Timers**: deadline-ordered queue of sleeping fibers
//! - **Readiness table**: at most one waiting fiber per descriptor
//! - **Multiplexer**: [`MioPoller`] by default, replaceable through [`RuntimeBuilder`]
//!
//! ## Example
//!
//! ```no_run
//! use rustfiber_io::Runtime;
//!
//! let runtime = Runtime::new();
//! runtime
//!     .spawn(|ctx| {
//!         let late = ctx.delay(20);
//!         println!("slept 20ms, {late}ms overrun");
//!     })
//!     .unwrap();
//! runtime.run().unwrap();
//! ```

pub mod config;
pub mod context;
pub mod counter;
pub mod error;
pub mod fiber;
pub mod metrics;
pub mod poller;
pub mod runtime;
pub mod timer;

mod arena;
mod event_loop;
mod io_state;
mod readiness;
mod scheduler;

pub use config::FiberConfig;
pub use context::Context;
pub use counter::WorkCounter;
pub use error::{FiberError, Result};
pub use fiber::{FiberId, FiberKind, FiberStatus};
pub use metrics::MetricsSnapshot;
pub use poller::{Interest, MioPoller, Multiplexer, Readiness};
pub use runtime::{MultiplexerFactory, Runtime, RuntimeBuilder};

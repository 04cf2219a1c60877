//! Distributes a batch of independent jobs across worker processes over a local Unix socket and
//! collects their results.
//!
//! The controller side is a single-threaded `mio` reactor (`EventLoop`) with the job queue
//! (`Server`) layered on top. Each worker process runs a blocking `Worker` loop.
//!
//! ```no_run
//! use jobmux::{FunctionRegistry, ProcessLauncher, Server, Worker, WorkerOptions};
//!
//! # fn main() -> jobmux::errors::Result<()> {
//! // Controller
//! let launcher = ProcessLauncher::new("/usr/local/bin/my-app").arg("worker");
//! let mut server = Server::new(4, launcher)?;
//! for i in 0..30 {
//!     server.submit("reverse", format!("Job {}", i));
//! }
//! let results = server.run()?;
//! assert_eq!(results.len(), 30);
//!
//! // Inside `my-app worker <socket>`
//! let registry = FunctionRegistry::new()
//!     .register("reverse", |input| input.iter().rev().copied().collect());
//! Worker::connect("/tmp/socket", registry, WorkerOptions::default())?.run()?;
//! # Ok(())
//! # }
//! ```

pub mod distributed;
pub mod errors;
pub mod protocol;

pub use distributed::{
    dispatcher::{Server, ServerOptions},
    event_loop::{ConnectionId, Control, EventLoop, LoopOptions, Outbox},
    executor::{FunctionRegistry, JobExecutor},
    launcher::{ProcessLauncher, WorkerLauncher},
    worker::{Worker, WorkerOptions},
};
pub use protocol::{Message, MessageAssembler};

pub const CRATE_NAME: &str = "jobmux";

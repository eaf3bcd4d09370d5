//! Marten runtime core
//!
//! Gives an embedded script engine a Node-style surface (CommonJS `require`,
//! timers, streams) while all I/O and scheduling happen on a single-threaded
//! cooperative host loop.
//!
//! # Example
//!
//! ```ignore
//! use marten_runtime::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::builder(engine)
//!     .config(RuntimeConfig::with_root("/srv/app"))
//!     .build()?;
//! let local = tokio::task::LocalSet::new();
//! local.run_until(runtime.run_main("index.js".as_ref())).await?;
//! ```

pub mod args;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod guest;
pub mod host_loop;
pub mod modules;
pub mod runtime;
pub mod scheduler;
pub mod stream;

pub use args::ArgParser;
pub use config::{LoaderConfig, PackageAlias, RuntimeConfig};
pub use error::{GuestError, GuestResult, RuntimeError, RuntimeResult};
pub use events::{Emitter, EventRegistry};
pub use gate::{Gate, Wake};
pub use guest::{Guest, GuestValue, HostFunction, Job, JobExecutor, ValueKind};
pub use host_loop::{Cancellable, HostLoop};
pub use modules::{FsReader, MemoryReader, ModuleLoader, ModuleState, Resolved};
pub use runtime::{Runtime, RuntimeBuilder};
pub use scheduler::{JobScheduler, TimerKind};
pub use stream::{GuestSource, GuestStream, PushSink, ReadableAdapter, WritableAdapter};

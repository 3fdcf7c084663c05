//! wasi-pool - run sandboxed WASI guests as a prioritized worker pool
//!
//! Guest programs are ordinary `wasm32-wasip1` command modules. Each one runs
//! in its own wasmtime instance on its own thread, sees a virtual filesystem
//! through a preopened directory, and talks to the host over stdin/stdout
//! with line-delimited JSON-RPC.
//!
//! Layers, bottom up:
//! - [`vfs`]: descriptors, the in-memory tree and the cached native tree
//! - [`kernel`]: byte pipes, the suspension primitive and the syscall bridge
//! - [`pool`]: the priority job scheduler and its message-channel portal
//! - [`config`]: JSON configuration for all of the above

pub mod config;
pub mod kernel;
pub mod pool;
pub mod vfs;

pub use config::{ConfigError, GuestConfig, PoolConfig};
pub use pool::{JobError, JobRef, Pool, PoolPortal, StreamJob};

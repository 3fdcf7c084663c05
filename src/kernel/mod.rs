//! The kernel - guest execution and the plumbing around it
//!
//! - [`wasm`]: wasmtime host for WASI preview1 command modules
//! - [`pipe`]: byte pipes and line sinks used for guest stdio
//! - [`task`]: the [`task::Completion`] suspension primitive shared with the VFS

pub mod pipe;
pub mod task;
pub mod wasm;

pub use pipe::{BytePipe, LineSink, PipeError};
pub use task::Completion;

//! WASI Guest Runtime
//!
//! Runs `wasm32-wasip1` command modules inside wasmtime and services their
//! `wasi_snapshot_preview1` imports against host descriptors: byte pipes for
//! stdio and a preopened directory backed by the VFS.
//!
//! # ABI
//!
//! ## Required Exports
//!
//! | Export   | Type          | Description                      |
//! |----------|---------------|----------------------------------|
//! | `memory` | Memory        | Linear memory for data exchange  |
//! | `_start` | `() -> ()`    | Entry point; runs until exit     |
//!
//! Modules missing either are refused at load time.
//!
//! ## File Descriptors
//!
//! | fd | Purpose                                    |
//! |----|--------------------------------------------|
//! | 0  | stdin, fed by the host                     |
//! | 1  | stdout, read by the host                   |
//! | 2  | stderr, forwarded to the log line by line  |
//! | 3  | the preopened directory, if one is granted |
//!
//! Descriptors 0 to 2 cannot be closed. Descriptors from `path_open` take
//! the lowest free slot after them.
//!
//! ## Syscalls
//!
//! Every preview1 import is linked so any module instantiates. They fall in
//! three groups:
//!
//! | Group       | Behaviour                                             |
//! |-------------|-------------------------------------------------------|
//! | implemented | serviced against the fd table; may suspend the guest |
//! | refused     | answer `NOSYS` (links, renames, removal, set-times)   |
//! | trapping    | kill the instance (`poll_oneoff`, sockets, signals)   |
//!
//! `proc_exit` unwinds the guest with [`GuestExit`], reported as
//! [`ExitStatus::Exited`] rather than a trap.
//!
//! ## Suspension
//!
//! Host functions that may wait, such as a read on an empty stdin, are async
//! and run on the guest's wasmtime fiber. The guest resumes exactly where it
//! stopped once the descriptor completes; other instances keep running.
//!
//! ## Memory Safety
//!
//! Every pointer the guest passes is checked against its linear memory
//! through [`GuestMemory`] before any read or write. A bad pointer is a
//! [`GuestFault`] and traps only the offending instance.

pub mod abi;
pub mod error;
pub mod linker;
pub mod loader;
pub mod memory;
pub mod runtime;

pub use abi::*;
pub use error::*;
pub use linker::add_to_linker;
pub use loader::{GuestModule, GuestRoot, WasiLauncher};
pub use memory::GuestMemory;
pub use runtime::{errno, GuestState, GuestStateBuilder, SysError, SysResult};

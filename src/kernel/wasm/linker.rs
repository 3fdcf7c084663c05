//! `wasi_snapshot_preview1` import table
//!
//! Every preview1 import is registered so any WASI command module links.
//! Calls that can wait on a pipe or on host storage are registered as async
//! host functions and suspend the guest until their [`Completion`] resolves;
//! the rest run synchronously. Imports the host does not emulate either
//! return `ENOSYS` or, for the ones a well-behaved guest must never reach,
//! trap.
//!
//! [`Completion`]: crate::kernel::task::Completion

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use pin_project_lite::pin_project;
use wasmtime::{Caller, Linker, Memory};

use super::abi::{exports, Errno, WASI_MODULE};
use super::error::{GuestExit, GuestFault};
use super::memory::GuestMemory;
use super::runtime::{errno, GuestState, SysResult};

pin_project! {
    /// Logs how long a suspending syscall was parked
    struct Traced<F> {
        name: &'static str,
        enabled: bool,
        started: Instant,
        suspended: bool,
        #[pin]
        inner: F,
    }
}

impl<F> Traced<F> {
    fn new(name: &'static str, enabled: bool, inner: F) -> Self {
        Self {
            name,
            enabled,
            started: Instant::now(),
            suspended: false,
            inner,
        }
    }
}

impl<F: Future<Output = SysResult>> Future for Traced<F> {
    type Output = SysResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<SysResult> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(result) => {
                if *this.enabled && *this.suspended {
                    log::trace!(target: "wasi", "{} resumed after {:?}", this.name, this.started.elapsed());
                }
                Poll::Ready(result)
            }
            Poll::Pending => {
                *this.suspended = true;
                Poll::Pending
            }
        }
    }
}

fn guest_memory(caller: &mut Caller<'_, GuestState>) -> anyhow::Result<Memory> {
    caller
        .get_export(exports::MEMORY)
        .and_then(|export| export.into_memory())
        .ok_or_else(|| anyhow::Error::new(GuestFault::MissingMemory))
}

/// Turn a syscall result into the guest return code, or a trap
fn finish(name: &str, trace: bool, result: SysResult) -> anyhow::Result<i32> {
    match errno(result) {
        Ok(code) => {
            if trace {
                log::trace!(target: "wasi", "{} -> {}", name, code);
            }
            Ok(code.raw())
        }
        Err(fault) => {
            log::error!("{} faulted: {}", name, fault);
            Err(anyhow::Error::new(fault))
        }
    }
}

/// Run a syscall that only needs the guest state
fn with_state<F>(caller: &mut Caller<'_, GuestState>, name: &'static str, call: F) -> anyhow::Result<i32>
where
    F: FnOnce(&mut GuestState) -> SysResult,
{
    let state = caller.data_mut();
    let result = call(&mut *state);
    finish(name, state.trace_enabled(), result)
}

/// Run a non-suspending syscall against guest memory
fn with_memory<F>(caller: &mut Caller<'_, GuestState>, name: &'static str, call: F) -> anyhow::Result<i32>
where
    F: FnOnce(&mut GuestState, &mut GuestMemory<'_>) -> SysResult,
{
    let memory = guest_memory(caller)?;
    let (bytes, state) = memory.data_and_store_mut(&mut *caller);
    let mut mem = GuestMemory::new(bytes);
    let result = call(&mut *state, &mut mem);
    finish(name, state.trace_enabled(), result)
}

/// Register a suspending syscall; `$call` is awaited with guest memory held
macro_rules! suspending {
    ($caller:ident, $name:expr, |$state:ident, $mem:ident| $call:expr) => {
        Box::new(async move {
            let memory = guest_memory(&mut $caller)?;
            let (bytes, $state) = memory.data_and_store_mut(&mut $caller);
            let trace = $state.trace_enabled();
            let mut backing = GuestMemory::new(bytes);
            let $mem = &mut backing;
            let result = Traced::new($name, trace, $call).await;
            finish($name, trace, result)
        })
    };
}

/// Register imports that answer `ENOSYS`
macro_rules! nosys {
    ($linker:ident, $($name:literal ($($ty:ty),*)),+ $(,)?) => {
        $(
            $linker.func_wrap(
                WASI_MODULE,
                $name,
                |_: Caller<'_, GuestState>, $(_: $ty),*| -> anyhow::Result<i32> {
                    log::warn!("guest called {}, not implemented", $name);
                    Ok(Errno::Nosys.raw())
                },
            )?;
        )+
    };
}

/// Register imports that trap the guest
macro_rules! trapping {
    ($linker:ident, $($name:literal ($($ty:ty),*)),+ $(,)?) => {
        $(
            $linker.func_wrap(
                WASI_MODULE,
                $name,
                |caller: Caller<'_, GuestState>, $(_: $ty),*| -> anyhow::Result<i32> {
                    finish($name, false, caller.data().unsupported($name))
                },
            )?;
        )+
    };
}

/// Register every `wasi_snapshot_preview1` import
pub fn add_to_linker(linker: &mut Linker<GuestState>) -> anyhow::Result<()> {
    // ========================================================================
    // Arguments, environment, clocks
    // ========================================================================

    linker.func_wrap(WASI_MODULE, "args_sizes_get", |mut caller: Caller<'_, GuestState>, argc: i32, size: i32| {
        with_memory(&mut caller, "args_sizes_get", |state, mem| {
            state.args_sizes_get(mem, argc as u32, size as u32)
        })
    })?;
    linker.func_wrap(WASI_MODULE, "args_get", |mut caller: Caller<'_, GuestState>, argv: i32, buf: i32| {
        with_memory(&mut caller, "args_get", |state, mem| state.args_get(mem, argv as u32, buf as u32))
    })?;
    linker.func_wrap(WASI_MODULE, "environ_sizes_get", |mut caller: Caller<'_, GuestState>, count: i32, size: i32| {
        with_memory(&mut caller, "environ_sizes_get", |state, mem| {
            state.environ_sizes_get(mem, count as u32, size as u32)
        })
    })?;
    linker.func_wrap(WASI_MODULE, "environ_get", |mut caller: Caller<'_, GuestState>, env: i32, buf: i32| {
        with_memory(&mut caller, "environ_get", |state, mem| state.environ_get(mem, env as u32, buf as u32))
    })?;
    linker.func_wrap(WASI_MODULE, "clock_res_get", |mut caller: Caller<'_, GuestState>, id: i32, res: i32| {
        with_memory(&mut caller, "clock_res_get", |state, mem| state.clock_res_get(mem, id as u32, res as u32))
    })?;
    linker.func_wrap(
        WASI_MODULE,
        "clock_time_get",
        |mut caller: Caller<'_, GuestState>, id: i32, precision: i64, time: i32| {
            with_memory(&mut caller, "clock_time_get", |state, mem| {
                state.clock_time_get(mem, id as u32, precision as u64, time as u32)
            })
        },
    )?;
    linker.func_wrap(WASI_MODULE, "random_get", |mut caller: Caller<'_, GuestState>, buf: i32, len: i32| {
        with_memory(&mut caller, "random_get", |state, mem| state.random_get(mem, buf as u32, len as u32))
    })?;

    // ========================================================================
    // Descriptors
    // ========================================================================

    linker.func_wrap(WASI_MODULE, "fd_close", |mut caller: Caller<'_, GuestState>, fd: i32| {
        with_state(&mut caller, "fd_close", |state| state.fd_close(fd as u32))
    })?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_advise",
        |mut caller: Caller<'_, GuestState>, fd: i32, offset: i64, len: i64, advice: i32| {
            with_state(&mut caller, "fd_advise", |state| {
                state.fd_advise(fd as u32, offset as u64, len as u64, advice as u8)
            })
        },
    )?;
    linker.func_wrap(WASI_MODULE, "fd_fdstat_get", |mut caller: Caller<'_, GuestState>, fd: i32, stat: i32| {
        with_memory(&mut caller, "fd_fdstat_get", |state, mem| state.fd_fdstat_get(mem, fd as u32, stat as u32))
    })?;
    linker.func_wrap(WASI_MODULE, "fd_fdstat_set_flags", |mut caller: Caller<'_, GuestState>, fd: i32, flags: i32| {
        with_state(&mut caller, "fd_fdstat_set_flags", |state| {
            state.fd_fdstat_set_flags(fd as u32, flags as u16)
        })
    })?;
    linker.func_wrap(WASI_MODULE, "fd_filestat_get", |mut caller: Caller<'_, GuestState>, fd: i32, stat: i32| {
        with_memory(&mut caller, "fd_filestat_get", |state, mem| {
            state.fd_filestat_get(mem, fd as u32, stat as u32)
        })
    })?;
    linker.func_wrap(WASI_MODULE, "fd_prestat_get", |mut caller: Caller<'_, GuestState>, fd: i32, prestat: i32| {
        with_memory(&mut caller, "fd_prestat_get", |state, mem| {
            state.fd_prestat_get(mem, fd as u32, prestat as u32)
        })
    })?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_prestat_dir_name",
        |mut caller: Caller<'_, GuestState>, fd: i32, path: i32, len: i32| {
            with_memory(&mut caller, "fd_prestat_dir_name", |state, mem| {
                state.fd_prestat_dir_name(mem, fd as u32, path as u32, len as u32)
            })
        },
    )?;
    linker.func_wrap_async(
        WASI_MODULE,
        "fd_read",
        |mut caller: Caller<'_, GuestState>, (fd, iovs, iovs_len, nread): (i32, i32, i32, i32)| {
            suspending!(caller, "fd_read", |state, mem| state.fd_read(
                mem,
                fd as u32,
                iovs as u32,
                iovs_len as u32,
                nread as u32
            ))
        },
    )?;
    linker.func_wrap_async(
        WASI_MODULE,
        "fd_pread",
        |mut caller: Caller<'_, GuestState>, (fd, iovs, iovs_len, offset, nread): (i32, i32, i32, i64, i32)| {
            suspending!(caller, "fd_pread", |state, mem| state.fd_pread(
                mem,
                fd as u32,
                iovs as u32,
                iovs_len as u32,
                offset as u64,
                nread as u32
            ))
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_write",
        |mut caller: Caller<'_, GuestState>, fd: i32, iovs: i32, iovs_len: i32, nwritten: i32| {
            with_memory(&mut caller, "fd_write", |state, mem| {
                state.fd_write(mem, fd as u32, iovs as u32, iovs_len as u32, nwritten as u32)
            })
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_pwrite",
        |mut caller: Caller<'_, GuestState>, fd: i32, iovs: i32, iovs_len: i32, offset: i64, nwritten: i32| {
            with_memory(&mut caller, "fd_pwrite", |state, mem| {
                state.fd_pwrite(mem, fd as u32, iovs as u32, iovs_len as u32, offset as u64, nwritten as u32)
            })
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_seek",
        |mut caller: Caller<'_, GuestState>, fd: i32, offset: i64, whence: i32, newoffset: i32| {
            with_memory(&mut caller, "fd_seek", |state, mem| {
                state.fd_seek(mem, fd as u32, offset, whence as u8, newoffset as u32)
            })
        },
    )?;
    linker.func_wrap(WASI_MODULE, "fd_tell", |mut caller: Caller<'_, GuestState>, fd: i32, offset: i32| {
        with_memory(&mut caller, "fd_tell", |state, mem| state.fd_tell(mem, fd as u32, offset as u32))
    })?;
    linker.func_wrap(WASI_MODULE, "fd_sync", |mut caller: Caller<'_, GuestState>, fd: i32| {
        with_state(&mut caller, "fd_sync", |state| state.fd_sync(fd as u32))
    })?;
    linker.func_wrap(WASI_MODULE, "fd_datasync", |mut caller: Caller<'_, GuestState>, fd: i32| {
        with_state(&mut caller, "fd_datasync", |state| state.fd_sync(fd as u32))
    })?;
    linker.func_wrap_async(
        WASI_MODULE,
        "fd_readdir",
        |mut caller: Caller<'_, GuestState>, (fd, buf, buf_len, cookie, bufused): (i32, i32, i32, i64, i32)| {
            suspending!(caller, "fd_readdir", |state, mem| state.fd_readdir(
                mem,
                fd as u32,
                buf as u32,
                buf_len as u32,
                cookie as u64,
                bufused as u32
            ))
        },
    )?;

    // ========================================================================
    // Paths
    // ========================================================================

    linker.func_wrap(
        WASI_MODULE,
        "path_create_directory",
        |mut caller: Caller<'_, GuestState>, fd: i32, path: i32, path_len: i32| {
            with_memory(&mut caller, "path_create_directory", |state, mem| {
                state.path_create_directory(mem, fd as u32, path as u32, path_len as u32)
            })
        },
    )?;
    linker.func_wrap_async(
        WASI_MODULE,
        "path_filestat_get",
        |mut caller: Caller<'_, GuestState>, (fd, flags, path, path_len, stat): (i32, i32, i32, i32, i32)| {
            suspending!(caller, "path_filestat_get", |state, mem| state.path_filestat_get(
                mem,
                fd as u32,
                flags as u32,
                path as u32,
                path_len as u32,
                stat as u32
            ))
        },
    )?;
    linker.func_wrap_async(
        WASI_MODULE,
        "path_open",
        |mut caller: Caller<'_, GuestState>,
         (fd, dirflags, path, path_len, oflags, rights_base, rights_inheriting, fdflags, opened): (
            i32,
            i32,
            i32,
            i32,
            i32,
            i64,
            i64,
            i32,
            i32,
        )| {
            suspending!(caller, "path_open", |state, mem| state.path_open(
                mem,
                fd as u32,
                dirflags as u32,
                path as u32,
                path_len as u32,
                oflags as u16,
                rights_base as u64,
                rights_inheriting as u64,
                fdflags as u16,
                opened as u32
            ))
        },
    )?;

    // ========================================================================
    // Process
    // ========================================================================

    linker.func_wrap(WASI_MODULE, "sched_yield", |mut caller: Caller<'_, GuestState>| {
        with_state(&mut caller, "sched_yield", |state| state.sched_yield())
    })?;
    linker.func_wrap(
        WASI_MODULE,
        "proc_exit",
        |caller: Caller<'_, GuestState>, code: i32| -> anyhow::Result<()> {
            if caller.data().trace_enabled() {
                log::trace!(target: "wasi", "proc_exit({})", code);
            }
            Err(anyhow::Error::new(GuestExit(code)))
        },
    )?;

    nosys!(
        linker,
        "fd_allocate"(i32, i64, i64),
        "fd_fdstat_set_rights"(i32, i64, i64),
        "fd_filestat_set_size"(i32, i64),
        "fd_filestat_set_times"(i32, i64, i64, i32),
        "fd_renumber"(i32, i32),
        "path_filestat_set_times"(i32, i32, i32, i32, i64, i64, i32),
        "path_link"(i32, i32, i32, i32, i32, i32, i32),
        "path_readlink"(i32, i32, i32, i32, i32, i32),
        "path_remove_directory"(i32, i32, i32),
        "path_rename"(i32, i32, i32, i32, i32, i32),
        "path_symlink"(i32, i32, i32, i32, i32),
        "path_unlink_file"(i32, i32, i32),
    );

    trapping!(
        linker,
        "poll_oneoff"(i32, i32, i32, i32),
        "proc_raise"(i32),
        "sock_accept"(i32, i32, i32),
        "sock_recv"(i32, i32, i32, i32, i32, i32),
        "sock_send"(i32, i32, i32, i32, i32),
        "sock_shutdown"(i32, i32),
    );

    Ok(())
}

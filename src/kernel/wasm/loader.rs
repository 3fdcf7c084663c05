//! Guest module loading and instance launching
//!
//! A [`GuestModule`] is compiled and linked once; every instance after that
//! is a cheap instantiation of the same [`InstancePre`]. [`WasiLauncher`]
//! runs each instance on its own thread, wires its stdio to byte pipes and
//! grants it the configured root directory.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use futures::channel::oneshot;
use futures::future::{self, Either, FutureExt};
use wasmtime::{Config, Engine, InstancePre, Linker, Module, Store, UpdateDeadline};

use super::abi::exports;
use super::error::{ExitStatus, GuestExit, HostError, HostResult};
use super::linker::add_to_linker;
use super::runtime::GuestState;
use crate::config::GuestConfig;
use crate::kernel::pipe::{BytePipe, LineSink};
use crate::pool::{GuestInstance, GuestLauncher};
use crate::vfs::{Descriptor, MemoryFs, NativeFs};

/// Raised from the epoch callback once an instance is disposed
#[derive(Debug, thiserror::Error)]
#[error("instance disposed")]
struct Disposed;

/// A compiled, linked guest program
#[derive(Clone)]
pub struct GuestModule {
    engine: Engine,
    pre: InstancePre<GuestState>,
}

impl GuestModule {
    /// Compile a module from `.wasm` bytes or WAT text
    pub fn from_bytes(bytes: &[u8]) -> HostResult<Self> {
        let mut config = Config::new();
        config.async_support(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|e| HostError::Engine {
            reason: format!("{:#}", e),
        })?;

        let module = Module::new(&engine, bytes).map_err(|e| HostError::InvalidModule {
            reason: format!("{:#}", e),
        })?;
        if module.get_export(exports::MEMORY).is_none() {
            return Err(HostError::MissingExport { name: exports::MEMORY });
        }
        if module.get_export(exports::START).is_none() {
            return Err(HostError::MissingExport { name: exports::START });
        }

        let mut linker = Linker::new(&engine);
        add_to_linker(&mut linker).map_err(|e| HostError::Engine {
            reason: format!("{:#}", e),
        })?;
        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| HostError::InstantiationFailed {
                reason: format!("{:#}", e),
            })?;

        Ok(Self { engine, pre })
    }

    pub fn from_file(path: impl AsRef<Path>) -> HostResult<Self> {
        let bytes = fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run `_start` to completion.
    ///
    /// Returns early with [`ExitStatus::Disposed`] when `stop` fires or
    /// `killed` is set and the engine epoch moves.
    pub async fn run(
        &self,
        state: GuestState,
        killed: Arc<AtomicBool>,
        stop: oneshot::Receiver<()>,
    ) -> ExitStatus {
        let mut store = Store::new(&self.engine, state);
        store.set_epoch_deadline(1);
        // Deadline is relative to the epoch now; a kill before this point
        // would never be seen
        if killed.load(Ordering::SeqCst) {
            return ExitStatus::Disposed;
        }
        let flag = killed.clone();
        store.epoch_deadline_callback(move |_| {
            if flag.load(Ordering::SeqCst) {
                Err(anyhow::Error::new(Disposed))
            } else {
                Ok(UpdateDeadline::Continue(1))
            }
        });

        let pre = self.pre.clone();
        let call = async move {
            let instance = pre.instantiate_async(&mut store).await?;
            let start = instance.get_typed_func::<(), ()>(&mut store, exports::START)?;
            start.call_async(&mut store, ()).await
        };

        let result = match future::select(call.boxed(), stop).await {
            Either::Left((result, _)) => result,
            Either::Right(_) => return ExitStatus::Disposed,
        };
        if killed.load(Ordering::SeqCst) {
            // Whatever the guest did after disposal does not count
            return ExitStatus::Disposed;
        }

        match result {
            Ok(()) => ExitStatus::Exited(0),
            Err(err) => {
                if let Some(GuestExit(code)) = err.downcast_ref::<GuestExit>() {
                    ExitStatus::Exited(*code)
                } else if err.downcast_ref::<Disposed>().is_some() {
                    ExitStatus::Disposed
                } else {
                    ExitStatus::Trapped(format!("{:#}", err))
                }
            }
        }
    }
}

/// The directory every guest of a launcher is granted
#[derive(Clone)]
pub enum GuestRoot {
    Native(NativeFs),
    Memory(MemoryFs),
    /// Unpacked archive; its files are read-only
    Zip(MemoryFs),
}

impl GuestRoot {
    /// Unpack an archive once; every instance shares the tree
    pub fn zip(bytes: &[u8]) -> HostResult<Self> {
        Ok(GuestRoot::Zip(MemoryFs::from_zip(bytes)?))
    }

    fn descriptor(&self) -> Box<dyn Descriptor> {
        match self {
            GuestRoot::Native(fs) => fs.descriptor(),
            GuestRoot::Memory(fs) | GuestRoot::Zip(fs) => fs.descriptor(),
        }
    }
}

/// Launches wasmtime-backed guest instances, one thread each
pub struct WasiLauncher {
    module: GuestModule,
    guest: GuestConfig,
    root: Option<GuestRoot>,
    launched: AtomicU64,
}

impl WasiLauncher {
    pub fn new(module: GuestModule, guest: GuestConfig) -> Self {
        Self {
            module,
            guest,
            root: None,
            launched: AtomicU64::new(0),
        }
    }

    /// Grant `root` to every instance as its preopened directory
    pub fn with_root(mut self, root: GuestRoot) -> Self {
        self.root = Some(root);
        self
    }

    fn state(&self, stdin: &BytePipe, stdout: &BytePipe) -> GuestState {
        let mut builder = GuestState::builder()
            .program_name(&self.guest.program_name)
            .args(&self.guest.args)
            .stdin(Box::new(stdin.clone()))
            .stdout(Box::new(stdout.clone()))
            .stderr(Box::new(LineSink::new(self.guest.program_name.as_str())))
            .trace(self.guest.trace_syscalls);
        for (name, value) in &self.guest.env {
            builder = builder.env(name, value);
        }
        if let Some(root) = &self.root {
            builder = builder.preopen(&self.guest.preopen_name, root.descriptor());
        }
        builder.build()
    }
}

impl GuestLauncher for WasiLauncher {
    fn launch(&self) -> Result<GuestInstance, HostError> {
        let serial = self.launched.fetch_add(1, Ordering::Relaxed);
        let stdin = BytePipe::new();
        let stdout = if self.guest.capture_stdout {
            BytePipe::capturing()
        } else {
            BytePipe::new()
        };
        let state = self.state(&stdin, &stdout);

        let killed = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let module = self.module.clone();
        let guest_stdout = stdout.clone();
        let guest_killed = killed.clone();
        thread::Builder::new()
            .name(format!("guest-{}", serial))
            .spawn(move || {
                let status = futures::executor::block_on(module.run(state, guest_killed, stop_rx));
                log::debug!("guest-{} {}", serial, status);
                guest_stdout.close();
                let _ = exit_tx.send(status);
            })?;

        let engine = self.module.engine().clone();
        let guest_stdin = stdin.clone();
        let disposer = Box::new(move || {
            killed.store(true, Ordering::SeqCst);
            engine.increment_epoch();
            guest_stdin.close();
            let _ = stop_tx.send(());
        });

        Ok(GuestInstance::new(stdin, stdout, exit_rx, disposer))
    }
}

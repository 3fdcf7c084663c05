//! Worker slots and the guest launcher seam
//!
//! A [`GuestLauncher`] starts one guest instance and hands back its pipes,
//! an exit notification and a way to tear it down. The pool never looks
//! behind that seam, so tests can drive it with scripted guests.

use futures::channel::oneshot;

use super::job::JobId;
use crate::kernel::pipe::BytePipe;
use crate::kernel::wasm::{ExitStatus, HostError};

/// Starts guest instances for a pool
pub trait GuestLauncher {
    fn launch(&self) -> Result<GuestInstance, HostError>;
}

/// Tears an instance down; must not block
pub type Disposer = Box<dyn FnOnce()>;

/// One running guest, seen from the host
pub struct GuestInstance {
    /// Requests go here
    pub stdin: BytePipe,
    /// Bootstrap line, responses and stream messages come from here
    pub stdout: BytePipe,
    exit: Option<oneshot::Receiver<ExitStatus>>,
    disposer: Option<Disposer>,
}

impl GuestInstance {
    pub fn new(
        stdin: BytePipe,
        stdout: BytePipe,
        exit: oneshot::Receiver<ExitStatus>,
        disposer: Disposer,
    ) -> Self {
        Self {
            stdin,
            stdout,
            exit: Some(exit),
            disposer: Some(disposer),
        }
    }

    /// Notification that fires once the guest stops running; taken once
    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<ExitStatus>> {
        self.exit.take()
    }

    /// Stop the instance and close both pipes; later calls do nothing
    pub fn dispose(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
        self.stdin.close();
        self.stdout.close();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposer.is_none()
    }
}

impl Drop for GuestInstance {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Slot identifier, unique within one pool
pub type SlotId = u64;

/// Lifecycle of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Waiting for the bootstrap line
    Provisioning,
    /// Accepting jobs
    Ready,
    /// Disposed; about to leave the slot list
    Retired,
}

/// One pool-managed guest instance and its bookkeeping
pub struct WorkerSlot {
    pub id: SlotId,
    pub state: SlotState,
    pub instance: GuestInstance,
    /// Job bound to this slot, if any
    pub active: Option<JobId>,
}

impl WorkerSlot {
    pub fn new(id: SlotId, instance: GuestInstance) -> Self {
        Self {
            id,
            state: SlotState::Provisioning,
            instance,
            active: None,
        }
    }

    /// Busy exactly when a job is bound
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Ready && self.active.is_none()
    }

    /// Dispose the instance and take the slot out of service
    pub fn retire(&mut self) {
        self.state = SlotState::Retired;
        self.instance.dispose();
    }
}

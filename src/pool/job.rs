//! Jobs and the handles callers hold on them
//!
//! A submitted job is either a [`JobKind::Command`], answered by exactly one
//! final message, or a [`JobKind::Stream`], which may also deliver any number
//! of intermediate messages first. Whoever submitted it gets a [`JobRef`]:
//! a future that resolves exactly once, plus priority and cancel controls.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Job identifier, unique within the pool or portal that issued it
pub type JobId = u64;

/// Scheduling priority; higher runs first and `0` parks the job
pub type Priority = u32;

/// Priority at which a job is never dispatched
pub const PARKED: Priority = 0;

/// Why a job did not produce a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    /// The caller cancelled it
    #[error("job cancelled")]
    Cancelled,

    /// The guest answered with an error envelope
    #[error("guest error: {message}")]
    Guest { message: String },

    /// The guest broke the line protocol
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// The instance running the job crashed or exited
    #[error("guest instance failed: {reason}")]
    InstanceFailed { reason: String },

    /// The pool or portal shut down first
    #[error("pool closed")]
    PoolClosed,
}

impl JobError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

pub type JobResult = Result<Value, JobError>;

/// Receives intermediate messages of a streaming job
pub type DataCallback = Rc<RefCell<dyn FnMut(Value)>>;

/// Wrap a closure as a [`DataCallback`]
pub fn on_data<F: FnMut(Value) + 'static>(f: F) -> DataCallback {
    Rc::new(RefCell::new(f))
}

pub enum JobKind {
    Command,
    Stream { on_data: DataCallback },
}

impl std::fmt::Debug for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Command => write!(f, "Command"),
            JobKind::Stream { .. } => write!(f, "Stream"),
        }
    }
}

/// Arguments of a streaming submission
pub struct StreamJob {
    pub method: String,
    pub params: Value,
    pub priority: Priority,
    pub on_data: DataCallback,
}

impl StreamJob {
    pub fn new<F>(method: &str, params: Value, priority: Priority, on_data_fn: F) -> Self
    where
        F: FnMut(Value) + 'static,
    {
        Self {
            method: method.to_string(),
            params,
            priority,
            on_data: on_data(on_data_fn),
        }
    }
}

/// A job as the pool keeps it, queued or bound to a slot
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub priority: Priority,
    pub method: String,
    pub params: Value,
    pub kind: JobKind,
    done: oneshot::Sender<JobResult>,
}

impl Job {
    pub fn new(
        id: JobId,
        priority: Priority,
        method: String,
        params: Value,
        kind: JobKind,
    ) -> (Self, oneshot::Receiver<JobResult>) {
        let (done, receiver) = oneshot::channel();
        let job = Self {
            id,
            priority,
            method,
            params,
            kind,
            done,
        };
        (job, receiver)
    }

    pub fn is_parked(&self) -> bool {
        self.priority == PARKED
    }

    /// Callback for intermediate messages, if this is a stream job
    pub fn data_callback(&self) -> Option<DataCallback> {
        match &self.kind {
            JobKind::Stream { on_data } => Some(on_data.clone()),
            JobKind::Command => None,
        }
    }

    /// Deliver the single terminal outcome
    pub fn finish(self, result: JobResult) {
        if let Err(err) = &result {
            log::debug!("job {} ({}) failed: {}", self.id, self.method, err);
        }
        // The submitter may have dropped its JobRef
        let _ = self.done.send(result);
    }
}

/// Implemented by whatever owns job bookkeeping (pool or portal)
pub trait JobControl {
    fn set_priority(self: Rc<Self>, id: JobId, priority: Priority);
    fn cancel(self: Rc<Self>, id: JobId);
}

/// Priority and cancel controls for one job, detached from its result
#[derive(Clone)]
pub struct JobHandle {
    id: JobId,
    control: Weak<dyn JobControl>,
}

impl JobHandle {
    pub fn new(id: JobId, control: Weak<dyn JobControl>) -> Self {
        Self { id, control }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Reprioritize wherever the job currently is; `0` parks it
    pub fn set_priority(&self, priority: Priority) {
        if let Some(control) = self.control.upgrade() {
            control.set_priority(self.id, priority);
        }
    }

    /// Cancel the job; a no-op once it has finished
    pub fn cancel(&self) {
        if let Some(control) = self.control.upgrade() {
            control.cancel(self.id);
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.id).finish()
    }
}

/// A submitted job: await it for the outcome
#[derive(Debug)]
pub struct JobRef {
    handle: JobHandle,
    receiver: oneshot::Receiver<JobResult>,
}

impl JobRef {
    pub fn new(handle: JobHandle, receiver: oneshot::Receiver<JobResult>) -> Self {
        Self { handle, receiver }
    }

    /// A job that was refused at submission
    pub fn rejected(id: JobId, error: JobError) -> Self {
        let (tx, receiver) = oneshot::channel();
        let _ = tx.send(Err(error));
        let control: Weak<dyn JobControl> = Weak::<Detached>::new();
        Self::new(JobHandle::new(id, control), receiver)
    }

    pub fn id(&self) -> JobId {
        self.handle.id
    }

    pub fn handle(&self) -> JobHandle {
        self.handle.clone()
    }

    pub fn set_priority(&self, priority: Priority) {
        self.handle.set_priority(priority);
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl Future for JobRef {
    type Output = JobResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<JobResult> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Bookkeeping dropped without an answer
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(JobError::PoolClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Control for jobs that never reached a pool
struct Detached;

impl JobControl for Detached {
    fn set_priority(self: Rc<Self>, _id: JobId, _priority: Priority) {}
    fn cancel(self: Rc<Self>, _id: JobId) {}
}

//! Priority job pool over guest instances
//!
//! A [`Pool`] keeps a fixed number of worker slots, each one guest instance
//! speaking the line protocol in [`protocol`]. Submitted jobs wait in a
//! priority queue; dispatch passes bind them to idle slots.
//!
//! # Scheduling
//!
//! A dispatch pass is scheduled after every enqueue, completion, priority
//! change and worker addition. Requests made before a pass runs coalesce into
//! it, so jobs submitted together are dispatched together, highest priority
//! first with ties in submission order. A job at priority `0` is parked: it
//! stays queued until reprioritized.
//!
//! # Cancellation
//!
//! A queued job is simply removed. A running guest cannot be interrupted, so
//! cancelling an active job disposes its whole instance and provisions a
//! replacement, which takes jobs once its bootstrap line arrives. Guest
//! crashes and protocol violations recover the same way.
//!
//! All state lives on one thread behind `Rc<RefCell<_>>` and is driven by a
//! [`LocalSpawner`]; guest instances run elsewhere and talk through pipes.

pub mod channel;
pub mod job;
pub mod portal;
pub mod protocol;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{message_channel, MessagePort, PoolResponse, PoolTask, TaskSpec};
pub use job::{
    on_data, DataCallback, Job, JobControl, JobError, JobHandle, JobId, JobKind, JobRef, JobResult,
    Priority, StreamJob, PARKED,
};
pub use portal::PoolPortal;
pub use worker::{Disposer, GuestInstance, GuestLauncher, SlotId, SlotState, WorkerSlot};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use futures::channel::oneshot;
use futures::executor::LocalSpawner;
use futures::task::LocalSpawnExt;
use serde::Serialize;
use serde_json::Value;

use crate::config::PoolConfig;
use crate::kernel::pipe::BytePipe;
use crate::kernel::wasm::{ExitStatus, GuestModule, GuestRoot, HostResult, WasiLauncher};
use crate::vfs::NativeFs;
use protocol::GuestMessage;

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    /// Slots in service, provisioning included
    pub total: usize,
    pub ready: usize,
    pub idle: usize,
    pub busy: usize,
    pub queued: usize,
    pub provisioning: usize,
    pub open_ports: usize,
}

struct PoolState {
    /// Pending jobs; sorted at the start of each dispatch pass
    queue: Vec<Job>,
    slots: Vec<WorkerSlot>,
    /// Jobs bound to a slot
    active: HashMap<JobId, Job>,
    next_job: JobId,
    next_slot: SlotId,
    max_concurrency: usize,
    dispatch_scheduled: bool,
    closed: bool,
    open_ports: usize,
}

impl PoolState {
    fn slot_mut(&mut self, id: SlotId) -> Option<&mut WorkerSlot> {
        self.slots.iter_mut().find(|slot| slot.id == id)
    }

    fn live_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state != SlotState::Retired)
            .count()
    }

    fn take_slot(&mut self, id: SlotId) -> Option<WorkerSlot> {
        let index = self.slots.iter().position(|slot| slot.id == id)?;
        Some(self.slots.remove(index))
    }
}

struct Shared {
    state: RefCell<PoolState>,
    launcher: Box<dyn GuestLauncher>,
    spawner: LocalSpawner,
}

/// Handle on a job pool; clones share the pool
#[derive(Clone)]
pub struct Pool {
    shared: Rc<Shared>,
}

impl Pool {
    /// Create a pool and start provisioning `max_concurrency` slots
    pub fn new(launcher: impl GuestLauncher + 'static, max_concurrency: usize, spawner: LocalSpawner) -> Self {
        let shared = Rc::new(Shared {
            state: RefCell::new(PoolState {
                queue: Vec::new(),
                slots: Vec::new(),
                active: HashMap::new(),
                next_job: 1,
                next_slot: 1,
                max_concurrency,
                dispatch_scheduled: false,
                closed: false,
                open_ports: 0,
            }),
            launcher: Box::new(launcher),
            spawner,
        });
        for _ in 0..max_concurrency {
            shared.add_worker();
        }
        Self { shared }
    }

    /// Build a pool of wasmtime guests from a config
    pub fn from_config(config: &PoolConfig, spawner: LocalSpawner) -> HostResult<Self> {
        let module = GuestModule::from_file(&config.module)?;
        let mut launcher = WasiLauncher::new(module, config.guest.clone());
        if let Some(root) = &config.root {
            let native = NativeFs::open(root)?;
            if let Some(includes) = &config.hydrate {
                match native.hydrate(includes) {
                    Ok(count) => log::debug!("hydrated {} entries under {}", count, root.display()),
                    Err(errno) => log::warn!("hydrating {} failed: {}", root.display(), errno),
                }
            }
            launcher = launcher.with_root(GuestRoot::Native(native));
        } else if let Some(archive) = &config.zip {
            let bytes = std::fs::read(archive)?;
            launcher = launcher.with_root(GuestRoot::zip(&bytes)?);
            log::debug!("serving {} as the guest root", archive.display());
        }
        Ok(Self::new(launcher, config.max_concurrency, spawner))
    }

    /// Submit a command job: one request, one final answer
    pub fn submit(&self, method: &str, params: Value, priority: Priority) -> JobRef {
        self.shared.enqueue(method.to_string(), params, priority, JobKind::Command)
    }

    /// Submit a streaming job; `on_data` sees every intermediate message
    pub fn submit_streaming(&self, job: StreamJob) -> JobRef {
        self.shared.enqueue(
            job.method,
            job.params,
            job.priority,
            JobKind::Stream { on_data: job.on_data },
        )
    }

    /// Provision one more slot; it takes jobs once ready
    pub fn add_worker(&self) -> bool {
        self.shared.add_worker()
    }

    /// Grow or shrink the pool. Busy slots beyond the new size retire when
    /// their job finishes.
    pub fn set_max_concurrency(&self, n: usize) {
        self.shared.set_max_concurrency(n);
    }

    pub fn max_concurrency(&self) -> usize {
        self.shared.state.borrow().max_concurrency
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.shared.metrics()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.borrow().closed
    }

    /// Reject every queued and active job and dispose all instances
    pub fn close(&self) {
        self.shared.close();
    }

    /// Serve a [`PoolPortal`] on the other end of `port`
    pub fn serve_port(&self, port: MessagePort) {
        let server = portal::serve(self.clone(), port);
        if let Err(err) = self.shared.spawner.spawn_local(server) {
            log::error!("failed to serve portal: {}", err);
        }
    }

    pub(crate) fn spawner(&self) -> &LocalSpawner {
        &self.shared.spawner
    }

    pub(crate) fn port_opened(&self) {
        self.shared.state.borrow_mut().open_ports += 1;
    }

    pub(crate) fn port_closed(&self) {
        let mut state = self.shared.state.borrow_mut();
        state.open_ports = state.open_ports.saturating_sub(1);
    }
}

impl Shared {
    fn control(self: &Rc<Self>) -> Weak<dyn JobControl> {
        let weak: Weak<Shared> = Rc::downgrade(self);
        weak
    }

    fn spawn<F>(&self, what: &str, task: F)
    where
        F: std::future::Future<Output = ()> + 'static,
    {
        if let Err(err) = self.spawner.spawn_local(task) {
            log::error!("failed to spawn {}: {}", what, err);
        }
    }

    fn enqueue(self: &Rc<Self>, method: String, params: Value, priority: Priority, kind: JobKind) -> JobRef {
        let mut state = self.state.borrow_mut();
        let id = state.next_job;
        state.next_job += 1;
        if state.closed {
            return JobRef::rejected(id, JobError::PoolClosed);
        }

        log::debug!("job {} queued: {} at priority {}", id, method, priority);
        let (job, receiver) = Job::new(id, priority, method, params, kind);
        state.queue.push(job);
        drop(state);

        self.schedule_dispatch();
        JobRef::new(JobHandle::new(id, self.control()), receiver)
    }

    fn schedule_dispatch(self: &Rc<Self>) {
        {
            let mut state = self.state.borrow_mut();
            if state.dispatch_scheduled || state.closed {
                return;
            }
            state.dispatch_scheduled = true;
        }
        let shared = self.clone();
        self.spawn("dispatch pass", async move { shared.dispatch() });
    }

    /// One dispatch pass
    fn dispatch(self: &Rc<Self>) {
        let mut started: Vec<(SlotId, JobId, BytePipe, BytePipe, String)> = Vec::new();
        let mut unencodable: Vec<(SlotId, JobId, JobError)> = Vec::new();
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            state.dispatch_scheduled = false;
            if state.closed {
                return;
            }

            state
                .queue
                .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
            loop {
                match state.queue.first() {
                    Some(head) if !head.is_parked() => {}
                    _ => break,
                }
                let Some(slot) = state.slots.iter_mut().find(|slot| slot.is_idle()) else {
                    break;
                };
                let job = state.queue.remove(0);
                slot.active = Some(job.id);
                log::debug!("job {} ({}) -> slot {}", job.id, job.method, slot.id);
                match protocol::encode_request(job.id, &job.method, &job.params) {
                    Ok(line) => started.push((
                        slot.id,
                        job.id,
                        slot.instance.stdin.clone(),
                        slot.instance.stdout.clone(),
                        line,
                    )),
                    Err(err) => unencodable.push((slot.id, job.id, err)),
                }
                state.active.insert(job.id, job);
            }
        }

        for (slot_id, job_id, err) in unencodable {
            self.complete(slot_id, job_id, Err(err));
        }
        for (slot_id, job_id, stdin, stdout, line) in started {
            stdin.write(line.as_bytes());
            let shared = self.clone();
            self.spawn("exchange", async move { shared.exchange(slot_id, job_id, stdout).await });
        }
    }

    fn is_bound(&self, slot_id: SlotId, job_id: JobId) -> bool {
        self.state.borrow().slots.iter().any(|slot| {
            slot.id == slot_id && slot.state == SlotState::Ready && slot.active == Some(job_id)
        })
    }

    /// Read the guest's answer to one request
    async fn exchange(self: Rc<Self>, slot_id: SlotId, job_id: JobId, stdout: BytePipe) {
        loop {
            let line = stdout.read_line().await;
            if !self.is_bound(slot_id, job_id) {
                // Cancelled or failed while we waited
                return;
            }
            let Some(line) = line else {
                self.fail_slot(slot_id, "guest closed its output".to_string());
                return;
            };
            if line.trim().is_empty() {
                continue;
            }

            match protocol::classify(&line) {
                Ok(GuestMessage::Intermediate(data)) => {
                    let callback = self
                        .state
                        .borrow()
                        .active
                        .get(&job_id)
                        .and_then(Job::data_callback);
                    match callback {
                        Some(callback) => (&mut *callback.borrow_mut())(data),
                        None => {
                            let err = JobError::Protocol {
                                reason: "intermediate message for a command job".to_string(),
                            };
                            self.abort(slot_id, job_id, err);
                            return;
                        }
                    }
                }
                Ok(GuestMessage::Result(result)) => {
                    self.complete(slot_id, job_id, Ok(result));
                    return;
                }
                Ok(GuestMessage::Error(message)) => {
                    self.complete(slot_id, job_id, Err(JobError::Guest { message }));
                    return;
                }
                Err(err) => {
                    log::warn!("slot {} job {}: {}", slot_id, job_id, err);
                    self.abort(slot_id, job_id, err);
                    return;
                }
            }
        }
    }

    /// The exchange finished normally; the slot goes back to idle
    fn complete(self: &Rc<Self>, slot_id: SlotId, job_id: JobId, result: JobResult) {
        let (job, surplus) = {
            let mut state = self.state.borrow_mut();
            let job = state.active.remove(&job_id);
            let live = state.live_slots();
            let max = state.max_concurrency;
            match state.slot_mut(slot_id) {
                Some(slot) => {
                    slot.active = None;
                    (job, live > max)
                }
                None => (job, false),
            }
        };
        if let Some(job) = job {
            job.finish(result);
        }
        if surplus {
            log::debug!("retiring surplus slot {}", slot_id);
            self.drop_slot(slot_id);
        }
        self.schedule_dispatch();
    }

    /// The exchange broke the protocol; the instance is no longer trusted
    fn abort(self: &Rc<Self>, slot_id: SlotId, job_id: JobId, err: JobError) {
        let job = {
            let mut state = self.state.borrow_mut();
            if let Some(slot) = state.slot_mut(slot_id) {
                slot.active = None;
                slot.retire();
            }
            state.active.remove(&job_id)
        };
        if let Some(job) = job {
            job.finish(Err(err));
        }
        self.replace_slot(slot_id);
    }

    /// The instance died or hung up; fail its job and replace it
    fn fail_slot(self: &Rc<Self>, slot_id: SlotId, reason: String) {
        let (job, was_provisioning) = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(slot) = state.slots.iter_mut().find(|slot| slot.id == slot_id) else {
                return;
            };
            if slot.state == SlotState::Retired {
                return;
            }
            let was_provisioning = slot.state == SlotState::Provisioning;
            slot.retire();
            let job = slot.active.take().and_then(|id| state.active.remove(&id));
            (job, was_provisioning)
        };

        if was_provisioning {
            // Never became usable; replacing it would just fail again
            log::error!("slot {} failed to start: {}", slot_id, reason);
            self.drop_slot(slot_id);
            return;
        }

        log::warn!("slot {} failed: {}", slot_id, reason);
        if let Some(job) = job {
            job.finish(Err(JobError::InstanceFailed { reason }));
        }
        self.replace_slot(slot_id);
    }

    /// Provision a replacement for a retired slot, then drop the old one
    fn replace_slot(self: &Rc<Self>, slot_id: SlotId) {
        let wanted = {
            let mut state = self.state.borrow_mut();
            if let Some(slot) = state.slot_mut(slot_id) {
                slot.retire();
            }
            !state.closed && state.live_slots() < state.max_concurrency
        };
        if wanted {
            self.add_worker();
        }
        self.drop_slot(slot_id);
        self.schedule_dispatch();
    }

    /// Remove a slot without replacing it
    fn drop_slot(&self, slot_id: SlotId) {
        let slot = self.state.borrow_mut().take_slot(slot_id);
        if let Some(mut slot) = slot {
            slot.retire();
            log::debug!("slot {} removed", slot_id);
        }
    }

    fn add_worker(self: &Rc<Self>) -> bool {
        if self.state.borrow().closed {
            return false;
        }
        let mut instance = match self.launcher.launch() {
            Ok(instance) => instance,
            Err(err) => {
                log::error!("failed to start guest instance: {}", err);
                return false;
            }
        };
        let exit = instance.take_exit();
        let stdout = instance.stdout.clone();
        let slot_id = {
            let mut state = self.state.borrow_mut();
            let id = state.next_slot;
            state.next_slot += 1;
            state.slots.push(WorkerSlot::new(id, instance));
            id
        };
        log::debug!("slot {} provisioning", slot_id);

        let shared = self.clone();
        self.spawn("bootstrap", async move { shared.bootstrap(slot_id, stdout).await });
        if let Some(exit) = exit {
            let shared = self.clone();
            self.spawn("exit watcher", async move { shared.watch_exit(slot_id, exit).await });
        }
        true
    }

    /// Wait for the bootstrap line, then open the slot for jobs
    async fn bootstrap(self: Rc<Self>, slot_id: SlotId, stdout: BytePipe) {
        let outcome = match stdout.read_line().await {
            Some(line) => protocol::parse_bootstrap(&line),
            None => Err("guest exited before becoming ready".to_string()),
        };
        match outcome {
            Ok(()) => {
                let ready = {
                    let mut state = self.state.borrow_mut();
                    match state.slot_mut(slot_id) {
                        Some(slot) if slot.state == SlotState::Provisioning => {
                            slot.state = SlotState::Ready;
                            true
                        }
                        _ => false,
                    }
                };
                if ready {
                    log::debug!("slot {} ready", slot_id);
                    self.schedule_dispatch();
                }
            }
            Err(reason) => {
                let known = self.state.borrow().slots.iter().any(|slot| slot.id == slot_id);
                if known {
                    log::error!("slot {} failed to start: {}", slot_id, reason);
                    self.drop_slot(slot_id);
                }
            }
        }
    }

    async fn watch_exit(self: Rc<Self>, slot_id: SlotId, exit: oneshot::Receiver<ExitStatus>) {
        let status = exit.await.unwrap_or(ExitStatus::Disposed);
        self.fail_slot(slot_id, format!("guest {}", status));
    }

    fn set_max_concurrency(self: &Rc<Self>, n: usize) {
        let (grow, retire) = {
            let mut state = self.state.borrow_mut();
            state.max_concurrency = n;
            let live = state.live_slots();
            let mut retire = Vec::new();
            if live > n {
                // Provisioning slots first, then idle ones
                let mut candidates: Vec<&WorkerSlot> = state
                    .slots
                    .iter()
                    .filter(|slot| slot.state == SlotState::Provisioning || slot.is_idle())
                    .collect();
                candidates.sort_by_key(|slot| slot.state != SlotState::Provisioning);
                retire = candidates.iter().take(live - n).map(|slot| slot.id).collect();
            }
            (n.saturating_sub(live), retire)
        };
        for slot_id in retire {
            self.drop_slot(slot_id);
        }
        for _ in 0..grow {
            self.add_worker();
        }
    }

    fn metrics(&self) -> PoolMetrics {
        let state = self.state.borrow();
        let mut metrics = PoolMetrics {
            queued: state.queue.len(),
            open_ports: state.open_ports,
            ..PoolMetrics::default()
        };
        for slot in state.slots.iter().filter(|slot| slot.state != SlotState::Retired) {
            metrics.total += 1;
            match slot.state {
                SlotState::Provisioning => metrics.provisioning += 1,
                SlotState::Ready => {
                    metrics.ready += 1;
                    if slot.is_busy() {
                        metrics.busy += 1;
                    } else {
                        metrics.idle += 1;
                    }
                }
                SlotState::Retired => {}
            }
        }
        metrics
    }

    fn close(&self) {
        let (jobs, slots) = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            let mut jobs: Vec<Job> = state.queue.drain(..).collect();
            jobs.extend(state.active.drain().map(|(_, job)| job));
            let slots: Vec<WorkerSlot> = state.slots.drain(..).collect();
            (jobs, slots)
        };
        log::debug!("pool closing: {} jobs rejected, {} slots disposed", jobs.len(), slots.len());
        for job in jobs {
            job.finish(Err(JobError::PoolClosed));
        }
        for mut slot in slots {
            slot.retire();
        }
    }
}

enum Located {
    Queued(Job),
    Active(Job, SlotId),
    Missing,
}

impl JobControl for Shared {
    fn set_priority(self: Rc<Self>, id: JobId, priority: Priority) {
        let found = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            match state.queue.iter_mut().find(|job| job.id == id) {
                Some(job) => {
                    job.priority = priority;
                    true
                }
                None => match state.active.get_mut(&id) {
                    Some(job) => {
                        job.priority = priority;
                        true
                    }
                    None => false,
                },
            }
        };
        if found {
            log::debug!("job {} priority -> {}", id, priority);
            self.schedule_dispatch();
        }
    }

    fn cancel(self: Rc<Self>, id: JobId) {
        let located = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            if let Some(index) = state.queue.iter().position(|job| job.id == id) {
                Located::Queued(state.queue.remove(index))
            } else if let Some(job) = state.active.remove(&id) {
                match state.slots.iter_mut().find(|slot| slot.active == Some(id)) {
                    Some(slot) => {
                        slot.active = None;
                        slot.retire();
                        Located::Active(job, slot.id)
                    }
                    None => Located::Queued(job),
                }
            } else {
                Located::Missing
            }
        };

        match located {
            Located::Queued(job) => {
                log::debug!("job {} cancelled while queued", id);
                job.finish(Err(JobError::Cancelled));
            }
            Located::Active(job, slot_id) => {
                log::debug!("job {} cancelled on slot {}, replacing instance", id, slot_id);
                job.finish(Err(JobError::Cancelled));
                self.replace_slot(slot_id);
            }
            Located::Missing => {}
        }
    }
}

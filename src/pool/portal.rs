//! Pool access across a message channel
//!
//! [`PoolPortal`] is the remote side: it mirrors the [`Pool`] submission API
//! but only keeps callbacks and completion senders, keyed by ids it
//! allocates itself. [`serve`] is the pool side: it turns portal messages
//! into pool jobs and relays their progress back.
//!
//! Every job crosses as a stream job, so intermediates always reach the
//! portal; whether they are wanted is the portal's business.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use futures::channel::oneshot;
use futures::executor::LocalSpawner;
use futures::task::LocalSpawnExt;
use serde_json::Value;

use super::channel::{MessagePort, PoolResponse, PoolTask, PortReceiver, PortSender, TaskSpec};
use super::job::{
    DataCallback, JobControl, JobError, JobHandle, JobId, JobRef, JobResult, Priority, StreamJob,
};
use super::Pool;

/// Serve one portal until it closes or its channel goes away
pub(crate) async fn serve(pool: Pool, port: MessagePort) {
    pool.port_opened();
    let (sender, mut receiver) = port.split();
    let handles: Rc<RefCell<HashMap<JobId, JobHandle>>> = Rc::default();

    while let Some(message) = receiver.recv::<PoolTask>().await {
        let task = match message {
            Ok(task) => task,
            Err(err) => {
                log::warn!("malformed portal message: {}", err);
                continue;
            }
        };
        match task {
            PoolTask::New { job } => relay(&pool, &sender, &handles, job),
            PoolTask::Update { job_id, priority } => {
                let handle = handles.borrow().get(&job_id).cloned();
                if let Some(handle) = handle {
                    handle.set_priority(priority);
                }
            }
            PoolTask::Remove { job_id } => {
                // Forget it first so the relay stays quiet
                let handle = handles.borrow_mut().remove(&job_id);
                if let Some(handle) = handle {
                    handle.cancel();
                }
            }
            PoolTask::Close => break,
        }
    }

    let outstanding: Vec<JobHandle> = handles.borrow_mut().drain().map(|(_, handle)| handle).collect();
    log::debug!("portal closed with {} outstanding jobs", outstanding.len());
    for handle in outstanding {
        handle.cancel();
    }
    sender.close();
    pool.port_closed();
}

/// Submit one portal job and forward everything it produces
fn relay(
    pool: &Pool,
    sender: &PortSender,
    handles: &Rc<RefCell<HashMap<JobId, JobHandle>>>,
    spec: TaskSpec,
) {
    let portal_id = spec.id;
    let data_sender = sender.clone();
    let job = pool.submit_streaming(StreamJob::new(&spec.method, spec.params, spec.priority, move |data| {
        if let Err(err) = data_sender.post(&PoolResponse::data(portal_id, data)) {
            log::debug!("dropping data for portal job {}: {}", portal_id, err);
        }
    }));
    handles.borrow_mut().insert(portal_id, job.handle());

    let handles = handles.clone();
    let sender = sender.clone();
    let forward = async move {
        let result = job.await;
        // Removed entries were cancelled by the portal, which already knows
        if handles.borrow_mut().remove(&portal_id).is_some() {
            if let Err(err) = sender.post(&PoolResponse::end(portal_id, result)) {
                log::debug!("dropping result for portal job {}: {}", portal_id, err);
            }
        }
    };
    if let Err(err) = pool.spawner().spawn_local(forward) {
        log::error!("failed to relay portal job {}: {}", portal_id, err);
    }
}

struct Entry {
    on_data: Option<DataCallback>,
    done: oneshot::Sender<JobResult>,
}

struct PortalState {
    entries: HashMap<JobId, Entry>,
    next_id: JobId,
    closed: bool,
}

struct PortalShared {
    state: RefCell<PortalState>,
    sender: PortSender,
}

/// Remote handle on a pool served through [`Pool::serve_port`]
#[derive(Clone)]
pub struct PoolPortal {
    shared: Rc<PortalShared>,
}

impl PoolPortal {
    /// Attach to `port` and start listening for responses on `spawner`
    pub fn new(port: MessagePort, spawner: LocalSpawner) -> Self {
        let (sender, receiver) = port.split();
        let shared = Rc::new(PortalShared {
            state: RefCell::new(PortalState {
                entries: HashMap::new(),
                next_id: 1,
                closed: false,
            }),
            sender,
        });
        if let Err(err) = spawner.spawn_local(listen(shared.clone(), receiver)) {
            log::error!("failed to start portal listener: {}", err);
        }
        Self { shared }
    }

    pub fn submit(&self, method: &str, params: Value, priority: Priority) -> JobRef {
        self.shared.enqueue(method.to_string(), params, priority, None)
    }

    pub fn submit_streaming(&self, job: StreamJob) -> JobRef {
        self.shared
            .enqueue(job.method, job.params, job.priority, Some(job.on_data))
    }

    /// Jobs still waiting for their terminal message
    pub fn pending(&self) -> usize {
        self.shared.state.borrow().entries.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.borrow().closed
    }

    /// Tell the pool to drop this portal's jobs and reject them locally
    pub fn close(&self) {
        self.shared.close();
    }
}

impl PortalShared {
    fn control(self: &Rc<Self>) -> Weak<dyn JobControl> {
        let weak: Weak<PortalShared> = Rc::downgrade(self);
        weak
    }

    fn enqueue(
        self: &Rc<Self>,
        method: String,
        params: Value,
        priority: Priority,
        on_data: Option<DataCallback>,
    ) -> JobRef {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        if state.closed {
            return JobRef::rejected(id, JobError::PoolClosed);
        }

        let job = TaskSpec {
            id,
            priority,
            method,
            params,
        };
        if let Err(err) = self.sender.post(&PoolTask::New { job }) {
            log::warn!("portal job {} not sent: {}", id, err);
            return JobRef::rejected(id, JobError::PoolClosed);
        }
        let (done, receiver) = oneshot::channel();
        state.entries.insert(id, Entry { on_data, done });
        drop(state);

        JobRef::new(JobHandle::new(id, self.control()), receiver)
    }

    fn deliver(&self, response: PoolResponse) {
        let id = response.id;
        if !response.end {
            let callback = self
                .state
                .borrow()
                .entries
                .get(&id)
                .map(|entry| entry.on_data.clone());
            match callback {
                Some(Some(callback)) => (&mut *callback.borrow_mut())(response.data),
                Some(None) => log::warn!("portal job {} is not streaming, data ignored", id),
                None => log::warn!("data for unknown portal job {}", id),
            }
            return;
        }

        let entry = self.state.borrow_mut().entries.remove(&id);
        match entry {
            Some(entry) => {
                let _ = entry.done.send(response.into_result());
            }
            None => log::warn!("result for unknown portal job {}", id),
        }
    }

    fn reject_all(&self, error: JobError) {
        let entries: Vec<Entry> = {
            let mut state = self.state.borrow_mut();
            state.closed = true;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.done.send(Err(error.clone()));
        }
    }

    fn close(&self) {
        if self.state.borrow().closed {
            return;
        }
        if let Err(err) = self.sender.post(&PoolTask::Close) {
            log::debug!("pool already gone: {}", err);
        }
        self.sender.close();
        self.reject_all(JobError::PoolClosed);
    }
}

impl JobControl for PortalShared {
    fn set_priority(self: Rc<Self>, id: JobId, priority: Priority) {
        if !self.state.borrow().entries.contains_key(&id) {
            return;
        }
        if let Err(err) = self.sender.post(&PoolTask::Update { job_id: id, priority }) {
            log::warn!("priority update for portal job {} not sent: {}", id, err);
        }
    }

    fn cancel(self: Rc<Self>, id: JobId) {
        let entry = self.state.borrow_mut().entries.remove(&id);
        let Some(entry) = entry else {
            return;
        };
        if let Err(err) = self.sender.post(&PoolTask::Remove { job_id: id }) {
            log::debug!("cancel for portal job {} not sent: {}", id, err);
        }
        let _ = entry.done.send(Err(JobError::Cancelled));
    }
}

async fn listen(shared: Rc<PortalShared>, mut receiver: PortReceiver) {
    while let Some(message) = receiver.recv::<PoolResponse>().await {
        match message {
            Ok(response) => shared.deliver(response),
            Err(err) => log::warn!("malformed pool response: {}", err),
        }
    }
    shared.reject_all(JobError::PoolClosed);
}

#[cfg(test)]
mod tests {
    use super::super::channel::message_channel;
    use super::super::testing::ScriptedLauncher;
    use super::super::PARKED;
    use super::*;
    use futures::executor::LocalPool;
    use serde_json::json;

    fn served(slots: usize) -> (LocalPool, Pool, PoolPortal, ScriptedLauncher) {
        let mut local = LocalPool::new();
        let launcher = ScriptedLauncher::new();
        let pool = Pool::new(launcher.clone(), slots, local.spawner());
        let (pool_end, portal_end) = message_channel();
        pool.serve_port(pool_end);
        let portal = PoolPortal::new(portal_end, local.spawner());
        local.run_until_stalled();
        (local, pool, portal, launcher)
    }

    #[test]
    fn test_portal_command() {
        let (mut local, pool, portal, _launcher) = served(1);
        assert_eq!(pool.metrics().open_ports, 1);
        let job = portal.submit("echo", json!({"x": 1}), 1);
        assert_eq!(portal.pending(), 1);
        assert_eq!(local.run_until(job), Ok(json!({"x": 1})));
        assert_eq!(portal.pending(), 0);
    }

    #[test]
    fn test_portal_mirrors_stream() {
        let (mut local, _pool, portal, _launcher) = served(1);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let job = portal.submit_streaming(StreamJob::new("stream", json!({"count": 2}), 1, move |data| {
            sink.borrow_mut().push(data)
        }));
        assert_eq!(local.run_until(job), Ok(json!({"done": 2})));
        assert_eq!(*seen.borrow(), vec![json!({"n": 0}), json!({"n": 1})]);
        assert_eq!(portal.pending(), 0);
    }

    #[test]
    fn test_portal_guest_error() {
        let (mut local, _pool, portal, _launcher) = served(1);
        let job = portal.submit("fail", json!({}), 1);
        assert_eq!(
            local.run_until(job),
            Err(JobError::Guest { message: "requested failure".into() })
        );
    }

    #[test]
    fn test_portal_cancel_replaces_instance() {
        let (mut local, pool, portal, launcher) = served(1);
        let job = portal.submit("hang", json!({}), 1);
        local.run_until_stalled();
        assert_eq!(pool.metrics().busy, 1);

        job.cancel();
        assert_eq!(portal.pending(), 0);
        assert_eq!(local.run_until(job), Err(JobError::Cancelled));
        local.run_until_stalled();
        assert_eq!(launcher.launched(), 2);
        assert_eq!(pool.metrics().idle, 1);
    }

    #[test]
    fn test_portal_priority_update() {
        let (mut local, _pool, portal, launcher) = served(1);
        let blocker = portal.submit("echo_slow", json!("blocker"), 9);
        let parked = portal.submit("echo", json!("parked"), PARKED);
        let other = portal.submit("echo", json!("other"), 1);
        local.run_until(other).unwrap();
        assert_eq!(portal.pending(), 1);

        parked.set_priority(2);
        assert_eq!(local.run_until(parked), Ok(json!("parked")));
        local.run_until(blocker).unwrap();
        assert_eq!(launcher.requests(), vec!["blocker", "other", "parked"]);
    }

    #[test]
    fn test_portal_close_cancels_its_jobs() {
        let (mut local, pool, portal, launcher) = served(1);
        let active = portal.submit("hang", json!({}), 2);
        let queued = portal.submit("echo", json!({}), 1);
        local.run_until_stalled();

        portal.close();
        assert!(portal.is_closed());
        assert_eq!(local.run_until(active), Err(JobError::PoolClosed));
        assert_eq!(local.run_until(queued), Err(JobError::PoolClosed));
        local.run_until_stalled();

        let metrics = pool.metrics();
        assert_eq!(metrics.open_ports, 0);
        assert_eq!(metrics.queued, 0);
        assert_eq!(metrics.idle, 1);
        assert_eq!(launcher.launched(), 2);
        assert!(!pool.is_closed());

        let late = portal.submit("echo", json!({}), 1);
        assert_eq!(local.run_until(late), Err(JobError::PoolClosed));
    }

    #[test]
    fn test_portal_wire_and_unknown_ids() {
        let mut local = LocalPool::new();
        let (mut pool_end, portal_end) = message_channel();
        let portal = PoolPortal::new(portal_end, local.spawner());

        pool_end.post(&PoolResponse::end(99, Ok(json!(1)))).unwrap();
        local.run_until_stalled();

        let job = portal.submit("log", json!({"limit": 2}), 4);
        let task: PoolTask = local.run_until(pool_end.recv()).unwrap().unwrap();
        assert_eq!(
            task,
            PoolTask::New {
                job: TaskSpec {
                    id: job.id(),
                    priority: 4,
                    method: "log".into(),
                    params: json!({"limit": 2}),
                }
            }
        );

        // A command job ignores intermediates
        pool_end.post(&PoolResponse::data(job.id(), json!({"n": 0}))).unwrap();
        pool_end.post(&PoolResponse::end(job.id(), Ok(json!("ok")))).unwrap();
        assert_eq!(local.run_until(job), Ok(json!("ok")));
    }

    #[test]
    fn test_pool_gone_rejects_pending() {
        let mut local = LocalPool::new();
        let (pool_end, portal_end) = message_channel();
        let portal = PoolPortal::new(portal_end, local.spawner());
        let job = portal.submit("echo", json!({}), 1);

        drop(pool_end);
        assert_eq!(local.run_until(job), Err(JobError::PoolClosed));
        assert!(portal.is_closed());
    }
}

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Instant;

use uuid::Uuid;

use crate::args::ArgValue;
use crate::error::{Error, Result};
use crate::profiler::{elapsed_ns, TraceTime};
use super::{run_profiled, BackendEngine, BackendSession, ProfiledFuture, Semaphore, Task};

const CONSTANT_SCHEDULING_OVERHEAD: TraceTime = 8_000_000;
const DEFAULT_MAX_CLIENTS: usize = 256;
const DEFAULT_MAX_IDLE_CLIENTS: usize = 4;

lazy_static::lazy_static! {
    static ref SCHEDULERS: Mutex<HashMap<String, Arc<ClusterScheduler>>> = Mutex::new(HashMap::new());
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Arc<ClusterScheduler>>> = RefCell::new(None);
    // Whether the calling worker thread holds one of its scheduler's slots
    static HOLDS_SLOT: Cell<bool> = Cell::new(false);
}

type Job = Box<dyn FnOnce() + Send>;

/// In-process cluster scheduler, reachable by its `inproc://` address.
///
/// Every task gets its own worker thread, but only `n_workers` of them hold
/// a slot and run at once, whichever session submitted them. A task that
/// opens a session on its own scheduler gives its slot up until that session
/// is dropped, so tasks can wait on tasks they submitted themselves.
/// Preloaded objects live in the scheduler's store until the client that
/// sent them clears them.
pub struct ClusterScheduler {
    address: String,
    n_workers: usize,
    running: AtomicBool,
    objects: Mutex<HashMap<Uuid, ArgValue>>,
    slots: Semaphore,
    spawned: AtomicUsize
}

impl ClusterScheduler {
    /// Starts a scheduler under a fresh address.
    pub fn start(n_workers: usize) -> Result<Arc<ClusterScheduler>> {
        if n_workers == 0 {
            return Err(Error::Config("a cluster scheduler needs at least one worker".into()));
        }
        let address = format!("inproc://{}", Uuid::new_v4());
        let scheduler = Arc::new(ClusterScheduler {
            address: address.clone(),
            n_workers,
            running: AtomicBool::new(true),
            objects: Mutex::new(HashMap::new()),
            slots: Semaphore::new(n_workers),
            spawned: AtomicUsize::new(0)
        });
        SCHEDULERS.lock()?.insert(address.clone(), scheduler.clone());
        info!("started cluster scheduler at {} with {} workers", address, n_workers);
        Ok(scheduler)
    }

    /// Finds a running scheduler by address.
    pub fn lookup(address: &str) -> Result<Arc<ClusterScheduler>> {
        SCHEDULERS.lock()?
            .get(address)
            .cloned()
            .ok_or_else(|| Error::backend(format!("no cluster scheduler listening at {}", address)))
    }

    /// The scheduler whose worker is running the calling thread, if any.
    pub fn current() -> Option<Arc<ClusterScheduler>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().clone())
    }

    /// Address other backends connect to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Number of tasks allowed to run at once.
    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Whether the scheduler still accepts tasks.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of preloaded objects currently held.
    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    /// Stops accepting tasks, forgets the address and drops stored objects.
    /// Tasks already running finish normally.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut schedulers) = SCHEDULERS.lock() {
            schedulers.remove(&self.address);
        }
        if let Ok(mut objects) = self.objects.lock() {
            objects.clear();
        }
        info!("stopped cluster scheduler at {}", self.address);
    }

    fn check_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::backend(format!("cluster scheduler at {} is shut down", self.address)))
        }
    }

    fn spawn(self: &Arc<Self>, job: Job) -> Result<()> {
        self.check_running()?;
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let scheduler = self.clone();
        thread::Builder::new()
            .name(format!("chunkwise-cluster-worker-{}", n))
            .spawn(move || {
                CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(scheduler.clone()));
                scheduler.rejoin();
                job();
                if HOLDS_SLOT.with(|h| h.replace(false)) {
                    scheduler.slots.release();
                }
            })?;
        Ok(())
    }

    /// Frees the calling worker's slot if it runs a task of this scheduler.
    ///
    /// Returns true if a slot was given up and must be taken back with
    /// [`ClusterScheduler::rejoin`].
    fn secede(self: &Arc<Self>) -> bool {
        let own_worker = ClusterScheduler::current()
            .map(|c| Arc::ptr_eq(&c, self))
            .unwrap_or(false);
        if !own_worker || !HOLDS_SLOT.with(|h| h.replace(false)) {
            return false;
        }
        trace!("worker seceded from {}", self.address);
        self.slots.release();
        true
    }

    /// Blocks until the calling thread holds one of the scheduler's slots.
    fn rejoin(&self) {
        match self.slots.acquire() {
            Ok(()) => HOLDS_SLOT.with(|h| h.set(true)),
            Err(e) => warn!("running without a worker slot on {}: {}", self.address, e)
        }
    }

    fn put_object(&self, value: ArgValue) -> Result<Uuid> {
        self.check_running()?;
        let id = Uuid::new_v4();
        self.objects.lock()?.insert(id, value);
        Ok(id)
    }

    fn get_object(&self, id: &Uuid) -> Result<ArgValue> {
        self.objects.lock()?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::backend(format!("object {} is not available on {}", id, self.address)))
    }

    fn delete_objects(&self, ids: &[Uuid]) {
        if let Ok(mut objects) = self.objects.lock() {
            for id in ids {
                objects.remove(id);
            }
        }
    }
}

/// Handle on a value preloaded to a cluster scheduler.
#[derive(Debug,Clone)]
pub struct ObjectRef {
    id: Uuid,
    scheduler: Weak<ClusterScheduler>
}

impl ObjectRef {
    /// Key of the value in the scheduler's store.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Fetches the stored value.
    pub fn resolve(&self) -> Result<ArgValue> {
        self.scheduler.upgrade()
            .ok_or_else(|| Error::backend("cluster scheduler is gone"))?
            .get_object(&self.id)
    }
}

impl std::fmt::Debug for ClusterScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ClusterScheduler({})", self.address)
    }
}

/// Connection to a scheduler, owning the objects it sent.
struct ClusterClient {
    id: Uuid,
    scheduler: Arc<ClusterScheduler>,
    objects: Vec<Uuid>
}

impl ClusterClient {
    fn connect(scheduler: Arc<ClusterScheduler>) -> Result<Self> {
        scheduler.check_running()?;
        let client = ClusterClient { id: Uuid::new_v4(), scheduler, objects: Vec::new() };
        trace!("client {} connected to {}", client.id, client.scheduler.address);
        Ok(client)
    }

    fn send_object(&mut self, value: ArgValue) -> Result<ObjectRef> {
        let id = self.scheduler.put_object(value)?;
        self.objects.push(id);
        Ok(ObjectRef { id, scheduler: Arc::downgrade(&self.scheduler) })
    }

    fn clear(&mut self) {
        self.scheduler.delete_objects(&self.objects);
        self.objects.clear();
    }

    fn disconnect(mut self) {
        self.clear();
        trace!("client {} disconnected from {}", self.id, self.scheduler.address);
    }
}

struct ClientPoolState {
    idle: VecDeque<ClusterClient>,
    open: usize
}

/// Reusable clients of one engine.
///
/// Idle clients are reused oldest first. New ones are opened up to
/// `max_clients`; beyond that, sessions wait for a release. Released clients
/// are cleared, and closed when `max_idle` are already idle.
struct ClientPool {
    scheduler: Arc<ClusterScheduler>,
    state: Mutex<ClientPoolState>,
    cond: Condvar,
    max_clients: usize,
    max_idle: usize
}

impl ClientPool {
    fn new(scheduler: Arc<ClusterScheduler>, max_clients: usize, max_idle: usize) -> Self {
        ClientPool {
            scheduler,
            state: Mutex::new(ClientPoolState { idle: VecDeque::new(), open: 0 }),
            cond: Condvar::new(),
            max_clients,
            max_idle
        }
    }

    fn acquire(&self) -> Result<ClusterClient> {
        self.scheduler.check_running()?;
        let mut state = self.state.lock()?;
        loop {
            if let Some(client) = state.idle.pop_front() {
                return Ok(client);
            }
            if state.open < self.max_clients {
                let client = ClusterClient::connect(self.scheduler.clone())?;
                state.open += 1;
                return Ok(client);
            }
            state = self.cond.wait(state)?;
        }
    }

    fn release(&self, mut client: ClusterClient) {
        client.clear();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.idle.len() < self.max_idle {
            state.idle.push_back(client);
        } else {
            state.open -= 1;
            client.disconnect();
        }
        self.cond.notify_one();
    }

    fn close_idle(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        while let Some(client) = state.idle.pop_front() {
            state.open -= 1;
            client.disconnect();
        }
    }

    fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        (state.idle.len(), state.open)
    }
}

struct ClusterSession {
    client: Option<ClusterClient>,
    clients: Arc<ClientPool>,
    guard: Arc<Semaphore>,
    // Opened from a task of the same scheduler, whose slot was given up
    seceded: bool
}

impl BackendSession for ClusterSession {
    fn preload_value(&mut self, value: ArgValue) -> Result<ArgValue> {
        let client = self.client.as_mut().ok_or_else(|| Error::backend("session is closed"))?;
        Ok(ArgValue::new(client.send_object(value)?))
    }

    fn submit(&mut self, task: Task) -> Result<ProfiledFuture> {
        let start = Instant::now();
        let (future, completer) = ProfiledFuture::new();
        self.guard.acquire()?;
        let guard = self.guard.clone();
        let submit_duration = elapsed_ns(start);

        let job: Job = Box::new(move || {
            run_profiled(task, completer, guard, submit_duration, CONSTANT_SCHEDULING_OVERHEAD)
        });
        if let Err(e) = self.clients.scheduler.spawn(job) {
            self.guard.release();
            return Err(e);
        }
        Ok(future)
    }
}

impl Drop for ClusterSession {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.clients.release(client);
        }
        if self.seceded {
            self.clients.scheduler.rejoin();
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
enum ClusterKind {
    Local,
    Remote,
    Current
}

/// Backend submitting to a [`ClusterScheduler`].
///
/// * [`ClusterBackend::local`] starts its own scheduler and stops it on
///   shutdown.
/// * [`ClusterBackend::remote`] connects to a running scheduler by address.
/// * [`ClusterBackend::current`] adopts the scheduler of the cluster worker
///   the caller runs on.
pub struct ClusterBackend {
    kind: ClusterKind,
    n_workers: usize,
    allows_nested_tasks: bool,
    clients: Arc<ClientPool>,
    shut: AtomicBool
}

impl ClusterBackend {
    fn with_scheduler(
        kind: ClusterKind,
        scheduler: Arc<ClusterScheduler>,
        n_workers: usize,
        allows_nested_tasks: bool,
        max_idle_clients: usize
    ) -> Result<Self> {
        if n_workers == 0 {
            return Err(Error::Config("a cluster backend needs at least one worker".into()));
        }
        Ok(ClusterBackend {
            kind,
            n_workers,
            allows_nested_tasks,
            clients: Arc::new(ClientPool::new(scheduler, DEFAULT_MAX_CLIENTS, max_idle_clients)),
            shut: AtomicBool::new(false)
        })
    }

    /// Starts a private scheduler with `n_workers` workers.
    pub fn local(n_workers: usize, allows_nested_tasks: bool, max_idle_clients: usize) -> Result<Self> {
        let scheduler = ClusterScheduler::start(n_workers)?;
        ClusterBackend::with_scheduler(ClusterKind::Local, scheduler, n_workers, allows_nested_tasks, max_idle_clients)
    }

    /// Connects to the scheduler listening at `scheduler_address`.
    pub fn remote(scheduler_address: &str, n_workers: usize, allows_nested_tasks: bool) -> Result<Self> {
        let scheduler = ClusterScheduler::lookup(scheduler_address)?;
        ClusterBackend::with_scheduler(
            ClusterKind::Remote, scheduler, n_workers, allows_nested_tasks, DEFAULT_MAX_IDLE_CLIENTS)
    }

    /// Adopts the scheduler running the calling worker.
    pub fn current(n_workers: usize) -> Result<Self> {
        let scheduler = ClusterScheduler::current()
            .ok_or_else(|| Error::backend("not running on a cluster worker"))?;
        ClusterBackend::with_scheduler(ClusterKind::Current, scheduler, n_workers, true, DEFAULT_MAX_IDLE_CLIENTS)
    }

    /// The scheduler tasks are submitted to.
    pub fn scheduler(&self) -> &Arc<ClusterScheduler> {
        &self.clients.scheduler
    }

    /// Address of the scheduler tasks are submitted to.
    pub fn scheduler_address(&self) -> &str {
        self.clients.scheduler.address()
    }

    /// Maximum number of tasks one session keeps in flight.
    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Idle and open client counts.
    pub fn client_counts(&self) -> (usize, usize) {
        self.clients.counts()
    }
}

impl BackendEngine for ClusterBackend {
    fn name(&self) -> &str {
        match self.kind {
            ClusterKind::Local => "cluster-local",
            ClusterKind::Remote => "cluster-remote",
            ClusterKind::Current => "cluster-current"
        }
    }

    fn session(&self) -> Result<Box<dyn BackendSession>> {
        if self.shut.load(Ordering::SeqCst) {
            return Err(Error::backend("cluster backend is shut down"));
        }
        let client = self.clients.acquire()?;
        let seceded = self.clients.scheduler.secede();
        Ok(Box::new(ClusterSession {
            client: Some(client),
            clients: self.clients.clone(),
            guard: Arc::new(Semaphore::new(self.n_workers)),
            seceded
        }))
    }

    fn shutdown(&self) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        self.clients.close_idle();
        if self.kind == ClusterKind::Local {
            self.clients.scheduler.shutdown();
        }
    }

    fn allows_nested_tasks(&self) -> bool {
        self.allows_nested_tasks
    }
}

impl Drop for ClusterBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

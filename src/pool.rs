//! The pool scheduler.
//!
//! A [`Pool`] supervises a bounded set of worker processes and routes jobs
//! to them. All mutable state — worker entries, the ready deque, the busy
//! markers, the FIFO queue of pending work — is owned by a single
//! supervisor task; public handles talk to it over a channel, so state is
//! only ever mutated by interleaved callbacks on one task and no locking is
//! needed.
//!
//! ## Lifecycle
//!
//! `start()` grows the pool to `min` workers. `submit()` dispatches to a
//! ready worker, grows the pool if below `max`, or queues the job in strict
//! FIFO order. Workers are recycled after `recycle_after` calls, pruned
//! when idle above `min`, force-terminated on call timeout, and replaced
//! whenever one crashes while the pool is running. `stop()` retires every
//! worker gracefully and resolves once they have all exited.
//!
//! Ready-worker selection is oldest-ready-first: the ready set is a deque
//! drained from the front, so dispatch is FIFO-fair across workers. At most
//! one call is in flight per worker at any time.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::config::{self, PoolConfig};
use crate::connector::{self, CompletionHandle, ExitOutcome, WorkerClient};
use crate::error::{CorralError, Result};
use crate::launcher;
use crate::protocol::builtin;
use crate::protocol::command::{self, Command, FieldValues};

/// Per-call timing overrides.
///
/// `timeout` is relative to dispatch, `deadline` absolute; when both are
/// given the earlier one wins. When neither is set the pool's configured
/// default applies. A zero timeout fails the call at the next scheduler
/// pass unless the answer is already in.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }
}

/// A submitted job's pending result.
///
/// Resolves with the command's decoded response fields, or rejects with
/// the error raised during dispatch, timeout, or worker crash.
#[derive(Debug)]
pub struct Call {
    rx: oneshot::Receiver<Result<FieldValues>>,
}

impl Future for Call {
    type Output = Result<FieldValues>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(CorralError::PoolStopped),
        })
    }
}

/// A point-in-time snapshot of pool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatus {
    pub min: usize,
    pub max: usize,
    /// Workers ready for a job.
    pub ready: usize,
    /// Workers with a call in flight.
    pub busy: usize,
    /// Workers being retired.
    pub stopping: usize,
    /// Jobs waiting for a free worker.
    pub queued: usize,
    /// All tracked workers, including stopping ones.
    pub total: usize,
}

/// Handle to a worker pool.
///
/// Cloneable; all clones drive the same supervisor task. Dropping every
/// handle tears the pool down and kills its workers.
#[derive(Debug, Clone)]
pub struct Pool {
    tx: mpsc::UnboundedSender<PoolMsg>,
}

impl Pool {
    /// Create a pool. The supervisor task starts immediately but no
    /// workers are launched until [`start`](Self::start).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            config,
            running: false,
            workers: HashMap::new(),
            ready: VecDeque::new(),
            queue: VecDeque::new(),
            next_seq: 0,
            events_tx,
            stop_waiters: Vec::new(),
        };
        tokio::spawn(supervisor.run(rx, events_rx));
        Pool { tx }
    }

    /// Mark the pool active and grow it to `min` workers.
    ///
    /// Idempotent: starting a running pool just tops it back up to `min`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for bad sizing bounds and `Spawn` if the
    /// pool cannot reach `min` workers; no workers are left running in the
    /// failure case.
    pub async fn start(&self) -> Result<()> {
        self.request(|reply| PoolMsg::Start { reply }).await?
    }

    /// Stop the pool: fail all queued work, gracefully stop every worker,
    /// and resolve once all of them have exited. No automatic restarts
    /// happen afterwards.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| PoolMsg::Stop { reply }).await
    }

    /// Submit a job.
    ///
    /// Never blocks: the returned [`Call`] resolves with the response
    /// fields or the job's failure. Argument validation errors surface
    /// through the `Call` immediately.
    pub fn submit(&self, command: &Command, args: FieldValues, options: CallOptions) -> Call {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = command::check_args(command, &args) {
            let _ = tx.send(Err(e));
            return Call { rx };
        }
        // a closed channel resolves the Call as PoolStopped
        let _ = self.tx.send(PoolMsg::Submit {
            command: *command,
            args,
            options,
            reply: tx,
        });
        Call { rx }
    }

    /// Alias for [`submit`](Self::submit).
    pub fn call(&self, command: &Command, args: FieldValues, options: CallOptions) -> Call {
        self.submit(command, args, options)
    }

    /// Change the pool's sizing bounds and resize to fit.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` — without mutating any state — if `max`
    /// is zero or `min > max`.
    pub async fn adjust_pool_size(&self, min: usize, max: usize) -> Result<()> {
        self.request(|reply| PoolMsg::AdjustSize { min, max, reply })
            .await?
    }

    /// Grow the pool to at least `target` workers.
    pub async fn grow_to(&self, target: usize) -> Result<()> {
        self.request(|reply| PoolMsg::GrowTo { target, reply }).await?
    }

    /// Shrink the pool to at most `target` workers, stopping the excess
    /// gracefully (ready workers first).
    pub async fn shrink_to(&self, target: usize) -> Result<()> {
        self.request(|reply| PoolMsg::ShrinkTo { target, reply })
            .await?
    }

    /// Snapshot the pool's current state.
    pub async fn status(&self) -> Result<PoolStatus> {
        self.request(|reply| PoolMsg::Status { reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> PoolMsg) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .map_err(|_| CorralError::PoolStopped)?;
        rx.await.map_err(|_| CorralError::PoolStopped)
    }
}

enum PoolMsg {
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Submit {
        command: Command,
        args: FieldValues,
        options: CallOptions,
        reply: oneshot::Sender<Result<FieldValues>>,
    },
    AdjustSize {
        min: usize,
        max: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    GrowTo {
        target: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    ShrinkTo {
        target: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<PoolStatus>,
    },
}

enum PoolEvent {
    CallFinished {
        worker_id: String,
        disposition: CallDisposition,
    },
    WorkerExited {
        worker_id: String,
        outcome: ExitOutcome,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallDisposition {
    /// The worker produced a response (success or command error) and is
    /// still usable.
    Answered,
    /// The deadline fired and the worker's process was signalled.
    TimedOut,
    /// The worker died mid-call.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Ready,
    Busy,
    Stopping,
}

struct WorkerEntry {
    client: WorkerClient,
    completion: CompletionHandle,
    pid: u32,
    state: WorkerState,
    calls: u32,
    last_active: Instant,
}

/// A queued job waiting for a free worker.
struct PendingWork {
    seq: u64,
    command: Command,
    args: FieldValues,
    options: CallOptions,
    reply: oneshot::Sender<Result<FieldValues>>,
}

struct Supervisor {
    config: PoolConfig,
    running: bool,
    workers: HashMap<String, WorkerEntry>,
    ready: VecDeque<String>,
    queue: VecDeque<PendingWork>,
    next_seq: u64,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut msgs: mpsc::UnboundedReceiver<PoolMsg>,
        mut events: mpsc::UnboundedReceiver<PoolEvent>,
    ) {
        let mut msgs_open = true;
        let mut prune = interval_at(Instant::now() + self.config.max_idle, self.config.max_idle);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !msgs_open && self.workers.is_empty() {
                break;
            }
            tokio::select! {
                msg = msgs.recv(), if msgs_open => {
                    match msg {
                        Some(msg) => self.handle_msg(msg),
                        None => {
                            // every handle is gone; tear everything down
                            msgs_open = false;
                            self.handle_orphaned();
                        }
                    }
                }
                // the supervisor keeps an events sender, so this never
                // yields None
                Some(event) = events.recv() => self.handle_event(event),
                _ = prune.tick(), if self.running => self.prune_idle(),
            }
        }
    }

    fn handle_msg(&mut self, msg: PoolMsg) {
        match msg {
            PoolMsg::Start { reply } => self.handle_start(reply),
            PoolMsg::Stop { reply } => self.handle_stop(reply),
            PoolMsg::Submit {
                command,
                args,
                options,
                reply,
            } => self.handle_submit(command, args, options, reply),
            PoolMsg::AdjustSize { min, max, reply } => self.handle_adjust(min, max, reply),
            PoolMsg::GrowTo { target, reply } => self.handle_grow_to(target, reply),
            PoolMsg::ShrinkTo { target, reply } => self.handle_shrink_to(target, reply),
            PoolMsg::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::CallFinished {
                worker_id,
                disposition,
            } => self.handle_call_finished(&worker_id, disposition),
            PoolEvent::WorkerExited { worker_id, outcome } => {
                self.handle_worker_exited(&worker_id, outcome)
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn handle_start(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.running {
            self.ensure_min();
            let _ = reply.send(Ok(()));
            return;
        }
        if let Err(e) = self.config.validate() {
            let _ = reply.send(Err(e));
            return;
        }
        self.running = true;
        while self.active_count() < self.config.min {
            if let Err(e) = self.grow_one() {
                tracing::warn!("pool start aborted: {e}");
                self.running = false;
                self.force_kill_all();
                let _ = reply.send(Err(e));
                return;
            }
        }
        tracing::debug!(workers = self.workers.len(), "pool started");
        let _ = reply.send(Ok(()));
    }

    fn handle_stop(&mut self, reply: oneshot::Sender<()>) {
        self.running = false;
        for work in self.queue.drain(..) {
            let _ = work.reply.send(Err(CorralError::PoolStopped));
        }
        let ids: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, entry)| entry.state != WorkerState::Stopping)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.retire(&id);
        }
        if self.workers.is_empty() {
            let _ = reply.send(());
        } else {
            tracing::debug!(workers = self.workers.len(), "pool stopping");
            self.stop_waiters.push(reply);
        }
    }

    /// All pool handles were dropped without `stop()`: force-kill the
    /// workers and drain until the map is empty.
    fn handle_orphaned(&mut self) {
        self.running = false;
        for work in self.queue.drain(..) {
            let _ = work.reply.send(Err(CorralError::PoolStopped));
        }
        self.force_kill_all();
    }

    fn force_kill_all(&mut self) {
        for (id, entry) in self.workers.iter_mut() {
            if entry.state != WorkerState::Stopping {
                tracing::debug!(worker = %id, "force-killing worker");
                entry.state = WorkerState::Stopping;
            }
            launcher::kill_worker(entry.pid, config::Signal::Kill);
        }
        self.ready.clear();
    }

    // ========================================================================
    // Job routing
    // ========================================================================

    fn handle_submit(
        &mut self,
        command: Command,
        args: FieldValues,
        options: CallOptions,
        reply: oneshot::Sender<Result<FieldValues>>,
    ) {
        if !self.running {
            let _ = reply.send(Err(CorralError::PoolStopped));
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let work = PendingWork {
            seq,
            command,
            args,
            options,
            reply,
        };

        if let Some(id) = self.pop_ready() {
            self.dispatch(id, work);
            return;
        }
        if self.workers.len() < self.config.max {
            match self.grow_one() {
                Ok(_) => {
                    if let Some(id) = self.pop_ready() {
                        self.dispatch(id, work);
                    } else {
                        self.queue.push_back(work);
                    }
                }
                Err(e) => {
                    // spawn failure rejects the job immediately
                    tracing::warn!("failed to grow pool for submission: {e}");
                    let _ = work.reply.send(Err(e));
                }
            }
            return;
        }
        tracing::debug!(seq = work.seq, queued = self.queue.len() + 1, "pool saturated, queueing job");
        self.queue.push_back(work);
    }

    /// Pop the oldest ready worker.
    fn pop_ready(&mut self) -> Option<String> {
        while let Some(id) = self.ready.pop_front() {
            if let Some(entry) = self.workers.get(&id)
                && entry.state == WorkerState::Ready
            {
                return Some(id);
            }
        }
        None
    }

    fn dispatch(&mut self, id: String, work: PendingWork) {
        let now = Instant::now();
        let deadline = self.effective_deadline(&work.options, now);
        let signal = self.config.timeout_signal;

        let Some(entry) = self.workers.get_mut(&id) else {
            self.queue.push_front(work);
            return;
        };
        if entry.client.is_closed() {
            // died just before dispatch; its exit event will replace it
            // and drain the queue again
            entry.state = WorkerState::Stopping;
            self.queue.push_front(work);
            return;
        }

        entry.state = WorkerState::Busy;
        entry.calls += 1;
        entry.last_active = now;

        let PendingWork {
            command,
            args,
            reply,
            ..
        } = work;
        let (tx, rx) = oneshot::channel();
        if !entry.client.call(command, args, tx) {
            let _ = reply.send(Err(CorralError::WorkerLost(
                "worker connection closed".to_string(),
            )));
            entry.state = WorkerState::Stopping;
            return;
        }
        tracing::trace!(worker = %id, command = command.name, call = entry.calls, "dispatched");

        let pid = entry.pid;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let (result, disposition) = match deadline {
                None => receive(rx).await,
                Some(at) => {
                    tokio::select! {
                        biased;
                        received = rx => finished(received),
                        _ = tokio::time::sleep_until(at) => {
                            // best-effort: a no-op if the process already
                            // exited
                            launcher::kill_worker(pid, signal);
                            (Err(CorralError::Timeout), CallDisposition::TimedOut)
                        }
                    }
                }
            };
            let _ = reply.send(result);
            let _ = events.send(PoolEvent::CallFinished {
                worker_id: id,
                disposition,
            });
        });
    }

    fn effective_deadline(&self, options: &CallOptions, now: Instant) -> Option<Instant> {
        let mut deadline = options.timeout.map(|t| now + t);
        if let Some(at) = options.deadline {
            deadline = Some(match deadline {
                Some(existing) => existing.min(at),
                None => at,
            });
        }
        if deadline.is_none() {
            deadline = self.config.call_timeout.map(|t| now + t);
        }
        deadline
    }

    fn handle_call_finished(&mut self, worker_id: &str, disposition: CallDisposition) {
        let mut recycle = false;
        if let Some(entry) = self.workers.get_mut(worker_id) {
            match disposition {
                CallDisposition::Answered => {
                    if entry.state == WorkerState::Busy {
                        entry.last_active = Instant::now();
                        if self.config.recycle_after > 0
                            && entry.calls >= self.config.recycle_after
                        {
                            recycle = true;
                        } else {
                            entry.state = WorkerState::Ready;
                            self.ready.push_back(worker_id.to_string());
                        }
                    }
                    // a Stopping worker finishing its last job stays on its
                    // way out
                }
                CallDisposition::TimedOut | CallDisposition::Lost => {
                    // signalled or dead; route nothing else to it
                    entry.state = WorkerState::Stopping;
                    self.ready.retain(|w| w != worker_id);
                }
            }
        }
        if recycle {
            tracing::debug!(worker = %worker_id, "recycling worker");
            self.retire(worker_id);
            self.ensure_min();
        }
        self.drain_queue();
    }

    fn handle_worker_exited(&mut self, worker_id: &str, outcome: ExitOutcome) {
        if self.workers.remove(worker_id).is_some() {
            self.ready.retain(|w| w != worker_id);
            tracing::debug!(worker = %worker_id, %outcome, "worker removed");
            if self.running {
                self.ensure_min();
                self.drain_queue();
            }
        }
        if !self.running && self.workers.is_empty() {
            for waiter in self.stop_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn drain_queue(&mut self) {
        while !self.queue.is_empty() {
            if let Some(id) = self.pop_ready() {
                let work = self.queue.pop_front().expect("queue checked non-empty");
                self.dispatch(id, work);
            } else if self.running && self.workers.len() < self.config.max {
                if let Err(e) = self.grow_one() {
                    tracing::warn!("failed to grow pool while draining queue: {e}");
                    break;
                }
            } else {
                break;
            }
        }
    }

    // ========================================================================
    // Sizing
    // ========================================================================

    fn handle_adjust(&mut self, min: usize, max: usize, reply: oneshot::Sender<Result<()>>) {
        if let Err(e) = config::validate_bounds(min, max) {
            let _ = reply.send(Err(e));
            return;
        }
        self.config.min = min;
        self.config.max = max;
        if self.running {
            self.ensure_min();
            if self.active_count() > max {
                self.shrink_active_to(max);
            }
            self.drain_queue();
        }
        let _ = reply.send(Ok(()));
    }

    fn handle_grow_to(&mut self, target: usize, reply: oneshot::Sender<Result<()>>) {
        if !self.running {
            let _ = reply.send(Err(CorralError::PoolStopped));
            return;
        }
        if target > self.config.max {
            let _ = reply.send(Err(CorralError::InvalidArgument(format!(
                "grow target {target} exceeds max {}",
                self.config.max
            ))));
            return;
        }
        while self.active_count() < target {
            if let Err(e) = self.grow_one() {
                let _ = reply.send(Err(e));
                return;
            }
        }
        self.drain_queue();
        let _ = reply.send(Ok(()));
    }

    fn handle_shrink_to(&mut self, target: usize, reply: oneshot::Sender<Result<()>>) {
        if !self.running {
            let _ = reply.send(Err(CorralError::PoolStopped));
            return;
        }
        if target < self.config.min {
            let _ = reply.send(Err(CorralError::InvalidArgument(format!(
                "shrink target {target} is below min {}",
                self.config.min
            ))));
            return;
        }
        self.shrink_active_to(target);
        let _ = reply.send(Ok(()));
    }

    /// Retire workers until at most `target` are active, preferring ready
    /// ones; if none are ready, any worker not already stopping is picked.
    fn shrink_active_to(&mut self, target: usize) {
        while self.active_count() > target {
            let victim = self.ready.front().cloned().or_else(|| {
                self.workers
                    .iter()
                    .find(|(_, entry)| entry.state == WorkerState::Busy)
                    .map(|(id, _)| id.clone())
            });
            match victim {
                Some(id) => self.retire(&id),
                None => break,
            }
        }
    }

    /// Start replacements until the pool is back at `min` active workers.
    /// Failures are logged; the pool keeps operating with fewer workers
    /// and retries on the next event.
    fn ensure_min(&mut self) {
        if !self.running {
            return;
        }
        while self.active_count() < self.config.min {
            if let Err(e) = self.grow_one() {
                tracing::warn!("failed to start replacement worker: {e}");
                break;
            }
        }
    }

    fn grow_one(&mut self) -> Result<String> {
        let spawned = launcher::spawn_worker(&self.config.launch)?;
        let id = format!("worker-{}", nanoid::nanoid!(8));
        let pid = spawned.pid;
        let handle = connector::spawn_connector(id.clone(), spawned);

        // bridge the process exit into the supervisor's event stream
        let mut completion = handle.completion.clone();
        let events = self.events_tx.clone();
        let worker_id = id.clone();
        tokio::spawn(async move {
            let outcome = completion.wait().await;
            let _ = events.send(PoolEvent::WorkerExited { worker_id, outcome });
        });

        tracing::debug!(worker = %id, pid, "started worker");
        self.workers.insert(
            id.clone(),
            WorkerEntry {
                client: handle.client,
                completion: handle.completion,
                pid,
                state: WorkerState::Ready,
                calls: 0,
                last_active: Instant::now(),
            },
        );
        self.ready.push_back(id.clone());
        Ok(id)
    }

    /// Gracefully stop one worker: issue the shutdown command, then
    /// force-kill if it has not exited within the grace period. Issuing
    /// shutdown to an already-dead worker is ignored.
    fn retire(&mut self, worker_id: &str) {
        let grace = self.config.stop_grace;
        // always drop it from the ready set, even if the entry is gone
        self.ready.retain(|w| w != worker_id);
        let Some(entry) = self.workers.get_mut(worker_id) else {
            return;
        };
        if entry.state == WorkerState::Stopping {
            return;
        }
        entry.state = WorkerState::Stopping;
        let pid = entry.pid;
        let (tx, rx) = oneshot::channel();
        let sent = entry.client.call(builtin::SHUTDOWN, FieldValues::new(), tx);
        let mut completion = entry.completion.clone();
        tracing::debug!(worker = %worker_id, "stopping worker");

        tokio::spawn(async move {
            let graceful = async move {
                if sent {
                    // ack, command error, or drop — any of them moves on
                    let _ = rx.await;
                }
                completion.wait().await
            };
            if tokio::time::timeout(grace, graceful).await.is_err() {
                launcher::kill_worker(pid, config::Signal::Kill);
            }
        });
    }

    /// Retire ready workers that have sat idle past `max_idle`, as long as
    /// the pool stays at or above `min`.
    fn prune_idle(&mut self) {
        let now = Instant::now();
        let active = self.active_count();
        let mut victims = Vec::new();
        for id in self.ready.clone() {
            if active - victims.len() <= self.config.min {
                break;
            }
            if let Some(entry) = self.workers.get(&id)
                && entry.state == WorkerState::Ready
                && now.duration_since(entry.last_active) >= self.config.max_idle
            {
                victims.push(id);
            }
        }
        for id in &victims {
            tracing::debug!(worker = %id, "pruning idle worker");
            self.retire(id);
        }
    }

    fn active_count(&self) -> usize {
        self.workers
            .values()
            .filter(|entry| entry.state != WorkerState::Stopping)
            .count()
    }

    fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            min: self.config.min,
            max: self.config.max,
            queued: self.queue.len(),
            total: self.workers.len(),
            ..PoolStatus::default()
        };
        for entry in self.workers.values() {
            match entry.state {
                WorkerState::Ready => status.ready += 1,
                WorkerState::Busy => status.busy += 1,
                WorkerState::Stopping => status.stopping += 1,
            }
        }
        status
    }
}

async fn receive(
    rx: oneshot::Receiver<Result<FieldValues>>,
) -> (Result<FieldValues>, CallDisposition) {
    finished(rx.await)
}

fn finished(
    received: std::result::Result<Result<FieldValues>, oneshot::error::RecvError>,
) -> (Result<FieldValues>, CallDisposition) {
    match received {
        Ok(result) => {
            let disposition = match &result {
                Err(CorralError::WorkerLost(_)) | Err(CorralError::Protocol(_)) => {
                    CallDisposition::Lost
                }
                _ => CallDisposition::Answered,
            };
            (result, disposition)
        }
        Err(_) => (
            Err(CorralError::WorkerLost(
                "worker connection closed".to_string(),
            )),
            CallDisposition::Lost,
        ),
    }
}

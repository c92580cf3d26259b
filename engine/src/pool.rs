use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::{AbortHandle, JoinError};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use autocrawl_core::error::{Error, Result};

use crate::config::PoolConfig;
use crate::events::{Event, EventSender};
use crate::system_status::StatusSource;
use crate::throughput::ThroughputLimiter;
use crate::utils::scale_step;

/// Lifecycle of an autoscaled pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolState {
    Created,
    Running,
    Paused,
    /// Nothing runs and the provider has no work, but more may still appear
    Draining,
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolState::Created => write!(f, "created"),
            PoolState::Running => write!(f, "running"),
            PoolState::Paused => write!(f, "paused"),
            PoolState::Draining => write!(f, "draining"),
            PoolState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Handed to every task. Carries the pool's cooperative abort signal.
#[derive(Debug, Clone)]
pub struct TaskContext {
    slot_id: u64,
    abort: watch::Receiver<bool>,
}

impl TaskContext {
    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    /// Whether the pool asked its tasks to stop
    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Resolves once the pool asks its tasks to stop
    pub async fn aborted(&self) {
        let mut receiver = self.abort.clone();
        let _ = receiver.wait_for(|aborted| *aborted).await;
    }
}

/// Supplies the units of work run by an [`AutoscaledPool`]
#[async_trait]
pub trait TaskProvider: Send + Sync + 'static {
    /// Whether a task could be started right now
    async fn is_task_ready(&self) -> Result<bool>;

    /// Run one task. `Ok(false)` means no work was available after all.
    async fn run_task(&self, context: TaskContext) -> Result<bool>;

    /// Whether no more work will ever appear
    async fn is_finished(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Counters of a pool run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub tasks_started: usize,
    pub tasks_finished: usize,
    pub tasks_failed: usize,
    pub tasks_timed_out: usize,
    /// Tasks aborted to shed load
    pub tasks_aborted: usize,
    pub scale_ups: usize,
    pub scale_downs: usize,
    pub peak_concurrency: usize,
}

type SlotOutcome = (u64, std::result::Result<Result<bool>, JoinError>);

/// Tasks in flight, keyed by slot id in start order
struct Slots {
    futures: FuturesUnordered<BoxFuture<'static, SlotOutcome>>,
    handles: BTreeMap<u64, AbortHandle>,
    next_id: u64,
}

impl Slots {
    fn new() -> Self {
        Self {
            futures: FuturesUnordered::new(),
            handles: BTreeMap::new(),
            next_id: 0,
        }
    }

    fn len(&self) -> usize {
        self.handles.len()
    }

    fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn spawn(
        &mut self,
        provider: Arc<dyn TaskProvider>,
        abort: watch::Receiver<bool>,
        timeout: Option<Duration>,
    ) -> u64 {
        self.next_id += 1;
        let slot_id = self.next_id;
        let context = TaskContext { slot_id, abort };

        let handle = tokio::spawn(async move {
            let task = provider.run_task(context);
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, task).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(limit)),
                },
                None => task.await,
            }
        });

        self.handles.insert(slot_id, handle.abort_handle());
        self.futures
            .push(handle.map(move |outcome| (slot_id, outcome)).boxed());
        slot_id
    }

    /// Abort the most recently started task
    fn abort_newest(&mut self) -> Option<u64> {
        let (slot_id, handle) = self.handles.pop_last()?;
        handle.abort();
        Some(slot_id)
    }
}

impl Drop for Slots {
    fn drop(&mut self) {
        for handle in self.handles.values() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Started,
    Saturated,
    NotReady,
    Paused,
}

/// Runs tasks from a [`TaskProvider`] and scales their concurrency
/// to what the system can take.
pub struct AutoscaledPool {
    config: PoolConfig,
    provider: Arc<dyn TaskProvider>,
    status: Arc<dyn StatusSource>,
    state: RwLock<PoolState>,
    current: AtomicUsize,
    desired: AtomicUsize,
    abort_signal: watch::Sender<bool>,
    wake: Notify,
    stats: RwLock<PoolStats>,
    events: Option<EventSender>,
}

impl AutoscaledPool {
    /// Create a new pool
    pub fn new(
        config: PoolConfig,
        provider: Arc<dyn TaskProvider>,
        status: Arc<dyn StatusSource>,
    ) -> Result<Self> {
        config.validate()?;
        let desired = config.initial_desired_concurrency();
        let (abort_signal, _) = watch::channel(false);

        Ok(Self {
            config,
            provider,
            status,
            state: RwLock::new(PoolState::Created),
            current: AtomicUsize::new(0),
            desired: AtomicUsize::new(desired),
            abort_signal,
            wake: Notify::new(),
            stats: RwLock::new(PoolStats::default()),
            events: None,
        })
    }

    /// Emit lifecycle events on the given channel
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn current_concurrency(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn desired_concurrency(&self) -> usize {
        self.desired.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> PoolState {
        *self.state.read().await
    }

    pub async fn stats(&self) -> PoolStats {
        self.stats.read().await.clone()
    }

    /// Run until the provider is finished, the pool is aborted, or too many
    /// tasks fail in a row. A pool runs only once.
    pub async fn run(&self) -> Result<PoolStats> {
        {
            let mut state = self.state.write().await;
            if *state != PoolState::Created {
                return Err(Error::pool(format!("cannot run a pool that is {}", *state)));
            }
            *state = PoolState::Running;
        }
        self.emit(Event::PoolStarted);
        self.emit(Event::StateChanged {
            from: PoolState::Created,
            to: PoolState::Running,
        });
        info!(
            "AutoscaledPool started (min: {}, max: {}, desired concurrency: {})",
            self.config.min_concurrency,
            self.config.max_concurrency,
            self.desired_concurrency()
        );

        let result = self.run_loop().await;

        let from = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, PoolState::Stopped)
        };
        self.emit(Event::StateChanged {
            from,
            to: PoolState::Stopped,
        });
        self.current.store(0, Ordering::SeqCst);

        let stats = self.stats().await;
        self.emit(Event::PoolStopped(stats.clone()));

        match result {
            Ok(()) => {
                info!(
                    "AutoscaledPool stopped: {} tasks finished, {} failed, {} aborted",
                    stats.tasks_finished, stats.tasks_failed, stats.tasks_aborted
                );
                Ok(stats)
            }
            Err(e) => {
                error!("AutoscaledPool stopped with error: {}", e);
                Err(e)
            }
        }
    }

    /// Stop starting tasks and let the running ones finish. Tasks can watch
    /// [`TaskContext::aborted`] to stop early.
    pub async fn abort(&self) {
        if !self.abort_signal.send_replace(true) {
            info!("Aborting AutoscaledPool");
        }
        self.wake.notify_one();
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort_signal.borrow()
    }

    /// Stop starting tasks until resumed. Running tasks are not affected.
    pub async fn pause(&self) -> Result<()> {
        let mut state = self.state.write().await;
        match *state {
            PoolState::Paused => Ok(()),
            PoolState::Running | PoolState::Draining => {
                let from = std::mem::replace(&mut *state, PoolState::Paused);
                drop(state);
                self.emit(Event::StateChanged {
                    from,
                    to: PoolState::Paused,
                });
                info!("AutoscaledPool paused");
                Ok(())
            }
            other => Err(Error::pool(format!("cannot pause a pool that is {}", other))),
        }
    }

    pub async fn resume(&self) -> Result<()> {
        let mut state = self.state.write().await;
        match *state {
            PoolState::Running | PoolState::Draining => Ok(()),
            PoolState::Paused => {
                *state = PoolState::Running;
                drop(state);
                self.emit(Event::StateChanged {
                    from: PoolState::Paused,
                    to: PoolState::Running,
                });
                self.wake.notify_one();
                info!("AutoscaledPool resumed");
                Ok(())
            }
            other => Err(Error::pool(format!("cannot resume a pool that is {}", other))),
        }
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }

    async fn change_state(&self, from: PoolState, to: PoolState) {
        let mut state = self.state.write().await;
        if *state == from {
            *state = to;
            drop(state);
            debug!("AutoscaledPool {} -> {}", from, to);
            self.emit(Event::StateChanged { from, to });
        }
    }

    async fn run_loop(&self) -> Result<()> {
        let mut slots = Slots::new();
        let mut limiter = ThroughputLimiter::new(self.config.max_tasks_per_minute);
        let mut consecutive_failures = 0usize;
        let mut fatal: Option<Error> = None;
        let mut drain_started: Option<Instant> = None;

        let mut maybe_run = interval(self.config.maybe_run_interval);
        let mut autoscale = interval_at(
            Instant::now() + self.config.autoscale_interval,
            self.config.autoscale_interval,
        );
        let mut logging = interval_at(
            Instant::now() + self.config.logging_interval,
            self.config.logging_interval,
        );
        for ticker in [&mut maybe_run, &mut autoscale, &mut logging] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            let stopping = fatal.is_some() || self.is_aborted();
            if stopping {
                if slots.is_empty() {
                    break;
                }
            } else {
                let dispatch = self.dispatch(&mut slots, &mut limiter).await?;
                if dispatch == Dispatch::NotReady && slots.is_empty() {
                    if self.provider.is_finished().await? {
                        info!("AutoscaledPool: all tasks finished");
                        break;
                    }

                    let since = *drain_started.get_or_insert_with(Instant::now);
                    self.change_state(PoolState::Running, PoolState::Draining)
                        .await;
                    if let Some(limit) = self.config.drain_timeout {
                        if since.elapsed() >= limit {
                            warn!("AutoscaledPool: no new work for {:?}, stopping", limit);
                            break;
                        }
                    }
                } else if dispatch != Dispatch::Paused {
                    drain_started = None;
                    self.change_state(PoolState::Draining, PoolState::Running)
                        .await;
                }
            }

            tokio::select! {
                Some((slot_id, outcome)) = slots.futures.next(), if !slots.futures.is_empty() => {
                    let failure = self
                        .complete(slot_id, outcome, &mut slots, &mut consecutive_failures)
                        .await;
                    if let Some(error) = failure {
                        if fatal.is_none() {
                            error!("AutoscaledPool: {}, aborting", error);
                            self.abort_signal.send_replace(true);
                            fatal = Some(error);
                        }
                    }
                }
                _ = maybe_run.tick() => {}
                _ = autoscale.tick(), if !stopping => self.autoscale(&mut slots).await?,
                _ = logging.tick() => self.log_state(slots.len()).await,
                _ = self.wake.notified() => {}
            }
        }

        match fatal {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Start tasks while every gate allows it
    async fn dispatch(
        &self,
        slots: &mut Slots,
        limiter: &mut ThroughputLimiter,
    ) -> Result<Dispatch> {
        let mut started = false;

        loop {
            if *self.state.read().await == PoolState::Paused {
                return Ok(Dispatch::Paused);
            }
            if self.is_aborted() {
                break;
            }

            let current = slots.len();
            if current >= self.desired_concurrency() {
                break;
            }
            // shed load faster than the autoscale interval, but never below min
            if current >= self.config.min_concurrency
                && !self.status.current_status().await.is_system_idle
            {
                break;
            }

            let now = Instant::now();
            if !limiter.allows(now) {
                break;
            }
            if !self.provider.is_task_ready().await? {
                return Ok(if started {
                    Dispatch::Started
                } else {
                    Dispatch::NotReady
                });
            }

            limiter.record(now);
            let slot_id = slots.spawn(
                self.provider.clone(),
                self.abort_signal.subscribe(),
                self.config.task_timeout,
            );
            started = true;

            let current = slots.len();
            self.current.store(current, Ordering::SeqCst);
            {
                let mut stats = self.stats.write().await;
                stats.tasks_started += 1;
                stats.peak_concurrency = stats.peak_concurrency.max(current);
            }
            debug!("Started task in slot {} ({} running)", slot_id, current);
            self.emit(Event::TaskStarted { slot_id });
        }

        Ok(if started {
            Dispatch::Started
        } else {
            Dispatch::Saturated
        })
    }

    /// Book a finished slot. Returns an error once failures in a row hit
    /// the configured limit.
    async fn complete(
        &self,
        slot_id: u64,
        outcome: std::result::Result<Result<bool>, JoinError>,
        slots: &mut Slots,
        consecutive_failures: &mut usize,
    ) -> Option<Error> {
        slots.handles.remove(&slot_id);
        self.current.store(slots.len(), Ordering::SeqCst);

        let message = {
            let mut stats = self.stats.write().await;
            match outcome {
                Ok(Ok(_)) => {
                    stats.tasks_finished += 1;
                    *consecutive_failures = 0;
                    return None;
                }
                // counted when the slot was aborted
                Err(e) if e.is_cancelled() => return None,
                Ok(Err(e)) => {
                    if matches!(e, Error::Timeout(_)) {
                        stats.tasks_timed_out += 1;
                    }
                    stats.tasks_failed += 1;
                    warn!("Task in slot {} failed: {}", slot_id, e);
                    e.to_string()
                }
                Err(e) => {
                    stats.tasks_failed += 1;
                    error!("Task in slot {} panicked: {}", slot_id, e);
                    e.to_string()
                }
            }
        };

        *consecutive_failures += 1;
        self.emit(Event::TaskFailed {
            slot_id,
            message: message.clone(),
        });

        match self.config.max_consecutive_task_failures {
            Some(limit) if *consecutive_failures >= limit => Some(Error::pool(format!(
                "{} tasks failed in a row, last error: {}",
                consecutive_failures, message
            ))),
            _ => None,
        }
    }

    /// Adjust the desired concurrency to the system status
    async fn autoscale(&self, slots: &mut Slots) -> Result<()> {
        let desired = self.desired_concurrency();
        let current_status = self.status.current_status().await;

        if !current_status.is_system_idle {
            if desired > self.config.min_concurrency {
                let lowered = desired
                    .saturating_sub(scale_step(desired, self.config.scale_down_step_ratio))
                    .max(self.config.min_concurrency);
                self.desired.store(lowered, Ordering::SeqCst);
                self.stats.write().await.scale_downs += 1;
                debug!(
                    "Scaling down desired concurrency {} -> {} (overloaded: {:?})",
                    desired,
                    lowered,
                    current_status.overloaded()
                );
                self.emit(Event::ConcurrencyChanged {
                    previous: desired,
                    desired: lowered,
                });
            }

            // shed at most one task per tick
            if slots.len() > self.desired_concurrency() {
                if let Some(slot_id) = slots.abort_newest() {
                    self.current.store(slots.len(), Ordering::SeqCst);
                    self.stats.write().await.tasks_aborted += 1;
                    debug!("Aborted task in slot {} to shed load", slot_id);
                    self.emit(Event::TaskAborted { slot_id });
                }
            }
            return Ok(());
        }

        let historical = self.status.historical_status().await;
        let ceiling = (desired as f64 * self.config.desired_concurrency_ratio).floor();
        if historical.is_system_idle
            && desired < self.config.max_concurrency
            && slots.len() as f64 >= ceiling
            && self.provider.is_task_ready().await?
        {
            let raised = (desired + scale_step(desired, self.config.scale_up_step_ratio))
                .min(self.config.max_concurrency);
            self.desired.store(raised, Ordering::SeqCst);
            self.stats.write().await.scale_ups += 1;
            debug!("Scaling up desired concurrency {} -> {}", desired, raised);
            self.emit(Event::ConcurrencyChanged {
                previous: desired,
                desired: raised,
            });
            self.wake.notify_one();
        }

        Ok(())
    }

    async fn log_state(&self, current: usize) {
        let status = self.status.current_status().await;
        info!(
            "AutoscaledPool state: {} (concurrency: {} of {} desired, system idle: {})",
            self.state().await,
            current,
            self.desired_concurrency(),
            status.is_system_idle
        );
    }
}

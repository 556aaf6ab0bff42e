//! Workload scheduler: admission, placement, staging, dispatch and
//! lifecycle bookkeeping.
//!
//! The scheduler owns a single in-memory bookkeeping lock. The lock is
//! never held across an await point; staging and dispatch run against
//! transport traits with no locks taken, and every transition re-checks
//! the workload state afterwards so a concurrent cancel or sweep wins.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use fleetgrid_placement::{build_candidates, rank, satisfiable};
use fleetgrid_registry::{DeviceRegistry, RegistryEvent, ResourceLedger};
use fleetgrid_state::{
    Affinity, DeviceId, DeviceRecord, ExecutableRef, FailureReason, ResourceSpec, StateStore,
    WorkloadId, WorkloadRecord, WorkloadState,
};

use crate::distributor::{Dispatcher, ExecutableDistributor};
use crate::error::{SchedulerError, SchedulerResult};
use crate::queue::SchedulingQueue;

/// Tunables for retry and timeout behavior.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Staging attempts before a workload is failed outright.
    pub staging_retry_limit: u32,
    /// Deadline applied to workloads that do not carry their own.
    pub default_deadline: Option<Duration>,
    /// How long an assigned device may stay offline before its
    /// workloads are declared lost.
    pub device_lost_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            staging_retry_limit: 3,
            default_deadline: None,
            device_lost_grace: Duration::from_secs(60),
        }
    }
}

/// Admission request for a new workload.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub workload_id: WorkloadId,
    pub executable: ExecutableRef,
    pub request: ResourceSpec,
    pub affinity: Affinity,
    /// Staging+execution deadline; falls back to the config default.
    pub deadline: Option<Duration>,
}

/// Terminal outcome reported by the device that ran the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed,
}

/// Outcome of a single placement attempt.
enum Placement {
    /// A reservation was taken; stage the executable next.
    Staged {
        device_id: DeviceId,
        executable: ExecutableRef,
    },
    /// No device can currently host the workload but one could in
    /// principle; the workload sits in the queue.
    Queued,
    /// No known device could ever host the workload.
    Unsatisfiable,
    /// The workload left the schedulable states while we were looking.
    Settled(WorkloadState),
}

/// What happened after a staging/dispatch round.
enum StageFlow {
    Dispatched,
    /// A concurrent cancel or sweep terminalized the workload.
    Interrupted,
    /// Released and re-queued; the placement loop should go again.
    Retry,
    LimitReached,
}

#[derive(Default)]
struct Inner {
    workloads: HashMap<WorkloadId, WorkloadRecord>,
    /// Live reservations, one per Staging/Running workload. Removing an
    /// entry transfers responsibility for the matching ledger release,
    /// which is how release stays exactly-once.
    reservations: HashMap<WorkloadId, (DeviceId, ResourceSpec)>,
    /// Devices that failed staging in the current placement round.
    tried: HashMap<WorkloadId, HashSet<DeviceId>>,
    queue: SchedulingQueue,
}

/// Orchestrates workload lifecycles across the fleet.
pub struct Scheduler {
    state: StateStore,
    registry: Arc<DeviceRegistry>,
    ledger: Arc<ResourceLedger>,
    distributor: Arc<dyn ExecutableDistributor>,
    dispatcher: Arc<dyn Dispatcher>,
    config: SchedulerConfig,
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new(
        state: StateStore,
        registry: Arc<DeviceRegistry>,
        distributor: Arc<dyn ExecutableDistributor>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let ledger = registry.ledger();
        Self {
            state,
            registry,
            ledger,
            distributor,
            dispatcher,
            config: SchedulerConfig::default(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("scheduler lock poisoned")
    }

    /// Admit a workload and immediately attempt to place it. Returns
    /// the state the workload settled into for this round.
    pub async fn submit(&self, request: SubmitRequest) -> SchedulerResult<WorkloadState> {
        if self.state.get_workload(&request.workload_id)?.is_some() {
            return Err(SchedulerError::DuplicateWorkload(request.workload_id));
        }
        if self.state.get_executable(&request.executable)?.is_none() {
            return Err(SchedulerError::ExecutableNotFound(
                request.executable.table_key(),
            ));
        }

        let deadline = request.deadline.or(self.config.default_deadline);
        let record = WorkloadRecord {
            id: request.workload_id,
            executable: request.executable,
            request: request.request,
            affinity: request.affinity,
            submitted_at: epoch_secs(),
            state: WorkloadState::Pending,
            assigned_device: None,
            staging_retries: 0,
            deadline_secs: deadline.map(|d| d.as_secs()),
            deadline_at: None,
        };
        self.state.put_workload(&record)?;
        let workload_id = record.id.clone();
        {
            let mut inner = self.lock();
            inner.workloads.insert(workload_id.clone(), record);
        }
        info!(%workload_id, "workload submitted");

        self.try_schedule(&workload_id).await
    }

    /// Cancel a workload. Idempotent for workloads already in a
    /// terminal state. For a staging or running workload the device is
    /// told to stop, best effort, after the reservation is released.
    pub async fn cancel(&self, workload_id: &str) -> SchedulerResult<()> {
        let notify = {
            let mut inner = self.lock();
            let Some(record) = inner.workloads.get_mut(workload_id) else {
                return Err(SchedulerError::WorkloadNotFound(workload_id.to_string()));
            };
            if record.state.is_terminal() {
                return Ok(());
            }
            let was_active = matches!(
                record.state,
                WorkloadState::Staging | WorkloadState::Running
            );
            let device = record.assigned_device.take();
            record.state = WorkloadState::Cancelled;
            record.deadline_at = None;
            let persisted = record.clone();
            inner.queue.remove(workload_id);
            inner.tried.remove(workload_id);
            let released = self.release_reservation(&mut inner, workload_id);
            self.state.put_workload(&persisted)?;
            info!(%workload_id, "workload cancelled");
            if was_active { device.map(|d| (d, released)) } else { None }
        };

        if let Some((device_id, released)) = notify {
            self.dispatcher.cancel(&device_id, workload_id).await;
            if released {
                if let Err(e) = self.drain_queue().await {
                    warn!(error = %e, "queue drain after cancel failed");
                }
            }
        }
        Ok(())
    }

    /// Record the device-reported outcome of a workload. The device is
    /// authoritative, but a report that arrives after cancellation or
    /// a deadline sweep is a no-op; the settled state is returned.
    pub async fn report_result(
        &self,
        workload_id: &str,
        outcome: ExecutionOutcome,
    ) -> SchedulerResult<WorkloadState> {
        let (new_state, released) = {
            let mut inner = self.lock();
            let Some(record) = inner.workloads.get_mut(workload_id) else {
                return Err(SchedulerError::WorkloadNotFound(workload_id.to_string()));
            };
            if record.state.is_terminal() {
                debug!(%workload_id, state = ?record.state, "late result for settled workload");
                return Ok(record.state);
            }
            // The device is authoritative only for workloads it was
            // actually given; a report for an undispatched workload is
            // a protocol violation and must not terminalize it.
            if record.assigned_device.is_none() {
                warn!(%workload_id, state = ?record.state, "result report for undispatched workload ignored");
                return Ok(record.state);
            }
            let new_state = match outcome {
                ExecutionOutcome::Completed => WorkloadState::Completed,
                ExecutionOutcome::Failed => WorkloadState::Failed {
                    reason: FailureReason::ExecutionFailed,
                },
            };
            record.state = new_state;
            record.deadline_at = None;
            let persisted = record.clone();
            inner.queue.remove(workload_id);
            inner.tried.remove(workload_id);
            let released = self.release_reservation(&mut inner, workload_id);
            self.state.put_workload(&persisted)?;
            info!(%workload_id, state = ?new_state, "execution result recorded");
            (new_state, released)
        };

        if released {
            self.drain_queue().await?;
        }
        Ok(new_state)
    }

    /// Offer every queued workload a placement attempt, in submission
    /// order. A workload that cannot be placed this cycle stays queued
    /// and does not block younger workloads behind it. Returns how many
    /// workloads reached Running.
    pub async fn drain_queue(&self) -> SchedulerResult<usize> {
        let ids = self.lock().queue.drain_order();
        if ids.is_empty() {
            return Ok(0);
        }
        debug!(queued = ids.len(), "draining scheduling queue");
        let mut placed = 0;
        for id in ids {
            let still_queued = {
                let inner = self.lock();
                matches!(
                    inner.workloads.get(&id).map(|r| r.state),
                    Some(WorkloadState::Queued)
                )
            };
            if !still_queued {
                continue;
            }
            if self.try_schedule(&id).await? == WorkloadState::Running {
                placed += 1;
            }
        }
        Ok(placed)
    }

    /// Fail workloads whose deadline has passed and workloads whose
    /// assigned device has been offline longer than the grace period.
    /// Reservations are released so the capacity returns to the pool.
    pub fn sweep_deadlines(&self) -> SchedulerResult<Vec<WorkloadId>> {
        let now = epoch_secs();
        let grace = self.config.device_lost_grace.as_secs();
        let devices: HashMap<DeviceId, DeviceRecord> = self
            .registry
            .snapshot()?
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();

        let mut inner = self.lock();
        let mut expired = Vec::new();
        for record in inner.workloads.values() {
            if !matches!(
                record.state,
                WorkloadState::Staging | WorkloadState::Running
            ) {
                continue;
            }
            if record.deadline_at.is_some_and(|d| now >= d) {
                expired.push((record.id.clone(), FailureReason::ExecutionFailed));
                continue;
            }
            let lost = record.assigned_device.as_ref().is_some_and(|dev| {
                devices.get(dev).is_some_and(|d| {
                    !d.is_online() && now.saturating_sub(d.last_heartbeat) > grace
                })
            });
            if lost {
                expired.push((record.id.clone(), FailureReason::DeviceLost));
            }
        }

        let mut failed = Vec::with_capacity(expired.len());
        for (id, reason) in expired {
            let Some(record) = inner.workloads.get_mut(&id) else {
                continue;
            };
            record.state = WorkloadState::Failed { reason };
            record.deadline_at = None;
            let persisted = record.clone();
            inner.tried.remove(&id);
            self.release_reservation(&mut inner, &id);
            self.state.put_workload(&persisted)?;
            warn!(workload_id = %id, ?reason, "workload swept");
            failed.push(id);
        }
        Ok(failed)
    }

    /// Rebuild in-memory bookkeeping from the store after a restart.
    /// Reservations do not survive a restart, so non-terminal workloads
    /// start over from the queue once devices heartbeat back in.
    pub fn recover(&self) -> SchedulerResult<usize> {
        let mut inner = self.lock();
        let mut requeued = 0;
        for mut record in self.state.list_workloads()? {
            if !record.state.is_terminal() {
                record.state = WorkloadState::Queued;
                record.assigned_device = None;
                record.deadline_at = None;
                self.state.put_workload(&record)?;
                inner.queue.push(record.submitted_at, &record.id);
                requeued += 1;
            }
            inner.workloads.insert(record.id.clone(), record);
        }
        if requeued > 0 {
            info!(requeued, "recovered in-flight workloads");
        }
        Ok(requeued)
    }

    /// Periodic loop: sweeps deadlines on every tick and drains the
    /// queue on ticks and on device-online events. Returns when the
    /// shutdown signal flips to true.
    pub async fn run(&self, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.registry.subscribe();
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("scheduler loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
                event = events.recv() => match event {
                    Ok(RegistryEvent::DeviceOnline(device_id)) => {
                        debug!(%device_id, "device online, draining queue");
                        if let Err(e) = self.drain_queue().await {
                            warn!(error = %e, "queue drain failed");
                        }
                    }
                    Ok(RegistryEvent::DeviceOffline(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "registry events lagged, draining queue");
                        if let Err(e) = self.drain_queue().await {
                            warn!(error = %e, "queue drain failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler loop stopped");
    }

    async fn tick(&self) -> SchedulerResult<()> {
        self.sweep_deadlines()?;
        self.drain_queue().await?;
        Ok(())
    }

    pub fn workload(&self, workload_id: &str) -> Option<WorkloadRecord> {
        self.lock().workloads.get(workload_id).cloned()
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    // ── placement ──────────────────────────────────────────────────

    /// Drive one workload as far as it will go: place, stage, dispatch.
    /// Loops when a staging failure re-queues the workload, bounded by
    /// the staging retry limit.
    async fn try_schedule(&self, workload_id: &str) -> SchedulerResult<WorkloadState> {
        loop {
            match self.place(workload_id)? {
                Placement::Staged {
                    device_id,
                    executable,
                } => match self
                    .stage_and_dispatch(workload_id, &device_id, &executable)
                    .await?
                {
                    StageFlow::Dispatched => return Ok(WorkloadState::Running),
                    StageFlow::Interrupted => return self.current_state(workload_id),
                    StageFlow::Retry => continue,
                    StageFlow::LimitReached => {
                        return Ok(WorkloadState::Failed {
                            reason: FailureReason::StagingFailed,
                        });
                    }
                },
                Placement::Queued => {
                    // The tried set only excludes devices within one
                    // placement round; the next drain starts fresh.
                    self.lock().tried.remove(workload_id);
                    return Ok(WorkloadState::Queued);
                }
                Placement::Unsatisfiable => {
                    return Ok(WorkloadState::Failed {
                        reason: FailureReason::Unsatisfiable,
                    });
                }
                Placement::Settled(state) => return Ok(state),
            }
        }
    }

    /// One placement attempt: rank qualifying devices by headroom and
    /// take the first reservation that sticks. Reserve-then-confirm
    /// keeps the ledger consistent without holding the bookkeeping lock
    /// during ranking.
    fn place(&self, workload_id: &str) -> SchedulerResult<Placement> {
        let (request, affinity, tried) = {
            let inner = self.lock();
            let Some(record) = inner.workloads.get(workload_id) else {
                return Err(SchedulerError::WorkloadNotFound(workload_id.to_string()));
            };
            if !matches!(record.state, WorkloadState::Pending | WorkloadState::Queued) {
                return Ok(Placement::Settled(record.state));
            }
            (
                record.request,
                record.affinity.clone(),
                inner.tried.get(workload_id).cloned().unwrap_or_default(),
            )
        };

        let snapshot = self.registry.snapshot()?;
        let candidates = build_candidates(&snapshot, |id| self.ledger.free_of(id));

        for score in rank(&request, &affinity, &candidates) {
            if tried.contains(&score.device_id) {
                continue;
            }
            if !self.ledger.reserve(&score.device_id, &request) {
                continue;
            }

            let mut inner = self.lock();
            let Some(record) = inner.workloads.get_mut(workload_id) else {
                self.ledger.release(&score.device_id, &request);
                return Err(SchedulerError::WorkloadNotFound(workload_id.to_string()));
            };
            if !matches!(record.state, WorkloadState::Pending | WorkloadState::Queued) {
                // Cancelled while we were ranking.
                let state = record.state;
                self.ledger.release(&score.device_id, &request);
                return Ok(Placement::Settled(state));
            }
            record.state = WorkloadState::Staging;
            record.assigned_device = Some(score.device_id.clone());
            record.deadline_at = record.deadline_secs.map(|d| epoch_secs() + d);
            let persisted = record.clone();
            inner
                .reservations
                .insert(workload_id.to_string(), (score.device_id.clone(), request));
            inner.queue.remove(workload_id);
            self.state.put_workload(&persisted)?;
            info!(
                %workload_id,
                device_id = %score.device_id,
                headroom = score.headroom,
                "workload placed"
            );
            return Ok(Placement::Staged {
                device_id: score.device_id,
                executable: persisted.executable,
            });
        }

        // An empty fleet means "no device yet", not "no device ever";
        // device join is a re-drain trigger, so the workload waits.
        if !candidates.is_empty() && !satisfiable(&request, &affinity, &candidates) {
            let mut inner = self.lock();
            let Some(record) = inner.workloads.get_mut(workload_id) else {
                return Err(SchedulerError::WorkloadNotFound(workload_id.to_string()));
            };
            record.state = WorkloadState::Failed {
                reason: FailureReason::Unsatisfiable,
            };
            let persisted = record.clone();
            inner.queue.remove(workload_id);
            inner.tried.remove(workload_id);
            self.state.put_workload(&persisted)?;
            warn!(%workload_id, "no device in the fleet can ever satisfy the request");
            return Ok(Placement::Unsatisfiable);
        }

        let mut inner = self.lock();
        let Some(record) = inner.workloads.get_mut(workload_id) else {
            return Err(SchedulerError::WorkloadNotFound(workload_id.to_string()));
        };
        if !matches!(record.state, WorkloadState::Pending | WorkloadState::Queued) {
            return Ok(Placement::Settled(record.state));
        }
        record.state = WorkloadState::Queued;
        let submitted_at = record.submitted_at;
        let persisted = record.clone();
        inner.queue.push(submitted_at, workload_id);
        self.state.put_workload(&persisted)?;
        debug!(%workload_id, "no qualifying device with free capacity, queued");
        Ok(Placement::Queued)
    }

    /// Stage the executable onto the chosen device, then dispatch. Any
    /// failure releases the reservation; the workload either re-queues
    /// for another attempt or fails once the retry limit is hit.
    async fn stage_and_dispatch(
        &self,
        workload_id: &str,
        device_id: &str,
        executable: &ExecutableRef,
    ) -> SchedulerResult<StageFlow> {
        if let Err(e) = self.distributor.ensure_staged(device_id, executable).await {
            warn!(%workload_id, %device_id, error = %e, "staging failed");
            return self.handle_staging_failure(workload_id, device_id);
        }

        // The workload may have been cancelled or swept while the
        // payload was in flight; whoever terminalized it released the
        // reservation already.
        if !self.is_staging_on(workload_id, device_id) {
            return Ok(StageFlow::Interrupted);
        }

        if let Err(e) = self.dispatcher.dispatch(device_id, workload_id).await {
            warn!(%workload_id, %device_id, error = %e, "dispatch failed");
            return self.handle_staging_failure(workload_id, device_id);
        }

        let mut inner = self.lock();
        let Some(record) = inner.workloads.get_mut(workload_id) else {
            return Err(SchedulerError::WorkloadNotFound(workload_id.to_string()));
        };
        if record.state != WorkloadState::Staging
            || record.assigned_device.as_deref() != Some(device_id)
        {
            return Ok(StageFlow::Interrupted);
        }
        record.state = WorkloadState::Running;
        let persisted = record.clone();
        inner.tried.remove(workload_id);
        self.state.put_workload(&persisted)?;
        info!(%workload_id, %device_id, "workload running");
        Ok(StageFlow::Dispatched)
    }

    fn handle_staging_failure(
        &self,
        workload_id: &str,
        device_id: &str,
    ) -> SchedulerResult<StageFlow> {
        let mut inner = self.lock();
        let Some(record) = inner.workloads.get_mut(workload_id) else {
            return Err(SchedulerError::WorkloadNotFound(workload_id.to_string()));
        };
        if record.state != WorkloadState::Staging
            || record.assigned_device.as_deref() != Some(device_id)
        {
            return Ok(StageFlow::Interrupted);
        }
        record.staging_retries += 1;
        record.assigned_device = None;
        record.deadline_at = None;

        if record.staging_retries >= self.config.staging_retry_limit {
            record.state = WorkloadState::Failed {
                reason: FailureReason::StagingFailed,
            };
            let persisted = record.clone();
            inner.tried.remove(workload_id);
            self.release_reservation(&mut inner, workload_id);
            self.state.put_workload(&persisted)?;
            error!(%workload_id, retries = persisted.staging_retries, "staging retries exhausted");
            return Ok(StageFlow::LimitReached);
        }

        record.state = WorkloadState::Queued;
        let submitted_at = record.submitted_at;
        let persisted = record.clone();
        inner
            .tried
            .entry(workload_id.to_string())
            .or_default()
            .insert(device_id.to_string());
        self.release_reservation(&mut inner, workload_id);
        inner.queue.push(submitted_at, workload_id);
        self.state.put_workload(&persisted)?;
        debug!(%workload_id, %device_id, "staging failed, retrying elsewhere");
        Ok(StageFlow::Retry)
    }

    /// Remove and release the workload's reservation, if one is live.
    /// Returns whether capacity was actually freed.
    fn release_reservation(&self, inner: &mut Inner, workload_id: &str) -> bool {
        match inner.reservations.remove(workload_id) {
            Some((device_id, spec)) => {
                self.ledger.release(&device_id, &spec);
                true
            }
            None => false,
        }
    }

    fn is_staging_on(&self, workload_id: &str, device_id: &str) -> bool {
        let inner = self.lock();
        inner.workloads.get(workload_id).is_some_and(|r| {
            r.state == WorkloadState::Staging && r.assigned_device.as_deref() == Some(device_id)
        })
    }

    fn current_state(&self, workload_id: &str) -> SchedulerResult<WorkloadState> {
        self.lock()
            .workloads
            .get(workload_id)
            .map(|r| r.state)
            .ok_or_else(|| SchedulerError::WorkloadNotFound(workload_id.to_string()))
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

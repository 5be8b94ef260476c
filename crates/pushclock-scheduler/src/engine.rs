//! Scheduler Core: durable job registration, the poll loop and the firing
//! pipeline.
//!
//! A firing runs under the task's exclusive lock and never propagates an
//! error: internal failures, panics included, end in a failed log entry,
//! an after-failure hook and alert evaluation.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use tokio::sync::{Notify, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

use pushclock_core::config::{PushclockConfig, SchedulerConfig};
use pushclock_core::error::{PushclockError, Result};
use pushclock_core::traits::Notifier;
use pushclock_core::types::{
    AlertType, ChannelOutcome, ExecutionLogEntry, ExecutionStatus, HookExecutionLogEntry, HookRunStatus,
    HookType, SendResults, Task, TaskEvent, TaskStatus, job_id_for,
};
use pushclock_hooks::{HookContext, HookOutcome, HookRunner};

use crate::alerts::{self, AlertEvaluator};
use crate::cron;
use crate::events::EventBroadcaster;
use crate::jobs::{JobRecord, Trigger};
use crate::locks::TaskLocks;
use crate::persistence::SchedulerDb;

/// Shortest pause between two loop ticks, so a saturated pool never spins.
const MIN_TICK: StdDuration = StdDuration::from_millis(20);

/// Outcome of a startup reload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StartupSummary {
    pub registered: usize,
    pub dropped: usize,
    pub stale_jobs: usize,
}

/// The scheduler. Cheap to share behind an `Arc`.
pub struct SchedulerEngine {
    core: Arc<EngineCore>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

struct EngineCore {
    db: Arc<SchedulerDb>,
    notifier: Arc<dyn Notifier>,
    hooks: HookRunner,
    alerts: AlertEvaluator,
    events: EventBroadcaster,
    locks: TaskLocks,
    in_flight: Mutex<HashSet<String>>,
    workers: Arc<Semaphore>,
    config: SchedulerConfig,
    tz: chrono_tz::Tz,
    worker_id: String,
    host: String,
    wake: Notify,
}

impl SchedulerEngine {
    pub fn new(
        db: Arc<SchedulerDb>,
        notifier: Arc<dyn Notifier>,
        hooks: HookRunner,
        config: SchedulerConfig,
        tz: chrono_tz::Tz,
    ) -> Self {
        let worker_id = format!("{}-{}", std::process::id(), &uuid::Uuid::new_v4().to_string()[..8]);
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".into());
        let (shutdown_tx, _) = watch::channel(false);

        let core = EngineCore {
            alerts: AlertEvaluator::new(db.clone(), notifier.clone()),
            events: EventBroadcaster::new(config.event_buffer),
            locks: TaskLocks::new(),
            in_flight: Mutex::new(HashSet::new()),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            db,
            notifier,
            hooks,
            config,
            tz,
            worker_id,
            host,
            wake: Notify::new(),
        };
        Self {
            core: Arc::new(core),
            shutdown_tx,
            loop_handle: Mutex::new(None),
        }
    }

    /// Build an engine from the loaded configuration.
    pub fn from_config(db: Arc<SchedulerDb>, notifier: Arc<dyn Notifier>, config: &PushclockConfig) -> Result<Self> {
        Ok(Self::new(
            db,
            notifier,
            HookRunner::new(config.hooks.clone()),
            config.scheduler.clone(),
            config.time_zone()?,
        ))
    }

    pub fn worker_id(&self) -> &str {
        &self.core.worker_id
    }

    pub fn db(&self) -> &Arc<SchedulerDb> {
        &self.core.db
    }

    // ── Lifecycle ──────────────────────────────────────────

    /// Spawn the poll loop. A second call while running is a no-op.
    pub fn start(&self) {
        let mut handle = self.loop_handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::warn!("⏰ Scheduler already running");
            return;
        }
        self.shutdown_tx.send_replace(false);
        let core = self.core.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(run_loop(core, shutdown_rx)));
    }

    /// Stop claiming jobs, then wait (bounded by the grace period) for
    /// in-flight firings to finish.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.loop_handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("⏰ Scheduler loop ended abnormally: {e}");
            }
        }

        let grace = StdDuration::from_secs(self.core.config.shutdown_grace_secs);
        let all = self.core.config.workers.max(1) as u32;
        match tokio::time::timeout(grace, self.core.workers.acquire_many(all)).await {
            Ok(Ok(_permits)) => tracing::info!("⏰ Scheduler stopped"),
            Ok(Err(e)) => tracing::warn!("⏰ Worker pool closed during shutdown: {e}"),
            Err(_) => tracing::warn!(
                "⏰ Shutdown grace of {}s elapsed with firings still running",
                grace.as_secs()
            ),
        }
    }

    // ── Registration ───────────────────────────────────────

    /// Register (or replace) the job for `task`. Non-pending tasks are
    /// unregistered instead.
    pub fn schedule(&self, task: &Task) -> Result<()> {
        self.core.schedule(task)
    }

    /// Remove the job for `task_id`. Returns whether one existed.
    pub fn unschedule(&self, task_id: i64, is_recurring: bool) -> Result<bool> {
        let removed = self.core.db.remove_job(&job_id_for(task_id, is_recurring))?;
        if removed {
            tracing::info!("🗑️ Job {} removed", job_id_for(task_id, is_recurring));
        }
        Ok(removed)
    }

    /// Remove both possible job registrations of a task.
    pub fn unschedule_task(&self, task_id: i64) -> Result<bool> {
        let once = self.unschedule(task_id, false)?;
        let recurring = self.unschedule(task_id, true)?;
        Ok(once || recurring)
    }

    /// Re-register every armed task after a restart: pending tasks plus
    /// recurring tasks left `sent` or `failed`. Elapsed one-time tasks are
    /// dropped; elapsed recurring tasks move to their next occurrence. Jobs
    /// of tasks that are gone or no longer armed are cleared.
    pub fn load_pending_on_startup(&self) -> Result<StartupSummary> {
        let db = &self.core.db;
        let mut summary = StartupSummary::default();

        for job in db.list_jobs()? {
            let live = db.get_task(job.task_id)?.is_some_and(|t| is_firable(&t));
            if !live && db.remove_job(&job.id)? {
                summary.stale_jobs += 1;
            }
        }

        let mut armed = db.tasks_with_status(TaskStatus::Pending)?;
        for status in [TaskStatus::Sent, TaskStatus::Failed] {
            armed.extend(db.tasks_with_status(status)?.into_iter().filter(|t| t.is_recurring));
        }

        let now = Utc::now();
        for mut task in armed {
            if task.scheduled_time <= now {
                if !task.is_recurring {
                    db.remove_job(&task.job_id())?;
                    tracing::info!("⏭️ Task {} missed its time ({}), not rescheduled", task.id, task.scheduled_time);
                    summary.dropped += 1;
                    continue;
                }
                let next = match task.cron_expression.as_deref() {
                    Some(expr) => cron::next_fire_in(expr, now, self.core.tz),
                    None => Err(missing_expression(task.id)),
                };
                match next {
                    Ok(next) => {
                        task.scheduled_time = next;
                        db.update_task(&task)?;
                    }
                    Err(e) => {
                        tracing::error!("🗓️ Recurring task {} cannot be rescheduled: {e}", task.id);
                        continue;
                    }
                }
            }
            match self.core.schedule(&task) {
                Ok(()) => summary.registered += 1,
                Err(e) => tracing::error!("🗓️ Task {} could not be registered: {e}", task.id),
            }
        }

        tracing::info!(
            "📋 Startup reload: {} registered, {} dropped, {} stale jobs cleared",
            summary.registered,
            summary.dropped,
            summary.stale_jobs
        );
        Ok(summary)
    }

    /// Registered jobs, soonest first.
    pub fn scheduled_jobs(&self) -> Result<Vec<JobRecord>> {
        self.core.db.list_jobs()
    }

    // ── Firing ─────────────────────────────────────────────

    /// Run one firing of `task_id` now. Never fails; the outcome is recorded
    /// in the task, the execution log and the event stream.
    pub async fn execute(&self, task_id: i64) {
        self.core.execute(task_id).await;
    }

    // ── Task lifecycle ─────────────────────────────────────

    /// Validate, persist and register a new task.
    pub fn submit_task(&self, mut task: Task) -> Result<Task> {
        self.core.validate(&task)?;
        task.status = TaskStatus::Pending;
        task.id = self.core.db.insert_task(&task)?;
        self.core.schedule(&task)?;
        tracing::info!("📝 Task {} '{}' submitted", task.id, task.title);
        Ok(task)
    }

    /// Persist an edited task and re-register it to match.
    pub fn update_task(&self, task: &Task) -> Result<()> {
        self.core.validate(task)?;
        self.core.db.update_task(task)?;
        self.core.schedule(task)
    }

    /// Cancel a task and drop its job. Does not wait for an in-flight firing.
    pub fn cancel_task(&self, task_id: i64) -> Result<Task> {
        let task = self.core.transition(task_id, |task| {
            task.status = TaskStatus::Cancelled;
            Ok(())
        })?;
        self.unschedule_task(task_id)?;
        tracing::info!("🚫 Task {task_id} cancelled");
        Ok(task)
    }

    /// Pause a pending task.
    pub fn pause_task(&self, task_id: i64) -> Result<Task> {
        let task = self.core.transition(task_id, |task| {
            if task.status != TaskStatus::Pending {
                return Err(PushclockError::InvalidState(format!(
                    "task {task_id} is {}, only pending tasks can be paused",
                    task.status
                )));
            }
            task.status = TaskStatus::Paused;
            Ok(())
        })?;
        self.unschedule_task(task_id)?;
        tracing::info!("⏸️ Task {task_id} paused");
        Ok(task)
    }

    /// Resume a paused task. Recurring tasks continue from their next occurrence.
    pub fn resume_task(&self, task_id: i64) -> Result<Task> {
        let tz = self.core.tz;
        let task = self.core.transition(task_id, |task| {
            if task.status != TaskStatus::Paused {
                return Err(PushclockError::InvalidState(format!(
                    "task {task_id} is {}, only paused tasks can be resumed",
                    task.status
                )));
            }
            task.status = TaskStatus::Pending;
            if task.is_recurring {
                task.scheduled_time = next_occurrence(task, Utc::now(), tz)?;
            }
            Ok(())
        })?;
        self.core.schedule(&task)?;
        tracing::info!("▶️ Task {task_id} resumed");
        Ok(task)
    }

    /// Put a finished or cancelled task back to pending and register it again.
    pub fn rearm_task(&self, task_id: i64) -> Result<Task> {
        let tz = self.core.tz;
        let task = self.core.transition(task_id, |task| {
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Paused) {
                return Err(PushclockError::InvalidState(format!(
                    "task {task_id} is {}, nothing to re-arm",
                    task.status
                )));
            }
            task.status = TaskStatus::Pending;
            task.error_msg = None;
            task.send_results = None;
            if task.is_recurring {
                task.scheduled_time = next_occurrence(task, Utc::now(), tz)?;
            }
            Ok(())
        })?;
        self.core.schedule(&task)?;
        tracing::info!("🔁 Task {task_id} re-armed for {}", task.scheduled_time);
        Ok(task)
    }

    /// Drop the task and its job. Execution history is kept.
    pub fn delete_task(&self, task_id: i64) -> Result<bool> {
        self.unschedule_task(task_id)?;
        self.core.db.delete_task(task_id)
    }

    // ── Queries ────────────────────────────────────────────

    pub fn execution_history(&self, task_id: i64, limit: usize) -> Result<Vec<ExecutionLogEntry>> {
        self.core.db.execution_history(task_id, limit)
    }

    pub fn hook_history(&self, execution_log_id: i64) -> Result<Vec<HookExecutionLogEntry>> {
        self.core.db.hook_executions(execution_log_id)
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.core.events
    }

    /// Listen for firing outcomes of `user_id`'s tasks.
    pub fn subscribe(&self, user_id: i64) -> mpsc::Receiver<TaskEvent> {
        self.core.events.subscribe(user_id)
    }
}

// ── Poll loop ──────────────────────────────────────────────

async fn run_loop(core: Arc<EngineCore>, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(
        "⏰ Scheduler started (worker {}, {} slots, poll {}ms)",
        core.worker_id,
        core.config.workers.max(1),
        core.config.poll_interval_ms
    );
    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = core.dispatch_due() {
            tracing::error!("⏰ Scheduler tick failed: {e}");
        }
        let wait = core.next_wait();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = core.wake.notified() => {}
            _ = shutdown.changed() => break,
        }
    }
    tracing::info!("⏰ Scheduler loop stopped");
}

/// Clears a job's in-flight mark when its firing ends.
struct InFlightGuard {
    core: Arc<EngineCore>,
    job_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.core
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.job_id);
        self.core.wake.notify_one();
    }
}

/// Where a firing got to, for the recovery path.
#[derive(Default)]
struct FiringState {
    task: Option<Task>,
    entry: Option<ExecutionLogEntry>,
}

/// Result of sending one task to all its channels.
struct DispatchOutcome {
    success: bool,
    multi: bool,
    results: SendResults,
    success_count: u32,
    failure_count: u32,
    /// Single mode: the failure text. Multi mode: the summary line.
    message: Option<String>,
}

impl EngineCore {
    fn schedule(&self, task: &Task) -> Result<()> {
        self.db.remove_job(&job_id_for(task.id, !task.is_recurring))?;
        if !is_firable(task) {
            if self.db.remove_job(&task.job_id())? {
                tracing::debug!("🗓️ Task {} is {}, job removed", task.id, task.status);
            }
            return Ok(());
        }

        let now = Utc::now();
        let (trigger, next_run_time) = if task.is_recurring {
            let expression = task.cron_expression.clone().ok_or_else(|| missing_expression(task.id))?;
            // First occurrence no earlier than the task's own scheduled time.
            let reference = now.max(task.scheduled_time - Duration::milliseconds(1));
            let next = cron::next_fire_in(&expression, reference, self.tz)?;
            (Trigger::Cron { expression }, next)
        } else {
            (Trigger::Date { run_at: task.scheduled_time }, task.scheduled_time)
        };

        let job = JobRecord {
            id: task.job_id(),
            task_id: task.id,
            trigger,
            next_run_time,
            created_at: now,
        };
        self.db.upsert_job(&job)?;
        tracing::info!("📅 Job {} ({}) next run at {}", job.id, job.trigger.kind(), job.next_run_time);
        self.wake.notify_one();
        Ok(())
    }

    fn validate(&self, task: &Task) -> Result<()> {
        if task.is_recurring {
            let expression = task.cron_expression.as_deref().ok_or_else(|| missing_expression(task.id))?;
            cron::validate(expression, self.tz)?;
        }
        let targets = task.delivery.targets();
        if targets.is_empty() {
            return Err(PushclockError::InvalidState("task has no delivery channel".into()));
        }
        let mut seen = HashSet::new();
        if let Some((channel, _)) = targets.iter().find(|(channel, _)| !seen.insert(channel.as_str())) {
            return Err(PushclockError::InvalidState(format!("channel {channel} is listed more than once")));
        }
        Ok(())
    }

    fn transition<F>(&self, task_id: i64, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        self.db.modify_task(task_id, f)?.ok_or(PushclockError::TaskNotFound(task_id))
    }

    fn is_in_flight(&self, job_id: &str) -> bool {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).contains(job_id)
    }

    fn next_wait(&self) -> StdDuration {
        let poll = StdDuration::from_millis(self.config.poll_interval_ms.max(1));
        let until_due = match self.db.next_due_time() {
            Ok(Some(at)) => (at - Utc::now()).to_std().unwrap_or(StdDuration::ZERO),
            Ok(None) => poll,
            Err(e) => {
                tracing::warn!("⏰ Could not read next due time: {e}");
                poll
            }
        };
        until_due.min(poll).max(MIN_TICK)
    }

    /// Claim due jobs and spawn their firings, up to the free worker slots.
    fn dispatch_due(self: &Arc<Self>) -> Result<usize> {
        let now = Utc::now();
        let mut spawned = 0;

        for job in self.db.due_jobs(now, self.config.due_batch.max(1))? {
            if self.is_in_flight(&job.id) {
                // Still running: missed cron occurrences collapse into the next one.
                if matches!(job.trigger, Trigger::Cron { .. }) {
                    if let Ok(next) = job.trigger.following(now, self.tz) {
                        if self.db.claim_job(&job, next)? {
                            tracing::debug!("⏩ Job {} still running, occurrence coalesced", job.id);
                        }
                    }
                }
                continue;
            }

            let Ok(permit) = self.workers.clone().try_acquire_owned() else {
                tracing::debug!("⏰ All worker slots busy, {} waits", job.id);
                break;
            };

            let next = match job.trigger.following(now, self.tz) {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!("🗓️ Job {} has no next run, removing: {e}", job.id);
                    self.db.remove_job(&job.id)?;
                    continue;
                }
            };
            if !self.db.claim_job(&job, next)? {
                continue;
            }

            self.in_flight
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(job.id.clone());
            let guard = InFlightGuard {
                core: self.clone(),
                job_id: job.id.clone(),
            };
            let core = self.clone();
            tracing::info!("🔔 Job {} triggered", job.id);
            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                core.execute(job.task_id).await;
            });
            spawned += 1;
        }
        Ok(spawned)
    }

    async fn execute(&self, task_id: i64) {
        let _lock = self.locks.acquire(task_id).await;
        let started = Utc::now();
        let mut state = FiringState::default();

        let result = AssertUnwindSafe(self.fire(task_id, started, &mut state))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.recover(task_id, started, state, e.to_string(), format!("{e:?}"))
                    .await
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.recover(task_id, started, state, format!("panic: {message}"), message)
                    .await
            }
        }
    }

    async fn fire(&self, task_id: i64, started: DateTime<Utc>, state: &mut FiringState) -> Result<()> {
        let Some(task) = self.db.get_task(task_id)? else {
            tracing::warn!("⚠️ Task {task_id} no longer exists, dropping its jobs");
            self.db.remove_job(&job_id_for(task_id, false))?;
            self.db.remove_job(&job_id_for(task_id, true))?;
            return Ok(());
        };
        let job_id = task.job_id();
        state.task = Some(task.clone());

        if self.config.duplicate_window_secs > 0 {
            let window = self.config.duplicate_window_secs;
            let since = i64::try_from(window)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|w| started.checked_sub_signed(w))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            if self.db.count_active_since(task_id, since)? > 0 {
                let mut entry = self.entry(task_id, &job_id, started, ExecutionStatus::Skipped);
                entry.is_duplicate = true;
                entry.finish(Utc::now(), ExecutionStatus::Skipped);
                entry.error_message = Some(format!("duplicate firing within {window}s"));
                self.db.insert_execution(&entry)?;
                tracing::warn!("⚠️ Task {task_id} fired again within {window}s, skipped as duplicate");
                self.alerts.evaluate(task_id, AlertType::DuplicateExecution).await;
                return Ok(());
            }
        }

        if !is_firable(&task) {
            tracing::info!("⏭️ Task {task_id} is {}, firing skipped", task.status);
            return Ok(());
        }

        let mut entry = self.entry(task_id, &job_id, started, ExecutionStatus::Started);
        entry.id = self.db.insert_execution(&entry)?;
        state.entry = Some(entry.clone());

        self.run_hook(HookType::BeforeExecute, &task, HookContext::default(), entry.id)
            .await;

        let outcome = self.dispatch(&task).await;
        let completed = Utc::now();

        let tz = self.tz;
        let updated = self.db.modify_task(task_id, |current| {
            apply_outcome(current, &outcome, completed, tz);
            Ok(())
        })?;
        let current = match updated {
            Some(current) => current,
            None => {
                tracing::info!("🗑️ Task {task_id} was deleted during its firing");
                task.clone()
            }
        };
        state.task = Some(current.clone());

        let (hook_type, context) = if outcome.success {
            let results = serde_json::to_value(&outcome.results)?;
            (HookType::AfterSuccess, HookContext::with_results(results))
        } else {
            let error = outcome.message.clone().unwrap_or_default();
            (HookType::AfterFailure, HookContext::with_error(error))
        };
        self.run_hook(hook_type, &current, context, entry.id).await;

        let status = if outcome.success {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        entry.finish(Utc::now(), status);
        entry.send_results = Some(outcome.results.clone());
        entry.success_count = outcome.success_count;
        entry.failure_count = outcome.failure_count;
        entry.error_message = if outcome.success && !outcome.multi {
            None
        } else {
            outcome.message.clone()
        };
        self.db.finish_execution(&entry)?;
        state.entry = Some(entry.clone());

        let message = match (&outcome.message, outcome.success) {
            (Some(message), _) => message.clone(),
            (None, true) => "通知发送成功".to_string(),
            (None, false) => "通知发送失败".to_string(),
        };
        self.events.publish(current.user_id, &TaskEvent::executed(&current, message));

        if outcome.success {
            tracing::info!(
                "✅ Task {task_id} delivered ({}ms)",
                entry.duration_ms.unwrap_or_default()
            );
        } else {
            tracing::warn!(
                "❌ Task {task_id} failed: {}",
                outcome.message.as_deref().unwrap_or("unknown error")
            );
        }

        for alert_type in alerts::after_firing(outcome.success) {
            self.alerts.evaluate(task_id, *alert_type).await;
        }
        Ok(())
    }

    /// Internal failure: force the task failed, close the log entry, run the
    /// after-failure hook and alerts. Errors here are only logged.
    async fn recover(
        &self,
        task_id: i64,
        started: DateTime<Utc>,
        state: FiringState,
        message: String,
        trace: String,
    ) {
        tracing::error!("💥 Firing of task {task_id} failed internally: {message}");

        let task = match self.db.modify_task(task_id, |task| {
            task.status = TaskStatus::Failed;
            task.error_msg = Some(message.clone());
            Ok(())
        }) {
            Ok(Some(task)) => Some(task),
            Ok(None) => state.task,
            Err(e) => {
                tracing::error!("💥 Could not mark task {task_id} failed: {e}");
                state.task
            }
        };

        let now = Utc::now();
        let entry_id = match state.entry {
            Some(mut entry) => {
                entry.finish(now, ExecutionStatus::Failed);
                entry.error_message = Some(message.clone());
                entry.error_trace = Some(trace);
                if let Err(e) = self.db.finish_execution(&entry) {
                    tracing::error!("💥 Could not close execution log {}: {e}", entry.id);
                }
                entry.id
            }
            None => {
                let job_id = task
                    .as_ref()
                    .map(Task::job_id)
                    .unwrap_or_else(|| job_id_for(task_id, false));
                let mut entry = self.entry(task_id, &job_id, started, ExecutionStatus::Failed);
                entry.finish(now, ExecutionStatus::Failed);
                entry.error_message = Some(message.clone());
                entry.error_trace = Some(trace);
                match self.db.insert_execution(&entry) {
                    Ok(id) => id,
                    Err(e) => {
                        tracing::error!("💥 Could not write execution log for task {task_id}: {e}");
                        0
                    }
                }
            }
        };

        if let Some(task) = &task {
            self.run_hook(HookType::AfterFailure, task, HookContext::with_error(message.clone()), entry_id)
                .await;
            self.events.publish(task.user_id, &TaskEvent::executed(task, message));
        }
        for alert_type in alerts::after_firing(false) {
            self.alerts.evaluate(task_id, *alert_type).await;
        }
    }

    fn entry(&self, task_id: i64, job_id: &str, start: DateTime<Utc>, status: ExecutionStatus) -> ExecutionLogEntry {
        ExecutionLogEntry::begin(task_id, job_id, start, status, &self.worker_id, &self.host)
    }

    /// Send to every target; multi-channel sends run concurrently.
    async fn dispatch(&self, task: &Task) -> DispatchOutcome {
        let targets = task.delivery.targets();
        let sends = targets.iter().map(|(channel, config)| async move {
            let result = self.notifier.send(channel, config, &task.title, &task.body).await;
            (channel.clone(), result)
        });

        let mut results = SendResults::new();
        let mut first_error = None;
        for (channel, result) in futures::future::join_all(sends).await {
            match result {
                Ok(()) => {
                    results.insert(channel, ChannelOutcome::sent());
                }
                Err(e) => {
                    tracing::warn!("❌ Task {} via {channel} failed: {e}", task.id);
                    first_error.get_or_insert_with(|| e.to_string());
                    results.insert(channel, ChannelOutcome::failed(e.to_string()));
                }
            }
        }

        let success_count = results.values().filter(|o| o.is_sent()).count() as u32;
        let failure_count = results.len() as u32 - success_count;
        let multi = task.delivery.is_multi();
        let (success, message) = if multi {
            let total = results.len();
            let summary = format!("{success_count}/{total} 个渠道发送成功，{failure_count} 个失败");
            (success_count > 0, Some(summary))
        } else {
            (failure_count == 0 && success_count > 0, first_error)
        };

        DispatchOutcome {
            success,
            multi,
            results,
            success_count,
            failure_count,
            message,
        }
    }

    /// Run one hook and record it in the hook log. Failures never abort the firing.
    async fn run_hook(&self, hook_type: HookType, task: &Task, context: HookContext, execution_log_id: i64) -> HookOutcome {
        let Some(spec) = task.hook(hook_type) else {
            return HookOutcome::skipped();
        };

        let started_at = Utc::now();
        let mut entry = HookExecutionLogEntry {
            id: 0,
            task_id: task.id,
            execution_log_id,
            hook_type,
            language: spec.language,
            script_snapshot: self.hooks.snapshot(&spec.script),
            started_at,
            finished_at: None,
            duration_ms: None,
            status: HookRunStatus::Started,
            output: None,
            error_message: None,
            return_data: None,
        };
        entry.id = match self.db.insert_hook_execution(&entry) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("🪝 Could not log {hook_type} hook of task {}: {e}", task.id);
                0
            }
        };

        let outcome = self.hooks.run_spec(spec, hook_type, task, context).await;

        let finished_at = Utc::now();
        entry.finished_at = Some(finished_at);
        entry.duration_ms = Some((finished_at - started_at).num_milliseconds().max(0));
        entry.status = outcome.status();
        entry.output = Some(outcome.output.clone());
        entry.error_message = outcome.error.clone();
        entry.return_data = outcome.data.clone();
        if entry.id != 0 {
            if let Err(e) = self.db.finish_hook_execution(&entry) {
                tracing::warn!("🪝 Could not close hook log {}: {e}", entry.id);
            }
        }

        if outcome.success {
            tracing::debug!("🪝 {hook_type} hook of task {} ok", task.id);
        } else {
            tracing::warn!(
                "🪝 {hook_type} hook of task {} {}: {}",
                task.id,
                outcome.status(),
                outcome.error.as_deref().unwrap_or("no detail")
            );
        }
        outcome
    }
}

/// Fold a dispatch outcome into the freshly read task.
fn apply_outcome(task: &mut Task, outcome: &DispatchOutcome, completed: DateTime<Utc>, tz: chrono_tz::Tz) {
    task.send_results = outcome.multi.then(|| outcome.results.clone());
    task.error_msg = if outcome.success && !outcome.multi {
        None
    } else {
        outcome.message.clone()
    };
    if outcome.success {
        task.sent_time = Some(completed);
    }

    if task.is_recurring {
        if !matches!(task.status, TaskStatus::Cancelled | TaskStatus::Paused) {
            task.status = TaskStatus::Pending;
        }
        match next_occurrence(task, completed, tz) {
            Ok(next) => task.scheduled_time = next,
            Err(e) => tracing::error!("🗓️ Recurring task {} cannot advance: {e}", task.id),
        }
    } else if task.status == TaskStatus::Pending {
        task.status = if outcome.success {
            TaskStatus::Sent
        } else {
            TaskStatus::Failed
        };
    }
}

/// One-time tasks fire only while pending; recurring ones unless stopped.
fn is_firable(task: &Task) -> bool {
    match task.status {
        TaskStatus::Pending => true,
        TaskStatus::Cancelled | TaskStatus::Paused => false,
        TaskStatus::Sent | TaskStatus::Failed => task.is_recurring,
    }
}

fn next_occurrence(task: &Task, after: DateTime<Utc>, tz: chrono_tz::Tz) -> Result<DateTime<Utc>> {
    let expression = task.cron_expression.as_deref().ok_or_else(|| missing_expression(task.id))?;
    cron::next_fire_in(expression, after, tz)
}

fn missing_expression(task_id: i64) -> PushclockError {
    PushclockError::InvalidExpression(format!("recurring task {task_id} has no cron expression"))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

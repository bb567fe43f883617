// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task scheduling: cron-driven execution of workload actions.
//!
//! A schedule owns an ordered list of tasks (console commands, power
//! actions, backups). The poller scans enabled schedules once a minute
//! and fires the due ones; a per-schedule run guard keeps concurrent
//! runs of the same schedule out, whether triggered by the poller or
//! manually.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashSet;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use gantry_agent_client::{AgentClient, CreateBackupRequest, PowerAction};

use crate::cron::CronExpression;
use crate::db::{self, Schedule, ScheduleTask};
use crate::error::{Error, Result};
use crate::nodes::NodeRegistry;

/// Tracks schedules that are currently executing.
///
/// Acquisition is first-wins; the permit releases on drop, so a
/// panicking or erroring run can never wedge its schedule.
#[derive(Debug, Default)]
pub struct RunGuard {
    running: DashSet<i32>,
}

/// Held while a schedule runs; dropping it releases the slot.
pub struct RunPermit<'a> {
    guard: &'a RunGuard,
    schedule_id: i32,
}

impl RunGuard {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim the run slot for a schedule.
    pub fn try_acquire(&self, schedule_id: i32) -> Option<RunPermit<'_>> {
        if self.running.insert(schedule_id) {
            Some(RunPermit {
                guard: self,
                schedule_id,
            })
        } else {
            None
        }
    }

    /// Whether a schedule currently holds its run slot.
    pub fn is_running(&self, schedule_id: i32) -> bool {
        self.running.contains(&schedule_id)
    }
}

impl Drop for RunPermit<'_> {
    fn drop(&mut self) {
        self.guard.running.remove(&self.schedule_id);
    }
}

/// Actions a schedule task can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// Send the payload to the workload console
    Command,
    /// Apply the payload as a power verb
    Power,
    /// Take a backup; the payload carries ignore patterns
    Backup,
}

impl TaskAction {
    /// Parse the stored action discriminator.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "command" => Some(Self::Command),
            "power" => Some(Self::Power),
            "backup" => Some(Self::Backup),
            _ => None,
        }
    }
}

/// Outcome of one task within a run.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// The task that ran
    pub task_id: i32,
    /// Its position in the schedule
    pub sequence_number: i32,
    /// Whether it completed
    pub success: bool,
    /// Failure detail, when unsuccessful
    pub detail: Option<String>,
}

/// Summary of a completed schedule run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The schedule that ran
    pub schedule_id: i32,
    /// Per-task outcomes, in execution order
    pub outcomes: Vec<TaskOutcome>,
    /// Whether a failure stopped the run early
    pub halted: bool,
}

/// Executes schedules against their workloads' agents.
#[derive(Clone)]
pub struct ScheduleRunner {
    pool: PgPool,
    registry: NodeRegistry,
    guard: Arc<RunGuard>,
}

impl ScheduleRunner {
    /// Create a runner over the given pool and registry.
    pub fn new(pool: PgPool, registry: NodeRegistry) -> Self {
        Self {
            pool,
            registry,
            guard: Arc::new(RunGuard::new()),
        }
    }

    /// The guard shared by every run, for observability.
    pub fn guard(&self) -> &Arc<RunGuard> {
        &self.guard
    }

    /// Execute a schedule now.
    ///
    /// `force` runs a disabled schedule anyway (operator-triggered). A
    /// schedule that is already running is rejected with a conflict; a
    /// task failure only stops the run when the task does not allow
    /// continuation. The run bookkeeping (last/next run) is updated
    /// whether or not tasks failed.
    #[instrument(skip(self))]
    pub async fn run_schedule(&self, schedule_id: i32, force: bool) -> Result<RunReport> {
        let Some(_permit) = self.guard.try_acquire(schedule_id) else {
            return Err(Error::validation(409, "schedule is already running"));
        };

        let schedule = db::get_schedule(&self.pool, schedule_id)
            .await?
            .ok_or(Error::ScheduleNotFound(schedule_id))?;
        if !schedule.enabled && !force {
            return Err(Error::validation(400, "schedule is disabled"));
        }

        let server = db::get_server(&self.pool, schedule.server_id)
            .await?
            .ok_or(Error::ServerNotFound(schedule.server_id))?;
        let (_, client) = self.registry.client_for(server.node_id).await?;
        let tasks = db::get_schedule_tasks(&self.pool, schedule.id).await?;

        let started_at = Utc::now();
        info!(schedule_id, tasks = tasks.len(), "running schedule");

        let (outcomes, halted) = execute_tasks(&client, server.uuid, &tasks).await;
        if halted {
            warn!(schedule_id, "task failed, halting run");
        }

        // Bookkeeping happens even for failed runs so the schedule keeps
        // firing on its cadence.
        let next_run = CronExpression::parse(&schedule.cron_expression)
            .ok()
            .and_then(|expr| expr.next_run_after(started_at));
        db::update_schedule_run(&self.pool, schedule.id, started_at, next_run).await?;

        Ok(RunReport {
            schedule_id,
            outcomes,
            halted,
        })
    }
}

/// Run a schedule's tasks strictly in order, honoring per-task delays
/// and the continue-on-failure flag. Returns the outcomes and whether a
/// failure stopped the run early.
async fn execute_tasks(
    client: &AgentClient,
    server_uuid: Uuid,
    tasks: &[ScheduleTask],
) -> (Vec<TaskOutcome>, bool) {
    let mut outcomes = Vec::with_capacity(tasks.len());
    let mut halted = false;
    for task in tasks {
        if task.time_offset > 0 {
            tokio::time::sleep(Duration::from_secs(task.time_offset as u64)).await;
        }
        let outcome = execute_task(client, server_uuid, task).await;
        let failed = !outcome.success;
        outcomes.push(outcome);
        if failed && !task.continue_on_failure {
            halted = true;
            break;
        }
    }
    (outcomes, halted)
}

async fn execute_task(
    client: &AgentClient,
    server_uuid: Uuid,
    task: &ScheduleTask,
) -> TaskOutcome {
    let result = match TaskAction::parse(&task.action) {
        Some(TaskAction::Command) => {
            client
                .send_commands(server_uuid, &[task.payload.clone()])
                .await
        }
        Some(TaskAction::Power) => match PowerAction::parse(&task.payload) {
            Some(action) => client.power(server_uuid, action).await,
            None => {
                return TaskOutcome {
                    task_id: task.id,
                    sequence_number: task.sequence_number,
                    success: false,
                    detail: Some(format!("unknown power verb {:?}", task.payload)),
                };
            }
        },
        Some(TaskAction::Backup) => {
            let request = CreateBackupRequest {
                uuid: Uuid::new_v4(),
                adapter: "local".to_string(),
                ignore: task.payload.clone(),
            };
            client.create_backup(server_uuid, &request).await
        }
        None => {
            return TaskOutcome {
                task_id: task.id,
                sequence_number: task.sequence_number,
                success: false,
                detail: Some(format!("unknown task action {:?}", task.action)),
            };
        }
    };

    match result {
        Ok(()) => TaskOutcome {
            task_id: task.id,
            sequence_number: task.sequence_number,
            success: true,
            detail: None,
        },
        Err(e) => {
            error!(task_id = task.id, error = %e, "schedule task failed");
            TaskOutcome {
                task_id: task.id,
                sequence_number: task.sequence_number,
                success: false,
                detail: Some(e.to_string()),
            }
        }
    }
}

/// Poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// How often to scan for due schedules
    pub poll_interval: Duration,
    /// How stale a missed `next_run_at` must be before the backstop
    /// fires it; keeps the backstop from double-firing a run the cron
    /// match already caught
    pub overdue_grace: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            overdue_grace: Duration::from_secs(65),
        }
    }
}

/// Background poller that fires due schedules.
pub struct SchedulePoller {
    pool: PgPool,
    runner: Arc<ScheduleRunner>,
    config: PollerConfig,
    shutdown: Arc<Notify>,
}

impl SchedulePoller {
    /// Create a poller driving the given runner.
    pub fn new(pool: PgPool, runner: Arc<ScheduleRunner>, config: PollerConfig) -> Self {
        Self {
            pool,
            runner,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle to stop the poller.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Spawn the poll loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.poll_interval.as_secs(),
                "schedule poller started"
            );
            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        info!("schedule poller stopping");
                        break;
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {
                        if let Err(e) = self.tick().await {
                            error!(error = %e, "schedule poll tick failed");
                        }
                    }
                }
            }
        })
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let schedules = db::list_enabled_schedules(&self.pool).await?;
        for schedule in schedules {
            if !should_fire(&schedule, now, self.config.overdue_grace) {
                continue;
            }
            let runner = self.runner.clone();
            let schedule_id = schedule.id;
            tokio::spawn(async move {
                match runner.run_schedule(schedule_id, false).await {
                    Ok(report) if report.halted => {
                        warn!(schedule_id, "schedule run halted on task failure");
                    }
                    Ok(_) => {}
                    Err(Error::Validation { status: 409, .. }) => {
                        // Previous run still going; the overdue backstop
                        // will catch up later if needed.
                        debug!(schedule_id, "schedule already running, skipped");
                    }
                    Err(e) => {
                        error!(schedule_id, error = %e, "schedule run failed");
                    }
                }
            });
        }
        Ok(())
    }
}

/// Whether the poller should fire a schedule at `now`.
///
/// Fires on an exact cron match for the current minute, and as a
/// backstop when a stored `next_run_at` has slipped past without a
/// sufficiently recent run (the poller was down, or a tick was missed).
pub(crate) fn should_fire(schedule: &Schedule, now: DateTime<Utc>, grace: Duration) -> bool {
    // Never fire twice within the same minute.
    let minute_start = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    if let Some(last) = schedule.last_run_at {
        if last >= minute_start {
            return false;
        }
    }

    if crate::cron::is_due(&schedule.cron_expression, now).unwrap_or_else(|e| {
        warn!(
            schedule_id = schedule.id,
            error = %e,
            "schedule has an unparseable cron expression"
        );
        false
    }) {
        return true;
    }

    // Backstop for missed ticks.
    if let Some(next) = schedule.next_run_at {
        if next <= now {
            let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::seconds(65));
            return match schedule.last_run_at {
                Some(last) => now - last > grace,
                None => true,
            };
        }
    }
    false
}

//! Cron-driven dispatch of enabled, non-manual tasks.
//!
//! Grounded on the teacher's `BackupScheduler`: an `Arc<RwLock<HashMap<...>>>`
//! of live schedules, a `start()` that spawns a polling loop, and persisted
//! next-run bookkeeping. The teacher polls its own in-memory schedule map
//! every 60s; this keeps that cadence but resolves next-run times through
//! the `cron` crate rather than the teacher's hand-rolled interval math.
//!
//! The `cron` crate parses 6/7-field (seconds-first) expressions, while
//! every cron string this system stores and displays is the standard
//! 5-field form. [`to_cron_schedule`] bridges the two by prepending a
//! fixed `"0"` seconds field before handing the expression to `cron`.

use chrono::Utc;
use cron::Schedule as CronSchedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ConfigStore;
use crate::error::SchedulerError;
use crate::executor::Executor;
use crate::models::Schedule;

type Result<T> = std::result::Result<T, SchedulerError>;

const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Parse a 5-field cron expression the way this system stores it into a
/// `cron::Schedule`, which expects a leading seconds field.
pub fn to_cron_schedule(expr: &str) -> Result<CronSchedule> {
    let with_seconds = format!("0 {expr}");
    CronSchedule::from_str(&with_seconds).map_err(|e| SchedulerError::InvalidCron(e.to_string()))
}

/// Drives scheduled (non-manual) task dispatch.
pub struct BackupScheduler {
    config: Arc<ConfigStore>,
    executor: Arc<Executor>,
    next_runs: Arc<RwLock<HashMap<Uuid, chrono::DateTime<Utc>>>>,
    handle: RwLock<Option<JoinHandle<()>>>,
}

impl BackupScheduler {
    pub fn new(config: Arc<ConfigStore>, executor: Arc<Executor>) -> Self {
        Self {
            config,
            executor,
            next_runs: Arc::new(RwLock::new(HashMap::new())),
            handle: RwLock::new(None),
        }
    }

    /// Recompute every enabled task's next-run time from its current
    /// schedule. Call after any task/schedule mutation, and once at
    /// startup before [`start`].
    pub async fn reload_schedules(&self) -> Result<()> {
        let tasks = self.config.list_tasks().await;
        let mut next_runs = self.next_runs.write().await;
        next_runs.clear();

        for task in tasks {
            if !task.enabled {
                continue;
            }
            if let Some(next) = self.compute_next_run(&task.schedule)? {
                next_runs.insert(task.id, next);
            }
        }
        drop(next_runs);
        self.persist_next_runs().await;
        Ok(())
    }

    /// (Re)schedule a single task: unschedule it, then recompute and insert
    /// its next-run time if its current schedule produces one. Idempotent —
    /// calling it twice in a row for the same task is a no-op the second
    /// time.
    pub async fn schedule_task(&self, task_id: Uuid) -> Result<()> {
        self.unschedule_task(task_id).await;
        let task = self
            .config
            .get_task(task_id)
            .await
            .map_err(|_| SchedulerError::NotScheduled(task_id.to_string()))?;
        if !task.enabled {
            return Ok(());
        }
        if let Some(next) = self.compute_next_run(&task.schedule)? {
            self.next_runs.write().await.insert(task_id, next);
            let _ = self.config.update_task_schedule(task_id, None, Some(next)).await;
        }
        Ok(())
    }

    fn compute_next_run(&self, schedule: &Schedule) -> Result<Option<chrono::DateTime<Utc>>> {
        let Some(expr) = schedule.to_cron_expr() else {
            return Ok(None);
        };
        let cron_schedule = to_cron_schedule(&expr)?;
        Ok(cron_schedule.upcoming(Utc).next())
    }

    /// The cached next-run time for a task. Fails if the task has no
    /// active schedule (a `manual` task, or one never scheduled).
    pub async fn get_next_run(&self, task_id: Uuid) -> Result<chrono::DateTime<Utc>> {
        self.next_runs
            .read()
            .await
            .get(&task_id)
            .copied()
            .ok_or_else(|| SchedulerError::NotScheduled(task_id.to_string()))
    }

    /// Unschedule a task (e.g. after it's disabled or deleted) without a
    /// full `reload_schedules` pass.
    pub async fn unschedule_task(&self, task_id: Uuid) {
        self.next_runs.write().await.remove(&task_id);
    }

    /// Push every currently-scheduled next-run instant back into the config
    /// store, so it survives a restart without a fresh `reload_schedules`.
    async fn persist_next_runs(&self) {
        let snapshot: Vec<(Uuid, chrono::DateTime<Utc>)> = self
            .next_runs
            .read()
            .await
            .iter()
            .map(|(id, next)| (*id, *next))
            .collect();
        for (task_id, next) in snapshot {
            let _ = self.config.update_task_schedule(task_id, None, Some(next)).await;
        }
    }

    /// Start the background polling loop. Idempotent: calling `start`
    /// again while already running replaces the previous loop.
    pub async fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut guard = self.handle.write().await;
        if let Some(existing) = guard.take() {
            existing.abort();
        }
        *guard = Some(tokio::spawn(async move {
            this.run_loop().await;
        }));
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.write().await.take() {
            handle.abort();
        }
    }

    async fn run_loop(&self) {
        loop {
            let due = self.due_tasks().await;
            for task_id in due {
                let executor = Arc::clone(&self.executor);
                tokio::spawn(async move {
                    let _ = executor.execute(task_id).await;
                });
                if let Some(task) = self.config.get_task(task_id).await.ok() {
                    if let Ok(Some(next)) = self.compute_next_run(&task.schedule) {
                        self.next_runs.write().await.insert(task_id, next);
                        let _ = self
                            .config
                            .update_task_schedule(task_id, None, Some(next))
                            .await;
                    }
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn due_tasks(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let next_runs = self.next_runs.read().await;
        next_runs
            .iter()
            .filter(|(_, &next)| next <= now)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_hourly_expression_parses_with_seconds_prefix() {
        let schedule = to_cron_schedule("0 * * * *").unwrap();
        assert!(schedule.upcoming(Utc).next().is_some());
    }

    #[test]
    fn malformed_expression_is_rejected() {
        assert!(to_cron_schedule("not a cron").is_err());
    }

    #[test]
    fn simple_daily_schedule_resolves_to_a_future_instant() {
        let expr = Schedule::Simple {
            simple_type: crate::models::SimplePeriod::Daily,
        }
        .to_cron_expr()
        .unwrap();
        let schedule = to_cron_schedule(&expr).unwrap();
        let next = schedule.upcoming(Utc).next().unwrap();
        assert!(next > Utc::now());
    }

    async fn new_scheduler() -> (Arc<BackupScheduler>, Arc<ConfigStore>) {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let config = Arc::new(
            ConfigStore::load_or_create_default(&config_path, dir.path(), "temp", "sources")
                .await
                .unwrap(),
        );
        let history = Arc::new(crate::history::HistoryStore::connect_in_memory().await.unwrap());
        let executor = Arc::new(Executor::new(config.clone(), history, dir.path().to_path_buf()).await);
        let scheduler = Arc::new(BackupScheduler::new(config.clone(), executor));
        (scheduler, config)
    }

    fn mk_backend() -> crate::models::Backend {
        let now = Utc::now();
        crate::models::Backend {
            id: Uuid::new_v4(),
            name: "local".to_string(),
            kind: crate::models::BackendKind::Local,
            config: Default::default(),
            enabled: true,
            created_at: now,
            updated_at: now,
            last_test_at: None,
            last_test_status: None,
        }
    }

    #[tokio::test]
    async fn get_next_run_fails_for_manual_task() {
        let (scheduler, config) = new_scheduler().await;
        let backend = config.add_backend(mk_backend()).await.unwrap();
        let task = config
            .add_task(crate::models::Task {
                id: Uuid::new_v4(),
                name: "manual".to_string(),
                description: String::new(),
                source_path: "/data".to_string(),
                backend_ids: vec![backend.id],
                schedule: Schedule::Manual,
                archive_options: crate::models::ArchiveOptions::default(),
                retention_policy: crate::models::RetentionPolicy::default(),
                enabled: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                last_run: None,
                next_run: None,
            })
            .await
            .unwrap();

        scheduler.schedule_task(task.id).await.unwrap();
        let err = scheduler.get_next_run(task.id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn schedule_task_is_idempotent_and_persists_next_run() {
        let (scheduler, config) = new_scheduler().await;
        let backend = config.add_backend(mk_backend()).await.unwrap();
        let task = config
            .add_task(crate::models::Task {
                id: Uuid::new_v4(),
                name: "hourly".to_string(),
                description: String::new(),
                source_path: "/data".to_string(),
                backend_ids: vec![backend.id],
                schedule: Schedule::Simple {
                    simple_type: crate::models::SimplePeriod::Hourly,
                },
                archive_options: crate::models::ArchiveOptions::default(),
                retention_policy: crate::models::RetentionPolicy::default(),
                enabled: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                last_run: None,
                next_run: None,
            })
            .await
            .unwrap();

        scheduler.schedule_task(task.id).await.unwrap();
        let first = scheduler.get_next_run(task.id).await.unwrap();
        scheduler.schedule_task(task.id).await.unwrap();
        let second = scheduler.get_next_run(task.id).await.unwrap();
        assert_eq!(first, second);

        let reloaded = config.get_task(task.id).await.unwrap();
        assert_eq!(reloaded.next_run, Some(first));
    }
}

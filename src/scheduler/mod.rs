//! Scheduler module for running probe sweeps and analysis on cron schedules.

mod cron;
mod sweep;

pub use cron::*;
pub use sweep::*;

use chrono::{DateTime, Local, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::analysis::Analyzer;
use crate::clock::Clock;
use crate::config::ConfigError;

/// Work the scheduler can fire.
#[derive(Clone)]
pub enum Job {
    ProbeSweep(ProbeEngine),
    Analysis { analyzer: Analyzer, window_hours: u32 },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::ProbeSweep(_) => "probe_sweep",
            Job::Analysis { .. } => "analysis",
        }
    }

    /// Run once and return the number of rows written.
    ///
    /// Sweeps stop waiting for slow probes at `next_fire`, so the next tick
    /// only skips those services.
    async fn fire(&self, next_fire: Option<DateTime<Utc>>) -> usize {
        match self {
            Job::ProbeSweep(engine) => match next_fire {
                Some(deadline) => engine.sweep_until(deadline).await,
                None => engine.sweep().await,
            },
            Job::Analysis {
                analyzer,
                window_hours,
            } => analyzer.run(*window_hours).await,
        }
    }
}

struct ScheduledJob {
    job: Job,
    schedule: CronSchedule,
}

/// Fires each registered job on its cron schedule, in local time.
///
/// A job never overlaps itself. Ticks that pass while a run is in progress
/// are dropped. Probe sweeps return by their next tick, so they never miss
/// one.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    jobs: Vec<ScheduledJob>,
    stop_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            clock,
            jobs: Vec::new(),
            stop_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register `job` to fire on `cron`. An invalid expression leaves the
    /// scheduler unchanged.
    pub fn add_job(&mut self, cron: &str, job: Job) -> Result<(), ConfigError> {
        let schedule = CronSchedule::parse(cron)?;
        tracing::info!("Scheduler: Adding job {} ({})", job.name(), schedule);
        self.jobs.push(ScheduledJob { job, schedule });
        Ok(())
    }

    /// Spawn one loop per registered job.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        tracing::info!("Starting scheduler with {} jobs", self.jobs.len());

        for scheduled in &self.jobs {
            let job = scheduled.job.clone();
            let schedule = scheduled.schedule.clone();
            let clock = self.clock.clone();
            let stop_rx = self.stop_tx.subscribe();
            handles.push(tokio::spawn(run_job_loop(job, schedule, clock, stop_rx)));
        }
    }

    /// Stop every job loop. A run in progress is allowed to finish.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(());
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler: Job loop failed: {}", e);
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn run_job_loop(
    job: Job,
    schedule: CronSchedule,
    clock: Arc<dyn Clock>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut next = schedule.next_after(&clock.now().with_timezone(&Local));
    while let Some(fire_at) = next {
        let wait = (fire_at - clock.now().with_timezone(&Local))
            .to_std()
            .unwrap_or_default();
        tracing::debug!("Scheduler: Next {} run at {}", job.name(), fire_at);

        tokio::select! {
            _ = stop_rx.recv() => return,
            _ = clock.sleep(wait) => {}
        }

        let following = schedule.next_after(&fire_at);
        let written = job.fire(following.map(|t| t.with_timezone(&Utc))).await;
        tracing::info!("Scheduler: {} wrote {} rows", job.name(), written);

        next = match &job {
            Job::ProbeSweep(_) => following,
            Job::Analysis { .. } => schedule.next_after(&clock.now().with_timezone(&Local)),
        };
    }

    tracing::warn!(
        "Scheduler: {} ({}) has no upcoming run, stopping",
        job.name(),
        schedule
    );
}

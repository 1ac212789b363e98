//! Scheduler engine: sleeps until the next daily fire time and triggers the job.
//! Uses a tokio sleep per firing, so the process is idle between firings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use salesrelay_core::config::ScheduleConfig;
use salesrelay_core::error::{RelayError, Result};
use salesrelay_core::events::{EventSink, PipelineEvent};

use crate::schedule::DailySchedule;

/// The body of one firing.
#[async_trait]
pub trait FiringJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    /// The previous firing had not finished.
    SkippedOverlap,
}

/// Single-timer daily scheduler. At most one firing runs at a time.
pub struct DailyScheduler {
    schedule: DailySchedule,
    job: Arc<dyn FiringJob>,
    firing_timeout: Duration,
    shutdown_grace: Duration,
    events: Arc<dyn EventSink>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl DailyScheduler {
    pub fn new(schedule: DailySchedule, job: Arc<dyn FiringJob>, events: Arc<dyn EventSink>) -> Self {
        Self {
            schedule,
            job,
            firing_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(30),
            events,
            in_flight: Mutex::new(None),
        }
    }

    pub fn from_config(
        config: &ScheduleConfig,
        job: Arc<dyn FiringJob>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let schedule = DailySchedule::parse(&config.fire_at)?;
        Ok(Self::new(schedule, job, events)
            .with_timeouts(config.firing_timeout(), config.shutdown_grace()))
    }

    pub fn with_timeouts(mut self, firing_timeout: Duration, shutdown_grace: Duration) -> Self {
        self.firing_timeout = firing_timeout;
        self.shutdown_grace = shutdown_grace;
        self
    }

    pub fn schedule(&self) -> DailySchedule {
        self.schedule
    }

    /// Start a firing in the background unless one is still running.
    pub async fn trigger(&self) -> TriggerOutcome {
        let mut slot = self.in_flight.lock().await;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            self.events.record(PipelineEvent::FiringSkipped {
                job: self.job.name().to_string(),
                reason: "previous firing still running".into(),
            });
            return TriggerOutcome::SkippedOverlap;
        }

        let job = Arc::clone(&self.job);
        let events = Arc::clone(&self.events);
        let limit = self.firing_timeout;
        *slot = Some(tokio::spawn(async move {
            // Outcome is already recorded as an event.
            let _ = fire(job.as_ref(), events.as_ref(), limit).await;
        }));
        TriggerOutcome::Started
    }

    /// Run one firing inline and return its outcome.
    pub async fn fire_once(&self) -> Result<()> {
        fire(self.job.as_ref(), self.events.as_ref(), self.firing_timeout).await
    }

    /// Fire daily at the scheduled local time until `token` is cancelled.
    /// Firings missed while the process was down are not replayed.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        tracing::info!(
            "⏰ Scheduler started: '{}' daily at {} (local time)",
            self.job.name(),
            self.schedule
        );

        let mut last_target: Option<DateTime<Local>> = None;
        loop {
            let now = Local::now();
            let from = match last_target {
                Some(target) if target > now => target,
                _ => now,
            };
            let target = self.schedule.next_after(&from)?;
            let wait = (target - now).to_std().unwrap_or(Duration::ZERO);
            tracing::info!("⏰ Next firing of '{}' at {target}", self.job.name());

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            last_target = Some(target);
            self.trigger().await;
        }

        self.shutdown().await;
        Ok(())
    }

    /// Wait up to the grace period for an in-flight firing, then abort it.
    pub async fn shutdown(&self) {
        let Some(mut handle) = self.in_flight.lock().await.take() else {
            return;
        };
        if handle.is_finished() {
            return;
        }

        tracing::info!(
            "⏳ Waiting up to {:?} for in-flight firing of '{}'",
            self.shutdown_grace,
            self.job.name()
        );
        if tokio::time::timeout(self.shutdown_grace, &mut handle).await.is_err() {
            handle.abort();
            self.events.record(PipelineEvent::FiringAborted {
                job: self.job.name().to_string(),
            });
        }
    }
}

async fn fire(job: &dyn FiringJob, events: &dyn EventSink, limit: Duration) -> Result<()> {
    let name = job.name().to_string();
    events.record(PipelineEvent::FiringStarted { job: name.clone() });
    let started = Instant::now();

    let result = match tokio::time::timeout(limit, job.run()).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("firing exceeded {limit:?}"),
        ))),
    };

    match &result {
        Ok(()) => events.record(PipelineEvent::FiringCompleted {
            job: name,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }),
        Err(e) => events.record(PipelineEvent::FiringFailed {
            job: name,
            error: e.to_string(),
        }),
    }
    result
}

//! Background job trigger and status tracking for snapshot generation.
//!
//! [`SnapshotService`] is the application-facing entry point. When a
//! [`JobQueue`] is configured, generation runs out-of-band and is tracked by a
//! persisted [`JobRecord`]; without one (or when the queue refuses the job),
//! generation runs synchronously inside the caller's request.

use std::{
  fmt,
  str::FromStr,
  sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
  },
  time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  builder::{BuildOptions, BuildOutcome, BuildReport, Checkpoint, Progress, ProgressLevel, build_snapshots},
  events::{EventBus, RetentionEvent},
  history::ProductId,
  query::{CohortFilters, CohortMatrix, cohort_matrix},
  snapshot::SnapshotStats,
  store::RetentionStore,
};

/// Name under which snapshot jobs are enqueued.
pub const JOB_NAME: &str = "cohort/generate_retention_snapshots";
/// Queue that snapshot jobs are enqueued on.
pub const QUEUE_NAME: &str = "cohort-retention";

// ─── Status records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Pending,
  Completed,
  Failed,
}

impl JobStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for JobStatus {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "completed" => Ok(Self::Completed),
      "failed" => Ok(Self::Failed),
      other => Err(Error::UnknownJobStatus(other.to_owned())),
    }
  }
}

/// The persisted status of one background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
  pub job_id:      String,
  pub status:      JobStatus,
  pub started_at:  DateTime<Utc>,
  pub product_id:  Option<ProductId>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message:     Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stats:       Option<SnapshotStats>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
  pub fn pending(job_id: String, started_at: DateTime<Utc>, product_id: Option<ProductId>) -> Self {
    Self {
      job_id,
      status: JobStatus::Pending,
      started_at,
      product_id,
      message: None,
      stats: None,
      finished_at: None,
    }
  }
}

/// A job identifier from a unix-microsecond stamp, e.g.
/// `retention_snapshot_1718000000123456`.
pub fn job_id_from_stamp(stamp: i64) -> String { format!("retention_snapshot_{stamp}") }

// ─── Queue ───────────────────────────────────────────────────────────────────

/// Arguments of a snapshot job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotJob {
  pub job_id:     String,
  pub product_id: Option<ProductId>,
  /// Set on continuation jobs after a budgeted run yielded.
  pub resume:     Option<Checkpoint>,
}

/// One entry handed to a [`JobQueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
  pub run_at: DateTime<Utc>,
  pub name:   String,
  pub args:   SnapshotJob,
  pub queue:  String,
}

impl QueuedJob {
  pub fn snapshot(run_at: DateTime<Utc>, args: SnapshotJob) -> Self {
    Self {
      run_at,
      name: JOB_NAME.to_owned(),
      args,
      queue: QUEUE_NAME.to_owned(),
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error("job queue unavailable")]
  Unavailable,
}

/// The host's asynchronous job queue.
pub trait JobQueue: Send + Sync {
  fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError>;
}

// ─── Responses ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
  Background,
  Synchronous,
}

/// Result of [`SnapshotService::trigger`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerResponse {
  pub success: bool,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub job_id:  Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stats:   Option<SnapshotStats>,
  pub mode:    ExecutionMode,
}

/// Job status as reported to callers; a pending record reads as `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
  Running,
  Completed,
  Failed,
}

impl From<JobStatus> for ReportedStatus {
  fn from(s: JobStatus) -> Self {
    match s {
      JobStatus::Pending => Self::Running,
      JobStatus::Completed => Self::Completed,
      JobStatus::Failed => Self::Failed,
    }
  }
}

/// Result of [`SnapshotService::job_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
  pub success: bool,
  pub status:  Option<ReportedStatus>,
  pub message: String,
  pub stats:   Option<SnapshotStats>,
  pub data:    Option<JobRecord>,
}

/// What a worker did with one dequeued job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobRunOutcome {
  Completed(SnapshotStats),
  /// Yielded on the time budget and re-enqueued from `Checkpoint`.
  Continued(Checkpoint),
  Failed(String),
}

/// Forward builder progress to `tracing`.
pub fn trace_progress(message: &str, level: ProgressLevel) {
  match level {
    ProgressLevel::Info => tracing::info!("{message}"),
    ProgressLevel::Success => tracing::info!(success = true, "{message}"),
    ProgressLevel::Warning => tracing::warn!("{message}"),
    ProgressLevel::Error => tracing::error!("{message}"),
  }
}

// ─── Service ─────────────────────────────────────────────────────────────────

/// Application context for the retention pipeline: owns the store, the
/// optional job queue and the event bus.
pub struct SnapshotService<S> {
  store:  Arc<S>,
  queue:  Option<Arc<dyn JobQueue>>,
  events: Arc<EventBus>,
  budget: Option<Duration>,
  clock:  fn() -> DateTime<Utc>,
  /// Last stamp handed out; job ids stay unique within the process.
  stamp:  AtomicI64,
}

impl<S> SnapshotService<S>
where
  S: RetentionStore,
{
  /// A service without a job queue; every trigger runs synchronously.
  pub fn new(store: Arc<S>, events: Arc<EventBus>) -> Self {
    Self {
      store,
      queue: None,
      events,
      budget: None,
      clock: Utc::now,
      stamp: AtomicI64::new(i64::MIN),
    }
  }

  pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
    self.queue = Some(queue);
    self
  }

  /// Per-invocation wall-clock budget for background runs.
  pub fn with_budget(mut self, budget: Duration) -> Self {
    self.budget = Some(budget);
    self
  }

  pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
    self.clock = clock;
    self
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  pub fn events(&self) -> &EventBus { &self.events }

  // ── Trigger ───────────────────────────────────────────────────────────

  /// Start snapshot generation, in the background if a queue is available.
  pub async fn trigger(&self, product_id: Option<ProductId>) -> TriggerResponse {
    let Some(queue) = &self.queue else {
      return self.trigger_synchronous(product_id).await;
    };

    let now = (self.clock)();
    let job_id = self.next_job_id(now);
    let record = JobRecord::pending(job_id.clone(), now, product_id);
    if let Err(e) = self.store.put_job(&record).await {
      tracing::error!(%job_id, error = %e, "failed to persist job record");
      return TriggerResponse {
        success: false,
        message: format!("Failed to schedule snapshot generation: {e}"),
        job_id:  None,
        stats:   None,
        mode:    ExecutionMode::Background,
      };
    }

    let args = SnapshotJob { job_id: job_id.clone(), product_id, resume: None };
    match queue.enqueue(QueuedJob::snapshot(now, args)) {
      Ok(()) => {
        tracing::info!(%job_id, ?product_id, "snapshot generation queued");
        self.events.emit(RetentionEvent::SnapshotJobQueued { job_id: job_id.clone(), product_id });
        TriggerResponse {
          success: true,
          message: "Snapshot generation started in background".to_owned(),
          job_id:  Some(job_id),
          stats:   None,
          mode:    ExecutionMode::Background,
        }
      }
      Err(e) => {
        tracing::warn!(%job_id, error = %e, "job queue refused job; running synchronously");
        let response = self.trigger_synchronous(product_id).await;
        // Resolve the record we already wrote so it never reads as running.
        let (status, stats) = match response.stats {
          Some(stats) if response.success => (JobStatus::Completed, Some(stats)),
          _ => (JobStatus::Failed, None),
        };
        self.finish(&job_id, product_id, status, response.message.clone(), stats).await;
        response
      }
    }
  }

  /// The current time in microseconds, bumped past the previous id when two
  /// triggers land in the same microsecond.
  fn next_job_id(&self, now: DateTime<Utc>) -> String {
    let micros = now.timestamp_micros();
    let previous = self
      .stamp
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(micros.max(last.saturating_add(1)))
      })
      .unwrap_or_else(|last| last);
    job_id_from_stamp(micros.max(previous.saturating_add(1)))
  }

  async fn trigger_synchronous(&self, product_id: Option<ProductId>) -> TriggerResponse {
    match self.run_synchronous(product_id, &trace_progress).await {
      Ok(report) => TriggerResponse {
        success: true,
        message: format!(
          "Snapshots generated successfully ({} rows written)",
          report.rows_written
        ),
        job_id:  None,
        stats:   Some(report.stats),
        mode:    ExecutionMode::Synchronous,
      },
      Err(e) => TriggerResponse {
        success: false,
        message: format!("Snapshot generation failed: {e}"),
        job_id:  None,
        stats:   None,
        mode:    ExecutionMode::Synchronous,
      },
    }
  }

  /// Run the builder to completion in the current task, ignoring the budget.
  /// Used by the synchronous fallback and the CLI.
  pub async fn run_synchronous(
    &self,
    product_id: Option<ProductId>,
    progress: Progress<'_>,
  ) -> Result<BuildReport> {
    self.events.emit(RetentionEvent::SnapshotBuildStarted { job_id: None, product_id });
    let options = BuildOptions::new(product_id, (self.clock)().date_naive());
    match build_snapshots(self.store.as_ref(), &options, progress).await {
      Ok(report) => {
        self.events.emit(RetentionEvent::SnapshotBuildCompleted { job_id: None, stats: report.stats });
        Ok(report)
      }
      Err(e) => {
        progress(&format!("Snapshot generation failed: {e}"), ProgressLevel::Error);
        self.events.emit(RetentionEvent::SnapshotBuildFailed { job_id: None, message: e.to_string() });
        Err(e)
      }
    }
  }

  // ── Worker side ───────────────────────────────────────────────────────

  /// Execute one dequeued job. Never returns an error: failures are
  /// recorded on the job's status record.
  pub async fn run_job(&self, job: SnapshotJob) -> JobRunOutcome {
    let SnapshotJob { job_id, product_id, resume } = job;
    if resume.is_none() {
      self.events.emit(RetentionEvent::SnapshotBuildStarted {
        job_id: Some(job_id.clone()),
        product_id,
      });
    }

    let mut options = BuildOptions::new(product_id, (self.clock)().date_naive());
    options.budget = self.budget;
    options.resume = resume;

    let report = match build_snapshots(self.store.as_ref(), &options, &trace_progress).await {
      Ok(report) => report,
      Err(e) => return self.fail(&job_id, product_id, e).await,
    };

    let checkpoint = match report.outcome {
      BuildOutcome::Complete => return self.complete(&job_id, product_id, report.stats).await,
      BuildOutcome::Partial { checkpoint } => checkpoint,
    };

    self.events.emit(RetentionEvent::SnapshotBuildYielded { job_id: job_id.clone(), checkpoint });
    let next = SnapshotJob { job_id: job_id.clone(), product_id, resume: Some(checkpoint) };
    let enqueued = self
      .queue
      .as_ref()
      .map(|q| q.enqueue(QueuedJob::snapshot((self.clock)(), next)));

    match enqueued {
      Some(Ok(())) => {
        tracing::info!(%job_id, ?checkpoint, "snapshot job continues in a follow-up run");
        JobRunOutcome::Continued(checkpoint)
      }
      // Nowhere to continue; finish the remaining units inline.
      _ => {
        options.budget = None;
        options.resume = Some(checkpoint);
        match build_snapshots(self.store.as_ref(), &options, &trace_progress).await {
          Ok(report) => self.complete(&job_id, product_id, report.stats).await,
          Err(e) => self.fail(&job_id, product_id, e).await,
        }
      }
    }
  }

  async fn complete(
    &self,
    job_id: &str,
    product_id: Option<ProductId>,
    stats: SnapshotStats,
  ) -> JobRunOutcome {
    let message = "Snapshot generation completed".to_owned();
    self
      .finish(job_id, product_id, JobStatus::Completed, message, Some(stats))
      .await;
    self.events.emit(RetentionEvent::SnapshotBuildCompleted { job_id: Some(job_id.to_owned()), stats });
    JobRunOutcome::Completed(stats)
  }

  /// Mark a job failed. Also used by workers for faults outside the builder,
  /// such as a panicked task.
  pub async fn fail(
    &self,
    job_id: &str,
    product_id: Option<ProductId>,
    error: impl fmt::Display + Send,
  ) -> JobRunOutcome {
    let message = format!("Snapshot generation failed: {error}");
    self.finish(job_id, product_id, JobStatus::Failed, message.clone(), None).await;
    self.events.emit(RetentionEvent::SnapshotBuildFailed {
      job_id:  Some(job_id.to_owned()),
      message: message.clone(),
    });
    JobRunOutcome::Failed(message)
  }

  /// Write a terminal status onto the job's record. If the record is gone or
  /// unreadable a fresh one is written from what the caller knows.
  async fn finish(
    &self,
    job_id: &str,
    product_id: Option<ProductId>,
    status: JobStatus,
    message: String,
    stats: Option<SnapshotStats>,
  ) {
    let now = (self.clock)();
    let mut record = match self.store.get_job(job_id).await {
      Ok(Some(record)) => record,
      Ok(None) => {
        tracing::warn!(%job_id, "job record missing; recreating it");
        JobRecord::pending(job_id.to_owned(), now, product_id)
      }
      Err(e) => {
        tracing::error!(%job_id, error = %e, "failed to load job record");
        JobRecord::pending(job_id.to_owned(), now, product_id)
      }
    };
    record.status = status;
    record.message = Some(message);
    record.stats = stats;
    record.finished_at = Some(now);
    if let Err(e) = self.store.put_job(&record).await {
      tracing::error!(%job_id, error = %e, "failed to persist job status");
    }
  }

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Look up a job's status. Pending jobs report as `running`.
  pub async fn job_status(&self, job_id: &str) -> Result<StatusResponse> {
    let Some(record) = self.store.get_job(job_id).await.map_err(Error::store)? else {
      return Ok(StatusResponse {
        success: false,
        status:  None,
        message: "Job not found".to_owned(),
        stats:   None,
        data:    None,
      });
    };

    let status = ReportedStatus::from(record.status);
    let message = record.message.clone().unwrap_or_else(|| match status {
      ReportedStatus::Running => "Snapshot generation is in progress".to_owned(),
      ReportedStatus::Completed => "Snapshot generation completed".to_owned(),
      ReportedStatus::Failed => "Snapshot generation failed".to_owned(),
    });

    Ok(StatusResponse {
      success: true,
      status: Some(status),
      message,
      stats: record.stats,
      data: Some(record),
    })
  }

  pub async fn cohort_matrix(&self, filters: &CohortFilters) -> Result<CohortMatrix> {
    cohort_matrix(self.store.as_ref(), filters).await
  }

  pub async fn stats(&self) -> Result<SnapshotStats> {
    self.store.snapshot_stats().await.map_err(Error::store)
  }
}

//! In-process job queue and worker for background snapshot generation.
//!
//! [`WorkerQueue`] is the [`JobQueue`] handed to the [`SnapshotService`]; the
//! worker task drains it one job at a time, waiting for each job's `run_at`.
//! Continuations enqueued by a yielding job land back on the same channel.

use std::sync::Arc;

use chrono::Utc;
use cohort_core::{
  job::{JOB_NAME, JobQueue, JobRunOutcome, QueueError, QueuedJob, SnapshotService},
  store::RetentionStore,
};
use tokio::{sync::mpsc, task::JoinHandle};

/// Sending half of the worker channel.
#[derive(Clone)]
pub struct WorkerQueue {
  tx: mpsc::UnboundedSender<QueuedJob>,
}

impl JobQueue for WorkerQueue {
  fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
    self.tx.send(job).map_err(|_| QueueError::Unavailable)
  }
}

/// Create a queue and the receiver its worker drains.
pub fn channel() -> (WorkerQueue, mpsc::UnboundedReceiver<QueuedJob>) {
  let (tx, rx) = mpsc::unbounded_channel();
  (WorkerQueue { tx }, rx)
}

/// Spawn the worker loop. It ends once every [`WorkerQueue`] is dropped.
pub fn spawn_worker<S>(
  service: Arc<SnapshotService<S>>,
  mut rx: mpsc::UnboundedReceiver<QueuedJob>,
) -> JoinHandle<()>
where
  S: RetentionStore + 'static,
{
  tokio::spawn(async move {
    tracing::info!("snapshot worker started");
    while let Some(job) = rx.recv().await {
      process(&service, job).await;
    }
    tracing::info!("snapshot worker stopped");
  })
}

/// Run every job already waiting on `rx`, including continuations they
/// enqueue, and return how many were processed.
pub async fn run_until_idle<S>(
  service: &Arc<SnapshotService<S>>,
  rx: &mut mpsc::UnboundedReceiver<QueuedJob>,
) -> usize
where
  S: RetentionStore + 'static,
{
  let mut processed = 0;
  while let Ok(job) = rx.try_recv() {
    process(service, job).await;
    processed += 1;
  }
  processed
}

/// Execute one dequeued job on its own task so a panic is recorded as a
/// failure instead of taking the worker down.
async fn process<S>(service: &Arc<SnapshotService<S>>, job: QueuedJob) -> Option<JobRunOutcome>
where
  S: RetentionStore + 'static,
{
  if job.name != JOB_NAME {
    tracing::warn!(name = %job.name, "ignoring job with unknown name");
    return None;
  }

  if let Ok(delay) = (job.run_at - Utc::now()).to_std() {
    tokio::time::sleep(delay).await;
  }

  let job_id = job.args.job_id.clone();
  let product_id = job.args.product_id;
  let task = {
    let service = Arc::clone(service);
    tokio::spawn(async move { service.run_job(job.args).await })
  };

  let outcome = match task.await {
    Ok(outcome) => outcome,
    Err(e) => {
      tracing::error!(%job_id, error = %e, "snapshot job aborted");
      service.fail(&job_id, product_id, e).await
    }
  };

  match &outcome {
    JobRunOutcome::Completed(stats) => {
      tracing::info!(%job_id, total_records = stats.total_records, "snapshot job completed");
    }
    JobRunOutcome::Continued(checkpoint) => {
      tracing::debug!(%job_id, ?checkpoint, "snapshot job yielded");
    }
    JobRunOutcome::Failed(message) => tracing::error!(%job_id, %message, "snapshot job failed"),
  }
  Some(outcome)
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use chrono::NaiveDate;
  use cohort_core::{
    events::EventBus,
    history::{BillingInterval, NewSubscription},
    job::{ExecutionMode, ReportedStatus},
  };
  use cohort_store_sqlite::SqliteStore;

  use super::*;

  async fn seeded_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let a = store.add_product("Starter".into()).await.unwrap().product_id;
    let b = store.add_product("Pro".into()).await.unwrap().product_id;
    for (customer_id, product_id, start) in
      [(1, a, "2024-01-05"), (2, a, "2024-02-10"), (3, b, "2024-03-01")]
    {
      store
        .record_subscription(NewSubscription {
          customer_id,
          product_id,
          variation_id: None,
          started_at: start.parse::<NaiveDate>().unwrap(),
          ended_at: None,
          recurring_amount: 1_000,
          billing_interval: BillingInterval::Month,
        })
        .await
        .unwrap();
    }
    store
  }

  #[tokio::test]
  async fn queued_job_runs_to_completion() {
    let (queue, mut rx) = channel();
    let service = Arc::new(
      SnapshotService::new(Arc::new(seeded_store().await), Arc::new(EventBus::new()))
        .with_queue(Arc::new(queue)),
    );

    let response = service.trigger(None).await;
    assert!(response.success);
    assert_eq!(response.mode, ExecutionMode::Background);
    let job_id = response.job_id.unwrap();

    let status = service.job_status(&job_id).await.unwrap();
    assert_eq!(status.status, Some(ReportedStatus::Running));

    assert_eq!(run_until_idle(&service, &mut rx).await, 1);
    let status = service.job_status(&job_id).await.unwrap();
    assert_eq!(status.status, Some(ReportedStatus::Completed));
    assert!(status.stats.unwrap().total_records > 0);
  }

  #[tokio::test]
  async fn zero_budget_job_continues_until_done() {
    let (queue, mut rx) = channel();
    let service = Arc::new(
      SnapshotService::new(Arc::new(seeded_store().await), Arc::new(EventBus::new()))
        .with_queue(Arc::new(queue))
        .with_budget(Duration::ZERO),
    );

    let job_id = service.trigger(None).await.job_id.unwrap();
    // One unit per run: all-products has 3 cohorts, product a 2, product b 1.
    assert_eq!(run_until_idle(&service, &mut rx).await, 6);

    let status = service.job_status(&job_id).await.unwrap();
    assert_eq!(status.status, Some(ReportedStatus::Completed));

    // The continuation chain produces the same table as a one-shot build.
    let stats = service.stats().await.unwrap();
    let fresh = SnapshotService::new(Arc::new(seeded_store().await), Arc::new(EventBus::new()));
    let report = fresh.run_synchronous(None, &cohort_core::builder::silent).await.unwrap();
    assert_eq!(stats, report.stats);
  }

  #[tokio::test]
  async fn closed_channel_falls_back_to_synchronous() {
    let (queue, rx) = channel();
    drop(rx);
    let service = SnapshotService::new(Arc::new(seeded_store().await), Arc::new(EventBus::new()))
      .with_queue(Arc::new(queue));

    let response = service.trigger(None).await;
    assert!(response.success);
    assert_eq!(response.mode, ExecutionMode::Synchronous);
    assert!(response.stats.is_some());
  }

  #[tokio::test]
  async fn unknown_job_names_are_skipped() {
    let (queue, mut rx) = channel();
    let service = Arc::new(SnapshotService::new(
      Arc::new(SqliteStore::open_in_memory().await.unwrap()),
      Arc::new(EventBus::new()),
    ));
    let mut job = QueuedJob::snapshot(Utc::now(), cohort_core::job::SnapshotJob {
      job_id:     "x".into(),
      product_id: None,
      resume:     None,
    });
    job.name = "something/else".into();
    queue.enqueue(job).unwrap();

    assert_eq!(run_until_idle(&service, &mut rx).await, 1);
    assert!(service.job_status("x").await.unwrap().data.is_none());
  }
}

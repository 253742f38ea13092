//! Typed pipeline events and an explicitly constructed listener registry.
//!
//! The bus is built once at startup, listeners are registered on it, and it
//! is then shared read-only (behind an `Arc`) by whatever emits events.

use std::sync::Arc;

use serde::Serialize;

use crate::{builder::Checkpoint, history::ProductId, snapshot::SnapshotStats};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RetentionEvent {
  /// A background build was accepted by the job queue.
  SnapshotJobQueued {
    job_id:     String,
    product_id: Option<ProductId>,
  },
  /// A build began. `job_id` is `None` for synchronous builds.
  SnapshotBuildStarted {
    job_id:     Option<String>,
    product_id: Option<ProductId>,
  },
  /// A background build ran out of time budget and was re-enqueued.
  SnapshotBuildYielded {
    job_id:     String,
    checkpoint: Checkpoint,
  },
  SnapshotBuildCompleted {
    job_id: Option<String>,
    stats:  SnapshotStats,
  },
  SnapshotBuildFailed {
    job_id:  Option<String>,
    message: String,
  },
}

pub trait EventListener: Send + Sync {
  fn on_event(&self, event: &RetentionEvent);
}

impl<F> EventListener for F
where
  F: Fn(&RetentionEvent) + Send + Sync,
{
  fn on_event(&self, event: &RetentionEvent) { self(event) }
}

/// Logs every event through `tracing`.
pub struct TracingListener;

impl EventListener for TracingListener {
  fn on_event(&self, event: &RetentionEvent) {
    match event {
      RetentionEvent::SnapshotBuildFailed { job_id, message } => {
        tracing::error!(?job_id, %message, "snapshot build failed");
      }
      other => tracing::info!(event = ?other, "retention event"),
    }
  }
}

#[derive(Default, Clone)]
pub struct EventBus {
  listeners: Vec<Arc<dyn EventListener>>,
}

impl EventBus {
  pub fn new() -> Self { Self::default() }

  pub fn register(&mut self, listener: impl EventListener + 'static) {
    self.listeners.push(Arc::new(listener));
  }

  /// Deliver `event` to every listener, in registration order.
  pub fn emit(&self, event: RetentionEvent) {
    for listener in &self.listeners {
      listener.on_event(&event);
    }
  }

  pub fn len(&self) -> usize { self.listeners.len() }

  pub fn is_empty(&self) -> bool { self.listeners.is_empty() }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use super::*;

  #[test]
  fn listeners_receive_events_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut bus = EventBus::new();
    for tag in ["first", "second"] {
      let seen = Arc::clone(&seen);
      bus.register(move |e: &RetentionEvent| {
        if let RetentionEvent::SnapshotJobQueued { job_id, .. } = e {
          seen.lock().unwrap().push(format!("{tag}:{job_id}"));
        }
      });
    }
    bus.register(TracingListener);
    assert_eq!(bus.len(), 3);

    bus.emit(RetentionEvent::SnapshotJobQueued { job_id: "j1".into(), product_id: None });
    assert_eq!(*seen.lock().unwrap(), vec!["first:j1", "second:j1"]);
  }

  #[test]
  fn events_serialise_with_tag() {
    let json = serde_json::to_value(RetentionEvent::SnapshotBuildFailed {
      job_id:  None,
      message: "boom".into(),
    })
    .unwrap();
    assert_eq!(json["event"], "snapshot_build_failed");
    assert_eq!(json["message"], "boom");
  }
}

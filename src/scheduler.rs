//! Scheduler: turns the node inventory into tasks on the task queue.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerSettings;
use crate::lock::SchedulerLock;
use crate::messaging::MessageBus;
use crate::models::Task;
use crate::resources::{NodeBackend, Registry};

/// Interleaves per-node work so that one task is taken from every node with
/// work left before any node gets a second one.
pub fn distribute<T>(per_node: BTreeMap<String, Vec<T>>) -> Vec<T> {
  let mut queues: Vec<VecDeque<T>> = per_node
    .into_values()
    .filter(|tasks| !tasks.is_empty())
    .map(VecDeque::from)
    .collect();
  let mut ordered = Vec::with_capacity(queues.iter().map(VecDeque::len).sum());
  while !queues.is_empty() {
    for queue in queues.iter_mut() {
      if let Some(task) = queue.pop_front() {
        ordered.push(task);
      }
    }
    queues.retain(|q| !q.is_empty());
  }
  ordered
}

pub struct Scheduler {
  registry: Mutex<Registry>,
  backend: Arc<dyn NodeBackend>,
  lock: Arc<dyn SchedulerLock>,
  bus: Arc<dyn MessageBus>,
  settings: SchedulerSettings,
  task_queue: String,
}

impl Scheduler {
  pub fn new(
    registry: Registry,
    backend: Arc<dyn NodeBackend>,
    lock: Arc<dyn SchedulerLock>,
    bus: Arc<dyn MessageBus>,
    settings: SchedulerSettings,
    task_queue: &str,
  ) -> Self {
    Self {
      registry: Mutex::new(registry),
      backend,
      lock,
      bus,
      settings,
      task_queue: task_queue.to_string(),
    }
  }

  /// Reloads the nodes and submits one task per (node, monitor) pairing.
  pub async fn run_once(&self) -> Result<usize> {
    let nodes = self.backend.load_nodes().await?;
    let per_node = {
      let mut registry = self.registry.lock().await;
      let rejected = registry.replace_nodes(nodes);
      if !rejected.is_empty() {
        warn!("{} nodes skipped this pass", rejected.len());
      }
      registry.tasks_by_node()?
    };

    let mut submitted = 0;
    for context in distribute(per_node) {
      let task = Task::from_context(context)?;
      debug!(check = %task.id, "submitting task");
      self.bus.send(&self.task_queue, &serde_json::to_vec(&task)?, Duration::ZERO).await?;
      submitted += 1;
    }
    Ok(submitted)
  }

  /// One scheduling round. Returns how long to wait before the next one.
  pub async fn tick(&self) -> Duration {
    match self.lock.acquire().await {
      Ok(acquisition) if acquisition.is_held() => {
        debug!("Scheduler lock {:?}", acquisition);
        let start = Instant::now();
        match self.run_once().await {
          Ok(submitted) => info!("Submitted {} tasks", submitted),
          Err(e) => error!("Scheduling pass failed: {:?}", e),
        }
        let elapsed = start.elapsed();
        debug!("Scheduler iteration took {}ms", elapsed.as_millis());
        self.settings.interval.saturating_sub(elapsed)
      }
      Ok(_) => {
        debug!("Scheduler lock held elsewhere, backing off");
        self.settings.lock_backoff
      }
      Err(e) => {
        error!("Unable to acquire scheduler lock: {}", e);
        self.settings.lock_backoff
      }
    }
  }

  pub async fn run(&self) -> Result<()> {
    info!("Scheduler started, interval {}s", self.settings.interval.as_secs());
    loop {
      let sleep_for = self.tick().await;
      debug!("Scheduler sleeping for {}s", sleep_for.as_secs());
      tokio::time::sleep(sleep_for).await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::lock::{Acquisition, KvLock, NoOpLock};
  use crate::messaging::MemoryBus;
  use crate::resources::{NodesDocument, StaticNodeBackend};
  use crate::store::MemoryStore;
  use serde_json::json;

  fn backend() -> Arc<dyn NodeBackend> {
    let document: NodesDocument = serde_json::from_value(json!({"nodes": {
      "www1": {"monitoring_groups": ["web"]},
      "www2": {"monitoring_groups": ["web"]},
      "db1": {"monitoring_groups": ["all"]},
    }}))
    .unwrap();
    Arc::new(StaticNodeBackend::new(document.nodes))
  }

  fn scheduler(bus: &MemoryBus, lock: Arc<dyn SchedulerLock>) -> Scheduler {
    Scheduler::new(
      crate::resources::tests::registry(),
      backend(),
      lock,
      Arc::new(bus.clone()),
      SchedulerSettings::default(),
      "tasks",
    )
  }

  #[test]
  fn round_robin_takes_one_task_per_node_per_pass() {
    let per_node = BTreeMap::from([
      ("a".to_string(), vec!["a1", "a2", "a3"]),
      ("b".to_string(), vec!["b1"]),
      ("c".to_string(), vec!["c1", "c2"]),
      ("d".to_string(), vec![]),
    ]);
    assert_eq!(distribute(per_node), vec!["a1", "b1", "c1", "a2", "c2", "a3"]);
  }

  #[tokio::test]
  async fn run_once_submits_every_pairing_interleaved() {
    let bus = MemoryBus::new();
    let submitted = scheduler(&bus, Arc::new(NoOpLock::new())).run_once().await.unwrap();
    assert_eq!(submitted, 5);

    let ids: Vec<String> = bus
      .pending("tasks")
      .await
      .iter()
      .map(|(_, body)| Task::from_slice(body).unwrap().id)
      .collect();
    assert_eq!(
      ids,
      vec!["db1:heartbeat", "www1:heartbeat", "www2:heartbeat", "www1:http", "www2:http"]
    );
  }

  #[tokio::test]
  async fn bad_inventory_entry_does_not_stop_the_pass() {
    let document: NodesDocument = serde_json::from_value(json!({"nodes": {
      "www1": {"monitoring_groups": ["web"]},
      "typo": {"monitoring_groups": ["missing"]},
    }}))
    .unwrap();
    let bus = MemoryBus::new();
    let scheduler = Scheduler::new(
      crate::resources::tests::registry(),
      Arc::new(StaticNodeBackend::new(document.nodes)),
      Arc::new(NoOpLock::new()),
      Arc::new(bus.clone()),
      SchedulerSettings::default(),
      "tasks",
    );
    assert_eq!(scheduler.run_once().await.unwrap(), 2);
    assert_eq!(bus.pending("tasks").await.len(), 2);
  }

  #[tokio::test]
  async fn only_the_lock_holder_schedules() {
    let store = Arc::new(MemoryStore::new());
    let holder = Arc::new(KvLock::new(store.clone(), "locks", "scheduler_lock", 120));
    let other = Arc::new(KvLock::new(store, "locks", "scheduler_lock", 120));
    assert_eq!(holder.acquire().await.unwrap(), Acquisition::Acquired);

    let bus = MemoryBus::new();
    let contended = scheduler(&bus, other);
    assert_eq!(contended.tick().await, Duration::from_secs(10));
    assert!(bus.pending("tasks").await.is_empty());

    let active = scheduler(&bus, holder);
    let wait = active.tick().await;
    assert!(wait <= Duration::from_secs(300) && wait > Duration::from_secs(10));
    assert_eq!(bus.pending("tasks").await.len(), 5);
  }
}

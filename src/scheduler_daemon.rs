use std::sync::Arc;

use tracing::info;
use vigil::config::{Config, init_tracing};
use vigil::database::{PgStore, setup_database};
use vigil::lock::{KvLock, NoOpLock, SchedulerLock};
use vigil::messaging::AmqpBus;
use vigil::resources::{JsonNodeBackend, load_resources};
use vigil::scheduler::Scheduler;
use vigil::store::KeyValueStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();
  let config = Config::from_env()?;
  let settings = config.scheduler.clone();

  let registry = load_resources(&settings.resources_path).await?;
  let backend = JsonNodeBackend::new(settings.nodes_path.clone());

  let db_pool = setup_database(&config.database_url).await?;
  let store: Arc<dyn KeyValueStore> = Arc::new(PgStore::new(db_pool));
  let lock: Arc<dyn SchedulerLock> = if settings.use_lock {
    let duration = i64::try_from(settings.lock_duration.as_secs())?;
    Arc::new(KvLock::new(store, &config.lock_domain, &settings.lock_name, duration))
  } else {
    Arc::new(NoOpLock::new())
  };

  let bus = AmqpBus::connect(&config.rabbitmq_url).await?;
  info!("Scheduler submitting to {}", config.task_queue);
  let scheduler = Scheduler::new(registry, Arc::new(backend), lock, Arc::new(bus), settings, &config.task_queue);
  scheduler.run().await
}

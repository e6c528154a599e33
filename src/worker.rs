use std::sync::Arc;

use tracing::info;
use vigil::config::{Config, init_tracing};
use vigil::database::{PgStore, setup_database};
use vigil::executor::ShellExecutor;
use vigil::messaging::AmqpBus;
use vigil::probe::Probe;
use vigil::state::StateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();
  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url).await?;
  let bus = AmqpBus::connect(&config.rabbitmq_url).await?;
  let states = StateStore::new(Arc::new(PgStore::new(db_pool)), &config.state_domain);

  info!(
    "Probe starting: timeout {}s, max_retries {}, retry_delay {}s",
    config.probe.monitor_timeout.as_secs(),
    config.probe.max_retries,
    config.probe.retry_delay.as_secs()
  );
  let probe = Probe::new(
    Arc::new(states),
    Arc::new(bus),
    Arc::new(ShellExecutor::new()),
    config.probe.clone(),
    &config.task_queue,
    &config.results_topic,
  );
  probe.run().await
}

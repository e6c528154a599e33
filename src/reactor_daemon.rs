use std::sync::Arc;

use tracing::info;
use vigil::config::{Config, init_tracing};
use vigil::database::{PgStore, setup_database};
use vigil::handlers::{HandlerRegistry, load_handler_configs};
use vigil::messaging::AmqpBus;
use vigil::reactor::Reactor;
use vigil::state::StateStore;
use vigil::store::KeyValueStore;
use vigil::suppress::{SuppressionFilter, SuppressionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();
  let config = Config::from_env()?;

  let db_pool = setup_database(&config.database_url).await?;
  let store: Arc<dyn KeyValueStore> = Arc::new(PgStore::new(db_pool));

  let handler_configs = load_handler_configs(&config.reactor.handlers_path).await?;
  let handlers = HandlerRegistry::with_builtins(store.clone(), &config.results_domain).build(&handler_configs)?;
  info!("Loaded {} handlers", handlers.len());

  let states = Arc::new(StateStore::new(store.clone(), &config.state_domain));
  let suppressions = Arc::new(SuppressionStore::new(store, &config.suppress_domain));
  let filter = Arc::new(SuppressionFilter::new(suppressions, config.suppress.cache_ttl));

  let bus = AmqpBus::connect(&config.rabbitmq_url).await?;
  let reactor = Reactor::new(
    handlers,
    states,
    filter,
    Arc::new(bus),
    config.reactor.clone(),
    &config.results_topic,
  )?;
  reactor.run().await
}

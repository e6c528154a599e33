use std::sync::Arc;

use tracing::info;
use vigil::config::{Config, init_tracing};
use vigil::database::{PgStore, setup_database};
use vigil::handlers::ResultArchive;
use vigil::routes::{Api, routes};
use vigil::state::StateStore;
use vigil::store::KeyValueStore;
use vigil::suppress::SuppressionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();
  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url).await?;
  let store: Arc<dyn KeyValueStore> = Arc::new(PgStore::new(db_pool));

  let api = Api {
    states: Arc::new(StateStore::new(store.clone(), &config.state_domain)),
    archive: Arc::new(ResultArchive::new(store.clone(), &config.results_domain)),
    suppressions: Arc::new(SuppressionStore::new(store, &config.suppress_domain)),
  };

  info!("API listening on port {}", config.server_port);
  warp::serve(routes(api))
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}

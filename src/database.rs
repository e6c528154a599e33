use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres, QueryBuilder, Row};
use tokio_retry::Retry;
use tracing::{debug, info};

use crate::config::retry_strategy;
use crate::error::StoreError;
use crate::store::{Expectation, Filter, Item, KeyValueStore, Select, conditional_failure};

static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn setup_database(database_url: &str) -> anyhow::Result<Pool<Postgres>> {
  let pool = Retry::spawn(retry_strategy(), || {
    Pool::<Postgres>::connect(database_url)
  })
    .await?;

  MIGRATOR.run(&pool).await?;
  info!("Database migrations complete");
  Ok(pool)
}

/// `KeyValueStore` over a single Postgres table. Preconditions are evaluated
/// inside the guarded statement, so a zero row count means the expectation
/// did not hold.
#[derive(Clone)]
pub struct PgStore {
  pool: PgPool,
}

impl PgStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  async fn exists(&self, domain: &str, key: &str) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT 1 FROM kv_items WHERE domain = $1 AND key = $2")
      .bind(domain)
      .bind(key)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.is_some())
  }
}

#[async_trait]
impl KeyValueStore for PgStore {
  async fn get(&self, domain: &str, key: &str) -> Result<Option<Item>, StoreError> {
    let row = sqlx::query("SELECT attributes FROM kv_items WHERE domain = $1 AND key = $2")
      .bind(domain)
      .bind(key)
      .fetch_optional(&self.pool)
      .await?;
    match row {
      Some(row) => {
        let Json(item) = row.try_get::<Json<Item>, _>("attributes")?;
        Ok(Some(item))
      }
      None => Ok(None),
    }
  }

  async fn put(&self, domain: &str, key: &str, item: Item, expected: Expectation) -> Result<(), StoreError> {
    let affected = match &expected {
      Expectation::Unconditional => sqlx::query(
        "INSERT INTO kv_items (domain, key, attributes, updated_at) VALUES ($1, $2, $3, NOW())
         ON CONFLICT (domain, key) DO UPDATE SET attributes = EXCLUDED.attributes, updated_at = NOW()",
      )
        .bind(domain)
        .bind(key)
        .bind(Json(&item))
        .execute(&self.pool)
        .await?
        .rows_affected(),
      Expectation::Absent(field) => sqlx::query(
        "INSERT INTO kv_items (domain, key, attributes, updated_at) VALUES ($1, $2, $3, NOW())
         ON CONFLICT (domain, key) DO UPDATE SET attributes = EXCLUDED.attributes, updated_at = NOW()
         WHERE (kv_items.attributes -> $4) IS NULL",
      )
        .bind(domain)
        .bind(key)
        .bind(Json(&item))
        .bind(field)
        .execute(&self.pool)
        .await?
        .rows_affected(),
      Expectation::Equals(field, value) => sqlx::query(
        "UPDATE kv_items SET attributes = $3, updated_at = NOW()
         WHERE domain = $1 AND key = $2 AND (attributes ->> $4) = $5",
      )
        .bind(domain)
        .bind(key)
        .bind(Json(&item))
        .bind(field)
        .bind(value)
        .execute(&self.pool)
        .await?
        .rows_affected(),
    };

    if affected == 0 {
      debug!("Conditional put on {}/{} rejected ({:?})", domain, key, expected);
      return Err(conditional_failure(domain, key));
    }
    Ok(())
  }

  async fn delete(&self, domain: &str, key: &str, expected: Expectation) -> Result<(), StoreError> {
    match &expected {
      Expectation::Unconditional => {
        sqlx::query("DELETE FROM kv_items WHERE domain = $1 AND key = $2")
          .bind(domain)
          .bind(key)
          .execute(&self.pool)
          .await?;
        Ok(())
      }
      Expectation::Absent(field) => {
        let affected = sqlx::query("DELETE FROM kv_items WHERE domain = $1 AND key = $2 AND (attributes -> $3) IS NULL")
          .bind(domain)
          .bind(key)
          .bind(field)
          .execute(&self.pool)
          .await?
          .rows_affected();
        if affected == 0 && self.exists(domain, key).await? {
          return Err(conditional_failure(domain, key));
        }
        Ok(())
      }
      Expectation::Equals(field, value) => {
        let affected = sqlx::query("DELETE FROM kv_items WHERE domain = $1 AND key = $2 AND (attributes ->> $3) = $4")
          .bind(domain)
          .bind(key)
          .bind(field)
          .bind(value)
          .execute(&self.pool)
          .await?
          .rows_affected();
        if affected == 0 {
          return Err(conditional_failure(domain, key));
        }
        Ok(())
      }
    }
  }

  async fn select(&self, domain: &str, select: &Select) -> Result<Vec<(String, Item)>, StoreError> {
    let rows = select_query(domain, select).build().fetch_all(&self.pool).await?;
    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
      let key: String = row.try_get("key")?;
      let Json(item) = row.try_get::<Json<Item>, _>("attributes")?;
      items.push((key, item));
    }
    Ok(items)
  }
}

const INTEGER_PATTERN: &str = "'^-?[0-9]{1,18}$'";

/// Builds the SQL for a select. Ordering compares integer attributes
/// numerically, then by byte order, with missing attributes last and the key
/// as tie-breaker.
fn select_query<'a>(domain: &'a str, select: &'a Select) -> QueryBuilder<'a, Postgres> {
  let mut query = QueryBuilder::new("SELECT key, attributes FROM kv_items WHERE domain = ");
  query.push_bind(domain);

  for filter in &select.filters {
    match filter {
      Filter::Absent(field) => {
        query.push(" AND (attributes -> ").push_bind(field.as_str()).push(") IS NULL");
      }
      Filter::Present(field) => {
        query.push(" AND (attributes -> ").push_bind(field.as_str()).push(") IS NOT NULL");
      }
      Filter::Equals(field, value) => {
        query
          .push(" AND (attributes ->> ")
          .push_bind(field.as_str())
          .push(") = ")
          .push_bind(value.as_str());
      }
      Filter::AtLeast(field, bound) => {
        query
          .push(" AND CASE WHEN (attributes ->> ")
          .push_bind(field.as_str())
          .push(format!(") ~ {} THEN (attributes ->> ", INTEGER_PATTERN))
          .push_bind(field.as_str())
          .push(")::bigint >= ")
          .push_bind(*bound)
          .push(" ELSE false END");
      }
    }
  }

  match &select.order_by {
    Some(field) => {
      let direction = if select.descending { "DESC" } else { "ASC" };
      query
        .push(" ORDER BY CASE WHEN (attributes ->> ")
        .push_bind(field.as_str())
        .push(format!(") ~ {} THEN (attributes ->> ", INTEGER_PATTERN))
        .push_bind(field.as_str())
        .push(format!(")::bigint END {} NULLS LAST, (attributes ->> ", direction))
        .push_bind(field.as_str())
        .push(format!(") COLLATE \"C\" {} NULLS LAST, key", direction));
    }
    None => {
      query.push(" ORDER BY key");
    }
  }

  if let Some(limit) = select.limit {
    query.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
  }
  query
}

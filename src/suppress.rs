//! Suppression rules: storage plus the reactor's TTL-bounded match cache.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DataError, StoreError};
use crate::models::{SCHEMA_VERSION, Suppression};
use crate::store::{
  Expectation, Filter, Item, KeyValueStore, Select, encode_time, optional_time, required, required_i64, required_time,
};

impl Suppression {
  fn to_item(&self) -> Item {
    let mut item = Item::new();
    item.insert("regex".into(), self.regex.clone());
    item.insert("created".into(), encode_time(self.created));
    item.insert("expires".into(), encode_time(self.expires));
    if let Some(disabled) = self.disabled {
      item.insert("disabled".into(), encode_time(disabled));
    }
    item.insert("ipaddr".into(), self.ipaddr.to_string());
    item.insert("userid".into(), self.userid.clone());
    item.insert("comment".into(), self.comment.clone());
    item.insert("version".into(), self.version.to_string());
    item
  }

  fn from_item(rowkey: &str, item: &Item) -> Result<Self, DataError> {
    let ipaddr = required(item, "ipaddr")?;
    Ok(Self {
      rowkey: rowkey.parse().map_err(|_| DataError::invalid("rowkey", rowkey))?,
      regex: required(item, "regex")?.to_string(),
      created: required_time(item, "created")?,
      expires: required_time(item, "expires")?,
      disabled: optional_time(item, "disabled")?,
      ipaddr: ipaddr.parse().map_err(|_| DataError::invalid("ipaddr", ipaddr))?,
      userid: required(item, "userid")?.to_string(),
      comment: required(item, "comment")?.to_string(),
      version: if item.contains_key("version") { required_i64(item, "version")? } else { SCHEMA_VERSION },
    })
  }
}

pub struct SuppressionStore {
  store: Arc<dyn KeyValueStore>,
  domain: String,
}

impl SuppressionStore {
  pub fn new(store: Arc<dyn KeyValueStore>, domain: &str) -> Self {
    Self { store, domain: domain.to_string() }
  }

  pub async fn add(&self, suppression: &Suppression) -> Result<Uuid, StoreError> {
    let key = suppression.rowkey.to_string();
    self
      .store
      .put(&self.domain, &key, suppression.to_item(), Expectation::absent("created"))
      .await?;
    debug!("Added suppression {} to {}", key, self.domain);
    Ok(suppression.rowkey)
  }

  pub async fn get(&self, rowkey: Uuid) -> Result<Option<Suppression>, StoreError> {
    let key = rowkey.to_string();
    let Some(item) = self.store.get(&self.domain, &key).await? else {
      return Ok(None);
    };
    Suppression::from_item(&key, &item)
      .map(Some)
      .map_err(|e| StoreError::Decode { domain: self.domain.clone(), key, reason: e.to_string() })
  }

  /// Suppressions expiring after `expires_after` (all of them when `None`),
  /// ordered by creation time. Rows that fail to decode are skipped.
  pub async fn list(&self, expires_after: Option<DateTime<Utc>>, active_only: bool) -> Result<Vec<Suppression>, StoreError> {
    let mut select = Select::all().filter(Filter::Present("created".into())).order_by("created");
    if let Some(after) = expires_after {
      select = select.filter(Filter::AtLeast("expires".into(), after.timestamp_micros() + 1));
    }
    if active_only {
      select = select.filter(Filter::Absent("disabled".into()));
    }

    let rows = self.store.select(&self.domain, &select).await?;
    let mut suppressions = Vec::with_capacity(rows.len());
    for (key, item) in rows {
      match Suppression::from_item(&key, &item) {
        Ok(suppression) => suppressions.push(suppression),
        Err(e) => warn!("Skipping invalid suppression {}: {}", key, e),
      }
    }
    Ok(suppressions)
  }

  pub async fn active(&self, now: DateTime<Utc>) -> Result<Vec<Suppression>, StoreError> {
    self.list(Some(now), true).await
  }

  /// Replaces an existing suppression wholesale.
  pub async fn update(&self, suppression: &Suppression) -> Result<(), StoreError> {
    let key = suppression.rowkey.to_string();
    self
      .store
      .put(&self.domain, &key, suppression.to_item(), Expectation::equals("created", encode_time(suppression.created)))
      .await
  }

  /// Soft-deletes a suppression. A suppression that is already disabled keeps
  /// its original `disabled` timestamp.
  pub async fn deactivate(&self, rowkey: Uuid, now: DateTime<Utc>) -> Result<Option<Suppression>, StoreError> {
    let Some(mut suppression) = self.get(rowkey).await? else {
      return Ok(None);
    };
    if suppression.disabled.is_some() {
      debug!("Suppression {} already disabled", rowkey);
      return Ok(Some(suppression));
    }
    suppression.disabled = Some(now);
    match self
      .store
      .put(&self.domain, &rowkey.to_string(), suppression.to_item(), Expectation::absent("disabled"))
      .await
    {
      Ok(()) => {
        info!("Deactivated suppression {}", rowkey);
        Ok(Some(suppression))
      }
      Err(e) if e.is_conditional_failure() => self.get(rowkey).await,
      Err(e) => Err(e),
    }
  }

  pub async fn deactivate_all(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
    let mut deactivated = Vec::new();
    for suppression in self.active(now).await? {
      debug!("Deactivating {}", suppression.rowkey);
      self.deactivate(suppression.rowkey, now).await?;
      deactivated.push(suppression.rowkey);
    }
    Ok(deactivated)
  }

  /// Hard delete. `deactivate` is what operators normally want.
  pub async fn purge(&self, rowkey: Uuid) -> Result<(), StoreError> {
    self.store.delete(&self.domain, &rowkey.to_string(), Expectation::Unconditional).await
  }
}

#[derive(Default)]
struct Cache {
  expires_at: Option<DateTime<Utc>>,
  entries: Vec<(Suppression, Regex)>,
}

/// Matches messages against the active suppressions. The rule set is
/// reloaded lazily, at most once per `cache_ttl`, and replaced wholesale.
pub struct SuppressionFilter {
  store: Arc<SuppressionStore>,
  cache_ttl: Duration,
  cache: Mutex<Cache>,
}

impl SuppressionFilter {
  pub fn new(store: Arc<SuppressionStore>, cache_ttl: std::time::Duration) -> Self {
    Self {
      store,
      cache_ttl: Duration::from_std(cache_ttl).unwrap_or(Duration::seconds(60)),
      cache: Mutex::new(Cache::default()),
    }
  }

  pub fn store(&self) -> &Arc<SuppressionStore> {
    &self.store
  }

  /// Returns the first cached suppression whose regex matches `message`.
  pub async fn is_suppressed(&self, message: &str, now: DateTime<Utc>) -> Result<Option<Suppression>, StoreError> {
    let mut cache = self.cache.lock().await;
    if cache.expires_at.is_none_or(|at| at <= now) {
      self.reload(&mut cache, now).await?;
    }
    Ok(
      cache
        .entries
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map(|(suppression, _)| suppression.clone()),
    )
  }

  /// Forces a reload regardless of the TTL and returns the number of cached
  /// rules.
  pub async fn refresh(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
    let mut cache = self.cache.lock().await;
    self.reload(&mut cache, now).await?;
    Ok(cache.entries.len())
  }

  async fn reload(&self, cache: &mut Cache, now: DateTime<Utc>) -> Result<(), StoreError> {
    debug!("Refreshing suppression cache");
    let mut entries = Vec::new();
    for suppression in self.store.active(now).await? {
      match suppression.compile() {
        Ok(re) => entries.push((suppression, re)),
        Err(e) => warn!("Ignoring suppression {} with invalid regex: {}", suppression.rowkey, e),
      }
    }
    cache.entries = entries;
    cache.expires_at = Some(now + self.cache_ttl);
    Ok(())
  }
}

//! Lease-based lock used to elect a single active scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DataError, StoreError};
use crate::models::LockRecord;
use crate::store::{Expectation, Item, KeyValueStore, required, required_i64};

/// What happened on one acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
  /// No lock existed and we created it.
  Acquired,
  /// We already owned the lock and extended it.
  Renewed,
  /// The previous owner's lease had expired and we took it over.
  TakenOver,
  /// Someone else holds the lock, or won the race for it.
  Contended,
}

impl Acquisition {
  pub fn is_held(self) -> bool {
    !matches!(self, Acquisition::Contended)
  }
}

#[async_trait]
pub trait SchedulerLock: Send + Sync {
  async fn acquire(&self) -> Result<Acquisition, StoreError>;

  async fn release(&self) -> Result<(), StoreError>;
}

impl LockRecord {
  fn to_item(&self) -> Item {
    let mut item = Item::new();
    item.insert("owner".into(), self.owner.to_string());
    item.insert("expiry".into(), self.expiry.to_string());
    item.insert("timestamp".into(), self.timestamp.to_string());
    item
  }

  fn from_item(lock_name: &str, item: &Item) -> Result<Self, DataError> {
    let owner = required(item, "owner")?;
    Ok(Self {
      lock_name: lock_name.to_string(),
      owner: owner.parse().map_err(|_| DataError::invalid("owner", owner))?,
      expiry: required_i64(item, "expiry")?,
      timestamp: required_i64(item, "timestamp")?,
    })
  }
}

/// Lock record stored in a `KeyValueStore`; every write is a conditional put
/// on the `timestamp` attribute of the record that was read.
pub struct KvLock {
  store: Arc<dyn KeyValueStore>,
  domain: String,
  lock_name: String,
  duration_secs: i64,
  id: Uuid,
}

impl KvLock {
  pub fn new(store: Arc<dyn KeyValueStore>, domain: &str, lock_name: &str, duration_secs: i64) -> Self {
    let id = Uuid::new_v4();
    debug!("KvLock {} initialized with {}s duration", id, duration_secs);
    Self {
      store,
      domain: domain.to_string(),
      lock_name: lock_name.to_string(),
      duration_secs: duration_secs.max(1),
      id,
    }
  }

  pub fn id(&self) -> Uuid {
    self.id
  }

  pub async fn current(&self) -> Result<Option<LockRecord>, StoreError> {
    let Some(item) = self.store.get(&self.domain, &self.lock_name).await? else {
      return Ok(None);
    };
    LockRecord::from_item(&self.lock_name, &item)
      .map(Some)
      .map_err(|e| StoreError::Decode {
        domain: self.domain.clone(),
        key: self.lock_name.clone(),
        reason: e.to_string(),
      })
  }

  pub async fn acquire_at(&self, now: DateTime<Utc>) -> Result<Acquisition, StoreError> {
    let now = now.timestamp();
    debug!("Attempting to acquire lock {}:{}", self.domain, self.lock_name);

    let (expected, outcome) = match self.current().await? {
      None => (Expectation::absent("timestamp"), Acquisition::Acquired),
      Some(existing) if existing.owner == self.id => {
        debug!("Lock {} already owned, renewing", self.lock_name);
        (Expectation::equals("timestamp", existing.timestamp.to_string()), Acquisition::Renewed)
      }
      Some(existing) if existing.is_expired(now) => {
        info!("Lock {} held by {} expired, attempting takeover", self.lock_name, existing.owner);
        (Expectation::equals("timestamp", existing.timestamp.to_string()), Acquisition::TakenOver)
      }
      Some(existing) => {
        debug!("Lock {} still valid for {}, not taking over", self.lock_name, existing.owner);
        return Ok(Acquisition::Contended);
      }
    };

    let record = LockRecord {
      lock_name: self.lock_name.clone(),
      owner: self.id,
      expiry: now + self.duration_secs,
      timestamp: now,
    };
    match self.store.put(&self.domain, &self.lock_name, record.to_item(), expected).await {
      Ok(()) => {
        debug!("Lock {} {:?} until {}", self.lock_name, outcome, record.expiry);
        Ok(outcome)
      }
      Err(e) if e.is_conditional_failure() => {
        debug!("Lost the race for lock {}", self.lock_name);
        Ok(Acquisition::Contended)
      }
      Err(e) => Err(e),
    }
  }
}

#[async_trait]
impl SchedulerLock for KvLock {
  async fn acquire(&self) -> Result<Acquisition, StoreError> {
    self.acquire_at(Utc::now()).await
  }

  async fn release(&self) -> Result<(), StoreError> {
    let Some(existing) = self.current().await? else {
      return Ok(());
    };
    if existing.owner != self.id {
      debug!("Not releasing lock {} owned by {}", self.lock_name, existing.owner);
      return Ok(());
    }
    let expected = Expectation::equals("timestamp", existing.timestamp.to_string());
    match self.store.delete(&self.domain, &self.lock_name, expected).await {
      Ok(()) => {
        info!("Released lock {}", self.lock_name);
        Ok(())
      }
      Err(e) if e.is_conditional_failure() => Ok(()),
      Err(e) => Err(e),
    }
  }
}

/// Always acquired. Only for deployments running exactly one scheduler.
pub struct NoOpLock;

impl NoOpLock {
  pub fn new() -> Self {
    warn!("!!! Using NoOpLock");
    warn!("!!! Do not do this if you are planning to run more than one scheduler.");
    NoOpLock
  }
}

impl Default for NoOpLock {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl SchedulerLock for NoOpLock {
  async fn acquire(&self) -> Result<Acquisition, StoreError> {
    Ok(Acquisition::Acquired)
  }

  async fn release(&self) -> Result<(), StoreError> {
    Ok(())
  }
}

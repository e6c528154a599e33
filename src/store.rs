//! Key-value storage seam.
//!
//! Every durable record (locks, check state, suppressions, archived results)
//! is an `Item` of string attributes stored under a `(domain, key)` pair.
//! Writers coordinate only through conditional puts: a put carries an
//! `Expectation` about one attribute of the currently stored item and fails
//! with `StoreError::ConditionalCheckFailed` when it does not hold.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{DataError, StoreError};

pub type Item = BTreeMap<String, String>;

/// Precondition attached to a put or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
  Unconditional,
  /// The stored item is missing or lacks the attribute.
  Absent(String),
  /// The stored item has the attribute with exactly this value.
  Equals(String, String),
}

impl Expectation {
  pub fn absent(field: &str) -> Self {
    Expectation::Absent(field.to_string())
  }

  pub fn equals(field: &str, value: impl Into<String>) -> Self {
    Expectation::Equals(field.to_string(), value.into())
  }

  pub fn holds(&self, current: Option<&Item>) -> bool {
    match self {
      Expectation::Unconditional => true,
      Expectation::Absent(field) => current.is_none_or(|item| !item.contains_key(field)),
      Expectation::Equals(field, value) => current.and_then(|item| item.get(field)).is_some_and(|v| v == value),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
  Absent(String),
  Present(String),
  Equals(String, String),
  /// Numeric attribute greater than or equal to the bound.
  AtLeast(String, i64),
}

impl Filter {
  pub fn matches(&self, item: &Item) -> bool {
    match self {
      Filter::Absent(field) => !item.contains_key(field),
      Filter::Present(field) => item.contains_key(field),
      Filter::Equals(field, value) => item.get(field).is_some_and(|v| v == value),
      Filter::AtLeast(field, bound) => item
        .get(field)
        .and_then(|v| v.parse::<i64>().ok())
        .is_some_and(|v| v >= *bound),
    }
  }
}

/// A filtered, ordered scan over one domain.
#[derive(Debug, Clone, Default)]
pub struct Select {
  pub filters: Vec<Filter>,
  pub order_by: Option<String>,
  pub descending: bool,
  pub limit: Option<usize>,
}

impl Select {
  pub fn all() -> Self {
    Self::default()
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn order_by(mut self, field: &str) -> Self {
    self.order_by = Some(field.to_string());
    self
  }

  pub fn descending(mut self) -> Self {
    self.descending = true;
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Applies filters, ordering and limit to a set of rows. Attributes that
  /// parse as integers are compared numerically; rows missing the ordering
  /// attribute sort last.
  pub fn apply(&self, rows: impl IntoIterator<Item = (String, Item)>) -> Vec<(String, Item)> {
    let mut rows: Vec<(String, Item)> = rows
      .into_iter()
      .filter(|(_, item)| self.filters.iter().all(|f| f.matches(item)))
      .collect();

    match &self.order_by {
      Some(field) => rows.sort_by(|(ka, a), (kb, b)| {
        let ordering = match (a.get(field), b.get(field)) {
          (Some(x), Some(y)) => {
            let ord = compare_attribute(x, y);
            if self.descending { ord.reverse() } else { ord }
          }
          (Some(_), None) => Ordering::Less,
          (None, Some(_)) => Ordering::Greater,
          (None, None) => Ordering::Equal,
        };
        ordering.then_with(|| ka.cmp(kb))
      }),
      None => rows.sort_by(|(ka, _), (kb, _)| ka.cmp(kb)),
    }

    if let Some(limit) = self.limit {
      rows.truncate(limit);
    }
    rows
  }
}

fn compare_attribute(a: &str, b: &str) -> Ordering {
  match (a.parse::<i64>(), b.parse::<i64>()) {
    (Ok(x), Ok(y)) => x.cmp(&y),
    _ => a.cmp(b),
  }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
  /// Strongly consistent point read.
  async fn get(&self, domain: &str, key: &str) -> Result<Option<Item>, StoreError>;

  /// Replaces the whole item if `expected` holds.
  async fn put(&self, domain: &str, key: &str, item: Item, expected: Expectation) -> Result<(), StoreError>;

  /// Removes the item if `expected` holds. Deleting a missing item
  /// unconditionally is a no-op.
  async fn delete(&self, domain: &str, key: &str, expected: Expectation) -> Result<(), StoreError>;

  async fn select(&self, domain: &str, select: &Select) -> Result<Vec<(String, Item)>, StoreError>;
}

/// In-process store with the same conditional semantics as the Postgres
/// backend.
#[derive(Default)]
pub struct MemoryStore {
  items: Mutex<HashMap<String, BTreeMap<String, Item>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
  async fn get(&self, domain: &str, key: &str) -> Result<Option<Item>, StoreError> {
    let items = self.items.lock().await;
    Ok(items.get(domain).and_then(|d| d.get(key)).cloned())
  }

  async fn put(&self, domain: &str, key: &str, item: Item, expected: Expectation) -> Result<(), StoreError> {
    let mut items = self.items.lock().await;
    let rows = items.entry(domain.to_string()).or_default();
    if !expected.holds(rows.get(key)) {
      return Err(conditional_failure(domain, key));
    }
    rows.insert(key.to_string(), item);
    Ok(())
  }

  async fn delete(&self, domain: &str, key: &str, expected: Expectation) -> Result<(), StoreError> {
    let mut items = self.items.lock().await;
    let Some(rows) = items.get_mut(domain) else {
      return match expected {
        Expectation::Equals(..) => Err(conditional_failure(domain, key)),
        _ => Ok(()),
      };
    };
    if !expected.holds(rows.get(key)) {
      return Err(conditional_failure(domain, key));
    }
    rows.remove(key);
    Ok(())
  }

  async fn select(&self, domain: &str, select: &Select) -> Result<Vec<(String, Item)>, StoreError> {
    let items = self.items.lock().await;
    let rows = items
      .get(domain)
      .map(|d| d.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Vec<_>>())
      .unwrap_or_default();
    Ok(select.apply(rows))
  }
}

pub fn conditional_failure(domain: &str, key: &str) -> StoreError {
  StoreError::ConditionalCheckFailed { domain: domain.to_string(), key: key.to_string() }
}

// Timestamps are stored as unix microseconds so that ordering and equality
// checks on the string form are exact.

pub fn encode_time(t: DateTime<Utc>) -> String {
  t.timestamp_micros().to_string()
}

pub fn decode_time(field: &str, raw: &str) -> Result<DateTime<Utc>, DataError> {
  raw
    .trim()
    .parse::<i64>()
    .ok()
    .and_then(DateTime::from_timestamp_micros)
    .ok_or_else(|| DataError::invalid(field, raw))
}

pub fn required<'a>(item: &'a Item, field: &str) -> Result<&'a str, DataError> {
  item
    .get(field)
    .map(String::as_str)
    .ok_or_else(|| DataError::MissingField(field.to_string()))
}

pub fn required_i64(item: &Item, field: &str) -> Result<i64, DataError> {
  let raw = required(item, field)?;
  raw.trim().parse().map_err(|_| DataError::invalid(field, raw))
}

pub fn required_time(item: &Item, field: &str) -> Result<DateTime<Utc>, DataError> {
  decode_time(field, required(item, field)?)
}

pub fn optional_time(item: &Item, field: &str) -> Result<Option<DateTime<Utc>>, DataError> {
  item.get(field).map(|raw| decode_time(field, raw)).transpose()
}

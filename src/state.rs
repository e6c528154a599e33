//! Durable per-check state with optimistic concurrency.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{DataError, StoreError};
use crate::models::{CheckResult, SCHEMA_VERSION, StateRecord, StateType};
use crate::store::{Expectation, Item, KeyValueStore, Select, encode_time, required, required_i64, required_time};

/// A write lost to a writer that had already stored a newer state.
#[derive(Debug, Clone, PartialEq)]
pub struct OutOfDateState {
  pub current: StateRecord,
  pub previous: StateRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
  Saved(StateRecord),
  /// A newer state is already stored; ours was discarded.
  Stale(OutOfDateState),
  /// The stored record changed under us but is not newer than ours.
  Skipped,
}

impl StateRecord {
  fn to_item(&self) -> Item {
    let mut item = Item::new();
    item.insert("last_update".into(), encode_time(self.last_update));
    item.insert("last_state_change".into(), encode_time(self.last_state_change));
    item.insert("state".into(), self.state.code().to_string());
    item.insert("state_type".into(), self.state_type.code().to_string());
    item.insert("version".into(), self.version.to_string());
    item
  }

  fn from_item(id: &str, item: &Item) -> Result<Self, DataError> {
    Ok(Self {
      id: id.to_string(),
      last_update: required_time(item, "last_update")?,
      last_state_change: required_time(item, "last_state_change")?,
      state: required(item, "state")?.parse()?,
      state_type: required(item, "state_type")?.parse()?,
      version: item
        .get("version")
        .map(|_| required_i64(item, "version"))
        .transpose()?
        .unwrap_or(SCHEMA_VERSION),
    })
  }
}

/// Builds the record that `result` would store on top of `previous`.
///
/// `last_state_change` only moves when a HARD result lands on a different
/// state (or there is no previous record).
pub fn build_state(id: &str, result: &CheckResult, previous: Option<&StateRecord>) -> StateRecord {
  let last_state_change = match previous {
    Some(prev) if result.state_type == StateType::Soft || prev.state == result.state => prev.last_state_change,
    _ => result.timestamp,
  };
  StateRecord {
    id: id.to_string(),
    last_update: result.timestamp,
    last_state_change,
    state: result.state,
    state_type: result.state_type,
    version: SCHEMA_VERSION,
  }
}

pub struct StateStore {
  store: Arc<dyn KeyValueStore>,
  domain: String,
}

impl StateStore {
  pub fn new(store: Arc<dyn KeyValueStore>, domain: &str) -> Self {
    Self { store, domain: domain.to_string() }
  }

  /// Undecodable records are logged and treated as missing.
  pub async fn get(&self, id: &str) -> Result<Option<StateRecord>, StoreError> {
    debug!(check = id, "getting state");
    let Some(item) = self.store.get(&self.domain, id).await? else {
      debug!(check = id, "no state found");
      return Ok(None);
    };
    match StateRecord::from_item(id, &item) {
      Ok(record) => Ok(Some(record)),
      Err(e) => {
        error!(check = id, "Problem deserializing state: {} ({:?})", e, item);
        Ok(None)
      }
    }
  }

  pub async fn save(
    &self,
    id: &str,
    result: &CheckResult,
    previous: Option<&StateRecord>,
  ) -> Result<SaveOutcome, StoreError> {
    let new_state = build_state(id, result, previous);

    let expected = match previous {
      Some(prev) => {
        if prev.last_update > new_state.last_update {
          warn!(check = id, "found previous state that is newer than current state, discarding");
          return Ok(SaveOutcome::Stale(OutOfDateState { current: new_state, previous: prev.clone() }));
        }
        Expectation::equals("last_update", encode_time(prev.last_update))
      }
      None => Expectation::absent("last_update"),
    };

    debug!(check = id, "saving state {}/{}", new_state.state, new_state.state_type);
    match self.store.put(&self.domain, id, new_state.to_item(), expected).await {
      Ok(()) => Ok(SaveOutcome::Saved(new_state)),
      Err(e) if e.is_conditional_failure() => self.resolve_conflict(id, new_state).await,
      Err(e) => Err(e),
    }
  }

  async fn resolve_conflict(&self, id: &str, new_state: StateRecord) -> Result<SaveOutcome, StoreError> {
    let Some(item) = self.store.get(&self.domain, id).await? else {
      warn!(check = id, "state was removed concurrently, skipping");
      return Ok(SaveOutcome::Skipped);
    };
    match StateRecord::from_item(id, &item) {
      Ok(stored) if stored.last_update > new_state.last_update => {
        warn!(check = id, "state was concurrently updated to a newer record, discarding");
        Ok(SaveOutcome::Stale(OutOfDateState { current: new_state, previous: stored }))
      }
      Ok(_) => {
        warn!(check = id, "last_update was updated concurrently, skipping");
        Ok(SaveOutcome::Skipped)
      }
      Err(e) => self.replace_invalid(id, &item, new_state, e).await,
    }
  }

  /// Overwrites a stored record that no longer decodes, conditioned on its
  /// raw `last_update` so a concurrent valid write still wins.
  async fn replace_invalid(
    &self,
    id: &str,
    item: &Item,
    new_state: StateRecord,
    reason: DataError,
  ) -> Result<SaveOutcome, StoreError> {
    warn!(check = id, "replacing undecodable state: {}", reason);
    let expected = match item.get("last_update") {
      Some(raw) => Expectation::equals("last_update", raw.clone()),
      None => Expectation::absent("last_update"),
    };
    match self.store.put(&self.domain, id, new_state.to_item(), expected).await {
      Ok(()) => Ok(SaveOutcome::Saved(new_state)),
      Err(e) if e.is_conditional_failure() => Ok(SaveOutcome::Skipped),
      Err(e) => Err(e),
    }
  }

  pub async fn all(&self) -> Result<Vec<StateRecord>, StoreError> {
    let rows = self
      .store
      .select(&self.domain, &Select::all().order_by("last_update").descending())
      .await?;
    let mut states = Vec::with_capacity(rows.len());
    for (id, item) in rows {
      match StateRecord::from_item(&id, &item) {
        Ok(record) => states.push(record),
        Err(e) => warn!(check = %id, "Skipping invalid state: {}", e),
      }
    }
    Ok(states)
  }

  /// Administrative removal of a check's state.
  pub async fn purge(&self, id: &str) -> Result<(), StoreError> {
    self.store.delete(&self.domain, id, Expectation::Unconditional).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{State, TaskContext};
  use crate::store::MemoryStore;
  use chrono::{DateTime, Duration, Utc};

  fn result(state: State, state_type: StateType, timestamp: DateTime<Utc>) -> CheckResult {
    CheckResult {
      id: "n1:http".into(),
      timestamp,
      state,
      state_type,
      output: String::new(),
      task_context: TaskContext::new(),
    }
  }

  fn states() -> (Arc<MemoryStore>, StateStore) {
    let kv = Arc::new(MemoryStore::new());
    let store = StateStore::new(kv.clone(), "state");
    (kv, store)
  }

  fn saved(outcome: SaveOutcome) -> StateRecord {
    match outcome {
      SaveOutcome::Saved(record) => record,
      other => panic!("expected save, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn first_result_creates_record() {
    let (_, store) = states();
    let t0 = Utc::now();
    let record = saved(store.save("n1:http", &result(State::Ok, StateType::Hard, t0), None).await.unwrap());
    assert_eq!(record.last_state_change, t0);
    let fetched = store.get("n1:http").await.unwrap().unwrap();
    assert_eq!(fetched.state, State::Ok);
    assert_eq!(fetched.last_update.timestamp_micros(), t0.timestamp_micros());
  }

  #[tokio::test]
  async fn state_change_only_moves_on_hard_transitions() {
    let (_, store) = states();
    let t0 = Utc::now();
    let first = saved(store.save("n1:http", &result(State::Ok, StateType::Hard, t0), None).await.unwrap());

    let t1 = t0 + Duration::seconds(10);
    let soft = saved(
      store
        .save("n1:http", &result(State::Critical, StateType::Soft, t1), Some(&first))
        .await
        .unwrap(),
    );
    assert_eq!(soft.last_state_change, t0);

    // confirming the soft state keeps the original change time
    let t2 = t1 + Duration::seconds(10);
    let hard = saved(
      store
        .save("n1:http", &result(State::Critical, StateType::Hard, t2), Some(&soft))
        .await
        .unwrap(),
    );
    assert_eq!(hard.last_state_change, t0);

    let t3 = t2 + Duration::seconds(10);
    let changed = saved(
      store
        .save("n1:http", &result(State::Warning, StateType::Hard, t3), Some(&hard))
        .await
        .unwrap(),
    );
    assert_eq!(changed.last_state_change, t3);

    let t4 = t3 + Duration::seconds(10);
    let same = saved(
      store
        .save("n1:http", &result(State::Warning, StateType::Hard, t4), Some(&changed))
        .await
        .unwrap(),
    );
    assert_eq!(same.last_state_change, t3);
    assert_eq!(same.last_update, t4);
  }

  #[tokio::test]
  async fn older_write_is_rejected_without_mutating() {
    let (_, store) = states();
    let t0 = Utc::now();
    let newer = saved(store.save("n1:http", &result(State::Ok, StateType::Hard, t0), None).await.unwrap());

    let late = result(State::Critical, StateType::Hard, t0 - Duration::seconds(30));
    let outcome = store.save("n1:http", &late, Some(&newer)).await.unwrap();
    assert!(matches!(outcome, SaveOutcome::Stale(ref stale) if stale.previous == newer));
    assert_eq!(store.get("n1:http").await.unwrap().unwrap().state, State::Ok);
  }

  #[tokio::test]
  async fn concurrent_newer_writer_wins() {
    let (_, store) = states();
    let t0 = Utc::now();
    let base = saved(store.save("n1:http", &result(State::Ok, StateType::Hard, t0), None).await.unwrap());

    // two reactors read `base`; the one carrying the newer result lands first
    let newer = result(State::Critical, StateType::Hard, t0 + Duration::seconds(20));
    let older = result(State::Warning, StateType::Hard, t0 + Duration::seconds(10));
    saved(store.save("n1:http", &newer, Some(&base)).await.unwrap());

    let outcome = store.save("n1:http", &older, Some(&base)).await.unwrap();
    match outcome {
      SaveOutcome::Stale(stale) => {
        assert_eq!(stale.previous.state, State::Critical);
        assert_eq!(stale.current.state, State::Warning);
      }
      other => panic!("expected stale, got {:?}", other),
    }
    assert_eq!(store.get("n1:http").await.unwrap().unwrap().state, State::Critical);
  }

  #[tokio::test]
  async fn equal_aged_race_is_skipped() {
    let (_, store) = states();
    let t0 = Utc::now();
    let a = result(State::Ok, StateType::Hard, t0);
    let b = result(State::Warning, StateType::Hard, t0);
    saved(store.save("n1:http", &a, None).await.unwrap());
    assert_eq!(store.save("n1:http", &b, None).await.unwrap(), SaveOutcome::Skipped);
    assert_eq!(store.get("n1:http").await.unwrap().unwrap().state, State::Ok);
  }

  #[tokio::test]
  async fn undecodable_state_reads_as_missing() {
    let (kv, store) = states();
    let mut item = Item::new();
    item.insert("state".into(), "9".into());
    kv.put("state", "n1:http", item, Expectation::Unconditional).await.unwrap();
    assert!(store.get("n1:http").await.unwrap().is_none());
    assert!(store.all().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn undecodable_state_is_replaced_by_the_next_result() {
    let (kv, store) = states();
    let mut item = Item::new();
    item.insert("last_update".into(), encode_time(Utc::now() - Duration::hours(1)));
    item.insert("state".into(), "9".into());
    kv.put("state", "n1:http", item, Expectation::Unconditional).await.unwrap();

    let previous = store.get("n1:http").await.unwrap();
    assert!(previous.is_none());
    let outcome = store
      .save("n1:http", &result(State::Critical, StateType::Hard, Utc::now()), previous.as_ref())
      .await
      .unwrap();
    assert_eq!(saved(outcome).state, State::Critical);

    let stored = store.get("n1:http").await.unwrap().unwrap();
    assert_eq!(stored.state, State::Critical);
    assert_eq!(stored.state_type, StateType::Hard);
  }

  #[tokio::test]
  async fn purge_removes_the_record() {
    let (_, store) = states();
    store.save("n1:http", &result(State::Ok, StateType::Hard, Utc::now()), None).await.unwrap();
    assert_eq!(store.all().await.unwrap().len(), 1);
    store.purge("n1:http").await.unwrap();
    assert!(store.get("n1:http").await.unwrap().is_none());
  }
}

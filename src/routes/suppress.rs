use std::net::IpAddr;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::{Api, ApiError, with_api};
use crate::models::{SCHEMA_VERSION, Suppression};

#[derive(Debug, Deserialize)]
pub struct SuppressQuery {
  pub active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct NewSuppression {
  pub regex: String,
  pub expires: DateTime<Utc>,
  pub ipaddr: String,
  pub userid: String,
  #[serde(default)]
  pub comment: String,
}

#[derive(Debug, Deserialize)]
pub struct SuppressionEdit {
  pub regex: Option<String>,
  pub expires: Option<DateTime<Utc>>,
  pub comment: Option<String>,
}

/// A suppression as returned by the API, with its computed status.
#[derive(Serialize)]
struct SuppressionView<'a> {
  #[serde(flatten)]
  suppression: &'a Suppression,
  status: &'static str,
}

fn view(suppression: &Suppression, now: DateTime<Utc>) -> SuppressionView<'_> {
  SuppressionView { suppression, status: suppression.status(now) }
}

fn validate_regex(regex: &str) -> Result<(), Rejection> {
  Regex::new(regex).map(|_| ()).map_err(|e| ApiError::bad_request(format!("invalid regex: {}", e)))
}

fn validate_expires(expires: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), Rejection> {
  if expires <= now {
    return Err(ApiError::bad_request("expires must be in the future"));
  }
  Ok(())
}

pub fn suppress_routes(api: Api) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  let list = warp::path("suppress")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<SuppressQuery>())
    .and(with_api(api.clone()))
    .and_then(list_suppressions);

  let create = warp::path("suppress")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_api(api.clone()))
    .and_then(create_suppression);

  let detail = warp::path!("suppress" / Uuid);

  let get = detail
    .clone()
    .and(warp::get())
    .and(with_api(api.clone()))
    .and_then(get_suppression);

  let edit = detail
    .clone()
    .and(warp::put())
    .and(warp::body::json())
    .and(with_api(api.clone()))
    .and_then(edit_suppression);

  let deactivate = detail
    .and(warp::delete())
    .and(with_api(api))
    .and_then(deactivate_suppression);

  list.or(create).or(get).or(edit).or(deactivate)
}

async fn list_suppressions(query: SuppressQuery, api: Api) -> Result<impl Reply, Rejection> {
  let now = Utc::now();
  let active = query.active.unwrap_or(true);
  let suppressions = api
    .suppressions
    .list(active.then_some(now), active)
    .await
    .map_err(ApiError::internal)?;
  let views: Vec<SuppressionView> = suppressions.iter().map(|s| view(s, now)).collect();
  Ok(warp::reply::json(&views))
}

async fn create_suppression(body: NewSuppression, api: Api) -> Result<impl Reply, Rejection> {
  let now = Utc::now();
  validate_regex(&body.regex)?;
  validate_expires(body.expires, now)?;
  let ipaddr: IpAddr = body
    .ipaddr
    .parse()
    .map_err(|_| ApiError::bad_request(format!("invalid ipaddr: {}", body.ipaddr)))?;

  let suppression = Suppression {
    rowkey: Uuid::new_v4(),
    regex: body.regex,
    created: now,
    expires: body.expires,
    disabled: None,
    ipaddr,
    userid: body.userid,
    comment: body.comment,
    version: SCHEMA_VERSION,
  };
  api.suppressions.add(&suppression).await.map_err(ApiError::internal)?;
  info!("Added suppression {} for {}", suppression.rowkey, suppression.regex);
  Ok(warp::reply::with_status(warp::reply::json(&view(&suppression, now)), StatusCode::CREATED))
}

async fn load(api: &Api, key: Uuid) -> Result<Suppression, Rejection> {
  api
    .suppressions
    .get(key)
    .await
    .map_err(ApiError::internal)?
    .ok_or_else(|| ApiError::not_found(format!("suppression {} not found", key)))
}

async fn get_suppression(key: Uuid, api: Api) -> Result<impl Reply, Rejection> {
  let suppression = load(&api, key).await?;
  Ok(warp::reply::json(&view(&suppression, Utc::now())))
}

async fn edit_suppression(key: Uuid, edit: SuppressionEdit, api: Api) -> Result<impl Reply, Rejection> {
  let now = Utc::now();
  let mut suppression = load(&api, key).await?;
  if let Some(regex) = edit.regex {
    validate_regex(&regex)?;
    suppression.regex = regex;
  }
  if let Some(expires) = edit.expires {
    validate_expires(expires, now)?;
    suppression.expires = expires;
  }
  if let Some(comment) = edit.comment {
    suppression.comment = comment;
  }
  api.suppressions.update(&suppression).await.map_err(ApiError::internal)?;
  Ok(warp::reply::json(&view(&suppression, now)))
}

async fn deactivate_suppression(key: Uuid, api: Api) -> Result<impl Reply, Rejection> {
  let now = Utc::now();
  let suppression = api
    .suppressions
    .deactivate(key, now)
    .await
    .map_err(ApiError::internal)?
    .ok_or_else(|| ApiError::not_found(format!("suppression {} not found", key)))?;
  Ok(warp::reply::json(&view(&suppression, now)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::routes::{routes, tests::api};
  use chrono::Duration;
  use serde_json::{Value, json};

  fn new_body(regex: &str, expires: DateTime<Utc>) -> Value {
    json!({
      "regex": regex,
      "expires": expires,
      "ipaddr": "10.1.2.3",
      "userid": "ops",
      "comment": "deploy",
    })
  }

  async fn create(api: &Api, body: &Value) -> (StatusCode, Value) {
    let response = warp::test::request()
      .method("POST")
      .path("/suppress")
      .json(body)
      .reply(&routes(api.clone()))
      .await;
    let status = response.status();
    (status, serde_json::from_slice(response.body()).unwrap())
  }

  #[tokio::test]
  async fn create_then_list_and_fetch() {
    let api = api();
    let (status, created) = create(&api, &new_body("^www1:", Utc::now() + Duration::hours(1))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "active");
    let key = created["rowkey"].as_str().unwrap().to_string();

    let response = warp::test::request().path("/suppress").reply(&routes(api.clone())).await;
    let listed: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let response = warp::test::request()
      .path(&format!("/suppress/{}", key))
      .reply(&routes(api))
      .await;
    assert_eq!(response.status(), StatusCode::OK);
    let fetched: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(fetched["regex"], "^www1:");
    assert_eq!(fetched["ipaddr"], "10.1.2.3");
  }

  #[tokio::test]
  async fn invalid_suppressions_are_rejected() {
    let api = api();
    let (status, body) = create(&api, &new_body("^www1:", Utc::now() - Duration::minutes(1))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "expires must be in the future");

    let (status, _) = create(&api, &new_body("(unclosed", Utc::now() + Duration::hours(1))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut bad_ip = new_body("^db", Utc::now() + Duration::hours(1));
    bad_ip["ipaddr"] = json!("not-an-ip");
    let (status, _) = create(&api, &bad_ip).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn edit_updates_fields() {
    let api = api();
    let (_, created) = create(&api, &new_body("^www1:", Utc::now() + Duration::hours(1))).await;
    let key = created["rowkey"].as_str().unwrap().to_string();

    let response = warp::test::request()
      .method("PUT")
      .path(&format!("/suppress/{}", key))
      .json(&json!({"comment": "extended", "regex": "^www"}))
      .reply(&routes(api.clone()))
      .await;
    assert_eq!(response.status(), StatusCode::OK);

    let stored = api.suppressions.get(key.parse().unwrap()).await.unwrap().unwrap();
    assert_eq!(stored.comment, "extended");
    assert_eq!(stored.regex, "^www");
  }

  #[tokio::test]
  async fn delete_deactivates_and_hides_from_active_list() {
    let api = api();
    let (_, created) = create(&api, &new_body("^www1:", Utc::now() + Duration::hours(1))).await;
    let key = created["rowkey"].as_str().unwrap().to_string();

    let response = warp::test::request()
      .method("DELETE")
      .path(&format!("/suppress/{}", key))
      .reply(&routes(api.clone()))
      .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["status"], "disabled");

    let response = warp::test::request().path("/suppress?active=true").reply(&routes(api.clone())).await;
    let active: Value = serde_json::from_slice(response.body()).unwrap();
    assert!(active.as_array().unwrap().is_empty());

    let response = warp::test::request().path("/suppress?active=false").reply(&routes(api)).await;
    let all: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(all.as_array().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn missing_suppression_is_404() {
    let response = warp::test::request()
      .method("DELETE")
      .path(&format!("/suppress/{}", Uuid::new_v4()))
      .reply(&routes(api()))
      .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
  }
}

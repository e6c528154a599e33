use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;

use serde::Serialize;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::handlers::ResultArchive;
use crate::state::StateStore;
use crate::suppress::SuppressionStore;

pub mod results;
pub mod state;
pub mod suppress;

/// Stores the read API works against.
#[derive(Clone)]
pub struct Api {
  pub states: Arc<StateStore>,
  pub archive: Arc<ResultArchive>,
  pub suppressions: Arc<SuppressionStore>,
}

pub fn routes(api: Api) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  state::state_route(api.clone())
    .or(results::result_route(api.clone()))
    .or(suppress::suppress_routes(api))
    .recover(handle_rejection)
}

pub(crate) fn with_api(api: Api) -> impl Filter<Extract = (Api,), Error = Infallible> + Clone {
  warp::any().map(move || api.clone())
}

#[derive(Debug)]
pub enum ApiError {
  BadRequest(String),
  NotFound(String),
  Internal(String),
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
  pub fn bad_request(message: impl Into<String>) -> Rejection {
    warp::reject::custom(ApiError::BadRequest(message.into()))
  }

  pub fn not_found(message: impl Into<String>) -> Rejection {
    warp::reject::custom(ApiError::NotFound(message.into()))
  }

  pub fn internal(e: impl Display) -> Rejection {
    error!("API request failed: {}", e);
    warp::reject::custom(ApiError::Internal(e.to_string()))
  }
}

#[derive(Serialize)]
struct ErrorBody {
  error: String,
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (code, message) = if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not found".to_string())
  } else if let Some(api_error) = err.find::<ApiError>() {
    match api_error {
      ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
      ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
      ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()),
    }
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if err.find::<warp::reject::InvalidQuery>().is_some() {
    (StatusCode::BAD_REQUEST, "invalid query string".to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
  };
  Ok(warp::reply::with_status(warp::reply::json(&ErrorBody { error: message }), code))
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::store::MemoryStore;

  pub(crate) fn api() -> Api {
    let store = Arc::new(MemoryStore::new());
    Api {
      states: Arc::new(StateStore::new(store.clone(), "state")),
      archive: Arc::new(ResultArchive::new(store.clone(), "results")),
      suppressions: Arc::new(SuppressionStore::new(store, "suppress")),
    }
  }

  #[tokio::test]
  async fn unknown_paths_are_json_404s() {
    let response = warp::test::request().path("/nope").reply(&routes(api())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["error"], "not found");
  }
}

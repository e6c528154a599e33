use warp::{Filter, Rejection, Reply};

use super::{Api, ApiError, with_api};

pub fn state_route(api: Api) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path("state")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_api(api))
    .and_then(list_states)
}

async fn list_states(api: Api) -> Result<impl Reply, Rejection> {
  let states = api.states.all().await.map_err(ApiError::internal)?;
  Ok(warp::reply::json(&states))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{CheckResult, State, StateType, TaskContext};
  use crate::routes::{routes, tests::api};
  use chrono::Utc;
  use warp::http::StatusCode;

  #[tokio::test]
  async fn lists_states_with_names() {
    let api = api();
    let result = CheckResult {
      id: "www1:http".into(),
      timestamp: Utc::now(),
      state: State::Warning,
      state_type: StateType::Hard,
      output: String::new(),
      task_context: TaskContext::new(),
    };
    api.states.save("www1:http", &result, None).await.unwrap();

    let response = warp::test::request().path("/state").reply(&routes(api)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body[0]["id"], "www1:http");
    assert_eq!(body[0]["state"], 1);
    assert_eq!(body[0]["state_name"], "warning");
    assert_eq!(body[0]["state_type_name"], "hard");
  }
}

use serde::Deserialize;
use warp::{Filter, Rejection, Reply};

use super::{Api, ApiError, with_api};

const DEFAULT_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct ResultQuery {
  pub limit: Option<usize>,
}

pub fn result_route(api: Api) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path("result")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<ResultQuery>())
    .and(with_api(api))
    .and_then(list_results)
}

async fn list_results(query: ResultQuery, api: Api) -> Result<impl Reply, Rejection> {
  let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
  let results = api.archive.recent(limit).await.map_err(ApiError::internal)?;
  Ok(warp::reply::json(&results))
}

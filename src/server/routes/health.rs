use crate::db::QueryUtils;
use crate::prelude::*;
use crate::server::Data;
use http::{Response, StatusCode};
use hyper::Body;
use std::sync::Arc;
use warp::{Filter, Rejection};

pub fn routes(
    data: Arc<Data>,
) -> impl Filter<Extract = (Response<Body>,), Error = Rejection> + Clone {
    let data_filter = warp::any().map(move || data.clone());

    let health = warp::get()
        .and(warp::path!("health"))
        .map(endpoint_health);

    let ready = warp::get()
        .and(warp::path!("ready"))
        .and(data_filter)
        .map(endpoint_ready);

    health.or(ready).unify()
}

/// Liveness: constant time, never touches a dependency.
fn endpoint_health() -> Response<Body> {
    let body = serde_json::json!({
        "status": "ok",
        "revision": crate::GIT_REVISION,
    });
    json_response(StatusCode::OK, &body)
}

/// Readiness: a database round-trip plus the breaker panorama. Individual
/// upstream outages degrade the answer, they never fail it; only losing the
/// database is catastrophic.
fn endpoint_ready(data: Arc<Data>) -> Response<Body> {
    if let Err(err) = data.pipeline.db.exists("SELECT 1;", &[]) {
        error!("readiness check failed: database unreachable: {}", err);
        let body = serde_json::json!({ "status": "unavailable", "reason": "database" });
        return json_response(StatusCode::SERVICE_UNAVAILABLE, &body);
    }

    let degraded: Vec<String> = data
        .pipeline
        .federator
        .circuit_summary()
        .into_iter()
        .filter(|(_, state)| *state != "closed")
        .map(|(endpoint, _)| endpoint)
        .collect();

    let body = serde_json::json!({
        "status": if degraded.is_empty() { "ok" } else { "degraded" },
        "degraded": degraded,
    });
    json_response(StatusCode::OK, &body)
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    let mut resp = Response::new(Body::from(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::header::HeaderValue::from_static("application/json"),
    );
    resp
}

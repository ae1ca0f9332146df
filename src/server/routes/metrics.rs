use crate::prelude::*;
use crate::server::Data;
use http::{Response, StatusCode};
use hyper::Body;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use warp::{Filter, Rejection};

pub fn routes(
    data: Arc<Data>,
) -> impl Filter<Extract = (Response<Body>,), Error = Rejection> + Clone {
    let data_filter = warp::any().map(move || data.clone());

    warp::get()
        .and(warp::path!("metrics"))
        .and(data_filter)
        .map(|data| match endpoint_metrics(data) {
            Ok(resp) => resp,
            Err(err) => {
                error!("error while gathering metrics");
                crate::utils::report_failure(&err);

                let mut resp = Response::new(format!("Error: {err}\n").into());
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            }
        })
}

fn endpoint_metrics(_data: Arc<Data>) -> Fallible<Response<Body>> {
    let mut buffer = Vec::new();
    let families = prometheus::gather();
    TextEncoder::new().encode(&families, &mut buffer)?;
    Ok(Response::new(Body::from(buffer)))
}

use crate::errors::ErrorKind;
use crate::events::{Event, EventKind};
use crate::investigations::{ListFilters, Principal};
use crate::prelude::*;
use crate::server::api_types::ApiResponse;
use crate::server::auth::{auth_filter, stream_auth_filter};
use crate::server::{ApiReject, Data};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use http::Response;
use hyper::Body;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use warp::ws::Message;
use warp::{Filter, Rejection};

#[derive(Deserialize)]
pub struct SubmitRequest {
    query_text: String,
    session_id: Option<String>,
    data_source: Option<String>,
    filters: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    investigation_id: String,
    status: crate::investigations::Status,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    user_id: Option<String>,
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

/// The JSON API: submit, read, list, stats, cancel.
pub fn api(
    data: Arc<Data>,
) -> impl Filter<Extract = (Response<Body>,), Error = Rejection> + Clone {
    let data_filter = {
        let data = data.clone();
        warp::any().map(move || data.clone())
    };
    let auth = auth_filter(data.tokens.clone());

    let submit = warp::post()
        .and(warp::path!("investigations"))
        .and(warp::body::json())
        .and(data_filter.clone())
        .and(auth.clone())
        .map(endpoint_submit);

    let stats = warp::get()
        .and(warp::path!("investigations" / "stats"))
        .and(warp::query::<ListQuery>())
        .and(data_filter.clone())
        .and(auth.clone())
        .map(endpoint_stats);

    let get = warp::get()
        .and(warp::path!("investigations" / String))
        .and(data_filter.clone())
        .and(auth.clone())
        .map(endpoint_get);

    let list = warp::get()
        .and(warp::path!("investigations"))
        .and(warp::query::<ListQuery>())
        .and(data_filter.clone())
        .and(auth.clone())
        .map(endpoint_list);

    let cancel = warp::post()
        .and(warp::path!("investigations" / String / "cancel"))
        .and(data_filter)
        .and(auth)
        .map(endpoint_cancel);

    // `stats` before `get` so the literal segment wins over the id capture.
    submit
        .or(stats)
        .unify()
        .or(get)
        .unify()
        .or(list)
        .unify()
        .or(cancel)
        .unify()
        .map(handle_results)
}

fn endpoint_submit(
    request: SubmitRequest,
    data: Arc<Data>,
    principal: Principal,
) -> Fallible<Response<Body>> {
    if let Err(kind) = data.check_submission_gate(&principal) {
        return ApiResponse::error(&kind).into_response();
    }

    match data.pipeline.submit_query(
        &principal,
        &request.query_text,
        request.session_id,
        request.data_source,
        request.filters,
    ) {
        Ok(investigation) => ApiResponse::Success {
            result: SubmitResponse {
                investigation_id: investigation.id,
                status: investigation.status,
                created_at: investigation.created_at,
            },
        }
        .into_response(),
        Err(ErrorKind::PoolExhausted(_)) => ApiResponse::<()>::SlowDown.into_response(),
        Err(kind) => ApiResponse::error(&kind).into_response(),
    }
}

fn endpoint_get(id: String, data: Arc<Data>, principal: Principal) -> Fallible<Response<Body>> {
    match data.pipeline.store.get(&principal, &id) {
        Ok(investigation) => ApiResponse::Success {
            result: investigation,
        }
        .into_response(),
        Err(kind) => ApiResponse::error(&kind).into_response(),
    }
}

fn endpoint_list(
    query: ListQuery,
    data: Arc<Data>,
    principal: Principal,
) -> Fallible<Response<Body>> {
    let status: Option<crate::investigations::Status> =
        match query.status.as_deref().map(str::parse).transpose() {
        Ok(status) => status,
        Err(_) => {
            return ApiResponse::error(&ErrorKind::Validation(
                "unknown status filter".into(),
            ))
            .into_response();
        }
    };

    let filters = ListFilters {
        user_id: query.user_id,
        status,
        limit: query.limit.unwrap_or(50).clamp(1, 200),
        offset: query.offset.unwrap_or(0),
    };

    match data.pipeline.store.list(&principal, &filters) {
        Ok(investigations) => ApiResponse::Success {
            result: investigations,
        }
        .into_response(),
        Err(err) => {
            ApiResponse::error(&ErrorKind::Internal(err.to_string())).into_response()
        }
    }
}

fn endpoint_stats(
    query: ListQuery,
    data: Arc<Data>,
    principal: Principal,
) -> Fallible<Response<Body>> {
    match data
        .pipeline
        .store
        .stats(&principal, query.user_id.as_deref())
    {
        Ok(stats) => ApiResponse::Success { result: stats }.into_response(),
        Err(err) => {
            ApiResponse::error(&ErrorKind::Internal(err.to_string())).into_response()
        }
    }
}

fn endpoint_cancel(
    id: String,
    data: Arc<Data>,
    principal: Principal,
) -> Fallible<Response<Body>> {
    match data.pipeline.orchestrator.cancel(&principal, &id) {
        Ok(investigation) => ApiResponse::Success {
            result: investigation,
        }
        .into_response(),
        Err(kind) => ApiResponse::error(&kind).into_response(),
    }
}

fn handle_results(resp: Fallible<Response<Body>>) -> Response<Body> {
    match resp {
        Ok(resp) => resp,
        Err(err) => {
            crate::utils::report_failure(&err);
            ApiResponse::error(&ErrorKind::Internal(err.to_string()))
                .into_response()
                .unwrap()
        }
    }
}

/// The streaming endpoints: Server-Sent Events and the WebSocket mirror.
pub fn stream(
    data: Arc<Data>,
) -> impl Filter<Extract = (Box<dyn warp::Reply>,), Error = Rejection> + Clone {
    let data_filter = {
        let data = data.clone();
        warp::any().map(move || data.clone())
    };
    let auth = stream_auth_filter(data.tokens.clone());

    let sse = warp::get()
        .and(warp::path!("investigations" / String / "stream"))
        .and(data_filter.clone())
        .and(auth.clone())
        .and_then(endpoint_stream);

    let ws = warp::path!("investigations" / String / "ws")
        .and(warp::ws())
        .and(data_filter)
        .and(auth)
        .and_then(endpoint_ws);

    sse.or(ws).unify()
}

/// The bus receiver filtered down to one investigation's topic, ending after
/// its terminal event. Lagged subscribers count dropped events and carry on;
/// terminal state is always recoverable from the store.
fn topic_stream(
    bus: Arc<crate::events::EventBus>,
    replay: Vec<Event>,
    rx: tokio::sync::broadcast::Receiver<Event>,
    investigation_id: String,
) -> impl futures_util::Stream<Item = Event> + Send + 'static {
    let live = BroadcastStream::new(rx).filter_map(move |item| {
        let bus = bus.clone();
        let id = investigation_id.clone();
        async move {
            match item {
                Ok(event) if event.investigation_id == id => Some(event),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(count)) => {
                    bus.record_dropped(count);
                    None
                }
            }
        }
    });

    futures_util::stream::iter(replay)
        .chain(live)
        .scan(false, |finished, event| {
            let emit = if *finished {
                None
            } else {
                *finished = matches!(
                    event.kind,
                    EventKind::Completed | EventKind::Failed | EventKind::Cancelled
                );
                Some(event)
            };
            futures_util::future::ready(emit)
        })
}

/// Subscription with access control. When the investigation is already
/// terminal and the bus history no longer covers it, a synthetic terminal
/// event is replayed from the durable record so the stream still closes
/// with the final state.
fn subscribe_checked(
    data: &Arc<Data>,
    principal: &Principal,
    id: &str,
) -> Result<(Vec<Event>, tokio::sync::broadcast::Receiver<Event>), Rejection> {
    use crate::investigations::Status;

    let investigation = data
        .pipeline
        .store
        .get(principal, id)
        .map_err(|kind| warp::reject::custom(ApiReject(kind)))?;

    let (mut replay, rx) = data.pipeline.bus.subscribe(id);
    let already_terminal = replay.iter().any(|event| {
        matches!(
            event.kind,
            EventKind::Completed | EventKind::Failed | EventKind::Cancelled
        )
    });
    if !already_terminal {
        let synthetic = match investigation.status {
            Status::Completed => Some(Event::completed(&investigation)),
            Status::Failed => Some(Event::failed(&investigation)),
            Status::Cancelled => Some(Event::cancelled(&investigation.id)),
            Status::Pending | Status::Processing => None,
        };
        if let Some(event) = synthetic {
            replay.push(event);
        }
    }

    Ok((replay, rx))
}

async fn endpoint_stream(
    id: String,
    data: Arc<Data>,
    principal: Principal,
) -> Result<Box<dyn warp::Reply>, Rejection> {
    let (replay, rx) = subscribe_checked(&data, &principal, &id)?;
    let events = topic_stream(data.pipeline.bus.clone(), replay, rx, id).map(|event| {
        let sse = warp::sse::Event::default().event(event.kind.to_str());
        Ok::<_, Infallible>(match sse.json_data(&event) {
            Ok(sse) => sse,
            Err(_) => warp::sse::Event::default().comment("serialization error"),
        })
    });

    Ok(Box::new(warp::sse::reply(
        warp::sse::keep_alive().stream(events),
    )))
}

async fn endpoint_ws(
    id: String,
    ws: warp::ws::Ws,
    data: Arc<Data>,
    principal: Principal,
) -> Result<Box<dyn warp::Reply>, Rejection> {
    let (replay, rx) = subscribe_checked(&data, &principal, &id)?;

    Ok(Box::new(ws.on_upgrade(move |socket| {
        handle_ws(socket, id, data, principal, replay, rx)
    })))
}

async fn handle_ws(
    socket: warp::ws::WebSocket,
    id: String,
    data: Arc<Data>,
    principal: Principal,
    replay: Vec<Event>,
    rx: tokio::sync::broadcast::Receiver<Event>,
) {
    let (mut to_client, mut from_client) = socket.split();
    let mut events = Box::pin(topic_stream(
        data.pipeline.bus.clone(),
        replay,
        rx,
        id.clone(),
    ));

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    let serialized = match serde_json::to_string(&event) {
                        Ok(serialized) => serialized,
                        Err(err) => {
                            warn!("[{}] ws serialization failed: {}", id, err);
                            continue;
                        }
                    };
                    if to_client.send(Message::text(serialized)).await.is_err() {
                        break;
                    }
                    if matches!(
                        event.kind,
                        EventKind::Completed | EventKind::Failed | EventKind::Cancelled
                    ) {
                        break;
                    }
                }
                None => break,
            },
            incoming = from_client.next() => match incoming {
                Some(Ok(message)) => {
                    if let Ok(text) = message.to_str() {
                        handle_ws_frame(&data, &principal, &id, text);
                    }
                    if message.is_close() {
                        break;
                    }
                }
                Some(Err(_)) | None => break,
            },
        }
    }

    let _ = to_client.send(Message::close()).await;
}

/// Client-initiated frames; only `{"action": "cancel"}` is recognized.
fn handle_ws_frame(data: &Arc<Data>, principal: &Principal, id: &str, frame: &str) {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(frame) else {
        return;
    };
    if parsed["action"].as_str() == Some("cancel") {
        if let Err(kind) = data.pipeline.orchestrator.cancel(principal, id) {
            warn!("[{}] ws cancel rejected: {}", id, kind);
        }
    }
}

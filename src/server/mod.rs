pub mod api_types;
mod auth;
pub mod metrics;
mod routes;

use crate::config::{Config, Secrets};
use crate::errors::ErrorKind;
use crate::federation::ratelimit::TokenBucket;
use crate::investigations::Principal;
use crate::orchestrator::Pipeline;
use crate::prelude::*;
use crate::scheduler::Scheduler;
use crate::server::api_types::ApiResponse;
use http::Response;
use hyper::Body;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use warp::{Filter, Rejection};

/// How often the maintenance pass reaps idle workers.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

pub struct Data {
    pub pipeline: Arc<Pipeline>,
    pub tokens: Arc<auth::Tokens>,
    gates: Mutex<HashMap<String, UserGate>>,
}

/// Minute/hour/day buckets per user; a submission must clear all three.
struct UserGate {
    minute: TokenBucket,
    hour: TokenBucket,
    day: TokenBucket,
}

impl UserGate {
    fn new(limits: &crate::config::RateLimitConfig, now: Instant) -> Self {
        UserGate {
            minute: TokenBucket::new(limits.per_minute, now),
            hour: TokenBucket::with_window(limits.per_hour, Duration::from_secs(3600), now),
            day: TokenBucket::with_window(limits.per_day, Duration::from_secs(86400), now),
        }
    }

    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.minute.try_acquire(now)?;
        self.hour.try_acquire(now)?;
        self.day.try_acquire(now)
    }
}

impl Data {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let tokens = Arc::new(auth::Tokens::from_config(&pipeline.config));
        Data {
            pipeline,
            tokens,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Per-user submission gate. Service principals (the scheduler uses the
    /// same entry points) are not throttled.
    fn check_submission_gate(&self, principal: &Principal) -> Result<(), ErrorKind> {
        if let Principal::Service(_) = principal {
            return Ok(());
        }

        let now = Instant::now();
        let limits = &self.pipeline.config.server.rate_limit;
        let mut gates = self.gates.lock().unwrap();
        let gate = gates
            .entry(principal.user_id().to_string())
            .or_insert_with(|| UserGate::new(limits, now));

        gate.try_acquire(now).map_err(|wait| ErrorKind::RateLimited {
            retry_after_secs: wait.as_secs().max(1),
        })
    }
}

/// Rejection wrapper so async handlers can surface taxonomy errors through
/// warp's recover machinery.
#[derive(Debug)]
pub struct ApiReject(pub ErrorKind);

impl warp::reject::Reject for ApiReject {}

async fn handle_rejection(err: Rejection) -> Result<Response<Body>, Rejection> {
    let kind = if let Some(ApiReject(kind)) = err.find::<ApiReject>() {
        kind.clone()
    } else if err.find::<auth::Forbidden>().is_some() {
        ErrorKind::Unauthorized
    } else if err.is_not_found() {
        ErrorKind::NotFound("no such endpoint".into())
    } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        ErrorKind::Validation("malformed request body".into())
    } else {
        return Err(err);
    };

    ApiResponse::error(&kind)
        .into_response()
        .map_err(|_| warp::reject::reject())
}

/// Boots the full service: pipeline, scheduler, maintenance loop, HTTP
/// surface. Blocks until ctrl-c; a second ctrl-c aborts immediately.
pub fn run(config: Config, secrets: Secrets) -> Fallible<()> {
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;

    let pipeline = Arc::new(Pipeline::new(config.clone(), secrets)?);
    let data = Arc::new(Data::new(pipeline.clone()));

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            if shutdown.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
            info!("shutdown requested, draining (ctrl-c again to abort)");
        })?;
    }

    let mut background = Vec::new();
    if config.scheduler.enabled {
        let scheduler = Scheduler::new(pipeline.clone(), shutdown.clone());
        scheduler.seed_default_jobs()?;
        background.push(
            std::thread::Builder::new()
                .name("scheduler".into())
                .spawn(move || scheduler.worker_loop())?,
        );
    } else {
        info!("scheduler disabled by configuration");
    }

    {
        let pipeline = pipeline.clone();
        let shutdown = shutdown.clone();
        let idle_ttl = Duration::from_secs(config.workers.idle_ttl_secs);
        background.push(
            std::thread::Builder::new()
                .name("maintenance".into())
                .spawn(move || {
                    while !shutdown.load(Ordering::SeqCst) {
                        pipeline.pool.reap_idle(idle_ttl);
                        std::thread::sleep(MAINTENANCE_INTERVAL);
                    }
                })?,
        );
    }

    let api = routes::investigations::api(data.clone());
    let stream = routes::investigations::stream(data.clone());
    let health = routes::health::routes(data.clone());
    let metrics = routes::metrics::routes(data);
    let all = api
        .or(stream)
        .or(health)
        .or(metrics)
        .recover(handle_rejection);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let shutdown = shutdown.clone();
        let (bound, serving) =
            warp::serve(all).bind_with_graceful_shutdown(addr, async move {
                while !shutdown.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            });
        info!("listening on http://{}", bound);
        serving.await;
    });

    info!("http server stopped, waiting for background threads");
    for handle in background {
        let _ = handle.join();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Data;
    use crate::errors::ErrorKind;
    use crate::investigations::Principal;
    use crate::orchestrator::Pipeline;
    use std::sync::Arc;

    #[test]
    fn test_submission_gate_throttles_users_not_services() {
        let pipeline = Arc::new(Pipeline::test().unwrap());
        let data = Data::new(pipeline.clone());
        let per_minute = pipeline.config.server.rate_limit.per_minute;

        let maria = Principal::User("maria".into());
        for _ in 0..per_minute {
            data.check_submission_gate(&maria).unwrap();
        }
        assert!(matches!(
            data.check_submission_gate(&maria),
            Err(ErrorKind::RateLimited { .. })
        ));

        // Another user has an independent bucket.
        let joao = Principal::User("joao".into());
        data.check_submission_gate(&joao).unwrap();

        let scheduler = Principal::Service("scheduler".into());
        for _ in 0..per_minute * 2 {
            data.check_submission_gate(&scheduler).unwrap();
        }
    }
}

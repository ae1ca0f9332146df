use crate::config::Config;
use crate::errors::ErrorKind;
use crate::prelude::*;
use crate::server::metrics::Metrics;
use crate::workers::{
    registry, ResponseStatus, Worker, WorkerContext, WorkerMessage, WorkerPool, WorkerResponse,
    WorkerState, ACTION_COMPENSATE,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bounded retry for a `process` call that errors out before the reflection
/// loop even gets a usable response.
const PROCESS_RETRIES: u32 = 2;
const RETRY_BASE: Duration = Duration::from_millis(200);

/// Drives worker calls through the idle → thinking → acting lifecycle and
/// the quality-driven reflection loop.
pub struct WorkerRuntime {
    pool: Arc<WorkerPool>,
    config: Config,
    metrics: Metrics,
}

impl WorkerRuntime {
    pub fn new(pool: Arc<WorkerPool>, config: Config, metrics: Metrics) -> Self {
        WorkerRuntime {
            pool,
            config,
            metrics,
        }
    }

    pub fn invoke(
        &self,
        msg: WorkerMessage,
        ctx: &WorkerContext,
    ) -> Result<WorkerResponse, ErrorKind> {
        let start = Instant::now();
        let kind = msg.recipient;

        let mut worker = self.pool.acquire(kind, ctx.deadline)?;
        let result = self.drive(&mut *worker, msg, ctx);
        drop(worker);

        self.metrics.record_request("worker", kind.to_str(), start);
        if let Err(err) = &result {
            self.metrics.record_error("worker", err.label());
        }
        result
    }

    /// The reflection loop proper, separated from pool plumbing so tests can
    /// drive it with scripted workers.
    pub(crate) fn drive(
        &self,
        worker: &mut dyn Worker,
        mut msg: WorkerMessage,
        ctx: &WorkerContext,
    ) -> Result<WorkerResponse, ErrorKind> {
        let descriptor = registry::descriptor(msg.recipient)
            .ok_or_else(|| ErrorKind::Validation(format!("unknown worker kind {}", msg.recipient)))?;
        let threshold = descriptor.quality_threshold(&self.config);
        let max_iterations = descriptor.max_reflection_iterations(&self.config);

        let mut state = WorkerState::Idle;
        self.transition(&msg, &mut state, WorkerState::Thinking);

        // Saga compensations are a single call; quality does not apply.
        if msg.action == ACTION_COMPENSATE {
            self.transition(&msg, &mut state, WorkerState::Acting);
            let response = self.process_once(worker, &msg, ctx);
            let next = match &response {
                Ok(_) => WorkerState::Completed,
                Err(_) => WorkerState::Error,
            };
            self.transition(&msg, &mut state, next);
            return response;
        }

        let mut iterations = 0u32;
        let response = loop {
            self.transition(&msg, &mut state, WorkerState::Acting);
            let mut response = self.process_with_retry(worker, &msg, ctx)?;
            iterations += 1;

            if response.status == ResponseStatus::Failed {
                break response;
            }
            if response.quality_score >= threshold {
                break response;
            }
            if iterations > max_iterations {
                // Reflection exhausted below the threshold: the step degrades
                // and the investigation's confidence reflects the shortfall.
                response.status = ResponseStatus::Degraded;
                response.error = Some(
                    ErrorKind::QualityBelowThreshold {
                        score: response.quality_score,
                        threshold,
                        iterations: iterations - 1,
                    }
                    .to_string(),
                );
                break response;
            }

            self.transition(&msg, &mut state, WorkerState::Thinking);
            let reflection = match worker.reflect(&response, &msg, ctx) {
                Ok(reflection) => reflection,
                Err(err) => {
                    warn!(
                        "[{}] {} reflect failed, keeping current response: {}",
                        msg.correlation_id, msg.recipient, err
                    );
                    response.status = ResponseStatus::Degraded;
                    break response;
                }
            };

            match reflection.improvement_hint {
                Some(hint) => {
                    debug!(
                        "[{}] {} reflecting (quality {:.2} < {:.2}): {}",
                        msg.correlation_id, msg.recipient, response.quality_score, threshold, hint
                    );
                    msg.push_reflection_hint(&hint);
                }
                None => {
                    // The worker sees no way to improve.
                    response.status = ResponseStatus::Degraded;
                    break response;
                }
            }
        };

        self.metrics.record_reflection_iterations(iterations);
        let next = match response.status {
            ResponseStatus::Failed => WorkerState::Error,
            _ => WorkerState::Completed,
        };
        self.transition(&msg, &mut state, next);
        Ok(response)
    }

    fn process_with_retry(
        &self,
        worker: &mut dyn Worker,
        msg: &WorkerMessage,
        ctx: &WorkerContext,
    ) -> Result<WorkerResponse, ErrorKind> {
        let mut attempt = 0u32;
        loop {
            ctx.cancel.check()?;
            if Instant::now() >= ctx.deadline {
                return Err(ErrorKind::Timeout(format!("worker {}", msg.recipient)));
            }

            let error = match self.process_once(worker, msg, ctx) {
                Ok(response) => return Ok(response),
                Err(err @ (ErrorKind::Cancelled | ErrorKind::Timeout(_))) => return Err(err),
                Err(err) => err,
            };

            attempt += 1;
            if attempt > PROCESS_RETRIES {
                return Ok(WorkerResponse::failed(
                    &msg.correlation_id,
                    error.to_string(),
                ));
            }

            let delay = crate::utils::backoff_delay(RETRY_BASE, attempt - 1, Duration::from_secs(5));
            if Instant::now() + delay >= ctx.deadline {
                return Ok(WorkerResponse::failed(
                    &msg.correlation_id,
                    error.to_string(),
                ));
            }
            std::thread::sleep(delay);
        }
    }

    fn process_once(
        &self,
        worker: &mut dyn Worker,
        msg: &WorkerMessage,
        ctx: &WorkerContext,
    ) -> Result<WorkerResponse, ErrorKind> {
        // A panicking worker must not take the executor thread down with it.
        catch_unwind(AssertUnwindSafe(|| worker.process(msg, ctx))).unwrap_or_else(|panic| {
            crate::utils::report_panic(&*panic);
            Err(ErrorKind::Internal(format!(
                "worker {} panicked",
                msg.recipient
            )))
        })
    }

    /// State transitions are the single place call lifecycle gets logged.
    fn transition(&self, msg: &WorkerMessage, state: &mut WorkerState, next: WorkerState) {
        debug!(
            "[{}] {} {} -> {}",
            msg.correlation_id, msg.recipient, state, next
        );
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerRuntime;
    use crate::config::Config;
    use crate::errors::ErrorKind;
    use crate::server::metrics::Metrics;
    use crate::workers::{
        test_context, Reflection, ResponseMetrics, ResponseStatus, Worker, WorkerContext,
        WorkerKind, WorkerMessage, WorkerPool, WorkerResponse,
    };
    use serde_json::json;
    use std::time::{Duration, Instant};

    /// Scripted worker: returns the given quality scores in order.
    struct Scripted {
        scores: Vec<f64>,
        process_calls: usize,
        reflect_calls: usize,
        panic_first: bool,
    }

    impl Scripted {
        fn new(scores: &[f64]) -> Self {
            Scripted {
                scores: scores.to_vec(),
                process_calls: 0,
                reflect_calls: 0,
                panic_first: false,
            }
        }
    }

    impl Worker for Scripted {
        fn kind(&self) -> WorkerKind {
            WorkerKind::AnomalyDetector
        }

        fn process(
            &mut self,
            msg: &WorkerMessage,
            _ctx: &WorkerContext,
        ) -> Result<WorkerResponse, ErrorKind> {
            if self.panic_first && self.process_calls == 0 {
                self.process_calls += 1;
                panic!("scripted panic");
            }
            let score = self.scores[self.process_calls.min(self.scores.len() - 1)];
            self.process_calls += 1;
            Ok(WorkerResponse {
                correlation_id: msg.correlation_id.clone(),
                status: ResponseStatus::Ok,
                findings: Vec::new(),
                metrics: ResponseMetrics::default(),
                error: None,
                quality_score: score,
            })
        }

        fn reflect(
            &mut self,
            response: &WorkerResponse,
            _msg: &WorkerMessage,
            _ctx: &WorkerContext,
        ) -> crate::prelude::Fallible<Reflection> {
            self.reflect_calls += 1;
            Ok(Reflection {
                quality_score: response.quality_score,
                improvement_hint: Some("try harder".into()),
            })
        }
    }

    fn runtime() -> WorkerRuntime {
        WorkerRuntime::new(
            WorkerPool::new(Metrics::shared()),
            Config::default(),
            Metrics::shared(),
        )
    }

    fn message() -> WorkerMessage {
        WorkerMessage::process(
            "corr-rt",
            "orchestrator",
            WorkerKind::AnomalyDetector,
            json!({}),
        )
    }

    #[test]
    fn test_reflection_stops_at_threshold() {
        // Threshold 0.8: quality 0.6, 0.7, 0.85 takes exactly three process
        // calls with a reflect before the second and third.
        let mut worker = Scripted::new(&[0.6, 0.7, 0.85]);
        let ctx = test_context(Instant::now() + Duration::from_secs(5));

        let response = runtime().drive(&mut worker, message(), &ctx).unwrap();
        assert_eq!(worker.process_calls, 3);
        assert_eq!(worker.reflect_calls, 2);
        assert_eq!(response.quality_score, 0.85);
        assert_eq!(response.status, ResponseStatus::Ok);
    }

    #[test]
    fn test_reflection_is_bounded() {
        // Never reaches the threshold: max_reflection_iterations=3 allows at
        // most four process calls, then the response degrades.
        let mut worker = Scripted::new(&[0.1]);
        let ctx = test_context(Instant::now() + Duration::from_secs(5));

        let response = runtime().drive(&mut worker, message(), &ctx).unwrap();
        assert_eq!(worker.process_calls, 4);
        assert_eq!(response.status, ResponseStatus::Degraded);
        assert!(response.error.as_deref().unwrap().contains("below threshold"));
    }

    #[test]
    fn test_give_up_short_circuits() {
        struct GiveUp(Scripted);
        impl Worker for GiveUp {
            fn kind(&self) -> WorkerKind {
                WorkerKind::AnomalyDetector
            }
            fn process(
                &mut self,
                msg: &WorkerMessage,
                ctx: &WorkerContext,
            ) -> Result<WorkerResponse, ErrorKind> {
                self.0.process(msg, ctx)
            }
            fn reflect(
                &mut self,
                _response: &WorkerResponse,
                _msg: &WorkerMessage,
                _ctx: &WorkerContext,
            ) -> crate::prelude::Fallible<Reflection> {
                Ok(Reflection {
                    quality_score: 0.1,
                    improvement_hint: None,
                })
            }
        }

        let mut worker = GiveUp(Scripted::new(&[0.1]));
        let ctx = test_context(Instant::now() + Duration::from_secs(5));

        let response = runtime().drive(&mut worker, message(), &ctx).unwrap();
        assert_eq!(worker.0.process_calls, 1);
        assert_eq!(response.status, ResponseStatus::Degraded);
    }

    #[test]
    fn test_process_panic_is_retried() {
        let mut worker = Scripted::new(&[0.9]);
        worker.panic_first = true;
        let ctx = test_context(Instant::now() + Duration::from_secs(5));

        let response = runtime().drive(&mut worker, message(), &ctx).unwrap();
        assert_eq!(response.status, ResponseStatus::Ok);
        // One panicking call plus the successful retry.
        assert_eq!(worker.process_calls, 2);
    }

    #[test]
    fn test_cancellation_propagates() {
        let mut worker = Scripted::new(&[0.9]);
        let ctx = test_context(Instant::now() + Duration::from_secs(5));
        ctx.cancel.cancel();

        let err = runtime().drive(&mut worker, message(), &ctx).unwrap_err();
        assert_eq!(err, ErrorKind::Cancelled);
        assert_eq!(worker.process_calls, 0);
    }
}

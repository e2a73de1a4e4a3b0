pub mod builder;

use crate::backend::{Admission, Backend};
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use builder::RateLimiterBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::fmt::Display;
use std::{future::Future, rc::Rc};

type AllowedTransformation<BO> = dyn Fn(&mut HeaderMap, Option<&BO>, bool);
type DeniedResponse<BO> = dyn Fn(&BO) -> HttpResponse;
type DeniedHeaders<BO> = dyn Fn(&mut HeaderMap, &BO);
type RollbackCondition = dyn Fn(StatusCode) -> bool;

/// Everything the middleware does around the admission check, shared by all workers' copies.
struct Hooks<BO> {
    fail_open: bool,
    allowed_transformation: Option<Box<AllowedTransformation<BO>>>,
    denied_response: Box<DeniedResponse<BO>>,
    denied_headers: Option<Box<DeniedHeaders<BO>>>,
    rollback_condition: Option<Box<RollbackCondition>>,
}

impl<BO> Hooks<BO> {
    fn rejection(&self, output: &BO) -> HttpResponse {
        let mut response = (self.denied_response)(output);
        if let Some(headers) = &self.denied_headers {
            headers(response.headers_mut(), output);
        }
        response
    }
}

/// Rate limit middleware.
///
/// Each request is first checked for admission by the backend. A rejected request is answered
/// with the denied response and never reaches the wrapped service; an admitted one is passed on
/// and may be rolled back out of the client's quota once its response status is known.
pub struct RateLimiter<BA, BO, F> {
    backend: BA,
    input_fn: Rc<F>,
    hooks: Rc<Hooks<BO>>,
}

impl<BA: Clone, BO, F> Clone for RateLimiter<BA, BO, F> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            input_fn: Rc::clone(&self.input_fn),
            hooks: Rc::clone(&self.hooks),
        }
    }
}

impl<BA, BI, BO, F, O> RateLimiter<BA, BO, F>
where
    BA: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    BO: 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    /// # Arguments
    ///
    /// * `backend`: A rate limiting algorithm and store implementation.
    /// * `input_fn`: A future that produces input to the backend based on the incoming request.
    pub fn builder(backend: BA, input_fn: F) -> RateLimiterBuilder<BA, BO, F> {
        RateLimiterBuilder::new(backend, input_fn)
    }
}

impl<S, B, BA, BI, BO, BE, F, O> Transform<S, ServiceRequest> for RateLimiter<BA, BO, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<BI, Output = BO, Error = BE> + 'static,
    BI: 'static,
    BO: 'static,
    BE: Into<actix_web::Error> + Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<S, BA, BO, F>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(service),
            limiter: self.clone(),
        })
    }
}

pub struct RateLimiterMiddleware<S, BA, BO, F> {
    service: Rc<S>,
    limiter: RateLimiter<BA, BO, F>,
}

/// A request that got past the admission check.
///
/// Both fields are `None` when the backend failed and the limiter is failing open.
struct Admitted<BO, T> {
    output: Option<BO>,
    rollback: Option<T>,
}

/// Runs `req` through the admission check.
///
/// `Err` holds the response that answers the request in place of the wrapped service: the
/// rejection, or the error of the input function or of a backend failing closed.
async fn check_admission<BA, BI, BO, BE, F, O>(
    req: &ServiceRequest,
    input_fn: &F,
    backend: &BA,
    hooks: &Hooks<BO>,
) -> Result<Admitted<BO, BA::RollbackToken>, HttpResponse>
where
    BA: Backend<BI, Output = BO, Error = BE>,
    BI: 'static,
    BE: Into<actix_web::Error> + Display,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    let input = input_fn(req).await.map_err(|e| {
        log::error!("Rate limiter input function failed: {e}");
        e.error_response()
    })?;

    match backend.request(input).await {
        Ok(Admission::Admit { output, rollback }) => Ok(Admitted {
            output: Some(output),
            rollback: Some(rollback),
        }),
        Ok(Admission::Reject { output }) => {
            log::debug!(
                "Quota exhausted for {}, rejecting {} {}",
                req.connection_info().realip_remote_addr().unwrap_or("unknown client"),
                req.method(),
                req.path()
            );
            Err(hooks.rejection(&output))
        }
        Err(e) if hooks.fail_open => {
            log::warn!("Rate limiter failed: {e}, admitting the request anyway");
            Ok(Admitted {
                output: None,
                rollback: None,
            })
        }
        Err(e) => {
            log::error!("Rate limiter failed: {e}");
            Err(Into::<actix_web::Error>::into(e).error_response())
        }
    }
}

/// Takes an admitted request back out of the quota if its response matches the rollback
/// condition. Returns whether it was rolled back.
async fn settle<BA, BI, BO>(
    backend: &BA,
    hooks: &Hooks<BO>,
    status: StatusCode,
    token: BA::RollbackToken,
) -> bool
where
    BA: Backend<BI>,
    BI: 'static,
    BA::Error: Display,
{
    match &hooks.rollback_condition {
        Some(condition) if condition(status) => match backend.rollback(token).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Unable to rollback admission for response: {status:?}, error: {e}");
                false
            }
        },
        _ => false,
    }
}

impl<S, B, BA, BI, BO, BE, F, O> Service<ServiceRequest> for RateLimiterMiddleware<S, BA, BO, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<BI, Output = BO, Error = BE> + 'static,
    BI: 'static,
    BO: 'static,
    BE: Into<actix_web::Error> + Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let RateLimiter {
            backend,
            input_fn,
            hooks,
        } = self.limiter.clone();

        Box::pin(async move {
            let admission =
                check_admission::<_, BI, _, _, _, _>(&req, &*input_fn, &backend, &*hooks);
            let admitted = match admission.await {
                Ok(admitted) => admitted,
                Err(response) => return Ok(req.into_response(response).map_into_right_body()),
            };

            let mut response = service.call(req).await?;

            let rolled_back = match admitted.rollback {
                Some(token) => {
                    settle::<_, BI, _>(&backend, &*hooks, response.status(), token).await
                }
                None => false,
            };
            if let Some(transformation) = &hooks.allowed_transformation {
                transformation(response.headers_mut(), admitted.output.as_ref(), rolled_back);
            }

            Ok(response.map_into_left_body())
        })
    }
}

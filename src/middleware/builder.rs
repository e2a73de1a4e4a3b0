use crate::backend::Backend;
use crate::middleware::{AllowedTransformation, Hooks, RateLimiter, RollbackCondition};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

/// Configures what a [RateLimiter] does around its admission check.
///
/// The denied body and the denied headers are kept apart and combined per rejection, so the
/// setters below can be called in any order.
pub struct RateLimiterBuilder<BA, BO, F> {
    backend: BA,
    input_fn: F,
    hooks: Hooks<BO>,
}

impl<BA, BI, BO, F, O> RateLimiterBuilder<BA, BO, F>
where
    BA: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    BO: 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    pub(super) fn new(backend: BA, input_fn: F) -> Self {
        Self {
            backend,
            input_fn,
            hooks: Hooks {
                fail_open: false,
                allowed_transformation: None,
                denied_response: Box::new(|_| HttpResponse::TooManyRequests().finish()),
                denied_headers: None,
                rollback_condition: None,
            },
        }
    }

    /// Admit requests while the backend is failing, instead of answering with its error.
    ///
    /// Off by default.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.hooks.fail_open = fail_open;
        self
    }

    /// Reports the state of the client's window in every response:
    ///
    /// - `x-ratelimit-limit`: requests allowed per window
    /// - `x-ratelimit-remaining`: requests still allowed right now
    /// - `x-ratelimit-reset`: seconds until the oldest logged request leaves the window
    /// - `retry-after`: same as the reset, on rejections only
    ///
    /// Replaces any [RateLimiterBuilder::request_allowed_transformation]. The headers are added
    /// on top of whichever denied response is configured.
    pub fn add_headers(mut self) -> Self
    where
        BO: HeaderCompatibleOutput,
    {
        self.hooks.allowed_transformation = Some(Box::new(
            |map: &mut HeaderMap, output: Option<&BO>, rolled_back: bool| {
                if let Some(output) = output {
                    // The rolled back request no longer occupies a slot
                    let remaining = if rolled_back {
                        output.remaining().saturating_add(1).min(output.limit())
                    } else {
                        output.remaining()
                    };
                    insert_window_headers(map, output, remaining);
                }
            },
        ));
        self.hooks.denied_headers = Some(Box::new(|map: &mut HeaderMap, output: &BO| {
            let wait = insert_window_headers(map, output, output.remaining());
            map.insert(RETRY_AFTER, HeaderValue::from(wait));
        }));
        self
    }

    /// Rejects with status 429 and a JSON body stating the quota, e.g.
    ///
    /// `{"detail": "Rate limit exceeded. Max 100 requests per 60 seconds."}`
    pub fn quota_exceeded_detail(self) -> Self
    where
        BO: QuotaOutput,
    {
        self.request_denied_response(|output: &BO| {
            HttpResponse::TooManyRequests().json(serde_json::json!({
                "detail": quota_exceeded_message(output.max_calls(), output.period()),
            }))
        })
    }

    /// Edits the headers of an admitted request's response.
    ///
    /// The last argument is true if the request was rolled back afterwards. The output is [None]
    /// when the backend failed and [RateLimiterBuilder::fail_open] let the request through.
    pub fn request_allowed_transformation<M>(mut self, transformation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&BO>, bool) + 'static,
    {
        self.hooks.allowed_transformation =
            transformation.map(|m| Box::new(m) as Box<AllowedTransformation<BO>>);
        self
    }

    /// Builds the response for a rejected request. Defaults to an empty 429.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&BO) -> HttpResponse + 'static,
    {
        self.hooks.denied_response = Box::new(denied_response);
        self
    }

    /// Takes an admitted request back out of the window when its response status matches.
    ///
    /// No condition is set by default.
    pub fn rollback_condition<C>(mut self, condition: Option<C>) -> Self
    where
        C: Fn(StatusCode) -> bool + 'static,
    {
        self.hooks.rollback_condition = condition.map(|c| Box::new(c) as Box<RollbackCondition>);
        self
    }

    /// Server errors (5xx) do not count against the client.
    pub fn rollback_server_errors(self) -> Self {
        self.rollback_condition(Some(|status: StatusCode| status.is_server_error()))
    }

    pub fn build(self) -> RateLimiter<BA, BO, F> {
        RateLimiter {
            backend: self.backend,
            input_fn: Rc::new(self.input_fn),
            hooks: Rc::new(self.hooks),
        }
    }
}

/// Writes the three `x-ratelimit-*` headers, returning the seconds until reset.
fn insert_window_headers<BO: HeaderCompatibleOutput>(
    map: &mut HeaderMap,
    output: &BO,
    remaining: u64,
) -> u64 {
    let reset = output.seconds_until_reset();
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(output.limit()));
    map.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(remaining));
    map.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(reset));
    reset
}

/// Backend output that can be reported through [RateLimiterBuilder::add_headers].
pub trait HeaderCompatibleOutput {
    fn limit(&self) -> u64;

    fn remaining(&self) -> u64;

    /// Seconds from now until another request would be admitted, 0 if one would be already.
    fn seconds_until_reset(&self) -> u64;
}

/// Backend output that knows its quota, needed by [RateLimiterBuilder::quota_exceeded_detail].
pub trait QuotaOutput {
    fn max_calls(&self) -> u64;

    fn period(&self) -> Duration;
}

fn quota_exceeded_message(max_calls: u64, period: Duration) -> String {
    let seconds = if period.subsec_nanos() == 0 {
        period.as_secs().to_string()
    } else {
        period.as_secs_f64().to_string()
    };
    format!("Rate limit exceeded. Max {max_calls} requests per {seconds} seconds.")
}

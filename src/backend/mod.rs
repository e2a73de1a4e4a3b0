mod input_builder;

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod memory;

pub use input_builder::{SimpleInputFunctionBuilder, SimpleInputFuture};
use std::future::Future;

use crate::{HeaderCompatibleOutput, QuotaOutput};
use actix_web::rt::time::Instant;
use std::time::Duration;

/// Outcome of an admission check.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Admit,
    Reject,
}

impl Decision {
    pub fn from_admitted(admitted: bool) -> Self {
        if admitted {
            Self::Admit
        } else {
            Self::Reject
        }
    }

    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admit)
    }

    pub fn is_rejected(self) -> bool {
        matches!(self, Self::Reject)
    }
}

/// Result of running one request through a [Backend].
///
/// Only an admitted request has been counted, so only it carries a rollback token.
#[derive(Debug, Clone)]
pub enum Admission<O, T> {
    Admit { output: O, rollback: T },
    Reject { output: O },
}

impl<O, T> Admission<O, T> {
    pub fn decision(&self) -> Decision {
        match self {
            Self::Admit { .. } => Decision::Admit,
            Self::Reject { .. } => Decision::Reject,
        }
    }

    pub fn output(&self) -> &O {
        match self {
            Self::Admit { output, .. } | Self::Reject { output } => output,
        }
    }

    /// Splits into the decision, the output and the rollback token of an admitted request.
    pub fn into_parts(self) -> (Decision, O, Option<T>) {
        match self {
            Self::Admit { output, rollback } => (Decision::Admit, output, Some(rollback)),
            Self::Reject { output } => (Decision::Reject, output, None),
        }
    }
}

/// Describes an implementation of a rate limiting store and algorithm.
///
/// A Backend is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc) so that every worker shares the same request logs.
pub trait Backend<I: 'static = SimpleInput>: Clone {
    type Output;
    type RollbackToken;
    type Error;

    /// Run the admission check for an incoming request.
    ///
    /// The output can be used to transform the admitted and rejected responses.
    fn request(
        &self,
        input: I,
    ) -> impl Future<Output = Result<Admission<Self::Output, Self::RollbackToken>, Self::Error>>;

    /// Undo an admission after the response is known.
    ///
    /// E.g. We may want to exclude 5xx errors from counting against a client's quota,
    /// we can only exclude them after having already admitted the request through the rate limiter
    /// in the first place, so we must therefore remove it from the log afterwards.
    ///
    /// Note that if this function fails there is not much the [RateLimiter](crate::RateLimiter)
    /// can do about it, given that the request has already been admitted.
    ///
    /// # Arguments
    ///
    /// * `token`: The token returned from the initial call to [Backend::request()].
    fn rollback(&self, token: Self::RollbackToken)
        -> impl Future<Output = Result<(), Self::Error>>;
}

/// A default [Backend] Input structure.
///
/// The quota itself belongs to the backend, so the input only identifies the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleInput {
    /// The rate limit key to be used for this request.
    pub key: String,
}

/// A default [Backend::Output] structure.
#[derive(Debug, Clone)]
pub struct SimpleOutput {
    /// Total number of requests that are permitted within the sliding window.
    pub limit: u64,
    /// Number of requests that would still be admitted right now.
    pub remaining: u64,
    /// Time at which the oldest logged request leaves the window, freeing a slot.
    pub reset: Instant,
    /// Length of the sliding window.
    pub period: Duration,
}

/// Additional functions for a [Backend] that uses [SimpleInput] and [SimpleOutput].
pub trait SimpleBackend: Backend<SimpleInput, Output = SimpleOutput> {
    /// Removes the request log for a given rate limit key.
    fn remove_key(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>>;
}

impl HeaderCompatibleOutput for SimpleOutput {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Seconds until a slot frees up (rounded upwards, so that a retry after waiting for the
    /// duration is guaranteed to find room).
    fn seconds_until_reset(&self) -> u64 {
        let millis = self
            .reset
            .saturating_duration_since(Instant::now())
            .as_millis() as f64;
        (millis / 1000f64).ceil() as u64
    }
}

impl QuotaOutput for SimpleOutput {
    fn max_calls(&self) -> u64 {
        self.limit
    }

    fn period(&self) -> Duration {
        self.period
    }
}

#![cfg_attr(docsrs, feature(doc_cfg))]
//! Sliding window rate limiting middleware for actix-web.
//!
//! A [RateLimiter] asks a [Backend](backend::Backend) whether each incoming request should be
//! admitted. The bundled in-memory backend keeps, per client key, the times of the requests it
//! admitted during the last [Policy::period()] and rejects a request once
//! [Policy::max_calls()] of them are still inside the window.
//!
//! ```no_run
//! # #[cfg(feature = "dashmap")]
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use actix_sliding_window_limit::backend::memory::InMemoryBackend;
//! use actix_sliding_window_limit::backend::SimpleInputFunctionBuilder;
//! use actix_sliding_window_limit::{Policy, RateLimiter};
//!
//! let backend = InMemoryBackend::builder(Policy::from_env()?).build()?;
//! let input = SimpleInputFunctionBuilder::new().peer_ip_key().build();
//! let limiter = RateLimiter::builder(backend, input)
//!     .quota_exceeded_detail()
//!     .add_headers()
//!     .build();
//! # let _ = limiter;
//! # Ok(())
//! # }
//! ```

pub mod backend;
mod middleware;
pub mod policy;

pub use middleware::builder::{HeaderCompatibleOutput, QuotaOutput, RateLimiterBuilder};
pub use middleware::RateLimiter;
pub use policy::Policy;

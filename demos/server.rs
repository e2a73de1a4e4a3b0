//! Serves `/` and `/health` behind a per-address sliding window limit.
//!
//! ```text
//! RATE_LIMIT_CALLS=5 RATE_LIMIT_PERIOD=10 RUST_LOG=debug cargo run --example server
//! ```

use actix_sliding_window_limit::backend::memory::InMemoryBackend;
use actix_sliding_window_limit::backend::SimpleInputFunctionBuilder;
use actix_sliding_window_limit::{Policy, RateLimiter};
use actix_web::{get, App, HttpResponse, HttpServer, Responder};

#[get("/")]
async fn root() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "message": "Task Management API",
        "version": "1.0.0",
    }))
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "healthy" }))
}

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let policy = Policy::from_env()?;
    log::info!(
        "Admitting {} requests per {:?} per client",
        policy.max_calls(),
        policy.period()
    );

    // One backend for every worker, dropped (stopping its GC) when the server exits
    let backend = InMemoryBackend::builder(policy).build()?;

    HttpServer::new(move || {
        let input = SimpleInputFunctionBuilder::new().peer_ip_key().build();
        let limiter = RateLimiter::builder(backend.clone(), input)
            .quota_exceeded_detail()
            .add_headers()
            .build();
        App::new().service(root).service(health).wrap(limiter)
    })
    .bind(("127.0.0.1", 8080))?
    .run()
    .await?;
    Ok(())
}

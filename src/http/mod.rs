//! HTTP surface of the rate limit service.

mod server;
mod service;

pub use server::HttpServer;
pub use service::{router, AppState, CheckResponse, RateLimitCheckRequest, RouteCheckRequest};

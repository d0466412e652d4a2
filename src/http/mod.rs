//! HTTP integration: the request gate and the admission service.

mod gate;
mod server;
mod service;

pub use gate::{
    apply_headers, CallerContext, Gate, Principal, RateLimitLayer, RateLimitService, Rejection,
    HEADER_FORWARDED_FOR, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
};
pub use server::HttpServer;
pub use service::{principal_from_headers, HEADER_PRINCIPAL_ADMIN, HEADER_PRINCIPAL_ID};
